use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mayoche::{assets, config::DEFAULT_CONFIG_FILE, telemetry, StackConfig, Variant};
use tracing::info;

#[derive(Parser)]
#[command(name = "mayoche")]
#[command(about = "Declare, deploy and publish the mayoche site", long_about = None)]
struct Cli {
    /// TOML file layered over the defaults. missing is fine
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print or write the cloudformation template
    Synth {
        /// Overrides the `features` section of the config
        #[arg(long, value_enum)]
        variant: Option<Variant>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// List resources in the order cloudformation will create them
    Plan {
        #[arg(long, value_enum)]
        variant: Option<Variant>,
    },
    /// Create or update the stack and wait for it to settle
    Deploy {
        #[arg(long, value_enum)]
        variant: Option<Variant>,
    },
    /// Upload the built frontend into the deployed site bucket, delete
    /// objects the build no longer produces and invalidate the distribution
    UploadAssets {
        /// Directory to upload. Defaults to `frontend.dist_dir`
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Only print what would be uploaded
        #[arg(long)]
        dry_run: bool,
        /// Keep objects that are not part of this upload
        #[arg(long)]
        no_prune: bool,
        /// Skip the `/*` invalidation
        #[arg(long)]
        no_invalidate: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_telemetry();
    let cli = Cli::parse();
    let config = StackConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Synth { variant, out } => synth(config.with_variant(variant), out),
        Commands::Plan { variant } => plan(config.with_variant(variant)),
        Commands::Deploy { variant } => deploy(config.with_variant(variant)).await,
        Commands::UploadAssets { dir, dry_run, no_prune, no_invalidate } => {
            let options = assets::PublishOptions { prune: !no_prune, invalidate: !no_invalidate };
            upload_assets(config, dir, dry_run, options).await
        }
    }
}

fn synth(config: StackConfig, out: Option<PathBuf>) -> Result<()> {
    let stack = mayoche::synth(&config)?;
    let json = stack.to_json_pretty()?;
    match out {
        Some(path) => {
            std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
            info!(stack = %stack.name, path = %path.display(), "wrote template");
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn plan(config: StackConfig) -> Result<()> {
    let stack = mayoche::synth(&config)?;
    for (i, logical_id) in mayoche::plan(&stack)?.iter().enumerate() {
        let ty = stack.resource(logical_id).map(|r| r.ty.as_str()).unwrap_or_default();
        println!("{:>3}  {logical_id}  {ty}", i + 1);
    }
    Ok(())
}

async fn deploy(config: StackConfig) -> Result<()> {
    let stack = mayoche::synth(&config)?;
    let sdk_config = aws_cfn_stack::deploy::load_sdk_config(&config.region).await;
    let client = aws_sdk_cloudformation::Client::new(&sdk_config);
    let outputs = aws_cfn_stack::deploy::deploy(&client, &stack).await
        .with_context(|| format!("deploying {}", stack.name))?;
    let mut outputs: Vec<_> = outputs.into_iter().collect();
    outputs.sort();
    for (key, value) in outputs {
        println!("{key} = {value}");
    }
    Ok(())
}

async fn upload_assets(config: StackConfig, dir: Option<PathBuf>, dry_run: bool, options: assets::PublishOptions) -> Result<()> {
    let dir = dir.unwrap_or_else(|| PathBuf::from(&config.frontend.dist_dir));
    let uploads = assets::plan_uploads(&dir, &config.frontend.entry_document)?;
    if dry_run {
        for upload in uploads.iter() {
            println!("{}  {}  {}", upload.key, upload.content_type, upload.cache_class.cache_control());
        }
        return Ok(());
    }
    let sdk_config = aws_cfn_stack::deploy::load_sdk_config(&config.region).await;
    let cfn = aws_sdk_cloudformation::Client::new(&sdk_config);
    let stack_name = aws_cfn_stack::validate_stack_name(mayoche::stack::DEFAULT_STACK_NAME, &config.stack_name)?;
    let target = assets::publish_target(&cfn, &stack_name).await?;
    let bucket = target.bucket.clone();
    let sink = assets::S3Sink::new(
        aws_sdk_s3::Client::new(&sdk_config),
        aws_sdk_cloudfront::Client::new(&sdk_config),
        target,
    );
    let report = assets::publish(&sink, &uploads, options).await
        .with_context(|| format!("publishing {} to {bucket}", dir.display()))?;
    println!("uploaded {} and deleted {} objects in {bucket}", report.uploaded, report.deleted);
    if report.invalidated {
        println!("invalidated {}", assets::INVALIDATE_ALL);
    }
    Ok(())
}
