//! layered configuration: built in defaults, then an optional TOML file,
//! then `MAYOCHE_` environment variables. nested keys are separated with
//! `__`, eg: `MAYOCHE_DOMAIN__HOSTED_ZONE_ID=Z123`.

use std::collections::HashMap;
use std::path::Path;

use aws_cfn_stack::Region;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::variant::{Features, Variant};

pub const DEFAULT_CONFIG_FILE: &str = "mayoche.toml";
pub const ENV_PREFIX: &str = "MAYOCHE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackConfig {
    pub stack_name: String,
    /// where the whole stack lives. the certificate attached to the
    /// distribution is declared in this stack, so this has to be us-east-1.
    pub region: Region,
    pub features: Features,
    pub domain: DomainConfig,
    pub frontend: FrontendConfig,
    pub scraper: ScraperConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainConfig {
    /// the public name of the site, eg: `new.mayoche.info`.
    pub hostname: String,
    /// the existing route53 zone the hostname lives in.
    pub zone_name: String,
    /// id of `zone_name`, without the `/hostedzone/` prefix. no default:
    /// the zone is never looked up.
    pub hosted_zone_id: String,
    pub record_ttl_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontendConfig {
    pub bucket_name: String,
    /// the built frontend bundle that `upload-assets` walks.
    pub dist_dir: String,
    /// served for `/` and for every path the bucket does not have.
    pub entry_document: String,
    /// allowed to read the data bucket in addition to `https://{hostname}`.
    pub local_dev_origin: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScraperConfig {
    pub data_bucket_name: String,
    pub image_uri: String,
    pub schedule: String,
    pub memory_size: u32,
    pub timeout: u32,
    pub reserved_concurrency: u32,
    /// cloudfront route to the data bucket.
    pub data_path_pattern: String,
    pub data_ttl_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    pub api_name: String,
    pub model_name: String,
    pub table_name: String,
    pub stage_name: String,
    pub burst_limit: u32,
    pub rate_limit: f64,
    pub cors_allow_origins: Vec<String>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            stack_name: "MayocheFrontendStack".to_string(),
            region: Region::default(),
            features: Features::default(),
            domain: DomainConfig {
                hostname: "new.mayoche.info".to_string(),
                zone_name: "mayoche.info".to_string(),
                hosted_zone_id: String::new(),
                record_ttl_secs: 1800,
            },
            frontend: FrontendConfig {
                bucket_name: "frontend".to_string(),
                dist_dir: "dist".to_string(),
                entry_document: "index.html".to_string(),
                local_dev_origin: "http://localhost:5173".to_string(),
            },
            scraper: ScraperConfig {
                data_bucket_name: "data".to_string(),
                image_uri: String::new(),
                schedule: "cron(0 3 * * ? *)".to_string(),
                memory_size: 256,
                timeout: 300,
                reserved_concurrency: 1,
                data_path_pattern: "data/*.json".to_string(),
                data_ttl_secs: 60,
            },
            api: ApiConfig {
                api_name: "mayoche-data-api".to_string(),
                model_name: "choice".to_string(),
                table_name: "choice".to_string(),
                stage_name: "prod".to_string(),
                burst_limit: 100,
                rate_limit: 200.0,
                cors_allow_origins: vec!["*".to_string()],
            },
        }
    }
}

impl StackConfig {
    /// defaults, then `path` if it exists, then the process environment.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_from(path, None)
    }

    /// like `load` but reads the environment from `env` when given.
    pub fn load_from(path: &Path, env: Option<HashMap<String, String>>) -> Result<Self> {
        let defaults = Config::try_from(&StackConfig::default())?;
        let file = File::from(path).format(FileFormat::Toml).required(false);
        let environment = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("api.cors_allow_origins")
            .source(env);
        let config: StackConfig = Config::builder()
            .add_source(defaults)
            .add_source(file)
            .add_source(environment)
            .build()?
            .try_deserialize()?;
        tracing::debug!(path = %path.display(), stack = %config.stack_name, "loaded configuration");
        Ok(config)
    }

    pub fn with_variant(mut self, variant: Option<Variant>) -> Self {
        if let Some(variant) = variant {
            self.features = variant.features();
        }
        self
    }

    pub fn data_origins(&self) -> Vec<String> {
        vec![format!("https://{}", self.domain.hostname), self.frontend.local_dev_origin.clone()]
    }

    /// cross field checks the individual modules cannot make on their own.
    pub fn validate(&self) -> Result<()> {
        if !self.region.can_host_cloudfront_certificates() {
            return Err(Error::Config(format!(
                "region is {} but the certificate for {} must be created in {}",
                self.region, self.domain.hostname, aws_cfn_stack::regions::CLOUDFRONT_CERTIFICATE_REGION,
            )));
        }
        if self.domain.hosted_zone_id.is_empty() {
            return Err(Error::Config(format!(
                "domain.hosted_zone_id is missing. Set it to the id of the {} hosted zone",
                self.domain.zone_name,
            )));
        }
        let zone = self.domain.zone_name.trim_end_matches('.');
        if self.domain.hostname != zone && !self.domain.hostname.ends_with(&format!(".{zone}")) {
            return Err(Error::Config(format!(
                "domain.hostname {} is not inside the zone {}", self.domain.hostname, zone,
            )));
        }
        if self.frontend.entry_document.is_empty() || self.frontend.entry_document.contains('/') {
            return Err(Error::Config(format!(
                "frontend.entry_document {:?} must be a file name at the root of the bucket",
                self.frontend.entry_document,
            )));
        }
        if self.features.scraper {
            if self.scraper.image_uri.is_empty() {
                return Err(Error::Config("scraper.image_uri is required when the scraper is enabled".to_string()));
            }
            let site = aws_cfn_stack::logical_name("Bucket", &self.frontend.bucket_name)?;
            let data = aws_cfn_stack::logical_name("Bucket", &self.scraper.data_bucket_name)?;
            if site == data {
                return Err(Error::Config(format!(
                    "scraper.data_bucket_name {:?} and frontend.bucket_name {:?} both become {site}",
                    self.scraper.data_bucket_name, self.frontend.bucket_name,
                )));
            }
        }
        if self.features.api && self.api.cors_allow_origins.is_empty() {
            return Err(Error::Config("api.cors_allow_origins must list at least 1 origin".to_string()));
        }
        Ok(())
    }
}
