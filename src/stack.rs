//! wires the level2 modules into the one mayoche stack. modules are
//! declared in a readable order only; what cloudformation creates first
//! is decided by the references between them.

use std::collections::BTreeMap;

use aws_cfn_stack::{get_att, get_ref, graph, SynthesizedStack};
use aws_cloudfront_distribution::{BehaviorInput, CachePolicyChoice, AllowedMethods, S3OriginInput};
use tracing::{info, warn};

use crate::config::StackConfig;
use crate::error::Result;

/// used when the configuration leaves `stack_name` empty.
pub const DEFAULT_STACK_NAME: &str = "MayocheFrontendStack";

pub const FRONTEND_BUCKET_OUTPUT: &str = "FrontendBucketName";
pub const DATA_BUCKET_OUTPUT: &str = "DataBucketName";
pub const DISTRIBUTION_DOMAIN_OUTPUT: &str = "DistributionDomainName";
pub const DISTRIBUTION_ID_OUTPUT: &str = "DistributionId";
pub const SITE_URL_OUTPUT: &str = "SiteUrl";

const DATA_CACHE_POLICY: &str = "DataCache";

pub fn build_stack(config: &StackConfig) -> Result<aws_cfn_stack::Input> {
    config.validate()?;
    let mut stack = aws_cfn_stack::Input {
        stack_name: aws_cfn_stack::validate_stack_name(DEFAULT_STACK_NAME, &config.stack_name)?,
        description: format!("mayoche site at {}", config.domain.hostname),
        ..Default::default()
    };

    let site = aws_s3::config(&aws_s3::Input {
        name: config.frontend.bucket_name.clone(),
        ..Default::default()
    }, &mut stack)?;
    stack.add_output(FRONTEND_BUCKET_OUTPUT, "bucket holding the frontend bundle", get_ref(&site.logical_bucket_name));

    let cert = aws_acm_cert::config(&aws_acm_cert::Input {
        domain_name: config.domain.hostname.clone(),
        hosted_zone_id: config.domain.hosted_zone_id.clone(),
        ..Default::default()
    }, &mut stack)?;

    let mut behaviors = vec![];
    if config.features.scraper {
        let data = aws_s3::config(&aws_s3::Input {
            name: config.scraper.data_bucket_name.clone(),
            cors_rules: vec![aws_s3::CorsRule::get_from(
                &config.data_origins().iter().map(String::as_str).collect::<Vec<_>>(),
            )],
            ..Default::default()
        }, &mut stack)?;
        stack.add_output(DATA_BUCKET_OUTPUT, "bucket the scraper writes into", get_ref(&data.logical_bucket_name));

        behaviors.push(BehaviorInput {
            path_pattern: config.scraper.data_path_pattern.clone(),
            origin: S3OriginInput { logical_bucket_name: data.logical_bucket_name.clone() },
            cache: CachePolicyChoice::FixedTtl {
                name: DATA_CACHE_POLICY.to_string(),
                ttl_secs: config.scraper.data_ttl_secs,
            },
            allowed_methods: AllowedMethods::All,
        });

        let environment = BTreeMap::from([("BUCKET_NAME".to_string(), get_ref(&data.logical_bucket_name).into())]);
        let scraper = aws_lambda::config(&aws_lambda::Input {
            name: "scraper".to_string(),
            image_uri: config.scraper.image_uri.clone(),
            memory_size: config.scraper.memory_size,
            timeout: config.scraper.timeout,
            reserved_concurrency: Some(config.scraper.reserved_concurrency),
            environment,
            extra_policy_statements: aws_s3::write_policy_statements(&data.logical_bucket_name),
            schedule: Some(config.scraper.schedule.parse()?),
            ..Default::default()
        }, &mut stack)?;
        warn!(
            function = %scraper.logical_function_name,
            "scraper failures are not retried and nothing alerts on them",
        );
    }

    let distribution = aws_cloudfront_distribution::config(&aws_cloudfront_distribution::Input {
        name: "site".to_string(),
        default_origin: S3OriginInput { logical_bucket_name: site.logical_bucket_name.clone() },
        behaviors,
        error_responses: aws_cloudfront_distribution::spa_error_responses(&format!("/{}", config.frontend.entry_document)),
        default_root_object: Some(config.frontend.entry_document.clone()),
        aliases: vec![config.domain.hostname.clone()],
        certificate: Some(get_ref(&cert.logical_cert_name).into()),
        ..Default::default()
    }, &mut stack)?;
    let distribution_domain = get_att(&distribution.logical_distribution_name, "DomainName");
    stack.add_output(DISTRIBUTION_DOMAIN_OUTPUT, "domain name of the distribution", distribution_domain.clone());
    stack.add_output(DISTRIBUTION_ID_OUTPUT, "id of the distribution, invalidated after each upload", get_ref(&distribution.logical_distribution_name));

    aws_route53::config(&aws_route53::Input {
        record_name: config.domain.hostname.clone(),
        hosted_zone_id: config.domain.hosted_zone_id.clone(),
        target: distribution_domain.into(),
        ttl_secs: config.domain.record_ttl_secs,
        ..Default::default()
    }, &mut stack)?;
    stack.add_output(SITE_URL_OUTPUT, "public url of the site", serde_json::Value::String(format!("https://{}", config.domain.hostname)));

    if config.features.api {
        let table = aws_dynamodb::config(&aws_dynamodb::Input {
            table_name: config.api.table_name.clone(),
            ..Default::default()
        }, &mut stack)?;
        aws_apigateway::config(&aws_apigateway::Input {
            api_name: config.api.api_name.clone(),
            model_name: config.api.model_name.clone(),
            table,
            throttle: aws_apigateway::Throttle {
                burst_limit: config.api.burst_limit,
                rate_limit: config.api.rate_limit,
            },
            cors_allow_origins: config.api.cors_allow_origins.clone(),
            stage_name: config.api.stage_name.clone(),
        }, &mut stack)?;
    }

    info!(
        stack = %config.stack_name,
        scraper = config.features.scraper,
        api = config.features.api,
        resources = stack.resources.len(),
        "declared stack",
    );
    Ok(stack)
}

pub fn synth(config: &StackConfig) -> Result<SynthesizedStack> {
    let input = build_stack(config)?;
    Ok(aws_cfn_stack::synthesize(input, DEFAULT_STACK_NAME)?)
}

/// the order cloudformation will create the resources in.
pub fn plan(stack: &SynthesizedStack) -> Result<Vec<String>> {
    Ok(graph::creation_order(&stack.template)?)
}
