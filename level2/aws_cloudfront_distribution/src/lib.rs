use std::collections::BTreeMap;

use aws_cfn_stack::{get_att, get_ref, logical_name, sub, CfnResource, Error, Resource, StrVal};
use serde::Serialize;
use serde_json::{json, Value};

/// caching optimized:
/// https://docs.aws.amazon.com/AmazonCloudFront/latest/DeveloperGuide/using-managed-cache-policies.html#managed-cache-caching-optimized
pub const CACHING_OPTIMIZED_POLICY_ID: &str = "658327ea-f89d-4fab-a63d-7e88639e58f6";

/// cloudfront caps every TTL at one year.
pub const MAX_TTL_SECS: u64 = 31_536_000;

/// cache policies are named `{stack name}-{policy name}`.
pub const MAX_CACHE_POLICY_NAME_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CachePolicyChoice {
    #[default]
    CachingOptimized,
    /// a custom policy whose min, max and default TTL are all `ttl_secs`.
    /// behaviors that use the same `name` share one policy.
    FixedTtl { name: String, ttl_secs: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllowedMethods {
    #[default]
    GetHead,
    GetHeadOptions,
    All,
}

impl AllowedMethods {
    pub fn methods(&self) -> &'static [&'static str] {
        match self {
            AllowedMethods::GetHead => &["GET", "HEAD"],
            AllowedMethods::GetHeadOptions => &["GET", "HEAD", "OPTIONS"],
            AllowedMethods::All => &["GET", "HEAD", "OPTIONS", "PUT", "PATCH", "POST", "DELETE"],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewerProtocolPolicy {
    AllowAll,
    #[default]
    RedirectToHttps,
    HttpsOnly,
}

impl ViewerProtocolPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewerProtocolPolicy::AllowAll => "allow-all",
            ViewerProtocolPolicy::RedirectToHttps => "redirect-to-https",
            ViewerProtocolPolicy::HttpsOnly => "https-only",
        }
    }
}

/// a private S3 bucket served through an origin access identity.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct S3OriginInput {
    pub logical_bucket_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BehaviorInput {
    /// eg: `data/*.json`. Must not be the default pattern (`*`).
    pub path_pattern: String,
    pub origin: S3OriginInput,
    pub cache: CachePolicyChoice,
    pub allowed_methods: AllowedMethods,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorResponse {
    pub error_code: u16,
    pub response_code: u16,
    pub response_page_path: String,
}

/// for single page apps: paths the bucket does not know about are
/// answered with the entry document and a 200 so the client side router
/// can take over. A private bucket answers unknown keys with 403.
pub fn spa_error_responses(page: &str) -> Vec<ErrorResponse> {
    [403, 404].into_iter().map(|error_code| ErrorResponse {
        error_code,
        response_code: 200,
        response_page_path: page.to_string(),
    }).collect()
}

fn specificity(path_pattern: &str) -> usize {
    path_pattern.chars().filter(|c| *c != '*' && *c != '?').count()
}

/// cloudfront evaluates behaviors in list order, so more specific patterns
/// have to come first. Ties keep their input order.
pub fn order_behaviors(behaviors: &[BehaviorInput]) -> Result<Vec<BehaviorInput>, Error> {
    let mut out: Vec<BehaviorInput> = Vec::with_capacity(behaviors.len());
    for behavior in behaviors {
        let pattern = behavior.path_pattern.as_str();
        if pattern.is_empty() || pattern == "*" || pattern == "/*" {
            return Err(Error::InvalidInput(format!(
                "Behavior path pattern {:?} would shadow the default behavior. Configure the default origin instead", pattern
            )));
        }
        if out.iter().any(|b| b.path_pattern == pattern) {
            return Err(Error::InvalidInput(format!(
                "Distribution received duplicate path pattern {}. All path patterns in a distribution must be unique", pattern
            )));
        }
        out.push(behavior.clone());
    }
    out.sort_by_key(|b| std::cmp::Reverse(specificity(&b.path_pattern)));
    Ok(out)
}

pub struct Input {
    /// used to build the logical names of the distribution (`Distribution{name}`).
    pub name: String,
    /// by default we create the distribution enabled and ready to use.
    pub disabled: bool,
    pub default_origin: S3OriginInput,
    pub default_cache: CachePolicyChoice,
    /// extra behaviors. they get sorted by specificity, so
    /// the order they are provided in does not matter.
    pub behaviors: Vec<BehaviorInput>,
    pub error_responses: Vec<ErrorResponse>,
    pub default_root_object: Option<String>,
    /// alternate domain names. Requires a certificate.
    pub aliases: Vec<String>,
    /// arn of an ACM certificate in us-east-1. usually a `Ref` to a
    /// certificate declared in the same stack.
    pub certificate: Option<StrVal>,
    /// By default set to redirect-to-https.
    pub viewer_protocol_policy: ViewerProtocolPolicy,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            name: String::new(),
            disabled: false,
            default_origin: Default::default(),
            default_cache: CachePolicyChoice::CachingOptimized,
            behaviors: vec![],
            error_responses: vec![],
            default_root_object: Some("index.html".to_string()),
            aliases: vec![],
            certificate: None,
            viewer_protocol_policy: ViewerProtocolPolicy::RedirectToHttps,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outputs {
    /// the logical name of the distribution. its `DomainName` attribute
    /// is what DNS records should point at.
    pub logical_distribution_name: String,
    pub logical_oai_names: Vec<String>,
    pub logical_cache_policy_names: Vec<String>,
}

pub struct CfnOriginAccessIdentity {
    pub comment: String,
}

impl CfnResource for CfnOriginAccessIdentity {
    fn type_string(&self) -> &'static str {
        "AWS::CloudFront::CloudFrontOriginAccessIdentity"
    }
    fn properties(&self) -> Result<Value, serde_json::Error> {
        Ok(json!({ "CloudFrontOriginAccessIdentityConfig": { "Comment": self.comment } }))
    }
}

pub struct CfnCachePolicy {
    pub name: String,
    pub ttl_secs: u64,
}

impl CfnResource for CfnCachePolicy {
    fn type_string(&self) -> &'static str {
        "AWS::CloudFront::CachePolicy"
    }
    fn properties(&self) -> Result<Value, serde_json::Error> {
        Ok(json!({
            "CachePolicyConfig": {
                // policy names are account wide
                "Name": sub(&format!("${{AWS::StackName}}-{}", self.name)),
                "DefaultTTL": self.ttl_secs,
                "MaxTTL": self.ttl_secs,
                "MinTTL": self.ttl_secs,
                "ParametersInCacheKeyAndForwardedToOrigin": {
                    "CookiesConfig": { "CookieBehavior": "none" },
                    "HeadersConfig": { "HeaderBehavior": "none" },
                    "QueryStringsConfig": { "QueryStringBehavior": "none" },
                    "EnableAcceptEncodingGzip": true,
                    "EnableAcceptEncodingBrotli": true,
                },
            }
        }))
    }
    fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() || !self.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(format!("Invalid cache policy name {:?}\nMust only contain alphanumeric characters, hyphens and underscores", self.name));
        }
        if self.ttl_secs > MAX_TTL_SECS {
            return Err(format!("Invalid ttl {}\nMust be at most {}", self.ttl_secs, MAX_TTL_SECS));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct S3OriginConfig {
    pub origin_access_identity: StrVal,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Origin {
    pub id: String,
    pub domain_name: StrVal,
    pub s3_origin_config: S3OriginConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CacheBehavior {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_pattern: Option<String>,
    pub target_origin_id: String,
    pub viewer_protocol_policy: String,
    pub cache_policy_id: StrVal,
    pub allowed_methods: Vec<String>,
    pub compress: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ViewerCertificate {
    pub acm_certificate_arn: StrVal,
    pub ssl_support_method: String,
    pub minimum_protocol_version: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DistributionConfig {
    pub enabled: bool,
    pub origins: Vec<Origin>,
    pub default_cache_behavior: CacheBehavior,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cache_behaviors: Vec<CacheBehavior>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub custom_error_responses: Vec<ErrorResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_root_object: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewer_certificate: Option<ViewerCertificate>,
    pub http_version: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CfnDistribution {
    pub distribution_config: DistributionConfig,
}

impl CfnResource for CfnDistribution {
    fn type_string(&self) -> &'static str {
        "AWS::CloudFront::Distribution"
    }
    fn properties(&self) -> Result<Value, serde_json::Error> {
        aws_cfn_stack::to_properties(self)
    }
    fn validate(&self) -> Result<(), String> {
        let config = &self.distribution_config;
        if !config.aliases.is_empty() && config.viewer_certificate.is_none() {
            return Err(format!("Distribution aliases {:?} require a certificate", config.aliases));
        }
        for response in config.custom_error_responses.iter() {
            if !(400..=599).contains(&response.error_code) {
                return Err(format!("Invalid error code {}\nMust be a 4xx or 5xx status", response.error_code));
            }
            if !response.response_page_path.starts_with('/') {
                return Err(format!("Invalid response page path {:?}\nMust start with '/'", response.response_page_path));
            }
        }
        let origin_ids: Vec<&str> = config.origins.iter().map(|o| o.id.as_str()).collect();
        let behaviors = std::iter::once(&config.default_cache_behavior).chain(config.cache_behaviors.iter());
        for behavior in behaviors {
            if !origin_ids.contains(&behavior.target_origin_id.as_str()) {
                return Err(format!("Behavior targets unknown origin {}", behavior.target_origin_id));
            }
        }
        Ok(())
    }
}

struct CachePolicies<'a> {
    stack: &'a mut aws_cfn_stack::Input,
    /// policy name -> (logical name, ttl)
    declared: BTreeMap<String, (String, u64)>,
}

impl CachePolicies<'_> {
    fn policy_id(&mut self, choice: &CachePolicyChoice) -> Result<StrVal, Error> {
        let (name, ttl_secs) = match choice {
            CachePolicyChoice::CachingOptimized => return Ok(CACHING_OPTIMIZED_POLICY_ID.into()),
            CachePolicyChoice::FixedTtl { name, ttl_secs } => (name, *ttl_secs),
        };
        if let Some((logical, existing_ttl)) = self.declared.get(name) {
            if *existing_ttl != ttl_secs {
                return Err(Error::InvalidInput(format!(
                    "Cache policy {name} is declared with two different TTLs ({existing_ttl} and {ttl_secs})"
                )));
            }
            return Ok(get_ref(logical).into());
        }
        // an empty stack name is filled in by `synthesize` and cannot be checked here
        let full_len = self.stack.stack_name.len() + 1 + name.len();
        if !self.stack.stack_name.is_empty() && full_len > MAX_CACHE_POLICY_NAME_LEN {
            return Err(Error::InvalidInput(format!(
                "Cache policy name {}-{name} is {full_len} characters long\nMust be at most {MAX_CACHE_POLICY_NAME_LEN}",
                self.stack.stack_name,
            )));
        }
        let logical = logical_name("CachePolicy", name)?;
        self.stack.push(Resource::new(logical.clone(), CfnCachePolicy { name: name.clone(), ttl_secs }));
        self.declared.insert(name.clone(), (logical.clone(), ttl_secs));
        Ok(get_ref(&logical).into())
    }
}

fn behavior(
    policies: &mut CachePolicies,
    path_pattern: Option<String>,
    origin: &S3OriginInput,
    cache: &CachePolicyChoice,
    allowed_methods: AllowedMethods,
    viewer_protocol_policy: ViewerProtocolPolicy,
) -> Result<CacheBehavior, Error> {
    Ok(CacheBehavior {
        path_pattern,
        target_origin_id: origin.logical_bucket_name.clone(),
        viewer_protocol_policy: viewer_protocol_policy.as_str().to_string(),
        cache_policy_id: policies.policy_id(cache)?,
        allowed_methods: allowed_methods.methods().iter().map(|m| m.to_string()).collect(),
        compress: true,
    })
}

pub fn config(input: &Input, stack: &mut aws_cfn_stack::Input) -> Result<Outputs, Error> {
    if input.default_origin.logical_bucket_name.is_empty() {
        return Err(Error::InvalidInput("Distribution must have a default origin".to_string()));
    }
    let behaviors = order_behaviors(&input.behaviors)?;

    // one identity per distinct bucket, default origin first
    let mut origins: Vec<Origin> = vec![];
    let mut logical_oai_names = vec![];
    let buckets = std::iter::once(&input.default_origin).chain(behaviors.iter().map(|b| &b.origin));
    for origin in buckets {
        let bucket = &origin.logical_bucket_name;
        if origins.iter().any(|o| &o.id == bucket) {
            continue;
        }
        let logical_oai = logical_name("OAI", bucket)?;
        stack.push(Resource::new(logical_oai.clone(), CfnOriginAccessIdentity {
            comment: format!("access to {bucket} for {}", input.name),
        }));
        aws_s3::allow_origin_access_identity(stack, bucket, &logical_oai)?;
        origins.push(Origin {
            id: bucket.clone(),
            domain_name: get_att(bucket, "RegionalDomainName").into(),
            s3_origin_config: S3OriginConfig {
                origin_access_identity: sub(&format!("origin-access-identity/cloudfront/${{{logical_oai}}}")).into(),
            },
        });
        logical_oai_names.push(logical_oai);
    }

    let mut policies = CachePolicies { stack: &mut *stack, declared: BTreeMap::new() };
    let default_cache_behavior = behavior(
        &mut policies, None, &input.default_origin, &input.default_cache,
        AllowedMethods::GetHead, input.viewer_protocol_policy,
    )?;
    let mut cache_behaviors = Vec::with_capacity(behaviors.len());
    for b in behaviors.iter() {
        cache_behaviors.push(behavior(
            &mut policies, Some(b.path_pattern.clone()), &b.origin, &b.cache,
            b.allowed_methods, input.viewer_protocol_policy,
        )?);
    }
    let logical_cache_policy_names = policies.declared.into_values().map(|(logical, _)| logical).collect();

    let distribution = CfnDistribution {
        distribution_config: DistributionConfig {
            enabled: !input.disabled,
            origins,
            default_cache_behavior,
            cache_behaviors,
            custom_error_responses: input.error_responses.clone(),
            default_root_object: input.default_root_object.clone(),
            aliases: input.aliases.clone(),
            viewer_certificate: input.certificate.clone().map(|acm_certificate_arn| ViewerCertificate {
                acm_certificate_arn,
                ssl_support_method: "sni-only".to_string(),
                minimum_protocol_version: "TLSv1.2_2021".to_string(),
            }),
            http_version: "http2".to_string(),
        },
    };
    let logical_distribution_name = logical_name("Distribution", &input.name)?;
    stack.push(Resource::new(logical_distribution_name.clone(), distribution));
    Ok(Outputs { logical_distribution_name, logical_oai_names, logical_cache_policy_names })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(name: &str) -> S3OriginInput {
        S3OriginInput { logical_bucket_name: name.to_string() }
    }

    fn behavior_input(pattern: &str) -> BehaviorInput {
        BehaviorInput { path_pattern: pattern.to_string(), origin: origin("Bucketdata"), ..Default::default() }
    }

    fn stack_with_buckets() -> aws_cfn_stack::Input {
        let mut stack = aws_cfn_stack::Input::default();
        for name in ["site", "data"] {
            aws_s3::config(&aws_s3::Input { name: name.into(), ..Default::default() }, &mut stack).unwrap();
        }
        stack
    }

    #[test]
    fn behaviors_are_ordered_by_specificity() {
        let ordered = order_behaviors(&[
            behavior_input("*.json"),
            behavior_input("data/*"),
            behavior_input("data/images/*"),
            behavior_input("img/*"),
        ]).unwrap();
        let patterns: Vec<&str> = ordered.iter().map(|b| b.path_pattern.as_str()).collect();
        assert_eq!(patterns, vec!["data/images/*", "*.json", "data/*", "img/*"]);
    }

    #[test]
    fn default_and_duplicate_patterns_are_rejected() {
        assert!(order_behaviors(&[behavior_input("*")]).is_err());
        assert!(order_behaviors(&[behavior_input("/*")]).is_err());
        let err = order_behaviors(&[behavior_input("a/*"), behavior_input("a/*")]).unwrap_err();
        assert!(err.to_string().contains("duplicate path pattern a/*"));
    }

    #[test]
    fn spa_errors_rewrite_to_entry_document() {
        let responses = spa_error_responses("/index.html");
        assert_eq!(responses.len(), 2);
        assert!(responses.iter().all(|r| r.response_code == 200 && r.response_page_path == "/index.html"));
        assert_eq!(responses.iter().map(|r| r.error_code).collect::<Vec<_>>(), vec![403, 404]);
    }

    #[test]
    fn two_origins_with_fixed_ttl_data_behavior() {
        let mut stack = stack_with_buckets();
        let input = Input {
            name: "web".into(),
            default_origin: origin("Bucketsite"),
            behaviors: vec![BehaviorInput {
                path_pattern: "data/*.json".into(),
                origin: origin("Bucketdata"),
                cache: CachePolicyChoice::FixedTtl { name: "data".into(), ttl_secs: 60 },
                allowed_methods: AllowedMethods::All,
            }],
            error_responses: spa_error_responses("/index.html"),
            ..Default::default()
        };
        let out = config(&input, &mut stack).unwrap();
        assert_eq!(out.logical_distribution_name, "Distributionweb");
        assert_eq!(out.logical_oai_names, vec!["OAIBucketsite", "OAIBucketdata"]);
        assert_eq!(out.logical_cache_policy_names, vec!["CachePolicydata"]);

        let synth = aws_cfn_stack::synthesize(stack, "test").unwrap();
        let policy = &synth.resource("CachePolicydata").unwrap().properties["CachePolicyConfig"];
        assert_eq!(policy["MinTTL"], 60);
        assert_eq!(policy["MaxTTL"], 60);
        assert_eq!(policy["DefaultTTL"], 60);

        let config = &synth.resource("Distributionweb").unwrap().properties["DistributionConfig"];
        assert_eq!(config["DefaultCacheBehavior"]["CachePolicyId"], CACHING_OPTIMIZED_POLICY_ID);
        assert_eq!(config["DefaultCacheBehavior"]["ViewerProtocolPolicy"], "redirect-to-https");
        assert!(config["DefaultCacheBehavior"].get("PathPattern").is_none());
        assert_eq!(config["CacheBehaviors"][0]["PathPattern"], "data/*.json");
        assert_eq!(config["CacheBehaviors"][0]["CachePolicyId"]["Ref"], "CachePolicydata");
        assert_eq!(config["CacheBehaviors"][0]["AllowedMethods"].as_array().unwrap().len(), 7);
        assert_eq!(config["Origins"][1]["S3OriginConfig"]["OriginAccessIdentity"]["Fn::Sub"],
            "origin-access-identity/cloudfront/${OAIBucketdata}");
        assert_eq!(config["DefaultRootObject"], "index.html");
        assert!(synth.resource("BucketdataPolicy").is_some());
        assert!(aws_cfn_stack::graph::depends_on(&synth.template, "Distributionweb", "CachePolicydata"));
    }

    #[test]
    fn aliases_need_a_certificate() {
        let mut stack = stack_with_buckets();
        let input = Input {
            name: "web".into(),
            default_origin: origin("Bucketsite"),
            aliases: vec!["new.mayoche.info".into()],
            ..Default::default()
        };
        config(&input, &mut stack).unwrap();
        let err = aws_cfn_stack::synthesize(stack, "test").unwrap_err();
        assert!(err.to_string().contains("require a certificate"));
    }

    #[test]
    fn certificate_uses_sni_and_modern_tls() {
        let mut stack = stack_with_buckets();
        stack.push(Resource::new("Cert", CfnOriginAccessIdentity { comment: "stand in".into() }));
        let input = Input {
            name: "web".into(),
            default_origin: origin("Bucketsite"),
            aliases: vec!["new.mayoche.info".into()],
            certificate: Some(get_ref("Cert").into()),
            ..Default::default()
        };
        config(&input, &mut stack).unwrap();
        let synth = aws_cfn_stack::synthesize(stack, "test").unwrap();
        let cert = &synth.resource("Distributionweb").unwrap().properties["DistributionConfig"]["ViewerCertificate"];
        assert_eq!(cert["SslSupportMethod"], "sni-only");
        assert_eq!(cert["MinimumProtocolVersion"], "TLSv1.2_2021");
        assert_eq!(cert["AcmCertificateArn"]["Ref"], "Cert");
    }

    #[test]
    fn cache_policy_name_fits_with_the_stack_name() {
        let data_behavior = |policy: &str| BehaviorInput {
            path_pattern: "data/*.json".into(),
            origin: origin("Bucketdata"),
            cache: CachePolicyChoice::FixedTtl { name: policy.into(), ttl_secs: 60 },
            allowed_methods: AllowedMethods::All,
        };
        let input = |policy: &str| Input {
            name: "web".into(),
            default_origin: origin("Bucketsite"),
            behaviors: vec![data_behavior(policy)],
            ..Default::default()
        };

        let mut stack = stack_with_buckets();
        stack.stack_name = format!("S{}", "a".repeat(117));
        assert!(config(&input("DataCache"), &mut stack).is_ok());

        let mut stack = stack_with_buckets();
        stack.stack_name = format!("S{}", "a".repeat(127));
        let err = config(&input("DataCache"), &mut stack).unwrap_err();
        assert!(err.to_string().contains("at most 128"));
    }

    #[test]
    fn conflicting_ttls_for_one_policy_are_rejected() {
        let mut stack = stack_with_buckets();
        let mut a = behavior_input("a/*");
        a.cache = CachePolicyChoice::FixedTtl { name: "short".into(), ttl_secs: 60 };
        let mut b = behavior_input("b/*");
        b.cache = CachePolicyChoice::FixedTtl { name: "short".into(), ttl_secs: 120 };
        let input = Input { name: "web".into(), default_origin: origin("Bucketsite"), behaviors: vec![a, b], ..Default::default() };
        assert!(matches!(config(&input, &mut stack), Err(Error::InvalidInput(_))));
    }
}
