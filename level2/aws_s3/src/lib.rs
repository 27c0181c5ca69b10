//! this is a higher level module for creating S3 buckets easily. Buckets are
//! private by default; read access for a CDN is granted to an origin access
//! identity through a bucket policy, and write access is handed out as IAM
//! statements that can be attached to whichever role needs them.

use aws_cfn_stack::{
    create_policy_doc, get_att, get_ref, logical_name, sub, CfnResource, Error, PolicyStatement, Resource, StrVal,
};
use serde::Serialize;
use serde_json::{json, Value};

pub const VALID_CORS_METHODS: &[&str] = &["GET", "PUT", "HEAD", "POST", "DELETE"];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CorsRule {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_headers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_age: Option<u32>,
}

impl CorsRule {
    /// browser reads from the given origins, any request header.
    pub fn get_from(origins: &[&str]) -> Self {
        Self {
            allowed_origins: origins.iter().map(|o| o.to_string()).collect(),
            allowed_methods: vec!["GET".to_string()],
            allowed_headers: vec!["*".to_string()],
            max_age: None,
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.allowed_origins.is_empty() {
            return Err("CORS rule must allow at least 1 origin".to_string());
        }
        if self.allowed_methods.is_empty() {
            return Err("CORS rule must allow at least 1 method".to_string());
        }
        if let Some(method) = self.allowed_methods.iter().find(|m| !VALID_CORS_METHODS.contains(&m.as_str())) {
            return Err(format!("Invalid CORS method {:?}\nMust be one of {:?}", method, VALID_CORS_METHODS));
        }
        Ok(())
    }
}

pub struct Input {
    /// used to build the logical name of the bucket (`Bucket{name}`).
    /// the physical bucket name is left for cloudformation to generate.
    pub name: String,
    pub cors_rules: Vec<CorsRule>,
    pub versioned: bool,
    /// block every form of public access. Defaults to true; cloudfront
    /// reads through an origin access identity instead.
    pub block_public_access: bool,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            name: String::new(),
            cors_rules: vec![],
            versioned: false,
            block_public_access: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outputs {
    /// the logical name of the resource in cloudformation.
    /// Reference this value in other modules, for example
    /// allowing permissions to read/write from this bucket,
    /// pointing a cloudfront distribution to this bucket, etc.
    pub logical_bucket_name: String,
}

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CfnBucket {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub versioning_configuration: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_access_block_configuration: Option<Value>,
    #[serde(skip)]
    pub cors_rules: Vec<CorsRule>,
}

impl CfnResource for CfnBucket {
    fn type_string(&self) -> &'static str {
        "AWS::S3::Bucket"
    }
    fn properties(&self) -> Result<Value, serde_json::Error> {
        let mut out = aws_cfn_stack::to_properties(self)?;
        if !self.cors_rules.is_empty() {
            out["CorsConfiguration"] = json!({ "CorsRules": self.cors_rules });
        }
        Ok(out)
    }
    fn validate(&self) -> Result<(), String> {
        self.cors_rules.iter().try_for_each(CorsRule::validate)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CfnBucketPolicy {
    pub bucket: StrVal,
    pub policy_document: Value,
}

aws_cfn_stack::impl_cfn_resource!(CfnBucketPolicy, "AWS::S3::BucketPolicy");

/// `arn:...:s3:::bucket/*`
pub fn objects_arn(logical_bucket_name: &str) -> Value {
    sub(&format!("${{{logical_bucket_name}.Arn}}/*"))
}

pub fn config(input: &Input, stack: &mut aws_cfn_stack::Input) -> Result<Outputs, Error> {
    let logical_bucket_name = logical_name("Bucket", &input.name)?;
    let bucket = CfnBucket {
        versioning_configuration: input.versioned.then(|| json!({ "Status": "Enabled" })),
        public_access_block_configuration: input.block_public_access.then(|| json!({
            "BlockPublicAcls": true,
            "BlockPublicPolicy": true,
            "IgnorePublicAcls": true,
            "RestrictPublicBuckets": true,
        })),
        cors_rules: input.cors_rules.clone(),
        ..Default::default()
    };
    stack.push(Resource::new(logical_bucket_name.clone(), bucket));
    Ok(Outputs { logical_bucket_name })
}

/// lets a cloudfront origin access identity read every object in the bucket.
/// returns the logical name of the bucket policy.
pub fn allow_origin_access_identity(
    stack: &mut aws_cfn_stack::Input,
    logical_bucket_name: &str,
    logical_oai_name: &str,
) -> Result<String, Error> {
    let statement = PolicyStatement::allow(&["s3:GetObject"], vec![objects_arn(logical_bucket_name)])
        .with_principal(json!({ "CanonicalUser": get_att(logical_oai_name, "S3CanonicalUserId") }));
    let policy = CfnBucketPolicy {
        bucket: get_ref(logical_bucket_name).into(),
        policy_document: create_policy_doc(&[statement]),
    };
    let logical_policy_name = logical_name(logical_bucket_name, "Policy")?;
    stack.push(Resource::new(logical_policy_name.clone(), policy));
    Ok(logical_policy_name)
}

/// write-only access to the bucket's objects, for attaching to a role.
pub fn write_policy_statements(logical_bucket_name: &str) -> Vec<PolicyStatement> {
    vec![PolicyStatement::allow(
        &["s3:DeleteObject*", "s3:PutObject", "s3:PutObjectLegalHold", "s3:PutObjectRetention",
          "s3:PutObjectTagging", "s3:PutObjectVersionTagging", "s3:Abort*"],
        vec![get_att(logical_bucket_name, "Arn"), objects_arn(logical_bucket_name)],
    )]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_bucket_by_default() {
        let mut stack = aws_cfn_stack::Input::default();
        let out = config(&Input { name: "assets".into(), ..Default::default() }, &mut stack).unwrap();
        assert_eq!(out.logical_bucket_name, "Bucketassets");
        let synth = aws_cfn_stack::synthesize(stack, "test").unwrap();
        let bucket = synth.resource("Bucketassets").unwrap();
        assert_eq!(bucket.ty, "AWS::S3::Bucket");
        assert_eq!(bucket.properties["PublicAccessBlockConfiguration"]["BlockPublicPolicy"], true);
        assert!(bucket.properties.get("CorsConfiguration").is_none());
        assert!(bucket.properties.get("VersioningConfiguration").is_none());
    }

    #[test]
    fn cors_rules_are_emitted() {
        let mut stack = aws_cfn_stack::Input::default();
        let input = Input {
            name: "data".into(),
            cors_rules: vec![CorsRule::get_from(&["https://new.mayoche.info", "http://localhost:5173"])],
            ..Default::default()
        };
        config(&input, &mut stack).unwrap();
        let synth = aws_cfn_stack::synthesize(stack, "test").unwrap();
        let rule = &synth.resource("Bucketdata").unwrap().properties["CorsConfiguration"]["CorsRules"][0];
        assert_eq!(rule["AllowedOrigins"][1], "http://localhost:5173");
        assert_eq!(rule["AllowedMethods"], json!(["GET"]));
        assert_eq!(rule["AllowedHeaders"], json!(["*"]));
        assert!(rule.get("MaxAge").is_none());
    }

    #[test]
    fn bad_cors_rules_fail_synthesis() {
        let mut no_origin = CorsRule::get_from(&[]);
        assert!(no_origin.validate().is_err());
        no_origin.allowed_origins.push("*".into());
        no_origin.allowed_methods = vec!["PATCH".into()];
        let err = no_origin.validate().unwrap_err();
        assert!(err.starts_with("Invalid CORS method \"PATCH\""));

        let mut stack = aws_cfn_stack::Input::default();
        config(&Input { name: "x".into(), cors_rules: vec![no_origin], ..Default::default() }, &mut stack).unwrap();
        assert!(matches!(aws_cfn_stack::synthesize(stack, "test"), Err(Error::InvalidResource { .. })));
    }

    #[test]
    fn oai_policy_grants_get_object_only() {
        let mut stack = aws_cfn_stack::Input::default();
        let out = config(&Input { name: "site".into(), ..Default::default() }, &mut stack).unwrap();
        let policy = allow_origin_access_identity(&mut stack, &out.logical_bucket_name, "OAIsite").unwrap();
        assert_eq!(policy, "BucketsitePolicy");
        let doc = &stack.resources[1].properties.properties().unwrap()["PolicyDocument"];
        assert_eq!(doc["Statement"][0]["Action"], json!(["s3:GetObject"]));
        assert_eq!(doc["Statement"][0]["Resource"][0]["Fn::Sub"], "${Bucketsite.Arn}/*");
        assert_eq!(doc["Statement"][0]["Principal"]["CanonicalUser"]["Fn::GetAtt"][0], "OAIsite");
    }

    #[test]
    fn write_statements_cover_bucket_and_objects() {
        let statements = write_policy_statements("Bucketdata");
        assert_eq!(statements.len(), 1);
        assert!(statements[0].actions.iter().any(|a| a == "s3:PutObject"));
        assert!(!statements[0].actions.iter().any(|a| a.starts_with("s3:Get")));
        assert_eq!(statements[0].resources[0], get_att("Bucketdata", "Arn"));
    }
}
