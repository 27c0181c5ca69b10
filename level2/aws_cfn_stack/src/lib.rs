use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

pub use serde;
pub use serde_json;

pub mod deploy;
pub mod graph;
pub mod regions;

pub use regions::Region;

pub const TEMPLATE_VERSION: &str = "2010-09-09";

const STACK_NAME_RESTRICTION: &str = "Must only consist of alphanumeric characters and hyphens, Must start with an alphabetical character, and cannot be longer than 128 characters.";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid resource name {name:?}\n{reason}")]
    InvalidResourceName { name: String, reason: &'static str },
    #[error("Invalid stack name {0}\n{r}", r = STACK_NAME_RESTRICTION)]
    InvalidStackName(String),
    #[error("Validation failed on resource '{name}'\n{reason}")]
    InvalidResource { name: String, reason: String },
    #[error("Duplicate logical id '{0}'. Every resource and output in a stack must be uniquely named")]
    Duplicate(String),
    #[error("'{from}' references '{to}' but no resource with that logical id is declared")]
    DanglingReference { from: String, to: String },
    #[error("Dependency cycle between resources {0:?}")]
    DependencyCycle(Vec<String>),
    #[error("Invalid region code {0:?}\nMust be one of {v:?}", v = regions::VALID_AWS_REGIONS)]
    InvalidRegion(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error("Failed to serialize template\n{0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Failed to deploy stack {stack}\n{reason}")]
    Deploy { stack: String, reason: String },
}

/// either a plain string, or an intrinsic function such as `{ "Ref": "..." }`
/// that cloudformation resolves at deploy time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StrVal {
    String(String),
    Val(Value),
}

impl Default for StrVal {
    fn default() -> Self {
        StrVal::String(String::new())
    }
}

impl StrVal {
    pub fn is_empty(&self) -> bool {
        matches!(self, StrVal::String(s) if s.is_empty())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StrVal::String(s) => Some(s),
            StrVal::Val(_) => None,
        }
    }
}

impl From<&str> for StrVal {
    fn from(value: &str) -> Self {
        StrVal::String(value.to_string())
    }
}

impl From<String> for StrVal {
    fn from(value: String) -> Self {
        StrVal::String(value)
    }
}

impl From<Value> for StrVal {
    fn from(value: Value) -> Self {
        StrVal::Val(value)
    }
}

/// anything that can be placed in the `Resources` section of a template.
pub trait CfnResource {
    /// the cloudformation type, eg: `AWS::S3::Bucket`
    fn type_string(&self) -> &'static str;
    fn properties(&self) -> Result<Value, serde_json::Error>;
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

pub fn to_properties<T: Serialize>(value: &T) -> Result<Value, serde_json::Error> {
    serde_json::to_value(value)
}

/// implements `CfnResource` for a serializable property struct
/// that needs no extra validation.
#[macro_export]
macro_rules! impl_cfn_resource {
    ($ty:ty, $type_string:expr) => {
        impl $crate::CfnResource for $ty {
            fn type_string(&self) -> &'static str {
                $type_string
            }
            fn properties(&self) -> ::std::result::Result<$crate::serde_json::Value, $crate::serde_json::Error> {
                $crate::to_properties(self)
            }
        }
    };
}

pub fn get_ref(logical_id: &str) -> Value {
    let mut map = serde_json::Map::new();
    map.insert("Ref".to_string(), Value::String(logical_id.to_string()));
    Value::Object(map)
}

pub fn get_att(logical_id: &str, attribute: &str) -> Value {
    let mut map = serde_json::Map::new();
    map.insert("Fn::GetAtt".to_string(), Value::Array(vec![
        Value::String(logical_id.to_string()),
        Value::String(attribute.to_string()),
    ]));
    Value::Object(map)
}

/// `{ "Fn::Sub": template }`
pub fn sub(template: &str) -> Value {
    let mut map = serde_json::Map::new();
    map.insert("Fn::Sub".to_string(), Value::String(template.to_string()));
    Value::Object(map)
}

/// `{ "Fn::Select": [index, list] }`
pub fn select(index: u32, list: Value) -> Value {
    serde_json::json!({ "Fn::Select": [index.to_string(), list] })
}

/// a single IAM statement. resources may be intrinsic values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyStatement {
    #[serde(rename = "Effect")]
    pub effect: String,
    #[serde(rename = "Action")]
    pub actions: Vec<String>,
    #[serde(rename = "Resource")]
    pub resources: Vec<Value>,
    #[serde(rename = "Principal", skip_serializing_if = "Option::is_none", default)]
    pub principal: Option<Value>,
}

impl PolicyStatement {
    pub fn allow(actions: &[&str], resources: Vec<Value>) -> Self {
        Self {
            effect: "Allow".to_string(),
            actions: actions.iter().map(|a| a.to_string()).collect(),
            resources,
            principal: None,
        }
    }

    pub fn with_principal(mut self, principal: Value) -> Self {
        self.principal = Some(principal);
        self
    }
}

pub fn create_policy_doc(statements: &[PolicyStatement]) -> Value {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": statements,
    })
}

/// trust policy that lets the given service principal (eg: `lambda.amazonaws.com`)
/// assume a role.
pub fn assume_role_policy_doc(service: &str) -> Value {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": service },
            "Action": "sts:AssumeRole",
        }],
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InlinePolicy {
    pub policy_name: String,
    pub policy_document: Value,
}

/// `AWS::IAM::Role` assumed by a single service principal.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CfnRole {
    pub assume_role_policy_document: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub managed_policy_arns: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<InlinePolicy>,
}

impl CfnRole {
    pub fn for_service(service: &str) -> Self {
        Self {
            assume_role_policy_document: assume_role_policy_doc(service),
            managed_policy_arns: vec![],
            policies: vec![],
        }
    }

    /// adds one inline policy holding all of `statements`. no-op if there are none.
    pub fn with_inline_policy(mut self, policy_name: impl Into<String>, statements: &[PolicyStatement]) -> Self {
        if !statements.is_empty() {
            self.policies.push(InlinePolicy {
                policy_name: policy_name.into(),
                policy_document: create_policy_doc(statements),
            });
        }
        self
    }
}

impl_cfn_resource!(CfnRole, "AWS::IAM::Role");

pub struct Resource {
    pub name: String,
    pub properties: Box<dyn CfnResource>,
    /// explicit ordering edges for dependencies that are not
    /// already implied by a Ref/GetAtt/Sub in the properties.
    pub depends_on: Vec<String>,
    /// keep the physical resource when the stack deletes or replaces it.
    pub retain: bool,
}

impl Resource {
    pub fn new(name: impl Into<String>, properties: impl CfnResource + 'static) -> Self {
        Self {
            name: name.into(),
            properties: Box::new(properties),
            depends_on: vec![],
            retain: false,
        }
    }

    pub fn depends_on(mut self, logical_id: impl Into<String>) -> Self {
        self.depends_on.push(logical_id.into());
        self
    }

    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedResource {
    #[serde(rename = "Type")]
    pub ty: String,
    #[serde(rename = "Properties")]
    pub properties: Value,
    #[serde(rename = "DependsOn", skip_serializing_if = "Vec::is_empty", default)]
    pub depends_on: Vec<String>,
    #[serde(rename = "DeletionPolicy", skip_serializing_if = "Option::is_none", default)]
    pub deletion_policy: Option<String>,
    #[serde(rename = "UpdateReplacePolicy", skip_serializing_if = "Option::is_none", default)]
    pub update_replace_policy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceOutput {
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Value")]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedTemplate {
    #[serde(rename = "AWSTemplateFormatVersion")]
    pub version: String,
    #[serde(rename = "Description", skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
    #[serde(rename = "Resources")]
    pub resources: BTreeMap<String, SavedResource>,
    #[serde(rename = "Outputs", skip_serializing_if = "BTreeMap::is_empty", default)]
    pub outputs: BTreeMap<String, ResourceOutput>,
}

impl Default for SavedTemplate {
    fn default() -> Self {
        Self {
            version: TEMPLATE_VERSION.to_string(),
            description: None,
            resources: Default::default(),
            outputs: Default::default(),
        }
    }
}

impl SavedTemplate {
    pub fn resources_of_type<'a>(&'a self, ty: &'a str) -> impl Iterator<Item = (&'a String, &'a SavedResource)> + 'a {
        self.resources.iter().filter(move |(_, r)| r.ty == ty)
    }
}

#[derive(Default)]
pub struct Input {
    /// if left empty (default), the default stack name passed
    /// to `synthesize` is used.
    pub stack_name: String,
    pub description: String,
    pub resources: Vec<Resource>,
    pub outputs: Vec<(String, ResourceOutput)>,
}

impl Input {
    pub fn push(&mut self, resource: Resource) {
        debug!(logical_id = %resource.name, ty = resource.properties.type_string(), "declared resource");
        self.resources.push(resource);
    }

    pub fn add_output(&mut self, key: &str, description: &str, value: Value) {
        self.outputs.push((key.to_string(), ResourceOutput {
            description: description.to_string(),
            value,
        }));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesizedStack {
    pub name: String,
    pub template: SavedTemplate,
}

impl SynthesizedStack {
    /// we make it pretty so if a user needs to look at the stack in Cfn console, it looks nice
    pub fn to_json_pretty(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(&self.template)?)
    }

    pub fn resource(&self, logical_id: &str) -> Option<&SavedResource> {
        self.template.resources.get(logical_id)
    }
}

pub fn verify_resource_name(resource_name: &str) -> Result<(), Error> {
    let reason = if resource_name.len() > 255 {
        "must be less than 255 characters"
    } else if resource_name.is_empty() {
        "Must contain at least 1 character"
    } else if !resource_name.chars().all(|c| c.is_ascii_alphanumeric()) {
        "Must contain only alphanumeric characters [A-Za-z0-9]"
    } else {
        return Ok(());
    };
    Err(Error::InvalidResourceName { name: resource_name.to_string(), reason })
}

/// builds a logical id out of a prefix and a user supplied name,
/// dropping every character cloudformation does not allow.
pub fn logical_name(prefix: &str, name: &str) -> Result<String, Error> {
    let out: String = format!("{prefix}{name}")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    verify_resource_name(&out)?;
    Ok(out)
}

pub fn validate_stack_name(default_name: &str, requested: &str) -> Result<String, Error> {
    let stack_name = if requested.is_empty() {
        let mut stack_name = default_name.replace('_', "-");
        stack_name.truncate(128);
        stack_name
    } else {
        requested.to_string()
    };
    // A stack name can contain only alphanumeric characters (case sensitive) and hyphens.
    // It must start with an alphabetical character and can't be longer than 128 characters.
    let starts_alphabetic = stack_name.chars().next().map(|c| c.is_ascii_alphabetic()).unwrap_or(false);
    if !starts_alphabetic
        || stack_name.len() > 128
        || !stack_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(Error::InvalidStackName(stack_name));
    }
    Ok(stack_name)
}

pub fn validate_resources_to_template(resources: &[Resource]) -> Result<SavedTemplate, Error> {
    let mut out_template = SavedTemplate::default();
    for resource in resources.iter() {
        verify_resource_name(&resource.name)?;
        if let Err(reason) = resource.properties.validate() {
            return Err(Error::InvalidResource { name: resource.name.clone(), reason });
        }
        let retain = resource.retain.then(|| "Retain".to_string());
        let mut depends_on = resource.depends_on.clone();
        depends_on.sort();
        depends_on.dedup();
        let saved_resource = SavedResource {
            ty: resource.properties.type_string().to_string(),
            properties: resource.properties.properties()?,
            depends_on,
            deletion_policy: retain.clone(),
            update_replace_policy: retain,
        };
        if out_template.resources.insert(resource.name.clone(), saved_resource).is_some() {
            return Err(Error::Duplicate(resource.name.clone()));
        }
    }
    Ok(out_template)
}

/// validates every resource, checks that every dependency edge
/// points at a declared resource and that the edges form no cycle.
pub fn synthesize(input: Input, default_stack_name: &str) -> Result<SynthesizedStack, Error> {
    let name = validate_stack_name(default_stack_name, &input.stack_name)?;
    let mut template = validate_resources_to_template(&input.resources)?;
    if !input.description.is_empty() {
        template.description = Some(input.description);
    }
    for (key, output) in input.outputs {
        verify_resource_name(&key)?;
        if template.outputs.contains_key(&key) {
            return Err(Error::Duplicate(key));
        }
        template.outputs.insert(key, output);
    }
    graph::check_references(&template)?;
    let order = graph::creation_order(&template)?;
    info!(stack = %name, resources = order.len(), outputs = template.outputs.len(), "synthesized stack");
    Ok(SynthesizedStack { name, template })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    #[serde(rename_all = "PascalCase")]
    struct Topic {
        display_name: StrVal,
    }
    impl_cfn_resource!(Topic, "AWS::SNS::Topic");

    struct Rejected;
    impl CfnResource for Rejected {
        fn type_string(&self) -> &'static str {
            "AWS::SNS::Topic"
        }
        fn properties(&self) -> Result<Value, serde_json::Error> {
            Ok(Value::Null)
        }
        fn validate(&self) -> Result<(), String> {
            Err("always invalid".to_string())
        }
    }

    struct Unserializable;
    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("cannot serialize"))
        }
    }
    impl_cfn_resource!(Unserializable, "AWS::SNS::Topic");

    fn topic(name: &str) -> Topic {
        Topic { display_name: name.into() }
    }

    #[test]
    fn stack_name_defaults_to_module_name() {
        assert_eq!(validate_stack_name("my_stack", "").unwrap(), "my-stack");
        assert_eq!(validate_stack_name("my_stack", "Other-1").unwrap(), "Other-1");
        assert!(matches!(validate_stack_name("1stack", ""), Err(Error::InvalidStackName(_))));
        assert!(matches!(validate_stack_name("x", "has space"), Err(Error::InvalidStackName(_))));
        let long = "a".repeat(200);
        assert_eq!(validate_stack_name(&long, "").unwrap().len(), 128);
    }

    #[test]
    fn name_errors_explain_the_rules() {
        let err = validate_stack_name("x", "1bad").unwrap_err();
        assert_eq!(err.to_string(), format!("Invalid stack name 1bad\n{STACK_NAME_RESTRICTION}"));
        let err = "moon-1".parse::<Region>().unwrap_err();
        assert!(err.to_string().ends_with(&format!("{:?}", regions::VALID_AWS_REGIONS)));
    }

    #[test]
    fn serialization_failures_are_reported() {
        let resources = vec![Resource::new("Bad", Unserializable)];
        assert!(matches!(validate_resources_to_template(&resources), Err(Error::Serialize(_))));
    }

    #[test]
    fn logical_names_are_sanitized() {
        assert_eq!(logical_name("Bucket", "my_data-bucket.v2").unwrap(), "Bucketmydatabucketv2");
        assert!(logical_name("", "___").is_err());
        assert!(verify_resource_name(&"a".repeat(256)).is_err());
    }

    #[test]
    fn duplicate_resources_are_rejected() {
        let resources = vec![Resource::new("A", topic("a")), Resource::new("A", topic("b"))];
        assert!(matches!(validate_resources_to_template(&resources), Err(Error::Duplicate(n)) if n == "A"));
    }

    #[test]
    fn resource_validation_errors_name_the_resource() {
        let resources = vec![Resource::new("Broken", Rejected)];
        let err = validate_resources_to_template(&resources).unwrap_err();
        assert_eq!(err.to_string(), "Validation failed on resource 'Broken'\nalways invalid");
    }

    #[test]
    fn retained_resources_get_both_policies() {
        let resources = vec![Resource::new("Keep", topic("k")).retained().depends_on("Z").depends_on("Z")];
        let template = validate_resources_to_template(&resources).unwrap();
        let saved = &template.resources["Keep"];
        assert_eq!(saved.deletion_policy.as_deref(), Some("Retain"));
        assert_eq!(saved.update_replace_policy.as_deref(), Some("Retain"));
        assert_eq!(saved.depends_on, vec!["Z".to_string()]);
    }

    #[test]
    fn synthesize_produces_deterministic_json() {
        let mut input = Input::default();
        input.push(Resource::new("B", topic("b")));
        input.push(Resource::new("A", Topic { display_name: get_att("B", "TopicName").into() }));
        input.add_output("TopicArn", "arn of A", get_ref("A"));
        let stack = synthesize(input, "demo_stack").unwrap();
        assert_eq!(stack.name, "demo-stack");
        let json: Value = serde_json::from_str(&stack.to_json_pretty().unwrap()).unwrap();
        assert_eq!(json["AWSTemplateFormatVersion"], "2010-09-09");
        assert_eq!(json["Resources"]["A"]["Properties"]["DisplayName"]["Fn::GetAtt"][0], "B");
        assert_eq!(json["Outputs"]["TopicArn"]["Value"]["Ref"], "A");
        assert!(json["Resources"]["B"].get("DependsOn").is_none());
    }

    #[test]
    fn synthesize_rejects_missing_targets() {
        let mut input = Input::default();
        input.push(Resource::new("A", Topic { display_name: get_ref("Nope").into() }));
        let err = synthesize(input, "demo").unwrap_err();
        assert!(matches!(err, Error::DanglingReference { ref from, ref to } if from == "A" && to == "Nope"));
    }

    #[test]
    fn policy_docs_serialize_like_iam_expects() {
        let statement = PolicyStatement::allow(&["dynamodb:GetItem"], vec![get_att("Table", "Arn")]);
        let doc = create_policy_doc(&[statement]);
        assert_eq!(doc["Version"], "2012-10-17");
        assert_eq!(doc["Statement"][0]["Effect"], "Allow");
        assert_eq!(doc["Statement"][0]["Action"][0], "dynamodb:GetItem");
        assert!(doc["Statement"][0].get("Principal").is_none());
        let trust = assume_role_policy_doc("apigateway.amazonaws.com");
        assert_eq!(trust["Statement"][0]["Principal"]["Service"], "apigateway.amazonaws.com");
    }
}
