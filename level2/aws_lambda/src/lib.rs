//! container image functions, their execution role, and an optional
//! eventbridge schedule that invokes them.

use std::collections::BTreeMap;

use aws_cfn_stack::{get_att, logical_name, sub, CfnResource, CfnRole, Error, PolicyStatement, Resource, StrVal};
use serde::Serialize;
use serde_json::{json, Value};

pub mod schedule;

pub use schedule::{CronExpression, RateUnit, Schedule};

pub const BASIC_EXECUTION_POLICY: &str = "arn:${AWS::Partition}:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole";

pub struct Input {
    /// used to build the logical names: `Function{name}`, `Role{name}`, `Schedule{name}`.
    /// Must be alphanumeric after dropping `_`, `-` and `.`.
    pub name: String,
    /// physical id of the lambda function. Leave empty to get a generated name.
    /// max 64 characters.
    pub function_name: String,
    /// the image to run, eg: `123456789012.dkr.ecr.us-east-1.amazonaws.com/scraper:latest`.
    pub image_uri: String,
    /// memory to give your function (in MB). Defaults to 256.
    /// Valid values: 128 - 10240
    pub memory_size: u32,
    /// timeout of your function (in seconds). Defaults to 300.
    /// Valid values: 1 - 900
    pub timeout: u32,
    /// caps how many copies of the function can run at once.
    pub reserved_concurrency: Option<u32>,
    pub environment: BTreeMap<String, StrVal>,
    /// attached to the execution role as one inline policy.
    pub extra_policy_statements: Vec<PolicyStatement>,
    /// set to some if this lambda function should run on a schedule.
    pub schedule: Option<Schedule>,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            name: String::new(),
            function_name: String::new(),
            image_uri: String::new(),
            memory_size: 256,
            timeout: 300,
            reserved_concurrency: None,
            environment: BTreeMap::new(),
            extra_policy_statements: vec![],
            schedule: None,
        }
    }
}

impl Input {
    pub fn is_valid(&self) -> Option<String> {
        if self.function_name.len() > 64 {
            return Some(format!("Invalid function name {:?}\nMust be at most 64 characters", self.function_name));
        }
        if self.image_uri.is_empty() {
            return Some(format!("Function {} must have an image uri", self.name));
        }
        if self.memory_size < 128 || self.memory_size > 10240 {
            return Some(format!("Invalid memory size {:?}\nMust be between 128 and 10240", self.memory_size));
        }
        if self.timeout < 1 || self.timeout > 900 {
            return Some(format!("Invalid timeout {:?}\nMust be between 1 and 900", self.timeout));
        }
        if self.reserved_concurrency == Some(0) {
            return Some("Reserved concurrency of 0 would stop the function from ever running".to_string());
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outputs {
    pub logical_function_name: String,
    pub logical_role_name: String,
    pub logical_rule_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CfnFunction {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    pub package_type: String,
    pub code: Value,
    pub role: StrVal,
    pub memory_size: u32,
    pub timeout: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reserved_concurrent_executions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<Value>,
}

aws_cfn_stack::impl_cfn_resource!(CfnFunction, "AWS::Lambda::Function");

pub struct CfnEventsRule {
    pub schedule: Schedule,
    pub target_arn: Value,
}

impl CfnResource for CfnEventsRule {
    fn type_string(&self) -> &'static str {
        "AWS::Events::Rule"
    }
    fn properties(&self) -> Result<Value, serde_json::Error> {
        Ok(json!({
            "ScheduleExpression": self.schedule.to_string(),
            "State": "ENABLED",
            "Targets": [{ "Arn": self.target_arn, "Id": "Target0" }],
        }))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CfnPermission {
    pub action: String,
    pub function_name: StrVal,
    pub principal: String,
    pub source_arn: StrVal,
}

aws_cfn_stack::impl_cfn_resource!(CfnPermission, "AWS::Lambda::Permission");

pub fn config(input: &Input, stack: &mut aws_cfn_stack::Input) -> Result<Outputs, Error> {
    if let Some(err_msg) = input.is_valid() {
        return Err(Error::InvalidInput(err_msg));
    }
    let logical_function_name = logical_name("Function", &input.name)?;
    let logical_role_name = logical_name("Role", &input.name)?;

    let mut role = CfnRole::for_service("lambda.amazonaws.com")
        .with_inline_policy(format!("{logical_role_name}Policy"), &input.extra_policy_statements);
    role.managed_policy_arns.push(sub(BASIC_EXECUTION_POLICY));
    stack.push(Resource::new(logical_role_name.clone(), role));

    let environment = (!input.environment.is_empty()).then(|| json!({ "Variables": input.environment }));
    let function = CfnFunction {
        function_name: (!input.function_name.is_empty()).then(|| input.function_name.clone()),
        package_type: "Image".to_string(),
        code: json!({ "ImageUri": input.image_uri }),
        role: get_att(&logical_role_name, "Arn").into(),
        memory_size: input.memory_size,
        timeout: input.timeout,
        reserved_concurrent_executions: input.reserved_concurrency,
        environment,
    };
    stack.push(Resource::new(logical_function_name.clone(), function));

    let logical_rule_name = match &input.schedule {
        None => None,
        Some(schedule) => {
            let logical_rule_name = logical_name("Schedule", &input.name)?;
            stack.push(Resource::new(logical_rule_name.clone(), CfnEventsRule {
                schedule: schedule.clone(),
                target_arn: get_att(&logical_function_name, "Arn"),
            }));
            let permission = CfnPermission {
                action: "lambda:InvokeFunction".to_string(),
                function_name: get_att(&logical_function_name, "Arn").into(),
                principal: "events.amazonaws.com".to_string(),
                source_arn: get_att(&logical_rule_name, "Arn").into(),
            };
            stack.push(Resource::new(logical_name("Permission", &logical_rule_name)?, permission));
            Some(logical_rule_name)
        }
    };
    Ok(Outputs { logical_function_name, logical_role_name, logical_rule_name })
}
