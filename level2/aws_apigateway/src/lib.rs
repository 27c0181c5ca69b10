//! a REST api that proxies straight into a dynamodb table. Each method is an
//! AWS service integration: api gateway assumes a role that may call exactly
//! one dynamodb action and renders the request with a mapping template.

use std::collections::BTreeMap;

use aws_cfn_stack::{get_att, get_ref, logical_name, sub, CfnResource, CfnRole, Error, PolicyStatement, Resource, StrVal};
use aws_dynamodb::TableRef;
use serde::Serialize;
use serde_json::{json, Value};

pub mod templates;

use templates::{IntegrationResponse, JSON};
pub use templates::{error_responses, get_item_template, put_item_template};

pub const CORS_ALLOW_HEADERS: &str = "'Content-Type,X-Amz-Date,Authorization,X-Api-Key,X-Amz-Security-Token,X-Amz-User-Agent'";
pub const CORS_ALLOW_METHODS: &str = "'OPTIONS,GET,PUT,POST,DELETE,PATCH,HEAD'";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Throttle {
    pub burst_limit: u32,
    pub rate_limit: f64,
}

impl Default for Throttle {
    fn default() -> Self {
        Self { burst_limit: 100, rate_limit: 200.0 }
    }
}

pub struct Input {
    /// physical name of the rest api, eg: `mayoche-data-api`.
    pub api_name: String,
    /// the collection path, eg: `choice` gives `/choice` and `/choice/{id}`.
    pub model_name: String,
    pub table: TableRef,
    /// applied to the usage plan and to every method of the stage.
    pub throttle: Throttle,
    /// origins allowed by the CORS preflight. Defaults to `*`.
    pub cors_allow_origins: Vec<String>,
    /// Defaults to `prod`.
    pub stage_name: String,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            api_name: String::new(),
            model_name: String::new(),
            table: TableRef::default(),
            throttle: Throttle::default(),
            cors_allow_origins: vec!["*".to_string()],
            stage_name: "prod".to_string(),
        }
    }
}

impl Input {
    pub fn is_valid(&self) -> Option<String> {
        if self.api_name.is_empty() {
            return Some("Must provide an api name".to_string());
        }
        let path_chars = |s: &str| s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if self.model_name.is_empty() || !path_chars(&self.model_name) {
            return Some(format!("Invalid model name {:?}\nMust be a single path segment of [a-zA-Z0-9._-]", self.model_name));
        }
        if self.table.logical_name.is_empty() || self.table.table_name.is_empty() || self.table.partition_key.is_empty() {
            return Some(format!("Api {} must be given the table it proxies to", self.api_name));
        }
        if self.stage_name.is_empty() || !self.stage_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Some(format!("Invalid stage name {:?}\nMust only contain [a-zA-Z0-9_]", self.stage_name));
        }
        if !(self.throttle.rate_limit > 0.0) {
            return Some(format!("Invalid throttle rate {}\nMust be greater than 0", self.throttle.rate_limit));
        }
        if self.cors_allow_origins.is_empty() {
            return Some("Must allow at least 1 CORS origin".to_string());
        }
        let has_wildcard = self.cors_allow_origins.iter().any(|o| o == "*");
        if has_wildcard && self.cors_allow_origins.len() > 1 {
            return Some("CORS origin '*' cannot be combined with other origins".to_string());
        }
        if let Some(origin) = self.cors_allow_origins.iter()
            .find(|o| *o != "*" && !o.starts_with("https://") && !o.starts_with("http://"))
        {
            return Some(format!("Invalid CORS origin {:?}\nMust start with http:// or https://", origin));
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outputs {
    pub logical_api_name: String,
    pub logical_stage_name: String,
    pub logical_deployment_name: String,
    pub logical_usage_plan_name: String,
    /// every method, including the CORS preflights.
    pub logical_method_names: Vec<String>,
    /// key of the stack output holding the invoke url.
    pub url_output_key: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CfnRestApi {
    pub name: String,
}

aws_cfn_stack::impl_cfn_resource!(CfnRestApi, "AWS::ApiGateway::RestApi");

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CfnApiResource {
    pub parent_id: StrVal,
    pub path_part: String,
    pub rest_api_id: StrVal,
}

aws_cfn_stack::impl_cfn_resource!(CfnApiResource, "AWS::ApiGateway::Resource");

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Integration {
    #[serde(rename = "Type")]
    pub integration_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integration_http_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub request_templates: BTreeMap<String, String>,
    pub integration_responses: Vec<IntegrationResponse>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MethodResponse {
    pub status_code: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub response_parameters: BTreeMap<String, bool>,
}

impl MethodResponse {
    fn status(status_code: &str) -> Self {
        Self { status_code: status_code.to_string(), response_parameters: BTreeMap::new() }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CfnMethod {
    pub rest_api_id: StrVal,
    pub resource_id: StrVal,
    pub http_method: String,
    pub authorization_type: String,
    pub integration: Integration,
    pub method_responses: Vec<MethodResponse>,
}

impl CfnResource for CfnMethod {
    fn type_string(&self) -> &'static str {
        "AWS::ApiGateway::Method"
    }
    fn properties(&self) -> Result<Value, serde_json::Error> {
        aws_cfn_stack::to_properties(self)
    }
    fn validate(&self) -> Result<(), String> {
        let declared: Vec<&str> = self.method_responses.iter().map(|r| r.status_code.as_str()).collect();
        match self.integration.integration_responses.iter().find(|r| !declared.contains(&r.status_code.as_str())) {
            Some(r) => Err(format!("{} integration responds with {} which the method does not declare", self.http_method, r.status_code)),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CfnDeployment {
    pub rest_api_id: StrVal,
    pub description: String,
}

aws_cfn_stack::impl_cfn_resource!(CfnDeployment, "AWS::ApiGateway::Deployment");

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CfnStage {
    pub rest_api_id: StrVal,
    pub deployment_id: StrVal,
    pub stage_name: String,
    pub method_settings: Vec<MethodSetting>,
}

/// stage level limits. unlike the usage plan these apply to every caller,
/// not only to requests carrying an api key.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MethodSetting {
    pub resource_path: String,
    pub http_method: String,
    pub throttling_burst_limit: u32,
    pub throttling_rate_limit: f64,
}

impl MethodSetting {
    pub fn every_method(throttle: Throttle) -> Self {
        Self {
            resource_path: "/*".to_string(),
            http_method: "*".to_string(),
            throttling_burst_limit: throttle.burst_limit,
            throttling_rate_limit: throttle.rate_limit,
        }
    }
}

aws_cfn_stack::impl_cfn_resource!(CfnStage, "AWS::ApiGateway::Stage");

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CfnUsagePlan {
    pub usage_plan_name: String,
    pub api_stages: Vec<Value>,
    pub throttle: Throttle,
}

aws_cfn_stack::impl_cfn_resource!(CfnUsagePlan, "AWS::ApiGateway::UsagePlan");

/// `arn:aws:apigateway:{region}:dynamodb:action/{action}`
pub fn dynamodb_action_uri(action: &str) -> Value {
    sub(&format!("arn:${{AWS::Partition}}:apigateway:${{AWS::Region}}:dynamodb:action/{action}"))
}

fn dynamodb_method(
    api: &str,
    resource_id: StrVal,
    http_method: &str,
    action: &str,
    role: &str,
    request_template: String,
    integration_responses: Vec<IntegrationResponse>,
) -> CfnMethod {
    CfnMethod {
        rest_api_id: get_ref(api).into(),
        resource_id,
        http_method: http_method.to_string(),
        authorization_type: "NONE".to_string(),
        integration: Integration {
            integration_type: "AWS".to_string(),
            integration_http_method: Some("POST".to_string()),
            uri: Some(dynamodb_action_uri(action)),
            credentials: Some(get_att(role, "Arn")),
            request_templates: BTreeMap::from([(JSON.to_string(), request_template)]),
            integration_responses,
        },
        method_responses: ["200", "400", "500"].into_iter().map(MethodResponse::status).collect(),
    }
}

/// answers the CORS preflight without calling anything.
pub fn preflight_method(api: &str, resource_id: StrVal, origins: &[String]) -> CfnMethod {
    let first_origin = origins.first().map(String::as_str).unwrap_or("*");
    let mut response_parameters = BTreeMap::from([
        ("method.response.header.Access-Control-Allow-Headers".to_string(), CORS_ALLOW_HEADERS.to_string()),
        ("method.response.header.Access-Control-Allow-Origin".to_string(), format!("'{first_origin}'")),
        ("method.response.header.Access-Control-Allow-Methods".to_string(), CORS_ALLOW_METHODS.to_string()),
    ]);
    if first_origin != "*" {
        response_parameters.insert("method.response.header.Vary".to_string(), "'Origin'".to_string());
    }
    let mut response = IntegrationResponse::status("204");
    if origins.len() > 1 {
        response = response.with_json_template(&templates::preflight_origin_template(origins));
    }
    response.response_parameters = response_parameters;
    let method_response = MethodResponse {
        status_code: "204".to_string(),
        response_parameters: response.response_parameters.keys().map(|k| (k.clone(), true)).collect(),
    };
    CfnMethod {
        rest_api_id: get_ref(api).into(),
        resource_id,
        http_method: "OPTIONS".to_string(),
        authorization_type: "NONE".to_string(),
        integration: Integration {
            integration_type: "MOCK".to_string(),
            integration_http_method: None,
            uri: None,
            credentials: None,
            request_templates: BTreeMap::from([(JSON.to_string(), "{ statusCode: 200 }".to_string())]),
            integration_responses: vec![response],
        },
        method_responses: vec![method_response],
    }
}

/// short fingerprint of everything a deployment snapshots. cloudformation
/// only creates a new deployment when the logical id changes.
fn deployment_fingerprint(methods: &[(String, Value)]) -> Result<String, Error> {
    let bytes = serde_json::to_vec(methods)?;
    Ok(format!("{:08x}", adler::adler32_slice(&bytes)))
}

pub fn config(input: &Input, stack: &mut aws_cfn_stack::Input) -> Result<Outputs, Error> {
    if let Some(err_msg) = input.is_valid() {
        return Err(Error::InvalidInput(err_msg));
    }
    let api = logical_name("Api", &input.api_name)?;
    stack.push(Resource::new(api.clone(), CfnRestApi { name: input.api_name.clone() }));

    let collection = logical_name(&format!("{api}Resource"), &input.model_name)?;
    stack.push(Resource::new(collection.clone(), CfnApiResource {
        parent_id: get_att(&api, "RootResourceId").into(),
        path_part: input.model_name.to_lowercase(),
        rest_api_id: get_ref(&api).into(),
    }));
    let item = format!("{collection}id");
    stack.push(Resource::new(item.clone(), CfnApiResource {
        parent_id: get_ref(&collection).into(),
        path_part: "{id}".to_string(),
        rest_api_id: get_ref(&api).into(),
    }));

    let table_arn = get_att(&input.table.logical_name, "Arn");
    let put_role = format!("{api}PutRole");
    let get_role = format!("{api}GetRole");
    for (role, action) in [(&put_role, "dynamodb:PutItem"), (&get_role, "dynamodb:GetItem")] {
        let statement = PolicyStatement::allow(&[action], vec![table_arn.clone()]);
        let role_resource = CfnRole::for_service("apigateway.amazonaws.com")
            .with_inline_policy(format!("{role}Policy"), &[statement]);
        stack.push(Resource::new(role.clone(), role_resource));
    }

    let methods: Vec<(String, CfnMethod)> = vec![
        (format!("{collection}POST"), dynamodb_method(
            &api, get_ref(&collection).into(), "POST", "PutItem", &put_role,
            put_item_template(&input.table), templates::put_integration_responses(),
        )),
        (format!("{item}GET"), dynamodb_method(
            &api, get_ref(&item).into(), "GET", "GetItem", &get_role,
            get_item_template(&input.table), templates::get_integration_responses(),
        )),
        (format!("{api}RootOPTIONS"), preflight_method(&api, get_att(&api, "RootResourceId").into(), &input.cors_allow_origins)),
        (format!("{collection}OPTIONS"), preflight_method(&api, get_ref(&collection).into(), &input.cors_allow_origins)),
        (format!("{item}OPTIONS"), preflight_method(&api, get_ref(&item).into(), &input.cors_allow_origins)),
    ];
    let snapshot = methods.iter()
        .map(|(name, m)| Ok((name.clone(), m.properties()?)))
        .collect::<Result<Vec<(String, Value)>, Error>>()?;
    let mut logical_method_names = Vec::with_capacity(methods.len());
    for (name, method) in methods {
        let mut resource = Resource::new(name.clone(), method);
        if !name.ends_with("OPTIONS") {
            // the request templates only name the table
            resource = resource.depends_on(input.table.logical_name.clone());
        }
        stack.push(resource);
        logical_method_names.push(name);
    }

    let deployment = format!("{api}Deployment{}", deployment_fingerprint(&snapshot)?);
    let mut deployment_resource = Resource::new(deployment.clone(), CfnDeployment {
        rest_api_id: get_ref(&api).into(),
        description: format!("{} deployment", input.api_name),
    });
    for name in logical_method_names.iter() {
        deployment_resource = deployment_resource.depends_on(name.clone());
    }
    stack.push(deployment_resource);

    let stage = logical_name(&format!("{api}Stage"), &input.stage_name)?;
    stack.push(Resource::new(stage.clone(), CfnStage {
        rest_api_id: get_ref(&api).into(),
        deployment_id: get_ref(&deployment).into(),
        stage_name: input.stage_name.clone(),
        method_settings: vec![MethodSetting::every_method(input.throttle)],
    }));

    let usage_plan = format!("{api}UsagePlan");
    stack.push(Resource::new(usage_plan.clone(), CfnUsagePlan {
        usage_plan_name: format!("{}-usage-plan", input.api_name),
        api_stages: vec![json!({ "ApiId": get_ref(&api), "Stage": get_ref(&stage) })],
        throttle: input.throttle,
    }));

    let url_output_key = format!("{api}Endpoint");
    stack.add_output(
        &url_output_key,
        &format!("invoke url of {}", input.api_name),
        sub(&format!("https://${{{api}}}.execute-api.${{AWS::Region}}.${{AWS::URLSuffix}}/${{{stage}}}/")),
    );

    Ok(Outputs {
        logical_api_name: api,
        logical_stage_name: stage,
        logical_deployment_name: deployment,
        logical_usage_plan_name: usage_plan,
        logical_method_names,
        url_output_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_cfn_stack::{graph, synthesize, SynthesizedStack};

    fn vote_api(stack: &mut aws_cfn_stack::Input) -> Outputs {
        let table = aws_dynamodb::config(&aws_dynamodb::Input { table_name: "choice".into(), ..Default::default() }, stack).unwrap();
        let input = Input {
            api_name: "mayoche-data-api".into(),
            model_name: "choice".into(),
            table,
            ..Default::default()
        };
        config(&input, stack).unwrap()
    }

    fn synth() -> (Outputs, SynthesizedStack) {
        let mut stack = aws_cfn_stack::Input::default();
        let out = vote_api(&mut stack);
        (out, synthesize(stack, "test").unwrap())
    }

    #[test]
    fn validation() {
        let valid = || Input {
            api_name: "api".into(),
            model_name: "choice".into(),
            table: TableRef { logical_name: "T".into(), table_name: "choice".into(), partition_key: "choiceId".into() },
            ..Default::default()
        };
        assert!(valid().is_valid().is_none());
        assert!(Input { model_name: "a/b".into(), ..valid() }.is_valid().is_some());
        assert!(Input { stage_name: "pr-od".into(), ..valid() }.is_valid().is_some());
        assert!(Input { table: TableRef::default(), ..valid() }.is_valid().is_some());
        assert!(Input { cors_allow_origins: vec!["*".into(), "https://a.com".into()], ..valid() }.is_valid().is_some());
        assert!(Input { cors_allow_origins: vec!["a.com".into()], ..valid() }.is_valid().is_some());
        assert!(Input { throttle: Throttle { burst_limit: 1, rate_limit: 0.0 }, ..valid() }.is_valid().is_some());
    }

    #[test]
    fn paths_and_integrations() {
        let (out, synth) = synth();
        let api = &out.logical_api_name;
        assert_eq!(api, "Apimayochedataapi");
        let collection = synth.resource("ApimayochedataapiResourcechoice").unwrap();
        assert_eq!(collection.properties["PathPart"], "choice");
        let item = synth.resource("ApimayochedataapiResourcechoiceid").unwrap();
        assert_eq!(item.properties["PathPart"], "{id}");

        let post = &synth.resource("ApimayochedataapiResourcechoicePOST").unwrap().properties;
        assert_eq!(post["Integration"]["Type"], "AWS");
        assert_eq!(post["Integration"]["Uri"]["Fn::Sub"], "arn:${AWS::Partition}:apigateway:${AWS::Region}:dynamodb:action/PutItem");
        assert_eq!(post["Integration"]["Credentials"]["Fn::GetAtt"][0], "ApimayochedataapiPutRole");
        assert_eq!(post["MethodResponses"].as_array().unwrap().len(), 3);

        let get = &synth.resource("ApimayochedataapiResourcechoiceidGET").unwrap().properties;
        assert_eq!(get["Integration"]["Uri"]["Fn::Sub"], "arn:${AWS::Partition}:apigateway:${AWS::Region}:dynamodb:action/GetItem");
        assert_eq!(get["Integration"]["IntegrationResponses"][2]["SelectionPattern"], "5\\d{2}");
    }

    #[test]
    fn roles_allow_a_single_action() {
        let (_, synth) = synth();
        for (role, action) in [("ApimayochedataapiPutRole", "dynamodb:PutItem"), ("ApimayochedataapiGetRole", "dynamodb:GetItem")] {
            let props = &synth.resource(role).unwrap().properties;
            assert_eq!(props["AssumeRolePolicyDocument"]["Statement"][0]["Principal"]["Service"], "apigateway.amazonaws.com");
            let statements = props["Policies"][0]["PolicyDocument"]["Statement"].as_array().unwrap();
            assert_eq!(statements.len(), 1);
            assert_eq!(statements[0]["Action"], json!([action]));
            assert_eq!(statements[0]["Resource"][0]["Fn::GetAtt"], json!(["Tablechoice", "Arn"]));
        }
    }

    #[test]
    fn preflight_on_every_path() {
        let (out, synth) = synth();
        let options: Vec<&String> = out.logical_method_names.iter().filter(|n| n.ends_with("OPTIONS")).collect();
        assert_eq!(options.len(), 3);
        for name in options {
            let props = &synth.resource(name).unwrap().properties;
            assert_eq!(props["Integration"]["Type"], "MOCK");
            let params = &props["Integration"]["IntegrationResponses"][0]["ResponseParameters"];
            assert_eq!(params["method.response.header.Access-Control-Allow-Origin"], "'*'");
            assert_eq!(props["MethodResponses"][0]["ResponseParameters"]["method.response.header.Access-Control-Allow-Origin"], true);
        }
    }

    #[test]
    fn multiple_origins_are_echoed_back() {
        let origins = vec!["https://new.mayoche.info".to_string(), "http://localhost:5173".to_string()];
        let method = preflight_method("Api", get_ref("R").into(), &origins);
        let response = &method.integration.integration_responses[0];
        assert_eq!(response.response_parameters["method.response.header.Access-Control-Allow-Origin"], "'https://new.mayoche.info'");
        assert_eq!(response.response_parameters["method.response.header.Vary"], "'Origin'");
        assert!(response.response_templates[JSON].contains("http://localhost:5173"));
    }

    #[test]
    fn ordering_edges() {
        let (out, synth) = synth();
        let deployment = synth.resource(&out.logical_deployment_name).unwrap();
        assert_eq!(deployment.depends_on.len(), out.logical_method_names.len());
        for method in out.logical_method_names.iter() {
            assert!(graph::depends_on(&synth.template, &out.logical_deployment_name, method));
        }
        assert!(graph::depends_on(&synth.template, "ApimayochedataapiResourcechoicePOST", "Tablechoice"));
        assert!(graph::depends_on(&synth.template, "ApimayochedataapiResourcechoiceidGET", "Tablechoice"));
        assert!(graph::depends_on(&synth.template, &out.logical_usage_plan_name, &out.logical_stage_name));
        let order = graph::creation_order(&synth.template).unwrap();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("Tablechoice") < pos(&out.logical_deployment_name));
        assert!(pos(&out.logical_stage_name) < pos(&out.logical_usage_plan_name));
    }

    #[test]
    fn throttled_prod_stage_and_url() {
        let (out, synth) = synth();
        assert_eq!(out.logical_stage_name, "ApimayochedataapiStageprod");
        let stage = &synth.resource(&out.logical_stage_name).unwrap().properties;
        assert_eq!(stage["StageName"], "prod");
        let settings = &stage["MethodSettings"][0];
        assert_eq!(settings["ResourcePath"], "/*");
        assert_eq!(settings["HttpMethod"], "*");
        assert_eq!(settings["ThrottlingBurstLimit"], 100);
        assert_eq!(settings["ThrottlingRateLimit"], 200.0);
        let plan = &synth.resource(&out.logical_usage_plan_name).unwrap().properties;
        assert_eq!(plan["Throttle"]["BurstLimit"], 100);
        assert_eq!(plan["Throttle"]["RateLimit"], 200.0);
        assert_eq!(plan["ApiStages"][0]["Stage"]["Ref"], "ApimayochedataapiStageprod");
        let url = &synth.template.outputs[&out.url_output_key].value;
        assert_eq!(url["Fn::Sub"], "https://${Apimayochedataapi}.execute-api.${AWS::Region}.${AWS::URLSuffix}/${ApimayochedataapiStageprod}/");
    }

    #[test]
    fn deployment_id_tracks_method_changes() {
        let (a, _) = synth();
        let (b, _) = synth();
        assert_eq!(a.logical_deployment_name, b.logical_deployment_name);

        let mut stack = aws_cfn_stack::Input::default();
        let table = aws_dynamodb::config(&aws_dynamodb::Input { table_name: "choice".into(), ..Default::default() }, &mut stack).unwrap();
        let input = Input {
            api_name: "mayoche-data-api".into(),
            model_name: "choice".into(),
            table,
            cors_allow_origins: vec!["https://new.mayoche.info".into()],
            ..Default::default()
        };
        let c = config(&input, &mut stack).unwrap();
        assert_ne!(a.logical_deployment_name, c.logical_deployment_name);
    }
}
