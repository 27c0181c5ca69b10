//! request/response mapping templates. API gateway renders these with
//! VTL before calling dynamodb, so no compute sits between the two.

use std::collections::BTreeMap;

use aws_dynamodb::TableRef;
use serde::Serialize;

pub const JSON: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct IntegrationResponse {
    pub status_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_pattern: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub response_templates: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub response_parameters: BTreeMap<String, String>,
}

impl IntegrationResponse {
    pub fn status(status_code: &str) -> Self {
        Self {
            status_code: status_code.to_string(),
            selection_pattern: None,
            response_templates: BTreeMap::new(),
            response_parameters: BTreeMap::new(),
        }
    }

    pub fn with_json_template(mut self, template: &str) -> Self {
        self.response_templates.insert(JSON.to_string(), template.to_string());
        self
    }

    pub fn selected_by(mut self, pattern: &str) -> Self {
        self.selection_pattern = Some(pattern.to_string());
        self
    }
}

/// writes one vote. the item id is the request id, so every call creates
/// a new item and retries are never deduplicated.
pub fn put_item_template(table: &TableRef) -> String {
    let TableRef { table_name, partition_key, .. } = table;
    format!(r#"{{
              "Item": {{
                "{partition_key}": {{
                  "S": "$context.requestId"
                }},
                "Animal": {{
                  "S": "$input.path('$.animal')"
                }},
                "CreatedAt": {{
                  "S": "$context.requestTime"
                }},
                "Description": {{
                  "S": "$input.path('$.description')"
                }},
                "Name": {{
                  "S": "$input.path('$.name')"
                }},
                "type": {{
                  "S": "vote"
                }}
              }},
              "TableName": "{table_name}"
            }}"#)
}

/// reads one vote by the `{id}` path parameter.
pub fn get_item_template(table: &TableRef) -> String {
    let TableRef { table_name, partition_key, .. } = table;
    format!(r#"{{
              "Key": {{
                "{partition_key}": {{
                  "S": "$method.request.path.id"
                }}
              }},
              "TableName": "{table_name}"
            }}"#)
}

pub const PUT_RESPONSE_TEMPLATE: &str = r#"{
                "requestId": "$context.requestId"
              }"#;

pub const BAD_INPUT_TEMPLATE: &str = r#"{
            "error": "Bad input!"
          }"#;

pub const SERVICE_ERROR_TEMPLATE: &str = r#"{
            "error": "Internal Service Error!"
          }"#;

/// upstream 400 -> 400 with a generic message, any 5xx -> 500.
pub fn error_responses() -> Vec<IntegrationResponse> {
    vec![
        IntegrationResponse::status("400").selected_by("400").with_json_template(BAD_INPUT_TEMPLATE),
        IntegrationResponse::status("500").selected_by("5\\d{2}").with_json_template(SERVICE_ERROR_TEMPLATE),
    ]
}

/// a GetItem for a missing key succeeds with `{}`, which falls through the
/// 200 response untouched. Callers cannot tell "missing" from "empty".
pub fn get_integration_responses() -> Vec<IntegrationResponse> {
    let mut out = vec![IntegrationResponse::status("200")];
    out.extend(error_responses());
    out
}

pub fn put_integration_responses() -> Vec<IntegrationResponse> {
    let mut out = vec![IntegrationResponse::status("200").with_json_template(PUT_RESPONSE_TEMPLATE)];
    out.extend(error_responses());
    out
}

/// overrides the allowed origin header with the caller's origin when it is
/// one of `origins`. only needed when more than one origin is allowed.
pub fn preflight_origin_template(origins: &[String]) -> String {
    let condition = origins.iter()
        .map(|o| format!("$origin == \"{o}\""))
        .collect::<Vec<_>>()
        .join(" || ");
    format!(r#"#set($origin = $input.params().header.get("Origin"))
#if($origin == "") #set($origin = $input.params().header.get("origin")) #end
#if({condition})
  #set($context.responseOverride.header.Access-Control-Allow-Origin = $origin)
#end"#)
}
