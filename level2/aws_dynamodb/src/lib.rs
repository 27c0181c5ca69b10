use aws_cfn_stack::{logical_name, Error, Resource};
use serde::Serialize;

pub struct Input {
    /// physical name of the table.
    pub table_name: String,
    /// string partition key. if empty, defaults to `{table_name}Id`.
    pub partition_key: String,
    /// keep the table (and its data) when the stack is deleted or the
    /// table gets replaced. Defaults to true.
    pub retain: bool,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            table_name: String::new(),
            partition_key: String::new(),
            retain: true,
        }
    }
}

/// everything other modules need to talk to the table.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub logical_name: String,
    pub table_name: String,
    pub partition_key: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AttributeDefinition {
    pub attribute_name: String,
    pub attribute_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeySchema {
    pub attribute_name: String,
    pub key_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CfnTable {
    pub table_name: String,
    pub attribute_definitions: Vec<AttributeDefinition>,
    pub key_schema: Vec<KeySchema>,
    pub billing_mode: String,
}

impl aws_cfn_stack::CfnResource for CfnTable {
    fn type_string(&self) -> &'static str {
        "AWS::DynamoDB::Table"
    }
    fn properties(&self) -> Result<serde_json::Value, serde_json::Error> {
        aws_cfn_stack::to_properties(self)
    }
    fn validate(&self) -> Result<(), String> {
        let valid_chars = |s: &str| s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if self.table_name.len() < 3 || self.table_name.len() > 255 || !valid_chars(&self.table_name) {
            return Err(format!("Invalid table name {:?}\nMust be 3-255 characters of [a-zA-Z0-9_.-]", self.table_name));
        }
        Ok(())
    }
}

pub fn config(input: &Input, stack: &mut aws_cfn_stack::Input) -> Result<TableRef, Error> {
    let partition_key = if input.partition_key.is_empty() {
        format!("{}Id", input.table_name)
    } else {
        input.partition_key.clone()
    };
    let table = CfnTable {
        table_name: input.table_name.clone(),
        attribute_definitions: vec![AttributeDefinition {
            attribute_name: partition_key.clone(),
            attribute_type: "S".to_string(),
        }],
        key_schema: vec![KeySchema {
            attribute_name: partition_key.clone(),
            key_type: "HASH".to_string(),
        }],
        billing_mode: "PAY_PER_REQUEST".to_string(),
    };
    let logical = logical_name("Table", &input.table_name)?;
    let mut resource = Resource::new(logical.clone(), table);
    if input.retain {
        resource = resource.retained();
    }
    stack.push(resource);
    Ok(TableRef {
        logical_name: logical,
        table_name: input.table_name.clone(),
        partition_key,
    })
}
