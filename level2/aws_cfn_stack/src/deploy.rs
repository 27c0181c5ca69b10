use std::collections::HashMap;

use aws_sdk_cloudformation::types::{Capability, OnFailure, Stack, StackStatus};
use aws_sdk_cloudformation::Client;
use tracing::{debug, info};

use crate::{Error, Region, SynthesizedStack};

const POLL_INTERVAL_MS: u64 = 700;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackState {
    Complete,
    InProgress,
    /// an update failed and was rolled back. the previous
    /// version of the stack is still live.
    RolledBack,
    Failed(String),
}

pub fn classify(status: &StackStatus, reason: Option<&str>) -> StackState {
    match status {
        // done and return success:
        StackStatus::CreateComplete
        | StackStatus::UpdateComplete
        | StackStatus::DeleteComplete
        | StackStatus::ImportComplete => StackState::Complete,

        StackStatus::UpdateRollbackComplete
        | StackStatus::ImportRollbackComplete => StackState::RolledBack,

        // keep trying
        StackStatus::CreateInProgress
        | StackStatus::DeleteInProgress
        | StackStatus::ImportInProgress
        | StackStatus::ImportRollbackInProgress
        | StackStatus::ReviewInProgress
        | StackStatus::RollbackInProgress
        | StackStatus::UpdateCompleteCleanupInProgress
        | StackStatus::UpdateInProgress
        | StackStatus::UpdateRollbackCompleteCleanupInProgress
        | StackStatus::UpdateRollbackInProgress => StackState::InProgress,

        _ => StackState::Failed(reason.unwrap_or("Failed to get stack failure reason").to_string()),
    }
}

pub async fn load_sdk_config(region: &Region) -> aws_config::SdkConfig {
    aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(region.to_string()))
        .load()
        .await
}

fn deploy_error(stack: &str, reason: impl Into<String>) -> Error {
    Error::Deploy { stack: stack.to_string(), reason: reason.into() }
}

pub async fn does_stack_exist(client: &Client, name: &str) -> Result<bool, Error> {
    match client.describe_stacks().stack_name(name).send().await {
        Ok(_) => Ok(true),
        Err(e) => {
            let e_str = format!("{:?}", e);
            if e_str.contains("does not exist") {
                return Ok(false);
            }
            Err(deploy_error(name, e_str))
        }
    }
}

pub async fn describe_stack(client: &Client, name: &str) -> Result<Stack, Error> {
    let resp = client.describe_stacks().stack_name(name).send().await
        .map_err(|e| deploy_error(name, format!("{:?}", e)))?;
    resp.stacks().first().cloned()
        .ok_or_else(|| deploy_error(name, format!("Stack {name} not found")))
}

pub fn stack_outputs(stack: &Stack) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for output in stack.outputs() {
        if let (Some(key), Some(val)) = (output.output_key(), output.output_value()) {
            out.insert(key.to_string(), val.to_string());
        }
    }
    out
}

/// polls until the stack settles, then returns its outputs.
pub async fn wait_for_output(client: &Client, name: &str) -> Result<HashMap<String, String>, Error> {
    loop {
        tokio::time::sleep(tokio::time::Duration::from_millis(POLL_INTERVAL_MS)).await;
        let stack = describe_stack(client, name).await?;
        let Some(status) = stack.stack_status() else {
            return Err(deploy_error(name, format!("Stack {name} not found")));
        };
        match classify(status, stack.stack_status_reason()) {
            StackState::InProgress => debug!(stack = name, status = status.as_str(), "still waiting"),
            StackState::Complete => return Ok(stack_outputs(&stack)),
            StackState::RolledBack => {
                return Err(deploy_error(name, stack.stack_status_reason().unwrap_or("update was rolled back")));
            }
            StackState::Failed(reason) => return Err(deploy_error(name, reason)),
        }
    }
}

/// returns false if the stack already matched the template.
pub async fn create_or_update_stack(client: &Client, name: &str, body: &str) -> Result<bool, Error> {
    if does_stack_exist(client, name).await? {
        info!(stack = name, "updating stack");
        let res = client
            .update_stack()
            .capabilities(Capability::CapabilityNamedIam)
            .capabilities(Capability::CapabilityIam)
            .stack_name(name)
            .template_body(body)
            .send()
            .await;
        if let Err(e) = res {
            let e_str = format!("{:?}", e);
            if e_str.contains("No updates are to be performed") {
                info!(stack = name, "stack is already up to date");
                return Ok(false);
            }
            return Err(deploy_error(name, e_str));
        }
    } else {
        info!(stack = name, "creating stack");
        client
            .create_stack()
            .on_failure(OnFailure::Delete)
            .capabilities(Capability::CapabilityNamedIam)
            .capabilities(Capability::CapabilityIam)
            .stack_name(name)
            .template_body(body)
            .send()
            .await
            .map_err(|e| deploy_error(name, format!("{:?}", e)))?;
    }
    Ok(true)
}

/// creates or updates the stack and waits for it to settle.
pub async fn deploy(client: &Client, stack: &SynthesizedStack) -> Result<HashMap<String, String>, Error> {
    let body = stack.to_json_pretty()?;
    let changed = create_or_update_stack(client, &stack.name, &body).await?;
    let outputs = if changed {
        wait_for_output(client, &stack.name).await?
    } else {
        stack_outputs(&describe_stack(client, &stack.name).await?)
    };
    info!(stack = %stack.name, outputs = outputs.len(), "stack deployed");
    Ok(outputs)
}
