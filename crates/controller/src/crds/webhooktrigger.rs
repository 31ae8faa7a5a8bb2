//! `WebhookTrigger` Custom Resource Definition: an HTTP route that produces Tasks

use super::task::AgentRef;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

fn default_required() -> bool {
    true
}

/// Maps one field of the inbound payload into a Text context item
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct PayloadMapping {
    /// Relative workspace path the extracted value is written to
    pub path: String,

    /// JSON pointer into the payload (e.g. "/commit/sha")
    pub field: String,

    /// Whether a missing field rejects the request
    #[serde(default = "default_required")]
    pub required: bool,
}

/// `WebhookTrigger` CRD: registered with the router on create/update and
/// deregistered on delete. The router's live route table is a derived cache;
/// the set of these resources is the source of truth.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "agents.platform", version = "v1", kind = "WebhookTrigger")]
#[kube(namespaced)]
#[kube(printcolumn = r#"{"name":"Agent","type":"string","jsonPath":".spec.agentRef.name"}"#)]
#[kube(printcolumn = r#"{"name":"Template","type":"string","jsonPath":".spec.templateRef"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct WebhookTriggerSpec {
    /// Agent the created Tasks reference (may come from the template instead)
    #[serde(default, rename = "agentRef", skip_serializing_if = "Option::is_none")]
    pub agent_ref: Option<AgentRef>,

    /// TaskTemplate (in the trigger's namespace) the created Tasks expand
    #[serde(default, rename = "templateRef", skip_serializing_if = "Option::is_none")]
    pub template_ref: Option<String>,

    /// Instruction payload for the created Tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Prefix for generated Task names (defaults to the trigger name)
    #[serde(
        default,
        rename = "taskNamePrefix",
        skip_serializing_if = "Option::is_none"
    )]
    pub task_name_prefix: Option<String>,

    /// Payload fields turned into context items of the created Task
    #[serde(default, rename = "contextMappings")]
    pub context_mappings: Vec<PayloadMapping>,
}

impl WebhookTriggerSpec {
    /// A deliverable trigger must lead to an Agent, either directly or
    /// through its template. Checked at dispatch so a misconfigured trigger
    /// rejects requests instead of minting Tasks that can never run.
    pub fn validate(&self) -> Result<(), String> {
        let names_agent = self.agent_ref.as_ref().is_some_and(|r| !r.name.is_empty());
        if !names_agent && self.template_ref.is_none() {
            return Err("trigger sets neither agentRef nor templateRef".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_must_name_an_agent_or_a_template() {
        assert!(WebhookTriggerSpec::default().validate().is_err());

        let empty_name = WebhookTriggerSpec {
            agent_ref: Some(AgentRef {
                name: String::new(),
                namespace: None,
            }),
            ..WebhookTriggerSpec::default()
        };
        assert!(empty_name.validate().is_err());

        let by_agent = WebhookTriggerSpec {
            agent_ref: Some(AgentRef {
                name: "builder".into(),
                namespace: None,
            }),
            ..WebhookTriggerSpec::default()
        };
        assert!(by_agent.validate().is_ok());

        let by_template = WebhookTriggerSpec {
            template_ref: Some("ci".into()),
            ..WebhookTriggerSpec::default()
        };
        assert!(by_template.validate().is_ok());
    }
}
