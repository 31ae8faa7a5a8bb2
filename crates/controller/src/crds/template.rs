//! `TaskTemplate` Custom Resource Definition: a reusable partial Task spec

use super::task::{AgentRef, ContextItem};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// `TaskTemplate` CRD: never executed itself; merged under explicitly set
/// fields of a Task that references it (Task-level fields win, template
/// context items are prepended so Task items can shadow them).
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "agents.platform", version = "v1", kind = "TaskTemplate")]
#[kube(namespaced)]
#[kube(printcolumn = r#"{"name":"Agent","type":"string","jsonPath":".spec.agentRef.name"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct TaskTemplateSpec {
    /// Default Agent for Tasks built from this template
    #[serde(default, rename = "agentRef", skip_serializing_if = "Option::is_none")]
    pub agent_ref: Option<AgentRef>,

    /// Default instruction payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Context items prepended to the Task's own
    #[serde(default)]
    pub context: Vec<ContextItem>,
}
