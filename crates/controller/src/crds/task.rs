//! `Task` Custom Resource Definition: a single declarative agent execution request

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation whose presence requests cancellation of a `Task`
pub const STOP_ANNOTATION: &str = "agents.platform/stop";

/// Annotation patched onto Pending peers when an admission slot frees up.
/// The patch generates a watch event, which is how a terminal Task wakes
/// the other Tasks competing for the same Agent.
pub const REQUEUE_ANNOTATION: &str = "agents.platform/requeued-at";

/// Reference to the Agent that should execute a Task
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct AgentRef {
    /// Name of the Agent resource
    pub name: String,
    /// Namespace of the Agent (defaults to the Task's own namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl AgentRef {
    /// Namespace the Agent lives in, given the namespace of the referencing Task
    pub fn namespace_or<'a>(&'a self, task_namespace: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(task_namespace)
    }
}

fn default_revision() -> String {
    "main".to_string()
}

/// One declared input artifact, resolved into mounted file content at
/// reconciliation time. Later items may deliberately re-declare an earlier
/// item's path to shadow it.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ContextItem {
    /// Literal inline file content
    #[serde(rename_all = "camelCase")]
    Text {
        /// Relative path within the workspace
        path: String,
        /// File content
        content: String,
    },

    /// Content fetched from a ConfigMap in the Task's namespace
    #[serde(rename = "configMap", rename_all = "camelCase")]
    ConfigMapRef {
        /// Relative path (file path when `key` is set, directory otherwise)
        path: String,
        /// Name of the ConfigMap
        name: String,
        /// Single key to project; absent means every key in the data map
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },

    /// Shallow git checkout, realized by the pod's init container
    #[serde(rename_all = "camelCase")]
    GitRepo {
        /// Relative directory the checkout lands in
        path: String,
        /// Clone URL
        repository: String,
        /// Branch or tag to check out
        #[serde(default = "default_revision")]
        revision: String,
    },

    /// Values computed from the Task's own observed state. Pure and
    /// deterministic for a given Task so reconciliation stays idempotent.
    #[serde(rename_all = "camelCase")]
    Runtime {
        /// Relative path of the rendered JSON file
        path: String,
    },

    /// Remote file fetched by the pod's init container with bounded retries
    #[serde(rename = "url", rename_all = "camelCase")]
    Url {
        /// Relative path the body is written to
        path: String,
        /// HTTP(S) source
        url: String,
    },
}

impl ContextItem {
    /// The path the item declares, before resolution
    pub fn declared_path(&self) -> &str {
        match self {
            ContextItem::Text { path, .. }
            | ContextItem::ConfigMapRef { path, .. }
            | ContextItem::GitRepo { path, .. }
            | ContextItem::Runtime { path }
            | ContextItem::Url { path, .. } => path,
        }
    }

    /// Stable variant name used in collision diagnostics
    pub fn variant(&self) -> &'static str {
        match self {
            ContextItem::Text { .. } => "text",
            ContextItem::ConfigMapRef { .. } => "configMap",
            ContextItem::GitRepo { .. } => "gitRepo",
            ContextItem::Runtime { .. } => "runtime",
            ContextItem::Url { .. } => "url",
        }
    }
}

/// `Task` CRD: one execution request, driven through its lifecycle by the
/// task controller
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "agents.platform", version = "v1", kind = "Task")]
#[kube(namespaced)]
#[kube(status = "TaskStatus")]
#[kube(printcolumn = r#"{"name":"Agent","type":"string","jsonPath":".spec.agentRef.name"}"#)]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Pod","type":"string","jsonPath":".status.podName"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct TaskSpec {
    /// Agent that executes this Task
    #[serde(rename = "agentRef")]
    pub agent_ref: AgentRef,

    /// TaskTemplate in the Task's namespace merged under explicitly set fields
    #[serde(default, rename = "templateRef", skip_serializing_if = "Option::is_none")]
    pub template_ref: Option<String>,

    /// Free-text instruction payload, staged as a file for the worker
    #[serde(default)]
    pub description: String,

    /// Ordered context declarations resolved into workspace files
    #[serde(default)]
    pub context: Vec<ContextItem>,
}

/// Lifecycle phase of a `Task`. Transitions only move forward; `Stopped` is
/// the sole universal override.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum TaskPhase {
    Pending,
    Admitted,
    ContextResolving,
    PodCreating,
    Running,
    Succeeded,
    Failed,
    Stopped,
}

impl TaskPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskPhase::Succeeded | TaskPhase::Failed | TaskPhase::Stopped
        )
    }

    /// Whether this phase currently holds an admission slot on its Agent
    pub fn holds_slot(self) -> bool {
        matches!(
            self,
            TaskPhase::Admitted
                | TaskPhase::ContextResolving
                | TaskPhase::PodCreating
                | TaskPhase::Running
        )
    }

    /// Legal forward transitions of the state machine. `Stopped` is reachable
    /// from every non-terminal phase; `Failed` from every phase that can
    /// still encounter an error.
    pub fn allows(self, next: TaskPhase) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        if next == TaskPhase::Stopped {
            return true;
        }
        match self {
            TaskPhase::Pending => matches!(next, TaskPhase::Admitted | TaskPhase::Failed),
            TaskPhase::Admitted => {
                matches!(next, TaskPhase::ContextResolving | TaskPhase::Failed)
            }
            TaskPhase::ContextResolving => {
                matches!(next, TaskPhase::PodCreating | TaskPhase::Failed)
            }
            TaskPhase::PodCreating => matches!(next, TaskPhase::Running | TaskPhase::Failed),
            TaskPhase::Running => matches!(next, TaskPhase::Succeeded | TaskPhase::Failed),
            TaskPhase::Succeeded | TaskPhase::Failed | TaskPhase::Stopped => false,
        }
    }
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskPhase::Pending => "Pending",
            TaskPhase::Admitted => "Admitted",
            TaskPhase::ContextResolving => "ContextResolving",
            TaskPhase::PodCreating => "PodCreating",
            TaskPhase::Running => "Running",
            TaskPhase::Succeeded => "Succeeded",
            TaskPhase::Failed => "Failed",
            TaskPhase::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

/// Status of the `Task`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct TaskStatus {
    /// Current lifecycle phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<TaskPhase>,

    /// Human-readable cause for the current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Name of the execution pod, once created
    #[serde(default, rename = "podName", skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,

    /// Namespace the execution pod was created in (the Agent's namespace)
    #[serde(default, rename = "podNamespace", skip_serializing_if = "Option::is_none")]
    pub pod_namespace: Option<String>,

    /// Timestamp the pod was created (RFC3339)
    #[serde(default, rename = "startTime", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    /// Timestamp the Task reached a terminal phase (RFC3339)
    #[serde(
        default,
        rename = "completionTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub completion_time: Option<String>,

    /// Captured tail of the worker container's output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    /// Set when `output` was cut at the capture cap
    #[serde(
        default,
        rename = "outputTruncated",
        skip_serializing_if = "Option::is_none"
    )]
    pub output_truncated: Option<bool>,

    /// Consecutive admission deferrals, drives the backoff exponent
    #[serde(
        default,
        rename = "deferralCount",
        skip_serializing_if = "Option::is_none"
    )]
    pub deferral_count: Option<u32>,

    /// Timestamp of the last status write (RFC3339)
    #[serde(default, rename = "lastUpdate", skip_serializing_if = "Option::is_none")]
    pub last_update: Option<String>,
}

impl Task {
    /// Phase as currently observed, `Pending` when status was never written
    pub fn phase(&self) -> TaskPhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .unwrap_or(TaskPhase::Pending)
    }

    /// Whether the stop annotation is present
    pub fn stop_requested(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(STOP_ANNOTATION))
    }
}
