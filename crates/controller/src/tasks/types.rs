//! Shared controller types: error taxonomy and reconciler context

use crate::tasks::config::ControllerConfig;
use kube::Client;
use std::sync::Arc;
use thiserror::Error;

/// Finalizer placed on Tasks so their pod and context ConfigMap (which live
/// in the Agent's namespace and cannot carry a cross-namespace owner
/// reference) get cleaned up on Task deletion.
pub const TASK_FINALIZER_NAME: &str = "tasks.agents.platform/cleanup";

#[derive(Error, Debug)]
pub enum Error {
    /// Transient API-server failures: retried by the error policy, never
    /// surfaced as a Task failure
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Context resolution failed for the Task; terminal
    #[error("context resolution failed: {0}")]
    ResolutionError(String),

    /// The Task's namespace is not in the Agent's allow-list; terminal and
    /// never retried (security boundary, not a capacity boundary)
    #[error("namespace '{namespace}' is not authorized to use agent '{agent}'")]
    NotAuthorized { namespace: String, agent: String },

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("object has no name or namespace")]
    MissingObjectKey,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Errors that must reach terminal Task status instead of being retried
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::ResolutionError(_) | Error::NotAuthorized { .. }
        )
    }
}

/// Shared state handed to every reconcile invocation
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Controller configuration loaded at startup
    pub config: Arc<ControllerConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_error_classification() {
        assert!(Error::ResolutionError("missing ConfigMap".into()).is_terminal());
        assert!(Error::NotAuthorized {
            namespace: "team-a".into(),
            agent: "builder".into(),
        }
        .is_terminal());
        assert!(!Error::ConfigError("bad yaml".into()).is_terminal());
        assert!(!Error::MissingObjectKey.is_terminal());
    }

    #[test]
    fn test_not_authorized_message_names_the_boundary() {
        let err = Error::NotAuthorized {
            namespace: "team-a".into(),
            agent: "builder".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("team-a"));
        assert!(msg.contains("builder"));
        assert!(msg.contains("not authorized"));
    }
}
