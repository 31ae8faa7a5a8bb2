//! `Agent` Custom Resource Definition: a reusable execution profile

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reference to a key within a Secret
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct SecretKeyRef {
    /// Name of the Secret
    pub name: String,
    /// Key within the Secret
    pub key: String,
}

/// Default file mode for mounted credentials: owner read-only
pub const DEFAULT_CREDENTIAL_FILE_MODE: i32 = 0o400;

/// One credential projected into the worker container, either as an
/// environment variable or as a mounted file. `env` and `mountPath` are
/// mutually exclusive per entry.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct CredentialSpec {
    /// Identifier, used for volume naming
    pub name: String,

    /// Secret the credential value comes from
    #[serde(rename = "secretRef")]
    pub secret_ref: SecretKeyRef,

    /// Environment variable to project the value into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,

    /// File path to mount the value at
    #[serde(default, rename = "mountPath", skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,

    /// Mode of the mounted file (ignored for env projection)
    #[serde(default, rename = "fileMode", skip_serializing_if = "Option::is_none")]
    pub file_mode: Option<i32>,
}

impl CredentialSpec {
    /// Effective file mode, falling back to the restrictive default
    pub fn effective_file_mode(&self) -> i32 {
        self.file_mode.unwrap_or(DEFAULT_CREDENTIAL_FILE_MODE)
    }

    /// Entries must project to exactly one of env or mountPath
    pub fn validate(&self) -> Result<(), String> {
        match (&self.env, &self.mount_path) {
            (Some(_), Some(_)) => Err(format!(
                "credential '{}' sets both env and mountPath",
                self.name
            )),
            (None, None) => Err(format!(
                "credential '{}' sets neither env nor mountPath",
                self.name
            )),
            _ => Ok(()),
        }
    }
}

/// One scheduling toleration, mirrored verbatim onto the pod
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema, Default)]
pub struct TolerationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
}

/// Pod-level overrides applied to every execution pod of an Agent
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct PodOverrides {
    /// Extra labels merged onto the pod metadata
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Node selector applied verbatim
    #[serde(default, rename = "nodeSelector", skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Tolerations applied verbatim
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<TolerationSpec>,

    /// Runtime class applied verbatim
    #[serde(
        default,
        rename = "runtimeClassName",
        skip_serializing_if = "Option::is_none"
    )]
    pub runtime_class_name: Option<String>,
}

fn default_workspace_dir() -> String {
    "/workspace".to_string()
}

/// `Agent` CRD: images, credentials, quota and namespace policy shared by
/// every Task that references it. Quota accounting is derived by listing
/// Tasks, never stored here, so there is nothing to drift after a restart.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "agents.platform", version = "v1", kind = "Agent")]
#[kube(namespaced)]
#[kube(printcolumn = r#"{"name":"MaxTasks","type":"integer","jsonPath":".spec.maxConcurrentTasks"}"#)]
#[kube(printcolumn = r#"{"name":"Worker","type":"string","jsonPath":".spec.executorImage"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct AgentSpec {
    /// Directory the shared workspace volume is mounted at
    #[serde(default = "default_workspace_dir", rename = "workspaceDir")]
    pub workspace_dir: String,

    /// ServiceAccount for the execution pods
    #[serde(
        default,
        rename = "serviceAccountName",
        skip_serializing_if = "Option::is_none"
    )]
    pub service_account_name: Option<String>,

    /// Init-container image that stages the toolchain and realizes deferred
    /// context fetches. When only this image is set it is treated as the
    /// legacy single-image form: worker image, default init.
    #[serde(default, rename = "agentImage", skip_serializing_if = "Option::is_none")]
    pub agent_image: Option<String>,

    /// Worker-container image the task actually executes in
    #[serde(
        default,
        rename = "executorImage",
        skip_serializing_if = "Option::is_none"
    )]
    pub executor_image: Option<String>,

    /// Credentials projected into the worker container
    #[serde(default)]
    pub credentials: Vec<CredentialSpec>,

    /// Concurrency ceiling across all referencing Tasks; 0 or absent means
    /// unbounded
    #[serde(
        default,
        rename = "maxConcurrentTasks",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_concurrent_tasks: Option<i64>,

    /// Glob patterns of namespaces allowed to reference this Agent; empty
    /// means any namespace
    #[serde(
        default,
        rename = "allowedNamespaces",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub allowed_namespaces: Vec<String>,

    /// Pod-level overrides
    #[serde(default, rename = "podSpec", skip_serializing_if = "Option::is_none")]
    pub pod_spec: Option<PodOverrides>,
}

impl AgentSpec {
    /// Whether the quota is a real ceiling (positive) or unbounded
    pub fn quota_limit(&self) -> Option<i64> {
        match self.max_concurrent_tasks {
            Some(n) if n > 0 => Some(n),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(env: Option<&str>, mount: Option<&str>) -> CredentialSpec {
        CredentialSpec {
            name: "api-key".into(),
            secret_ref: SecretKeyRef {
                name: "agent-secrets".into(),
                key: "api-key".into(),
            },
            env: env.map(String::from),
            mount_path: mount.map(String::from),
            file_mode: None,
        }
    }

    #[test]
    fn test_credential_projection_is_mutually_exclusive() {
        assert!(credential(Some("API_KEY"), None).validate().is_ok());
        assert!(credential(None, Some("/creds/key")).validate().is_ok());
        assert!(credential(Some("API_KEY"), Some("/creds/key"))
            .validate()
            .is_err());
        assert!(credential(None, None).validate().is_err());
    }

    #[test]
    fn test_default_file_mode_is_restrictive() {
        let cred = credential(None, Some("/creds/key"));
        assert_eq!(cred.effective_file_mode(), 0o400);

        let mut explicit = credential(None, Some("/creds/key"));
        explicit.file_mode = Some(0o640);
        assert_eq!(explicit.effective_file_mode(), 0o640);
    }

    #[test]
    fn test_quota_limit_treats_zero_as_unbounded() {
        let mut spec: AgentSpec = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(spec.quota_limit(), None);
        spec.max_concurrent_tasks = Some(0);
        assert_eq!(spec.quota_limit(), None);
        spec.max_concurrent_tasks = Some(3);
        assert_eq!(spec.quota_limit(), Some(3));
    }

    #[test]
    fn test_workspace_dir_default() {
        let spec: AgentSpec = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(spec.workspace_dir, "/workspace");
    }
}
