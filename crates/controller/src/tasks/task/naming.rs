//! Deterministic resource naming
//!
//! Pod and ConfigMap names derive purely from the Task's identity so a
//! reconciler that crashes between admission and creation finds the same
//! name on re-entry and never produces a second pod.

use crate::crds::Task;
use kube::ResourceExt;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const MAX_K8S_NAME_LENGTH: usize = 63;
const POD_PREFIX: &str = "task-";
const CONTEXT_CONFIGMAP_SUFFIX: &str = "-ctx";

pub struct ResourceNaming;

impl ResourceNaming {
    /// Execution pod name: `task-{namespace}-{name}-{uid8}`, 63-char safe.
    /// This is the single source of truth for pod names.
    pub fn pod_name(task: &Task) -> String {
        let namespace = task.namespace().unwrap_or_else(|| "default".to_string());
        let name = task.name_any();
        let uid_suffix = task
            .metadata
            .uid
            .as_deref()
            .map(|uid| &uid[..uid.len().min(8)])
            .unwrap_or("unknown");

        let base = format!("{namespace}-{name}-{uid_suffix}");
        let available = MAX_K8S_NAME_LENGTH.saturating_sub(POD_PREFIX.len());
        format!("{POD_PREFIX}{}", Self::ensure_length(&base, available))
    }

    /// Context ConfigMap name, derived from the pod name
    pub fn context_configmap_name(task: &Task) -> String {
        let pod = Self::pod_name(task);
        let available = MAX_K8S_NAME_LENGTH - CONTEXT_CONFIGMAP_SUFFIX.len();
        format!(
            "{}{CONTEXT_CONFIGMAP_SUFFIX}",
            Self::ensure_length(&pod, available)
        )
    }

    /// Sanitize an arbitrary string into a DNS-1123-safe label value
    pub fn sanitize_label(value: &str) -> String {
        let mut out: String = value
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        out.truncate(MAX_K8S_NAME_LENGTH);
        out.trim_matches(|c| c == '-' || c == '_' || c == '.')
            .to_string()
    }

    // Long names keep a hashed suffix so distinct inputs stay distinct
    fn ensure_length(name: &str, limit: usize) -> String {
        if name.len() <= limit {
            name.to_string()
        } else {
            let hash = Self::hash_string(name);
            let keep = limit.saturating_sub(hash.len() + 1);
            format!("{}-{hash}", &name[..keep])
        }
    }

    fn hash_string(input: &str) -> String {
        let mut hasher = DefaultHasher::new();
        input.hash(&mut hasher);
        format!("{:x}", hasher.finish() & 0xffff_ffff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{AgentRef, TaskSpec};

    fn task(name: &str, namespace: &str, uid: &str) -> Task {
        let mut task = Task::new(
            name,
            TaskSpec {
                agent_ref: AgentRef {
                    name: "builder".into(),
                    namespace: None,
                },
                template_ref: None,
                description: String::new(),
                context: Vec::new(),
            },
        );
        task.metadata.namespace = Some(namespace.into());
        task.metadata.uid = Some(uid.into());
        task
    }

    #[test]
    fn test_pod_name_is_deterministic() {
        let t = task("deploy-docs", "team-a", "0a1b2c3d-0000-0000");
        assert_eq!(ResourceNaming::pod_name(&t), ResourceNaming::pod_name(&t));
        assert_eq!(ResourceNaming::pod_name(&t), "task-team-a-deploy-docs-0a1b2c3d");
    }

    #[test]
    fn test_distinct_tasks_get_distinct_names() {
        let a = task("job", "team-a", "11111111-x");
        let b = task("job", "team-b", "22222222-x");
        assert_ne!(ResourceNaming::pod_name(&a), ResourceNaming::pod_name(&b));
    }

    #[test]
    fn test_long_names_stay_within_k8s_limit() {
        let long = "x".repeat(120);
        let t = task(&long, "really-long-namespace-name", "abcdef01-x");
        let pod = ResourceNaming::pod_name(&t);
        let cm = ResourceNaming::context_configmap_name(&t);
        assert!(pod.len() <= 63, "pod name too long: {}", pod.len());
        assert!(cm.len() <= 63, "cm name too long: {}", cm.len());
        assert!(cm.ends_with("-ctx"));

        // Hashed truncation still separates distinct inputs
        let other = task(&format!("{long}z"), "really-long-namespace-name", "abcdef01-x");
        assert_ne!(pod, ResourceNaming::pod_name(&other));
    }

    #[test]
    fn test_sanitize_label() {
        assert_eq!(ResourceNaming::sanitize_label("Team/A B"), "Team-A-B");
        assert_eq!(ResourceNaming::sanitize_label("--x--"), "x");
    }
}
