//! Execution pod materialization
//!
//! Turns a resolved Task + its Agent into a per-Task context ConfigMap and a
//! two-container pod in the Agent's namespace. Creating the pod in the
//! Agent's namespace (never the Task's) is what keeps credentials isolated
//! under cross-namespace Task/Agent separation.

use super::context::{ContextSource, ResolvedFile};
use super::naming::ResourceNaming;
use crate::crds::{Agent, CredentialSpec, Task};
use crate::tasks::config::ControllerConfig;
use crate::tasks::types::{Error, Result};
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{DeleteParams, LogParams, Patch, PatchParams, PostParams};
use kube::{Api, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

pub const TASK_LABEL: &str = "agents.platform/task";
pub const TASK_NAMESPACE_LABEL: &str = "agents.platform/task-namespace";
pub const AGENT_LABEL: &str = "agents.platform/agent";

const WORKER_CONTAINER: &str = "worker";
const INIT_CONTAINER: &str = "prepare";
const CONTEXT_MOUNT: &str = "/mnt/context";

pub struct TaskResourceManager<'a> {
    pub pods: &'a Api<Pod>,
    pub configmaps: &'a Api<ConfigMap>,
    pub config: &'a Arc<ControllerConfig>,
}

/// Effective (init, worker) image pair for an Agent.
///
/// Precedence: explicit pair > legacy single `agentImage` treated as the
/// worker with the default init > configured defaults.
pub fn resolve_images(agent: &Agent, config: &ControllerConfig) -> (String, String) {
    match (&agent.spec.agent_image, &agent.spec.executor_image) {
        (Some(init), Some(worker)) => (init.clone(), worker.clone()),
        (Some(legacy_worker), None) => (config.images.init.reference(), legacy_worker.clone()),
        (None, Some(worker)) => (config.images.init.reference(), worker.clone()),
        (None, None) => (
            config.images.init.reference(),
            config.images.worker.reference(),
        ),
    }
}

/// Flat ConfigMap keys for the inline files, in declaration order. ConfigMap
/// keys cannot contain `/`, so each file gets a positional `ctx-N` key and
/// the real relative path travels in the init script.
fn inline_entries(files: &[ResolvedFile]) -> Vec<(String, &ResolvedFile)> {
    files
        .iter()
        .filter(|f| f.is_inline())
        .enumerate()
        .map(|(i, f)| (format!("ctx-{i}"), f))
        .collect()
}

/// Shell script for the init container: stage the toolchain, then materialize
/// every context file in declaration order (copies, shallow clones, URL
/// fetches with bounded retries). All interpolated values were validated at
/// resolution time.
pub fn build_init_script(
    files: &[ResolvedFile],
    workspace_dir: &str,
    config: &ControllerConfig,
) -> String {
    let mut script = String::from("set -eu\n");
    script.push_str(&format!(
        "mkdir -p '{workspace_dir}/.agent'\ncp -a '{}/.' '{workspace_dir}/.agent/' 2>/dev/null || true\n",
        config.pod.toolchain_dir
    ));

    let mut inline_keys = inline_entries(files)
        .into_iter()
        .map(|(key, file)| (file.path.clone(), key))
        .collect::<BTreeMap<_, _>>();

    for file in files {
        let path = &file.path;
        let parent = std::path::Path::new(path)
            .parent()
            .and_then(|p| p.to_str())
            .filter(|p| !p.is_empty());
        if let Some(parent) = parent {
            script.push_str(&format!("mkdir -p '{workspace_dir}/{parent}'\n"));
        }
        match &file.source {
            ContextSource::Inline(_) => {
                // -L dereferences the ConfigMap volume's symlink farm
                if let Some(key) = inline_keys.remove(path) {
                    script.push_str(&format!(
                        "cp -L '{CONTEXT_MOUNT}/{key}' '{workspace_dir}/{path}'\n"
                    ));
                }
            }
            ContextSource::GitClone {
                repository,
                revision,
            } => {
                script.push_str(&format!(
                    "git clone --depth 1 --branch '{revision}' '{repository}' '{workspace_dir}/{path}'\n"
                ));
            }
            ContextSource::UrlFetch { url } => {
                let attempts = config.fetch.attempts;
                let backoff = config.fetch.backoff_seconds;
                script.push_str(&format!(
                    "n=0; until curl -fsSL -o '{workspace_dir}/{path}' '{url}'; do \
n=$((n+1)); [ \"$n\" -ge {attempts} ] && echo 'fetch failed: {url}' >&2 && exit 1; \
sleep {backoff}; done\n"
                ));
            }
        }
    }

    script
}

fn credential_env_json(cred: &CredentialSpec) -> serde_json::Value {
    json!({
        "name": cred.env.clone().unwrap_or_default(),
        "valueFrom": {
            "secretKeyRef": {
                "name": cred.secret_ref.name,
                "key": cred.secret_ref.key
            }
        }
    })
}

fn task_labels(task: &Task) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        TASK_LABEL.to_string(),
        ResourceNaming::sanitize_label(&task.name_any()),
    );
    labels.insert(
        TASK_NAMESPACE_LABEL.to_string(),
        ResourceNaming::sanitize_label(&task.namespace().unwrap_or_default()),
    );
    labels.insert(
        AGENT_LABEL.to_string(),
        ResourceNaming::sanitize_label(&task.spec.agent_ref.name),
    );
    labels
}

/// Build the two-container pod specification
pub fn build_pod(
    task: &Task,
    agent: &Agent,
    files: &[ResolvedFile],
    cm_name: &str,
    config: &ControllerConfig,
) -> Result<Pod> {
    for cred in &agent.spec.credentials {
        cred.validate().map_err(Error::ConfigError)?;
    }

    let pod_name = ResourceNaming::pod_name(task);
    let workspace_dir = &agent.spec.workspace_dir;
    let (init_image, worker_image) = resolve_images(agent, config);
    let overrides = agent.spec.pod_spec.clone().unwrap_or_default();

    let mut labels = task_labels(task);
    for (k, v) in &overrides.labels {
        labels.insert(k.clone(), v.clone());
    }

    // ConfigMap items: flat ctx-N keys, real paths restored by the init copy
    let cm_items: Vec<serde_json::Value> = inline_entries(files)
        .iter()
        .map(|(key, _)| json!({ "key": key, "path": key }))
        .collect();

    let mut worker_env = vec![
        json!({ "name": "TASK_NAME", "value": task.name_any() }),
        json!({ "name": "TASK_NAMESPACE", "value": task.namespace().unwrap_or_default() }),
        json!({ "name": "AGENT_NAME", "value": agent.name_any() }),
        json!({
            "name": "TASK_DESCRIPTION_FILE",
            "value": format!("{workspace_dir}/{}", super::context::DESCRIPTION_PATH)
        }),
    ];
    let mut worker_mounts = vec![json!({
        "name": "workspace",
        "mountPath": workspace_dir
    })];
    let mut volumes = vec![
        json!({ "name": "workspace", "emptyDir": {} }),
        json!({
            "name": "context",
            "configMap": { "name": cm_name, "items": cm_items }
        }),
    ];

    for cred in &agent.spec.credentials {
        if cred.env.is_some() {
            worker_env.push(credential_env_json(cred));
        } else if let Some(mount_path) = &cred.mount_path {
            let volume_name = format!("cred-{}", ResourceNaming::sanitize_label(&cred.name));
            volumes.push(json!({
                "name": volume_name,
                "secret": {
                    "secretName": cred.secret_ref.name,
                    "items": [{ "key": cred.secret_ref.key, "path": "credential" }],
                    "defaultMode": cred.effective_file_mode()
                }
            }));
            worker_mounts.push(json!({
                "name": volume_name,
                "mountPath": mount_path,
                "subPath": "credential",
                "readOnly": true
            }));
        }
    }

    let init_script = build_init_script(files, workspace_dir, config);

    let mut pod_spec = json!({
        "restartPolicy": "Never",
        "activeDeadlineSeconds": config.pod.active_deadline_seconds,
        "initContainers": [{
            "name": INIT_CONTAINER,
            "image": init_image,
            "command": ["/bin/sh", "-c", init_script],
            "volumeMounts": [
                { "name": "workspace", "mountPath": workspace_dir },
                { "name": "context", "mountPath": CONTEXT_MOUNT, "readOnly": true }
            ]
        }],
        "containers": [{
            "name": WORKER_CONTAINER,
            "image": worker_image,
            "workingDir": workspace_dir,
            "env": worker_env,
            "volumeMounts": worker_mounts
        }],
        "volumes": volumes
    });

    if let Some(sa) = &agent.spec.service_account_name {
        pod_spec["serviceAccountName"] = json!(sa);
    }
    if !overrides.node_selector.is_empty() {
        pod_spec["nodeSelector"] = json!(overrides.node_selector);
    }
    if !overrides.tolerations.is_empty() {
        pod_spec["tolerations"] = json!(overrides.tolerations);
    }
    if let Some(runtime_class) = &overrides.runtime_class_name {
        pod_spec["runtimeClassName"] = json!(runtime_class);
    }

    let pod: Pod = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": pod_name,
            "labels": labels
        },
        "spec": pod_spec
    }))?;

    Ok(pod)
}

impl<'a> TaskResourceManager<'a> {
    pub fn new(
        pods: &'a Api<Pod>,
        configmaps: &'a Api<ConfigMap>,
        config: &'a Arc<ControllerConfig>,
    ) -> Self {
        Self {
            pods,
            configmaps,
            config,
        }
    }

    /// Create or refresh the per-Task context ConfigMap holding the inline
    /// resolved files. Returns its name.
    pub async fn ensure_context_configmap(
        &self,
        task: &Task,
        files: &[ResolvedFile],
    ) -> Result<String> {
        let cm_name = ResourceNaming::context_configmap_name(task);
        let mut data = BTreeMap::new();
        for (key, file) in inline_entries(files) {
            if let ContextSource::Inline(content) = &file.source {
                data.insert(key, content.clone());
            }
        }

        let configmap: ConfigMap = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": cm_name,
                "labels": task_labels(task)
            },
            "data": data
        }))?;

        match self
            .configmaps
            .create(&PostParams::default(), &configmap)
            .await
        {
            Ok(_) => info!("Created context ConfigMap: {}", cm_name),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                // Exists from a previous pass: refresh so re-resolution wins
                let existing = self.configmaps.get(&cm_name).await?;
                let mut updated = configmap;
                updated.metadata.resource_version = existing.metadata.resource_version;
                updated.metadata.owner_references = existing.metadata.owner_references;
                self.configmaps
                    .replace(&cm_name, &PostParams::default(), &updated)
                    .await?;
                info!("Updated context ConfigMap: {}", cm_name);
            }
            Err(e) => return Err(e.into()),
        }

        Ok(cm_name)
    }

    /// Look up the Task's pod by its deterministic name, creating it when
    /// absent. A concurrent 409 means another pass won the race; both paths
    /// end with exactly one pod per Task.
    pub async fn create_or_get_pod(
        &self,
        task: &Task,
        agent: &Agent,
        files: &[ResolvedFile],
        cm_name: &str,
    ) -> Result<Pod> {
        let pod_name = ResourceNaming::pod_name(task);

        match self.pods.get(&pod_name).await {
            Ok(existing) => {
                info!("Adopting existing pod: {}", pod_name);
                return Ok(existing);
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }

        let pod = build_pod(task, agent, files, cm_name, self.config)?;
        match self.pods.create(&PostParams::default(), &pod).await {
            Ok(created) => {
                info!("Created execution pod: {}", pod_name);
                self.update_configmap_owner(cm_name, &created).await?;
                Ok(created)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                info!("Pod {} was created concurrently", pod_name);
                Ok(self.pods.get(&pod_name).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Tie the context ConfigMap's lifetime to the pod so the kubelet's GC
    /// sweeps it once the pod goes away (both live in the Agent's namespace).
    async fn update_configmap_owner(&self, cm_name: &str, pod: &Pod) -> Result<()> {
        let Some(uid) = &pod.metadata.uid else {
            return Ok(());
        };
        let patch = json!({
            "metadata": {
                "ownerReferences": [{
                    "apiVersion": "v1",
                    "kind": "Pod",
                    "name": pod.name_any(),
                    "uid": uid
                }]
            }
        });
        self.configmaps
            .patch(cm_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    /// Delete the Task's pod and context ConfigMap; 404s are fine.
    pub async fn cleanup(&self, task: &Task) -> Result<()> {
        for (what, result) in [
            (
                "pod",
                self.pods
                    .delete(&ResourceNaming::pod_name(task), &DeleteParams::default())
                    .await
                    .map(|_| ()),
            ),
            (
                "configmap",
                self.configmaps
                    .delete(
                        &ResourceNaming::context_configmap_name(task),
                        &DeleteParams::default(),
                    )
                    .await
                    .map(|_| ()),
            ),
        ] {
            match result {
                Ok(_) => info!("Deleted {} for task {}", what, task.name_any()),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Capture the tail of the worker container's output, flagging (not
    /// hiding) truncation at the configured byte cap.
    pub async fn capture_output(&self, pod_name: &str) -> Result<(String, bool)> {
        let params = LogParams {
            container: Some(WORKER_CONTAINER.to_string()),
            tail_lines: Some(self.config.output.tail_lines),
            ..LogParams::default()
        };
        let logs = match self.pods.logs(pod_name, &params).await {
            Ok(logs) => logs,
            // The pod can disappear between status observation and capture
            Err(kube::Error::Api(ae)) if ae.code == 404 => String::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(truncate_output(logs, self.config.output.max_bytes))
    }
}

/// Keep the last `max_bytes` of `logs` on a char boundary; the tail is the
/// interesting end.
pub fn truncate_output(logs: String, max_bytes: usize) -> (String, bool) {
    if logs.len() <= max_bytes {
        return (logs, false);
    }
    let mut start = logs.len() - max_bytes;
    while !logs.is_char_boundary(start) {
        start += 1;
    }
    (logs[start..].to_string(), true)
}

/// Exit code of the worker container, once terminated
pub fn worker_exit_code(pod: &Pod) -> Option<i32> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|cs| cs.name == WORKER_CONTAINER)?
        .state
        .as_ref()?
        .terminated
        .as_ref()
        .map(|t| t.exit_code)
}

/// Pod phase string, empty when status was never written
pub fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{AgentRef, AgentSpec, PodOverrides, SecretKeyRef, TaskSpec};

    fn config() -> ControllerConfig {
        ControllerConfig::default()
    }

    fn agent() -> Agent {
        let mut agent = Agent::new(
            "builder",
            AgentSpec {
                executor_image: Some("ghcr.io/acme/runner:v3".into()),
                ..serde_json::from_value(serde_json::json!({})).unwrap()
            },
        );
        agent.metadata.namespace = Some("agents".into());
        agent
    }

    fn task() -> Task {
        let mut task = Task::new(
            "t1",
            TaskSpec {
                agent_ref: AgentRef {
                    name: "builder".into(),
                    namespace: Some("agents".into()),
                },
                template_ref: None,
                description: "do it".into(),
                context: Vec::new(),
            },
        );
        task.metadata.namespace = Some("team-a".into());
        task.metadata.uid = Some("abcd1234-uid".into());
        task
    }

    fn files() -> Vec<ResolvedFile> {
        vec![
            ResolvedFile {
                path: ".task/description.md".into(),
                source: ContextSource::Inline("do it".into()),
            },
            ResolvedFile {
                path: "src".into(),
                source: ContextSource::GitClone {
                    repository: "https://example.com/repo.git".into(),
                    revision: "main".into(),
                },
            },
            ResolvedFile {
                path: "data/input.json".into(),
                source: ContextSource::UrlFetch {
                    url: "https://example.com/input.json".into(),
                },
            },
        ]
    }

    #[test]
    fn test_image_precedence() {
        let config = ControllerConfig::default();
        let mut agent = agent();

        agent.spec.agent_image = Some("init:v1".into());
        agent.spec.executor_image = Some("worker:v1".into());
        assert_eq!(
            resolve_images(&agent, &config),
            ("init:v1".into(), "worker:v1".into())
        );

        // Legacy single image acts as the worker
        agent.spec.executor_image = None;
        let (init, worker) = resolve_images(&agent, &config);
        assert_eq!(worker, "init:v1");
        assert_eq!(init, config.images.init.reference());

        agent.spec.agent_image = None;
        let (init, worker) = resolve_images(&agent, &config);
        assert_eq!(init, config.images.init.reference());
        assert_eq!(worker, config.images.worker.reference());
    }

    #[test]
    fn test_init_script_preserves_declaration_order() {
        let script = build_init_script(&files(), "/workspace", &ControllerConfig::default());
        let copy = script.find("cp -L '/mnt/context/ctx-0'").unwrap();
        let clone = script.find("git clone --depth 1").unwrap();
        let fetch = script.find("curl -fsSL").unwrap();
        assert!(copy < clone && clone < fetch, "script out of order:\n{script}");
        assert!(script.contains("mkdir -p '/workspace/data'"));
        assert!(script.starts_with("set -eu\n"));
    }

    #[test]
    fn test_init_script_bounds_url_retries() {
        let mut config = ControllerConfig::default();
        config.fetch.attempts = 4;
        let script = build_init_script(&files(), "/workspace", &config);
        assert!(script.contains("-ge 4"));
        assert!(script.contains("exit 1"));
    }

    #[test]
    fn test_pod_shape() {
        let pod = build_pod(
            &task(),
            &agent(),
            &files(),
            "task-team-a-t1-abcd1234-ctx",
            &config(),
        )
        .unwrap();

        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.active_deadline_seconds, Some(3600));
        assert_eq!(spec.init_containers.as_ref().unwrap().len(), 1);
        assert_eq!(spec.containers.len(), 1);
        assert_eq!(spec.containers[0].name, "worker");
        assert_eq!(spec.containers[0].image.as_deref(), Some("ghcr.io/acme/runner:v3"));

        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(TASK_LABEL).unwrap(), "t1");
        assert_eq!(labels.get(TASK_NAMESPACE_LABEL).unwrap(), "team-a");
        assert_eq!(labels.get(AGENT_LABEL).unwrap(), "builder");
    }

    #[test]
    fn test_credentials_project_env_and_file() {
        let mut agent = agent();
        agent.spec.credentials = vec![
            CredentialSpec {
                name: "api-key".into(),
                secret_ref: SecretKeyRef {
                    name: "agent-secrets".into(),
                    key: "api-key".into(),
                },
                env: Some("API_KEY".into()),
                mount_path: None,
                file_mode: None,
            },
            CredentialSpec {
                name: "ssh".into(),
                secret_ref: SecretKeyRef {
                    name: "agent-secrets".into(),
                    key: "id_ed25519".into(),
                },
                env: None,
                mount_path: Some("/creds/ssh/id_ed25519".into()),
                file_mode: Some(0o600),
            },
        ];

        let pod = build_pod(&task(), &agent, &files(), "cm", &config()).unwrap();
        let spec = pod.spec.as_ref().unwrap();
        let worker = &spec.containers[0];

        let env_names: Vec<&str> = worker
            .env
            .as_ref()
            .unwrap()
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        assert!(env_names.contains(&"API_KEY"));

        let ssh_volume = spec
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .find(|v| v.name == "cred-ssh")
            .expect("ssh credential volume");
        assert_eq!(
            ssh_volume.secret.as_ref().unwrap().default_mode,
            Some(0o600)
        );

        let ssh_mount = worker
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .find(|m| m.name == "cred-ssh")
            .expect("ssh credential mount");
        assert_eq!(ssh_mount.mount_path, "/creds/ssh/id_ed25519");
        assert_eq!(ssh_mount.read_only, Some(true));
    }

    #[test]
    fn test_invalid_credential_rejected() {
        let mut agent = agent();
        agent.spec.credentials = vec![CredentialSpec {
            name: "broken".into(),
            secret_ref: SecretKeyRef {
                name: "s".into(),
                key: "k".into(),
            },
            env: Some("X".into()),
            mount_path: Some("/x".into()),
            file_mode: None,
        }];
        assert!(build_pod(&task(), &agent, &files(), "cm", &config()).is_err());
    }

    #[test]
    fn test_pod_overrides_applied_verbatim() {
        let mut agent = agent();
        agent.spec.pod_spec = Some(PodOverrides {
            labels: BTreeMap::from([("tier".to_string(), "gpu".to_string())]),
            node_selector: BTreeMap::from([(
                "kubernetes.io/arch".to_string(),
                "arm64".to_string(),
            )]),
            tolerations: Vec::new(),
            runtime_class_name: Some("gvisor".into()),
        });

        let pod = build_pod(&task(), &agent, &files(), "cm", &config()).unwrap();
        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.runtime_class_name.as_deref(), Some("gvisor"));
        assert_eq!(
            spec.node_selector.as_ref().unwrap().get("kubernetes.io/arch"),
            Some(&"arm64".to_string())
        );
        assert_eq!(
            pod.metadata.labels.as_ref().unwrap().get("tier"),
            Some(&"gpu".to_string())
        );
    }

    #[test]
    fn test_output_truncation_is_flagged() {
        let (out, truncated) = truncate_output("short".into(), 100);
        assert_eq!(out, "short");
        assert!(!truncated);

        let long = "line\n".repeat(100);
        let (out, truncated) = truncate_output(long.clone(), 20);
        assert!(truncated);
        assert_eq!(out.len(), 20);
        assert!(long.ends_with(&out));
    }

    #[test]
    fn test_worker_exit_code_extraction() {
        let pod: Pod = serde_json::from_value(json!({
            "metadata": { "name": "p" },
            "status": {
                "phase": "Failed",
                "containerStatuses": [{
                    "name": "worker",
                    "image": "x", "imageID": "x", "ready": false,
                    "restartCount": 0,
                    "state": { "terminated": { "exitCode": 7 } }
                }]
            }
        }))
        .unwrap();
        assert_eq!(worker_exit_code(&pod), Some(7));
        assert_eq!(pod_phase(&pod), "Failed");
    }
}
