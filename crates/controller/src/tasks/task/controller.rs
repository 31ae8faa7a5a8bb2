//! Task lifecycle reconciliation
//!
//! Drives a Task through `Pending -> Admitted -> ContextResolving ->
//! PodCreating -> Running -> {Succeeded, Failed}` with `Stopped` as the
//! universal override. Every step checks observed state before acting, so
//! redelivered keys and crash/restart re-entry are harmless.

use super::admission::{check_admission, AdmissionDecision};
use super::context::resolve_context;
use super::resources::{pod_phase, worker_exit_code, TaskResourceManager};
use super::template::effective_spec;
use super::ResourceNaming;
use crate::crds::{Agent, AgentRef, Task, TaskPhase, TaskStatus, REQUEUE_ANNOTATION};
use crate::tasks::types::{Context, Error, Result, TASK_FINALIZER_NAME};
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::{Api, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

#[instrument(skip(ctx), fields(task = %task.name_any()))]
pub async fn reconcile_task(task: Arc<Task>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = task.namespace().ok_or(Error::MissingObjectKey)?;
    let tasks: Api<Task> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&tasks, TASK_FINALIZER_NAME, task, |event| async {
        match event {
            FinalizerEvent::Apply(task) => reconcile_active(task, &ctx).await,
            FinalizerEvent::Cleanup(task) => cleanup_task(task, &ctx).await,
        }
    })
    .await
    .map_err(|e| match e {
        kube::runtime::finalizer::Error::ApplyFailed(err)
        | kube::runtime::finalizer::Error::CleanupFailed(err) => err,
        kube::runtime::finalizer::Error::AddFinalizer(e)
        | kube::runtime::finalizer::Error::RemoveFinalizer(e) => Error::KubeError(e),
        kube::runtime::finalizer::Error::UnnamedObject => Error::MissingObjectKey,
        kube::runtime::finalizer::Error::InvalidFinalizer => {
            Error::ConfigError("invalid finalizer name".to_string())
        }
    })
}

/// Requeue delay after `deferrals` consecutive admission deferrals: bounded
/// exponential backoff instead of busy-polling the quota.
pub fn admission_backoff(deferrals: u32, base_seconds: u64, cap_seconds: u64) -> Duration {
    let factor = 1u64 << deferrals.min(16);
    Duration::from_secs(base_seconds.saturating_mul(factor).min(cap_seconds))
}

async fn reconcile_active(task: Arc<Task>, ctx: &Context) -> Result<Action> {
    // Several transitions can happen within one pass; `phase` tracks the
    // written state so each patch validates against what the API holds now,
    // not against the snapshot this pass started from.
    let mut phase = task.phase();

    // Stop overrides every other transition and never waits on the pod.
    if task.stop_requested() && !phase.is_terminal() {
        return stop_task(&task, ctx).await;
    }

    if phase.is_terminal() {
        // Terminal phases never change again; spec edits are ignored.
        return Ok(Action::await_change());
    }

    // Template expansion happens before anything else: the Agent reference
    // itself may come from the template.
    let spec = match effective_spec(&ctx.client, &task).await {
        Ok(spec) => spec,
        // The merge itself failed, so the raw reference is all there is.
        Err(err) if err.is_terminal() => {
            return fail_task(&task, ctx, &task.spec.agent_ref, &err.to_string()).await;
        }
        Err(err) => return Err(err),
    };

    // Triggers are validated at dispatch, but a hand-written Task (or a
    // template that names no agent) can still land here with an empty ref.
    if spec.agent_ref.name.is_empty() {
        return fail_task(
            &task,
            ctx,
            &spec.agent_ref,
            "task names no agent, directly or via its template",
        )
        .await;
    }

    let task_namespace = task.namespace().ok_or(Error::MissingObjectKey)?;
    let agent_namespace = spec.agent_ref.namespace_or(&task_namespace).to_string();

    let agents: Api<Agent> = Api::namespaced(ctx.client.clone(), &agent_namespace);
    let agent = match agents.get(&spec.agent_ref.name).await {
        Ok(agent) => agent,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            // Not terminal: the Agent may simply not exist yet.
            if phase == TaskPhase::Pending {
                update_status(
                    &task,
                    ctx,
                    phase,
                    TaskPhase::Pending,
                    &format!(
                        "waiting for agent '{}' in namespace '{agent_namespace}'",
                        spec.agent_ref.name
                    ),
                    json!({}),
                )
                .await?;
            }
            return Ok(Action::requeue(Duration::from_secs(30)));
        }
        Err(e) => return Err(e.into()),
    };

    // Work on the effective (template-merged) spec from here on.
    let mut effective_task = (*task).clone();
    effective_task.spec = spec;

    if phase == TaskPhase::Pending {
        match check_admission(&ctx.client, &agent, &agent_namespace, &effective_task).await? {
            AdmissionDecision::NotAllowed => {
                let err = Error::NotAuthorized {
                    namespace: task_namespace.clone(),
                    agent: agent.name_any(),
                };
                return fail_task(&task, ctx, &effective_task.spec.agent_ref, &err.to_string())
                    .await;
            }
            AdmissionDecision::Defer { active, limit } => {
                let deferrals = task
                    .status
                    .as_ref()
                    .and_then(|s| s.deferral_count)
                    .unwrap_or(0);
                update_status(
                    &task,
                    ctx,
                    phase,
                    TaskPhase::Pending,
                    &format!(
                        "waiting for quota on agent '{}' ({active}/{limit} slots in use)",
                        agent.name_any()
                    ),
                    json!({ "deferralCount": deferrals + 1 }),
                )
                .await?;
                let backoff = admission_backoff(
                    deferrals,
                    ctx.config.admission.backoff_base_seconds,
                    ctx.config.admission.backoff_cap_seconds,
                );
                info!(deferrals, ?backoff, "admission deferred");
                return Ok(Action::requeue(backoff));
            }
            AdmissionDecision::Admit => {
                phase = update_status(
                    &task,
                    ctx,
                    phase,
                    TaskPhase::Admitted,
                    "admission granted",
                    json!({ "deferralCount": 0 }),
                )
                .await?;
            }
        }
    }

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &agent_namespace);
    let configmaps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &agent_namespace);
    let resources = TaskResourceManager::new(&pods, &configmaps, &ctx.config);

    // A recorded pod means creation already happened: observe it. Otherwise
    // resolve context and create, adopting any pod left by a crashed pass.
    let recorded_pod = task.status.as_ref().and_then(|s| s.pod_name.clone());

    let pod = if let Some(pod_name) = recorded_pod {
        match pods.get(&pod_name).await {
            Ok(pod) => pod,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return fail_task(
                    &task,
                    ctx,
                    &effective_task.spec.agent_ref,
                    &format!("execution pod '{pod_name}' was deleted before completion"),
                )
                .await;
            }
            Err(e) => return Err(e.into()),
        }
    } else {
        phase = update_status(
            &task,
            ctx,
            phase,
            TaskPhase::ContextResolving,
            "resolving context",
            json!({}),
        )
        .await?;

        let files = match resolve_context(&ctx.client, &effective_task).await {
            Ok(files) => files,
            Err(err) if err.is_terminal() => {
                return fail_task(&task, ctx, &effective_task.spec.agent_ref, &err.to_string())
                    .await;
            }
            Err(err) => return Err(err),
        };

        phase = update_status(
            &task,
            ctx,
            phase,
            TaskPhase::PodCreating,
            "creating execution pod",
            json!({}),
        )
        .await?;

        let cm_name = resources
            .ensure_context_configmap(&effective_task, &files)
            .await?;
        let pod = resources
            .create_or_get_pod(&effective_task, &agent, &files, &cm_name)
            .await?;

        phase = update_status(
            &task,
            ctx,
            phase,
            TaskPhase::PodCreating,
            "execution pod created",
            json!({
                "podName": pod.name_any(),
                "podNamespace": agent_namespace,
                "startTime": chrono::Utc::now().to_rfc3339(),
            }),
        )
        .await?;
        pod
    };

    match pod_phase(&pod) {
        "Succeeded" => {
            // A fast pod can finish before the Running observation was ever
            // recorded; step through Running so transitions stay forward-only.
            if !phase.allows(TaskPhase::Succeeded) {
                phase =
                    update_status(&task, ctx, phase, TaskPhase::Running, "worker running", json!({}))
                        .await?;
            }
            let (output, truncated) = resources.capture_output(&pod.name_any()).await?;
            update_status(
                &task,
                ctx,
                phase,
                TaskPhase::Succeeded,
                "worker completed successfully",
                json!({
                    "output": output,
                    "outputTruncated": truncated,
                    "completionTime": chrono::Utc::now().to_rfc3339(),
                }),
            )
            .await?;
            requeue_pending_peers(ctx, &effective_task.spec.agent_ref.name, &agent_namespace)
                .await?;
            Ok(Action::await_change())
        }
        "Failed" => {
            let (output, truncated) = resources.capture_output(&pod.name_any()).await?;
            let exit = worker_exit_code(&pod)
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let mut message = format!("worker exited with code {exit}");
            if !output.is_empty() {
                message = format!("{message}: {}", last_lines(&output, 3));
            }
            update_status(
                &task,
                ctx,
                phase,
                TaskPhase::Failed,
                &message,
                json!({
                    "output": output,
                    "outputTruncated": truncated,
                    "completionTime": chrono::Utc::now().to_rfc3339(),
                }),
            )
            .await?;
            requeue_pending_peers(ctx, &effective_task.spec.agent_ref.name, &agent_namespace)
                .await?;
            Ok(Action::await_change())
        }
        // Any observed non-pending phase counts as running.
        "Running" | "Unknown" => {
            update_status(&task, ctx, phase, TaskPhase::Running, "worker running", json!({}))
                .await?;
            Ok(Action::requeue(Duration::from_secs(30)))
        }
        _ => Ok(Action::requeue(Duration::from_secs(10))),
    }
}

/// Delete the pod (retried via the error policy on API failure) and flip the
/// phase to Stopped without waiting for pod confirmation.
async fn stop_task(task: &Task, ctx: &Context) -> Result<Action> {
    // The agent reference may live only in the template; merge it in so peer
    // requeue targets the right Agent. A broken template must not block a
    // stop, so the raw spec is the fallback.
    let spec = effective_spec(&ctx.client, task)
        .await
        .unwrap_or_else(|_| task.spec.clone());

    let pod_name = task
        .status
        .as_ref()
        .and_then(|s| s.pod_name.clone())
        .unwrap_or_else(|| ResourceNaming::pod_name(task));
    let pod_namespace = task
        .status
        .as_ref()
        .and_then(|s| s.pod_namespace.clone())
        .unwrap_or_else(|| {
            let task_ns = task.namespace().unwrap_or_default();
            spec.agent_ref.namespace_or(&task_ns).to_string()
        });

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &pod_namespace);
    match pods.delete(&pod_name, &DeleteParams::default()).await {
        Ok(_) => info!("Deleted pod {} for stopped task", pod_name),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        // Propagate so the error policy retries the deletion.
        Err(e) => return Err(e.into()),
    }

    update_status(
        task,
        ctx,
        task.phase(),
        TaskPhase::Stopped,
        "stopped by user",
        json!({ "completionTime": chrono::Utc::now().to_rfc3339() }),
    )
    .await?;

    let task_ns = task.namespace().unwrap_or_default();
    let agent_ns = spec.agent_ref.namespace_or(&task_ns).to_string();
    requeue_pending_peers(ctx, &spec.agent_ref.name, &agent_ns).await?;
    Ok(Action::await_change())
}

/// Finalizer cleanup: the pod and context ConfigMap live in the Agent's
/// namespace and cannot be garbage-collected through owner references on the
/// Task, so they are deleted here.
async fn cleanup_task(task: Arc<Task>, ctx: &Context) -> Result<Action> {
    let task_ns = task.namespace().unwrap_or_default();
    let pod_namespace = task
        .status
        .as_ref()
        .and_then(|s| s.pod_namespace.clone())
        .unwrap_or_else(|| task.spec.agent_ref.namespace_or(&task_ns).to_string());

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &pod_namespace);
    let configmaps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &pod_namespace);
    let resources = TaskResourceManager::new(&pods, &configmaps, &ctx.config);
    resources.cleanup(&task).await?;
    Ok(Action::await_change())
}

/// `agent_ref` must be the effective (template-merged) reference so the freed
/// slot reaches peers even when the Task's own agentRef is empty.
async fn fail_task(task: &Task, ctx: &Context, agent_ref: &AgentRef, message: &str) -> Result<Action> {
    warn!(task = %task.name_any(), message, "task failed");
    update_status(
        task,
        ctx,
        task.phase(),
        TaskPhase::Failed,
        message,
        json!({ "completionTime": chrono::Utc::now().to_rfc3339() }),
    )
    .await?;

    let task_ns = task.namespace().unwrap_or_default();
    let agent_ns = agent_ref.namespace_or(&task_ns).to_string();
    requeue_pending_peers(ctx, &agent_ref.name, &agent_ns).await?;
    Ok(Action::await_change())
}

/// Merge-patch the status subresource, enforcing forward-only transitions.
/// A patch that would move the phase backward or skip a step (stale cache,
/// redelivered key) is dropped with a warning instead of being applied.
/// Returns the phase the status holds after the call.
async fn update_status(
    task: &Task,
    ctx: &Context,
    current: TaskPhase,
    new_phase: TaskPhase,
    message: &str,
    extra: serde_json::Value,
) -> Result<TaskPhase> {
    if !current.allows(new_phase) {
        warn!(
            task = %task.name_any(),
            %current,
            next = %new_phase,
            "refusing illegal phase transition"
        );
        return Ok(current);
    }

    let current_message = task.status.as_ref().and_then(|s| s.message.as_deref());
    if current == new_phase && current_message == Some(message) && extra == json!({}) {
        return Ok(current);
    }

    let mut status = json!({
        "phase": new_phase,
        "message": message,
        "lastUpdate": chrono::Utc::now().to_rfc3339(),
    });
    if let Some(map) = status.as_object_mut() {
        if let Some(extra_map) = extra.as_object() {
            for (k, v) in extra_map {
                map.insert(k.clone(), v.clone());
            }
        }
    }

    let namespace = task.namespace().ok_or(Error::MissingObjectKey)?;
    let tasks: Api<Task> = Api::namespaced(ctx.client.clone(), &namespace);
    tasks
        .patch_status(
            &task.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&json!({ "status": status })),
        )
        .await?;
    Ok(new_phase)
}

/// Wake every Pending Task competing for the same Agent by patching an
/// annotation on it: the resulting watch events re-enqueue them, which is how
/// a freed admission slot propagates without any in-memory signal between
/// reconciler instances.
async fn requeue_pending_peers(ctx: &Context, agent_name: &str, agent_namespace: &str) -> Result<()> {
    let all_tasks: Api<Task> = Api::all(ctx.client.clone());
    let list = all_tasks.list(&ListParams::default()).await?;

    for peer in list.items {
        let Some(peer_ns) = peer.namespace() else {
            continue;
        };
        if !is_pending_peer(&peer, &peer_ns, agent_name, agent_namespace) {
            continue;
        }
        let patch = json!({
            "metadata": {
                "annotations": { REQUEUE_ANNOTATION: chrono::Utc::now().to_rfc3339() }
            }
        });
        let tasks: Api<Task> = Api::namespaced(ctx.client.clone(), &peer_ns);
        if let Err(e) = tasks
            .patch(&peer.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            // Best effort: the peer's own backoff requeue still fires.
            warn!(peer = %peer.name_any(), error = %e, "failed to requeue pending peer");
        }
    }
    Ok(())
}

/// A peer competes for the slot if it is Pending and references the same
/// Agent. An empty agent name never matches; callers pass the effective
/// reference, so emptiness means the peer's own template fills it in later.
fn is_pending_peer(peer: &Task, peer_namespace: &str, agent_name: &str, agent_namespace: &str) -> bool {
    !agent_name.is_empty()
        && peer.phase() == TaskPhase::Pending
        && peer.spec.agent_ref.name == agent_name
        && peer.spec.agent_ref.namespace_or(peer_namespace) == agent_namespace
}

/// Last `n` lines of `output`, joined for a one-line status message
fn last_lines(output: &str, n: usize) -> String {
    let lines: Vec<&str> = output.lines().rev().take(n).collect();
    lines
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Status snapshot helper used by the runner's startup listing
pub fn describe_status(status: Option<&TaskStatus>) -> String {
    match status.and_then(|s| s.phase) {
        Some(phase) => phase.to_string(),
        None => "(unreconciled)".to_string(),
    }
}
