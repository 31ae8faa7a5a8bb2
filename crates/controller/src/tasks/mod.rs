use crate::crds::Task;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn, Instrument};

pub mod config;
pub mod task;
pub mod types;

// Re-export commonly used items
pub use config::ControllerConfig;
pub use task::reconcile_task;
pub use types::{Error, Result};

use task::controller::describe_status;
use task::resources::{TASK_LABEL, TASK_NAMESPACE_LABEL};
use types::Context;

/// Main entry point for the Task controller
#[instrument(skip(client, config))]
pub async fn run_task_controller(client: Client, config: Arc<ControllerConfig>) -> Result<()> {
    info!("Starting Task controller (all namespaces)");

    let context = Arc::new(Context {
        client: client.clone(),
        config,
    });

    // Startup visibility: list existing Tasks so we can see what the
    // controller should observe
    {
        let task_api: Api<Task> = Api::all(client.clone());
        match task_api.list(&ListParams::default()).await {
            Ok(list) => {
                info!("Controller startup: found {} Task(s)", list.items.len());
                for task in list.items {
                    debug!(
                        "Existing Task: namespace={}, name={}, agent={}, phase={}",
                        task.namespace().unwrap_or_default(),
                        task.name_any(),
                        task.spec.agent_ref.name,
                        describe_status(task.status.as_ref())
                    );
                }
            }
            Err(e) => {
                error!("Failed to list Tasks at startup: {}", e);
            }
        }
    }

    let task_api: Api<Task> = Api::all(client.clone());
    let pod_api: Api<Pod> = Api::all(client.clone());
    let watcher_config = Config::default().any_semantic();

    // Execution pods live in the Agent's namespace, not the Task's, so an
    // owner-reference watch is impossible. Pods carry the owning Task's
    // coordinates as labels instead and are mapped back here.
    let pod_watcher_config = Config::default().labels(TASK_LABEL).any_semantic();

    Controller::new(task_api, watcher_config)
        .watches(pod_api, pod_watcher_config, |pod| {
            let labels = pod.labels();
            let name = labels.get(TASK_LABEL)?;
            let namespace = labels.get(TASK_NAMESPACE_LABEL)?;
            Some(ObjectRef::new(name).within(namespace))
        })
        .run(reconcile_task, error_policy, context)
        .for_each(|reconciliation_result| {
            let span = tracing::info_span!("task_reconciliation_result");
            async move {
                match reconciliation_result {
                    Ok(task_resource) => {
                        debug!(resource = ?task_resource, "Task reconciliation successful");
                    }
                    Err(reconciliation_err) => {
                        error!(error = ?reconciliation_err, "Task reconciliation error");
                    }
                }
            }
            .instrument(span)
        })
        .await;

    info!("Task controller shutting down");
    Ok(())
}

/// Error policy: transient failures (API hiccups, conflicts) retry on a
/// fixed delay; terminal errors are recorded on the Task's status inside the
/// reconciler, so anything reaching here is worth retrying.
#[instrument(skip(_ctx), fields(task_name = %task.name_any()))]
fn error_policy(task: Arc<Task>, err: &Error, _ctx: Arc<Context>) -> Action {
    warn!(
        error = ?err,
        task_name = %task.name_any(),
        "Task reconciliation failed, will retry"
    );
    Action::requeue(Duration::from_secs(15))
}
