//! HTTP dispatch: `POST /webhooks/{namespace}/{trigger}` turns an inbound
//! payload into a Task in the trigger's namespace.

use super::router::RouteTable;
use crate::crds::{AgentRef, ContextItem, PayloadMapping, Task, TaskSpec, WebhookTrigger};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use kube::api::PostParams;
use kube::{Api, Client, ResourceExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct WebhookState {
    pub client: Client,
    pub routes: Arc<RouteTable>,
}

/// Extract the mapped payload fields as Text context items. String values
/// are taken verbatim; anything else is serialized as JSON. Missing required
/// pointers are collected and returned together so the caller can name all
/// of them in one 422.
pub fn map_payload(
    mappings: &[PayloadMapping],
    payload: &Value,
) -> std::result::Result<Vec<ContextItem>, Vec<String>> {
    let mut items = Vec::new();
    let mut missing = Vec::new();

    for mapping in mappings {
        match payload.pointer(&mapping.field) {
            Some(value) => {
                let content = match value.as_str() {
                    Some(s) => s.to_string(),
                    None => value.to_string(),
                };
                items.push(ContextItem::Text {
                    path: mapping.path.clone(),
                    content,
                });
            }
            None if mapping.required => missing.push(mapping.field.clone()),
            None => {}
        }
    }

    if missing.is_empty() {
        Ok(items)
    } else {
        Err(missing)
    }
}

/// Build the Task a trigger produces for one delivery. The server assigns
/// the final name from `generateName`.
pub fn build_task(trigger: &WebhookTrigger, context: Vec<ContextItem>) -> Task {
    let prefix = trigger
        .spec
        .task_name_prefix
        .clone()
        .unwrap_or_else(|| format!("{}-", trigger.name_any()));

    let mut task = Task::new(
        "",
        TaskSpec {
            agent_ref: trigger.spec.agent_ref.clone().unwrap_or(AgentRef {
                name: String::new(),
                namespace: None,
            }),
            template_ref: trigger.spec.template_ref.clone(),
            description: trigger.spec.description.clone().unwrap_or_default(),
            context,
        },
    );
    task.metadata.name = None;
    task.metadata.generate_name = Some(prefix);
    task.metadata.namespace = trigger.namespace();
    task
}

pub async fn handle_webhook(
    State(state): State<WebhookState>,
    Path((namespace, trigger_name)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let Some(trigger) = state.routes.lookup(&namespace, &trigger_name) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown webhook route" })),
        )
            .into_response();
    };

    if let Err(reason) = trigger.spec.validate() {
        warn!(
            "Webhook {}/{} rejected delivery: {}",
            namespace, trigger_name, reason
        );
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": reason })),
        )
            .into_response();
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "payload must be JSON" })),
            )
                .into_response();
        }
    };

    let context = match map_payload(&trigger.spec.context_mappings, &payload) {
        Ok(context) => context,
        Err(missing) => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({
                    "error": "required payload fields missing",
                    "missing": missing
                })),
            )
                .into_response();
        }
    };

    let task = build_task(&trigger, context);
    let tasks: Api<Task> = Api::namespaced(state.client.clone(), &namespace);
    match tasks.create(&PostParams::default(), &task).await {
        Ok(created) => {
            info!(
                "Webhook {}/{} created Task {}",
                namespace,
                trigger_name,
                created.name_any()
            );
            (
                StatusCode::OK,
                Json(json!({
                    "task": created.name_any(),
                    "namespace": namespace
                })),
            )
                .into_response()
        }
        Err(e) => {
            warn!(
                "Webhook {}/{} failed to create Task: {}",
                namespace, trigger_name, e
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to create Task" })),
            )
                .into_response()
        }
    }
}
