/*
 * Agent Platform - Controller Service
 * Copyright (C) 2025 Agent Platform
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Controller Service - Kubernetes operator for `Task` resources
//!
//! This service manages the lifecycle of agent executions by:
//! - Watching `Task`, `Agent`, `TaskTemplate` and `WebhookTrigger` resources
//! - Admitting Tasks against per-Agent concurrency quotas
//! - Resolving declared context and running each Task as a pod
//! - Serving webhook routes that mint Tasks from HTTP payloads

use axum::{
    response::Json,
    routing::{get, post},
    Router,
};
use controller::tasks::{config::ControllerConfig, run_task_controller};
use controller::webhooks::{handle_webhook, run_trigger_watcher, RouteTable, WebhookState};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,controller=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting Agent Platform Controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = ControllerConfig::load();
    if let Err(validation_error) = config.validate() {
        error!("Configuration validation failed: {}", validation_error);
        return Err(validation_error.into());
    }
    let config = Arc::new(config);
    let port = config.server.port;

    // Initialize Kubernetes client
    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    // Start the Task controller in the background
    let controller_handle = {
        let client = client.clone();
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = run_task_controller(client, config).await {
                error!("Task controller error: {}", e);
            }
        })
    };

    // Keep the webhook route table synced with WebhookTrigger resources
    let routes = Arc::new(RouteTable::new());
    let watcher_handle = {
        let client = client.clone();
        let routes = routes.clone();
        tokio::spawn(async move {
            if let Err(e) = run_trigger_watcher(client, routes).await {
                error!("WebhookTrigger watcher error: {}", e);
            }
        })
    };

    let state = WebhookState {
        client: client.clone(),
        routes,
    };

    // Build the HTTP router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/webhooks/{namespace}/{trigger}", post(handle_webhook))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::INFO))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(Duration::from_secs(60))),
        )
        .with_state(state);

    // Start the HTTP server
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Controller HTTP server listening on 0.0.0.0:{}", port);

    // Run the server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    controller_handle.abort();
    watcher_handle.abort();
    info!("Controller service stopped");

    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check() -> Json<Value> {
    Json(json!({
        "status": "ready",
        "service": "controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
