/*
 * Agent Platform - Kubernetes Operator for Declarative Agent Tasks
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

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Operator core library
//!
//! Turns declarative Task resources into monitored pod executions: admission
//! against per-Agent quotas, context material resolution, pod construction,
//! lifecycle observation and webhook-driven Task creation.

pub mod crds;
pub mod tasks;
pub mod webhooks;

// Re-export commonly used types
pub use crds::{Agent, AgentSpec, Task, TaskPhase, TaskSpec, TaskStatus, WebhookTrigger};
pub use tasks::config::ControllerConfig;
pub use tasks::{run_task_controller, Error, Result};
pub use webhooks::{RouteTable, WebhookState};
