//! Custom Resource Definitions for the agents.platform API group

pub mod agent;
pub mod task;
pub mod template;
pub mod webhooktrigger;

pub use agent::{Agent, AgentSpec, CredentialSpec, PodOverrides, SecretKeyRef, TolerationSpec};
pub use task::{
    AgentRef, ContextItem, Task, TaskPhase, TaskSpec, TaskStatus, REQUEUE_ANNOTATION,
    STOP_ANNOTATION,
};
pub use template::{TaskTemplate, TaskTemplateSpec};
pub use webhooktrigger::{PayloadMapping, WebhookTrigger, WebhookTriggerSpec};
