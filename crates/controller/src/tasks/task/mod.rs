//! Task execution pipeline: admission, template expansion, context
//! resolution, pod construction and lifecycle observation.

pub mod admission;
pub mod context;
pub mod controller;
pub mod naming;
pub mod resources;
pub mod template;

pub use controller::reconcile_task;
pub use naming::ResourceNaming;
