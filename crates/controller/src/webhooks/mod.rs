//! Webhook ingress: WebhookTrigger resources become HTTP routes that mint
//! Tasks from inbound payloads.

pub mod handlers;
pub mod router;

pub use handlers::{handle_webhook, WebhookState};
pub use router::{run_trigger_watcher, RouteTable};
