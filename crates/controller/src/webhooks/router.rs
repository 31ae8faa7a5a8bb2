//! Webhook route table
//!
//! The table is a derived cache of the WebhookTrigger set. Writers build a
//! fresh map and swap the Arc; request handlers clone the Arc and dispatch
//! against that immutable snapshot, so a request racing a trigger deletion
//! completes on the snapshot it started with.

use crate::crds::WebhookTrigger;
use crate::tasks::types::Result;
use futures::StreamExt;
use kube::runtime::watcher::{watcher, Config as WatcherConfig, Error as WatchError, Event};
use kube::{Api, Client, ResourceExt};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

type RouteMap = HashMap<(String, String), Arc<WebhookTrigger>>;

#[derive(Default)]
pub struct RouteTable {
    routes: RwLock<Arc<RouteMap>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Immutable snapshot of the current routes
    pub fn snapshot(&self) -> Arc<RouteMap> {
        self.routes
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn lookup(&self, namespace: &str, name: &str) -> Option<Arc<WebhookTrigger>> {
        self.snapshot()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Register or replace a single route
    pub fn apply(&self, trigger: WebhookTrigger) {
        let Some(namespace) = trigger.namespace() else {
            return;
        };
        let name = trigger.name_any();
        let mut next: RouteMap = (*self.snapshot()).clone();
        next.insert((namespace.clone(), name.clone()), Arc::new(trigger));
        self.swap(next);
        debug!("Registered webhook route /webhooks/{}/{}", namespace, name);
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        let mut next: RouteMap = (*self.snapshot()).clone();
        if next
            .remove(&(namespace.to_string(), name.to_string()))
            .is_some()
        {
            self.swap(next);
            debug!("Removed webhook route /webhooks/{}/{}", namespace, name);
        }
    }

    /// Rebuild the table from scratch (watcher restart)
    pub fn replace_all(&self, triggers: impl IntoIterator<Item = WebhookTrigger>) {
        let mut next = RouteMap::new();
        for trigger in triggers {
            let Some(namespace) = trigger.namespace() else {
                continue;
            };
            let name = trigger.name_any();
            next.insert((namespace, name), Arc::new(trigger));
        }
        info!("Rebuilt webhook route table with {} route(s)", next.len());
        self.swap(next);
    }

    fn swap(&self, next: RouteMap) {
        *self
            .routes
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::new(next);
    }
}

/// Fold one watch stream item into the table. Errors are transient (watch
/// timeouts, 410 Gone, apiserver restarts); the watcher resumes by itself
/// and replays the full set through Init/InitApply/InitDone, so an error
/// never invalidates the routes already held.
fn apply_watch_item(
    table: &RouteTable,
    restarting: &mut Vec<WebhookTrigger>,
    item: std::result::Result<Event<WebhookTrigger>, WatchError>,
) {
    match item {
        Ok(Event::Apply(trigger)) => table.apply(trigger),
        Ok(Event::Delete(trigger)) => {
            if let Some(namespace) = trigger.namespace() {
                table.remove(&namespace, &trigger.name_any());
            }
        }
        Ok(Event::Init) => restarting.clear(),
        Ok(Event::InitApply(trigger)) => restarting.push(trigger),
        Ok(Event::InitDone) => table.replace_all(restarting.drain(..)),
        Err(e) => warn!("WebhookTrigger watch error, resuming: {}", e),
    }
}

/// Watch WebhookTriggers cluster-wide and keep the route table current.
/// Runs for the life of the process; watcher restarts rebuild the table.
pub async fn run_trigger_watcher(client: Client, table: Arc<RouteTable>) -> Result<()> {
    let triggers: Api<WebhookTrigger> = Api::all(client);
    let mut stream = Box::pin(watcher(triggers, WatcherConfig::default().any_semantic()));

    let mut restarting: Vec<WebhookTrigger> = Vec::new();
    while let Some(item) = stream.next().await {
        apply_watch_item(&table, &mut restarting, item);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::WebhookTriggerSpec;

    fn trigger(namespace: &str, name: &str) -> WebhookTrigger {
        let mut t = WebhookTrigger::new(name, WebhookTriggerSpec::default());
        t.metadata.namespace = Some(namespace.into());
        t
    }

    #[test]
    fn test_apply_and_lookup() {
        let table = RouteTable::new();
        assert!(table.lookup("team-a", "on-push").is_none());

        table.apply(trigger("team-a", "on-push"));
        assert!(table.lookup("team-a", "on-push").is_some());
        // Same name in a different namespace is a different route
        assert!(table.lookup("team-b", "on-push").is_none());
    }

    #[test]
    fn test_snapshot_survives_removal() {
        let table = RouteTable::new();
        table.apply(trigger("team-a", "on-push"));

        let snapshot = table.snapshot();
        table.remove("team-a", "on-push");

        // In-flight dispatch still sees the route it started with
        assert!(snapshot.contains_key(&("team-a".to_string(), "on-push".to_string())));
        assert!(table.lookup("team-a", "on-push").is_none());
    }

    #[test]
    fn test_watch_errors_do_not_stall_the_table() {
        let table = RouteTable::new();
        let mut restarting = Vec::new();

        apply_watch_item(&table, &mut restarting, Ok(Event::Apply(trigger("team-a", "on-push"))));

        // A transient watch failure (e.g. 410 Gone) must leave existing
        // routes intact and keep later events flowing.
        let gone = WatchError::WatchError(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "too old resource version".into(),
            reason: "Expired".into(),
            code: 410,
        });
        apply_watch_item(&table, &mut restarting, Err(gone));
        assert!(table.lookup("team-a", "on-push").is_some());

        apply_watch_item(&table, &mut restarting, Ok(Event::Apply(trigger("team-b", "on-tag"))));
        apply_watch_item(&table, &mut restarting, Ok(Event::Delete(trigger("team-a", "on-push"))));
        assert!(table.lookup("team-a", "on-push").is_none());
        assert!(table.lookup("team-b", "on-tag").is_some());
    }

    #[test]
    fn test_restart_replay_rebuilds_after_error() {
        let table = RouteTable::new();
        let mut restarting = Vec::new();
        apply_watch_item(&table, &mut restarting, Ok(Event::Apply(trigger("team-a", "stale"))));
        apply_watch_item(&table, &mut restarting, Err(WatchError::NoResourceVersion));

        // Watcher restart replays the live set; stale routes drop out.
        apply_watch_item(&table, &mut restarting, Ok(Event::Init));
        apply_watch_item(&table, &mut restarting, Ok(Event::InitApply(trigger("team-a", "fresh"))));
        apply_watch_item(&table, &mut restarting, Ok(Event::InitDone));
        assert!(table.lookup("team-a", "stale").is_none());
        assert!(table.lookup("team-a", "fresh").is_some());
    }

    #[test]
    fn test_replace_all_drops_stale_routes() {
        let table = RouteTable::new();
        table.apply(trigger("team-a", "stale"));
        table.replace_all(vec![trigger("team-a", "fresh"), trigger("team-b", "fresh")]);

        assert!(table.lookup("team-a", "stale").is_none());
        assert!(table.lookup("team-a", "fresh").is_some());
        assert!(table.lookup("team-b", "fresh").is_some());
    }
}
