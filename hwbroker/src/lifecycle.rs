//! Client lifecycle monitor.
//!
//! Keeps one liveness watch per client that owns at least one handle.
//! The transport reports every disconnect; the monitor filters those down
//! to clients it is actually watching, so a vanish triggers revocation
//! at most once.

use hwbroker_common::error::BrokerResult;
use hwbroker_common::types::ClientId;
use std::collections::HashMap;
use tracing::debug;

/// Token for one registered liveness watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchToken(pub u64);

/// Transport seam: subscribe to a client's continued presence.
pub trait LivenessWatcher {
    fn watch(&mut self, client: ClientId) -> BrokerResult<WatchToken>;
    fn unwatch(&mut self, token: WatchToken);
}

pub struct ClientLifecycleMonitor {
    watcher: Box<dyn LivenessWatcher>,
    watches: HashMap<ClientId, WatchToken>,
}

impl ClientLifecycleMonitor {
    pub fn new(watcher: Box<dyn LivenessWatcher>) -> Self {
        Self {
            watcher,
            watches: HashMap::new(),
        }
    }

    /// Ensure `client` is watched.
    pub fn watch(&mut self, client: ClientId) -> BrokerResult<()> {
        if self.watches.contains_key(&client) {
            return Ok(());
        }
        let token = self.watcher.watch(client)?;
        debug!(%client, ?token, "liveness watch added");
        self.watches.insert(client, token);
        Ok(())
    }

    /// Cancel the watch for `client`, if any.
    pub fn unwatch(&mut self, client: ClientId) {
        if let Some(token) = self.watches.remove(&client) {
            self.watcher.unwatch(token);
            debug!(%client, ?token, "liveness watch removed");
        }
    }

    pub fn is_watched(&self, client: ClientId) -> bool {
        self.watches.contains_key(&client)
    }

    pub fn watched_count(&self) -> usize {
        self.watches.len()
    }

    /// A client went away. Returns `true` if it was watched, in which
    /// case the watch is consumed and the caller must revoke its handles.
    pub fn vanished(&mut self, client: ClientId) -> bool {
        match self.watches.remove(&client) {
            Some(token) => {
                self.watcher.unwatch(token);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockWatcher;

    #[test]
    fn test_watch_is_idempotent() {
        let watcher = MockWatcher::default();
        let mut monitor = ClientLifecycleMonitor::new(Box::new(watcher.clone()));

        monitor.watch(ClientId(1)).unwrap();
        monitor.watch(ClientId(1)).unwrap();
        assert_eq!(watcher.active(), vec![ClientId(1)]);
        assert!(monitor.is_watched(ClientId(1)));
    }

    #[test]
    fn test_unwatch_cancels_transport_watch() {
        let watcher = MockWatcher::default();
        let mut monitor = ClientLifecycleMonitor::new(Box::new(watcher.clone()));

        monitor.watch(ClientId(1)).unwrap();
        monitor.unwatch(ClientId(1));
        monitor.unwatch(ClientId(1));
        assert!(watcher.active().is_empty());
        assert_eq!(monitor.watched_count(), 0);
    }

    #[test]
    fn test_vanished_fires_once() {
        let watcher = MockWatcher::default();
        let mut monitor = ClientLifecycleMonitor::new(Box::new(watcher.clone()));

        monitor.watch(ClientId(3)).unwrap();
        assert!(monitor.vanished(ClientId(3)));
        assert!(!monitor.vanished(ClientId(3)));
        assert!(!monitor.vanished(ClientId(4)));
        assert!(watcher.active().is_empty());
    }

    #[test]
    fn test_watch_failure_is_propagated() {
        let watcher = MockWatcher::default();
        watcher.fail_next();
        let mut monitor = ClientLifecycleMonitor::new(Box::new(watcher.clone()));

        assert!(monitor.watch(ClientId(1)).is_err());
        assert!(!monitor.is_watched(ClientId(1)));
    }
}
