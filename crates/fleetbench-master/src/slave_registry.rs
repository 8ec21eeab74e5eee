// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Slave registry (spec §4.G): in-memory slave map guarded by `DashMap`, with
//! lifecycle events broadcast to a slice of buffered listener channels.

use crate::error::{MasterError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlaveState {
    Online,
    Offline,
    Draining,
}

#[derive(Debug, Clone)]
pub struct SlaveInfo {
    pub id: String,
    pub types: Vec<String>,
    pub labels: HashMap<String, String>,
    pub capabilities: Vec<String>,
    pub state: SlaveState,
    pub last_seen: DateTime<Utc>,
    pub metrics: HashMap<String, f64>,
}

impl SlaveInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            types: Vec::new(),
            labels: HashMap::new(),
            capabilities: Vec::new(),
            state: SlaveState::Online,
            last_seen: Utc::now(),
            metrics: HashMap::new(),
        }
    }

    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Current load, estimated from the `active_vus` reported metric.
    pub fn current_load(&self) -> f64 {
        self.metrics.get("active_vus").copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone)]
pub enum SlaveEvent {
    Registered(SlaveInfo),
    Unregistered(String),
    Online(String),
    Offline(String),
    Updated(String),
}

#[derive(Debug, Clone, Default)]
pub struct SlaveFilter {
    pub types: Vec<String>,
    pub labels: HashMap<String, String>,
    pub capabilities: Vec<String>,
    pub states: Vec<SlaveState>,
}

impl SlaveFilter {
    pub fn matches(&self, slave: &SlaveInfo) -> bool {
        if !self.types.is_empty() && !self.types.iter().any(|t| slave.types.contains(t)) {
            return false;
        }
        if !self
            .labels
            .iter()
            .all(|(k, v)| slave.labels.get(k) == Some(v))
        {
            return false;
        }
        if !self
            .capabilities
            .iter()
            .all(|c| slave.capabilities.contains(c))
        {
            return false;
        }
        if !self.states.is_empty() && !self.states.contains(&slave.state) {
            return false;
        }
        true
    }
}

struct Listener {
    id: u64,
    tx: mpsc::Sender<SlaveEvent>,
}

/// A handle to an active `WatchSlaves` subscription. Dropping it removes the
/// listener from the registry, mirroring the spec's ctx-cancellation cleanup.
pub struct WatchHandle {
    id: u64,
    registry: Arc<SlaveRegistryInner>,
    pub rx: mpsc::Receiver<SlaveEvent>,
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.registry.listeners.lock().retain(|l| l.id != self.id);
    }
}

struct SlaveRegistryInner {
    slaves: DashMap<String, SlaveInfo>,
    listeners: Mutex<Vec<Listener>>,
    next_listener_id: AtomicU64,
}

/// Thread-safe slave registry; cheap to clone (wraps an `Arc`).
#[derive(Clone)]
pub struct SlaveRegistry {
    inner: Arc<SlaveRegistryInner>,
}

const LISTENER_BUFFER: usize = 100;

impl SlaveRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SlaveRegistryInner {
                slaves: DashMap::new(),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(0),
            }),
        }
    }

    fn broadcast(&self, event: SlaveEvent) {
        let listeners = self.inner.listeners.lock();
        for listener in listeners.iter() {
            // Non-blocking: events are dropped on overflow, per spec.
            let _ = listener.tx.try_send(event.clone());
        }
    }

    pub fn register(&self, slave: SlaveInfo) -> Result<()> {
        if slave.id.is_empty() {
            return Err(MasterError::InvalidSlave("slave id must not be empty".to_string()));
        }
        if self.inner.slaves.contains_key(&slave.id) {
            return Err(MasterError::DuplicateSlave(slave.id));
        }
        let mut slave = slave;
        slave.state = SlaveState::Online;
        slave.last_seen = Utc::now();
        self.inner.slaves.insert(slave.id.clone(), slave.clone());
        self.broadcast(SlaveEvent::Registered(slave));
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> Result<()> {
        self.inner
            .slaves
            .remove(id)
            .ok_or_else(|| MasterError::UnknownSlave(id.to_string()))?;
        self.broadcast(SlaveEvent::Unregistered(id.to_string()));
        Ok(())
    }

    pub fn update_status(&self, id: &str, status: SlaveState) -> Result<()> {
        let mut slave = self
            .inner
            .slaves
            .get_mut(id)
            .ok_or_else(|| MasterError::UnknownSlave(id.to_string()))?;
        let previous = slave.state;
        slave.state = status;
        drop(slave);

        match status {
            SlaveState::Online if previous != SlaveState::Online => {
                self.broadcast(SlaveEvent::Online(id.to_string()))
            }
            SlaveState::Offline if previous != SlaveState::Offline => {
                self.broadcast(SlaveEvent::Offline(id.to_string()))
            }
            _ => self.broadcast(SlaveEvent::Updated(id.to_string())),
        }
        Ok(())
    }

    pub fn update_heartbeat(&self, id: &str, metrics: HashMap<String, f64>) -> Result<()> {
        let mut slave = self
            .inner
            .slaves
            .get_mut(id)
            .ok_or_else(|| MasterError::UnknownSlave(id.to_string()))?;
        let was_offline = slave.state == SlaveState::Offline;
        slave.last_seen = Utc::now();
        slave.metrics.extend(metrics);
        if was_offline {
            slave.state = SlaveState::Online;
        }
        drop(slave);

        if was_offline {
            self.broadcast(SlaveEvent::Online(id.to_string()));
        }
        Ok(())
    }

    pub fn mark_offline(&self, id: &str) -> Result<()> {
        let mut slave = self
            .inner
            .slaves
            .get_mut(id)
            .ok_or_else(|| MasterError::UnknownSlave(id.to_string()))?;
        if slave.state == SlaveState::Offline {
            return Ok(());
        }
        slave.state = SlaveState::Offline;
        drop(slave);
        self.broadcast(SlaveEvent::Offline(id.to_string()));
        Ok(())
    }

    pub fn drain_slave(&self, id: &str) -> Result<()> {
        let mut slave = self
            .inner
            .slaves
            .get_mut(id)
            .ok_or_else(|| MasterError::UnknownSlave(id.to_string()))?;
        slave.state = SlaveState::Draining;
        drop(slave);
        self.broadcast(SlaveEvent::Updated(id.to_string()));
        Ok(())
    }

    pub fn list_slaves(&self, filter: &SlaveFilter) -> Vec<SlaveInfo> {
        self.inner
            .slaves
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|slave| filter.matches(slave))
            .collect()
    }

    pub fn get_online_slaves(&self) -> Vec<SlaveInfo> {
        self.list_slaves(&SlaveFilter {
            states: vec![SlaveState::Online],
            ..Default::default()
        })
    }

    pub fn get(&self, id: &str) -> Option<SlaveInfo> {
        self.inner.slaves.get(id).map(|s| s.clone())
    }

    pub fn watch_slaves(&self) -> WatchHandle {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(LISTENER_BUFFER);
        self.inner.listeners.lock().push(Listener { id, tx });
        WatchHandle {
            id,
            registry: self.inner.clone(),
            rx,
        }
    }
}

impl Default for SlaveRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_rejects_empty_id_and_duplicates() {
        let registry = SlaveRegistry::new();
        assert!(registry.register(SlaveInfo::new("")).is_err());

        registry.register(SlaveInfo::new("s1")).unwrap();
        assert!(matches!(
            registry.register(SlaveInfo::new("s1")),
            Err(MasterError::DuplicateSlave(_))
        ));
    }

    #[test]
    fn test_heartbeat_transitions_offline_to_online() {
        let registry = SlaveRegistry::new();
        registry.register(SlaveInfo::new("s1")).unwrap();
        registry.mark_offline("s1").unwrap();
        assert_eq!(registry.get("s1").unwrap().state, SlaveState::Offline);

        registry.update_heartbeat("s1", HashMap::new()).unwrap();
        assert_eq!(registry.get("s1").unwrap().state, SlaveState::Online);
    }

    #[test]
    fn test_list_slaves_filters_by_label() {
        let registry = SlaveRegistry::new();
        let mut labels = HashMap::new();
        labels.insert("region".to_string(), "us".to_string());
        registry.register(SlaveInfo::new("s1").with_labels(labels)).unwrap();
        registry.register(SlaveInfo::new("s2")).unwrap();

        let mut filter_labels = HashMap::new();
        filter_labels.insert("region".to_string(), "us".to_string());
        let found = registry.list_slaves(&SlaveFilter {
            labels: filter_labels,
            ..Default::default()
        });
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "s1");
    }

    #[tokio::test]
    async fn test_watch_slaves_receives_events_and_cleans_up_on_drop() {
        let registry = SlaveRegistry::new();
        let mut handle = registry.watch_slaves();

        registry.register(SlaveInfo::new("s1")).unwrap();
        let event = handle.rx.recv().await.unwrap();
        assert!(matches!(event, SlaveEvent::Registered(_)));

        drop(handle);
        assert_eq!(registry.inner.listeners.lock().len(), 0);
    }

    #[test]
    fn test_unregister_unknown_errors() {
        let registry = SlaveRegistry::new();
        assert!(matches!(
            registry.unregister("missing"),
            Err(MasterError::UnknownSlave(_))
        ));
    }
}
