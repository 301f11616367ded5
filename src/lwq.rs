//! Ephemeral liveness store backing listener heartbeats. Deliberately kept
//! out of the ACID database: publishing `online` every 60s with a 180s TTL
//! is cheap and self-healing, and its loss only degrades liveness detection,
//! never run-state correctness. A real multi-replica deployment would point
//! this at Redis; the trait-free `DashMap` here stands in for that network
//! hop in a single-process control plane.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const HEARTBEAT_TTL: Duration = Duration::from_secs(180);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListenerHeartbeat {
    pub capacity: u32,
    pub active_runs: u32,
    pub runner_defs: serde_json::Value,
    pub heartbeat_epoch: i64,
}

struct Entry {
    heartbeat: ListenerHeartbeat,
    expires_at: Instant,
}

#[derive(Clone, Default)]
pub struct LivenessStore {
    entries: Arc<DashMap<Uuid, Entry>>,
}

impl LivenessStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Republishes the full heartbeat state. There are no partial updates —
    /// every call overwrites the previous entry and resets the TTL.
    pub fn publish(&self, listener_id: Uuid, heartbeat: ListenerHeartbeat) {
        self.entries.insert(
            listener_id,
            Entry {
                heartbeat,
                expires_at: Instant::now() + HEARTBEAT_TTL,
            },
        );
    }

    /// Returns the heartbeat if present and not expired. An expired entry is
    /// treated as absent (and lazily evicted) — this is the "status key
    /// expired" check the design note describes.
    pub fn is_online(&self, listener_id: Uuid) -> bool {
        let online = matches!(
            self.entries.get(&listener_id),
            Some(entry) if entry.expires_at > Instant::now()
        );
        if !online {
            self.entries.remove(&listener_id);
        }
        online
    }

    pub fn get(&self, listener_id: Uuid) -> Option<ListenerHeartbeat> {
        self.entries.get(&listener_id).and_then(|entry| {
            if entry.expires_at > Instant::now() {
                Some(entry.heartbeat.clone())
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ListenerHeartbeat {
        ListenerHeartbeat {
            capacity: 3,
            active_runs: 1,
            runner_defs: serde_json::json!([]),
            heartbeat_epoch: 0,
        }
    }

    #[test]
    fn fresh_publish_is_online() {
        let store = LivenessStore::new();
        let id = Uuid::new_v4();
        store.publish(id, sample());
        assert!(store.is_online(id));
    }

    #[test]
    fn unknown_listener_is_offline() {
        let store = LivenessStore::new();
        assert!(!store.is_online(Uuid::new_v4()));
    }

    #[test]
    fn republish_overwrites_fields() {
        let store = LivenessStore::new();
        let id = Uuid::new_v4();
        store.publish(id, sample());
        let mut updated = sample();
        updated.active_runs = 2;
        store.publish(id, updated);
        assert_eq!(store.get(id).unwrap().active_runs, 2);
    }
}
