//! The admin aggregator: a read-only observer with bounded cost to the
//! game loop.
//!
//! Every second it snapshots the registry and session table, fingerprints
//! the serialized summary, and broadcasts to the admin room only when the
//! fingerprint changed — with a heartbeat every ~2 seconds so a quiet
//! dashboard still shows liveness. Per-session health is push-based:
//! participants report engine stats on a 2-second cadence and entries
//! expire after 10 seconds. The aggregator never calls into a mutator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::debug;

use crate::hash::fnv1a_hash;
use crate::network::hub::TransportHub;
use crate::network::messages::ServerMessage;
use crate::server::registry::ParticipantRegistry;
use crate::server::supervisor::SessionSupervisor;
use crate::SessionId;

/// Room admin dashboards join.
pub const ADMIN_ROOM: &str = "admin";

/// Snapshot cadence.
const SNAPSHOT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Unchanged snapshots are still emitted at this cadence.
const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

/// Health entries older than this are dropped.
const HEALTH_EXPIRY: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Debug)]
struct HealthEntry {
    received_at: Instant,
    report: Value,
}

/// The aggregator. Shares the hub, registry, and supervisor by `Arc` but
/// only ever reads from them.
pub struct AdminAggregator {
    hub: Arc<TransportHub>,
    registry: Arc<ParticipantRegistry>,
    supervisor: Arc<SessionSupervisor>,
    health: Mutex<HashMap<SessionId, HealthEntry>>,
    last_fingerprint: Mutex<Option<u64>>,
    last_emit: Mutex<Option<Instant>>,
    last_activity_ms: AtomicU64,
}

impl AdminAggregator {
    /// Creates an aggregator.
    #[must_use]
    pub fn new(
        hub: Arc<TransportHub>,
        registry: Arc<ParticipantRegistry>,
        supervisor: Arc<SessionSupervisor>,
    ) -> Self {
        Self {
            hub,
            registry,
            supervisor,
            health: Mutex::new(HashMap::new()),
            last_fingerprint: Mutex::new(None),
            last_emit: Mutex::new(None),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    /// Records a participant-pushed health report for a session.
    pub fn record_health(&self, session: SessionId, report: Value) {
        self.health.lock().insert(
            session,
            HealthEntry {
                received_at: Instant::now(),
                report,
            },
        );
    }

    /// Drops health entries older than the expiry window.
    pub fn expire_health(&self, now: Instant) {
        self.health
            .lock()
            .retain(|_, entry| now.duration_since(entry.received_at) < HEALTH_EXPIRY);
    }

    /// Builds the copy-on-snapshot summary of everything the dashboard
    /// shows.
    #[must_use]
    pub fn build_snapshot(&self) -> Value {
        let health = self.health.lock();
        let health_view: HashMap<String, &Value> = health
            .iter()
            .map(|(session, entry)| (session.to_string(), &entry.report))
            .collect();
        json!({
            "participants": self.registry.snapshot(),
            "sessions": self.supervisor.snapshot(),
            "health": health_view,
        })
    }

    /// One observation pass: expire stale health, rebuild the snapshot,
    /// and return it if it should be emitted (changed, or heartbeat due).
    pub fn observe(&self, now: Instant) -> Option<Value> {
        self.expire_health(now);
        let snapshot = self.build_snapshot();
        let fingerprint = fnv1a_hash(&snapshot.to_string());

        let changed = {
            let mut last = self.last_fingerprint.lock();
            let changed = *last != Some(fingerprint);
            *last = Some(fingerprint);
            changed
        };
        let heartbeat_due = {
            let last_emit = self.last_emit.lock();
            last_emit.map_or(true, |at| now.duration_since(at) >= HEARTBEAT_INTERVAL)
        };
        if changed || heartbeat_due {
            *self.last_emit.lock() = Some(now);
            Some(snapshot)
        } else {
            debug!("snapshot unchanged; coalesced");
            None
        }
    }

    /// Activity events not yet streamed, advancing the cursor.
    #[must_use]
    pub fn drain_activity(&self) -> Vec<Value> {
        let since = self.last_activity_ms.load(Ordering::Relaxed);
        let events = self.registry.recent_activity(since);
        if let Some(newest) = events.iter().map(|e| e.timestamp_ms).max() {
            self.last_activity_ms.store(newest + 1, Ordering::Relaxed);
        }
        events
            .into_iter()
            .filter_map(|event| serde_json::to_value(event).ok())
            .collect()
    }

    /// Runs the periodic snapshot loop until the process exits.
    pub fn run(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                for event in self.drain_activity() {
                    self.hub
                        .broadcast(ADMIN_ROOM, &ServerMessage::ActivityEvent { event }, None);
                }
                if let Some(snapshot) = self.observe(now) {
                    self.hub
                        .broadcast(ADMIN_ROOM, &ServerMessage::StateUpdate { snapshot }, None);
                }
            }
        });
    }
}

// #########
// # TESTS #
// #########
