//! Connection registry for Switchboard.
//!
//! Maps identities to the live connection registered under them. The
//! registry is the only shared mutable state in the relay.

use crate::liveness::{LivenessProbe, LivenessState, DEFAULT_PROBE_INTERVAL};
use crate::peer::{ConnectionId, PeerHandle};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info};

/// Auxiliary address reported when the client sent none or an unusable one.
pub const UNKNOWN_ADDRESS: &str = "N/A";

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A live connection already holds this identity.
    #[error("User \"{0}\" is already registered.")]
    DuplicateIdentity(String),
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Interval between keepalive pings to each registered connection.
    pub probe_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }
}

/// Normalize a client-supplied auxiliary address.
///
/// Missing values, JSON `null`, the literal string `"null"`, blank strings and
/// non-string values all become [`UNKNOWN_ADDRESS`].
#[must_use]
pub fn normalize_address(raw: Option<&serde_json::Value>) -> String {
    match raw {
        Some(serde_json::Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() || trimmed == "null" {
                UNKNOWN_ADDRESS.to_string()
            } else {
                trimmed.to_string()
            }
        }
        _ => UNKNOWN_ADDRESS.to_string(),
    }
}

/// A registered connection.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    /// Identity the connection registered under.
    pub identity: String,
    /// Handle used to send to the connection.
    pub peer: PeerHandle,
    /// Normalized auxiliary address.
    pub aux_address: String,
    /// Registration time, milliseconds since the Unix epoch.
    pub registered_at: u64,
}

impl ConnectionRecord {
    /// Connection that owns this record.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.peer.id()
    }

    /// Check if the underlying connection is still open.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.peer.is_open()
    }
}

/// Registry slot: a record plus the probe whose lifetime it bounds.
struct Slot {
    record: ConnectionRecord,
    probe: LivenessProbe,
    seq: u64,
}

impl Slot {
    /// Stop the probe and log removal.
    fn teardown(mut self, reason: &'static str) -> ConnectionRecord {
        self.probe.stop();
        debug!(
            identity = %self.record.identity,
            connection = %self.record.peer.id(),
            pings = self.probe.pings_sent(),
            reason,
            "Connection record removed"
        );
        self.record
    }
}

/// One row of [`Registry::snapshot`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    /// Registered identity.
    pub identity: String,
    /// Normalized auxiliary address.
    #[serde(rename = "tailscaleIp")]
    pub aux_address: String,
    /// Whether the connection is still open.
    pub liveness: LivenessState,
    /// Keepalive pings queued to the connection.
    pub pings_sent: u64,
    /// Registration time, milliseconds since the Unix epoch.
    pub registered_at: u64,
}

/// The connection registry.
///
/// Mutations for one identity are serialized by the map's shard lock, so two
/// concurrent registrations of the same identity can never both succeed with
/// live connections.
pub struct Registry {
    /// Slots indexed by identity.
    slots: DashMap<String, Slot>,
    /// Insertion sequence for snapshot ordering.
    next_seq: AtomicU64,
    /// Configuration.
    config: RegistryConfig,
}

impl Registry {
    /// Create a new registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        info!("Creating registry with config: {:?}", config);
        Self {
            slots: DashMap::new(),
            next_seq: AtomicU64::new(0),
            config,
        }
    }

    /// Register `peer` under `identity`.
    ///
    /// A record whose connection is no longer open is treated as stale and
    /// replaced. On success the connection's liveness probe is started and a
    /// copy of the new record is returned.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateIdentity`] if a live connection
    /// already holds the identity. That registration is left untouched.
    pub fn register(
        &self,
        identity: &str,
        peer: PeerHandle,
        aux_address: Option<&serde_json::Value>,
    ) -> Result<ConnectionRecord, RegistryError> {
        let record = ConnectionRecord {
            identity: identity.to_string(),
            peer,
            aux_address: normalize_address(aux_address),
            registered_at: now_millis(),
        };

        match self.slots.entry(identity.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().record.is_live() {
                    debug!(
                        identity = %identity,
                        holder = %occupied.get().record.peer.id(),
                        requester = %record.peer.id(),
                        "Duplicate registration rejected"
                    );
                    return Err(RegistryError::DuplicateIdentity(identity.to_string()));
                }
                let slot = self.new_slot(record.clone());
                let stale = occupied.insert(slot);
                stale.teardown("stale");
            }
            Entry::Vacant(vacant) => {
                vacant.insert(self.new_slot(record.clone()));
            }
        }

        info!(
            identity = %identity,
            connection = %record.peer.id(),
            aux_address = %record.aux_address,
            "Registered"
        );
        Ok(record)
    }

    fn new_slot(&self, record: ConnectionRecord) -> Slot {
        let probe = LivenessProbe::spawn(record.peer.clone(), self.config.probe_interval);
        Slot {
            record,
            probe,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Look up the record for `identity`.
    #[must_use]
    pub fn lookup(&self, identity: &str) -> Option<ConnectionRecord> {
        self.slots.get(identity).map(|slot| slot.record.clone())
    }

    /// Remove the record for `identity` if it belongs to `connection`.
    ///
    /// Does nothing when the identity is absent or has since been taken over
    /// by another connection. Returns the removed record.
    pub fn remove(&self, identity: &str, connection: ConnectionId) -> Option<ConnectionRecord> {
        self.slots
            .remove_if(identity, |_, slot| slot.record.peer.id() == connection)
            .map(|(_, slot)| slot.teardown("closed"))
    }

    /// Get registered identities in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        let mut rows: Vec<(u64, RegistryEntry)> = self
            .slots
            .iter()
            .map(|slot| {
                (
                    slot.seq,
                    RegistryEntry {
                        identity: slot.record.identity.clone(),
                        aux_address: slot.record.aux_address.clone(),
                        liveness: LivenessState::of(&slot.record.peer),
                        pings_sent: slot.probe.pings_sent(),
                        registered_at: slot.record.registered_at,
                    },
                )
            })
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        rows.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Number of registered identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let registered = self.slots.len();
        let live = self
            .slots
            .iter()
            .filter(|slot| slot.record.is_live())
            .count();
        RegistryStats {
            registered,
            live,
            stale: registered.saturating_sub(live),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of records.
    pub registered: usize,
    /// Records whose connection is open.
    pub live: usize,
    /// Records whose connection has gone away.
    pub stale: usize,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
