//! Connection registry
//!
//! Single source of truth for which connections exist and what each one is
//! subscribed to. Two indices are kept:
//! - forward: connection → subscribed instruments (cleanup on disconnect)
//! - reverse: instrument → subscribed connections (fan-out without scanning)
//!
//! Both live behind one `RwLock`, so every mutation updates them together.
//! A desync between the two can only come from a bug in this module; it is
//! reported with `error!` and then panics rather than serving from
//! inconsistent state.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error};
use types::instrument::InstrumentName;

use crate::outbox::Outbox;

/// Unique connection identifier.
pub type ConnectionId = u64;

/// Registry failures reported back to the requesting client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),

    #[error("subscription limit reached: at most {limit} instruments per connection")]
    SubscriptionLimit { limit: usize },
}

/// A subscriber handle returned for fan-out.
#[derive(Clone)]
pub struct Subscriber {
    pub id: ConnectionId,
    pub outbox: Arc<Outbox>,
}

struct ConnectionEntry {
    outbox: Arc<Outbox>,
    subscriptions: BTreeSet<InstrumentName>,
    /// Unix milliseconds at registration.
    connected_at: i64,
}

#[derive(Default)]
struct RegistryState {
    connections: BTreeMap<ConnectionId, ConnectionEntry>,
    subscribers: HashMap<InstrumentName, BTreeSet<ConnectionId>>,
}

/// Tracks live connections and their subscription sets.
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
    next_id: AtomicU64,
    max_subscriptions: usize,
}

impl ConnectionRegistry {
    pub fn new(max_subscriptions: usize) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            next_id: AtomicU64::new(1),
            max_subscriptions,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new connection with an empty subscription set.
    pub fn register(&self, outbox: Arc<Outbox>) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.write().connections.insert(
            id,
            ConnectionEntry {
                outbox,
                subscriptions: BTreeSet::new(),
                connected_at: Utc::now().timestamp_millis(),
            },
        );
        debug!(connection_id = id, "Registered connection");
        id
    }

    /// Remove a connection and all of its subscriptions.
    ///
    /// Idempotent: returns `false` if the connection was already gone.
    pub fn deregister(&self, id: ConnectionId) -> bool {
        let mut state = self.write();
        let Some(entry) = state.connections.remove(&id) else {
            return false;
        };

        for instrument in &entry.subscriptions {
            detach(&mut state.subscribers, instrument, id);
        }
        debug!(
            connection_id = id,
            subscriptions = entry.subscriptions.len(),
            connected_ms = Utc::now().timestamp_millis() - entry.connected_at,
            "Deregistered connection"
        );
        true
    }

    /// Subscribe a connection to an instrument.
    ///
    /// Returns `true` if the subscription is new.
    pub fn subscribe(
        &self,
        id: ConnectionId,
        instrument: &InstrumentName,
    ) -> Result<bool, RegistryError> {
        let mut state = self.write();
        let entry = state
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;

        if entry.subscriptions.contains(instrument) {
            return Ok(false);
        }
        if entry.subscriptions.len() >= self.max_subscriptions {
            return Err(RegistryError::SubscriptionLimit {
                limit: self.max_subscriptions,
            });
        }

        entry.subscriptions.insert(instrument.clone());
        let added = state
            .subscribers
            .entry(instrument.clone())
            .or_default()
            .insert(id);
        if !added {
            invariant_violation(id, instrument.as_str(), "reverse index already held connection");
        }
        Ok(true)
    }

    /// Unsubscribe a connection from an instrument.
    ///
    /// Returns `true` if the connection was subscribed.
    pub fn unsubscribe(
        &self,
        id: ConnectionId,
        instrument: &InstrumentName,
    ) -> Result<bool, RegistryError> {
        let mut state = self.write();
        let entry = state
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;

        if !entry.subscriptions.remove(instrument) {
            return Ok(false);
        }
        detach(&mut state.subscribers, instrument, id);
        Ok(true)
    }

    /// All connections currently subscribed to `instrument`.
    pub fn subscribers_of(&self, instrument: &str) -> Vec<Subscriber> {
        let state = self.read();
        let Some(ids) = state.subscribers.get(instrument) else {
            return Vec::new();
        };

        ids.iter()
            .map(|id| match state.connections.get(id) {
                Some(entry) => Subscriber {
                    id: *id,
                    outbox: Arc::clone(&entry.outbox),
                },
                None => invariant_violation(
                    *id,
                    instrument,
                    "reverse index names an unregistered connection",
                ),
            })
            .collect()
    }

    /// Instruments a connection is subscribed to, or `None` if unknown.
    pub fn subscriptions_of(&self, id: ConnectionId) -> Option<Vec<InstrumentName>> {
        self.read()
            .connections
            .get(&id)
            .map(|entry| entry.subscriptions.iter().cloned().collect())
    }

    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.read().connections.contains_key(&id)
    }

    pub fn is_subscribed(&self, id: ConnectionId, instrument: &str) -> bool {
        self.read()
            .connections
            .get(&id)
            .is_some_and(|entry| entry.subscriptions.contains(instrument))
    }

    /// Number of connected clients.
    pub fn connection_count(&self) -> usize {
        self.read().connections.len()
    }

    /// Total (connection, instrument) subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.read()
            .connections
            .values()
            .map(|entry| entry.subscriptions.len())
            .sum()
    }

    /// Number of instruments with at least one subscriber.
    pub fn instrument_count(&self) -> usize {
        self.read().subscribers.len()
    }

    /// Validate that the forward and reverse indices agree.
    pub fn assert_consistent(&self) {
        let state = self.read();

        for (id, entry) in &state.connections {
            for instrument in &entry.subscriptions {
                let listed = state
                    .subscribers
                    .get(instrument)
                    .is_some_and(|ids| ids.contains(id));
                if !listed {
                    invariant_violation(*id, instrument.as_str(), "forward entry missing from reverse index");
                }
            }
        }

        for (instrument, ids) in &state.subscribers {
            if ids.is_empty() {
                invariant_violation(0, instrument.as_str(), "empty reverse index entry retained");
            }
            for id in ids {
                let listed = state
                    .connections
                    .get(id)
                    .is_some_and(|entry| entry.subscriptions.contains(instrument));
                if !listed {
                    invariant_violation(*id, instrument.as_str(), "reverse entry missing from forward index");
                }
            }
        }
    }
}

/// Remove `id` from the reverse index entry of `instrument`, dropping the
/// entry once it is empty.
fn detach(
    subscribers: &mut HashMap<InstrumentName, BTreeSet<ConnectionId>>,
    instrument: &InstrumentName,
    id: ConnectionId,
) {
    let removed = match subscribers.get_mut(instrument) {
        Some(ids) => {
            let removed = ids.remove(&id);
            if ids.is_empty() {
                subscribers.remove(instrument);
            }
            removed
        }
        None => false,
    };
    if !removed {
        invariant_violation(id, instrument.as_str(), "reverse index did not hold connection");
    }
}

fn invariant_violation(id: ConnectionId, instrument: &str, reason: &str) -> ! {
    error!(connection_id = id, instrument, reason, "Registry index desync");
    panic!(
        "registry index desync for connection {} on {}: {}",
        id, instrument, reason
    );
}
