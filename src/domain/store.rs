//! State Store
//!
//! Holds the single authoritative [`DeviceState`] for a device and fans every
//! change out to subscribers. Both the command path (optimistic updates) and the
//! notification path write here, from different tasks, so all access goes
//! through one short-lived lock.
//!
//! Subscribers run outside that lock but in revision order: an apply waits for
//! the previous revision's callbacks to finish before running its own.

use crate::domain::models::{DeviceState, PortUpdate, StateDelta};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tracing::{trace, warn};

pub type StateCallback = Arc<dyn Fn(&DeviceState) + Send + Sync>;

/// Handle returned by [`StateStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Inner {
    state: DeviceState,
    subscribers: Vec<(SubscriptionId, StateCallback)>,
    next_id: u64,
}

pub struct StateStore {
    inner: Mutex<Inner>,
    /// Last revision whose callbacks have finished
    delivered: Mutex<u64>,
    turn: Condvar,
}

/// Exclusive right to run callbacks for one revision. Releasing it, including
/// by unwinding out of a panicking callback, hands the turn to the next one.
struct DeliveryTurn<'a> {
    delivered: MutexGuard<'a, u64>,
    turn: &'a Condvar,
    revision: u64,
}

impl Drop for DeliveryTurn<'_> {
    fn drop(&mut self) {
        *self.delivered = self.revision;
        self.turn.notify_all();
    }
}

impl StateStore {
    /// Create a store with every port zeroed.
    pub fn new(port_count: u8) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: DeviceState::new(port_count),
                subscribers: Vec::new(),
                next_id: 0,
            }),
            delivered: Mutex::new(0),
            turn: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking subscriber runs outside the lock, so poisoning only means a
        // panic mid-merge; the state itself is still a valid map.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait until every earlier revision has been delivered.
    fn delivery_turn(&self, revision: u64) -> DeliveryTurn<'_> {
        let delivered = self.delivered.lock().unwrap_or_else(|p| p.into_inner());
        let delivered = self
            .turn
            .wait_while(delivered, |last| *last + 1 < revision)
            .unwrap_or_else(|p| p.into_inner());
        DeliveryTurn {
            delivered,
            turn: &self.turn,
            revision,
        }
    }

    pub fn port_count(&self) -> u8 {
        self.lock().state.port_count()
    }

    pub fn snapshot(&self) -> DeviceState {
        self.lock().state.clone()
    }

    pub fn revision(&self) -> u64 {
        self.lock().state.revision
    }

    /// Overwrite one port and notify subscribers.
    ///
    /// Returns `false` (and changes nothing) if the port does not exist.
    pub fn apply(&self, update: PortUpdate) -> bool {
        self.apply_delta(&StateDelta::single(update))
    }

    /// Apply every part of a decoded frame as one mutation.
    ///
    /// The delta is checked first; a delta naming an unknown port is rejected
    /// whole so the map never gains or loses an index.
    pub fn apply_delta(&self, delta: &StateDelta) -> bool {
        if delta.is_empty() {
            return false;
        }

        let (snapshot, subscribers) = {
            let mut inner = self.lock();
            if let Some(bad) = delta
                .ports
                .iter()
                .find(|u| !inner.state.ports.contains_key(&u.port))
            {
                warn!("Ignoring update for unknown port {}", bad.port);
                return false;
            }

            for update in &delta.ports {
                if let Some(port) = inner.state.ports.get_mut(&update.port) {
                    port.merge(update);
                }
            }
            if let Some(telemetry) = delta.telemetry.filter(|t| !t.is_empty()) {
                let current = &mut inner.state.telemetry;
                current.temperature = telemetry.temperature.or(current.temperature);
                current.humidity = telemetry.humidity.or(current.humidity);
            }
            inner.state.revision += 1;

            let subscribers: Vec<StateCallback> =
                inner.subscribers.iter().map(|(_, cb)| cb.clone()).collect();
            (inner.state.clone(), subscribers)
        };

        trace!(revision = snapshot.revision, "State updated");
        let _turn = self.delivery_turn(snapshot.revision);
        for callback in subscribers {
            callback(&snapshot);
        }
        true
    }

    /// Register a callback run after every successful apply, including ones
    /// that did not change any value.
    ///
    /// Callbacks may read the store but must not apply to it.
    pub fn subscribe(&self, callback: impl Fn(&DeviceState) + Send + Sync + 'static) -> SubscriptionId {
        let mut inner = self.lock();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.subscribers.push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|(sid, _)| *sid != id);
        inner.subscribers.len() != before
    }
}
