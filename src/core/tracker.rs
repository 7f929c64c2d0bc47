//! Proximity tracker: the single source of truth for the current [`Key`].

use chrono::Local;
use log::{debug, info, warn};
use tokio::sync::watch;

use crate::core::bluetooth::{ConnectionState, DisconnectReason, Generation, LinkEvent};
use crate::core::key::{Key, OUT_OF_RANGE_RSSI, PeripheralId};

/// What applying a link event did to the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerUpdate {
    /// A new snapshot was published.
    Changed,
    /// The event matched but changed nothing observable.
    Unchanged,
    /// The event belongs to a superseded connection, or no key is bound.
    Dropped,
    /// The link gave up on the key. The key was published as disconnected
    /// and is still selected; the caller decides when to clear it.
    KeyLost(String),
}

pub struct ProximityTracker {
    key: watch::Sender<Option<Key>>,
    generation: Option<Generation>,
}

impl ProximityTracker {
    pub fn new() -> Self {
        let (key, _) = watch::channel(None);
        Self {
            key,
            generation: None,
        }
    }

    /// Latest-value stream of the key; new subscribers see the current value.
    pub fn subscribe(&self) -> watch::Receiver<Option<Key>> {
        self.key.subscribe()
    }

    pub fn current(&self) -> Option<Key> {
        self.key.borrow().clone()
    }

    pub fn peripheral(&self) -> Option<PeripheralId> {
        self.key.borrow().as_ref().map(|k| k.address.clone())
    }

    /// Replaces the tracked key. The new key is not bound to any connection yet.
    pub fn select(&mut self, key: Key) {
        info!("Tracking key {} ({})", key.name, key.address);
        self.generation = None;
        self.key.send_replace(Some(key));
    }

    /// Accepts events from this connection generation from now on.
    pub fn bind(&mut self, generation: Generation) {
        self.generation = Some(generation);
    }

    /// Stops accepting events; anything still in flight is dropped.
    pub fn unbind(&mut self) {
        self.generation = None;
    }

    pub fn clear(&mut self) {
        self.generation = None;
        if self.key.send_replace(None).is_some() {
            info!("Key cleared");
        }
    }

    pub fn apply(&mut self, event: &LinkEvent) -> TrackerUpdate {
        if self.generation != Some(event.generation()) {
            debug!(
                "Dropping event from generation {} (bound: {:?})",
                event.generation(),
                self.generation
            );
            return TrackerUpdate::Dropped;
        }

        match event {
            LinkEvent::ConnectionStateChanged { state, .. } => {
                self.modify(|key| match state {
                    ConnectionState::Connected => {
                        let changed = !key.connected;
                        key.connected = true;
                        changed
                    }
                    ConnectionState::Disconnected(
                        DisconnectReason::TransportTimeout | DisconnectReason::Disconnected,
                    ) => {
                        let changed = key.connected
                            || key.signal_strength != Some(OUT_OF_RANGE_RSSI)
                            || key.signal_fresh;
                        key.connected = false;
                        key.signal_strength = Some(OUT_OF_RANGE_RSSI);
                        key.signal_fresh = false;
                        changed
                    }
                    // A failure code keeps the last reading as a stale hint.
                    ConnectionState::Disconnected(DisconnectReason::OperationFailed(_)) => {
                        let changed = key.connected || key.signal_fresh;
                        key.connected = false;
                        key.signal_fresh = false;
                        changed
                    }
                })
            }
            LinkEvent::SampleReady { rssi, .. } => {
                let connected = self.key.borrow().as_ref().is_some_and(|k| k.connected);
                if !connected {
                    debug!("Dropping RSSI sample {} taken outside a live connection", rssi);
                    return TrackerUpdate::Dropped;
                }
                debug!("RSSI read success: {} at {}", rssi, Local::now().format("%Y-%m-%d %H:%M:%S"));
                self.modify(|key| {
                    key.signal_strength = Some(*rssi);
                    key.last_seen = Some(Local::now());
                    key.signal_fresh = true;
                    true
                })
            }
            LinkEvent::SampleFailed { reason, .. } => {
                warn!("RSSI read failed: {:?}", reason);
                TrackerUpdate::Unchanged
            }
            LinkEvent::NameResolved { name, .. } => self.modify(|key| {
                let changed = key.name != *name;
                key.name = name.clone();
                changed
            }),
            LinkEvent::ConnectFailed { error, .. } => {
                self.modify(|key| {
                    let changed = key.connected || key.signal_fresh;
                    key.connected = false;
                    key.signal_fresh = false;
                    changed
                });
                self.generation = None;
                TrackerUpdate::KeyLost(error.clone())
            }
        }
    }

    fn modify(&mut self, f: impl FnOnce(&mut Key) -> bool) -> TrackerUpdate {
        let changed = self.key.send_if_modified(|slot| match slot.as_mut() {
            Some(key) => f(key),
            None => false,
        });
        if changed {
            TrackerUpdate::Changed
        } else {
            TrackerUpdate::Unchanged
        }
    }
}

impl Default for ProximityTracker {
    fn default() -> Self {
        Self::new()
    }
}
