//! Lock decision engine.
//!
//! ```text
//!   Disarmed --arm--> Armed --wake / lock--> GracePeriod
//!      ^                ^                        |
//!      |                +------ timer elapsed ---+
//!      +---- disarm (from either armed state) ---+
//! ```
//!
//! Only `Armed` evaluates snapshots. A wake event while already in the grace
//! period does not restart the timer.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::settings::Settings;
use crate::core::error::LockError;
use crate::core::gate::LockGate;
use crate::core::key::Key;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    Disarmed,
    Armed,
    GracePeriod,
}

/// Fired by the grace timer; stale epochs are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraceExpired {
    epoch: u64,
}

/// Outcome of evaluating a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// Not armed, or in the grace period.
    Suspended,
    /// The key is close enough.
    Clear,
    /// The device was locked and a grace period started.
    Locked,
    /// The lock capability refused; still armed, no grace period.
    NotAuthorized(String),
}

/// One slot for the grace timer; at most one is live.
struct GraceTimer {
    epoch: u64,
    live: Option<CancellationToken>,
    expired: mpsc::UnboundedSender<GraceExpired>,
}

impl GraceTimer {
    fn start(&mut self, duration: Duration) {
        self.cancel();
        self.epoch += 1;
        let epoch = self.epoch;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let expired = self.expired.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(duration) => {
                    let _ = expired.send(GraceExpired { epoch });
                }
            }
        });
        self.live = Some(cancel);
    }

    fn cancel(&mut self) {
        if let Some(cancel) = self.live.take() {
            cancel.cancel();
            debug!("Grace timer {} cancelled", self.epoch);
        }
    }

    /// Consumes the expiry if it belongs to the live timer.
    fn accept(&mut self, expired: GraceExpired) -> bool {
        if self.live.is_some() && expired.epoch == self.epoch {
            self.live = None;
            true
        } else {
            false
        }
    }
}

pub struct LockDecisionEngine {
    state: EngineState,
    gate: Arc<dyn LockGate>,
    grace: GraceTimer,
}

impl LockDecisionEngine {
    pub fn new(gate: Arc<dyn LockGate>, expired: mpsc::UnboundedSender<GraceExpired>) -> Self {
        Self {
            state: EngineState::Disarmed,
            gate,
            grace: GraceTimer {
                epoch: 0,
                live: None,
                expired,
            },
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_armed(&self) -> bool {
        self.state != EngineState::Disarmed
    }

    pub fn in_grace_period(&self) -> bool {
        self.state == EngineState::GracePeriod
    }

    /// Returns true if this armed a disarmed engine. The caller evaluates the
    /// current snapshot right away.
    pub fn arm(&mut self) -> bool {
        if self.state != EngineState::Disarmed {
            return false;
        }
        info!("Lock policy armed");
        self.state = EngineState::Armed;
        true
    }

    pub fn disarm(&mut self) -> bool {
        self.grace.cancel();
        if self.state == EngineState::Disarmed {
            return false;
        }
        info!("Lock policy disarmed");
        self.state = EngineState::Disarmed;
        true
    }

    /// The owner proved presence (e.g. unlocked the device). Opens a grace period.
    pub fn user_present(&mut self, grace_period: Duration) -> bool {
        match self.state {
            EngineState::Armed => {
                info!("Starting grace period of {:?}", grace_period);
                self.enter_grace(grace_period);
                true
            }
            EngineState::GracePeriod => {
                debug!("Already in grace period, ignoring wake event");
                false
            }
            EngineState::Disarmed => false,
        }
    }

    /// Returns true if the grace period ended. The caller re-evaluates the
    /// current snapshot right away.
    pub fn grace_expired(&mut self, expired: GraceExpired) -> bool {
        if self.state != EngineState::GracePeriod || !self.grace.accept(expired) {
            debug!("Ignoring stale grace timer {:?}", expired);
            return false;
        }
        info!("Grace period ended");
        self.state = EngineState::Armed;
        true
    }

    pub fn should_lock(&self, key: Option<&Key>, signal_threshold: i16) -> bool {
        self.state == EngineState::Armed
            && key.is_some_and(|k| k.is_out_of_range(signal_threshold))
    }

    /// Applies the lock rule to `key`, locking if it fails.
    pub async fn evaluate(&mut self, key: Option<&Key>, settings: &Settings) -> Evaluation {
        match self.state {
            EngineState::Armed => {}
            _ => return Evaluation::Suspended,
        }
        if !self.should_lock(key, settings.signal_threshold) {
            return Evaluation::Clear;
        }

        if let Some(k) = key {
            info!(
                "Key {} out of range (connected: {}, RSSI: {:?}), attempting lock",
                k.name, k.connected, k.signal_strength
            );
        }
        match self.gate.lock_now().await {
            Ok(()) => {
                self.enter_grace(settings.grace_period());
                Evaluation::Locked
            }
            Err(LockError::NotAuthorized(reason)) => {
                error!("ERROR LOCKING DEVICE: {}", reason);
                Evaluation::NotAuthorized(reason)
            }
        }
    }

    fn enter_grace(&mut self, grace_period: Duration) {
        self.state = EngineState::GracePeriod;
        self.grace.start(grace_period);
    }
}

impl Drop for LockDecisionEngine {
    fn drop(&mut self) {
        self.grace.cancel();
    }
}
