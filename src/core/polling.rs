//! Periodic RSSI polling.

use log::{debug, info};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::settings::Settings;

/// Asks the owner to request one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTick;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTransition {
    Started,
    Stopped,
    Unchanged,
}

/// Idle/Running loop that emits a [`PollTick`] every polling interval.
///
/// The interval is re-read from the settings before every sleep, so a change
/// applies from the next tick on.
pub struct PollingLoop {
    ticks: mpsc::UnboundedSender<PollTick>,
    settings: watch::Receiver<Settings>,
    running: Option<CancellationToken>,
}

impl PollingLoop {
    pub fn new(ticks: mpsc::UnboundedSender<PollTick>, settings: watch::Receiver<Settings>) -> Self {
        Self {
            ticks,
            settings,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn set_active(&mut self, active: bool) -> PollTransition {
        match (active, self.is_running()) {
            (true, false) => {
                self.start();
                PollTransition::Started
            }
            (false, true) => {
                self.stop();
                PollTransition::Stopped
            }
            _ => PollTransition::Unchanged,
        }
    }

    fn start(&mut self) {
        let cancel = CancellationToken::new();
        let ticks = self.ticks.clone();
        let settings = self.settings.clone();
        let token = cancel.clone();

        tokio::spawn(async move {
            loop {
                if ticks.send(PollTick).is_err() {
                    break;
                }
                let interval = settings.borrow().polling_interval();
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(interval) => {}
                }
            }
            debug!("Polling task ended");
        });

        self.running = Some(cancel);
        info!("RSSI polling started");
    }

    /// Stops the loop. Stopping an idle loop is a no-op.
    pub fn stop(&mut self) {
        if let Some(cancel) = self.running.take() {
            cancel.cancel();
            info!("RSSI polling stopped");
        }
    }
}

impl Drop for PollingLoop {
    fn drop(&mut self) {
        self.stop();
    }
}
