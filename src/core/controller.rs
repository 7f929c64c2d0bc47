//! Controller facade and the task that owns all proximity state.
//!
//! Every mutation of the tracker, the link, the polling loop and the decision
//! engine happens on one task. Commands, link events, poll ticks and grace
//! timer expiries reach it through channels and are handled one at a time.

use std::sync::Arc;

use chrono::{DateTime, Local};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SettingsStore;
use crate::config::settings::Settings;
use crate::core::bluetooth::{LinkEvent, LinkPolicy, SignalLink, Transport};
use crate::core::engine::{Evaluation, GraceExpired, LockDecisionEngine};
use crate::core::error::ControllerError;
use crate::core::gate::LockGate;
use crate::core::key::{Key, PeripheralId};
use crate::core::polling::{PollTick, PollTransition, PollingLoop};
use crate::core::tracker::{ProximityTracker, TrackerUpdate};

const COMMAND_BUFFER: usize = 32;
const NOTICE_BUFFER: usize = 16;

/// Observable controller state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ControllerStatus {
    /// Lock policy active
    pub armed: bool,
    pub in_grace_period: bool,
    /// The owning UI is visible
    pub foreground: bool,
    /// RSSI polling (and therefore the link) is running
    pub polling: bool,
}

/// One-off events for UI collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ControllerNotice {
    Locked { at: DateTime<Local> },
    /// A lock decision fired but the lock capability refused it.
    LockNotAuthorized { reason: String },
    /// The key could not be reached any more and was dropped.
    KeyLost { address: PeripheralId, reason: String },
}

enum Command {
    SelectAndLink {
        peripheral: PeripheralId,
        name: Option<String>,
    },
    Unlink,
    Arm,
    Disarm,
    SetForeground(bool),
    UserPresent,
}

struct Request {
    command: Command,
    reply: oneshot::Sender<Result<(), ControllerError>>,
}

/// Handle to a running controller.
///
/// Dropping the handle stops the controller task without waiting for it;
/// use [`shutdown`](Self::shutdown) to wait.
pub struct Controller {
    requests: mpsc::Sender<Request>,
    key: watch::Receiver<Option<Key>>,
    status: watch::Receiver<ControllerStatus>,
    notices: broadcast::Sender<ControllerNotice>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    /// Spawns the controller task. Must be called from within a tokio runtime.
    pub fn start(
        transport: Arc<dyn Transport>,
        gate: Arc<dyn LockGate>,
        store: Arc<dyn SettingsStore>,
        policy: LinkPolicy,
    ) -> Self {
        let (requests_tx, requests_rx) = mpsc::channel(COMMAND_BUFFER);
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ControllerStatus::default());
        let (notices, _) = broadcast::channel(NOTICE_BUFFER);

        let settings = store.subscribe();
        let tracker = ProximityTracker::new();
        let key = tracker.subscribe();

        let actor = ControllerActor {
            tracker,
            link: SignalLink::new(transport, link_tx, policy),
            polling: PollingLoop::new(tick_tx, settings.clone()),
            engine: LockDecisionEngine::new(gate, expired_tx),
            store,
            settings,
            foreground: false,
            status: status_tx,
            notices: notices.clone(),
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(actor.run(requests_rx, link_rx, tick_rx, expired_rx, cancel.clone()));
        info!("Controller started");

        Self {
            requests: requests_tx,
            key,
            status: status_rx,
            notices,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Tracks `peripheral`, replacing any current key.
    pub async fn select_and_link(
        &self,
        peripheral: PeripheralId,
        name: Option<String>,
    ) -> Result<(), ControllerError> {
        self.request(Command::SelectAndLink { peripheral, name }).await
    }

    /// Stops tracking, drops the key and disarms.
    pub async fn unlink(&self) -> Result<(), ControllerError> {
        self.request(Command::Unlink).await
    }

    /// Activates the lock policy. A no-op without a key.
    ///
    /// Fails with [`ControllerError::LockNotAuthorized`] if the immediate
    /// evaluation wanted to lock and the lock capability refused; the policy
    /// stays armed in that case.
    pub async fn arm(&self) -> Result<(), ControllerError> {
        self.request(Command::Arm).await
    }

    pub async fn disarm(&self) -> Result<(), ControllerError> {
        self.request(Command::Disarm).await
    }

    pub async fn set_foreground(&self, foreground: bool) -> Result<(), ControllerError> {
        self.request(Command::SetForeground(foreground)).await
    }

    /// Wake / user presence event, e.g. the device was unlocked.
    pub async fn user_present(&self) -> Result<(), ControllerError> {
        self.request(Command::UserPresent).await
    }

    /// The current key; new receivers see the latest value.
    pub fn key(&self) -> watch::Receiver<Option<Key>> {
        self.key.clone()
    }

    pub fn status(&self) -> watch::Receiver<ControllerStatus> {
        self.status.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<ControllerNotice> {
        self.notices.subscribe()
    }

    /// Stops polling, cancels the grace timer and disconnects, then waits for
    /// the controller task to finish. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!("Controller task ended abnormally: {}", e);
            }
        }
    }

    async fn request(&self, command: Command) -> Result<(), ControllerError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request { command, reply })
            .await
            .map_err(|_| ControllerError::Stopped)?;
        response.await.map_err(|_| ControllerError::Stopped)?
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ControllerActor {
    tracker: ProximityTracker,
    link: SignalLink,
    polling: PollingLoop,
    engine: LockDecisionEngine,
    store: Arc<dyn SettingsStore>,
    settings: watch::Receiver<Settings>,
    foreground: bool,
    status: watch::Sender<ControllerStatus>,
    notices: broadcast::Sender<ControllerNotice>,
}

impl ControllerActor {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
        mut ticks: mpsc::UnboundedReceiver<PollTick>,
        mut expired: mpsc::UnboundedReceiver<GraceExpired>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                request = requests.recv() => match request {
                    Some(Request { command, reply }) => {
                        let result = self.handle_command(command).await;
                        let _ = reply.send(result);
                    }
                    None => break,
                },
                Some(event) = link_events.recv() => self.handle_link_event(event).await,
                Some(expiry) = expired.recv() => {
                    if self.engine.grace_expired(expiry) {
                        self.evaluate().await;
                    }
                    self.publish_status();
                }
                Some(PollTick) = ticks.recv() => self.link.request_sample(),
            }
        }

        self.stop();
        info!("Controller stopped");
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), ControllerError> {
        match command {
            Command::SelectAndLink { peripheral, name } => {
                self.release_link();
                self.polling.stop();
                self.tracker.select(Key::new(peripheral, name));
                self.refresh_polling();
            }
            Command::Unlink => self.unlink().await,
            Command::Arm => return self.arm().await,
            Command::Disarm => {
                if self.engine.disarm() {
                    self.persist_armed(false).await;
                }
                self.refresh_polling();
            }
            Command::SetForeground(foreground) => {
                debug!("Foreground: {}", foreground);
                self.foreground = foreground;
                self.refresh_polling();
            }
            Command::UserPresent => {
                let grace_period = self.settings.borrow().grace_period();
                self.engine.user_present(grace_period);
                self.publish_status();
            }
        }
        Ok(())
    }

    async fn arm(&mut self) -> Result<(), ControllerError> {
        if self.tracker.current().is_none() {
            info!("No key selected, ignoring arm request");
            return Ok(());
        }
        if !self.engine.arm() {
            return Ok(());
        }
        self.persist_armed(true).await;
        self.refresh_polling();

        match self.evaluate().await {
            Evaluation::NotAuthorized(reason) => Err(ControllerError::LockNotAuthorized(reason)),
            _ => Ok(()),
        }
    }

    async fn unlink(&mut self) {
        self.stop();
        self.tracker.clear();
        self.persist_armed(false).await;
        self.publish_status();
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match self.tracker.apply(&event) {
            TrackerUpdate::Changed | TrackerUpdate::Unchanged => {
                self.evaluate().await;
            }
            TrackerUpdate::KeyLost(reason) => {
                self.evaluate().await;
                let address = self.tracker.peripheral();
                warn!("Key {:?} lost: {}", address, reason);
                self.unlink().await;
                if let Some(address) = address {
                    let _ = self.notices.send(ControllerNotice::KeyLost { address, reason });
                }
            }
            TrackerUpdate::Dropped => {}
        }
    }

    async fn evaluate(&mut self) -> Evaluation {
        let key = self.tracker.current();
        let settings = *self.settings.borrow();
        let evaluation = self.engine.evaluate(key.as_ref(), &settings).await;
        self.publish_status();

        match &evaluation {
            Evaluation::Locked => {
                let _ = self.notices.send(ControllerNotice::Locked { at: Local::now() });
            }
            Evaluation::NotAuthorized(reason) => {
                let _ = self.notices.send(ControllerNotice::LockNotAuthorized {
                    reason: reason.clone(),
                });
            }
            Evaluation::Suspended | Evaluation::Clear => {}
        }
        evaluation
    }

    /// Polls iff (armed or foreground) and a key is selected. The link lives
    /// exactly as long as polling does.
    fn refresh_polling(&mut self) -> PollTransition {
        let wanted = (self.engine.is_armed() || self.foreground) && self.tracker.peripheral().is_some();
        let transition = self.polling.set_active(wanted);
        match transition {
            PollTransition::Started => self.open_link(),
            PollTransition::Stopped => self.release_link(),
            PollTransition::Unchanged => {}
        }
        self.publish_status();
        transition
    }

    fn open_link(&mut self) {
        let Some(peripheral) = self.tracker.peripheral() else {
            return;
        };
        let connecting = self.link.connect(peripheral);
        if let Some(teardown) = connecting.superseded {
            self.tracker.apply(&teardown);
        }
        self.tracker.bind(connecting.generation);
    }

    fn release_link(&mut self) {
        if let Some(teardown) = self.link.disconnect() {
            self.tracker.apply(&teardown);
        }
        self.tracker.unbind();
    }

    /// Cancels polling, then the grace timer, then disconnects.
    fn stop(&mut self) {
        self.polling.stop();
        self.engine.disarm();
        self.release_link();
        self.publish_status();
    }

    async fn persist_armed(&self, armed: bool) {
        if let Err(e) = self.store.persist_armed(armed).await {
            warn!("Failed to persist armed flag: {}", e);
        }
    }

    fn publish_status(&self) {
        let status = ControllerStatus {
            armed: self.engine.is_armed(),
            in_grace_period: self.engine.in_grace_period(),
            foreground: self.foreground,
            polling: self.polling.is_running(),
        };
        self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }
}
