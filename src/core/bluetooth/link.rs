//! The signal link: one connection to the selected key at a time.
//!
//! The link never reports transport failures as errors. Everything the radio
//! does is folded into [`LinkEvent`]s sent to a single subscriber, each
//! stamped with the [`Generation`] of the connection that produced it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::constants::{
    BLUETOOTH_OPERATION_TIMEOUT_SECS, CONNECT_RETRY_DELAY_MS, MAX_CONNECT_RETRIES,
    RSSI_READ_TIMEOUT_SECS,
};
use crate::core::bluetooth::transport::Transport;
use crate::core::bluetooth::types::{ConnectionState, DisconnectReason, Generation, LinkEvent};
use crate::core::error::TransportError;
use crate::core::key::PeripheralId;

/// Timing of connection attempts and reads.
#[derive(Debug, Clone)]
pub struct LinkPolicy {
    pub connect_timeout: Duration,
    pub retry_delay: Duration,
    pub sample_timeout: Duration,
    /// Consecutive "not found" attempts tolerated before giving up
    pub max_missing_attempts: u32,
}

impl Default for LinkPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(BLUETOOTH_OPERATION_TIMEOUT_SECS),
            retry_delay: Duration::from_millis(CONNECT_RETRY_DELAY_MS),
            sample_timeout: Duration::from_secs(RSSI_READ_TIMEOUT_SECS),
            max_missing_attempts: MAX_CONNECT_RETRIES,
        }
    }
}

struct ActiveLink {
    peripheral: PeripheralId,
    generation: Generation,
    connected: Arc<AtomicBool>,
    /// Read failures that mean the connection is gone
    lost: mpsc::UnboundedSender<DisconnectReason>,
    cancel: CancellationToken,
}

/// Result of [`SignalLink::connect`].
#[derive(Debug)]
pub struct Connecting {
    pub generation: Generation,
    /// Teardown of the link this one replaces, for immediate delivery.
    pub superseded: Option<LinkEvent>,
}

pub struct SignalLink {
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<LinkEvent>,
    policy: LinkPolicy,
    generation: Generation,
    active: Option<ActiveLink>,
}

impl SignalLink {
    pub fn new(
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedSender<LinkEvent>,
        policy: LinkPolicy,
    ) -> Self {
        Self {
            transport,
            events,
            policy,
            generation: 0,
            active: None,
        }
    }

    /// Starts maintaining a connection to `peripheral`, replacing any current link.
    ///
    /// The connection task keeps reconnecting until [`disconnect`](Self::disconnect)
    /// or until the peripheral cannot be found at all.
    pub fn connect(&mut self, peripheral: PeripheralId) -> Connecting {
        let superseded = self.disconnect();

        self.generation += 1;
        let generation = self.generation;
        let connected = Arc::new(AtomicBool::new(false));
        let (lost, lost_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        info!("Linking to {} (generation {})", peripheral, generation);
        tokio::spawn(maintain_connection(
            self.transport.clone(),
            peripheral.clone(),
            generation,
            connected.clone(),
            lost_rx,
            self.policy.clone(),
            self.events.clone(),
            cancel.clone(),
        ));

        self.active = Some(ActiveLink {
            peripheral,
            generation,
            connected,
            lost,
            cancel,
        });

        Connecting {
            generation,
            superseded,
        }
    }

    /// Drops the current link, if any.
    ///
    /// Returns the `Disconnected` event for the dropped generation instead of
    /// queueing it, so the caller can apply it before anything else happens.
    /// Calling this with no link is a no-op.
    pub fn disconnect(&mut self) -> Option<LinkEvent> {
        let active = self.active.take()?;
        info!("Unlinking {} (generation {})", active.peripheral, active.generation);
        active.cancel.cancel();
        active.connected.store(false, Ordering::SeqCst);

        Some(LinkEvent::ConnectionStateChanged {
            generation: active.generation,
            state: ConnectionState::Disconnected(DisconnectReason::Disconnected),
        })
    }

    /// Asks for a fresh RSSI reading. Without a live connection the request is dropped.
    ///
    /// A read that fails because the connection is gone also drops the link,
    /// which then reports the disconnect and reconnects.
    pub fn request_sample(&self) {
        let Some(active) = self.active.as_ref() else {
            debug!("No active link, dropping sample request");
            return;
        };
        if !active.connected.load(Ordering::SeqCst) {
            debug!("{} not connected yet, dropping sample request", active.peripheral);
            return;
        }

        let transport = self.transport.clone();
        let peripheral = active.peripheral.clone();
        let generation = active.generation;
        let read_timeout = self.policy.sample_timeout;
        let cancel = active.cancel.clone();
        let lost = active.lost.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = timeout(read_timeout, transport.read_rssi(&peripheral)) => result,
            };
            let event = match result {
                Ok(Ok(rssi)) => LinkEvent::SampleReady { generation, rssi },
                Ok(Err(e)) => {
                    let reason = DisconnectReason::from(&e);
                    if matches!(e, TransportError::OperationFailed { .. } | TransportError::NotConnected) {
                        let _ = lost.send(reason);
                    }
                    LinkEvent::SampleFailed { generation, reason }
                }
                Err(_) => LinkEvent::SampleFailed {
                    generation,
                    reason: DisconnectReason::TransportTimeout,
                },
            };
            let _ = events.send(event);
        });
    }

    pub fn peripheral(&self) -> Option<&PeripheralId> {
        self.active.as_ref().map(|a| &a.peripheral)
    }

    pub fn generation(&self) -> Option<Generation> {
        self.active.as_ref().map(|a| a.generation)
    }
}

impl Drop for SignalLink {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[allow(clippy::too_many_arguments)]
async fn maintain_connection(
    transport: Arc<dyn Transport>,
    peripheral: PeripheralId,
    generation: Generation,
    connected: Arc<AtomicBool>,
    mut lost: mpsc::UnboundedReceiver<DisconnectReason>,
    policy: LinkPolicy,
    events: mpsc::UnboundedSender<LinkEvent>,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => debug!("Connection task for {} cancelled", peripheral),
        _ = connection_loop(&*transport, &peripheral, generation, &connected, &mut lost, &policy, &events, &cancel) => {}
    }

    connected.store(false, Ordering::SeqCst);
    if let Err(e) = transport.disconnect(&peripheral).await {
        warn!("Failed to disconnect {}: {}", peripheral, e);
    }
}

#[allow(clippy::too_many_arguments)]
async fn connection_loop(
    transport: &dyn Transport,
    peripheral: &PeripheralId,
    generation: Generation,
    connected: &AtomicBool,
    lost: &mut mpsc::UnboundedReceiver<DisconnectReason>,
    policy: &LinkPolicy,
    events: &mpsc::UnboundedSender<LinkEvent>,
    cancel: &CancellationToken,
) {
    let emit = |event: LinkEvent| {
        if !cancel.is_cancelled() {
            let _ = events.send(event);
        }
    };
    let mut missing_attempts = 0;

    loop {
        let attempt = match timeout(policy.connect_timeout, transport.connect(peripheral)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        match attempt {
            Ok(()) => {
                missing_attempts = 0;
                while lost.try_recv().is_ok() {}
                connected.store(true, Ordering::SeqCst);
                emit(LinkEvent::ConnectionStateChanged {
                    generation,
                    state: ConnectionState::Connected,
                });

                if let Some(name) = transport.peripheral_name(peripheral).await {
                    emit(LinkEvent::NameResolved { generation, name });
                }

                let reason = tokio::select! {
                    reason = transport.wait_for_disconnect(peripheral) => reason,
                    Some(reason) = lost.recv() => {
                        if let Err(e) = transport.disconnect(peripheral).await {
                            warn!("Failed to disconnect {}: {}", peripheral, e);
                        }
                        reason
                    }
                };
                connected.store(false, Ordering::SeqCst);
                info!("Link to {} down: {:?}", peripheral, reason);
                emit(LinkEvent::ConnectionStateChanged {
                    generation,
                    state: ConnectionState::Disconnected(reason),
                });
            }
            Err(e) if e.is_fatal() => {
                missing_attempts += 1;
                warn!(
                    "Connection attempt {} to {} failed: {}",
                    missing_attempts, peripheral, e
                );
                if missing_attempts >= policy.max_missing_attempts {
                    emit(LinkEvent::ConnectFailed {
                        generation,
                        error: e.to_string(),
                    });
                    return;
                }
                emit(LinkEvent::ConnectionStateChanged {
                    generation,
                    state: ConnectionState::Disconnected(DisconnectReason::from(&e)),
                });
            }
            Err(e) => {
                missing_attempts = 0;
                warn!("Connection attempt to {} failed: {}", peripheral, e);
                emit(LinkEvent::ConnectionStateChanged {
                    generation,
                    state: ConnectionState::Disconnected(DisconnectReason::from(&e)),
                });
            }
        }

        info!("Retrying connection in {:?}...", policy.retry_delay);
        sleep(policy.retry_delay).await;
    }
}
