use std::sync::atomic::{AtomicBool, AtomicI16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::{Notify, broadcast, watch};
use tokio::time::{Instant, sleep, timeout};

use proximity_lock_lib::config::settings::Settings;
use proximity_lock_lib::config::{FileSettingsStore, SavedKey, SettingsStore};
use proximity_lock_lib::core::bluetooth::{BluetoothDevice, DisconnectReason, LinkPolicy, Transport};
use proximity_lock_lib::core::error::{ControllerError, LockError, TransportError};
use proximity_lock_lib::core::key::OUT_OF_RANGE_RSSI;
use proximity_lock_lib::core::{Controller, ControllerNotice, Key, LockGate, PeripheralId};
use proximity_lock_lib::state::AppState;

/// A key that answers while `present`, reading `rssi`.
struct FakeTransport {
    present: AtomicBool,
    missing: AtomicBool,
    rssi: AtomicI16,
    reads_fail: AtomicBool,
    read_delay_ms: AtomicU64,
    drop_link: Notify,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    reads: AtomicUsize,
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.missing.load(Ordering::SeqCst) {
            Err(TransportError::NotFound(peripheral.to_string()))
        } else if self.present.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Timeout)
        }
    }

    async fn disconnect(&self, _: &PeripheralId) -> Result<(), TransportError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_rssi(&self, _: &PeripheralId) -> Result<i16, TransportError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.reads_fail.load(Ordering::SeqCst) {
            return Err(TransportError::OperationFailed {
                code: 133,
                message: "gatt error".into(),
            });
        }
        let rssi = self.rssi.load(Ordering::SeqCst);
        sleep(Duration::from_millis(self.read_delay_ms.load(Ordering::SeqCst))).await;
        Ok(rssi)
    }

    async fn wait_for_disconnect(&self, _: &PeripheralId) -> DisconnectReason {
        self.drop_link.notified().await;
        DisconnectReason::TransportTimeout
    }

    async fn peripheral_name(&self, _: &PeripheralId) -> Option<String> {
        None
    }

    async fn available_keys(&self, _: Duration) -> Result<Vec<BluetoothDevice>, TransportError> {
        Ok(Vec::new())
    }
}

struct FakeGate {
    authorized: AtomicBool,
    locks: AtomicUsize,
}

#[async_trait::async_trait]
impl LockGate for FakeGate {
    async fn lock_now(&self) -> Result<(), LockError> {
        if !self.authorized.load(Ordering::SeqCst) {
            return Err(LockError::NotAuthorized("device admin revoked".into()));
        }
        self.locks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::SeqCst)
    }
}

struct MemoryStore {
    settings: watch::Sender<Settings>,
    armed: Mutex<Vec<bool>>,
}

#[async_trait::async_trait]
impl SettingsStore for MemoryStore {
    fn subscribe(&self) -> watch::Receiver<Settings> {
        self.settings.subscribe()
    }

    async fn persist_armed(&self, armed: bool) -> anyhow::Result<()> {
        self.armed.lock().unwrap().push(armed);
        Ok(())
    }
}

struct Harness {
    controller: Controller,
    transport: Arc<FakeTransport>,
    gate: Arc<FakeGate>,
    store: Arc<MemoryStore>,
}

impl Harness {
    fn new() -> Self {
        let transport = Arc::new(FakeTransport {
            present: AtomicBool::new(true),
            missing: AtomicBool::new(false),
            rssi: AtomicI16::new(-55),
            reads_fail: AtomicBool::new(false),
            read_delay_ms: AtomicU64::new(0),
            drop_link: Notify::new(),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
        });
        let gate = Arc::new(FakeGate {
            authorized: AtomicBool::new(true),
            locks: AtomicUsize::new(0),
        });
        let (settings, _) = watch::channel(Settings::default());
        let store = Arc::new(MemoryStore {
            settings,
            armed: Mutex::new(Vec::new()),
        });
        let controller = Controller::start(
            transport.clone(),
            gate.clone(),
            store.clone(),
            LinkPolicy::default(),
        );
        Self {
            controller,
            transport,
            gate,
            store,
        }
    }

    fn locks(&self) -> usize {
        self.gate.locks.load(Ordering::SeqCst)
    }

    fn armed(&self) -> bool {
        self.controller.status().borrow().armed
    }

    fn in_grace_period(&self) -> bool {
        self.controller.status().borrow().in_grace_period
    }

    fn persisted(&self) -> Vec<bool> {
        self.store.armed.lock().unwrap().clone()
    }

    async fn wait_key(&self, mut condition: impl FnMut(&Key) -> bool) -> Key {
        let mut rx = self.controller.key();
        let key = timeout(Duration::from_secs(300), rx.wait_for(|k| k.as_ref().is_some_and(&mut condition)))
            .await
            .expect("key condition not reached")
            .unwrap();
        key.clone().unwrap()
    }

    /// Links "tag" in the foreground and waits for a first reading of -55.
    async fn link_near_key(&self) {
        self.controller
            .select_and_link(PeripheralId::new("tag"), Some("Tag".into()))
            .await
            .unwrap();
        self.controller.set_foreground(true).await.unwrap();
        self.wait_key(|k| k.connected && k.signal_strength == Some(-55)).await;
    }

    /// Makes the key unreachable and drops the live link.
    fn walk_away(&self) {
        self.transport.present.store(false, Ordering::SeqCst);
        self.transport.drop_link.notify_one();
    }
}

async fn next_notice(notices: &mut broadcast::Receiver<ControllerNotice>) -> ControllerNotice {
    timeout(Duration::from_secs(300), notices.recv())
        .await
        .expect("no notice")
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn weak_signal_locks_once_then_grace() {
    let h = Harness::new();
    let mut notices = h.controller.notices();
    h.link_near_key().await;
    h.controller.arm().await.unwrap();
    assert_eq!(h.locks(), 0);

    h.transport.rssi.store(-75, Ordering::SeqCst);
    assert!(matches!(next_notice(&mut notices).await, ControllerNotice::Locked { .. }));
    assert_eq!(h.locks(), 1);
    assert!(h.armed());
    assert!(h.in_grace_period());

    sleep(Duration::from_secs(10)).await;
    assert_eq!(h.locks(), 1);
}

#[tokio::test(start_paused = true)]
async fn link_timeout_reads_as_out_of_range_and_locks() {
    let h = Harness::new();
    let mut notices = h.controller.notices();
    h.link_near_key().await;
    h.controller.arm().await.unwrap();

    h.walk_away();
    assert!(matches!(next_notice(&mut notices).await, ControllerNotice::Locked { .. }));

    let key = h.controller.key().borrow().clone().unwrap();
    assert!(!key.connected);
    assert_eq!(key.signal_strength, Some(OUT_OF_RANGE_RSSI));
    assert_eq!(h.locks(), 1);
}

#[tokio::test(start_paused = true)]
async fn arming_with_key_already_gone_locks_immediately() {
    let h = Harness::new();
    h.link_near_key().await;
    h.walk_away();
    h.wait_key(|k| !k.connected).await;
    assert_eq!(h.locks(), 0);

    h.controller.arm().await.unwrap();
    assert_eq!(h.locks(), 1);
    assert!(h.in_grace_period());
}

#[tokio::test(start_paused = true)]
async fn arming_in_background_with_key_absent_locks_at_once() {
    let h = Harness::new();
    h.transport.present.store(false, Ordering::SeqCst);
    h.controller.select_and_link(PeripheralId::new("tag"), None).await.unwrap();
    assert!(!h.controller.status().borrow().polling);

    h.controller.arm().await.unwrap();
    assert_eq!(h.locks(), 1);
    assert!(h.in_grace_period());
    assert!(h.controller.status().borrow().polling);
}

#[tokio::test(start_paused = true)]
async fn failed_read_counts_as_lost_link_and_locks() {
    let h = Harness::new();
    let mut notices = h.controller.notices();
    h.link_near_key().await;
    h.controller.arm().await.unwrap();

    h.transport.reads_fail.store(true, Ordering::SeqCst);
    assert!(matches!(next_notice(&mut notices).await, ControllerNotice::Locked { .. }));
    assert_eq!(h.locks(), 1);
    assert!(h.transport.disconnects.load(Ordering::SeqCst) >= 1);

    let key = h.wait_key(|k| !k.connected).await;
    assert!(!key.signal_fresh);
}

#[tokio::test(start_paused = true)]
async fn grace_period_holds_off_lock_until_it_ends() {
    let h = Harness::new();
    let mut notices = h.controller.notices();
    h.link_near_key().await;
    h.controller.arm().await.unwrap();

    h.controller.user_present().await.unwrap();
    let start = Instant::now();
    h.transport.rssi.store(-75, Ordering::SeqCst);

    sleep(Duration::from_secs(20)).await;
    assert_eq!(h.locks(), 0);
    h.controller.user_present().await.unwrap();

    assert!(matches!(next_notice(&mut notices).await, ControllerNotice::Locked { .. }));
    assert!(start.elapsed() >= Settings::default().grace_period());
    assert!(start.elapsed() < Settings::default().grace_period() + Duration::from_secs(1));
    assert_eq!(h.locks(), 1);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(h.locks(), 1);
}

#[tokio::test(start_paused = true)]
async fn refused_lock_stays_armed_and_retries() {
    let h = Harness::new();
    let mut notices = h.controller.notices();
    h.gate.authorized.store(false, Ordering::SeqCst);
    h.transport.present.store(false, Ordering::SeqCst);
    h.controller.select_and_link(PeripheralId::new("tag"), None).await.unwrap();
    h.controller.set_foreground(true).await.unwrap();
    h.wait_key(|k| k.signal_strength == Some(OUT_OF_RANGE_RSSI)).await;

    let result = h.controller.arm().await;
    assert!(matches!(result, Err(ControllerError::LockNotAuthorized(_))));
    assert!(h.armed());
    assert!(!h.in_grace_period());
    assert!(matches!(
        next_notice(&mut notices).await,
        ControllerNotice::LockNotAuthorized { .. }
    ));

    h.gate.authorized.store(true, Ordering::SeqCst);
    loop {
        match next_notice(&mut notices).await {
            ControllerNotice::Locked { .. } => break,
            ControllerNotice::LockNotAuthorized { .. } => continue,
            other => panic!("unexpected notice {:?}", other),
        }
    }
    assert_eq!(h.locks(), 1);
    assert!(h.in_grace_period());
}

#[tokio::test(start_paused = true)]
async fn threshold_change_applies_to_next_sample() {
    let h = Harness::new();
    let mut notices = h.controller.notices();
    h.link_near_key().await;
    h.controller.arm().await.unwrap();

    h.store.settings.send_modify(|s| s.signal_threshold = -50);
    assert!(matches!(next_notice(&mut notices).await, ControllerNotice::Locked { .. }));
    assert_eq!(h.locks(), 1);
}

#[tokio::test(start_paused = true)]
async fn missing_key_is_dropped_and_policy_disarmed() {
    let h = Harness::new();
    let mut notices = h.controller.notices();
    h.transport.missing.store(true, Ordering::SeqCst);
    h.controller.select_and_link(PeripheralId::new("tag"), None).await.unwrap();
    h.controller.arm().await.unwrap();

    assert!(matches!(next_notice(&mut notices).await, ControllerNotice::Locked { .. }));
    assert_eq!(
        next_notice(&mut notices).await,
        ControllerNotice::KeyLost {
            address: PeripheralId::new("tag"),
            reason: TransportError::NotFound("tag".into()).to_string(),
        }
    );

    assert!(h.controller.key().borrow().is_none());
    assert!(!h.armed());
    assert!(!h.controller.status().borrow().polling);
    assert_eq!(h.persisted().last(), Some(&false));
    assert_eq!(h.locks(), 1);
}

#[tokio::test(start_paused = true)]
async fn arm_without_key_is_a_no_op() {
    let h = Harness::new();
    h.controller.arm().await.unwrap();

    assert!(!h.armed());
    assert!(h.persisted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn disarm_twice_equals_disarm_once() {
    let h = Harness::new();
    h.link_near_key().await;
    h.controller.arm().await.unwrap();
    h.controller.user_present().await.unwrap();

    h.controller.disarm().await.unwrap();
    let once = *h.controller.status().borrow();
    h.controller.disarm().await.unwrap();

    assert_eq!(*h.controller.status().borrow(), once);
    assert!(!once.armed);
    assert!(!once.in_grace_period);
    assert_eq!(h.persisted(), vec![true, false]);
}

#[tokio::test(start_paused = true)]
async fn unlink_twice_equals_unlink_once() {
    let h = Harness::new();
    h.link_near_key().await;
    h.controller.arm().await.unwrap();

    h.controller.unlink().await.unwrap();
    let once = *h.controller.status().borrow();
    h.controller.unlink().await.unwrap();

    assert_eq!(*h.controller.status().borrow(), once);
    assert!(h.controller.key().borrow().is_none());
    assert!(!once.armed);
    assert!(!once.polling);

    sleep(Duration::from_millis(10)).await;
    assert_eq!(h.transport.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn polling_and_link_follow_foreground_while_disarmed() {
    let h = Harness::new();
    h.link_near_key().await;
    assert!(h.controller.status().borrow().polling);

    h.controller.set_foreground(false).await.unwrap();
    assert!(!h.controller.status().borrow().polling);
    let key = h.controller.key().borrow().clone().unwrap();
    assert!(!key.connected);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(h.transport.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.connects.load(Ordering::SeqCst), 1);

    h.controller.set_foreground(true).await.unwrap();
    h.wait_key(|k| k.connected).await;
    assert_eq!(h.transport.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn selecting_a_new_key_replaces_the_old_one() {
    let h = Harness::new();
    h.link_near_key().await;

    h.controller
        .select_and_link(PeripheralId::new("spare"), None)
        .await
        .unwrap();
    let key = h.controller.key().borrow().clone().unwrap();
    assert_eq!(key.address, PeripheralId::new("spare"));
    assert_eq!(key.name, "Unnamed Device");

    let key = h.wait_key(|k| k.connected).await;
    assert_eq!(key.address, PeripheralId::new("spare"));
}

#[tokio::test(start_paused = true)]
async fn stopped_controller_rejects_commands() {
    let h = Harness::new();
    h.link_near_key().await;

    h.controller.shutdown().await;
    h.controller.shutdown().await;

    assert_eq!(h.controller.arm().await, Err(ControllerError::Stopped));
    sleep(Duration::from_millis(10)).await;
    assert_eq!(h.transport.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn late_sample_from_replaced_key_is_dropped() {
    let h = Harness::new();
    h.link_near_key().await;

    h.transport.read_delay_ms.store(5_000, Ordering::SeqCst);
    h.transport.rssi.store(-20, Ordering::SeqCst);
    let reads = h.transport.reads.load(Ordering::SeqCst);
    while h.transport.reads.load(Ordering::SeqCst) == reads {
        sleep(Duration::from_millis(100)).await;
    }
    h.transport.rssi.store(-55, Ordering::SeqCst);
    h.transport.read_delay_ms.store(0, Ordering::SeqCst);

    let mut key = h.controller.key();
    let readings = tokio::spawn(async move {
        let mut readings = Vec::new();
        while key.changed().await.is_ok() {
            if let Some(k) = key.borrow_and_update().as_ref() {
                if k.address == PeripheralId::new("spare") {
                    readings.push(k.signal_strength);
                }
            }
        }
        readings
    });

    h.controller
        .select_and_link(PeripheralId::new("spare"), None)
        .await
        .unwrap();
    sleep(Duration::from_secs(10)).await;

    let key = h.controller.key().borrow().clone().unwrap();
    assert_eq!(key.address, PeripheralId::new("spare"));
    assert_eq!(key.signal_strength, Some(-55));

    h.controller.shutdown().await;
    let readings = readings.await.unwrap();
    assert!(readings.contains(&Some(-55)));
    assert!(!readings.contains(&Some(-20)), "{:?}", readings);
}

#[tokio::test(start_paused = true)]
async fn unlink_stops_polling_grace_and_link() {
    let h = Harness::new();
    let mut notices = h.controller.notices();
    h.link_near_key().await;
    h.controller.arm().await.unwrap();
    h.controller.user_present().await.unwrap();
    assert!(h.in_grace_period());

    h.controller.unlink().await.unwrap();
    let status = *h.controller.status().borrow();
    assert!(!status.polling);
    assert!(!status.in_grace_period);
    assert!(!status.armed);

    let reads = h.transport.reads.load(Ordering::SeqCst);
    sleep(Settings::default().grace_period() * 2).await;
    assert_eq!(h.transport.reads.load(Ordering::SeqCst), reads);
    assert_eq!(h.transport.connects.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.disconnects.load(Ordering::SeqCst), 1);
    assert!(notices.try_recv().is_err());
    assert_eq!(h.locks(), 0);
}

#[tokio::test(start_paused = true)]
async fn resume_with_refused_lock_stays_armed() {
    let h = Harness::new();
    h.transport.present.store(false, Ordering::SeqCst);
    h.gate.authorized.store(false, Ordering::SeqCst);

    let dir = tempfile::TempDir::new().unwrap();
    let store = FileSettingsStore::load(dir.path().join("config.json")).await.unwrap();
    store.persist_armed(true).await.unwrap();
    store
        .set_last_key(Some(SavedKey { id: "tag".into(), name: Some("Tag".into()) }))
        .await
        .unwrap();

    let app_state = AppState::with_parts(h.transport.clone(), h.gate.clone(), Arc::new(store));
    app_state.resume().await.unwrap();

    let status = *app_state.controller.status().borrow();
    assert!(status.armed);
    assert!(!status.in_grace_period);
    let key = app_state.controller.key().borrow().clone().unwrap();
    assert_eq!(key.name, "Tag");
    app_state.controller.shutdown().await;
}
