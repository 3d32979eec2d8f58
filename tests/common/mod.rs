//! Scripted BLE backend for integration tests: a single mock peripheral
//! whose discovery shape, connect failures, subscription confirmation, and
//! link loss are all controlled by the test.

// Each test binary uses a different subset of this module.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use blueboard_bridge::ble::backend::{
    BleCentral, BleLink, BlePeripheral, CharacteristicInfo, DeviceIdentity, NotifyReceiver,
    ServiceInfo, WriteMode,
};
use blueboard_bridge::ble::{UUID_GENERIC_ACCESS_SERVICE, UUID_MIDI_IO_CHAR, UUID_MIDI_SERVICE};
use blueboard_bridge::error::BridgeError;

pub const MOCK_NOTIFY_CHAR: Uuid = Uuid::from_u128(0x1111);

type FrameSender = mpsc::Sender<Result<Vec<u8>, BridgeError>>;

/// Scripted device state shared between the test and the backend.
pub struct MockDevice {
    pub name: String,
    services: Vec<ServiceInfo>,
    characteristics: Vec<CharacteristicInfo>,
    /// Every payload written to the device, in order.
    writes: Mutex<Vec<Vec<u8>>>,
    notify_tx: Mutex<Option<FrameSender>>,
    /// When gating is enabled, subscribe() blocks until a permit arrives.
    pub subscribe_gate: Semaphore,
    gated: AtomicBool,
    /// Remaining connect attempts to refuse.
    fail_connects: AtomicU32,
    /// When set, connect attempts never resolve.
    stall_connects: AtomicBool,
    /// When set, service discovery never resolves.
    stall_services: AtomicBool,
    /// Added latency per acknowledged write.
    write_delay: Mutex<Duration>,
    pub connect_count: AtomicU32,
    pub scan_count: AtomicU32,
    /// When false, the peripheral is never discovered.
    pub online: AtomicBool,
}

impl MockDevice {
    /// The standard four-button controller shape: one housekeeping service
    /// plus the documented protocol service with a notify characteristic
    /// and the documented write characteristic.
    pub fn controller(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            services: vec![
                ServiceInfo { uuid: UUID_GENERIC_ACCESS_SERVICE },
                ServiceInfo { uuid: UUID_MIDI_SERVICE },
            ],
            characteristics: vec![
                CharacteristicInfo {
                    uuid: MOCK_NOTIFY_CHAR,
                    can_notify: true,
                    can_write: false,
                    can_write_without_response: false,
                },
                CharacteristicInfo {
                    uuid: UUID_MIDI_IO_CHAR,
                    can_notify: false,
                    can_write: true,
                    can_write_without_response: true,
                },
            ],
            writes: Mutex::new(Vec::new()),
            notify_tx: Mutex::new(None),
            subscribe_gate: Semaphore::new(0),
            gated: AtomicBool::new(false),
            fail_connects: AtomicU32::new(0),
            stall_connects: AtomicBool::new(false),
            stall_services: AtomicBool::new(false),
            write_delay: Mutex::new(Duration::ZERO),
            connect_count: AtomicU32::new(0),
            scan_count: AtomicU32::new(0),
            online: AtomicBool::new(true),
        })
    }

    /// Makes subscribe() wait for `subscribe_gate` permits.
    pub fn gate_subscription(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    /// Refuses the next `count` connect attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.fail_connects.store(count, Ordering::SeqCst);
    }

    /// Makes every connect attempt hang forever.
    pub fn stall_connect_attempts(&self) {
        self.stall_connects.store(true, Ordering::SeqCst);
    }

    /// Makes service discovery hang forever.
    pub fn stall_service_discovery(&self) {
        self.stall_services.store(true, Ordering::SeqCst);
    }

    /// Each acknowledged write takes `delay` before completing.
    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = delay;
    }

    /// Pushes a frame through the notify channel, as the device would.
    pub async fn inject(&self, frame: &[u8]) {
        let sender = self.notify_tx.lock().unwrap().clone();
        let sender = sender.expect("no active subscription to inject into");
        sender.send(Ok(frame.to_vec())).await.expect("notify receiver dropped");
    }

    /// Simulates unsolicited link loss by closing the notify channel.
    pub fn drop_link(&self) {
        *self.notify_tx.lock().unwrap() = None;
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().unwrap().clear();
    }
}

/// Central that always "discovers" the one scripted device (while online).
pub struct MockCentral {
    pub device: Arc<MockDevice>,
}

impl MockCentral {
    pub fn new(device: Arc<MockDevice>) -> Arc<Self> {
        Arc::new(Self { device })
    }
}

#[async_trait]
impl BleCentral for MockCentral {
    async fn scan_for(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn BlePeripheral>, BridgeError> {
        self.device.scan_count.fetch_add(1, Ordering::SeqCst);
        if name != self.device.name || !self.device.online.load(Ordering::SeqCst) {
            cancel.cancelled().await;
            return Err(BridgeError::Backend("scan cancelled".into()));
        }
        Ok(Box::new(MockPeripheral { device: self.device.clone() }))
    }
}

struct MockPeripheral {
    device: Arc<MockDevice>,
}

#[async_trait]
impl BlePeripheral for MockPeripheral {
    fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            name: self.device.name.clone(),
            address: Some("C6:2A:11:00:9F:D3".to_string()),
            id: "mock-device-0".to_string(),
        }
    }

    async fn connect(&self) -> Result<Box<dyn BleLink>, BridgeError> {
        self.device.connect_count.fetch_add(1, Ordering::SeqCst);
        if self.device.stall_connects.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let remaining = self.device.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.device.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(BridgeError::Backend("connect refused".into()));
        }
        Ok(Box::new(MockLink { device: self.device.clone() }))
    }
}

struct MockLink {
    device: Arc<MockDevice>,
}

#[async_trait]
impl BleLink for MockLink {
    async fn services(&self) -> Result<Vec<ServiceInfo>, BridgeError> {
        if self.device.stall_services.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self.device.services.clone())
    }

    async fn characteristics(
        &self,
        service: &ServiceInfo,
    ) -> Result<Vec<CharacteristicInfo>, BridgeError> {
        if service.uuid == UUID_MIDI_SERVICE {
            Ok(self.device.characteristics.clone())
        } else {
            Ok(Vec::new())
        }
    }

    async fn subscribe(
        &self,
        characteristic: &CharacteristicInfo,
    ) -> Result<NotifyReceiver, BridgeError> {
        assert_eq!(characteristic.uuid, MOCK_NOTIFY_CHAR);
        if self.device.gated.load(Ordering::SeqCst) {
            let permit = self
                .device
                .subscribe_gate
                .acquire()
                .await
                .map_err(|_| BridgeError::SubscriptionFailed("gate closed".into()))?;
            permit.forget();
        }
        let (tx, rx) = mpsc::channel(32);
        *self.device.notify_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn write(
        &self,
        characteristic: &CharacteristicInfo,
        payload: &[u8],
        _mode: WriteMode,
    ) -> Result<(), BridgeError> {
        assert_eq!(characteristic.uuid, UUID_MIDI_IO_CHAR);
        let delay = *self.device.write_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.device.writes.lock().unwrap().push(payload.to_vec());
        Ok(())
    }

    async fn close(&self) -> Result<(), BridgeError> {
        self.device.drop_link();
        Ok(())
    }
}

/// Polls `predicate` until it holds or two seconds pass.
pub async fn wait_until<F: Fn() -> bool>(predicate: F) -> bool {
    for _ in 0..400 {
        if predicate() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    false
}
