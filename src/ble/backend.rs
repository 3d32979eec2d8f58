//! Host BLE capability boundary.
//! The connection state machine talks to these traits only; the production
//! implementation lives in `bluest_backend` and the test suite drives the
//! same machine with a scripted mock.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::BridgeError;

/// Stable attributes of the target peripheral for one process lifetime.
/// Re-acquired on every scan, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    /// Advertised name; the scan matched this exactly.
    pub name: String,
    /// Transport address when the platform exposes one.
    pub address: Option<String>,
    /// Platform-specific identifier.
    pub id: String,
}

/// A service discovered on the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
}

/// A characteristic discovered within a service, with the capabilities the
/// bridge cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub can_notify: bool,
    pub can_write: bool,
    pub can_write_without_response: bool,
}

impl CharacteristicInfo {
    /// Preferred write mode: acknowledged when the characteristic supports
    /// it, unacknowledged otherwise.
    pub fn preferred_write_mode(&self) -> Option<WriteMode> {
        if self.can_write {
            Some(WriteMode::WithResponse)
        } else if self.can_write_without_response {
            Some(WriteMode::WithoutResponse)
        } else {
            None
        }
    }
}

/// Acknowledged vs. unacknowledged GATT write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// Frames received on the notify channel. The channel closing signals link
/// loss; a received `Err` is a host-stack stream fault, treated the same.
pub type NotifyReceiver = mpsc::Receiver<Result<Vec<u8>, BridgeError>>;

/// Central-role scan capability.
#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Scans until a peripheral advertising exactly `name` appears, then
    /// stops scanning and returns it (first match wins, no RSSI ranking).
    /// Returns an error when `cancel` fires first.
    async fn scan_for(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn BlePeripheral>, BridgeError>;
}

/// A discovered, not-yet-connected peripheral.
#[async_trait]
pub trait BlePeripheral: Send + Sync {
    fn identity(&self) -> DeviceIdentity;

    /// Establishes the physical link.
    async fn connect(&self) -> Result<Box<dyn BleLink>, BridgeError>;
}

/// An established link to the peripheral.
#[async_trait]
pub trait BleLink: Send + Sync {
    /// Enumerates all services; not restricted to a known UUID because some
    /// firmware variants omit the documented one.
    async fn services(&self) -> Result<Vec<ServiceInfo>, BridgeError>;

    /// Enumerates the characteristics of `service`.
    async fn characteristics(
        &self,
        service: &ServiceInfo,
    ) -> Result<Vec<CharacteristicInfo>, BridgeError>;

    /// Subscribes to notifications. Resolves only once the host stack has
    /// confirmed the subscription; the returned channel carries frames until
    /// the link drops.
    async fn subscribe(
        &self,
        characteristic: &CharacteristicInfo,
    ) -> Result<NotifyReceiver, BridgeError>;

    /// Writes `payload` to `characteristic` using `mode`.
    async fn write(
        &self,
        characteristic: &CharacteristicInfo,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), BridgeError>;

    /// Tears the link down.
    async fn close(&self) -> Result<(), BridgeError>;
}
