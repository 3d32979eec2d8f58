//! Error taxonomy for the bridge.
//! Link-lifecycle errors are absorbed by the connection manager's retry
//! logic; the coordinator only ever observes state transitions.

use std::time::Duration;
use thiserror::Error;

/// All failures the bridge can report.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A connect attempt or discovery phase did not resolve in time.
    #[error("connection attempt timed out after {0:?}")]
    ConnectionTimeout(Duration),

    /// No usable (non-housekeeping) service was found on the peripheral.
    #[error("no usable service found on the peripheral")]
    ServiceNotFound,

    /// The selected service is missing a notify or write characteristic.
    #[error("required characteristics not found (notify found: {notify}, write found: {write})")]
    CharacteristicNotFound { notify: bool, write: bool },

    /// A write was requested while no device link is established.
    #[error("not connected to the device")]
    NotConnected,

    /// The host stack reported a failed write.
    #[error("write to the device failed: {0}")]
    WriteFailed(String),

    /// Subscribing to the notify characteristic failed or was never confirmed.
    #[error("subscription to notifications failed: {0}")]
    SubscriptionFailed(String),

    /// Any other error surfaced by the host Bluetooth layer.
    #[error("bluetooth backend error: {0}")]
    Backend(String),

    /// The message bus is unavailable or already torn down.
    #[error("message bus unavailable: {0}")]
    Bus(String),

    /// Configuration could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),
}
