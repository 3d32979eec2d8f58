//! BlueBoard bridge library.
//! Connects a BLE foot controller to a virtual MIDI message bus: the
//! connection state machine, the device's binary protocol codec, and the
//! bidirectional routing layer with coalescing for continuous controllers.

pub mod ble;
pub mod bridge;
pub mod bus;
pub mod coalesce;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;

pub use bridge::{BridgeCoordinator, BridgeStatistics, StatsSnapshot};
pub use bus::{BusMessage, LoopbackBus, LoopbackRemote, MessageBus};
pub use config::BridgeConfig;
pub use connection::{ConnectionHandle, ConnectionManager, LinkEvent, LinkState};
pub use error::BridgeError;
pub use protocol::{DeviceCommand, DeviceEvent};
