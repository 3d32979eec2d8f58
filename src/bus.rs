//! Message-bus boundary.
//! The host's virtual MIDI port pair is consumed behind the [`MessageBus`]
//! trait: `open` hands the bridge one sender for outgoing messages and one
//! receiver for inbound ones, both destroyed on bridge stop. Delivery is
//! best-effort with no persistence or replay.

use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::error::BridgeError;

/// A message crossing the bus in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusMessage {
    /// A MIDI control change.
    ControlChange { channel: u8, controller: u8, value: u8 },
    /// A MIDI program change.
    ProgramChange { channel: u8, program: u8 },
}

/// The port pair created at bridge start. Dropping it tears the virtual
/// ports down.
pub struct BusPorts {
    /// Outgoing messages, bridge to bus consumers.
    pub outgoing: mpsc::Sender<BusMessage>,
    /// Inbound messages, bus to bridge.
    pub incoming: mpsc::Receiver<BusMessage>,
}

/// Abstraction over the host message-bus capability.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Creates the virtual port pair. Called once per bridge start.
    async fn open(&self) -> Result<BusPorts, BridgeError>;
}

/// Queue depth of the loopback channels.
const LOOPBACK_QUEUE_DEPTH: usize = 64;

/// In-process bus: the far side of the port pair is handed back to the
/// caller, which is what the test suite and embedders talk to.
pub struct LoopbackBus {
    ports: Mutex<Option<BusPorts>>,
}

/// The caller-facing end of a [`LoopbackBus`].
pub struct LoopbackRemote {
    /// Messages the bridge published.
    pub published: mpsc::Receiver<BusMessage>,
    /// Injects inbound messages toward the bridge.
    pub inject: mpsc::Sender<BusMessage>,
}

impl LoopbackBus {
    pub fn new() -> (Self, LoopbackRemote) {
        let (out_tx, out_rx) = mpsc::channel(LOOPBACK_QUEUE_DEPTH);
        let (in_tx, in_rx) = mpsc::channel(LOOPBACK_QUEUE_DEPTH);
        let bus = Self {
            ports: Mutex::new(Some(BusPorts { outgoing: out_tx, incoming: in_rx })),
        };
        let remote = LoopbackRemote { published: out_rx, inject: in_tx };
        (bus, remote)
    }
}

#[async_trait]
impl MessageBus for LoopbackBus {
    async fn open(&self) -> Result<BusPorts, BridgeError> {
        self.ports
            .lock()
            .await
            .take()
            .ok_or_else(|| BridgeError::Bus("loopback port pair already opened".into()))
    }
}

/// Bus adapter used by the binary: logs every published message and feeds
/// nothing back. Stands in for the host MIDI service, which is outside the
/// bridge core.
pub struct LogBus {
    // Held so the bridge's incoming receiver stays open for the whole run.
    inject_keepalive: Mutex<Option<mpsc::Sender<BusMessage>>>,
}

impl LogBus {
    pub fn new() -> Self {
        Self { inject_keepalive: Mutex::new(None) }
    }
}

#[async_trait]
impl MessageBus for LogBus {
    async fn open(&self) -> Result<BusPorts, BridgeError> {
        let (out_tx, mut out_rx) = mpsc::channel::<BusMessage>(LOOPBACK_QUEUE_DEPTH);
        let (in_tx, in_rx) = mpsc::channel(LOOPBACK_QUEUE_DEPTH);
        *self.inject_keepalive.lock().await = Some(in_tx);

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                match message {
                    BusMessage::ControlChange { channel, controller, value } => {
                        info!("bus <- CC ch={} cc={} val={}", channel, controller, value);
                    }
                    BusMessage::ProgramChange { channel, program } => {
                        info!("bus <- PC ch={} prog={}", channel, program);
                    }
                }
            }
            warn!("outgoing bus port closed");
        });

        Ok(BusPorts { outgoing: out_tx, incoming: in_rx })
    }
}
