//! BLE central-role connection management.
//! One supervisor task owns the whole state machine: scanning, connect,
//! discovery, subscription, the connected read/write loop, and reconnect
//! with backoff. Everything else observes it through a state watch, a
//! `LinkEvent` channel, and read-only snapshots.

mod backoff;
mod session;

pub use backoff::Backoff;
pub use session::{ConnectionSession, SessionSnapshot};

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::ble::backend::{
    BleCentral, BleLink, BlePeripheral, CharacteristicInfo, DeviceIdentity, NotifyReceiver,
    ServiceInfo, WriteMode,
};
use crate::ble::{is_housekeeping_service, UUID_MIDI_IO_CHAR, UUID_MIDI_SERVICE};
use crate::config::ConnectionConfig;
use crate::error::BridgeError;

/// Queue depth of the write-request channel.
const WRITE_QUEUE_DEPTH: usize = 32;

/// States of the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    Subscribing,
    Connected,
    Disconnected,
}

/// Events delivered to the coordinator. Host callbacks are translated into
/// this one enum at the boundary; the coordinator never sees backend shapes.
#[derive(Debug)]
pub enum LinkEvent {
    /// The state machine moved to a new state.
    State(LinkState),
    /// A raw frame arrived on the notify channel.
    Notification(Vec<u8>),
}

struct WriteRequest {
    payload: Vec<u8>,
    reply: oneshot::Sender<Result<(), BridgeError>>,
}

struct Shared {
    session: std::sync::Mutex<Option<SessionSnapshot>>,
    identity: std::sync::Mutex<Option<DeviceIdentity>>,
}

/// Clonable handle to the connection task.
#[derive(Clone)]
pub struct ConnectionHandle {
    state_rx: watch::Receiver<LinkState>,
    write_tx: mpsc::Sender<WriteRequest>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl ConnectionHandle {
    /// Current state of the machine.
    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    /// Snapshot of the active session; `None` whenever not connected.
    pub fn session(&self) -> Option<SessionSnapshot> {
        self.shared.session.lock().ok().and_then(|guard| guard.clone())
    }

    /// Identity of the peripheral found by the most recent scan.
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.shared.identity.lock().ok().and_then(|guard| guard.clone())
    }

    /// Writes raw bytes to the device's write characteristic.
    /// Fails with `NotConnected` outside the `Connected` state.
    pub async fn send_raw(&self, payload: Vec<u8>) -> Result<(), BridgeError> {
        if self.state() != LinkState::Connected {
            return Err(BridgeError::NotConnected);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.write_tx
            .send(WriteRequest { payload, reply: reply_tx })
            .await
            .map_err(|_| BridgeError::NotConnected)?;
        reply_rx.await.map_err(|_| BridgeError::NotConnected)?
    }

    /// Requests an explicit stop and waits for the task to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

/// Spawns the connection supervisor task.
pub struct ConnectionManager;

impl ConnectionManager {
    pub fn spawn(
        central: Arc<dyn BleCentral>,
        device_name: String,
        config: ConnectionConfig,
        events: mpsc::Sender<LinkEvent>,
    ) -> ConnectionHandle {
        let (state_tx, state_rx) = watch::channel(LinkState::Idle);
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let shared = Arc::new(Shared {
            session: std::sync::Mutex::new(None),
            identity: std::sync::Mutex::new(None),
        });
        let cancel = CancellationToken::new();

        let runner = Runner {
            central,
            device_name,
            config,
            state_tx,
            events,
            shared: shared.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(runner.run(write_rx));

        ConnectionHandle {
            state_rx,
            write_tx,
            shared,
            cancel,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }
}

/// A fully negotiated link, ready for the connected loop.
struct Established {
    link: Box<dyn BleLink>,
    frames: NotifyReceiver,
    write_char: CharacteristicInfo,
    write_mode: WriteMode,
}

struct Runner {
    central: Arc<dyn BleCentral>,
    device_name: String,
    config: ConnectionConfig,
    state_tx: watch::Sender<LinkState>,
    events: mpsc::Sender<LinkEvent>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl Runner {
    async fn run(self, mut write_rx: mpsc::Receiver<WriteRequest>) {
        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.backoff_base_ms),
            Duration::from_millis(self.config.backoff_cap_ms),
        );

        'outer: loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.set_state(LinkState::Scanning).await;
            let peripheral = tokio::select! {
                _ = self.cancel.cancelled() => break 'outer,
                result = self.central.scan_for(&self.device_name, &self.cancel) => {
                    match result {
                        Ok(peripheral) => peripheral,
                        Err(e) => {
                            if self.cancel.is_cancelled() {
                                break 'outer;
                            }
                            warn!("Scan failed: {}", e);
                            if !self.pause(backoff.next_delay()).await {
                                break 'outer;
                            }
                            continue 'outer;
                        }
                    }
                }
            };

            let identity = peripheral.identity();
            info!("Found peripheral '{}' (address {:?})", identity.name, identity.address);
            if let Ok(mut guard) = self.shared.identity.lock() {
                *guard = Some(identity.clone());
            }

            // Bounded attempts against this peripheral, then back to scanning.
            let mut attempts = 0u32;
            let established = loop {
                attempts += 1;
                match self.establish(peripheral.as_ref()).await {
                    Ok(established) => break Some(established),
                    Err(e) => {
                        warn!(
                            "Connect attempt {}/{} failed: {}",
                            attempts, self.config.max_connect_attempts, e
                        );
                        if attempts >= self.config.max_connect_attempts {
                            break None;
                        }
                    }
                }
            };

            let Some(mut established) = established else {
                let delay = backoff.next_delay();
                info!("Giving up on this peripheral, rescanning in {:?}", delay);
                if !self.pause(delay).await {
                    break 'outer;
                }
                continue 'outer;
            };

            backoff.reset();
            let mut session = ConnectionSession::new(attempts - 1);
            self.publish_session(Some(session.snapshot()));
            // Reached only after the subscription was confirmed by the host
            // stack; writes issued on this notification cannot race it.
            self.set_state(LinkState::Connected).await;
            info!("Connected to '{}'", identity.name);

            let stop_requested = self
                .connected_loop(&mut write_rx, &mut established, &mut session)
                .await;

            session.end();
            self.publish_session(None);
            if let Err(e) = established.link.close().await {
                warn!("Error while closing link: {}", e);
            }
            self.fail_stale_writes(&mut write_rx);

            if stop_requested {
                break 'outer;
            }
            self.set_state(LinkState::Disconnected).await;
            // Unconditional restart of the scan, no user action required.
        }

        self.fail_stale_writes(&mut write_rx);
        self.set_state(LinkState::Idle).await;
        info!("Connection manager stopped");
    }

    /// The Connected-state loop. Returns true when an explicit stop ended it,
    /// false on link loss.
    async fn connected_loop(
        &self,
        write_rx: &mut mpsc::Receiver<WriteRequest>,
        established: &mut Established,
        session: &mut ConnectionSession,
    ) -> bool {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return true,
                request = write_rx.recv() => {
                    let Some(request) = request else { return true };
                    let result = established
                        .link
                        .write(&established.write_char, &request.payload, established.write_mode)
                        .await;
                    if result.is_ok() {
                        session.record_outbound(request.payload.len());
                        self.publish_session(Some(session.snapshot()));
                    }
                    let _ = request.reply.send(result);
                }
                frame = established.frames.recv() => {
                    match frame {
                        Some(Ok(bytes)) => {
                            session.record_inbound(bytes.len());
                            self.publish_session(Some(session.snapshot()));
                            self.forward_notification(bytes);
                        }
                        Some(Err(e)) => {
                            warn!("Notification stream fault: {}", e);
                            return false;
                        }
                        None => {
                            info!("Link lost");
                            return false;
                        }
                    }
                }
            }
        }
    }

    /// Runs one connect attempt through subscription confirmation.
    async fn establish(&self, peripheral: &dyn BlePeripheral) -> Result<Established, BridgeError> {
        self.set_state(LinkState::Connecting).await;
        let connect_timeout = self.config.connect_timeout();
        let link = timeout(connect_timeout, peripheral.connect())
            .await
            .map_err(|_| BridgeError::ConnectionTimeout(connect_timeout))??;

        match self.negotiate(link.as_ref()).await {
            Ok((frames, write_char, write_mode)) => {
                Ok(Established { link, frames, write_char, write_mode })
            }
            Err(e) => {
                if let Err(close_err) = link.close().await {
                    warn!("Cleanup close failed: {}", close_err);
                }
                Err(e)
            }
        }
    }

    /// Service/characteristic discovery plus subscription, each phase under
    /// its own timeout so a peripheral that stalls mid-handshake cannot hang
    /// the machine.
    async fn negotiate(
        &self,
        link: &dyn BleLink,
    ) -> Result<(NotifyReceiver, CharacteristicInfo, WriteMode), BridgeError> {
        let phase_timeout = self.config.discovery_timeout();

        self.set_state(LinkState::DiscoveringServices).await;
        let services = timeout(phase_timeout, link.services())
            .await
            .map_err(|_| BridgeError::ConnectionTimeout(phase_timeout))??;
        let service = select_service(&services)?;
        info!("Selected service {}", service.uuid);

        self.set_state(LinkState::DiscoveringCharacteristics).await;
        let characteristics = timeout(phase_timeout, link.characteristics(&service))
            .await
            .map_err(|_| BridgeError::ConnectionTimeout(phase_timeout))??;
        let (notify_char, write_char) = select_characteristics(&characteristics)?;
        let write_mode = write_char
            .preferred_write_mode()
            .ok_or(BridgeError::CharacteristicNotFound { notify: true, write: false })?;
        info!(
            "Notify characteristic {}, write characteristic {} ({:?})",
            notify_char.uuid, write_char.uuid, write_mode
        );

        self.set_state(LinkState::Subscribing).await;
        let frames = timeout(phase_timeout, link.subscribe(&notify_char))
            .await
            .map_err(|_| BridgeError::ConnectionTimeout(phase_timeout))??;

        Ok((frames, write_char, write_mode))
    }

    /// Non-blocking hand-off toward the coordinator, which may be holding
    /// its loop in a device write on the opposite direction. Blocking here
    /// would wedge the two tasks against each other, so a full event queue
    /// drops the frame instead.
    fn forward_notification(&self, bytes: Vec<u8>) {
        if let Err(e) = self.events.try_send(LinkEvent::Notification(bytes)) {
            warn!("Dropping inbound frame: {}", e);
        }
    }

    async fn set_state(&self, state: LinkState) {
        self.state_tx.send_replace(state);
        let _ = self.events.send(LinkEvent::State(state)).await;
    }

    fn publish_session(&self, snapshot: Option<SessionSnapshot>) {
        if let Ok(mut guard) = self.shared.session.lock() {
            *guard = snapshot;
        }
    }

    /// Sleeps for `delay` unless cancelled; returns false on cancellation.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Replies `NotConnected` to writes queued across a state change so
    /// stale button/controller state is never replayed after a reconnect.
    fn fail_stale_writes(&self, write_rx: &mut mpsc::Receiver<WriteRequest>) {
        while let Ok(request) = write_rx.try_recv() {
            let _ = request.reply.send(Err(BridgeError::NotConnected));
        }
    }
}

/// Prefers the documented protocol service, then falls back to the first
/// service that is not standard BLE housekeeping (some firmware variants
/// omit the documented UUID).
fn select_service(services: &[ServiceInfo]) -> Result<ServiceInfo, BridgeError> {
    if let Some(documented) = services.iter().find(|s| s.uuid == UUID_MIDI_SERVICE) {
        return Ok(*documented);
    }
    services
        .iter()
        .find(|s| !is_housekeeping_service(&s.uuid))
        .copied()
        .ok_or(BridgeError::ServiceNotFound)
}

/// Picks the notify channel (any notify-capable characteristic) and the
/// write channel (the documented id when present, else any write-capable
/// characteristic).
fn select_characteristics(
    characteristics: &[CharacteristicInfo],
) -> Result<(CharacteristicInfo, CharacteristicInfo), BridgeError> {
    let notify = characteristics.iter().find(|c| c.can_notify).copied();
    let write = characteristics
        .iter()
        .find(|c| c.uuid == UUID_MIDI_IO_CHAR && c.preferred_write_mode().is_some())
        .or_else(|| characteristics.iter().find(|c| c.preferred_write_mode().is_some()))
        .copied();
    match (notify, write) {
        (Some(notify), Some(write)) => Ok((notify, write)),
        (notify, write) => Err(BridgeError::CharacteristicNotFound {
            notify: notify.is_some(),
            write: write.is_some(),
        }),
    }
}
