//! Bridge coordination.
//! Wires the connection manager, codec, coalescer, and message bus into one
//! central event loop; owns the commanded LED state and the bridge
//! statistics, and runs the connect-time LED initialization sequence.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ble::backend::{BleCentral, DeviceIdentity};
use crate::bus::{BusMessage, BusPorts, MessageBus};
use crate::coalesce::Coalescer;
use crate::config::BridgeConfig;
use crate::connection::{ConnectionHandle, ConnectionManager, LinkEvent, LinkState, SessionSnapshot};
use crate::error::BridgeError;
use crate::protocol::{self, DeviceCommand, DeviceEvent, BRIDGE_CHANNEL, BUTTON_COUNT};

/// Queue depth of the link-event channel.
const LINK_EVENT_QUEUE_DEPTH: usize = 64;

/// Monotonic counters, reset only on bridge (re)start.
#[derive(Debug, Default)]
pub struct BridgeStatistics {
    device_to_bus: AtomicU64,
    bus_to_device: AtomicU64,
    coalesced: AtomicU64,
    unrecognized: AtomicU64,
    dropped_writes: AtomicU64,
    controllers_seen: std::sync::Mutex<BTreeSet<u8>>,
}

impl BridgeStatistics {
    fn reset(&self) {
        self.device_to_bus.store(0, Ordering::Relaxed);
        self.bus_to_device.store(0, Ordering::Relaxed);
        self.coalesced.store(0, Ordering::Relaxed);
        self.unrecognized.store(0, Ordering::Relaxed);
        self.dropped_writes.store(0, Ordering::Relaxed);
        if let Ok(mut seen) = self.controllers_seen.lock() {
            seen.clear();
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            device_to_bus: self.device_to_bus.load(Ordering::Relaxed),
            bus_to_device: self.bus_to_device.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            unrecognized: self.unrecognized.load(Ordering::Relaxed),
            dropped_writes: self.dropped_writes.load(Ordering::Relaxed),
            controllers_seen: self
                .controllers_seen
                .lock()
                .map(|seen| seen.iter().copied().collect())
                .unwrap_or_default(),
        }
    }
}

/// Immutable view of the counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub device_to_bus: u64,
    pub bus_to_device: u64,
    pub coalesced: u64,
    pub unrecognized: u64,
    pub dropped_writes: u64,
    pub controllers_seen: Vec<u8>,
}

struct Running {
    connection: ConnectionHandle,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Top-level orchestrator. The presentation layer talks to this and nothing
/// below it.
pub struct BridgeCoordinator {
    config: BridgeConfig,
    central: Arc<dyn BleCentral>,
    bus: Arc<dyn MessageBus>,
    led_state: Arc<std::sync::Mutex<[bool; BUTTON_COUNT as usize]>>,
    stats: Arc<BridgeStatistics>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl BridgeCoordinator {
    pub fn new(central: Arc<dyn BleCentral>, bus: Arc<dyn MessageBus>, config: BridgeConfig) -> Self {
        Self {
            config,
            central,
            bus,
            led_state: Arc::new(std::sync::Mutex::new([false; BUTTON_COUNT as usize])),
            stats: Arc::new(BridgeStatistics::default()),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Opens the bus port pair, spawns the connection manager and the
    /// routing loop. Statistics reset here.
    pub async fn start(&self) -> Result<(), BridgeError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(BridgeError::Bus("bridge already started".into()));
        }

        self.stats.reset();
        let ports = self.bus.open().await?;
        let (events_tx, events_rx) = mpsc::channel(LINK_EVENT_QUEUE_DEPTH);
        let connection = ConnectionManager::spawn(
            self.central.clone(),
            self.config.device_name.clone(),
            self.config.connection.clone(),
            events_tx,
        );
        let cancel = CancellationToken::new();

        let ctx = LoopCtx {
            connection: connection.clone(),
            led_state: self.led_state.clone(),
            stats: self.stats.clone(),
            config: self.config.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(ctx.run(events_rx, ports));

        *running = Some(Running { connection, cancel, task });
        info!("Bridge started, looking for '{}'", self.config.device_name);
        Ok(())
    }

    /// Cancels the routing loop, stops the connection manager, and drops the
    /// bus ports.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            warn!("Bridge loop ended abnormally: {}", e);
        }
        running.connection.stop().await;
        info!("Bridge stopped");
    }

    /// Last commanded (not confirmed) LED states, index 0 = LED 1.
    pub fn led_snapshot(&self) -> [bool; BUTTON_COUNT as usize] {
        self.led_state.lock().map(|leds| *leds).unwrap_or_default()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn connection_state(&self) -> Option<LinkState> {
        self.running.lock().await.as_ref().map(|r| r.connection.state())
    }

    pub async fn session(&self) -> Option<SessionSnapshot> {
        self.running.lock().await.as_ref().and_then(|r| r.connection.session())
    }

    pub async fn identity(&self) -> Option<DeviceIdentity> {
        self.running.lock().await.as_ref().and_then(|r| r.connection.identity())
    }
}

/// State shared with the routing loop task.
struct LoopCtx {
    connection: ConnectionHandle,
    led_state: Arc<std::sync::Mutex<[bool; BUTTON_COUNT as usize]>>,
    stats: Arc<BridgeStatistics>,
    config: BridgeConfig,
    cancel: CancellationToken,
}

impl LoopCtx {
    async fn run(self, mut link_events: mpsc::Receiver<LinkEvent>, mut ports: BusPorts) {
        let mut coalescer = Coalescer::new();
        // Token of the LED init belonging to the current link, if any.
        let mut led_init: Option<CancellationToken> = None;
        let mut flush = tokio::time::interval(self.config.coalesce_window());
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = link_events.recv() => {
                    match event {
                        None => break,
                        Some(LinkEvent::State(state)) => self.on_state(state, &mut led_init),
                        Some(LinkEvent::Notification(raw)) => {
                            self.on_frame(&raw, &mut coalescer, &ports.outgoing);
                        }
                    }
                }
                inbound = ports.incoming.recv() => {
                    match inbound {
                        None => {
                            warn!("Inbound bus port closed");
                            break;
                        }
                        Some(message) => self.route_inbound(message).await,
                    }
                }
                _ = flush.tick() => {
                    if let Some(age) = coalescer.oldest_pending_age() {
                        debug!(
                            "Flushing {} pending controller(s), oldest waited {:?}",
                            coalescer.pending_len(),
                            age
                        );
                    }
                    for message in coalescer.drain() {
                        self.publish(&ports.outgoing, message);
                    }
                    self.stats.coalesced.store(coalescer.merged_count(), Ordering::Relaxed);
                }
            }
        }
        // Dropping the ports destroys the virtual port pair; the flush tick
        // dies with this task, so nothing emits after teardown.
        debug!("Routing loop ended");
    }

    fn on_state(&self, state: LinkState, led_init: &mut Option<CancellationToken>) {
        debug!("Link state: {:?}", state);
        // Any transition obsoletes an init still running for the previous
        // link; a stale task must not interleave with the next connect's.
        if let Some(token) = led_init.take() {
            token.cancel();
        }
        if state == LinkState::Connected {
            // The device powers up with all LEDs lit; our commanded state
            // starts from all-off, enforced by the init sequence below.
            if let Ok(mut leds) = self.led_state.lock() {
                *leds = [false; BUTTON_COUNT as usize];
            }
            let token = self.cancel.child_token();
            self.spawn_led_init(token.clone());
            *led_init = Some(token);
        }
    }

    /// Runs as its own task: issuing the LED-off sequence inside the state
    /// notification path could deadlock against the connection task that
    /// produced the notification.
    fn spawn_led_init(&self, cancel: CancellationToken) {
        let connection = self.connection.clone();
        let spacing = self.config.led_init_spacing();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            info!("Initializing LEDs to off");
            for index in 1..=BUTTON_COUNT {
                if cancel.is_cancelled() {
                    return;
                }
                let command = DeviceCommand::SetLed { index, on: false };
                let Some(payload) = protocol::encode_command(&command) else {
                    continue;
                };
                if let Err(e) = connection.send_raw(payload).await {
                    warn!("LED init write for LED {} failed: {}", index, e);
                    stats.dropped_writes.fetch_add(1, Ordering::Relaxed);
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(spacing) => {}
                }
            }
        });
    }

    fn on_frame(
        &self,
        raw: &[u8],
        coalescer: &mut Coalescer,
        outgoing: &mpsc::Sender<BusMessage>,
    ) {
        match protocol::decode(raw) {
            DeviceEvent::ButtonChanged { index, pressed } => {
                // Discrete events bypass coalescing and go out immediately.
                if let Some(message) = protocol::button_control_change(index, pressed) {
                    self.publish(outgoing, message);
                }
            }
            DeviceEvent::ControlChanged { controller, value } => {
                if let Ok(mut seen) = self.stats.controllers_seen.lock() {
                    seen.insert(controller);
                }
                coalescer.offer(BRIDGE_CHANNEL, controller, value);
                self.stats.coalesced.store(coalescer.merged_count(), Ordering::Relaxed);
            }
            DeviceEvent::LedEcho { index, on } => {
                // Advisory only; the commanded state stays authoritative.
                debug!("LED {} echo: {}", index, if on { "on" } else { "off" });
            }
            DeviceEvent::Unrecognized { raw } => {
                debug!("Unrecognized frame: {:02x?}", raw);
                self.stats.unrecognized.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Inbound routing. LED-control messages are short-circuited to a device
    /// write and never also forwarded as pass-through.
    async fn route_inbound(&self, message: BusMessage) {
        match message {
            BusMessage::ControlChange { channel: _, controller, value } => {
                if let Some(index) = protocol::led_target(controller) {
                    let on = value >= 64;
                    if let Ok(mut leds) = self.led_state.lock() {
                        leds[(index - 1) as usize] = on;
                    }
                    self.write_command(&DeviceCommand::SetLed { index, on }).await;
                } else {
                    self.write_command(&DeviceCommand::PassThroughControl { controller, value })
                        .await;
                }
            }
            BusMessage::ProgramChange { channel: _, program } => {
                self.write_command(&DeviceCommand::PassThroughProgram { program }).await;
            }
        }
    }

    /// Encodes and writes one command; failures are logged and the message
    /// dropped. No retry queue: replaying stale state after a reconnect is
    /// worse than losing one message.
    async fn write_command(&self, command: &DeviceCommand) {
        let Some(payload) = protocol::encode_command(command) else {
            warn!("Dropping unencodable command: {:?}", command);
            self.stats.dropped_writes.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match self.connection.send_raw(payload).await {
            Ok(()) => {
                self.stats.bus_to_device.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("Write failed, dropping {:?}: {}", command, e);
                self.stats.dropped_writes.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Best-effort publish toward the bus; the bus offers no backpressure
    /// signal, so a full queue drops the message rather than blocking.
    fn publish(&self, outgoing: &mpsc::Sender<BusMessage>, message: BusMessage) {
        match outgoing.try_send(message) {
            Ok(()) => {
                self.stats.device_to_bus.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!("Dropping outgoing bus message: {}", e),
        }
    }
}
