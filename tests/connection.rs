//! Connection state-machine scenarios over the scripted backend.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use blueboard_bridge::config::ConnectionConfig;
use blueboard_bridge::connection::{ConnectionHandle, ConnectionManager, LinkEvent, LinkState};
use blueboard_bridge::error::BridgeError;
use common::{MockCentral, MockDevice};

fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        connect_timeout_ms: 1_000,
        discovery_timeout_ms: 1_000,
        max_connect_attempts: 2,
        backoff_base_ms: 10,
        backoff_cap_ms: 40,
    }
}

/// Like `fast_config` but with timeouts short enough that a hung phase
/// resolves within the test budget.
fn timeout_config() -> ConnectionConfig {
    ConnectionConfig {
        connect_timeout_ms: 50,
        discovery_timeout_ms: 50,
        ..fast_config()
    }
}

fn spawn_with(
    device: &std::sync::Arc<MockDevice>,
    config: ConnectionConfig,
) -> (ConnectionHandle, mpsc::Receiver<LinkEvent>) {
    let central = MockCentral::new(device.clone());
    let (events_tx, events_rx) = mpsc::channel(64);
    let handle = ConnectionManager::spawn(central, device.name.clone(), config, events_tx);
    (handle, events_rx)
}

fn spawn(device: &std::sync::Arc<MockDevice>) -> (ConnectionHandle, mpsc::Receiver<LinkEvent>) {
    spawn_with(device, fast_config())
}

async fn next_state(events: &mut mpsc::Receiver<LinkEvent>) -> LinkState {
    loop {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(LinkEvent::State(state))) => return state,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("event channel closed"),
            Err(_) => panic!("timed out waiting for a state event"),
        }
    }
}

async fn wait_for_state(events: &mut mpsc::Receiver<LinkEvent>, wanted: LinkState) {
    loop {
        if next_state(events).await == wanted {
            return;
        }
    }
}

#[tokio::test]
async fn connected_fires_only_after_subscription_confirmation() {
    let device = MockDevice::controller("Mock Pedal");
    device.gate_subscription();
    let (handle, mut events) = spawn(&device);

    assert_eq!(next_state(&mut events).await, LinkState::Scanning);
    assert_eq!(next_state(&mut events).await, LinkState::Connecting);
    assert_eq!(next_state(&mut events).await, LinkState::DiscoveringServices);
    assert_eq!(next_state(&mut events).await, LinkState::DiscoveringCharacteristics);
    assert_eq!(next_state(&mut events).await, LinkState::Subscribing);

    // The subscription was requested but not confirmed: no Connected yet.
    assert!(timeout(Duration::from_millis(150), events.recv()).await.is_err());
    assert_eq!(handle.state(), LinkState::Subscribing);
    assert!(handle.session().is_none());

    device.subscribe_gate.add_permits(1);
    assert_eq!(next_state(&mut events).await, LinkState::Connected);
    let session = handle.session().expect("session exists while connected");
    assert_eq!(session.retry_count, 0);
    assert!(session.ended_at.is_none());

    handle.stop().await;
    assert_eq!(handle.state(), LinkState::Idle);
    assert!(handle.session().is_none());
}

#[tokio::test]
async fn link_loss_restarts_scanning_without_intervention() {
    let device = MockDevice::controller("Mock Pedal");
    let (handle, mut events) = spawn(&device);

    wait_for_state(&mut events, LinkState::Connected).await;
    assert_eq!(device.connect_count.load(Ordering::SeqCst), 1);

    device.drop_link();

    assert_eq!(next_state(&mut events).await, LinkState::Disconnected);
    assert_eq!(next_state(&mut events).await, LinkState::Scanning);
    wait_for_state(&mut events, LinkState::Connected).await;

    // A fresh scan and connect happened, and the successful connect reset
    // the retry accounting back to base.
    assert_eq!(device.scan_count.load(Ordering::SeqCst), 2);
    assert_eq!(device.connect_count.load(Ordering::SeqCst), 2);
    let session = handle.session().expect("second session");
    assert_eq!(session.retry_count, 0);

    handle.stop().await;
}

#[tokio::test]
async fn failed_connects_fall_back_to_scanning() {
    let device = MockDevice::controller("Mock Pedal");
    device.fail_next_connects(100);
    let (handle, mut events) = spawn(&device);

    // First cycle: Scanning, then two refused attempts, then back to
    // Scanning after the backoff pause.
    assert_eq!(next_state(&mut events).await, LinkState::Scanning);
    assert_eq!(next_state(&mut events).await, LinkState::Connecting);
    wait_for_state(&mut events, LinkState::Scanning).await;
    assert!(device.connect_count.load(Ordering::SeqCst) >= 2);
    assert_ne!(handle.state(), LinkState::Connected);
    assert!(handle.session().is_none());

    handle.stop().await;
}

#[tokio::test]
async fn hung_connect_times_out_back_to_scanning() {
    let device = MockDevice::controller("Mock Pedal");
    device.stall_connect_attempts();
    let (handle, mut events) = spawn_with(&device, timeout_config());

    assert_eq!(next_state(&mut events).await, LinkState::Scanning);
    assert_eq!(next_state(&mut events).await, LinkState::Connecting);
    // Every attempt hangs past the connect timeout; after the attempt
    // ceiling the machine falls back to scanning instead of waiting forever.
    wait_for_state(&mut events, LinkState::Scanning).await;
    assert!(device.connect_count.load(Ordering::SeqCst) >= 2);
    assert_ne!(handle.state(), LinkState::Connected);
    assert!(handle.session().is_none());

    handle.stop().await;
}

#[tokio::test]
async fn stalled_discovery_times_out_back_to_scanning() {
    let device = MockDevice::controller("Mock Pedal");
    device.stall_service_discovery();
    let (handle, mut events) = spawn_with(&device, timeout_config());

    // The link comes up, then service discovery never answers; each phase
    // carries its own timeout, so the machine must come back to scanning.
    wait_for_state(&mut events, LinkState::DiscoveringServices).await;
    wait_for_state(&mut events, LinkState::Scanning).await;
    assert_ne!(handle.state(), LinkState::Connected);
    assert!(handle.session().is_none());

    handle.stop().await;
}

#[tokio::test]
async fn write_outside_connected_fails_with_not_connected() {
    let device = MockDevice::controller("Mock Pedal");
    device.online.store(false, Ordering::SeqCst);
    let (handle, mut events) = spawn(&device);

    wait_for_state(&mut events, LinkState::Scanning).await;
    let result = handle.send_raw(vec![0xA2, 0x10, 0x01]).await;
    assert!(matches!(result, Err(BridgeError::NotConnected)));
    assert!(device.writes().is_empty());

    handle.stop().await;
}

#[tokio::test]
async fn writes_reach_the_device_while_connected() {
    let device = MockDevice::controller("Mock Pedal");
    let (handle, mut events) = spawn(&device);

    wait_for_state(&mut events, LinkState::Connected).await;
    handle.send_raw(vec![0xA2, 0x11, 0x00]).await.unwrap();
    assert_eq!(device.writes(), vec![vec![0xA2, 0x11, 0x00]]);

    let session = handle.session().expect("session");
    assert_eq!(session.messages_out, 1);
    assert_eq!(session.bytes_out, 3);

    handle.stop().await;
}
