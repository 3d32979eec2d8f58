use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use log::info;

use blueboard_bridge::ble::bluest_backend::BluestCentral;
use blueboard_bridge::bus::LogBus;
use blueboard_bridge::{BridgeConfig, BridgeCoordinator};

const CONFIG_PATH: &str = "blueboard-bridge.json";

fn setup_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("Logging initialized");
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let config = BridgeConfig::load_or_default(Path::new(CONFIG_PATH)).await?;
    let central = Arc::new(BluestCentral::new().await?);
    let bus = Arc::new(LogBus::new());

    let bridge = BridgeCoordinator::new(central, bus, config);
    bridge.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    bridge.stop().await;

    let stats = bridge.stats();
    info!(
        "Forwarded {} device->bus, {} bus->device ({} merged away, {} unrecognized, {} dropped)",
        stats.device_to_bus,
        stats.bus_to_device,
        stats.coalesced,
        stats.unrecognized,
        stats.dropped_writes
    );
    Ok(())
}
