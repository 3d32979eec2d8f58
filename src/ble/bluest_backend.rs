//! Production BLE backend over the `bluest` crate.
//! Translates the host stack's objects and callbacks into the neutral
//! `BleCentral`/`BlePeripheral`/`BleLink` shapes the state machine consumes.

use async_trait::async_trait;
use bluest::{Adapter, Characteristic, Device, Service};
use futures_util::StreamExt;
use log::{debug, info, warn};
use regex::Regex;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::ble::backend::{
    BleCentral, BleLink, BlePeripheral, CharacteristicInfo, DeviceIdentity, NotifyReceiver,
    ServiceInfo, WriteMode,
};
use crate::error::BridgeError;

/// Queue depth of the per-link notification channel.
const NOTIFY_QUEUE_DEPTH: usize = 64;

fn backend_err(e: impl std::fmt::Display) -> BridgeError {
    BridgeError::Backend(e.to_string())
}

/// Pulls a MAC-looking token out of a platform device id when there is one.
/// macOS ids carry no address at all, hence the `Option`.
fn extract_mac_address(device_id: &str) -> Option<String> {
    let re = Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").ok()?;
    re.find_iter(device_id)
        .last()
        .map(|m| m.as_str().to_uppercase())
}

fn identity_of(device: &Device) -> DeviceIdentity {
    let id = device.id().to_string();
    DeviceIdentity {
        name: device.name().unwrap_or_else(|_| "Unknown".to_string()),
        address: extract_mac_address(&id),
        id,
    }
}

/// Central-role implementation over the default system adapter.
pub struct BluestCentral {
    adapter: Adapter,
}

impl BluestCentral {
    pub async fn new() -> Result<Self, BridgeError> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| BridgeError::Backend("no Bluetooth adapter found".into()))?;
        adapter.wait_available().await.map_err(backend_err)?;
        info!("Bluetooth adapter is available");
        Ok(Self { adapter })
    }

    fn name_matches(device: &Device, name: &str) -> bool {
        device.name().map(|n| n == name).unwrap_or(false)
    }
}

#[async_trait]
impl BleCentral for BluestCentral {
    async fn scan_for(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn BlePeripheral>, BridgeError> {
        // A controller the OS already holds a link to never shows up in
        // advertisements, so check connected devices first.
        for device in self.adapter.connected_devices().await.map_err(backend_err)? {
            if Self::name_matches(&device, name) {
                info!("Found already-connected peripheral {}", device.id());
                return Ok(Box::new(BluestPeripheral {
                    adapter: self.adapter.clone(),
                    device,
                }));
            }
        }

        info!("Scanning for '{}'", name);
        // No service-UUID filter: the device does not reliably advertise
        // its service, so the name is the only selector.
        let mut scan = self.adapter.scan(&[]).await.map_err(backend_err)?;
        loop {
            tokio::select! {
                discovered = scan.next() => {
                    match discovered {
                        Some(found) => {
                            debug!("Advertisement from {:?} (rssi {:?})", found.device, found.rssi);
                            if Self::name_matches(&found.device, name) {
                                info!("Matched peripheral {}", found.device.id());
                                // First match wins; dropping the stream stops the scan.
                                return Ok(Box::new(BluestPeripheral {
                                    adapter: self.adapter.clone(),
                                    device: found.device,
                                }));
                            }
                        }
                        None => {
                            return Err(BridgeError::Backend("scan stream ended".into()));
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Scan cancelled");
                    return Err(BridgeError::Backend("scan cancelled".into()));
                }
            }
        }
    }
}

struct BluestPeripheral {
    adapter: Adapter,
    device: Device,
}

#[async_trait]
impl BlePeripheral for BluestPeripheral {
    fn identity(&self) -> DeviceIdentity {
        identity_of(&self.device)
    }

    async fn connect(&self) -> Result<Box<dyn BleLink>, BridgeError> {
        if !self.device.is_connected().await {
            self.adapter
                .connect_device(&self.device)
                .await
                .map_err(backend_err)?;
        }
        Ok(Box::new(BluestLink {
            adapter: self.adapter.clone(),
            device: self.device.clone(),
            services: Mutex::new(Vec::new()),
            characteristics: Mutex::new(Vec::new()),
        }))
    }
}

struct BluestLink {
    adapter: Adapter,
    device: Device,
    /// Discovered handles, kept so descriptor lookups resolve to concrete
    /// bluest objects later.
    services: Mutex<Vec<Service>>,
    characteristics: Mutex<Vec<Characteristic>>,
}

impl BluestLink {
    async fn resolve_characteristic(
        &self,
        info: &CharacteristicInfo,
    ) -> Result<Characteristic, BridgeError> {
        self.characteristics
            .lock()
            .await
            .iter()
            .find(|c| c.uuid() == info.uuid)
            .cloned()
            .ok_or(BridgeError::CharacteristicNotFound { notify: false, write: false })
    }
}

#[async_trait]
impl BleLink for BluestLink {
    async fn services(&self) -> Result<Vec<ServiceInfo>, BridgeError> {
        let services = self.device.services().await.map_err(backend_err)?;
        let infos = services.iter().map(|s| ServiceInfo { uuid: s.uuid() }).collect();
        *self.services.lock().await = services;
        Ok(infos)
    }

    async fn characteristics(
        &self,
        service: &ServiceInfo,
    ) -> Result<Vec<CharacteristicInfo>, BridgeError> {
        let concrete = self
            .services
            .lock()
            .await
            .iter()
            .find(|s| s.uuid() == service.uuid)
            .cloned()
            .ok_or(BridgeError::ServiceNotFound)?;

        let characteristics = concrete.characteristics().await.map_err(backend_err)?;
        let mut infos = Vec::with_capacity(characteristics.len());
        for characteristic in &characteristics {
            let props = characteristic.properties().await.map_err(backend_err)?;
            infos.push(CharacteristicInfo {
                uuid: characteristic.uuid(),
                can_notify: props.notify || props.indicate,
                can_write: props.write,
                can_write_without_response: props.write_without_response,
            });
        }
        let mut cache = self.characteristics.lock().await;
        cache.extend(characteristics);
        Ok(infos)
    }

    async fn subscribe(
        &self,
        characteristic: &CharacteristicInfo,
    ) -> Result<NotifyReceiver, BridgeError> {
        let concrete = self.resolve_characteristic(characteristic).await?;
        let (frames_tx, frames_rx) = mpsc::channel(NOTIFY_QUEUE_DEPTH);
        let (confirm_tx, confirm_rx) = oneshot::channel();

        // bluest's notify() resolves once the host stack has written the
        // subscription descriptor, which is exactly the confirmation the
        // state machine must wait for before reporting Connected.
        tokio::spawn(async move {
            let mut stream = match concrete.notify().await {
                Ok(stream) => {
                    let _ = confirm_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = confirm_tx.send(Err(BridgeError::SubscriptionFailed(e.to_string())));
                    return;
                }
            };
            while let Some(item) = stream.next().await {
                let forwarded = item.map_err(backend_err);
                if frames_tx.send(forwarded).await.is_err() {
                    debug!("Notification consumer dropped, stopping stream task");
                    return;
                }
            }
            info!("Notification stream ended");
            // frames_tx drops here; the closed channel is the link-loss signal.
        });

        confirm_rx
            .await
            .map_err(|_| BridgeError::SubscriptionFailed("subscription task aborted".into()))??;
        Ok(frames_rx)
    }

    async fn write(
        &self,
        characteristic: &CharacteristicInfo,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), BridgeError> {
        let concrete = self.resolve_characteristic(characteristic).await?;
        let result = match mode {
            WriteMode::WithResponse => concrete.write(payload).await,
            WriteMode::WithoutResponse => concrete.write_without_response(payload).await,
        };
        result.map_err(|e| BridgeError::WriteFailed(e.to_string()))
    }

    async fn close(&self) -> Result<(), BridgeError> {
        if self.device.is_connected().await {
            self.adapter
                .disconnect_device(&self.device)
                .await
                .map_err(backend_err)?;
            info!("Disconnected from {}", self.device.id());
        } else {
            warn!("Close requested but device {} is not connected", self.device.id());
        }
        Ok(())
    }
}
