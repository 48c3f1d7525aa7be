//! Bluetooth Low Energy transport for the mesh gateway
//!
//! # Requirements
//!
//! Enable the `ble` feature in Cargo.toml to use this transport.
//!
//! On Linux, you'll also need:
//! ```bash
//! apt install libdbus-1-dev
//! ```

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::{future, StreamExt};
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{until_dropped, BleTransport, NotificationStream};
use crate::config::DeviceConfig;
use crate::error::LinkError;

/// A peripheral seen during a scan
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    /// Advertised local name
    pub name: String,
    /// BLE address
    pub address: String,
    /// Signal strength, if reported
    pub rssi: Option<i16>,
}

/// Get the default Bluetooth adapter
async fn default_adapter() -> Result<Adapter, LinkError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(LinkError::NoAdapter)
}

/// Scan for nearby BLE peripherals
pub async fn scan(duration: Duration) -> Result<Vec<DiscoveredDevice>, LinkError> {
    let adapter = default_adapter().await?;

    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(duration).await;

    let mut devices = Vec::new();
    for peripheral in adapter.peripherals().await? {
        if let Some(props) = peripheral.properties().await? {
            devices.push(DiscoveredDevice {
                name: props.local_name.unwrap_or_else(|| "Unknown".to_string()),
                address: peripheral.address().to_string(),
                rssi: props.rssi,
            });
        }
    }

    adapter.stop_scan().await?;
    Ok(devices)
}

#[derive(Clone)]
struct Session {
    adapter: Adapter,
    peripheral: Peripheral,
    write_char: Characteristic,
    notify_char: Characteristic,
}

/// BLE transport built on btleplug
///
/// The gateway is located by address or advertised name, then the write and
/// notify characteristics named in [`DeviceConfig`] are resolved.
pub struct BtleplugTransport {
    config: DeviceConfig,
    session: Mutex<Option<Session>>,
}

impl BtleplugTransport {
    /// Create a new transport for the configured gateway
    pub fn new(config: DeviceConfig) -> crate::Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            session: Mutex::new(None),
        })
    }

    fn current(&self) -> Result<Session, LinkError> {
        self.session.lock().clone().ok_or(LinkError::Disconnected)
    }

    fn matches_target(&self, address: &str, name: Option<&str>) -> bool {
        let target = self.config.address.trim();
        address.eq_ignore_ascii_case(target) || name.is_some_and(|n| n == target)
    }

    async fn find_peripheral(&self, adapter: &Adapter) -> Result<Peripheral, LinkError> {
        adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(self.config.scan_timeout).await;

        let mut found = None;
        for peripheral in adapter.peripherals().await? {
            let address = peripheral.address().to_string();
            let name = peripheral
                .properties()
                .await?
                .and_then(|props| props.local_name);
            if self.matches_target(&address, name.as_deref()) {
                found = Some(peripheral);
                break;
            }
        }

        if let Err(e) = adapter.stop_scan().await {
            debug!(error = %e, "Failed to stop scan");
        }
        found.ok_or_else(|| LinkError::DeviceNotFound(self.config.address.clone()))
    }

    fn characteristic(
        peripheral: &Peripheral,
        uuid: uuid::Uuid,
    ) -> Result<Characteristic, LinkError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(LinkError::CharacteristicNotFound(uuid))
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn connect(&self) -> Result<(), LinkError> {
        let adapter = default_adapter().await?;
        let peripheral = self.find_peripheral(&adapter).await?;

        if !peripheral.is_connected().await? {
            peripheral
                .connect()
                .await
                .map_err(|e| LinkError::ConnectFailed {
                    device: self.config.address.clone(),
                    reason: e.to_string(),
                })?;
        }
        peripheral.discover_services().await?;

        let write_char = Self::characteristic(&peripheral, self.config.write_char_uuid)?;
        let notify_char = Self::characteristic(&peripheral, self.config.notify_char_uuid)?;

        info!(
            device = %self.config.address,
            service = %self.config.service_uuid,
            "Connected to mesh gateway"
        );

        *self.session.lock() = Some(Session {
            adapter,
            peripheral,
            write_char,
            notify_char,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        let session = self.session.lock().take();
        if let Some(session) = session {
            if let Err(e) = session.peripheral.unsubscribe(&session.notify_char).await {
                debug!(error = %e, "Unsubscribe failed during disconnect");
            }
            session.peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        let Ok(session) = self.current() else {
            return false;
        };
        session.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn write(&self, data: &[u8]) -> Result<(), LinkError> {
        let session = self.current()?;
        let write_type = if self.config.write_with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        session
            .peripheral
            .write(&session.write_char, data, write_type)
            .await
            .map_err(|e| match LinkError::from(e) {
                LinkError::Disconnected => LinkError::Disconnected,
                other => LinkError::WriteFailed(other.to_string()),
            })
    }

    async fn notifications(&self) -> Result<NotificationStream, LinkError> {
        let session = self.current()?;
        session.peripheral.subscribe(&session.notify_char).await?;

        let notify_uuid = session.notify_char.uuid;
        let peripheral_id = session.peripheral.id();

        let data = session
            .peripheral
            .notifications()
            .await?
            .filter_map(move |n| {
                future::ready((n.uuid == notify_uuid).then(|| Bytes::from(n.value)))
            });

        let drops = session.adapter.events().await?.filter_map(move |event| {
            future::ready(match event {
                CentralEvent::DeviceDisconnected(id) if id == peripheral_id => {
                    warn!("Mesh gateway disconnected");
                    Some(())
                }
                _ => None,
            })
        });

        Ok(Box::pin(until_dropped(data, drops)))
    }

    fn name(&self) -> &str {
        &self.config.address
    }
}
