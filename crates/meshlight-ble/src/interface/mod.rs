//! Transport implementations for the mesh gateway link
//!
//! - [`BtleplugTransport`] - Bluetooth LE via btleplug (requires `ble` feature)
//! - [`MockTransport`](crate::test_utils::MockTransport) - in-memory transport for tests
//!
//! # Feature Requirements
//!
//! - `ble`: Requires BlueZ development files on Linux
//!   ```bash
//!   apt install libdbus-1-dev
//!   ```

#[cfg(feature = "ble")]
mod ble;
#[cfg(feature = "ble")]
pub use ble::{scan, BtleplugTransport, DiscoveredDevice};

use crate::error::LinkError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, stream, Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;

/// Stream of raw notification payloads; ends when the peripheral drops
pub type NotificationStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

/// Trait for the physical BLE connection to the gateway
///
/// Implementations are shared between the controller and the link's
/// session task, so every method takes `&self`.
#[async_trait]
pub trait BleTransport: Send + Sync + 'static {
    /// Connect to the gateway and resolve its characteristics
    async fn connect(&self) -> Result<(), LinkError>;

    /// Disconnect from the gateway
    async fn disconnect(&self) -> Result<(), LinkError>;

    /// Check if currently connected
    async fn is_connected(&self) -> bool;

    /// Write one frame to the command characteristic
    async fn write(&self, data: &[u8]) -> Result<(), LinkError>;

    /// Subscribe to the notify characteristic
    async fn notifications(&self) -> Result<NotificationStream, LinkError>;

    /// Get the transport name (for logging)
    fn name(&self) -> &str;
}

/// Forward payloads until `drops` yields or `data` itself ends
#[cfg_attr(not(feature = "ble"), allow(dead_code))]
pub(crate) fn until_dropped<D, X>(data: D, drops: X) -> impl Stream<Item = Bytes> + Send
where
    D: Stream<Item = Bytes> + Send,
    X: Stream<Item = ()> + Send,
{
    enum Item {
        Data(Bytes),
        Dropped,
    }

    let data = data
        .map(Item::Data)
        .chain(stream::once(future::ready(Item::Dropped)));
    let drops = drops.map(|()| Item::Dropped);

    stream::select(data, drops)
        .take_while(|item| future::ready(matches!(item, Item::Data(_))))
        .filter_map(|item| {
            future::ready(match item {
                Item::Data(bytes) => Some(bytes),
                Item::Dropped => None,
            })
        })
}

/// Connection state of the gateway link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Not connected
    Disconnected,
    /// Connection in progress
    Connecting,
    /// Successfully connected
    Connected,
    /// Connection lost, reconnecting
    Reconnecting,
}

impl LinkState {
    /// Whether commands can be written right now
    pub fn is_connected(self) -> bool {
        self == LinkState::Connected
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}
