//! Meshlight BLE - protocol engine for BLE mesh lighting gateways
//!
//! This crate drives a family of BLE mesh lights through one physical
//! gateway. A single GATT connection carries commands for many logical
//! sub-devices, each identified by a one-byte mesh address, and the gateway
//! reports their state back as notifications.
//!
//! # Architecture
//!
//! 1. **Transport** - [`BleTransport`] over btleplug or a test mock
//! 2. **Link** - [`LinkManager`] connection lifecycle and reconnects
//! 3. **Queue** - [`CommandQueue`] single-flight dispatch, coalescing, retries
//! 4. **State** - [`AddressTable`] last known state per sub-device
//! 5. **Controller** - [`MeshController`] actor and its [`MeshHandle`]
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // Enable the `ble` feature to use BtleplugTransport
//! use meshlight_ble::{BtleplugTransport, MeshConfig, MeshController, MeshEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MeshConfig::from_json_file("meshlight.json")?;
//!     let transport = BtleplugTransport::new(config.device.clone())?;
//!
//!     let (controller, handle) = MeshController::new(transport, &config)?;
//!     tokio::spawn(controller.run());
//!
//!     let mut events = handle.subscribe();
//!     handle.connect().await?;
//!     handle.set_brightness(3, 180).await?.outcome().await;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let MeshEvent::StateChanged { address, device } = event {
//!             println!("{} -> {:?}", address, device);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `ble` - btleplug transport (requires `libdbus-1-dev` on Linux)

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod controller;
pub mod error;
pub mod interface;
pub mod link;
pub mod queue;
pub mod table;
pub mod test_utils;

pub use config::{
    ControllerConfig, DeviceConfig, MeshConfig, MeshConfigBuilder, QueueConfig, ReconnectConfig,
    SubDeviceConfig,
};
pub use controller::{CommandHandle, ControllerStats, MeshController, MeshEvent, MeshHandle};
pub use error::{LinkError, MeshError, Result};
pub use interface::{BleTransport, LinkState, NotificationStream};
pub use link::{LinkEvent, LinkManager, LinkUpdate};
pub use queue::{CancelResult, CommandOutcome, CommandQueue, QueueStats, TransactionTag};
pub use table::{AddressTable, SubDevice};

#[cfg(feature = "ble")]
pub use interface::{scan, BtleplugTransport, DiscoveredDevice};

pub use test_utils::{MockTransport, TestFixture};

// Protocol re-exports
pub use meshlight_protocol::{
    FrameBody, MeshCodec, MeshFrame, OpcodeTable, BROADCAST_ADDRESS,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_default_opcodes_reexported() {
        assert_eq!(OpcodeTable::default().state_report, 0x04);
        assert_eq!(BROADCAST_ADDRESS, 0);
    }
}
