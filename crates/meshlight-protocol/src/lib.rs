//! Meshlight Protocol - wire codec for BLE mesh lighting frames
//!
//! This crate turns [`MeshFrame`] values into the fixed-width byte frames a
//! mesh lighting gateway accepts over its GATT write characteristic, and
//! decodes the notifications it sends back. It performs no I/O and holds no
//! state beyond the configured [`OpcodeTable`].
//!
//! # Example
//!
//! ```
//! use meshlight_protocol::{MeshCodec, MeshFrame};
//!
//! let codec = MeshCodec::default();
//! let bytes = codec.encode(&MeshFrame::set_brightness(3, 180));
//! assert_eq!(bytes.as_ref(), &[0x02, 0x03, 0xB4, 0xB9]);
//! assert_eq!(codec.decode(&bytes).unwrap(), MeshFrame::set_brightness(3, 180));
//! ```

#![warn(missing_docs)]

pub mod codec;
pub mod error;
pub mod frame;

pub use codec::{checksum, parse_hex, to_hex, MeshCodec, OpcodeTable};
pub use error::{DecodeError, DecodeErrorKind, OpcodeTableError, Result};
pub use frame::{
    clamp_brightness, FrameBody, MeshFrame, Opcode, BROADCAST_ADDRESS, MIN_FRAME_LEN,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
