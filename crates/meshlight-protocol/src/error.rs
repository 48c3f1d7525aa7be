//! Error types for frame decoding
//!
//! Decoding never panics: every rejected byte sequence maps to exactly one
//! [`DecodeError`] variant, and [`DecodeError::kind`] collapses them into the
//! four categories callers log and count.

use thiserror::Error;

use crate::frame::Opcode;

/// Category of a decode failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeErrorKind {
    /// Too short, or a payload value outside its domain
    Malformed,
    /// Opcode byte not present in the opcode table
    UnknownOpcode,
    /// Frame length does not match the opcode's fixed width
    LengthMismatch,
    /// Trailing checksum byte does not match the frame contents
    ChecksumFailed,
}

impl std::fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeErrorKind::Malformed => write!(f, "malformed"),
            DecodeErrorKind::UnknownOpcode => write!(f, "unknown_opcode"),
            DecodeErrorKind::LengthMismatch => write!(f, "length_mismatch"),
            DecodeErrorKind::ChecksumFailed => write!(f, "checksum_failed"),
        }
    }
}

/// Error returned when raw bytes cannot be decoded into a frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Frame shorter than header plus checksum
    #[error("Frame too short: {len} bytes (minimum {min})")]
    TooShort {
        /// Received length
        len: usize,
        /// Minimum valid length
        min: usize,
    },

    /// Payload byte outside the values the opcode allows
    #[error("Invalid {opcode} payload value: 0x{value:02X}")]
    InvalidPayload {
        /// Opcode whose payload was rejected
        opcode: Opcode,
        /// Offending byte
        value: u8,
    },

    /// Input is not valid hexadecimal
    #[error("Invalid hex input: {0}")]
    InvalidHex(String),

    /// Opcode byte not in the opcode table
    #[error("Unknown opcode: 0x{0:02X}")]
    UnknownOpcode(u8),

    /// Length does not match the opcode's fixed frame width
    #[error("Length mismatch for {opcode}: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        /// Decoded opcode
        opcode: Opcode,
        /// Fixed frame length for the opcode
        expected: usize,
        /// Received length
        actual: usize,
    },

    /// Checksum byte mismatch
    #[error("Checksum failed: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumFailed {
        /// Checksum computed over the frame
        expected: u8,
        /// Checksum carried in the frame
        actual: u8,
    },
}

impl DecodeError {
    /// Collapse the error into its reporting category
    pub fn kind(&self) -> DecodeErrorKind {
        match self {
            DecodeError::TooShort { .. }
            | DecodeError::InvalidPayload { .. }
            | DecodeError::InvalidHex(_) => DecodeErrorKind::Malformed,
            DecodeError::UnknownOpcode(_) => DecodeErrorKind::UnknownOpcode,
            DecodeError::LengthMismatch { .. } => DecodeErrorKind::LengthMismatch,
            DecodeError::ChecksumFailed { .. } => DecodeErrorKind::ChecksumFailed,
        }
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self.kind() {
            DecodeErrorKind::Malformed => "MALFORMED",
            DecodeErrorKind::UnknownOpcode => "UNKNOWN_OPCODE",
            DecodeErrorKind::LengthMismatch => "LENGTH_MISMATCH",
            DecodeErrorKind::ChecksumFailed => "CHECKSUM_FAILED",
        }
    }
}

/// Error returned when an opcode table cannot be used
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpcodeTableError {
    /// Two opcodes share one byte value
    #[error("Opcode value 0x{value:02X} assigned to both {first} and {second}")]
    Duplicate {
        /// Shared byte value
        value: u8,
        /// First opcode using the value
        first: Opcode,
        /// Second opcode using the value
        second: Opcode,
    },
}

/// Result type alias for decode operations
pub type Result<T> = std::result::Result<T, DecodeError>;
