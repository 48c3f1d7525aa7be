//! Mesh frame model
//!
//! A [`MeshFrame`] is an immutable value: a target address plus a
//! [`FrameBody`] that fixes both the opcode and its payload. Because the body
//! is an enum, a frame can never carry a payload of the wrong width.

use serde::{Deserialize, Serialize};

/// Address that targets every sub-device on the link
pub const BROADCAST_ADDRESS: u8 = 0;

/// Opcode plus address bytes
pub const HEADER_LEN: usize = 2;

/// Trailing checksum byte
pub const CHECKSUM_LEN: usize = 1;

/// Shortest well-formed frame (an empty payload)
pub const MIN_FRAME_LEN: usize = HEADER_LEN + CHECKSUM_LEN;

/// Mesh operation carried in byte 0 of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    /// Switch a sub-device on or off
    SetPower,
    /// Set a sub-device's brightness level
    SetBrightness,
    /// Ask a sub-device to report its state
    QueryState,
    /// State notification sent by a sub-device
    StateReport,
}

impl Opcode {
    /// All opcodes, in table order
    pub const ALL: [Opcode; 4] = [
        Opcode::SetPower,
        Opcode::SetBrightness,
        Opcode::QueryState,
        Opcode::StateReport,
    ];

    /// Fixed payload width for this opcode
    pub fn payload_len(self) -> usize {
        match self {
            Opcode::SetPower | Opcode::SetBrightness | Opcode::StateReport => 1,
            Opcode::QueryState => 0,
        }
    }

    /// Fixed total frame width for this opcode
    pub fn frame_len(self) -> usize {
        HEADER_LEN + self.payload_len() + CHECKSUM_LEN
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Opcode::SetPower => write!(f, "set_power"),
            Opcode::SetBrightness => write!(f, "set_brightness"),
            Opcode::QueryState => write!(f, "query_state"),
            Opcode::StateReport => write!(f, "state_report"),
        }
    }
}

/// Opcode-specific payload of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameBody {
    /// On/off command
    SetPower {
        /// Requested power state
        on: bool,
    },
    /// Brightness command
    SetBrightness {
        /// Requested level, 0 to 255
        level: u8,
    },
    /// State query (no payload)
    QueryState,
    /// Reported brightness level; zero means the light is off
    StateReport {
        /// Reported level, 0 to 255
        level: u8,
    },
}

impl FrameBody {
    /// Opcode for this body
    pub fn opcode(&self) -> Opcode {
        match self {
            FrameBody::SetPower { .. } => Opcode::SetPower,
            FrameBody::SetBrightness { .. } => Opcode::SetBrightness,
            FrameBody::QueryState => Opcode::QueryState,
            FrameBody::StateReport { .. } => Opcode::StateReport,
        }
    }
}

/// Clamp an arbitrary brightness request into the wire range
pub fn clamp_brightness(level: i32) -> u8 {
    level.clamp(0, u8::MAX as i32) as u8
}

/// A single mesh command or status frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshFrame {
    address: u8,
    body: FrameBody,
}

impl MeshFrame {
    /// Create a frame from an address and body
    pub fn new(address: u8, body: FrameBody) -> Self {
        Self { address, body }
    }

    /// On/off command for `address`
    pub fn set_power(address: u8, on: bool) -> Self {
        Self::new(address, FrameBody::SetPower { on })
    }

    /// Brightness command for `address`, clamped to 0..=255
    pub fn set_brightness(address: u8, level: i32) -> Self {
        Self::new(
            address,
            FrameBody::SetBrightness {
                level: clamp_brightness(level),
            },
        )
    }

    /// State query for `address`
    pub fn query_state(address: u8) -> Self {
        Self::new(address, FrameBody::QueryState)
    }

    /// State report from `address`, clamped to 0..=255
    pub fn state_report(address: u8, level: i32) -> Self {
        Self::new(
            address,
            FrameBody::StateReport {
                level: clamp_brightness(level),
            },
        )
    }

    /// Target (or reporting) address
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Frame body
    pub fn body(&self) -> FrameBody {
        self.body
    }

    /// Opcode of the frame
    pub fn opcode(&self) -> Opcode {
        self.body.opcode()
    }

    /// Whether the frame targets every sub-device
    pub fn is_broadcast(&self) -> bool {
        self.address == BROADCAST_ADDRESS
    }

    /// Whether this frame is sent to the device (as opposed to reported by it)
    pub fn is_command(&self) -> bool {
        !matches!(self.body, FrameBody::StateReport { .. })
    }

    /// Payload bytes in wire order
    pub fn payload(&self) -> Vec<u8> {
        match self.body {
            FrameBody::SetPower { on } => vec![u8::from(on)],
            FrameBody::SetBrightness { level } => vec![level],
            FrameBody::QueryState => Vec::new(),
            FrameBody::StateReport { level } => vec![level],
        }
    }
}

impl std::fmt::Display for MeshFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.body {
            FrameBody::SetPower { on } => {
                write!(f, "set_power(addr={}, on={})", self.address, on)
            }
            FrameBody::SetBrightness { level } => {
                write!(f, "set_brightness(addr={}, level={})", self.address, level)
            }
            FrameBody::QueryState => write!(f, "query_state(addr={})", self.address),
            FrameBody::StateReport { level } => {
                write!(f, "state_report(addr={}, level={})", self.address, level)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_brightness_is_clamped() {
        assert_eq!(clamp_brightness(-20), 0);
        assert_eq!(clamp_brightness(180), 180);
        assert_eq!(clamp_brightness(1000), 255);

        let frame = MeshFrame::set_brightness(3, 300);
        assert_eq!(frame.body(), FrameBody::SetBrightness { level: 255 });
    }

    #[test]
    fn test_payload_width_matches_opcode() {
        let frames = [
            MeshFrame::set_power(1, true),
            MeshFrame::set_brightness(1, 10),
            MeshFrame::query_state(1),
            MeshFrame::state_report(1, 10),
        ];
        for frame in frames {
            assert_eq!(frame.payload().len(), frame.opcode().payload_len());
        }
    }

    #[test]
    fn test_broadcast_and_direction() {
        let frame = MeshFrame::query_state(BROADCAST_ADDRESS);
        assert!(frame.is_broadcast());
        assert!(frame.is_command());
        assert!(!MeshFrame::state_report(4, 0).is_command());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            MeshFrame::set_brightness(3, 180).to_string(),
            "set_brightness(addr=3, level=180)"
        );
        assert_eq!(Opcode::QueryState.to_string(), "query_state");
    }
}
