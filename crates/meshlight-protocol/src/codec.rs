//! Frame encoding and decoding
//!
//! Wire layout (fixed width per opcode):
//!
//! ```text
//! +--------+---------+-----------------+----------+
//! | opcode | address | payload (0..=1) | checksum |
//! +--------+---------+-----------------+----------+
//! ```
//!
//! The checksum is the sum modulo 256 of every preceding byte. Opcode byte
//! values are vendor-defined, so they come from an [`OpcodeTable`].

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, OpcodeTableError, Result};
use crate::frame::{FrameBody, MeshFrame, Opcode, MIN_FRAME_LEN};

/// Default SetPower opcode value
pub const DEFAULT_SET_POWER: u8 = 0x01;

/// Default SetBrightness opcode value
pub const DEFAULT_SET_BRIGHTNESS: u8 = 0x02;

/// Default QueryState opcode value
pub const DEFAULT_QUERY_STATE: u8 = 0x03;

/// Default StateReport opcode value
pub const DEFAULT_STATE_REPORT: u8 = 0x04;

/// Byte values assigned to each opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpcodeTable {
    /// SetPower opcode byte
    #[serde(default = "default_set_power")]
    pub set_power: u8,
    /// SetBrightness opcode byte
    #[serde(default = "default_set_brightness")]
    pub set_brightness: u8,
    /// QueryState opcode byte
    #[serde(default = "default_query_state")]
    pub query_state: u8,
    /// StateReport opcode byte
    #[serde(default = "default_state_report")]
    pub state_report: u8,
}

fn default_set_power() -> u8 {
    DEFAULT_SET_POWER
}

fn default_set_brightness() -> u8 {
    DEFAULT_SET_BRIGHTNESS
}

fn default_query_state() -> u8 {
    DEFAULT_QUERY_STATE
}

fn default_state_report() -> u8 {
    DEFAULT_STATE_REPORT
}

impl Default for OpcodeTable {
    fn default() -> Self {
        Self {
            set_power: DEFAULT_SET_POWER,
            set_brightness: DEFAULT_SET_BRIGHTNESS,
            query_state: DEFAULT_QUERY_STATE,
            state_report: DEFAULT_STATE_REPORT,
        }
    }
}

impl OpcodeTable {
    /// Byte value for an opcode
    pub fn value(&self, opcode: Opcode) -> u8 {
        match opcode {
            Opcode::SetPower => self.set_power,
            Opcode::SetBrightness => self.set_brightness,
            Opcode::QueryState => self.query_state,
            Opcode::StateReport => self.state_report,
        }
    }

    /// Opcode for a byte value, if any
    pub fn lookup(&self, value: u8) -> Option<Opcode> {
        Opcode::ALL.into_iter().find(|op| self.value(*op) == value)
    }

    /// Reject tables where two opcodes share a value
    pub fn validate(&self) -> std::result::Result<(), OpcodeTableError> {
        for (i, first) in Opcode::ALL.iter().enumerate() {
            for second in &Opcode::ALL[i + 1..] {
                if self.value(*first) == self.value(*second) {
                    return Err(OpcodeTableError::Duplicate {
                        value: self.value(*first),
                        first: *first,
                        second: *second,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Sum modulo 256 of `bytes`
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Render bytes as lowercase hex for logs
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Parse a hex string (whitespace tolerated) into raw bytes
pub fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&compact).map_err(|e| DecodeError::InvalidHex(e.to_string()))
}

/// Stateless encoder/decoder bound to one opcode table
#[derive(Debug, Clone, Default)]
pub struct MeshCodec {
    opcodes: OpcodeTable,
}

impl MeshCodec {
    /// Create a codec for a validated opcode table
    pub fn new(opcodes: OpcodeTable) -> std::result::Result<Self, OpcodeTableError> {
        opcodes.validate()?;
        Ok(Self { opcodes })
    }

    /// The opcode table in use
    pub fn opcodes(&self) -> &OpcodeTable {
        &self.opcodes
    }

    /// Encode a frame into its fixed-width wire form
    pub fn encode(&self, frame: &MeshFrame) -> Bytes {
        let opcode = frame.opcode();
        let mut buf = BytesMut::with_capacity(opcode.frame_len());
        buf.put_u8(self.opcodes.value(opcode));
        buf.put_u8(frame.address());
        buf.put_slice(&frame.payload());
        let sum = checksum(&buf);
        buf.put_u8(sum);
        buf.freeze()
    }

    /// Decode exactly one frame
    ///
    /// Checks run in order: minimum length, opcode, length, checksum, then
    /// payload domain.
    pub fn decode(&self, data: &[u8]) -> Result<MeshFrame> {
        if data.len() < MIN_FRAME_LEN {
            return Err(DecodeError::TooShort {
                len: data.len(),
                min: MIN_FRAME_LEN,
            });
        }

        let opcode = self
            .opcodes
            .lookup(data[0])
            .ok_or(DecodeError::UnknownOpcode(data[0]))?;

        if data.len() != opcode.frame_len() {
            return Err(DecodeError::LengthMismatch {
                opcode,
                expected: opcode.frame_len(),
                actual: data.len(),
            });
        }

        let (body, trailer) = data.split_at(data.len() - 1);
        let expected = checksum(body);
        if trailer[0] != expected {
            return Err(DecodeError::ChecksumFailed {
                expected,
                actual: trailer[0],
            });
        }

        let address = data[1];
        let body = match opcode {
            Opcode::SetPower => match data[2] {
                0 => FrameBody::SetPower { on: false },
                1 => FrameBody::SetPower { on: true },
                value => return Err(DecodeError::InvalidPayload { opcode, value }),
            },
            Opcode::SetBrightness => FrameBody::SetBrightness { level: data[2] },
            Opcode::QueryState => FrameBody::QueryState,
            Opcode::StateReport => FrameBody::StateReport { level: data[2] },
        };

        Ok(MeshFrame::new(address, body))
    }

    /// Decode a notification that may hold several back-to-back frames
    ///
    /// Splitting stops at the first unknown opcode or truncated frame, since
    /// the remaining bytes can no longer be delimited.
    pub fn decode_stream(&self, data: &[u8]) -> Vec<Result<MeshFrame>> {
        let mut results = Vec::new();
        let mut rest = data;

        while !rest.is_empty() {
            if rest.len() < MIN_FRAME_LEN {
                results.push(Err(DecodeError::TooShort {
                    len: rest.len(),
                    min: MIN_FRAME_LEN,
                }));
                break;
            }

            let Some(opcode) = self.opcodes.lookup(rest[0]) else {
                results.push(Err(DecodeError::UnknownOpcode(rest[0])));
                break;
            };

            let len = opcode.frame_len();
            if rest.len() < len {
                results.push(Err(DecodeError::LengthMismatch {
                    opcode,
                    expected: len,
                    actual: rest.len(),
                }));
                break;
            }

            let (frame, tail) = rest.split_at(len);
            results.push(self.decode(frame));
            rest = tail;
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeErrorKind;

    fn codec() -> MeshCodec {
        MeshCodec::default()
    }

    #[test]
    fn test_set_brightness_wire_bytes() {
        let bytes = codec().encode(&MeshFrame::set_brightness(3, 180));
        assert_eq!(bytes.as_ref(), &[0x02, 0x03, 0xB4, 0xB9]);
    }

    #[test]
    fn test_query_state_has_no_payload() {
        let bytes = codec().encode(&MeshFrame::query_state(7));
        assert_eq!(bytes.as_ref(), &[0x03, 0x07, 0x0A]);
    }

    #[test]
    fn test_round_trip() {
        let codec = codec();
        let frames = [
            MeshFrame::set_power(1, true),
            MeshFrame::set_power(255, false),
            MeshFrame::set_brightness(0, 0),
            MeshFrame::set_brightness(42, 255),
            MeshFrame::query_state(9),
            MeshFrame::state_report(3, 180),
        ];
        for frame in frames {
            let decoded = codec.decode(&codec.encode(&frame)).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_checksum_wraps() {
        assert_eq!(checksum(&[0xFF, 0x02]), 0x01);
        assert_eq!(checksum(&[]), 0);
    }

    #[test]
    fn test_decode_too_short() {
        let err = codec().decode(&[0x02, 0x03]).unwrap_err();
        assert_eq!(err.kind(), DecodeErrorKind::Malformed);
        assert_eq!(codec().decode(&[]).unwrap_err().kind(), DecodeErrorKind::Malformed);
    }

    #[test]
    fn test_decode_unknown_opcode() {
        let err = codec().decode(&[0x7F, 0x03, 0x82]).unwrap_err();
        assert_eq!(err, DecodeError::UnknownOpcode(0x7F));
    }

    #[test]
    fn test_decode_length_mismatch() {
        let err = codec().decode(&[0x02, 0x03, 0xB4, 0x00, 0xB9]).unwrap_err();
        assert_eq!(err.kind(), DecodeErrorKind::LengthMismatch);

        // QueryState frame with a stray payload byte
        let err = codec().decode(&[0x03, 0x07, 0x01, 0x0B]).unwrap_err();
        assert_eq!(err.kind(), DecodeErrorKind::LengthMismatch);
    }

    #[test]
    fn test_decode_checksum_failed() {
        let err = codec().decode(&[0x02, 0x03, 0xB4, 0x00]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::ChecksumFailed {
                expected: 0xB9,
                actual: 0x00
            }
        );
    }

    #[test]
    fn test_decode_invalid_power_value() {
        let frame = [0x01, 0x03, 0x05, 0x09];
        let err = codec().decode(&frame).unwrap_err();
        assert_eq!(err.kind(), DecodeErrorKind::Malformed);
    }

    #[test]
    fn test_decode_is_pure() {
        let codec = codec();
        let input = [0x04, 0x03, 0xB4, 0xBB];
        assert_eq!(codec.decode(&input), codec.decode(&input));
        let garbage = [0x99, 0x00, 0x11, 0x22, 0x33];
        assert_eq!(codec.decode(&garbage), codec.decode(&garbage));
    }

    #[test]
    fn test_custom_opcode_table() {
        let table = OpcodeTable {
            set_power: 0x82,
            set_brightness: 0x83,
            query_state: 0x84,
            state_report: 0x85,
        };
        let codec = MeshCodec::new(table).unwrap();
        let bytes = codec.encode(&MeshFrame::set_power(2, true));
        assert_eq!(bytes[0], 0x82);
        assert_eq!(codec.decode(&bytes).unwrap(), MeshFrame::set_power(2, true));

        // Default opcodes are unknown to the custom table
        let default_bytes = MeshCodec::default().encode(&MeshFrame::set_power(2, true));
        assert_eq!(
            codec.decode(&default_bytes).unwrap_err(),
            DecodeError::UnknownOpcode(0x01)
        );
    }

    #[test]
    fn test_duplicate_opcode_table_rejected() {
        let table = OpcodeTable {
            query_state: DEFAULT_SET_POWER,
            ..OpcodeTable::default()
        };
        let err = MeshCodec::new(table).unwrap_err();
        assert!(matches!(
            err,
            OpcodeTableError::Duplicate {
                value: DEFAULT_SET_POWER,
                first: Opcode::SetPower,
                second: Opcode::QueryState,
            }
        ));
    }

    #[test]
    fn test_opcode_table_from_json_uses_defaults() {
        let table: OpcodeTable = serde_json::from_str(r#"{"state_report": 16}"#).unwrap();
        assert_eq!(table.state_report, 0x10);
        assert_eq!(table.set_power, DEFAULT_SET_POWER);
    }

    #[test]
    fn test_decode_stream() {
        let codec = codec();
        let mut data = codec.encode(&MeshFrame::state_report(3, 180)).to_vec();
        data.extend_from_slice(&codec.encode(&MeshFrame::state_report(4, 0)));

        let frames = codec.decode_stream(&data);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], Ok(MeshFrame::state_report(3, 180)));
        assert_eq!(frames[1], Ok(MeshFrame::state_report(4, 0)));
    }

    #[test]
    fn test_decode_stream_stops_on_truncation() {
        let codec = codec();
        let mut data = codec.encode(&MeshFrame::state_report(3, 10)).to_vec();
        data.extend_from_slice(&[0x04, 0x05]);

        let frames = codec.decode_stream(&data);
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_ok());
        assert_eq!(frames[1].as_ref().unwrap_err().kind(), DecodeErrorKind::Malformed);
    }

    #[test]
    fn test_hex_helpers() {
        assert_eq!(parse_hex("02 03 b4 b9").unwrap(), vec![0x02, 0x03, 0xB4, 0xB9]);
        assert_eq!(to_hex(&[0xA5, 0x01]), "a501");
        assert_eq!(
            parse_hex("zz").unwrap_err().kind(),
            DecodeErrorKind::Malformed
        );
    }
}
