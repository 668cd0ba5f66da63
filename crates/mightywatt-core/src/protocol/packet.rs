//! Frame encoding/decoding
//!
//! Command frame format (host to load):
//! - 1 byte: opcode (bit 7 direction, bits 6-5 payload length code, bits 4-0 command id)
//! - 0, 1, 2 or 4 bytes: payload (little-endian)
//! - 2 bytes: CRC-16/XMODEM of opcode + payload (little-endian)
//!
//! Measurement frame format (load to host, 17 bytes):
//! - 4 bytes: current in µA
//! - 4 bytes: voltage in µV
//! - 1 byte: temperature in °C
//! - 1 byte: status bits (bit 5 = remote sense)
//! - 1 byte: user pins
//! - 4 bytes: error flags
//! - 2 bytes: CRC-16/XMODEM of the 15 bytes above

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use super::crc::{append_crc, crc16, verify_trailer};
use super::{FrameError, ProtocolError, ERROR_MASK, MEASUREMENT_FRAME_LEN};

/// Payload length for each length code
pub const PAYLOAD_LENGTHS: [usize; 4] = [0, 1, 2, 4];

/// Status bit set while remote (4-wire) sensing is active
pub const STATUS_REMOTE_BIT: u8 = 5;

const DIRECTION_BIT: u8 = 7;
const LENGTH_SHIFT: u8 = 5;
const COMMAND_MASK: u8 = 0x1F;

/// Transfer direction, seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Query; the load answers
    Read,
    /// Setpoint or configuration
    Write,
}

/// Decoded opcode byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opcode {
    /// Bit 7
    pub direction: Direction,
    /// Bits 6-5, an index into [`PAYLOAD_LENGTHS`]
    pub length_code: u8,
    /// Bits 4-0
    pub command_id: u8,
}

impl Opcode {
    /// Build an opcode for a payload of `payload_len` bytes
    pub fn new(direction: Direction, command_id: u8, payload_len: usize) -> Option<Self> {
        let length_code = length_code(payload_len)?;
        Some(Self {
            direction,
            length_code,
            command_id: command_id & COMMAND_MASK,
        })
    }

    /// Pack into the wire byte
    pub fn encode(&self) -> u8 {
        let dir = match self.direction {
            Direction::Read => 0,
            Direction::Write => 1,
        };
        (dir << DIRECTION_BIT)
            | ((self.length_code & 0x03) << LENGTH_SHIFT)
            | (self.command_id & COMMAND_MASK)
    }

    /// Unpack a wire byte
    pub fn decode(byte: u8) -> Self {
        let direction = if byte >> DIRECTION_BIT == 1 {
            Direction::Write
        } else {
            Direction::Read
        };
        Self {
            direction,
            length_code: (byte >> LENGTH_SHIFT) & 0x03,
            command_id: byte & COMMAND_MASK,
        }
    }

    /// Payload bytes that follow this opcode
    pub fn payload_len(&self) -> usize {
        PAYLOAD_LENGTHS[self.length_code as usize]
    }
}

/// Index of `len` in [`PAYLOAD_LENGTHS`]
fn length_code(len: usize) -> Option<u8> {
    PAYLOAD_LENGTHS
        .iter()
        .position(|&l| l == len)
        .map(|i| i as u8)
}

/// A command frame waiting to be sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    opcode: Opcode,
    payload: Vec<u8>,
}

impl CommandFrame {
    /// A read request (no payload)
    pub fn read(command_id: u8) -> Self {
        Self {
            opcode: Opcode {
                direction: Direction::Read,
                length_code: 0,
                command_id: command_id & COMMAND_MASK,
            },
            payload: Vec::new(),
        }
    }

    /// A write command; the payload must be 0, 1, 2 or 4 bytes long
    pub fn write(command_id: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        let opcode = Opcode::new(Direction::Write, command_id, payload.len()).ok_or_else(|| {
            ProtocolError::InvalidInput(format!("payload of {} bytes", payload.len()))
        })?;
        Ok(Self {
            opcode,
            payload: payload.to_vec(),
        })
    }

    /// A write command with a fixed-width payload (1, 2 or 4 bytes)
    pub(crate) fn write_fixed<const N: usize>(command_id: u8, payload: [u8; N]) -> Self {
        debug_assert!(matches!(N, 1 | 2 | 4));
        Self {
            opcode: Opcode {
                direction: Direction::Write,
                length_code: length_code(N).unwrap_or(0),
                command_id: command_id & COMMAND_MASK,
            },
            payload: payload.to_vec(),
        }
    }

    /// Decode and CRC-check a complete frame
    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        let opcode = match data.first() {
            Some(&b) => Opcode::decode(b),
            None => {
                return Err(FrameError::WrongLength {
                    expected: 3,
                    actual: 0,
                })
            }
        };
        let expected = 1 + opcode.payload_len() + 2;
        if data.len() != expected {
            return Err(FrameError::WrongLength {
                expected,
                actual: data.len(),
            });
        }
        verify_trailer(data).map_err(|(expected, actual)| FrameError::CrcMismatch { expected, actual })?;
        Ok(Self {
            opcode,
            payload: data[1..expected - 2].to_vec(),
        })
    }

    /// Encode to wire bytes, CRC included
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_size());
        bytes.push(self.opcode.encode());
        bytes.extend_from_slice(&self.payload);
        append_crc(&mut bytes);
        bytes
    }

    /// Total encoded size
    pub fn encoded_size(&self) -> usize {
        1 + self.payload.len() + 2
    }

    /// Decoded opcode byte
    ///
    /// ```
    /// use mightywatt_core::protocol::{command_builder, Direction, RunMode};
    ///
    /// let frame = command_builder::setpoint(RunMode::Current, 1.0)?;
    /// let opcode = frame.opcode();
    /// assert_eq!(opcode.direction, Direction::Write);
    /// assert_eq!(opcode.length_code, 3);
    /// assert_eq!(opcode.encode(), 0xE1);
    /// # Ok::<(), mightywatt_core::protocol::ProtocolError>(())
    /// ```
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Read or write
    pub fn direction(&self) -> Direction {
        self.opcode.direction
    }

    /// Five-bit command id
    pub fn command_id(&self) -> u8 {
        self.opcode.command_id
    }

    /// Payload bytes, little-endian
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload widened to `u32`, little-endian
    pub fn payload_value(&self) -> u32 {
        match self.payload.len() {
            1 => self.payload[0] as u32,
            2 => LittleEndian::read_u16(&self.payload) as u32,
            4 => LittleEndian::read_u32(&self.payload),
            _ => 0,
        }
    }
}

/// Raw content of one measurement frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementFrame {
    /// Current in µA
    pub current_ua: u32,
    /// Voltage in µV
    pub voltage_uv: u32,
    /// Heatsink temperature in °C
    pub temperature: u8,
    /// Status bits
    pub status: u8,
    /// State of the user I/O pins
    pub user_pins: u8,
    /// Unmasked, as sent by the load
    pub error_flags: u32,
}

impl MeasurementFrame {
    /// Decode a 17-byte frame, checking the CRC before trusting any field
    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() != MEASUREMENT_FRAME_LEN {
            return Err(FrameError::WrongLength {
                expected: MEASUREMENT_FRAME_LEN,
                actual: data.len(),
            });
        }
        verify_trailer(data).map_err(|(expected, actual)| FrameError::CrcMismatch { expected, actual })?;

        Ok(Self {
            current_ua: LittleEndian::read_u32(&data[0..4]),
            voltage_uv: LittleEndian::read_u32(&data[4..8]),
            temperature: data[8],
            status: data[9],
            user_pins: data[10],
            error_flags: LittleEndian::read_u32(&data[11..15]),
        })
    }

    /// Encode with a correct CRC
    pub fn to_bytes(&self) -> [u8; MEASUREMENT_FRAME_LEN] {
        let mut out = [0u8; MEASUREMENT_FRAME_LEN];
        LittleEndian::write_u32(&mut out[0..4], self.current_ua);
        LittleEndian::write_u32(&mut out[4..8], self.voltage_uv);
        out[8] = self.temperature;
        out[9] = self.status;
        out[10] = self.user_pins;
        LittleEndian::write_u32(&mut out[11..15], self.error_flags);
        let crc = crc16(&out[..15]);
        LittleEndian::write_u16(&mut out[15..17], crc);
        out
    }

    /// Current in amperes
    pub fn current(&self) -> f64 {
        self.current_ua as f64 / 1e6
    }

    /// Voltage in volts
    pub fn voltage(&self) -> f64 {
        self.voltage_uv as f64 / 1e6
    }

    /// Temperature in °C, raw device scale
    pub fn temperature(&self) -> f64 {
        self.temperature as f64
    }

    /// Remote (4-wire) sensing active
    pub fn remote(&self) -> bool {
        (self.status >> STATUS_REMOTE_BIT) & 1 == 1
    }

    /// Error flags with internal diagnostic bits hidden
    pub fn reported_errors(&self) -> u32 {
        self.error_flags & ERROR_MASK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip_all_fields() {
        for dir in [Direction::Read, Direction::Write] {
            for (code, &len) in PAYLOAD_LENGTHS.iter().enumerate() {
                for id in [0u8, 1, 18, 31] {
                    let op = Opcode::new(dir, id, len).expect("valid length");
                    let back = Opcode::decode(op.encode());
                    assert_eq!(back.direction, dir);
                    assert_eq!(back.length_code as usize, code);
                    assert_eq!(back.command_id, id);
                }
            }
        }
    }

    #[test]
    fn test_oversized_command_id_keeps_other_fields() {
        let op = Opcode {
            direction: Direction::Read,
            length_code: 1,
            command_id: 40,
        };
        let back = Opcode::decode(op.encode());
        assert_eq!(back.direction, Direction::Read);
        assert_eq!(back.length_code, 1);
        assert_eq!(back.command_id, 40 & 0x1F);
    }

    #[test]
    fn test_read_request_layout() {
        let frame = CommandFrame::read(1);
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), 3);
        assert_eq!(bytes[0], 0x01);
        assert_eq!(u16::from_le_bytes([bytes[1], bytes[2]]), crc16(&[0x01]));
    }

    #[test]
    fn test_write_frame_layout() {
        // 1.0 A constant current: 1_000_000 µA = 0x000F4240
        let frame = CommandFrame::write(1, &1_000_000u32.to_le_bytes()).expect("4-byte payload");
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), 7);
        assert_eq!(bytes[0], 0x80 | (3 << 5) | 1);
        assert_eq!(&bytes[1..5], &[0x40, 0x42, 0x0F, 0x00]);
        assert_eq!(CommandFrame::from_bytes(&bytes), Ok(frame));
    }

    #[test]
    fn test_write_rejects_odd_payload() {
        assert!(CommandFrame::write(10, &[0, 0, 0]).is_err());
    }

    #[test]
    fn test_payload_value_widths() {
        let f = CommandFrame::write(15, &[200]).expect("1-byte");
        assert_eq!(f.payload_value(), 200);
        let f = CommandFrame::write(12, &0x1234u16.to_le_bytes()).expect("2-byte");
        assert_eq!(f.payload_value(), 0x1234);
    }

    #[test]
    fn test_measurement_decode() {
        let raw = MeasurementFrame {
            current_ua: 1_234_567,
            voltage_uv: 0,
            temperature: 25,
            status: 0x20,
            user_pins: 0,
            error_flags: 0,
        };
        let decoded = MeasurementFrame::from_bytes(&raw.to_bytes()).expect("valid frame");
        assert!((decoded.current() - 1.234567).abs() < 1e-9);
        assert_eq!(decoded.voltage(), 0.0);
        assert_eq!(decoded.temperature(), 25.0);
        assert!(decoded.remote());
    }

    #[test]
    fn test_any_single_bit_flip_is_rejected() {
        let raw = MeasurementFrame {
            current_ua: 500_000,
            voltage_uv: 12_000_000,
            temperature: 31,
            status: 0,
            user_pins: 3,
            error_flags: 0x10,
        };
        let good = raw.to_bytes();
        for byte in 0..MEASUREMENT_FRAME_LEN {
            for bit in 0..8 {
                let mut bad = good;
                bad[byte] ^= 1 << bit;
                assert!(
                    matches!(
                        MeasurementFrame::from_bytes(&bad),
                        Err(FrameError::CrcMismatch { .. })
                    ),
                    "flip of byte {} bit {} accepted",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_short_frame_rejected() {
        let good = MeasurementFrame::default().to_bytes();
        assert_eq!(
            MeasurementFrame::from_bytes(&good[..10]),
            Err(FrameError::WrongLength {
                expected: 17,
                actual: 10
            })
        );
    }

    #[test]
    fn test_error_mask_hides_diagnostic_bits() {
        let raw = MeasurementFrame {
            error_flags: 0xFFFF_FFFF,
            ..Default::default()
        };
        assert_eq!(raw.reported_errors(), ERROR_MASK);
        let raw = MeasurementFrame {
            error_flags: 0b0001,
            ..Default::default()
        };
        assert_eq!(raw.reported_errors(), 0);
    }
}
