//! Serial Protocol Communication
//!
//! Implements the MightyWatt binary protocol: CRC-16 framed commands from the
//! host, fixed 17-byte measurement frames from the load, and a line-based
//! handshake (identification, capabilities, error catalog).

pub mod command_builder;
pub mod commands;
mod connection;
pub mod crc;
mod error;
mod packet;
pub mod serial;
mod session;
pub mod stream;

pub use commands::{ReadCommand, RunMode, WriteCommand};
pub use connection::{Connection, ConnectionConfig, ConnectionState};
pub use error::{FrameError, LinkError, ProtocolError};
pub use packet::{CommandFrame, Direction, MeasurementFrame, Opcode, PAYLOAD_LENGTHS, STATUS_REMOTE_BIT};
pub use serial::{SerialConnector, SerialLink};
pub use session::{handshake, identify, query_capabilities, query_error_catalog, Handshake};
pub use stream::{Connector, Link};

use crate::device::FirmwareVersion;

/// Line speed of the load's USB-serial bridge
pub const DEFAULT_BAUD_RATE: u32 = 500_000;

/// Read timeout in milliseconds
pub const READ_TIMEOUT_MS: u64 = 500;

/// Write timeout in milliseconds
pub const WRITE_TIMEOUT_MS: u64 = 400;

/// Delay after opening the port; the microcontroller resets on open
pub const SETTLE_DELAY_MS: u64 = 1000;

/// Substring the identification line must contain
pub const IDENTIFICATION: &str = "MightyWatt R3";

/// Oldest firmware this library is tested against
pub const MINIMUM_FIRMWARE: FirmwareVersion = FirmwareVersion::new(3, 0, 0);

/// Longest text line accepted from the load, terminator excluded
pub const MAX_LINE_LEN: usize = 256;

/// Measurement frame size: 15 payload bytes + 2 CRC bytes
pub const MEASUREMENT_FRAME_LEN: usize = 17;

/// Error flag bits meant for the operator; the rest are internal diagnostics
pub const ERROR_MASK: u32 = 0x1B_F832;

/// Identification attempts per connect call
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;
