//! Protocol errors
//!
//! Errors are split by who has to deal with them. [`ProtocolError`] is returned
//! to callers of the public API (handshake and setpoint validation). [`LinkError`]
//! and [`FrameError`] stay inside the polling loop and only surface as events.

use thiserror::Error;

use super::commands::RunMode;

/// Errors returned to callers of the connection API
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// No device is connected
    #[error("Not connected to load")]
    NotConnected,

    #[error("Wrong device: no identification match after {attempts} attempt(s)")]
    /// Every identification attempt got a foreign or silent answer
    DeviceMismatch {
        /// Attempts made
        attempts: u32,
    },

    /// Transport failure while opening or negotiating
    #[error("Handshake failed: {0}")]
    Handshake(#[from] LinkError),

    /// A handshake answer could not be parsed
    #[error("Malformed response from load: {0}")]
    MalformedResponse(String),

    #[error("Set {mode} out of range: {value} is outside [0, {max}]")]
    /// Setpoint outside the negotiated limits
    OutOfRange {
        /// Mode of the rejected setpoint
        mode: RunMode,
        /// Requested value, SI units
        value: f64,
        /// Highest accepted value, SI units
        max: f64,
    },

    /// Value that cannot be encoded or is not a number
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Unreadable or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// File or thread I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport failures on the serial line
#[derive(Error, Debug)]
pub enum LinkError {
    /// Read or write did not complete in time
    #[error("Serial line timeout")]
    Timeout,

    /// Port could not be opened or configured
    #[error("Serial port error: {0}")]
    Serial(String),

    /// Used after close
    #[error("Port is closed")]
    Closed,

    #[error("Line exceeds {limit} bytes without a terminator")]
    /// Text answer ran past the line limit
    LineTooLong {
        /// Bytes accepted before giving up
        limit: usize,
    },

    /// Any other I/O failure; the link is gone
    #[error("I/O error: {0}")]
    Io(std::io::Error),
}

impl LinkError {
    /// True for the timeout family, false for every other I/O failure
    pub fn is_timeout(&self) -> bool {
        matches!(self, LinkError::Timeout)
    }
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => LinkError::Timeout,
            _ => LinkError::Io(e),
        }
    }
}

impl From<serialport::Error> for LinkError {
    fn from(e: serialport::Error) -> Self {
        match e.kind() {
            serialport::ErrorKind::Io(std::io::ErrorKind::TimedOut) => LinkError::Timeout,
            _ => LinkError::Serial(e.to_string()),
        }
    }
}

/// Integrity failures of an inbound frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Incomplete frame: expected {expected} bytes, got {actual}")]
    /// Short or overlong frame
    WrongLength {
        /// Bytes a complete frame has
        expected: usize,
        /// Bytes received
        actual: usize,
    },

    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    /// Trailer does not match the content
    CrcMismatch {
        /// CRC computed over the received bytes
        expected: u16,
        /// CRC carried in the trailer
        actual: u16,
    },
}
