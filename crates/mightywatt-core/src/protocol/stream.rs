//! Byte-level line to the load
//!
//! Everything above this trait talks frames and text lines; below it is
//! a serial port or the simulator.

use std::time::Duration;

use super::{ConnectionConfig, LinkError, MAX_LINE_LEN};

/// Abstraction over the open line to the load (serial port or simulator)
///
/// Every call blocks for at most the configured read or write timeout.
pub trait Link: Send {
    /// Port name, for logging
    fn name(&self) -> &str;

    /// Write every byte or fail; a write timeout is [`LinkError::Timeout`]
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError>;

    /// Read up to `len` bytes, returning early (possibly empty) when the read
    /// timeout elapses
    fn read_available(&mut self, len: usize) -> Result<Vec<u8>, LinkError>;

    /// Drop anything buffered in either direction
    fn discard_input(&mut self) -> Result<(), LinkError>;

    /// Release the port; calling it twice is harmless
    fn close(&mut self) -> Result<(), LinkError>;

    /// Read exactly `len` bytes; a short read is [`LinkError::Timeout`]
    fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, LinkError> {
        let data = self.read_available(len)?;
        if data.len() < len {
            return Err(LinkError::Timeout);
        }
        Ok(data)
    }

    /// Read a single byte
    fn read_byte(&mut self) -> Result<u8, LinkError> {
        self.read_exact(1)?.first().copied().ok_or(LinkError::Timeout)
    }

    /// Read one `\n`-terminated line, without the terminator and any trailing `\r`
    ///
    /// Gives up with [`LinkError::LineTooLong`] after [`MAX_LINE_LEN`] bytes
    /// without a terminator.
    fn read_line(&mut self) -> Result<String, LinkError> {
        let mut line = Vec::new();
        loop {
            match self.read_byte()? {
                b'\n' => break,
                _ if line.len() >= MAX_LINE_LEN => {
                    return Err(LinkError::LineTooLong { limit: MAX_LINE_LEN })
                }
                b => line.push(b),
            }
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }
}

/// Opens links; lets the connection run against hardware or a simulator
pub trait Connector: Send + Sync {
    /// Open `port_name`, apply DTR/RTS and settle; returns a flushed link
    fn open(
        &self,
        port_name: &str,
        rts_dtr_enable: bool,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn Link>, LinkError>;
}

/// Sleep for the post-open settle delay, skipping zero
pub(crate) fn settle(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}
