//! Serial port handling
//!
//! Opens and configures the load's serial port and exposes it as a [`Link`].

use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, warn};

use super::stream::settle;
use super::{ConnectionConfig, Connector, Link, LinkError};

/// Open a serial port with the configured line speed and read timeout
pub fn open_port(name: &str, config: &ConnectionConfig) -> Result<Box<dyn SerialPort>, LinkError> {
    serialport::new(name, config.baud_rate)
        .timeout(config.read_timeout())
        .open()
        .map_err(LinkError::from)
}

/// Configure a serial port for the load: 8N1, no flow control
///
/// DTR and RTS are driven together from `rts_dtr_enable`. Some USB bridges need
/// them asserted, others reset the microcontroller when they toggle.
pub fn configure_port(port: &mut dyn SerialPort, rts_dtr_enable: bool) -> Result<(), LinkError> {
    port.set_data_bits(serialport::DataBits::Eight)?;
    port.set_parity(serialport::Parity::None)?;
    port.set_stop_bits(serialport::StopBits::One)?;
    port.set_flow_control(serialport::FlowControl::None)?;

    if let Err(e) = port.write_data_terminal_ready(rts_dtr_enable) {
        warn!(error = %e, "failed to drive DTR, continuing");
    }
    if let Err(e) = port.write_request_to_send(rts_dtr_enable) {
        warn!(error = %e, "failed to drive RTS, continuing");
    }
    Ok(())
}

/// Clear the serial port buffers
pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<(), LinkError> {
    port.clear(serialport::ClearBuffer::All)?;
    Ok(())
}

/// An open serial port with separate read and write timeouts
pub struct SerialLink {
    name: String,
    port: Option<Box<dyn SerialPort>>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl SerialLink {
    /// Wrap an opened port; timeouts come from `config`
    pub fn new(name: impl Into<String>, port: Box<dyn SerialPort>, config: &ConnectionConfig) -> Self {
        Self {
            name: name.into(),
            port: Some(port),
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
        }
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, LinkError> {
        self.port.as_mut().ok_or(LinkError::Closed)
    }
}

impl Link for SerialLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        let timeout = self.write_timeout;
        let port = self.port()?;
        port.set_timeout(timeout)?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    fn read_available(&mut self, len: usize) -> Result<Vec<u8>, LinkError> {
        let timeout = self.read_timeout;
        let port = self.port()?;
        port.set_timeout(timeout)?;

        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn discard_input(&mut self) -> Result<(), LinkError> {
        clear_buffers(self.port()?.as_mut())
    }

    fn close(&mut self) -> Result<(), LinkError> {
        if let Some(mut port) = self.port.take() {
            // Dropping the handle closes the port; a failed flush is not fatal
            if let Err(e) = port.flush() {
                debug!(port = %self.name, error = %e, "flush on close failed");
            }
            debug!(port = %self.name, "port closed");
        }
        Ok(())
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Opens real serial ports
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialConnector;

impl Connector for SerialConnector {
    fn open(
        &self,
        port_name: &str,
        rts_dtr_enable: bool,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn Link>, LinkError> {
        let mut port = open_port(port_name, config)?;
        configure_port(port.as_mut(), rts_dtr_enable)?;
        debug!(port = port_name, baud = config.baud_rate, rts_dtr_enable, "port open");

        settle(config.settle_delay());
        clear_buffers(port.as_mut())?;

        Ok(Box::new(SerialLink::new(port_name, port, config)))
    }
}
