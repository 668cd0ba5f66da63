//! Connection management
//!
//! Handles the connection lifecycle: handshake, the polling thread, setpoints
//! and the published measurement state.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::session::handshake;
use super::{
    command_builder, CommandFrame, Connector, ProtocolError, RunMode, SerialConnector,
    WriteCommand, DEFAULT_BAUD_RATE, DEFAULT_CONNECT_ATTEMPTS, IDENTIFICATION, MINIMUM_FIRMWARE,
    READ_TIMEOUT_MS, SETTLE_DELAY_MS, WRITE_TIMEOUT_MS,
};
use crate::device::{CapabilitySnapshot, DeviceInfo, FirmwareVersion};
use crate::realtime::{self, LoadEvent, MeasurementSnapshot, PollerState, Shared, StopReason};
use crate::validation::validate;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Connecting (handshake in progress)
    Connecting,
    /// Connected and polling
    Connected,
}

/// Connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Baud rate
    pub baud_rate: u32,
    /// Read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Write timeout in milliseconds
    pub write_timeout_ms: u64,
    /// Wait after opening the port, in milliseconds
    pub settle_delay_ms: u64,
    /// Identification attempts per connect
    pub connect_attempts: u32,
    /// Drive DTR and RTS high after opening
    pub rts_dtr_enable: bool,
    /// Older firmware connects with a warning
    pub minimum_firmware: FirmwareVersion,
    /// Substring expected in the identification line
    pub identification: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: READ_TIMEOUT_MS,
            write_timeout_ms: WRITE_TIMEOUT_MS,
            settle_delay_ms: SETTLE_DELAY_MS,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            rts_dtr_enable: false,
            minimum_firmware: MINIMUM_FIRMWARE,
            identification: IDENTIFICATION.to_string(),
        }
    }
}

impl ConnectionConfig {
    /// Load from a JSON file; missing keys take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Parse a JSON config, filling absent fields with defaults
    pub fn from_json_str(text: &str) -> Result<Self, ProtocolError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| ProtocolError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), ProtocolError> {
        if self.baud_rate == 0 {
            return Err(ProtocolError::Config("baud_rate must be positive".into()));
        }
        if self.read_timeout_ms == 0 || self.write_timeout_ms == 0 {
            return Err(ProtocolError::Config("timeouts must be positive".into()));
        }
        Ok(())
    }

    /// Per-read timeout
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Per-write timeout
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Wait after opening the port before the first identify
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Worst-case time for one poll cycle against a silent load
    ///
    /// Sequencers wait this long after a setpoint before trusting readings.
    pub fn load_delay(&self) -> Duration {
        self.read_timeout() + self.write_timeout()
    }
}

/// Connection to one electronic load
///
/// All methods take `&self`; a `Connection` can be shared behind an `Arc` and
/// driven from any number of threads while its polling thread runs.
pub struct Connection {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    /// Serializes connect/disconnect and holds the polling thread
    worker: Mutex<Option<JoinHandle<StopReason>>>,
}

impl Connection {
    /// Create a new connection (not yet connected) using real serial ports
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_connector(config, Arc::new(SerialConnector))
    }

    /// Create a connection that opens links through `connector`
    pub fn with_connector(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            shared: Arc::new(Shared::new()),
            worker: Mutex::new(None),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Connect with the configured attempt budget
    pub fn connect(&self, port_name: &str) -> Result<Arc<DeviceInfo>, ProtocolError> {
        self.connect_with(port_name, self.config.rts_dtr_enable, self.config.connect_attempts)
    }

    /// Close any current session, identify the load on `port_name` and start polling
    ///
    /// Fails with [`ProtocolError::DeviceMismatch`] once `attempts` identifications
    /// have failed; call again for a fresh budget.
    pub fn connect_with(
        &self,
        port_name: &str,
        rts_dtr_enable: bool,
        attempts: u32,
    ) -> Result<Arc<DeviceInfo>, ProtocolError> {
        let mut worker = self.lock_worker();
        self.shutdown(&mut worker);

        info!(port = port_name, attempts, "connecting");
        self.shared.set_state(ConnectionState::Connecting);

        let session = match handshake(
            self.connector.as_ref(),
            port_name,
            rts_dtr_enable,
            attempts,
            &self.config,
        ) {
            Ok(session) => session,
            Err(e) => {
                warn!(port = port_name, error = %e, "connect failed");
                self.shared.teardown();
                return Err(e);
            }
        };

        let info = Arc::new(session.info);
        self.shared.begin_session(Arc::clone(&info));

        self.shared.publish(LoadEvent::Connected(Arc::clone(&info)));
        if !session.firmware.is_supported() {
            self.shared.publish(LoadEvent::FirmwareWarning(session.firmware));
        }

        match realtime::spawn(session.link, Arc::clone(&self.shared)) {
            Ok(handle) => *worker = Some(handle),
            Err(e) => {
                self.shared.teardown();
                return Err(ProtocolError::Io(e));
            }
        }
        info!(port = port_name, identification = %info.identification, "connected");
        Ok(info)
    }

    /// Stop polling, close the port and reset all device state
    ///
    /// Returns after the polling thread has exited, at most one read timeout.
    pub fn disconnect(&self) {
        let mut worker = self.lock_worker();
        self.shutdown(&mut worker);
    }

    fn shutdown(&self, worker: &mut Option<JoinHandle<StopReason>>) {
        if let Some(handle) = worker.take() {
            self.shared.request_cancel();
            match handle.join() {
                Ok(reason) => debug!(?reason, "polling thread joined"),
                Err(_) => warn!("polling thread panicked outside a tick"),
            }
        }
        self.shared.teardown();
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// True while a device is attached and polled
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// State of the polling loop
    pub fn poller_state(&self) -> PollerState {
        self.shared.poller_state()
    }

    /// Validate and queue a setpoint
    ///
    /// Out-of-range values are rejected before anything is queued. Any setpoint
    /// other than zero current releases a previous stop.
    pub fn set(&self, mode: RunMode, value: f64) -> Result<(), ProtocolError> {
        let device = self.device().ok_or(ProtocolError::NotConnected)?;
        validate(mode, value, Some(&device.capabilities))?;
        let frame = command_builder::setpoint(mode, value)?;

        let release_stop = mode != RunMode::Current || value != 0.0;
        self.shared.submit(frame, release_stop);
        Ok(())
    }

    /// Queue a raw write command with a 1-byte payload
    pub fn set_value_u8(&self, cmd: WriteCommand, payload: u8) -> Result<(), ProtocolError> {
        self.enqueue_connected(command_builder::write_u8(cmd, payload))
    }

    /// Queue a raw write command with a 2-byte payload
    pub fn set_value_u16(&self, cmd: WriteCommand, payload: u16) -> Result<(), ProtocolError> {
        self.enqueue_connected(command_builder::write_u16(cmd, payload))
    }

    /// Queue a raw write command with a 4-byte payload
    pub fn set_value_u32(&self, cmd: WriteCommand, payload: u32) -> Result<(), ProtocolError> {
        self.enqueue_connected(command_builder::write_u32(cmd, payload))
    }

    /// Compensate for lead resistance, in ohms
    pub fn set_series_resistance(&self, ohms: f64) -> Result<(), ProtocolError> {
        if !ohms.is_finite() || ohms < 0.0 {
            return Err(ProtocolError::InvalidInput(format!(
                "series resistance {} must be a non-negative number",
                ohms
            )));
        }
        self.enqueue_connected(command_builder::series_resistance(ohms)?)?;
        self.shared.update_snapshot(|s| s.series_resistance = ohms);
        Ok(())
    }

    /// Switch remote (4-wire) voltage sensing
    pub fn set_remote(&self, enabled: bool) -> Result<(), ProtocolError> {
        self.enqueue_connected(command_builder::four_wire(enabled))?;
        self.shared.update_snapshot(|s| s.remote = enabled);
        Ok(())
    }

    /// Hold the load at zero current after the pending commands are sent
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Discard pending commands and hold the load at zero current
    pub fn immediate_stop(&self) {
        self.shared.immediate_stop();
    }

    /// Reset the sticky error register
    pub fn clear_errors(&self) {
        self.shared.clear_errors();
    }

    /// The measured quantity that `mode` regulates
    pub fn get_value(&self, mode: RunMode) -> f64 {
        let dvm = self
            .capabilities()
            .map(|c| c.voltmeter_input_resistance)
            .unwrap_or(0.0);
        self.snapshot().value(mode, dvm)
    }

    /// Copy of the latest measurement
    pub fn snapshot(&self) -> MeasurementSnapshot {
        self.shared.snapshot()
    }

    /// Current sticky error flags
    pub fn error_flags(&self) -> u32 {
        self.shared.errors.get()
    }

    /// Error register rendered through the device's error catalog
    pub fn error_list(&self) -> String {
        let flags = self.error_flags();
        match self.device() {
            Some(device) => device.error_catalog.render(flags),
            None => String::new(),
        }
    }

    /// Discrete events: connect, disconnect, data, warnings and faults
    pub fn subscribe(&self) -> broadcast::Receiver<LoadEvent> {
        self.shared.subscribe()
    }

    /// Latest measurement as an observable value
    pub fn watch(&self) -> watch::Receiver<MeasurementSnapshot> {
        self.shared.watch()
    }

    /// Attached device, if any
    pub fn device(&self) -> Option<Arc<DeviceInfo>> {
        self.shared.device()
    }

    /// Capability snapshot of the attached device
    pub fn capabilities(&self) -> Option<CapabilitySnapshot> {
        self.device().map(|d| d.capabilities.clone())
    }

    /// Port the device is attached on
    pub fn port_name(&self) -> Option<String> {
        self.device().map(|d| d.port_name.clone())
    }

    /// Identification string the device answered with
    pub fn identification(&self) -> Option<String> {
        self.device().map(|d| d.identification.clone())
    }

    /// Frames waiting for the next tick
    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Inbound frames dropped this session (CRC or length)
    pub fn crc_failures(&self) -> u64 {
        self.shared.crc_failures()
    }

    fn enqueue_connected(&self, frame: CommandFrame) -> Result<(), ProtocolError> {
        if self.device().is_none() {
            return Err(ProtocolError::NotConnected);
        }
        self.shared.submit(frame, false);
        Ok(())
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<JoinHandle<StopReason>>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new(ConnectionConfig::default())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = ConnectionConfig::default();
        assert_eq!(config.baud_rate, 500_000);
        assert_eq!(config.load_delay(), Duration::from_millis(900));
        assert_eq!(config.minimum_firmware, FirmwareVersion::new(3, 0, 0));
        assert_eq!(config.identification, "MightyWatt R3");
    }

    #[test]
    fn test_config_partial_json() {
        let config =
            ConnectionConfig::from_json_str(r#"{ "settle_delay_ms": 0, "minimum_firmware": "3.1.4" }"#)
                .expect("valid config");
        assert_eq!(config.settle_delay_ms, 0);
        assert_eq!(config.minimum_firmware, FirmwareVersion::new(3, 1, 4));
        assert_eq!(config.read_timeout_ms, 500);
    }

    #[test]
    fn test_config_rejects_bad_values() {
        assert!(matches!(
            ConnectionConfig::from_json_str(r#"{ "minimum_firmware": "three" }"#),
            Err(ProtocolError::Config(_))
        ));
        assert!(matches!(
            ConnectionConfig::from_json_str(r#"{ "read_timeout_ms": 0 }"#),
            Err(ProtocolError::Config(_))
        ));
    }

    #[test]
    fn test_commands_need_a_device() {
        let conn = Connection::default();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(matches!(
            conn.set(RunMode::Current, 1.0),
            Err(ProtocolError::NotConnected)
        ));
        assert!(matches!(
            conn.set_value_u8(WriteCommand::LedBrightness, 3),
            Err(ProtocolError::NotConnected)
        ));
        assert_eq!(conn.queue_len(), 0);
        assert_eq!(conn.error_list(), "");
    }

    #[test]
    fn test_disconnect_without_connect_is_silent() {
        let conn = Connection::default();
        let mut events = conn.subscribe();
        conn.disconnect();
        conn.disconnect();
        assert!(events.try_recv().is_err());
        assert_eq!(conn.poller_state(), PollerState::Idle);
    }
}
