//! Demo Mode - Simulated electronic load for testing
//!
//! Speaks the wire protocol over an in-memory [`Link`] so the full engine can
//! run without hardware. The load is attached to a simulated source: a fixed
//! open-circuit voltage behind an internal resistance.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace};

use crate::device::CapabilitySnapshot;
use crate::protocol::stream::settle;
use crate::protocol::{
    CommandFrame, ConnectionConfig, Connector, Direction, FrameError, Link, LinkError,
    MeasurementFrame, Opcode, ReadCommand, RunMode, WriteCommand, IDENTIFICATION,
    STATUS_REMOTE_BIT,
};

/// Error messages reported by the simulated firmware, indexed by flag bit
pub const DEMO_ERROR_MESSAGES: [&str; 6] = [
    "ADC not ready",
    "Overcurrent",
    "Voltage out of range",
    "Overvoltage",
    "Overtemperature",
    "Power limit exceeded",
];

const RECEIVED_HISTORY: usize = 4096;

/// Simulated MightyWatt with a source attached
pub struct DemoLoad {
    state: Mutex<DemoState>,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

struct DemoState {
    identification: String,
    capabilities: CapabilitySnapshot,
    error_messages: Vec<String>,
    /// Open-circuit voltage of the simulated source
    source_voltage: f64,
    /// Internal resistance of the simulated source
    source_resistance: f64,
    mode: RunMode,
    setpoint: f64,
    series_resistance: f64,
    remote: bool,
    user_pins: u8,
    pending_errors: u32,
    corrupt_frames: u32,
    unplugged: bool,
    response_delay: Duration,
    noise_uunits: u32,
    rx: Vec<u8>,
    tx: VecDeque<u8>,
    received: Vec<CommandFrame>,
    rng: StdRng,
}

impl Default for DemoLoad {
    fn default() -> Self {
        Self::new(0x4D57)
    }
}

impl DemoLoad {
    /// A 10 A / 30 V / 75 W load on a 12 V source with 0.5 Ω internal resistance
    pub fn new(seed: u64) -> Self {
        let capabilities = CapabilitySnapshot {
            calibration_date: "2024-03-01".to_string(),
            firmware_version: "3.1.0".to_string(),
            board_revision: "R3.1".to_string(),
            max_current_source: 10.0,
            max_current_measure: 10.0,
            max_voltage_source: 30.0,
            max_voltage_measure: 32.0,
            max_power: 75.0,
            voltmeter_input_resistance: 330_000.0,
            temperature_threshold: 110,
        };
        Self {
            state: Mutex::new(DemoState {
                identification: IDENTIFICATION.to_string(),
                capabilities,
                error_messages: DEMO_ERROR_MESSAGES.iter().map(|s| s.to_string()).collect(),
                source_voltage: 12.0,
                source_resistance: 0.5,
                mode: RunMode::Current,
                setpoint: 0.0,
                series_resistance: 0.0,
                remote: false,
                user_pins: 0,
                pending_errors: 0,
                corrupt_frames: 0,
                unplugged: false,
                response_delay: Duration::from_millis(5),
                noise_uunits: 500,
                rx: Vec::new(),
                tx: VecDeque::new(),
                received: Vec::new(),
                rng: StdRng::seed_from_u64(seed),
            }),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DemoState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer identification with a different device name
    pub fn with_identification(self, identification: impl Into<String>) -> Self {
        self.lock().identification = identification.into();
        self
    }

    /// Report a different firmware version in the capability query
    pub fn with_firmware(self, version: impl Into<String>) -> Self {
        self.lock().capabilities.firmware_version = version.into();
        self
    }

    /// Time taken to answer a measurement request
    pub fn with_response_delay(self, delay: Duration) -> Self {
        self.lock().response_delay = delay;
        self
    }

    /// Measurement noise amplitude in µA / µV; zero gives exact readings
    pub fn with_noise(self, noise_uunits: u32) -> Self {
        self.lock().noise_uunits = noise_uunits;
        self
    }

    /// Replace the attached source: open-circuit volts behind `internal_resistance` ohms
    pub fn set_source(&self, open_circuit_voltage: f64, internal_resistance: f64) {
        let mut s = self.lock();
        s.source_voltage = open_circuit_voltage.max(0.0);
        s.source_resistance = internal_resistance.max(1e-3);
    }

    /// Report `flags` (unmasked) in the next measurement frame
    pub fn inject_errors(&self, flags: u32) {
        self.lock().pending_errors |= flags;
    }

    /// Flip a bit in each of the next `count` measurement frames
    pub fn corrupt_next_frames(&self, count: u32) {
        self.lock().corrupt_frames += count;
    }

    /// Make every link operation fail, as if the cable were pulled
    pub fn unplug(&self) {
        self.lock().unplugged = true;
    }

    /// Undo [`DemoLoad::unplug`]
    pub fn plug_in(&self) {
        self.lock().unplugged = false;
    }

    /// Limits the load reports
    pub fn capabilities(&self) -> CapabilitySnapshot {
        self.lock().capabilities.clone()
    }

    /// Mode and setpoint currently applied
    pub fn setpoint(&self) -> (RunMode, f64) {
        let s = self.lock();
        (s.mode, s.setpoint)
    }

    /// Last series resistance received, in ohms
    pub fn series_resistance(&self) -> f64 {
        self.lock().series_resistance
    }

    /// Remote sensing as last commanded
    pub fn remote(&self) -> bool {
        self.lock().remote
    }

    /// Well-formed frames received, oldest first (bounded history)
    pub fn received(&self) -> Vec<CommandFrame> {
        self.lock().received.clone()
    }

    /// Links opened so far
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Links closed so far
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn receive(&self, bytes: &[u8]) -> Result<(), LinkError> {
        let delay = {
            let mut s = self.lock();
            if s.unplugged {
                return Err(unplugged());
            }
            s.rx.extend_from_slice(bytes);

            let mut measured = false;
            while let Some(&first) = s.rx.first() {
                let len = 1 + Opcode::decode(first).payload_len() + 2;
                if s.rx.len() < len {
                    break;
                }
                let raw: Vec<u8> = s.rx.drain(..len).collect();
                match CommandFrame::from_bytes(&raw) {
                    Ok(frame) => measured |= s.handle(frame),
                    Err(FrameError::CrcMismatch { .. }) => {
                        // Firmware resynchronizes by dropping everything buffered
                        debug!("demo load dropped a corrupt command");
                        s.rx.clear();
                    }
                    Err(e) => debug!(error = %e, "demo load dropped a command"),
                }
            }
            if measured {
                s.response_delay
            } else {
                Duration::ZERO
            }
        };
        // Conversion time of the simulated ADC
        settle(delay);
        Ok(())
    }

    fn transmit(&self, len: usize) -> Result<Vec<u8>, LinkError> {
        let mut s = self.lock();
        if s.unplugged {
            return Err(unplugged());
        }
        let n = len.min(s.tx.len());
        Ok(s.tx.drain(..n).collect())
    }
}

impl DemoState {
    /// Act on one command; true when a measurement was produced
    fn handle(&mut self, frame: CommandFrame) -> bool {
        trace!(?frame, "demo load received");
        if self.received.len() >= RECEIVED_HISTORY {
            self.received.remove(0);
        }
        self.received.push(frame.clone());
        match frame.direction() {
            Direction::Read => match ReadCommand::from_id(frame.command_id()) {
                Some(ReadCommand::Identification) => {
                    let line = format!("{}\n", self.identification);
                    self.tx.extend(line.bytes());
                }
                Some(ReadCommand::Capabilities) => self.send_capabilities(),
                Some(ReadCommand::ErrorMessages) => {
                    self.tx.push_back(self.error_messages.len() as u8);
                    for msg in &self.error_messages {
                        self.tx.extend(msg.bytes());
                        self.tx.push_back(b'\n');
                    }
                }
                Some(ReadCommand::Measurement) => {
                    self.send_measurement();
                    return true;
                }
                None => debug!(id = frame.command_id(), "demo load ignored read"),
            },
            Direction::Write => self.apply(&frame),
        }
        false
    }

    fn send_capabilities(&mut self) {
        let c = &self.capabilities;
        let lines = [
            c.calibration_date.clone(),
            c.firmware_version.clone(),
            c.board_revision.clone(),
            micro(c.max_current_source),
            micro(c.max_current_measure),
            micro(c.max_voltage_source),
            micro(c.max_voltage_measure),
            micro(c.max_power),
            format!("{}", (c.voltmeter_input_resistance * 1e3).round() as u64),
            c.temperature_threshold.to_string(),
        ];
        for line in lines {
            self.tx.extend(line.bytes());
            self.tx.extend(b"\r\n");
        }
    }

    fn apply(&mut self, frame: &CommandFrame) {
        let raw = frame.payload_value();
        let Some(cmd) = WriteCommand::from_id(frame.command_id()) else {
            debug!(id = frame.command_id(), "demo load ignored write");
            return;
        };
        if let Some(mode) = RunMode::from_write_command(cmd) {
            self.mode = mode;
            self.setpoint = raw as f64 / mode.wire_scale();
            return;
        }
        match cmd {
            WriteCommand::SeriesResistance => self.series_resistance = raw as f64 / 1e3,
            WriteCommand::FourWire => self.remote = raw != 0,
            WriteCommand::UserPins => self.user_pins = raw as u8,
            _ => {}
        }
    }

    /// Operating point (current, voltage) for the active mode
    fn operating_point(&self) -> (f64, f64) {
        let v0 = self.source_voltage;
        let ri = self.source_resistance;
        let short_circuit = v0 / ri;
        let sp = self.setpoint.max(0.0);

        let current = match self.mode {
            RunMode::Current => sp.min(short_circuit),
            RunMode::Voltage | RunMode::VoltageSoftware => ((v0 - sp) / ri).max(0.0),
            RunMode::PowerCC | RunMode::PowerCV => {
                let disc = v0 * v0 - 4.0 * ri * sp;
                if disc >= 0.0 {
                    (v0 - disc.sqrt()) / (2.0 * ri)
                } else {
                    short_circuit / 2.0
                }
            }
            RunMode::ResistanceCC | RunMode::ResistanceCV => v0 / (sp + ri),
            RunMode::Mppt => short_circuit / 2.0,
            RunMode::SimpleAmmeter => short_circuit,
        };
        let current = current.min(self.capabilities.max_current_source);
        (current, v0 - ri * current)
    }

    fn send_measurement(&mut self) {
        let (current, voltage) = self.operating_point();
        let temperature = 25.0 + current * voltage / 3.0;

        let mut frame = MeasurementFrame {
            current_ua: self.jitter(current),
            voltage_uv: self.jitter(voltage),
            temperature: temperature.clamp(0.0, 255.0) as u8,
            status: (self.remote as u8) << STATUS_REMOTE_BIT,
            user_pins: self.user_pins,
            error_flags: std::mem::take(&mut self.pending_errors),
        };
        if current == 0.0 {
            frame.current_ua = 0;
        }

        let mut bytes = frame.to_bytes();
        if self.corrupt_frames > 0 {
            self.corrupt_frames -= 1;
            let at = self.rng.gen_range(0..bytes.len());
            bytes[at] ^= 1u8 << self.rng.gen_range(0..8u32);
        }
        self.tx.extend(bytes);
    }

    fn jitter(&mut self, value: f64) -> u32 {
        let noise = if self.noise_uunits == 0 {
            0.0
        } else {
            let n = self.noise_uunits as f64;
            self.rng.gen_range(-n..=n)
        };
        (value * 1e6 + noise).round().clamp(0.0, u32::MAX as f64) as u32
    }
}

fn micro(value: f64) -> String {
    format!("{}", (value * 1e6).round() as u64)
}

fn unplugged() -> LinkError {
    LinkError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "demo load unplugged",
    ))
}

/// Link to a [`DemoLoad`]
pub struct DemoLink {
    name: String,
    load: Arc<DemoLoad>,
    open: bool,
}

impl Link for DemoLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        if !self.open {
            return Err(LinkError::Closed);
        }
        self.load.receive(bytes)
    }

    fn read_available(&mut self, len: usize) -> Result<Vec<u8>, LinkError> {
        if !self.open {
            return Err(LinkError::Closed);
        }
        self.load.transmit(len)
    }

    fn discard_input(&mut self) -> Result<(), LinkError> {
        self.load.lock().tx.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<(), LinkError> {
        if std::mem::replace(&mut self.open, false) {
            self.load.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for DemoLink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Opens links to one shared [`DemoLoad`], whatever the port name
#[derive(Clone, Default)]
pub struct DemoConnector {
    load: Arc<DemoLoad>,
}

impl DemoConnector {
    /// Connector for `load`
    pub fn new(load: Arc<DemoLoad>) -> Self {
        Self { load }
    }

    /// The simulated load behind every link
    pub fn load(&self) -> &Arc<DemoLoad> {
        &self.load
    }
}

impl Connector for DemoConnector {
    fn open(
        &self,
        port_name: &str,
        _rts_dtr_enable: bool,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn Link>, LinkError> {
        if self.load.lock().unplugged {
            return Err(LinkError::Serial(format!("{}: no such device", port_name)));
        }
        self.load.opens.fetch_add(1, Ordering::SeqCst);
        settle(config.settle_delay());
        {
            let mut s = self.load.lock();
            s.rx.clear();
            s.tx.clear();
        }
        Ok(Box::new(DemoLink {
            name: port_name.to_string(),
            load: Arc::clone(&self.load),
            open: true,
        }))
    }
}
