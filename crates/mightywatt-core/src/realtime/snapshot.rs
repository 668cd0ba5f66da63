//! Measurement snapshot, sticky error register and published events

use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::device::{DeviceInfo, FirmwareCheck};
use crate::protocol::{MeasurementFrame, RunMode};

/// Latest decoded measurement, published by value
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MeasurementSnapshot {
    /// Amperes
    pub current: f64,
    /// Volts
    pub voltage: f64,
    /// °C
    pub temperature: f64,
    /// Status bits from the last frame
    pub status: u8,
    /// Remote (4-wire) sensing
    pub remote: bool,
    /// User I/O pin state
    pub user_pins: u8,
    /// Sticky error register at the time of publishing
    pub error_flags: u32,
    /// Last series resistance sent to the load, in ohms
    pub series_resistance: f64,
}

impl MeasurementSnapshot {
    /// Overwrite the measured fields from a decoded frame
    pub fn apply(&mut self, frame: &MeasurementFrame, error_flags: u32) {
        self.current = frame.current();
        self.voltage = frame.voltage();
        self.temperature = frame.temperature();
        self.status = frame.status;
        self.remote = frame.remote();
        self.user_pins = frame.user_pins;
        self.error_flags = error_flags;
    }

    /// Dissipated power in watts
    pub fn power(&self) -> f64 {
        self.voltage * self.current
    }

    /// Load resistance; with no current flowing the voltmeter input resistance
    /// stands in for the open circuit
    pub fn resistance(&self, voltmeter_input_resistance: f64) -> f64 {
        if self.current == 0.0 {
            voltmeter_input_resistance
        } else {
            self.voltage / self.current
        }
    }

    /// The quantity a run mode regulates
    pub fn value(&self, mode: RunMode, voltmeter_input_resistance: f64) -> f64 {
        match mode {
            RunMode::Current | RunMode::SimpleAmmeter => self.current,
            RunMode::PowerCC | RunMode::PowerCV => self.power(),
            RunMode::ResistanceCC | RunMode::ResistanceCV => {
                self.resistance(voltmeter_input_resistance)
            }
            RunMode::Voltage | RunMode::VoltageSoftware | RunMode::Mppt => self.voltage,
        }
    }
}

/// OR-accumulated device error flags; only an explicit clear resets them
#[derive(Debug, Default)]
pub struct ErrorRegister {
    flags: AtomicU32,
}

impl ErrorRegister {
    /// Register with no bits set
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge new flags, returning the register after the merge
    pub fn merge(&self, flags: u32) -> u32 {
        self.flags.fetch_or(flags, Ordering::AcqRel) | flags
    }

    /// All bits currently set
    ///
    /// ```
    /// use mightywatt_core::realtime::ErrorRegister;
    ///
    /// let errors = ErrorRegister::new();
    /// errors.merge(0b0100);
    /// errors.merge(0b0001);
    /// assert_eq!(errors.get(), 0b0101);
    /// errors.clear();
    /// assert_eq!(errors.get(), 0);
    /// ```
    pub fn get(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    /// Reset every bit
    pub fn clear(&self) {
        self.flags.store(0, Ordering::Release);
    }

    /// True if `bit` is set
    pub fn is_set(&self, bit: u32) -> bool {
        bit < 32 && (self.get() >> bit) & 1 == 1
    }
}

/// Notifications published by a [`crate::protocol::Connection`]
#[derive(Debug, Clone)]
pub enum LoadEvent {
    /// Handshake finished and polling started
    Connected(Arc<DeviceInfo>),
    /// Port closed and all device state reset
    Disconnected,
    /// A measurement frame was decoded
    DataUpdated(MeasurementSnapshot),
    /// Connected, but the firmware is older than required or unknown
    FirmwareWarning(FirmwareCheck),
    /// Transport failure; the load must be reconnected
    LinkLost(String),
    /// The polling loop failed unexpectedly and was shut down
    LoopFault(String),
}
