//! Device information negotiated during the handshake
//!
//! The capability snapshot and the error catalog are fetched once per
//! connection and never change until the next connect.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Firmware version as `major.minor.patch`
///
/// Ordering is lexicographic: major, then minor, then patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FirmwareVersion {
    /// Incompatible protocol changes
    pub major: u32,
    /// Added features
    pub minor: u32,
    /// Fixes
    pub patch: u32,
}

impl FirmwareVersion {
    /// Version from its three components
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse the first three dot-separated numbers; extra components are ignored
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().split('.');
        let major = parts.next()?.trim().parse().ok()?;
        let minor = parts.next()?.trim().parse().ok()?;
        let patch = parts.next()?.trim().parse().ok()?;
        Some(Self::new(major, minor, patch))
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for FirmwareVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("'{}' is not a major.minor.patch version", s))
    }
}

impl TryFrom<String> for FirmwareVersion {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<FirmwareVersion> for String {
    fn from(v: FirmwareVersion) -> Self {
        v.to_string()
    }
}

/// Outcome of the firmware version gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FirmwareCheck {
    /// At or above the minimum
    Supported(FirmwareVersion),
    /// Older than the minimum; the connection still proceeds
    BelowMinimum {
        /// Version the load reported
        found: FirmwareVersion,
        /// Oldest accepted version
        minimum: FirmwareVersion,
    },
    /// The load did not report a parseable version
    Unknown {
        /// Raw version line
        reported: String,
    },
}

impl FirmwareCheck {
    /// Compare the reported version string against `minimum`
    pub fn evaluate(reported: &str, minimum: FirmwareVersion) -> Self {
        match FirmwareVersion::parse(reported) {
            Some(found) if found >= minimum => FirmwareCheck::Supported(found),
            Some(found) => FirmwareCheck::BelowMinimum { found, minimum },
            None => FirmwareCheck::Unknown {
                reported: reported.to_string(),
            },
        }
    }

    /// True only for [`FirmwareCheck::Supported`]
    pub fn is_supported(&self) -> bool {
        matches!(self, FirmwareCheck::Supported(_))
    }
}

impl fmt::Display for FirmwareCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirmwareCheck::Supported(v) => write!(f, "firmware {} supported", v),
            FirmwareCheck::BelowMinimum { found, minimum } => write!(
                f,
                "firmware version is lower than minimum required version for this software \
                 (minimum: {}, this load: {})",
                minimum, found
            ),
            FirmwareCheck::Unknown { .. } => f.write_str("the load did not report its firmware version"),
        }
    }
}

/// Limits reported by the load (QDC query)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySnapshot {
    /// Date of the last calibration, as sent
    pub calibration_date: String,
    /// Firmware version line, as sent
    pub firmware_version: String,
    /// Hardware revision
    pub board_revision: String,
    /// Amperes
    pub max_current_source: f64,
    /// Amperes
    pub max_current_measure: f64,
    /// Volts
    pub max_voltage_source: f64,
    /// Volts
    pub max_voltage_measure: f64,
    /// Watts
    pub max_power: f64,
    /// Ohms
    pub voltmeter_input_resistance: f64,
    /// °C
    pub temperature_threshold: i32,
}

impl CapabilitySnapshot {
    /// Highest current setpoint both the DAC and the ammeter can handle
    pub fn max_current_setpoint(&self) -> f64 {
        self.max_current_measure.min(self.max_current_source)
    }

    /// Highest voltage setpoint both the DAC and the voltmeter can handle
    pub fn max_voltage_setpoint(&self) -> f64 {
        self.max_voltage_measure.min(self.max_voltage_source)
    }

    /// Parsed firmware version, if the line is well formed
    pub fn firmware(&self) -> Option<FirmwareVersion> {
        FirmwareVersion::parse(&self.firmware_version)
    }
}

/// Human-readable error messages, indexed by error flag bit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCatalog {
    messages: Vec<String>,
}

impl ErrorCatalog {
    /// Catalog from messages in bit order
    pub fn new(messages: Vec<String>) -> Self {
        Self { messages }
    }

    /// Number of known messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True when the load sent no messages
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Message for error bit `bit`
    pub fn message(&self, bit: usize) -> Option<&str> {
        self.messages.get(bit).map(String::as_str)
    }

    /// Messages of every set bit that the catalog knows about
    pub fn active(&self, flags: u32) -> Vec<&str> {
        self.messages
            .iter()
            .enumerate()
            .filter(|(bit, _)| *bit < 32 && (flags >> bit) & 1 == 1)
            .map(|(_, msg)| msg.as_str())
            .collect()
    }

    /// Render the sticky error register for the operator; empty when nothing is set
    pub fn render(&self, flags: u32) -> String {
        if flags == 0 {
            return String::new();
        }
        let mut out = String::from("Following errors were detected:");
        for msg in self.active(flags) {
            out.push('\n');
            out.push_str(msg);
        }
        out
    }
}

/// Everything learnt about the load during one successful handshake
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    /// Port the load answered on
    pub port_name: String,
    /// Identification line as returned by the load
    pub identification: String,
    /// Negotiated limits
    pub capabilities: CapabilitySnapshot,
    /// Messages for the error flag bits
    pub error_catalog: ErrorCatalog,
}
