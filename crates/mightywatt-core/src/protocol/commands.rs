//! Protocol commands
//!
//! Command ids understood by the load, and the run modes that map onto them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ProtocolError;

/// Read (query) commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReadCommand {
    /// One binary measurement frame
    Measurement = 1,
    /// Identification line
    Identification = 2,
    /// Device capabilities (QDC)
    Capabilities = 3,
    /// Catalog of error messages
    ErrorMessages = 4,
}

impl ReadCommand {
    /// Command id on the wire
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Look up a read command by id
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(ReadCommand::Measurement),
            2 => Some(ReadCommand::Identification),
            3 => Some(ReadCommand::Capabilities),
            4 => Some(ReadCommand::ErrorMessages),
            _ => None,
        }
    }
}

/// Write (setpoint and configuration) commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum WriteCommand {
    /// Constant current, µA
    ConstantCurrent = 1,
    /// Constant voltage, µV
    ConstantVoltage = 2,
    /// Constant power through the current loop, µW
    ConstantPowerCC = 3,
    /// Constant power through the voltage loop, µW
    ConstantPowerCV = 4,
    /// Constant resistance through the current loop, mΩ
    ConstantResistanceCC = 5,
    /// Constant resistance through the voltage loop, mΩ
    ConstantResistanceCV = 6,
    /// Constant voltage regulated in firmware, µV
    ConstantVoltageSoftware = 7,
    /// Maximum power point tracking, start voltage in µV
    Mppt = 8,
    /// Short the input and measure current; no payload
    SimpleAmmeter = 9,
    /// Lead resistance compensation, mΩ
    SeriesResistance = 10,
    /// Remote (4-wire) sensing on or off
    FourWire = 11,
    /// Measurement averaging
    MeasurementFilter = 12,
    /// Fan control rules
    FanRules = 13,
    /// LED control rules
    LedRules = 14,
    /// LED brightness
    LedBrightness = 15,
    /// Automatic current range selection
    CurrentRangeAuto = 16,
    /// Automatic voltage range selection
    VoltageRangeAuto = 17,
    /// User I/O pin outputs
    UserPins = 18,
}

impl WriteCommand {
    /// Command id on the wire
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Look up a write command by id
    pub fn from_id(id: u8) -> Option<Self> {
        use WriteCommand::*;
        let cmd = match id {
            1 => ConstantCurrent,
            2 => ConstantVoltage,
            3 => ConstantPowerCC,
            4 => ConstantPowerCV,
            5 => ConstantResistanceCC,
            6 => ConstantResistanceCV,
            7 => ConstantVoltageSoftware,
            8 => Mppt,
            9 => SimpleAmmeter,
            10 => SeriesResistance,
            11 => FourWire,
            12 => MeasurementFilter,
            13 => FanRules,
            14 => LedRules,
            15 => LedBrightness,
            16 => CurrentRangeAuto,
            17 => VoltageRangeAuto,
            18 => UserPins,
            _ => return None,
        };
        Some(cmd)
    }
}

/// Setpoint kinds the load can regulate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunMode {
    /// Constant current
    Current,
    /// Constant voltage
    Voltage,
    /// Constant voltage regulated in firmware
    VoltageSoftware,
    /// Maximum power point tracking
    Mppt,
    /// Constant power, current loop
    PowerCC,
    /// Constant power, voltage loop
    PowerCV,
    /// Constant resistance, current loop
    ResistanceCC,
    /// Constant resistance, voltage loop
    ResistanceCV,
    /// Ammeter mode
    SimpleAmmeter,
}

impl RunMode {
    /// Every run mode, in wire-id order of their write commands
    pub const ALL: [RunMode; 9] = [
        RunMode::Current,
        RunMode::Voltage,
        RunMode::PowerCC,
        RunMode::PowerCV,
        RunMode::ResistanceCC,
        RunMode::ResistanceCV,
        RunMode::VoltageSoftware,
        RunMode::Mppt,
        RunMode::SimpleAmmeter,
    ];

    /// Write command that carries this setpoint
    pub fn write_command(self) -> WriteCommand {
        match self {
            RunMode::Current => WriteCommand::ConstantCurrent,
            RunMode::Voltage => WriteCommand::ConstantVoltage,
            RunMode::PowerCC => WriteCommand::ConstantPowerCC,
            RunMode::PowerCV => WriteCommand::ConstantPowerCV,
            RunMode::ResistanceCC => WriteCommand::ConstantResistanceCC,
            RunMode::ResistanceCV => WriteCommand::ConstantResistanceCV,
            RunMode::VoltageSoftware => WriteCommand::ConstantVoltageSoftware,
            RunMode::Mppt => WriteCommand::Mppt,
            RunMode::SimpleAmmeter => WriteCommand::SimpleAmmeter,
        }
    }

    /// Reverse of [`RunMode::write_command`]
    pub fn from_write_command(cmd: WriteCommand) -> Option<Self> {
        RunMode::ALL.into_iter().find(|m| m.write_command() == cmd)
    }

    /// Payload length in bytes (the ammeter mode carries no setpoint)
    pub fn payload_len(self) -> usize {
        match self {
            RunMode::SimpleAmmeter => 0,
            _ => 4,
        }
    }

    /// Multiplier from SI units to the integer sent on the wire
    ///
    /// Resistances travel in milliohms, everything else in micro-units.
    pub fn wire_scale(self) -> f64 {
        match self {
            RunMode::ResistanceCC | RunMode::ResistanceCV => 1e3,
            _ => 1e6,
        }
    }

    /// SI unit symbol of the setpoint
    pub fn unit(self) -> &'static str {
        match self {
            RunMode::Current | RunMode::SimpleAmmeter => "A",
            RunMode::Voltage | RunMode::VoltageSoftware | RunMode::Mppt => "V",
            RunMode::PowerCC | RunMode::PowerCV => "W",
            RunMode::ResistanceCC | RunMode::ResistanceCV => "Ω",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunMode::Current => "current",
            RunMode::Voltage => "voltage",
            RunMode::VoltageSoftware => "voltage (software)",
            RunMode::Mppt => "MPPT",
            RunMode::PowerCC => "power (CC)",
            RunMode::PowerCV => "power (CV)",
            RunMode::ResistanceCC => "resistance (CC)",
            RunMode::ResistanceCV => "resistance (CV)",
            RunMode::SimpleAmmeter => "simple ammeter",
        };
        f.write_str(name)
    }
}

impl FromStr for RunMode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        let mode = match normalized.as_str() {
            "current" | "cc" => RunMode::Current,
            "voltage" | "cv" => RunMode::Voltage,
            "voltagesoftware" => RunMode::VoltageSoftware,
            "mppt" => RunMode::Mppt,
            "powercc" => RunMode::PowerCC,
            "powercv" => RunMode::PowerCV,
            "resistancecc" => RunMode::ResistanceCC,
            "resistancecv" => RunMode::ResistanceCV,
            "simpleammeter" | "ammeter" => RunMode::SimpleAmmeter,
            _ => return Err(ProtocolError::InvalidInput(format!("unknown run mode '{}'", s))),
        };
        Ok(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_every_mode_has_one_command_and_fixed_length() {
        let mut seen = HashSet::new();
        for mode in RunMode::ALL {
            assert!(seen.insert(mode.write_command()), "{mode} shares a command id");
            assert!([0, 1, 2, 4].contains(&mode.payload_len()));
            assert_eq!(RunMode::from_write_command(mode.write_command()), Some(mode));
        }
        assert_eq!(RunMode::SimpleAmmeter.payload_len(), 0);
        assert_eq!(RunMode::Voltage.payload_len(), 4);
    }

    #[test]
    fn test_command_ids_fit_in_five_bits() {
        for id in 0..=31u8 {
            if let Some(cmd) = WriteCommand::from_id(id) {
                assert_eq!(cmd.id(), id);
                assert!(cmd.id() <= 0x1F);
            }
        }
        assert_eq!(ReadCommand::from_id(3), Some(ReadCommand::Capabilities));
        assert_eq!(ReadCommand::from_id(9), None);
    }

    #[test]
    fn test_parse_run_mode() {
        assert_eq!("Power_CC".parse::<RunMode>().ok(), Some(RunMode::PowerCC));
        assert_eq!("resistance cv".parse::<RunMode>().ok(), Some(RunMode::ResistanceCV));
        assert_eq!("MPPT".parse::<RunMode>().ok(), Some(RunMode::Mppt));
        assert!(matches!(
            "frequency".parse::<RunMode>(),
            Err(ProtocolError::InvalidInput(_))
        ));
    }
}
