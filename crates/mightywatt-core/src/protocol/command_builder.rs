//! Command builder
//!
//! Turns setpoints and configuration values into [`CommandFrame`]s.

use super::commands::{ReadCommand, RunMode, WriteCommand};
use super::{CommandFrame, ProtocolError};

/// Read request for `cmd`
pub fn read(cmd: ReadCommand) -> CommandFrame {
    CommandFrame::read(cmd.id())
}

/// Setpoint frame for a run mode; `value` is in SI units
pub fn setpoint(mode: RunMode, value: f64) -> Result<CommandFrame, ProtocolError> {
    let cmd = mode.write_command();
    match mode.payload_len() {
        0 => CommandFrame::write(cmd.id(), &[]),
        _ => {
            let raw = scale_to_wire(value, mode.wire_scale())?;
            CommandFrame::write(cmd.id(), &raw.to_le_bytes())
        }
    }
}

/// Zero-current setpoint used to hold a stopped load
pub fn zero_current() -> CommandFrame {
    write_u32(WriteCommand::ConstantCurrent, 0)
}

/// Write command with a 1-byte payload
pub fn write_u8(cmd: WriteCommand, payload: u8) -> CommandFrame {
    CommandFrame::write_fixed(cmd.id(), [payload])
}

/// Write command with a 2-byte payload
pub fn write_u16(cmd: WriteCommand, payload: u16) -> CommandFrame {
    CommandFrame::write_fixed(cmd.id(), payload.to_le_bytes())
}

/// Write command with a 4-byte payload
pub fn write_u32(cmd: WriteCommand, payload: u32) -> CommandFrame {
    CommandFrame::write_fixed(cmd.id(), payload.to_le_bytes())
}

/// Series resistance compensation, sent in milliohms
pub fn series_resistance(ohms: f64) -> Result<CommandFrame, ProtocolError> {
    let raw = scale_to_wire(ohms, 1e3)?;
    Ok(write_u32(WriteCommand::SeriesResistance, raw))
}

/// Remote (4-wire) sensing on or off
pub fn four_wire(enabled: bool) -> CommandFrame {
    write_u8(WriteCommand::FourWire, enabled as u8)
}

/// Scale an SI value to the wire integer, rounding to nearest
fn scale_to_wire(value: f64, scale: f64) -> Result<u32, ProtocolError> {
    let scaled = (value * scale).round();
    if !scaled.is_finite() || scaled < 0.0 || scaled > u32::MAX as f64 {
        return Err(ProtocolError::InvalidInput(format!(
            "{} does not fit the wire format",
            value
        )));
    }
    Ok(scaled as u32)
}
