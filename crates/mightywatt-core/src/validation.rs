//! Setpoint validation
//!
//! Checks a (mode, value) pair against the negotiated capability snapshot
//! before anything is queued for the load.

use crate::device::CapabilitySnapshot;
use crate::protocol::{ProtocolError, RunMode};

/// Validate a setpoint
///
/// With no capability snapshot (no device connected) every value passes.
/// Power setpoints are not limited here; the load enforces its own power limit.
pub fn validate(
    mode: RunMode,
    value: f64,
    capabilities: Option<&CapabilitySnapshot>,
) -> Result<(), ProtocolError> {
    let Some(caps) = capabilities else {
        return Ok(());
    };

    if mode != RunMode::SimpleAmmeter && !value.is_finite() {
        return Err(ProtocolError::InvalidInput(format!(
            "{} setpoint must be a finite number",
            mode
        )));
    }

    let max = match mode {
        RunMode::Current => caps.max_current_setpoint(),
        RunMode::PowerCC | RunMode::PowerCV => return Ok(()),
        RunMode::ResistanceCC | RunMode::ResistanceCV => caps.voltmeter_input_resistance,
        RunMode::Voltage | RunMode::Mppt => caps.max_voltage_setpoint(),
        RunMode::VoltageSoftware => caps.max_voltage_measure,
        RunMode::SimpleAmmeter => return Ok(()),
    };

    check_range(mode, value, max)
}

fn check_range(mode: RunMode, value: f64, max: f64) -> Result<(), ProtocolError> {
    if value < 0.0 || value > max {
        return Err(ProtocolError::OutOfRange { mode, value, max });
    }
    Ok(())
}
