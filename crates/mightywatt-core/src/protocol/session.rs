//! Device handshake
//!
//! Identification, capability query, error catalog query and the firmware
//! gate. Runs once per connect on the caller's thread, before the polling
//! loop owns the link.

use tracing::{debug, info, warn};

use super::command_builder;
use super::{ConnectionConfig, Connector, Link, LinkError, ProtocolError, ReadCommand};
use crate::device::{CapabilitySnapshot, DeviceInfo, ErrorCatalog, FirmwareCheck};

/// Result of a successful handshake; the link is open and flushed
pub struct Handshake {
    /// Open line, handed over to the poller
    pub link: Box<dyn Link>,
    /// What the load reported
    pub info: DeviceInfo,
    /// Firmware compatibility verdict
    pub firmware: FirmwareCheck,
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("link", &self.link.name())
            .field("info", &self.info)
            .field("firmware", &self.firmware)
            .finish()
    }
}

/// Open the port and identify the load, retrying up to `attempts` times
///
/// Each failed identification closes the port before the next attempt. A port
/// that cannot be opened at all fails immediately.
pub fn handshake(
    connector: &dyn Connector,
    port_name: &str,
    rts_dtr_enable: bool,
    attempts: u32,
    config: &ConnectionConfig,
) -> Result<Handshake, ProtocolError> {
    for attempt in 1..=attempts {
        let mut link = connector.open(port_name, rts_dtr_enable, config)?;

        let Some(identification) = identify(link.as_mut(), &config.identification) else {
            debug!(port = port_name, attempt, "identification mismatch");
            close_quietly(link.as_mut());
            continue;
        };
        info!(port = port_name, attempt, %identification, "load identified");

        match negotiate(link.as_mut()) {
            Ok((capabilities, error_catalog)) => {
                let firmware =
                    FirmwareCheck::evaluate(&capabilities.firmware_version, config.minimum_firmware);
                if !firmware.is_supported() {
                    warn!(port = port_name, %firmware, "firmware check failed");
                }
                let info = DeviceInfo {
                    port_name: port_name.to_string(),
                    identification,
                    capabilities,
                    error_catalog,
                };
                return Ok(Handshake {
                    link,
                    info,
                    firmware,
                });
            }
            Err(e) => {
                close_quietly(link.as_mut());
                return Err(e);
            }
        }
    }

    Err(ProtocolError::DeviceMismatch { attempts })
}

/// Ask for the identification line; `None` on any failure or a foreign device
pub fn identify(link: &mut dyn Link, expected: &str) -> Option<String> {
    let result = link
        .write_all(&command_builder::read(ReadCommand::Identification).to_bytes())
        .and_then(|_| link.read_line());
    match result {
        Ok(line) if line.contains(expected) => Some(line),
        Ok(line) => {
            debug!(response = %line, "unexpected identification");
            None
        }
        Err(e) => {
            debug!(error = %e, "identification failed");
            None
        }
    }
}

fn negotiate(link: &mut dyn Link) -> Result<(CapabilitySnapshot, ErrorCatalog), ProtocolError> {
    let capabilities = query_capabilities(link)?;
    let catalog = query_error_catalog(link)?;
    Ok((capabilities, catalog))
}

/// Query device capabilities (QDC)
///
/// Limits arrive as integers in micro-units; the voltmeter input resistance
/// arrives in milliohms.
pub fn query_capabilities(link: &mut dyn Link) -> Result<CapabilitySnapshot, ProtocolError> {
    link.write_all(&command_builder::read(ReadCommand::Capabilities).to_bytes())?;

    let calibration_date = link.read_line()?;
    let firmware_version = link.read_line()?;
    let board_revision = link.read_line()?;
    let max_current_source = read_number(link, "max current source")? / 1e6;
    let max_current_measure = read_number(link, "max current measure")? / 1e6;
    let max_voltage_source = read_number(link, "max voltage source")? / 1e6;
    let max_voltage_measure = read_number(link, "max voltage measure")? / 1e6;
    let max_power = read_number(link, "max power")? / 1e6;
    let voltmeter_input_resistance = read_number(link, "voltmeter input resistance")? / 1e3;
    let line = link.read_line()?;
    let temperature_threshold = line.trim().parse::<i32>().map_err(|_| {
        ProtocolError::MalformedResponse(format!("temperature threshold '{}'", line))
    })?;

    Ok(CapabilitySnapshot {
        calibration_date,
        firmware_version,
        board_revision,
        max_current_source,
        max_current_measure,
        max_voltage_source,
        max_voltage_measure,
        max_power,
        voltmeter_input_resistance,
        temperature_threshold,
    })
}

/// Query the error message catalog: one count byte, then that many lines
pub fn query_error_catalog(link: &mut dyn Link) -> Result<ErrorCatalog, ProtocolError> {
    link.write_all(&command_builder::read(ReadCommand::ErrorMessages).to_bytes())?;
    let count = link.read_byte()?;
    let messages = (0..count)
        .map(|_| link.read_line())
        .collect::<Result<Vec<_>, LinkError>>()?;
    Ok(ErrorCatalog::new(messages))
}

fn read_number(link: &mut dyn Link, field: &str) -> Result<f64, ProtocolError> {
    let line = link.read_line()?;
    line.trim()
        .parse::<f64>()
        .map_err(|_| ProtocolError::MalformedResponse(format!("{} '{}'", field, line)))
}

fn close_quietly(link: &mut dyn Link) {
    if let Err(e) = link.close() {
        debug!(port = link.name(), error = %e, "close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::stream::testing::ScriptedLink;
    use pretty_assertions::assert_eq;

    const QDC: &[u8] = b"2024-01-15\n3.1.0\nR3.1\n10000000\n9500000\n30000000\n32000000\n75000000\n300000000\n110\n";

    #[test]
    fn test_query_capabilities_scales_fields() {
        let mut link = ScriptedLink::default();
        link.push_inbound(QDC);
        let caps = query_capabilities(&mut link).expect("caps");
        assert_eq!(
            caps,
            CapabilitySnapshot {
                calibration_date: "2024-01-15".into(),
                firmware_version: "3.1.0".into(),
                board_revision: "R3.1".into(),
                max_current_source: 10.0,
                max_current_measure: 9.5,
                max_voltage_source: 30.0,
                max_voltage_measure: 32.0,
                max_power: 75.0,
                voltmeter_input_resistance: 300_000.0,
                temperature_threshold: 110,
            }
        );
        // QDC read request went out
        assert_eq!(link.written(), vec![vec![0x03, 0x63, 0x30]]);
    }

    #[test]
    fn test_query_capabilities_rejects_garbage() {
        let mut link = ScriptedLink::default();
        link.push_inbound(b"2024\n3.0.0\nR3\nlots\n");
        assert!(matches!(
            query_capabilities(&mut link),
            Err(ProtocolError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_query_error_catalog() {
        let mut link = ScriptedLink::default();
        link.push_inbound(&[2]);
        link.push_inbound(b"ADC error\r\nOvertemperature\n");
        let catalog = query_error_catalog(&mut link).expect("catalog");
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.message(1), Some("Overtemperature"));
    }

    #[test]
    fn test_identify_accepts_substring() {
        let mut link = ScriptedLink::default();
        link.push_inbound(b"MightyWatt R3 Rev.1\n");
        assert_eq!(
            identify(&mut link, "MightyWatt R3").as_deref(),
            Some("MightyWatt R3 Rev.1")
        );

        link.push_inbound(b"Arduino Uno\n");
        assert_eq!(identify(&mut link, "MightyWatt R3"), None);

        // Silence is a mismatch, not an error
        assert_eq!(identify(&mut link, "MightyWatt R3"), None);
    }

    /// A foreign device that streams bytes and never ends a line
    struct Chatter;

    impl Link for Chatter {
        fn name(&self) -> &str {
            "chatter"
        }

        fn write_all(&mut self, _bytes: &[u8]) -> Result<(), LinkError> {
            Ok(())
        }

        fn read_available(&mut self, len: usize) -> Result<Vec<u8>, LinkError> {
            Ok(vec![b'x'; len])
        }

        fn discard_input(&mut self) -> Result<(), LinkError> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), LinkError> {
            Ok(())
        }
    }

    struct ChatterConnector;

    impl Connector for ChatterConnector {
        fn open(
            &self,
            _port_name: &str,
            _rts_dtr_enable: bool,
            _config: &ConnectionConfig,
        ) -> Result<Box<dyn Link>, LinkError> {
            Ok(Box::new(Chatter))
        }
    }

    #[test]
    fn test_identify_gives_up_on_endless_chatter() {
        assert_eq!(identify(&mut Chatter, "MightyWatt R3"), None);
    }

    #[test]
    fn test_endless_chatter_uses_up_attempts() {
        let err = handshake(&ChatterConnector, "chatter", false, 2, &ConnectionConfig::default())
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DeviceMismatch { attempts: 2 }));
    }
}
