use mightywatt_core::device::FirmwareVersion;
use mightywatt_core::protocol::{ConnectionConfig, ProtocolError};
use pretty_assertions::assert_eq;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{
            "baud_rate": 115200,
            "settle_delay_ms": 250,
            "connect_attempts": 5,
            "rts_dtr_enable": true,
            "minimum_firmware": "3.2.0",
            "unknown_key": 42
        }}"#
    )
    .unwrap();

    let config = ConnectionConfig::from_json_file(file.path()).unwrap();
    assert_eq!(
        config,
        ConnectionConfig {
            baud_rate: 115_200,
            settle_delay_ms: 250,
            connect_attempts: 5,
            rts_dtr_enable: true,
            minimum_firmware: FirmwareVersion::new(3, 2, 0),
            ..Default::default()
        }
    );
    assert_eq!(config.load_delay(), Duration::from_millis(900));
}

#[test]
fn test_config_round_trips_through_json() {
    let config = ConnectionConfig::default();
    let json = serde_json::to_string_pretty(&config).unwrap();
    assert!(json.contains("\"minimum_firmware\": \"3.0.0\""));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mightywatt.json");
    std::fs::write(&path, json).unwrap();
    assert_eq!(ConnectionConfig::from_json_file(&path).unwrap(), config);
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = ConnectionConfig::from_json_file(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, ProtocolError::Io(_)));
}

#[test]
fn test_malformed_file_is_config_error() {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{{ \"baud_rate\": \"fast\" }}").unwrap();
    let err = ConnectionConfig::from_json_file(file.path()).unwrap_err();
    assert!(matches!(err, ProtocolError::Config(_)));
}
