//! # MightyWatt Core Library
//!
//! Host-side protocol engine for the MightyWatt R3 programmable electronic load.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - CRC-16 framed binary commands and measurement decoding
//! - Connection handshake: identification, capabilities, error catalog
//! - A polling thread with a thread-safe command queue
//! - Setpoint validation against the negotiated device limits
//! - A sticky device error register and published measurement snapshots
//! - A simulated load for running without hardware
//!
//! ## Example
//!
//! ```rust,no_run
//! use mightywatt_core::prelude::*;
//!
//! let conn = Connection::new(ConnectionConfig::default());
//! let device = conn.connect("/dev/ttyACM0")?;
//! println!("connected to {}", device.identification);
//!
//! conn.set(RunMode::Current, 1.5)?;
//! std::thread::sleep(conn.config().load_delay());
//! println!("{:.3} V", conn.get_value(RunMode::Voltage));
//!
//! conn.stop();
//! conn.disconnect();
//! # Ok::<(), mightywatt_core::protocol::ProtocolError>(())
//! ```

pub mod demo;
pub mod device;
pub mod protocol;
pub mod realtime;
pub mod validation;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::demo::{DemoConnector, DemoLoad};
    pub use crate::device::{CapabilitySnapshot, DeviceInfo, ErrorCatalog, FirmwareCheck, FirmwareVersion};
    pub use crate::protocol::{
        Connection, ConnectionConfig, ConnectionState, ProtocolError, RunMode, WriteCommand,
    };
    pub use crate::realtime::{LoadEvent, MeasurementSnapshot, PollerState, StopReason};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
