//! Connect to a load, ramp the current and print readings
//!
//! ```text
//! cargo run --example monitor -- /dev/ttyACM0
//! cargo run --example monitor            # simulated load
//! RUST_LOG=mightywatt_core=debug cargo run --example monitor
//! ```

use anyhow::Context;
use mightywatt_core::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::var("MIGHTYWATT_CONFIG") {
        Ok(path) => ConnectionConfig::from_json_file(&path)
            .with_context(|| format!("loading {}", path))?,
        Err(_) => ConnectionConfig::default(),
    };

    let port = std::env::args().nth(1);
    let conn = match &port {
        Some(_) => Connection::new(config),
        None => {
            let demo = DemoConnector::new(Arc::new(DemoLoad::default()));
            Connection::with_connector(ConnectionConfig { settle_delay_ms: 0, ..config }, Arc::new(demo))
        }
    };
    let mut events = conn.subscribe();

    let device = conn
        .connect(port.as_deref().unwrap_or("demo"))
        .context("connecting to load")?;
    let caps = &device.capabilities;
    println!(
        "{} on {} (firmware {}, board {})",
        device.identification, device.port_name, caps.firmware_version, caps.board_revision
    );
    println!(
        "limits: {:.3} A, {:.3} V, {:.1} W",
        caps.max_current_setpoint(),
        caps.max_voltage_setpoint(),
        caps.max_power
    );

    for step in 0..=4 {
        let amps = caps.max_current_setpoint() * step as f64 / 20.0;
        conn.set(RunMode::Current, amps)?;
        std::thread::sleep(conn.config().load_delay().max(Duration::from_millis(200)));

        let snap = conn.snapshot();
        println!(
            "set {:>6.3} A -> {:>6.3} A {:>7.3} V {:>7.3} W {:>3.0} °C{}",
            amps,
            snap.current,
            snap.voltage,
            snap.power(),
            snap.temperature,
            if snap.remote { " (remote)" } else { "" }
        );

        loop {
            match events.try_recv() {
                Ok(LoadEvent::FirmwareWarning(check)) => println!("warning: {}", check),
                Ok(LoadEvent::LinkLost(msg)) => anyhow::bail!("link lost: {}", msg),
                Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                Err(_) => break,
            }
        }
    }

    conn.stop();
    std::thread::sleep(conn.config().load_delay());

    let errors = conn.error_list();
    if !errors.is_empty() {
        println!("{}", errors);
    }
    println!("dropped frames: {}", conn.crc_failures());

    conn.disconnect();
    Ok(())
}
