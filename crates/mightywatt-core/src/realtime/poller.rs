//! Polling loop
//!
//! One dedicated thread owns the link for the lifetime of a connection. Each
//! tick optionally forces zero current, requests a measurement, flushes the
//! command queue and reads one measurement frame.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::{LoadEvent, Shared};
use crate::protocol::{FrameError, Link, LinkError, MeasurementFrame, MEASUREMENT_FRAME_LEN};

const POLLER_THREAD_NAME: &str = "mightywatt-poller";
const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Lifecycle of the polling thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerState {
    /// Never started
    Idle,
    /// Ticking
    Running,
    /// Cancellation requested, waiting for the current tick to finish
    Stopping,
    /// Exited; the link is closed
    Stopped(StopReason),
}

/// Why the polling thread exited
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Cooperative cancellation from `disconnect`
    Cancelled,
    /// Write timeout or I/O failure on the link
    LinkLost(String),
    /// Anything else; treated like link loss
    Fault(String),
}

impl StopReason {
    /// True unless the loop was cancelled on request
    pub fn is_fatal(&self) -> bool {
        !matches!(self, StopReason::Cancelled)
    }
}

/// Result of one tick that did not end the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    Updated,
    /// Nothing arrived within the read timeout
    NoData,
    /// Short or corrupt frame; input was flushed
    Dropped,
}

/// Frames written and measurements decoded, logged once per interval
struct Throughput {
    since: Instant,
    reads: u32,
    writes: u32,
}

impl Throughput {
    fn new() -> Self {
        Self {
            since: Instant::now(),
            reads: 0,
            writes: 0,
        }
    }

    fn maybe_log(&mut self, port: &str, crc_failures: u64) {
        let elapsed = self.since.elapsed();
        if elapsed < STATS_INTERVAL {
            return;
        }
        let secs = elapsed.as_secs_f64();
        debug!(
            port,
            reads_per_sec = self.reads as f64 / secs,
            writes_per_sec = self.writes as f64 / secs,
            crc_failures,
            "link throughput"
        );
        *self = Self::new();
    }
}

/// Run one tick against `link`
#[cfg(test)]
pub(crate) fn tick(link: &mut dyn Link, shared: &Shared) -> Result<TickOutcome, LinkError> {
    let mut stats = Throughput::new();
    tick_counted(link, shared, &mut stats)
}

fn tick_counted(
    link: &mut dyn Link,
    shared: &Shared,
    stats: &mut Throughput,
) -> Result<TickOutcome, LinkError> {
    shared.queue_tick_frames();

    // One frame at a time: an immediate stop empties the queue mid-batch
    while let Some(frame) = shared.queue.pop_front() {
        link.write_all(&frame.to_bytes())?;
        stats.writes += 1;
    }

    let data = link.read_available(MEASUREMENT_FRAME_LEN)?;
    if data.is_empty() {
        return Ok(TickOutcome::NoData);
    }

    match MeasurementFrame::from_bytes(&data) {
        Ok(frame) => {
            shared.apply_measurement(&frame);
            stats.reads += 1;
            Ok(TickOutcome::Updated)
        }
        Err(e) => {
            let failures = shared.record_crc_failure();
            match &e {
                FrameError::CrcMismatch { .. } => debug!(error = %e, failures, "CRC check failed"),
                FrameError::WrongLength { .. } => debug!(error = %e, failures, "incomplete frame"),
            }
            link.discard_input()?;
            Ok(TickOutcome::Dropped)
        }
    }
}

/// Loop until cancelled or a fatal error; owns and finally closes the link
pub(crate) fn run(mut link: Box<dyn Link>, shared: Arc<Shared>) -> StopReason {
    let port = link.name().to_string();
    let mut stats = Throughput::new();
    info!(port = %port, "polling started");

    let reason = loop {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            tick_counted(link.as_mut(), &shared, &mut stats)
        }));
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => break StopReason::LinkLost(e.to_string()),
            Err(payload) => break StopReason::Fault(panic_message(payload.as_ref())),
        }

        stats.maybe_log(&port, shared.crc_failures());

        if shared.cancel_requested() {
            break StopReason::Cancelled;
        }
    };

    if let Err(e) = link.close() {
        warn!(port = %port, error = %e, "close failed");
    }
    shared.set_poller_state(PollerState::Stopped(reason.clone()));

    match &reason {
        StopReason::Cancelled => info!(port = %port, "polling stopped"),
        StopReason::LinkLost(msg) => {
            error!(port = %port, error = %msg, "link lost, reconnect the load");
            shared.publish(LoadEvent::LinkLost(msg.clone()));
            shared.teardown();
        }
        StopReason::Fault(msg) => {
            error!(port = %port, error = %msg, "polling loop fault");
            shared.publish(LoadEvent::LoopFault(msg.clone()));
            shared.teardown();
        }
    }
    reason
}

/// Start the polling thread
pub(crate) fn spawn(
    link: Box<dyn Link>,
    shared: Arc<Shared>,
) -> std::io::Result<JoinHandle<StopReason>> {
    std::thread::Builder::new()
        .name(POLLER_THREAD_NAME.to_string())
        .spawn(move || run(link, shared))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CapabilitySnapshot, DeviceInfo, ErrorCatalog};
    use crate::protocol::stream::testing::ScriptedLink;
    use crate::protocol::{
        command_builder, CommandFrame, ConnectionState, Direction, ReadCommand, RunMode,
        WriteCommand,
    };
    use pretty_assertions::assert_eq;
    use std::thread;

    /// Scripted link that runs a hook right after its first write
    struct HookedLink {
        inner: ScriptedLink,
        after_first_write: Option<Box<dyn FnOnce() + Send>>,
    }

    impl Link for HookedLink {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
            self.inner.write_all(bytes)?;
            if let Some(hook) = self.after_first_write.take() {
                hook();
            }
            Ok(())
        }

        fn read_available(&mut self, len: usize) -> Result<Vec<u8>, LinkError> {
            self.inner.read_available(len)
        }

        fn discard_input(&mut self) -> Result<(), LinkError> {
            self.inner.discard_input()
        }

        fn close(&mut self) -> Result<(), LinkError> {
            self.inner.close()
        }
    }

    /// Accepts writes, then panics on the first read
    struct PanickingLink {
        inner: ScriptedLink,
    }

    impl Link for PanickingLink {
        fn name(&self) -> &str {
            "panicking"
        }

        fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
            self.inner.write_all(bytes)
        }

        fn read_available(&mut self, _len: usize) -> Result<Vec<u8>, LinkError> {
            panic!("boom")
        }

        fn discard_input(&mut self) -> Result<(), LinkError> {
            self.inner.discard_input()
        }

        fn close(&mut self) -> Result<(), LinkError> {
            self.inner.close()
        }
    }

    fn write_frames(link: &ScriptedLink) -> Vec<CommandFrame> {
        link.written()
            .iter()
            .map(|b| CommandFrame::from_bytes(b).unwrap())
            .filter(|f| f.direction() == Direction::Write)
            .collect()
    }

    fn connected_shared() -> Shared {
        let shared = Shared::new();
        shared.begin_session(Arc::new(DeviceInfo {
            port_name: "scripted".into(),
            identification: "MightyWatt R3".into(),
            capabilities: CapabilitySnapshot::default(),
            error_catalog: ErrorCatalog::default(),
        }));
        shared
    }

    fn frame_with_errors(error_flags: u32) -> [u8; MEASUREMENT_FRAME_LEN] {
        MeasurementFrame {
            current_ua: 1_000_000,
            voltage_uv: 5_000_000,
            temperature: 30,
            error_flags,
            ..Default::default()
        }
        .to_bytes()
    }

    #[test]
    fn test_tick_order_when_stopped() {
        let shared = connected_shared();
        shared.queue.push(command_builder::write_u8(WriteCommand::LedBrightness, 7));
        let mut link = ScriptedLink::default();
        link.push_inbound(&frame_with_errors(0));

        assert_eq!(tick(&mut link, &shared).unwrap(), TickOutcome::Updated);

        let written: Vec<CommandFrame> = link
            .written()
            .iter()
            .map(|b| CommandFrame::from_bytes(b).unwrap())
            .collect();
        assert_eq!(written.len(), 3);
        // Pending setpoint, then forced zero current, then the measurement request
        assert_eq!(written[0].command_id(), WriteCommand::LedBrightness.id());
        assert_eq!(written[1], command_builder::zero_current());
        assert_eq!(written[2].direction(), Direction::Read);
        assert_eq!(written[2].command_id(), ReadCommand::Measurement.id());

        let snap = shared.snapshot();
        assert_eq!(snap.current, 1.0);
        assert_eq!(snap.voltage, 5.0);
        assert_eq!(snap.temperature, 30.0);
    }

    #[test]
    fn test_running_tick_sends_only_read() {
        let shared = connected_shared();
        shared.set_stopped(false);
        let mut link = ScriptedLink::default();
        assert_eq!(tick(&mut link, &shared).unwrap(), TickOutcome::NoData);
        assert_eq!(link.written(), vec![vec![0x01, 0x21, 0x10]]);
    }

    #[test]
    fn test_immediate_stop_discards_queue() {
        let shared = connected_shared();
        shared.set_stopped(false);
        for value in [1.0, 1.5, 2.0, 2.5] {
            shared
                .queue
                .push(command_builder::setpoint(RunMode::Current, value).unwrap());
        }
        assert_eq!(shared.queue.len(), 4);

        shared.immediate_stop();
        assert_eq!(shared.queue.len(), 0);

        let mut link = ScriptedLink::default();
        tick(&mut link, &shared).unwrap();
        let first_write = link
            .written()
            .iter()
            .map(|b| CommandFrame::from_bytes(b).unwrap())
            .find(|f| f.direction() == Direction::Write)
            .unwrap();
        assert_eq!(first_write, command_builder::zero_current());
    }

    #[test]
    fn test_errors_accumulate_across_ticks() {
        let shared = connected_shared();
        let mut link = ScriptedLink::default();
        // Bits 4 and 5 both survive the mask
        link.push_inbound(&frame_with_errors(1 << 4));
        tick(&mut link, &shared).unwrap();
        link.push_inbound(&frame_with_errors(1 << 5));
        tick(&mut link, &shared).unwrap();
        assert_eq!(shared.errors.get(), 0b11_0000);
        assert_eq!(shared.snapshot().error_flags, 0b11_0000);

        shared.clear_errors();
        assert_eq!(shared.errors.get(), 0);

        link.push_inbound(&frame_with_errors(1 << 4));
        tick(&mut link, &shared).unwrap();
        assert_eq!(shared.errors.get(), 1 << 4);
    }

    #[test]
    fn test_corrupt_frame_is_dropped_and_flushed() {
        let shared = connected_shared();
        let mut link = ScriptedLink::default();
        let mut bad = frame_with_errors(0);
        bad[3] ^= 0x01;
        link.push_inbound(&bad);

        assert_eq!(tick(&mut link, &shared).unwrap(), TickOutcome::Dropped);
        assert_eq!(shared.crc_failures(), 1);
        assert_eq!(link.state.lock().unwrap().discards, 1);
        assert_eq!(shared.snapshot().current, 0.0);
    }

    #[test]
    fn test_write_failure_ends_loop_with_teardown() {
        let shared = Arc::new(connected_shared());
        let mut events = shared.subscribe();
        let link = ScriptedLink::default();
        link.state.lock().unwrap().fail_writes = true;

        let reason = run(Box::new(link.clone()), Arc::clone(&shared));
        assert!(matches!(reason, StopReason::LinkLost(_)));
        assert!(link.state.lock().unwrap().closed);
        assert_eq!(shared.state(), ConnectionState::Disconnected);
        assert!(shared.device().is_none());
        assert!(matches!(events.try_recv(), Ok(LoadEvent::LinkLost(_))));
        assert!(matches!(events.try_recv(), Ok(LoadEvent::Disconnected)));
    }

    #[test]
    fn test_cancel_exits_cleanly() {
        let shared = Arc::new(connected_shared());
        shared.request_cancel();
        assert_eq!(shared.poller_state(), PollerState::Stopping);

        let link = ScriptedLink::default();
        let reason = run(Box::new(link.clone()), Arc::clone(&shared));
        assert_eq!(reason, StopReason::Cancelled);
        assert_eq!(shared.poller_state(), PollerState::Stopped(StopReason::Cancelled));
        // The caller tears down after join
        assert_eq!(shared.state(), ConnectionState::Connected);
        assert!(link.state.lock().unwrap().closed);
    }

    #[test]
    fn test_immediate_stop_mid_batch_drops_the_rest() {
        let shared = Arc::new(connected_shared());
        shared.set_stopped(false);
        for amps in [1.0, 2.0, 3.0] {
            shared.submit(command_builder::setpoint(RunMode::Current, amps).unwrap(), true);
        }

        let scripted = ScriptedLink::default();
        let stopper = Arc::clone(&shared);
        let mut link = HookedLink {
            inner: scripted.clone(),
            after_first_write: Some(Box::new(move || stopper.immediate_stop())),
        };

        // The measurement request was discarded along with the setpoints
        assert_eq!(tick(&mut link, &shared).unwrap(), TickOutcome::NoData);
        tick(&mut link, &shared).unwrap();

        let payloads: Vec<u32> = write_frames(&scripted)
            .iter()
            .map(|f| f.payload_value())
            .collect();
        assert_eq!(payloads, vec![1_000_000, 0]);
    }

    #[test]
    fn test_release_never_lands_behind_zero_frame() {
        for _ in 0..200 {
            let shared = Arc::new(connected_shared());
            let mut link = ScriptedLink::default();

            let setter = {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    shared.submit(command_builder::setpoint(RunMode::Current, 1.0).unwrap(), true)
                })
            };
            tick(&mut link, &shared).unwrap();
            setter.join().unwrap();
            tick(&mut link, &shared).unwrap();

            let last = write_frames(&link).pop().unwrap();
            assert_eq!(last.payload_value(), 1_000_000);
        }
    }

    #[test]
    fn test_cleared_errors_never_linger_in_snapshot() {
        let shared = Arc::new(connected_shared());
        let frame = MeasurementFrame {
            error_flags: 1 << 4,
            ..Default::default()
        };

        let clearer = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                for _ in 0..500 {
                    shared.clear_errors();
                }
            })
        };
        for _ in 0..500 {
            shared.apply_measurement(&frame);
        }
        clearer.join().unwrap();

        assert_eq!(shared.snapshot().error_flags, shared.errors.get());
    }

    #[test]
    fn test_panicking_tick_forces_disconnect() {
        let shared = Arc::new(connected_shared());
        let mut events = shared.subscribe();
        let scripted = ScriptedLink::default();

        let reason = run(
            Box::new(PanickingLink {
                inner: scripted.clone(),
            }),
            Arc::clone(&shared),
        );
        assert_eq!(reason, StopReason::Fault("boom".to_string()));
        assert_eq!(
            shared.poller_state(),
            PollerState::Stopped(StopReason::Fault("boom".to_string()))
        );
        assert_eq!(shared.state(), ConnectionState::Disconnected);
        assert!(shared.device().is_none());
        assert!(scripted.state.lock().unwrap().closed);

        assert!(matches!(events.try_recv(), Ok(LoadEvent::LoopFault(msg)) if msg == "boom"));
        assert!(matches!(events.try_recv(), Ok(LoadEvent::Disconnected)));
        assert!(matches!(
            events.try_recv(),
            Ok(LoadEvent::DataUpdated(s)) if s == crate::realtime::MeasurementSnapshot::default()
        ));
    }
}
