//! Realtime polling
//!
//! State shared between the caller-facing [`crate::protocol::Connection`] and
//! the polling thread: the command queue, the stop and cancel flags, the sticky
//! error register and the published measurement snapshot.

mod poller;
mod queue;
mod snapshot;

pub use poller::{PollerState, StopReason};
pub use queue::CommandQueue;
pub use snapshot::{ErrorRegister, LoadEvent, MeasurementSnapshot};

pub(crate) use poller::spawn;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::device::DeviceInfo;
use crate::protocol::{command_builder, CommandFrame, ConnectionState, MeasurementFrame, ReadCommand};

/// Capacity of the event channel; slow subscribers see `Lagged`
pub const EVENT_CAPACITY: usize = 256;

pub(crate) struct Shared {
    pub queue: CommandQueue,
    pub errors: ErrorRegister,
    stopped: AtomicBool,
    cancel: AtomicBool,
    crc_failures: AtomicU64,
    snapshot: watch::Sender<MeasurementSnapshot>,
    events: broadcast::Sender<LoadEvent>,
    device: RwLock<Option<Arc<DeviceInfo>>>,
    state: Mutex<ConnectionState>,
    poller: Mutex<PollerState>,
}

impl Shared {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(MeasurementSnapshot::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            queue: CommandQueue::new(),
            errors: ErrorRegister::new(),
            stopped: AtomicBool::new(true),
            cancel: AtomicBool::new(false),
            crc_failures: AtomicU64::new(0),
            snapshot,
            events,
            device: RwLock::new(None),
            state: Mutex::new(ConnectionState::Disconnected),
            poller: Mutex::new(PollerState::Idle),
        }
    }

    pub fn publish(&self, event: LoadEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoadEvent> {
        self.events.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<MeasurementSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> MeasurementSnapshot {
        *self.snapshot.borrow()
    }

    pub fn update_snapshot(&self, f: impl FnOnce(&mut MeasurementSnapshot)) {
        self.snapshot.send_modify(f);
    }

    /// Fold a decoded frame into the register and snapshot, then notify
    ///
    /// The register and the snapshot change under the snapshot's write lock,
    /// so a concurrent clear never leaves them disagreeing.
    pub fn apply_measurement(&self, frame: &MeasurementFrame) {
        let mut published = MeasurementSnapshot::default();
        self.snapshot.send_modify(|s| {
            let flags = self.errors.merge(frame.reported_errors());
            s.apply(frame, flags);
            published = *s;
        });
        self.publish(LoadEvent::DataUpdated(published));
    }

    pub fn clear_errors(&self) {
        self.snapshot.send_modify(|s| {
            self.errors.clear();
            s.error_flags = 0;
        });
    }

    pub fn device(&self) -> Option<Arc<DeviceInfo>> {
        self.device
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_device(&self, info: Option<Arc<DeviceInfo>>) {
        *self.device.write().unwrap_or_else(PoisonError::into_inner) = info;
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    pub fn poller_state(&self) -> PollerState {
        lock(&self.poller).clone()
    }

    pub fn set_poller_state(&self, state: PollerState) {
        *lock(&self.poller) = state;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn set_stopped(&self, stopped: bool) {
        self.stopped.store(stopped, Ordering::Release);
    }

    /// Hold the load at zero current from the next tick on, after pending frames
    pub fn stop(&self) {
        self.set_stopped(true);
    }

    /// Drop undelivered frames, then stop
    pub fn immediate_stop(&self) {
        let dropped = {
            let mut frames = self.queue.lock();
            let dropped = frames.len();
            frames.clear();
            self.set_stopped(true);
            dropped
        };
        if dropped > 0 {
            debug!(dropped, "discarded pending commands");
        }
    }

    /// Queue a frame from the caller side, optionally releasing a stop
    ///
    /// The flag changes under the queue lock so the poller never slips a
    /// zero-current frame behind a setpoint that released it.
    pub fn submit(&self, frame: CommandFrame, release_stop: bool) {
        let mut frames = self.queue.lock();
        if release_stop {
            self.set_stopped(false);
        }
        frames.push_back(frame);
    }

    /// Queue the frames every tick sends: zero current while stopped, then
    /// the measurement request
    pub fn queue_tick_frames(&self) {
        let mut frames = self.queue.lock();
        if self.is_stopped() {
            frames.push_back(command_builder::zero_current());
        }
        frames.push_back(command_builder::read(ReadCommand::Measurement));
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Release);
        let mut poller = lock(&self.poller);
        if *poller == PollerState::Running {
            *poller = PollerState::Stopping;
        }
    }

    pub fn crc_failures(&self) -> u64 {
        self.crc_failures.load(Ordering::Relaxed)
    }

    pub fn record_crc_failure(&self) -> u64 {
        self.crc_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Reset per-connection state before the poller starts
    pub fn begin_session(&self, info: Arc<DeviceInfo>) {
        self.queue.clear();
        self.errors.clear();
        self.crc_failures.store(0, Ordering::Relaxed);
        self.cancel.store(false, Ordering::Release);
        self.set_stopped(true);
        self.snapshot.send_replace(MeasurementSnapshot::default());
        self.set_device(Some(info));
        self.set_poller_state(PollerState::Running);
        self.set_state(ConnectionState::Connected);
    }

    /// Forget the device and zero every reading
    ///
    /// Notifies subscribers only when a live connection actually ended, so a
    /// second call (loop teardown followed by caller disconnect) is silent.
    pub fn teardown(&self) -> bool {
        let previous = std::mem::replace(&mut *lock(&self.state), ConnectionState::Disconnected);

        self.queue.clear();
        self.errors.clear();
        self.set_device(None);
        self.snapshot.send_replace(MeasurementSnapshot::default());

        if previous != ConnectionState::Connected {
            return false;
        }
        info!("disconnected");
        self.publish(LoadEvent::Disconnected);
        self.publish(LoadEvent::DataUpdated(MeasurementSnapshot::default()));
        true
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
