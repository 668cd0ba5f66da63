//! Outbound command queue
//!
//! Any thread may push; only the polling loop pops.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::protocol::CommandFrame;

/// FIFO of frames waiting for the next tick
#[derive(Debug, Default)]
pub struct CommandQueue {
    frames: Mutex<VecDeque<CommandFrame>>,
}

impl CommandQueue {
    /// An empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame; never blocks on I/O
    pub fn push(&self, frame: CommandFrame) {
        self.lock().push_back(frame);
    }

    /// Take the oldest frame
    ///
    /// The writer pops one frame per write, so a [`CommandQueue::clear`] issued
    /// mid-batch stops everything not yet on the wire.
    pub fn pop_front(&self) -> Option<CommandFrame> {
        self.lock().pop_front()
    }

    /// Discard pending frames, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut frames = self.lock();
        let dropped = frames.len();
        frames.clear();
        dropped
    }

    /// Number of pending frames
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing is pending
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // A panicking producer cannot leave the deque half-written
    pub(crate) fn lock(&self) -> MutexGuard<'_, VecDeque<CommandFrame>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
