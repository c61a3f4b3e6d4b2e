//! Bounded outgoing frame queue

use std::collections::VecDeque;

use parking_lot::Mutex;
use vbs_core::Frame;

/// Default number of frames a queue holds before dropping
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Thread-safe FIFO of frames awaiting transmission
///
/// Any thread may enqueue; the bus write worker is the only consumer.
/// Enqueueing never blocks: once full, incoming frames are dropped so the
/// queue keeps the oldest frames.
#[derive(Debug)]
pub struct FrameQueue {
    capacity: usize,
    frames: Mutex<VecDeque<Frame>>,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append a frame; returns false when the queue was full and the frame dropped
    pub fn enqueue(&self, frame: Frame) -> bool {
        let mut frames = self.frames.lock();
        if frames.len() >= self.capacity {
            tracing::debug!(%frame, capacity = self.capacity, "Outgoing queue full, dropping frame");
            return false;
        }
        frames.push_back(frame);
        true
    }

    pub fn pop(&self) -> Option<Frame> {
        self.frames.lock().pop_front()
    }

    pub fn clear(&self) {
        self.frames.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
