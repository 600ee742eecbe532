//! In-flight tracking and channel pausing

use crate::config::DEFAULT_PAUSE_THRESHOLD;
use crate::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Something whose deliveries can be paused.
pub trait Pausable: Send + Sync {
    fn can_pause(&self) -> bool;

    fn is_paused(&self) -> bool;

    fn set_paused(&self, paused: bool) -> Result<()>;
}

/// Counts messages between receipt and the end of their dispatch.
///
/// Going above the threshold pauses the target; coming back to the threshold
/// or below resumes it. The count is a plain atomic: the pause decision
/// tolerates a stale read, and the last message out always resumes.
#[derive(Debug)]
pub struct Backpressure {
    in_flight: AtomicUsize,
    threshold: usize,
}

impl Default for Backpressure {
    fn default() -> Self {
        Self::new(DEFAULT_PAUSE_THRESHOLD)
    }
}

impl Backpressure {
    pub fn new(threshold: usize) -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            threshold,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// A message arrived. Returns the new in-flight count.
    pub fn enter(&self, target: &dyn Pausable) -> usize {
        let count = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        if count > self.threshold && target.can_pause() && !target.is_paused() {
            apply(target, true, count);
            // Everything may have drained before the pause landed.
            if self.in_flight() <= self.threshold {
                apply(target, false, self.in_flight());
            }
        }
        count
    }

    /// A message finished dispatch. Returns the new in-flight count.
    pub fn leave(&self, target: &dyn Pausable) -> usize {
        let count = self
            .in_flight
            .fetch_sub(1, Ordering::AcqRel)
            .saturating_sub(1);
        if count <= self.threshold && target.can_pause() && target.is_paused() {
            apply(target, false, count);
        }
        count
    }
}

fn apply(target: &dyn Pausable, paused: bool, in_flight: usize) {
    match target.set_paused(paused) {
        Ok(()) => debug!(paused, in_flight, "flow control applied"),
        // A disposed channel has nothing left to pause.
        Err(err) => debug!(paused, in_flight, error = %err, "flow control skipped"),
    }
}
