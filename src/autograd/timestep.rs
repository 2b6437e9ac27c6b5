//! Creation clock and logical time steps for truncated backpropagation

use std::sync::atomic::{AtomicU64, Ordering};
use parking_lot::RwLock;

use super::node::Node;

/// Monotonic creation counter. Every registered node takes one tick.
#[derive(Debug, Default)]
pub struct Clock {
    ticks: AtomicU64,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current timestamp and advances the clock.
    pub fn tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::SeqCst)
    }

    /// Timestamp the next node will receive.
    pub fn now(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }
}

/// Ordered step boundaries, one per increment. Step `i` starts at
/// `boundaries[i]`; anything earlier than the first boundary is step 0.
#[derive(Debug)]
pub struct TimeStepHandler {
    boundaries: RwLock<Vec<u64>>,
}

impl TimeStepHandler {
    /// A handler with no recorded boundaries. Its current step is -1.
    pub fn new() -> Self {
        Self {
            boundaries: RwLock::new(Vec::new()),
        }
    }

    /// Record a step boundary at `timestamp`. Boundaries never move backwards.
    pub fn increment(&self, timestamp: u64) {
        let mut boundaries = self.boundaries.write();
        let last = boundaries.last().copied().unwrap_or(0);
        boundaries.push(last.max(timestamp));
    }

    /// Number of recorded boundaries minus one.
    pub fn current_time_step(&self) -> isize {
        self.boundaries.read().len() as isize - 1
    }

    /// Step during which `timestamp` was taken: the latest boundary not after it.
    pub fn time_step(&self, timestamp: u64) -> usize {
        let boundaries = self.boundaries.read();
        boundaries
            .partition_point(|&b| b <= timestamp)
            .saturating_sub(1)
    }

    pub fn node_time_step(&self, node: &dyn Node) -> usize {
        self.time_step(node.timestamp())
    }

    /// Whether a node created at `timestamp` is at or before
    /// `current_time_step() - back_steps`. A cutoff below step 0 excludes nothing.
    pub fn is_truncated(&self, timestamp: u64, back_steps: usize) -> bool {
        let cutoff = isize::try_from(back_steps)
            .ok()
            .and_then(|back| self.current_time_step().checked_sub(back));
        match cutoff {
            Some(cutoff) if cutoff >= 0 => self.time_step(timestamp) <= cutoff as usize,
            _ => false,
        }
    }

    pub fn reset(&self) {
        self.boundaries.write().clear();
    }
}

impl Default for TimeStepHandler {
    fn default() -> Self {
        Self::new()
    }
}
