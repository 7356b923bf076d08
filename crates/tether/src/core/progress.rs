//! Progress event rate limiting.

use std::time::{Duration, Instant};

/// Decides which progress updates are worth emitting.
///
/// The first update of a transfer and the one that completes it always
/// pass; everything in between is limited to one per interval.
#[derive(Debug, Clone)]
pub struct ProgressChoke {
    interval: Duration,
    unconditional: bool,
    last_emit: Option<Instant>,
}

impl ProgressChoke {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            unconditional: false,
            last_emit: None,
        }
    }

    /// A choke that lets every update through.
    pub fn unconditional() -> Self {
        Self {
            interval: Duration::ZERO,
            unconditional: true,
            last_emit: None,
        }
    }

    pub fn should_emit(&mut self, now: Instant, done: u64, total: Option<u64>) -> bool {
        let complete = total.is_some_and(|t| done >= t);
        let due = match self.last_emit {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };
        if self.unconditional || complete || due {
            self.last_emit = Some(now);
            return true;
        }
        false
    }

    /// Start over, e.g. when a transfer is restarted after a redirect.
    pub fn reset(&mut self) {
        self.last_emit = None;
    }
}
