//! Sliding window of `(time, height)` samples for block-rate estimation.

use std::collections::VecDeque;

use tokio::time::Instant;

#[derive(Debug)]
pub struct RateWindow {
    capacity: usize,
    samples: VecDeque<(Instant, u64)>,
}

impl RateWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, at: Instant, height: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((at, height));
    }

    /// Blocks per second between the oldest and newest sample; the partial
    /// span is used until the window fills. Zero with fewer than two samples
    /// or no elapsed time.
    pub fn rate(&self) -> f64 {
        let (Some((t0, h0)), Some((t1, h1))) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let secs = t1.saturating_duration_since(*t0).as_secs_f64();
        if secs <= 0.0 || h1 <= h0 {
            return 0.0;
        }
        (h1 - h0) as f64 / secs
    }
}
