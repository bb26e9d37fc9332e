//! Throughput metrics for one capture session.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Trailing window used for the rolling FPS figure.
pub const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Derived counters. Nothing here is persisted; `reset` runs on every start and stop.
#[derive(Clone, Debug, Default)]
pub struct PipelineMetrics {
    frame_count: u64,
    window: VecDeque<Instant>,
    last_frame_at: Option<Instant>,
    last_response_at: Option<Instant>,
    latency: Option<Duration>,
    completed_requests: u64,
    failed_requests: u64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one successfully sampled frame.
    pub fn record_frame(&mut self, now: Instant) {
        self.frame_count += 1;
        self.last_frame_at = Some(now);
        self.window.push_back(now);
        self.prune(now);
    }

    pub fn record_response(&mut self, now: Instant, latency: Duration) {
        self.completed_requests += 1;
        self.last_response_at = Some(now);
        self.latency = Some(latency);
    }

    pub fn record_failure(&mut self, latency: Duration) {
        self.failed_requests += 1;
        self.latency = Some(latency);
    }

    /// Frames sampled within the trailing second.
    pub fn fps(&self, now: Instant) -> usize {
        self.window
            .iter()
            .filter(|at| within_window(**at, now))
            .count()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn last_frame_at(&self) -> Option<Instant> {
        self.last_frame_at
    }

    pub fn last_response_at(&self) -> Option<Instant> {
        self.last_response_at
    }

    /// Round-trip time of the most recent completed request.
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn completed_requests(&self) -> u64 {
        self.completed_requests
    }

    pub fn failed_requests(&self) -> u64 {
        self.failed_requests
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.window.front() {
            if within_window(*oldest, now) {
                break;
            }
            self.window.pop_front();
        }
    }
}

fn within_window(at: Instant, now: Instant) -> bool {
    // Timestamps from the future (clock handed in out of order) count as current.
    now.checked_duration_since(at)
        .map_or(true, |age| age < FPS_WINDOW)
}
