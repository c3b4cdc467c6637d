use std::time::Duration;
use tokio::time::Instant;

/// Done count observed at one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSample {
    pub done: u64,
    pub at: Instant,
}

impl StatsSample {
    pub fn new(done: u64, at: Instant) -> Self {
        Self { done, at }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Eta {
    Reached,
    /// No forward progress between the samples.
    Indeterminate,
    Estimated {
        remaining: Duration,
        per_hour: f64,
    },
}

impl Eta {
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Eta::Reached => Some(Duration::ZERO),
            Eta::Indeterminate => None,
            Eta::Estimated { remaining, .. } => Some(*remaining),
        }
    }
}

/// Projects time to `target` from the throughput between two samples.
pub fn estimate_eta(prev: &StatsSample, now: &StatsSample, target: u64) -> Eta {
    if now.done >= target {
        return Eta::Reached;
    }

    let elapsed = now.at.saturating_duration_since(prev.at);
    let delta = now.done.saturating_sub(prev.done);
    if delta == 0 || elapsed.is_zero() {
        return Eta::Indeterminate;
    }

    let per_sec = delta as f64 / elapsed.as_secs_f64();
    let left = (target - now.done) as f64;
    Eta::Estimated {
        remaining: Duration::from_secs_f64(left / per_sec),
        per_hour: per_sec * 3600.0,
    }
}

/// Items per hour over `elapsed`, zero when nothing can be said.
pub fn throughput_per_hour(delta: u64, elapsed: Duration) -> f64 {
    if elapsed.is_zero() {
        return 0.0;
    }
    delta as f64 * 3600.0 / elapsed.as_secs_f64()
}

/// `1h 05m`, `4m 10s` or `12s`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{}h {:02}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
