//! Rolling usage rates for one community.
//!
//! Counters are bumped on every intake and every processed item, and the
//! health loop turns them into per-second rates once per tick.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// Number of health ticks averaged.
const SAMPLE_DEPTH: usize = 6;

/// Averaged rates over the recent samples.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageSnapshot {
    pub events_per_sec: f64,
    pub api_calls_per_sec: f64,
}

impl UsageSnapshot {
    /// Combined request pressure used for offender detection.
    pub fn combined(&self) -> f64 {
        self.events_per_sec + self.api_calls_per_sec
    }
}

#[derive(Debug, Default)]
struct Samples {
    events: VecDeque<f64>,
    api_calls: VecDeque<f64>,
    latest: UsageSnapshot,
}

fn push_sample(samples: &mut VecDeque<f64>, value: f64) -> f64 {
    samples.push_front(value);
    samples.truncate(SAMPLE_DEPTH);
    samples.iter().sum::<f64>() / samples.len() as f64
}

#[derive(Debug, Default)]
pub struct UsageTracker {
    events: AtomicU64,
    api_calls: AtomicU64,
    samples: Mutex<Samples>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_api_calls(&self, calls: u32) {
        self.api_calls.fetch_add(u64::from(calls), Ordering::Relaxed);
    }

    /// Close the current sampling window of length `elapsed`.
    pub fn sample(&self, elapsed: Duration) -> UsageSnapshot {
        let secs = elapsed.as_secs_f64();
        let events = self.events.swap(0, Ordering::Relaxed) as f64;
        let api_calls = self.api_calls.swap(0, Ordering::Relaxed) as f64;

        let mut samples = self.samples.lock();
        if secs <= 0.0 {
            return samples.latest;
        }

        let latest = UsageSnapshot {
            events_per_sec: push_sample(&mut samples.events, events / secs),
            api_calls_per_sec: push_sample(&mut samples.api_calls, api_calls / secs),
        };
        samples.latest = latest;
        latest
    }

    /// Rates as of the last sample.
    pub fn snapshot(&self) -> UsageSnapshot {
        self.samples.lock().latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_are_averaged_over_samples() {
        let usage = UsageTracker::new();
        for _ in 0..10 {
            usage.record_event();
        }
        usage.record_api_calls(5);

        let first = usage.sample(Duration::from_secs(5));
        assert!((first.events_per_sec - 2.0).abs() < f64::EPSILON);
        assert!((first.api_calls_per_sec - 1.0).abs() < f64::EPSILON);
        assert!((first.combined() - 3.0).abs() < f64::EPSILON);

        // an idle window halves the average
        let second = usage.sample(Duration::from_secs(5));
        assert!((second.events_per_sec - 1.0).abs() < f64::EPSILON);
        assert_eq!(usage.snapshot(), second);
    }

    #[test]
    fn test_old_samples_fall_out() {
        let usage = UsageTracker::new();
        usage.record_api_calls(60);
        usage.sample(Duration::from_secs(1));
        for _ in 0..SAMPLE_DEPTH {
            usage.sample(Duration::from_secs(1));
        }
        assert_eq!(usage.snapshot().api_calls_per_sec, 0.0);
    }
}
