//! Remaining-quota sampling.

use std::collections::VecDeque;
use std::time::Duration;

/// Readings kept for the rolling average.
pub const QUOTA_SAMPLE_DEPTH: usize = 8;

/// Ring buffer of remaining-quota readings taken once per health tick.
#[derive(Debug, Clone)]
pub struct QuotaSampler {
    /// Newest first.
    readings: VecDeque<u32>,
    period: Duration,
}

impl QuotaSampler {
    /// `period` is the time between two readings.
    pub fn new(period: Duration) -> Self {
        Self {
            readings: VecDeque::with_capacity(QUOTA_SAMPLE_DEPTH),
            period,
        }
    }

    pub fn record(&mut self, remaining: u32) {
        self.readings.push_front(remaining);
        self.readings.truncate(QUOTA_SAMPLE_DEPTH);
    }

    pub fn latest(&self) -> Option<u32> {
        self.readings.front().copied()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Average consumption in requests per second.
    pub fn rate(&self) -> f64 {
        let secs = self.period.as_secs_f64();
        if self.readings.len() < 2 || secs <= 0.0 {
            return 0.0;
        }
        let diffs: Vec<f64> = self
            .readings
            .iter()
            .zip(self.readings.iter().skip(1))
            .map(|(newer, older)| (f64::from(*newer) - f64::from(*older)).abs())
            .collect();
        diffs.iter().sum::<f64>() / diffs.len() as f64 / secs
    }

    /// Time until `remaining` is used up at the current rate. `None` means never.
    pub fn depletion(&self, remaining: u32) -> Option<Duration> {
        let rate = self.rate();
        if rate <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(f64::from(remaining) / rate))
    }

    /// One-line usage summary.
    pub fn summary(&self, remaining: u32) -> String {
        let depletion = match self.depletion(remaining) {
            Some(d) => format_duration(d),
            None => "never".to_string(),
        };
        format!(
            "API usage rolling avg: {:.2}/s | est. depletion: {} ({} remaining)",
            self.rate(),
            depletion,
            remaining
        )
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    match secs {
        0..=59 => format!("{}s", secs),
        60..=3599 => format!("{}m {}s", secs / 60, secs % 60),
        _ => format!("{}h {}m", secs / 3600, (secs % 3600) / 60),
    }
}
