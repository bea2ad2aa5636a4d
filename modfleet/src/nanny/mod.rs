//! API quota governance.
//!
//! The nanny compares the remaining quota (or the estimated time until it is
//! used up) against a soft and a hard limit:
//!
//! - hard: every manager stops receiving events and shared polling is suspended
//! - soft: the heaviest communities are slowed down
//! - neither: anything the nanny slowed or paused is resumed
//!
//! A soft breach while in hard mode keeps hard mode, so events only resume
//! once the quota clears the soft limit as well.

mod quota;

pub use quota::{QUOTA_SAMPLE_DEPTH, QuotaSampler};

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, info};

use crate::client::PlatformClient;
use crate::config::parse_duration;
use crate::error::ApiError;
use crate::retry::{RetryBudget, RetryDecision};

/// Query the platform when the quota window resets within this long.
const RESET_QUERY_WINDOW_SECS: i64 = 10;

/// A quota threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaLimit {
    /// Breached when fewer requests remain.
    Remaining(u32),
    /// Breached when the quota is estimated to run out sooner.
    Within(Duration),
}

impl QuotaLimit {
    pub fn is_hit(&self, remaining: u32, depletion: Option<Duration>) -> bool {
        match self {
            QuotaLimit::Remaining(limit) => *limit > remaining,
            QuotaLimit::Within(window) => depletion.is_some_and(|d| *window > d),
        }
    }
}

impl std::fmt::Display for QuotaLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaLimit::Remaining(n) => write!(f, "{} remaining", n),
            QuotaLimit::Within(d) => write!(f, "{}s until depletion", d.as_secs()),
        }
    }
}

impl Serialize for QuotaLimit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            QuotaLimit::Remaining(n) => serializer.serialize_u32(*n),
            QuotaLimit::Within(d) => serializer.serialize_str(&format!("{}s", d.as_secs())),
        }
    }
}

impl<'de> Deserialize<'de> for QuotaLimit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u32),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(QuotaLimit::Remaining(n)),
            Raw::Text(text) => parse_duration(&text)
                .map(QuotaLimit::Within)
                .map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NannyConfig {
    pub soft_limit: QuotaLimit,
    pub hard_limit: QuotaLimit,
    /// Delay between dequeues for slowed communities.
    pub slow_mode_delay_ms: u64,
    /// Requests per second above which a community counts as an offender,
    /// tried in order until one matches.
    pub offender_thresholds: Vec<f64>,
    pub check_interval_secs: u64,
    /// Wait after a failed check.
    pub error_cooldown_secs: u64,
}

impl Default for NannyConfig {
    fn default() -> Self {
        Self {
            soft_limit: QuotaLimit::Remaining(250),
            hard_limit: QuotaLimit::Remaining(50),
            slow_mode_delay_ms: 1500,
            offender_thresholds: vec![0.5, 0.25],
            check_interval_secs: 10,
            error_cooldown_secs: 240,
        }
    }
}

impl NannyConfig {
    pub fn slow_mode_delay(&self) -> Duration {
        Duration::from_millis(self.slow_mode_delay_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_secs(self.error_cooldown_secs)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NannyMode {
    #[default]
    #[serde(rename = "none")]
    #[strum(to_string = "none")]
    Normal,
    Soft,
    Hard,
}

/// What the fleet must do after an evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum NannyAction {
    /// Nothing changed.
    Stay,
    /// Pause events everywhere and suspend shared polling.
    EnterHard,
    /// Slow the listed communities. `threshold` is the offender threshold
    /// that matched, `None` when nobody stood out and everyone is slowed.
    EnterSoft {
        slowed: Vec<String>,
        threshold: Option<f64>,
    },
    /// Clear slow mode and resume what the nanny paused.
    Recover,
}

/// Mode state machine. Performs no I/O.
#[derive(Debug)]
pub struct RateNanny {
    config: NannyConfig,
    mode: NannyMode,
}

impl RateNanny {
    pub fn new(config: NannyConfig) -> Self {
        Self {
            config,
            mode: NannyMode::Normal,
        }
    }

    pub fn mode(&self) -> NannyMode {
        self.mode
    }

    pub fn config(&self) -> &NannyConfig {
        &self.config
    }

    /// Evaluate the current quota.
    ///
    /// `usage` holds each community's combined requests per second.
    pub fn evaluate(
        &mut self,
        remaining: u32,
        depletion: Option<Duration>,
        usage: &[(String, f64)],
    ) -> NannyAction {
        if self.config.hard_limit.is_hit(remaining, depletion) {
            if self.mode == NannyMode::Hard {
                return NannyAction::Stay;
            }
            info!(limit = %self.config.hard_limit, remaining, "Hard limit reached");
            self.mode = NannyMode::Hard;
            return NannyAction::EnterHard;
        }

        if self.config.soft_limit.is_hit(remaining, depletion) {
            if self.mode != NannyMode::Normal {
                return NannyAction::Stay;
            }
            let (slowed, threshold) = self.offenders(usage);
            info!(
                limit = %self.config.soft_limit,
                remaining,
                threshold = ?threshold,
                slowed = slowed.len(),
                "Soft limit reached"
            );
            self.mode = NannyMode::Soft;
            return NannyAction::EnterSoft { slowed, threshold };
        }

        if self.mode != NannyMode::Normal {
            info!(from = %self.mode, remaining, "Quota recovered");
            self.mode = NannyMode::Normal;
            return NannyAction::Recover;
        }
        NannyAction::Stay
    }

    fn offenders(&self, usage: &[(String, f64)]) -> (Vec<String>, Option<f64>) {
        for threshold in &self.config.offender_thresholds {
            let offenders: Vec<String> = usage
                .iter()
                .filter(|(_, rate)| rate > threshold)
                .map(|(name, _)| name.clone())
                .collect();
            if !offenders.is_empty() {
                return (offenders, Some(*threshold));
            }
        }
        debug!("No offenders detected, slowing every community");
        (usage.iter().map(|(name, _)| name.clone()).collect(), None)
    }
}

/// Make sure the client's quota counters are current.
///
/// When the quota window resets within a few seconds nothing may have
/// refreshed the counters (for example while everything is paused), so a
/// cheap quota request is made. Rate-limit errors are returned immediately;
/// other errors are retried against `budget`.
pub async fn refresh_quota(
    client: &dyn PlatformClient,
    budget: &RetryBudget,
) -> Result<(), ApiError> {
    let query_after = Utc::now() + chrono::Duration::seconds(RESET_QUERY_WINDOW_SECS);
    if client.quota_reset_at() > query_after {
        return Ok(());
    }

    loop {
        match client.get_me().await {
            Ok(_) => {
                budget.record_success();
                debug!(remaining = client.remaining_quota(), "Refreshed quota counters");
                return Ok(());
            }
            Err(err) if err.is_rate_limit() => return Err(err),
            Err(err) => match budget.should_retry(&err) {
                RetryDecision::Retry { wait } => {
                    if let Some(wait) = wait {
                        tokio::time::sleep(wait).await;
                    }
                }
                RetryDecision::GiveUp => return Err(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryBudgetConfig;
    use crate::testing::FakeClient;
    use std::sync::atomic::Ordering;

    fn usage(entries: &[(&str, f64)]) -> Vec<(String, f64)> {
        entries.iter().map(|(n, r)| (n.to_string(), *r)).collect()
    }

    #[test]
    fn test_quota_limit_parsing() {
        let limit: QuotaLimit = serde_json::from_str("250").unwrap();
        assert_eq!(limit, QuotaLimit::Remaining(250));
        let limit: QuotaLimit = serde_json::from_str(r#""5m""#).unwrap();
        assert_eq!(limit, QuotaLimit::Within(Duration::from_secs(300)));
        assert!(serde_json::from_str::<QuotaLimit>(r#""soon""#).is_err());
        assert_eq!(
            serde_json::to_string(&QuotaLimit::Within(Duration::from_secs(90))).unwrap(),
            r#""90s""#
        );
    }

    #[test]
    fn test_quota_limit_hit() {
        assert!(QuotaLimit::Remaining(50).is_hit(40, None));
        assert!(!QuotaLimit::Remaining(50).is_hit(50, None));

        let within = QuotaLimit::Within(Duration::from_secs(120));
        assert!(within.is_hit(600, Some(Duration::from_secs(60))));
        assert!(!within.is_hit(600, Some(Duration::from_secs(300))));
        // no consumption means it never runs out
        assert!(!within.is_hit(1, None));
    }

    #[test]
    fn test_hard_then_recover() {
        let mut nanny = RateNanny::new(NannyConfig {
            soft_limit: QuotaLimit::Remaining(150),
            ..NannyConfig::default()
        });

        assert_eq!(nanny.evaluate(40, None, &[]), NannyAction::EnterHard);
        assert_eq!(nanny.mode(), NannyMode::Hard);
        assert_eq!(nanny.evaluate(30, None, &[]), NannyAction::Stay);
        // back in the soft zone: still hard
        assert_eq!(nanny.evaluate(100, None, &[]), NannyAction::Stay);
        assert_eq!(nanny.mode(), NannyMode::Hard);

        assert_eq!(nanny.evaluate(200, None, &[]), NannyAction::Recover);
        assert_eq!(nanny.mode(), NannyMode::Normal);
        assert_eq!(nanny.evaluate(200, None, &[]), NannyAction::Stay);
    }

    #[test]
    fn test_soft_slows_offenders_over_first_threshold() {
        let mut nanny = RateNanny::new(NannyConfig::default());
        let action = nanny.evaluate(200, None, &usage(&[("a", 0.9), ("b", 0.3), ("c", 0.1)]));
        assert_eq!(
            action,
            NannyAction::EnterSoft {
                slowed: vec!["a".to_string()],
                threshold: Some(0.5),
            }
        );
        // re-entering soft is a no-op
        assert_eq!(nanny.evaluate(180, None, &[]), NannyAction::Stay);
    }

    #[test]
    fn test_soft_falls_back_to_lower_threshold() {
        let mut nanny = RateNanny::new(NannyConfig::default());
        let action = nanny.evaluate(200, None, &usage(&[("a", 0.4), ("b", 0.3), ("c", 0.1)]));
        assert_eq!(
            action,
            NannyAction::EnterSoft {
                slowed: vec!["a".to_string(), "b".to_string()],
                threshold: Some(0.25),
            }
        );
    }

    #[test]
    fn test_soft_without_offenders_slows_everyone() {
        let mut nanny = RateNanny::new(NannyConfig::default());
        let action = nanny.evaluate(200, None, &usage(&[("a", 0.1), ("b", 0.0)]));
        assert_eq!(
            action,
            NannyAction::EnterSoft {
                slowed: vec!["a".to_string(), "b".to_string()],
                threshold: None,
            }
        );
    }

    #[test]
    fn test_duration_limits_use_depletion() {
        let mut nanny = RateNanny::new(NannyConfig {
            soft_limit: QuotaLimit::Within(Duration::from_secs(600)),
            hard_limit: QuotaLimit::Within(Duration::from_secs(120)),
            ..NannyConfig::default()
        });
        assert_eq!(
            nanny.evaluate(500, Some(Duration::from_secs(60)), &[]),
            NannyAction::EnterHard
        );
        assert_eq!(nanny.evaluate(500, None, &[]), NannyAction::Recover);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_queries_near_reset() {
        let client = FakeClient::new();
        let budget = RetryBudget::new("nanny", RetryBudgetConfig::nanny());

        refresh_quota(client.as_ref(), &budget).await.unwrap();
        assert_eq!(client.me_calls.load(Ordering::SeqCst), 0);

        client.set_reset_at(Utc::now() + chrono::Duration::seconds(5));
        refresh_quota(client.as_ref(), &budget).await.unwrap();
        assert_eq!(client.me_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_propagates_rate_limit() {
        let client = FakeClient::new();
        client.set_reset_at(Utc::now());
        client.set_me(Err(ApiError::rate_limited("slow down")));
        let budget = RetryBudget::new("nanny", RetryBudgetConfig::nanny());

        let err = refresh_quota(client.as_ref(), &budget).await.unwrap_err();
        assert!(err.is_rate_limit());
        assert_eq!(client.me_calls.load(Ordering::SeqCst), 1);
        assert_eq!(budget.counts(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_gives_up_after_budget() {
        let client = FakeClient::new();
        client.set_reset_at(Utc::now());
        client.set_me(Err(ApiError::status(503, "unavailable")));
        let budget = RetryBudget::new("nanny", RetryBudgetConfig::nanny());

        assert!(refresh_quota(client.as_ref(), &budget).await.is_err());
        // five retries, then the sixth failure gives up
        assert_eq!(client.me_calls.load(Ordering::SeqCst), 6);
    }
}
