//! Per-community run specification.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{PollingDefaults, SHARED_STREAM_LIMIT};
use crate::client::SourceType;
use crate::{Error, Result};

/// One polling entry as written by a community.
///
/// Either a bare source name (`"modqueue"`) or an object overriding the
/// operator defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PollSubscriptionSpec {
    Source(SourceType),
    Detailed {
        #[serde(alias = "pollOn")]
        source: SourceType,
        #[serde(default)]
        limit: Option<u32>,
        #[serde(default, alias = "interval")]
        interval_secs: Option<u64>,
        #[serde(default, alias = "delayUntil")]
        delay_until_secs: Option<u64>,
    },
}

impl PollSubscriptionSpec {
    pub fn source(&self) -> SourceType {
        match self {
            Self::Source(source) | Self::Detailed { source, .. } => *source,
        }
    }
}

/// A subscription with every default resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSubscription {
    pub source: SourceType,
    pub community: String,
    pub limit: u32,
    pub interval: Duration,
    pub delay_until: Option<Duration>,
    /// Whether every setting equals the operator default for its source.
    pub uses_defaults: bool,
}

/// Validated run specification for one community.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSpec {
    pub polling: Vec<PollSubscriptionSpec>,
    /// Requested concurrent processing; capped by the operator.
    pub max_workers: Option<usize>,
    pub cache_ttl_secs: Option<u64>,
    /// Days of processing history to keep.
    pub retention_days: Option<u32>,
}

impl Default for RunSpec {
    fn default() -> Self {
        Self {
            polling: vec![PollSubscriptionSpec::Source(SourceType::Unmoderated)],
            max_workers: None,
            cache_ttl_secs: None,
            retention_days: None,
        }
    }
}

impl RunSpec {
    pub fn validate(&self) -> Result<()> {
        if self.polling.is_empty() {
            return Err(Error::validation("polling must declare at least one source"));
        }

        let mut seen = HashSet::new();
        for entry in &self.polling {
            if !seen.insert(entry.source()) {
                return Err(Error::validation(format!(
                    "polling source '{}' is declared more than once",
                    entry.source()
                )));
            }
            if let PollSubscriptionSpec::Detailed {
                limit,
                interval_secs,
                ..
            } = entry
            {
                if matches!(limit, Some(l) if *l == 0 || *l > SHARED_STREAM_LIMIT) {
                    return Err(Error::validation(format!(
                        "polling limit for '{}' must be between 1 and {}",
                        entry.source(),
                        SHARED_STREAM_LIMIT
                    )));
                }
                if *interval_secs == Some(0) {
                    return Err(Error::validation(format!(
                        "polling interval for '{}' must be greater than 0",
                        entry.source()
                    )));
                }
            }
        }

        if self.max_workers == Some(0) {
            return Err(Error::validation("max_workers must be at least 1"));
        }
        Ok(())
    }

    /// Effective worker count given the operator cap.
    pub fn effective_workers(&self, operator_cap: usize) -> usize {
        self.max_workers.unwrap_or(operator_cap).min(operator_cap).max(1)
    }

    /// Resolve every entry against the operator defaults.
    pub fn subscriptions(&self, community: &str, defaults: &PollingDefaults) -> Vec<PollSubscription> {
        self.polling
            .iter()
            .map(|entry| {
                let (source, limit, interval_secs, delay_until_secs) = match entry {
                    PollSubscriptionSpec::Source(source) => (*source, None, None, None),
                    PollSubscriptionSpec::Detailed {
                        source,
                        limit,
                        interval_secs,
                        delay_until_secs,
                    } => (*source, *limit, *interval_secs, *delay_until_secs),
                };

                let limit = limit.unwrap_or(defaults.limit);
                let interval_secs = interval_secs.unwrap_or(defaults.interval_secs);
                let delay_until_secs = delay_until_secs.or(defaults.delay_until_secs);

                PollSubscription {
                    source,
                    community: community.to_string(),
                    limit,
                    interval: Duration::from_secs(interval_secs),
                    delay_until: delay_until_secs.map(Duration::from_secs),
                    uses_defaults: limit == defaults.limit
                        && interval_secs == defaults.interval_secs
                        && delay_until_secs == defaults.delay_until_secs,
                }
            })
            .collect()
    }
}
