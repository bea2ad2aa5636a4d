//! Operator configuration.
//!
//! The fleet reads one JSON document at startup. Every section has defaults,
//! so an empty object is a valid configuration. A few values can be
//! overridden from the environment (after `.env` is loaded by `dotenvy`):
//!
//! - `MODFLEET_CONFIG`: path of the JSON document
//! - `MODFLEET_ACCESS_TOKEN`: bearer token for the platform client
//! - `MODFLEET_LOG_DIR`: directory for rotated log files
//! - `MODFLEET_CONFIG_DIR`: directory holding per-community run specifications

mod run_spec;
mod source;

pub use run_spec::{PollSubscription, PollSubscriptionSpec, RunSpec};
pub use source::{ConfigSnapshot, ConfigSource, DirectoryConfigSource, content_hash};

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::client::SourceType;
use crate::logging::LoggingSettings;
use crate::nanny::{NannyConfig, QuotaLimit};
use crate::retry::RetryBudgetConfig;
use crate::{Error, Result};

pub const CONFIG_PATH_ENV: &str = "MODFLEET_CONFIG";
pub const ACCESS_TOKEN_ENV: &str = "MODFLEET_ACCESS_TOKEN";
pub const LOG_DIR_ENV: &str = "MODFLEET_LOG_DIR";
pub const CONFIG_DIR_ENV: &str = "MODFLEET_CONFIG_DIR";

/// Items per request on every shared stream.
pub const SHARED_STREAM_LIMIT: u32 = 100;

/// Which communities the fleet runs on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubredditSelection {
    /// Only run these communities (when non-empty).
    pub names: Vec<String>,
    /// Run every moderated community except these (ignored when `names` is set).
    pub exclude: Vec<String>,
}

/// Operator polling defaults and shared-stream opt-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingDefaults {
    /// Sources polled once for the whole fleet. `true` shares every source.
    #[serde(deserialize_with = "deserialize_shared")]
    pub shared: Vec<SourceType>,
    pub limit: u32,
    pub interval_secs: u64,
    pub delay_until_secs: Option<u64>,
    /// Identifiers remembered per stream for de-duplication.
    pub continuity_cap: usize,
}

impl Default for PollingDefaults {
    fn default() -> Self {
        Self {
            shared: Vec::new(),
            limit: 50,
            interval_secs: 30,
            delay_until_secs: None,
            continuity_cap: 1000,
        }
    }
}

impl PollingDefaults {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn is_shared(&self, source: SourceType) -> bool {
        self.shared.contains(&source)
    }
}

fn deserialize_shared<'de, D>(deserializer: D) -> std::result::Result<Vec<SourceType>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Shared {
        All(bool),
        List(Vec<SourceType>),
    }

    Ok(match Shared::deserialize(deserializer)? {
        Shared::All(true) => SourceType::ALL.to_vec(),
        Shared::All(false) => Vec::new(),
        Shared::List(list) => list
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueDefaults {
    /// Upper bound for every community's concurrent processing.
    pub max_workers: usize,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self { max_workers: 1 }
    }
}

/// Cadence of the fleet's periodic work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub health_tick_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Spacing between per-community requests and restarts, and between
    /// items fanned out from a shared stream.
    pub stagger_ms: u64,
    /// Spacing between shared stream starts.
    pub stream_start_spacing_ms: u64,
    pub retention_interval_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            health_tick_secs: 5,
            heartbeat_interval_secs: 300,
            stagger_ms: 2000,
            stream_start_spacing_ms: 2000,
            retention_interval_secs: 30 * 60,
        }
    }
}

impl TimingConfig {
    pub fn health_tick(&self) -> Duration {
        Duration::from_secs(self.health_tick_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn stream_start_spacing(&self) -> Duration {
        Duration::from_millis(self.stream_start_spacing_ms)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs)
    }
}

/// Retry budgets for each subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryBudgets {
    pub shared_stream: RetryBudgetConfig,
    pub nanny: RetryBudgetConfig,
    pub manager_escalation: RetryBudgetConfig,
    /// Budget each community uses for its own polling.
    pub manager_stream: RetryBudgetConfig,
}

impl Default for RetryBudgets {
    fn default() -> Self {
        Self {
            shared_stream: RetryBudgetConfig::shared_stream(),
            nanny: RetryBudgetConfig::nanny(),
            manager_escalation: RetryBudgetConfig::manager_escalation(),
            manager_stream: RetryBudgetConfig::default(),
        }
    }
}

/// Platform client connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub base_url: String,
    pub user_agent: String,
    pub access_token: String,
    pub timeout_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: "https://oauth.reddit.com/".to_string(),
            user_agent: format!("modfleet/{}", env!("CARGO_PKG_VERSION")),
            access_token: String::new(),
            timeout_secs: 30,
        }
    }
}

/// Complete operator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub subreddits: SubredditSelection,
    pub polling: PollingDefaults,
    pub queue: QueueDefaults,
    pub nanny: NannyConfig,
    pub retry: RetryBudgets,
    pub timing: TimingConfig,
    pub client: ClientSettings,
    pub logging: LoggingSettings,
    /// Directory read by [`DirectoryConfigSource`].
    pub config_dir: PathBuf,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            subreddits: SubredditSelection::default(),
            polling: PollingDefaults::default(),
            queue: QueueDefaults::default(),
            nanny: NannyConfig::default(),
            retry: RetryBudgets::default(),
            timing: TimingConfig::default(),
            client: ClientSettings::default(),
            logging: LoggingSettings::default(),
            config_dir: PathBuf::from("communities"),
        }
    }
}

impl FleetConfig {
    /// Parse a JSON document.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` (or `MODFLEET_CONFIG`), apply environment overrides and validate.
    ///
    /// A missing file yields the defaults. Runs before logging is set up, so
    /// the caller reports the returned origin.
    pub fn load(path: Option<&Path>) -> Result<(Self, ConfigOrigin)> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));

        let (mut config, origin) = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(&path)?;
                (serde_json::from_str(&raw)?, ConfigOrigin::File(path))
            }
            Some(path) => (Self::default(), ConfigOrigin::Missing(path)),
            None => (Self::default(), ConfigOrigin::Defaults),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok((config, origin))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var(ACCESS_TOKEN_ENV) {
            self.client.access_token = token;
        }
        if let Ok(dir) = std::env::var(LOG_DIR_ENV) {
            self.logging.dir = dir;
        }
        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
            self.config_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.polling.interval_secs == 0 {
            return Err(Error::validation("polling.interval_secs must be greater than 0"));
        }
        if self.polling.limit == 0 || self.polling.limit > SHARED_STREAM_LIMIT {
            return Err(Error::validation(format!(
                "polling.limit must be between 1 and {}",
                SHARED_STREAM_LIMIT
            )));
        }
        if self.polling.continuity_cap < SHARED_STREAM_LIMIT as usize {
            return Err(Error::validation(format!(
                "polling.continuity_cap must be at least {}",
                SHARED_STREAM_LIMIT
            )));
        }
        if self.queue.max_workers == 0 {
            return Err(Error::validation("queue.max_workers must be at least 1"));
        }
        if self.timing.health_tick_secs == 0 || self.timing.heartbeat_interval_secs == 0 {
            return Err(Error::validation(
                "timing.health_tick_secs and timing.heartbeat_interval_secs must be greater than 0",
            ));
        }
        match (&self.nanny.hard_limit, &self.nanny.soft_limit) {
            (QuotaLimit::Remaining(hard), QuotaLimit::Remaining(soft)) if hard > soft => {
                return Err(Error::validation(format!(
                    "nanny.hard_limit ({}) must not exceed nanny.soft_limit ({})",
                    hard, soft
                )));
            }
            (QuotaLimit::Within(hard), QuotaLimit::Within(soft)) if hard > soft => {
                return Err(Error::validation(
                    "nanny.hard_limit duration must not exceed nanny.soft_limit duration",
                ));
            }
            _ => {}
        }
        if self
            .nanny
            .offender_thresholds
            .iter()
            .any(|t| !t.is_finite() || *t < 0.0)
        {
            return Err(Error::validation(
                "nanny.offender_thresholds must be non-negative numbers",
            ));
        }
        Ok(())
    }
}

/// Where [`FleetConfig::load`] found its document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOrigin {
    File(PathBuf),
    /// The path was given but no file exists there.
    Missing(PathBuf),
    Defaults,
}

impl std::fmt::Display for ConfigOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Missing(path) => write!(f, "defaults ({} not found)", path.display()),
            Self::Defaults => write!(f, "defaults"),
        }
    }
}

/// Parse a human duration such as `90s`, `5m`, `1h30m`, `2min` or `1500ms`.
///
/// A bare number is read as seconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    if let Ok(secs) = trimmed.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Ok(Duration::from_secs_f64(secs));
        }
        return Err(Error::config(format!("invalid duration '{}'", input)));
    }
    humantime::parse_duration(trimmed)
        .map_err(|e| Error::config(format!("invalid duration '{}': {}", input, e)))
}
