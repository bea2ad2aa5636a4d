//! Retry budgets.
//!
//! A [`RetryBudget`] decides, for a stream of errors from one logical caller,
//! whether the caller should try again. Request-level blips (network, rate
//! limiting, 5xx) and everything else are counted separately so a flaky
//! network can be tolerated longer than, say, a permissions error.
//!
//! # Backoff
//!
//! When `wait_on_retry` is set the decision carries a suggested wait; the
//! budget itself never sleeps.
//!
//! - Request errors: `2^(n-1)` seconds plus up to 3 seconds of jitter
//! - Other errors: `4 * n` seconds
//!
//! Counters reset after `clear_retry_count_after` consecutive successes, and
//! optionally after a quiet period without errors.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::error::ApiError;

/// Maximum exponent for request backoff.
const MAX_EXPONENT: u32 = 10;

/// Upper bound of the random jitter added to request backoff, in milliseconds.
const REQUEST_JITTER_MS: f64 = 3000.0;

/// Linear step for other-error backoff.
const OTHER_BACKOFF_STEP: Duration = Duration::from_secs(4);

/// Configuration for a [`RetryBudget`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryBudgetConfig {
    /// Retries allowed for request/transient errors.
    pub max_request_retry: u32,
    /// Retries allowed for all other errors.
    pub max_other_retry: u32,
    /// Whether callers should back off before retrying.
    pub wait_on_retry: bool,
    /// Consecutive successes that clear both counters.
    pub clear_retry_count_after: u32,
    /// Clear both counters when this long passes without an error.
    pub quiet_reset_secs: Option<u64>,
}

impl Default for RetryBudgetConfig {
    fn default() -> Self {
        Self {
            max_request_retry: 8,
            max_other_retry: 2,
            wait_on_retry: true,
            clear_retry_count_after: 3,
            quiet_reset_secs: None,
        }
    }
}

impl RetryBudgetConfig {
    /// Budget for shared stream polling.
    pub fn shared_stream() -> Self {
        Self::default()
    }

    /// Budget for the nanny's own quota checks.
    pub fn nanny() -> Self {
        Self {
            max_request_retry: 5,
            max_other_retry: 1,
            ..Self::default()
        }
    }

    /// Fleet-wide budget fed by every manager's processing errors.
    pub fn manager_escalation() -> Self {
        Self {
            max_request_retry: 8,
            max_other_retry: 8,
            wait_on_retry: false,
            clear_retry_count_after: 2,
            quiet_reset_secs: None,
        }
    }
}

/// Which counter an error is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Request,
    Other,
}

impl ErrorClass {
    pub fn of(err: &ApiError) -> Self {
        if err.is_transient() {
            ErrorClass::Request
        } else {
            ErrorClass::Other
        }
    }
}

/// Outcome of charging one error to a budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again, after `wait` if set.
    Retry { wait: Option<Duration> },
    /// The budget for this class of error is exhausted.
    GiveUp,
}

impl RetryDecision {
    pub fn should_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }

    pub fn wait(&self) -> Option<Duration> {
        match self {
            RetryDecision::Retry { wait } => *wait,
            RetryDecision::GiveUp => None,
        }
    }
}

#[derive(Debug, Default)]
struct RetryState {
    request_errors: u32,
    other_errors: u32,
    consecutive_successes: u32,
    last_error_at: Option<Instant>,
}

impl RetryState {
    fn clear(&mut self) {
        self.request_errors = 0;
        self.other_errors = 0;
        self.consecutive_successes = 0;
    }
}

/// Error budget for one logical caller.
pub struct RetryBudget {
    name: String,
    config: RetryBudgetConfig,
    state: Mutex<RetryState>,
}

impl RetryBudget {
    pub fn new(name: impl Into<String>, config: RetryBudgetConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(RetryState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RetryBudgetConfig {
        &self.config
    }

    /// Charge a platform error to the budget.
    pub fn should_retry(&self, err: &ApiError) -> RetryDecision {
        self.charge(ErrorClass::of(err), &err.message)
    }

    /// Charge an error of a known class to the budget.
    pub fn charge(&self, class: ErrorClass, message: &str) -> RetryDecision {
        let now = Instant::now();
        let mut state = self.state.lock();

        if let (Some(quiet), Some(last)) = (self.config.quiet_reset_secs, state.last_error_at) {
            if now.duration_since(last) >= Duration::from_secs(quiet) {
                debug!(budget = %self.name, "Quiet period elapsed, clearing retry counters");
                state.clear();
            }
        }
        state.last_error_at = Some(now);
        state.consecutive_successes = 0;

        let (count, max) = match class {
            ErrorClass::Request => {
                state.request_errors += 1;
                (state.request_errors, self.config.max_request_retry)
            }
            ErrorClass::Other => {
                state.other_errors += 1;
                (state.other_errors, self.config.max_other_retry)
            }
        };

        if count > max {
            error!(
                budget = %self.name,
                class = ?class,
                retries = count,
                max,
                error = %message,
                "Retry budget exhausted"
            );
            return RetryDecision::GiveUp;
        }

        let wait = self
            .config
            .wait_on_retry
            .then(|| Self::backoff(class, count));

        warn!(
            budget = %self.name,
            class = ?class,
            retries = count,
            max,
            wait = ?wait,
            error = %message,
            "Error within retry budget"
        );

        RetryDecision::Retry { wait }
    }

    /// Record a successful operation.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if state.request_errors == 0 && state.other_errors == 0 {
            return;
        }
        state.consecutive_successes += 1;
        if state.consecutive_successes >= self.config.clear_retry_count_after {
            debug!(
                budget = %self.name,
                successes = state.consecutive_successes,
                "Consecutive successes reached, clearing retry counters"
            );
            state.clear();
        }
    }

    /// Clear all counters.
    pub fn reset(&self) {
        self.state.lock().clear();
    }

    /// Current `(request, other)` error counts.
    pub fn counts(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.request_errors, state.other_errors)
    }

    fn backoff(class: ErrorClass, count: u32) -> Duration {
        match class {
            ErrorClass::Request => {
                let exponent = count.saturating_sub(1).min(MAX_EXPONENT);
                let base = Duration::from_secs(2u64.pow(exponent));
                let jitter = (REQUEST_JITTER_MS * rand::random::<f64>()) as u64;
                base + Duration::from_millis(jitter)
            }
            ErrorClass::Other => OTHER_BACKOFF_STEP.saturating_mul(count),
        }
    }
}

impl std::fmt::Debug for RetryBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (request, other) = self.counts();
        f.debug_struct("RetryBudget")
            .field("name", &self.name)
            .field("request_errors", &request)
            .field("other_errors", &other)
            .finish()
    }
}
