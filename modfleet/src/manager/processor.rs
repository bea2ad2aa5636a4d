//! Item processing seam.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::client::Item;
use crate::error::ApiError;
use crate::retry::ErrorClass;

/// What the rule pipeline did with an item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Platform calls made while processing.
    pub api_calls: u32,
    /// Whether any rule matched.
    pub triggered: bool,
}

#[derive(Error, Debug, Clone)]
pub enum ProcessError {
    #[error("platform error: {0}")]
    Api(#[from] ApiError),

    #[error("{0}")]
    Failed(String),
}

impl ProcessError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProcessError::Api(err) => ErrorClass::of(err),
            ProcessError::Failed(_) => ErrorClass::Other,
        }
    }
}

/// Evaluates rules against an item.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    async fn process(&self, item: &Item) -> Result<ProcessOutcome, ProcessError>;
}

/// Observe-only processor that logs every item.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingProcessor;

#[async_trait]
impl ItemProcessor for LoggingProcessor {
    async fn process(&self, item: &Item) -> Result<ProcessOutcome, ProcessError> {
        info!(
            community = %item.community,
            item = %item.id,
            author = %item.author,
            kind = ?item.kind,
            reports = item.moderation.num_reports,
            "Observed item"
        );
        Ok(ProcessOutcome::default())
    }
}
