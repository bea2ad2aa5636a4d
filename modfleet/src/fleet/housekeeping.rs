//! Moderator invites and history retention.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Result;

/// A pending moderator invite the bot should act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invite {
    pub community: String,
    pub expires_at: DateTime<Utc>,
    /// Run specification to install once the invite is accepted.
    /// Invites carrying one wait for an operator.
    #[serde(default)]
    pub initial_config: Option<String>,
}

impl Invite {
    pub fn new(community: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            community: community.into(),
            expires_at,
            initial_config: None,
        }
    }

    pub fn with_initial_config(mut self, config: impl Into<String>) -> Self {
        self.initial_config = Some(config.into());
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn auto_accept(&self) -> bool {
        self.initial_config.is_none()
    }
}

/// Split invites into the ones still pending and the ones that expired.
pub fn partition_expired(invites: Vec<Invite>, now: DateTime<Utc>) -> (Vec<Invite>, Vec<Invite>) {
    invites.into_iter().partition(|i| !i.is_expired(now))
}

/// Prunes stored processing history.
#[async_trait]
pub trait RetentionStore: Send + Sync {
    /// Remove history for `community` older than `retention_days`
    /// (store default when `None`).
    async fn retention_cleanup(&self, community: &str, retention_days: Option<u32>) -> Result<()>;
}

/// Store for deployments that keep no history.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRetentionStore;

#[async_trait]
impl RetentionStore for NoopRetentionStore {
    async fn retention_cleanup(&self, community: &str, retention_days: Option<u32>) -> Result<()> {
        debug!(community, ?retention_days, "No history to prune");
        Ok(())
    }
}
