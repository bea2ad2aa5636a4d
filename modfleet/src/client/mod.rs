//! Platform API client seam.
//!
//! The engine never talks HTTP directly. Everything it needs from the platform
//! goes through [`PlatformClient`], which keeps the quota counters current as a
//! side effect of every call.

mod http;

pub use http::{HttpClientConfig, HttpPlatformClient};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Listing endpoints the engine can poll.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum SourceType {
    Unmoderated,
    Modqueue,
    #[serde(alias = "newSub")]
    #[strum(to_string = "newSubmissions", serialize = "newSub")]
    NewSubmissions,
    #[serde(alias = "newComm")]
    #[strum(to_string = "newComments", serialize = "newComm")]
    NewComments,
}

impl SourceType {
    pub const ALL: [SourceType; 4] = [
        SourceType::Unmoderated,
        SourceType::Modqueue,
        SourceType::NewSubmissions,
        SourceType::NewComments,
    ];

    /// Moderator listings cover every moderated community through one scope.
    pub fn is_moderator_scoped(self) -> bool {
        matches!(self, SourceType::Unmoderated | SourceType::Modqueue)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Submission,
    Comment,
}

/// Moderation-relevant state reported with an item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationFlags {
    pub approved: bool,
    pub removed: bool,
    pub spam: bool,
    pub num_reports: u32,
}

/// A submission or comment returned by a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Stable platform identifier (fullname, e.g. `t3_abc123`).
    pub id: String,
    pub kind: ItemKind,
    pub community: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub moderation: ModerationFlags,
}

impl Item {
    /// Age of the item relative to `now`, clamped at zero.
    pub fn age_at(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }
}

/// One listing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRequest {
    pub source: SourceType,
    /// Community scope: a name, several names joined with `+`, or `mod`.
    pub scope: String,
    pub limit: u32,
}

/// The account the credential belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
}

/// Operations the engine needs from the platform.
///
/// Implementations update the remaining-quota counter and reset time from
/// every response; callers only ever read them.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Newest-first page of items for a listing.
    async fn list(&self, request: &ListingRequest) -> Result<Vec<Item>, ApiError>;

    /// Re-fetch one item by identifier.
    async fn fetch_item(&self, id: &str) -> Result<Item, ApiError>;

    async fn get_me(&self) -> Result<Account, ApiError>;

    /// Display names of every community the account moderates.
    async fn moderated_communities(&self) -> Result<Vec<String>, ApiError>;

    async fn accept_moderator_invite(&self, community: &str) -> Result<(), ApiError>;

    fn remaining_quota(&self) -> u32;

    fn quota_reset_at(&self) -> DateTime<Utc>;
}
