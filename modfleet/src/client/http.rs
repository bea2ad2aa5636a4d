//! reqwest-backed [`PlatformClient`].
//!
//! Authenticates with a pre-issued bearer token and tracks the quota headers
//! (`x-ratelimit-remaining`, `x-ratelimit-reset`) of every response.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use reqwest::header::{AUTHORIZATION, HeaderMap, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, trace, warn};
use url::Url;

use super::{Account, Item, ItemKind, ListingRequest, ModerationFlags, PlatformClient, SourceType};
use crate::error::ApiError;

const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_HEADER: &str = "x-ratelimit-reset";

/// Quota assumed before the first response arrives.
const INITIAL_QUOTA: u32 = 600;

/// Page size for moderated-community enumeration.
const MODERATED_PAGE_SIZE: u32 = 100;

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Connection settings for [`HttpPlatformClient`].
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub user_agent: String,
    pub access_token: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
struct QuotaState {
    remaining: u32,
    reset_at: DateTime<Utc>,
}

pub struct HttpPlatformClient {
    http: reqwest::Client,
    base_url: Url,
    access_token: String,
    quota: RwLock<QuotaState>,
}

impl HttpPlatformClient {
    pub fn new(config: HttpClientConfig) -> crate::Result<Self> {
        install_rustls_provider();

        let base_url = Url::parse(&config.base_url)
            .map_err(|e| crate::Error::config(format!("invalid base_url: {}", e)))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            config
                .user_agent
                .parse()
                .map_err(|e| crate::Error::config(format!("invalid user_agent: {}", e)))?,
        );

        let mut builder = reqwest::Client::builder().default_headers(headers);
        if config.timeout > Duration::ZERO {
            builder = builder.timeout(config.timeout);
        }
        let http = builder
            .build()
            .map_err(|e| crate::Error::Other(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            access_token: config.access_token,
            quota: RwLock::new(QuotaState {
                remaining: INITIAL_QUOTA,
                reset_at: Utc::now(),
            }),
        })
    }

    /// Issue one authenticated request and decode the JSON body.
    pub async fn issue_request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| ApiError::other(format!("invalid request path {}: {}", path, e)))?;

        trace!(%method, %url, "Issuing platform request");
        let response = self
            .http
            .request(method, url)
            .header(AUTHORIZATION, format!("Bearer {}", self.access_token))
            .query(&[("raw_json", "1")])
            .query(query)
            .send()
            .await?;

        self.record_quota(response.headers());

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ApiError::rate_limited(format!(
                "{} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("rate limited")
            )));
        }
        if !status.is_success() {
            return Err(ApiError::status(
                status.as_u16(),
                format!("{} for {}", status, path),
            ));
        }

        response.json::<T>().await.map_err(ApiError::from)
    }

    fn record_quota(&self, headers: &HeaderMap) {
        let remaining = headers
            .get(REMAINING_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<f64>().ok());
        let reset_secs = headers
            .get(RESET_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok());

        if remaining.is_none() && reset_secs.is_none() {
            return;
        }

        let mut quota = self.quota.write();
        if let Some(remaining) = remaining {
            quota.remaining = remaining.max(0.0).floor() as u32;
        }
        if let Some(secs) = reset_secs {
            quota.reset_at = Utc::now() + chrono::Duration::seconds(secs);
        }
    }

    fn listing_path(request: &ListingRequest) -> String {
        match request.source {
            SourceType::Unmoderated => format!("r/{}/about/unmoderated", request.scope),
            SourceType::Modqueue => format!("r/{}/about/modqueue", request.scope),
            SourceType::NewSubmissions => format!("r/{}/new", request.scope),
            SourceType::NewComments => format!("r/{}/comments", request.scope),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Listing<T> {
    data: ListingData<T>,
}

#[derive(Debug, Deserialize)]
struct ListingData<T> {
    #[serde(default = "Vec::new")]
    children: Vec<Thing<T>>,
    #[serde(default)]
    after: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Thing<T> {
    kind: String,
    data: T,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    name: String,
    subreddit: String,
    #[serde(default)]
    author: String,
    created_utc: f64,
    #[serde(default)]
    approved: bool,
    #[serde(default)]
    removed: bool,
    #[serde(default)]
    spam: bool,
    #[serde(default)]
    num_reports: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawCommunity {
    display_name: String,
}

fn convert_item(thing: Thing<RawItem>) -> Option<Item> {
    let kind = match thing.kind.as_str() {
        "t3" => ItemKind::Submission,
        "t1" => ItemKind::Comment,
        other => {
            warn!(kind = other, "Skipping listing entry of unexpected kind");
            return None;
        }
    };
    let raw = thing.data;
    let created_at = Utc
        .timestamp_opt(raw.created_utc.floor() as i64, 0)
        .single()?;
    Some(Item {
        id: raw.name,
        kind,
        community: raw.subreddit,
        author: raw.author,
        created_at,
        moderation: ModerationFlags {
            approved: raw.approved,
            removed: raw.removed,
            spam: raw.spam,
            num_reports: raw.num_reports.unwrap_or(0),
        },
    })
}

#[async_trait]
impl PlatformClient for HttpPlatformClient {
    async fn list(&self, request: &ListingRequest) -> Result<Vec<Item>, ApiError> {
        let listing: Listing<RawItem> = self
            .issue_request(
                Method::GET,
                &Self::listing_path(request),
                &[("limit", request.limit.to_string())],
            )
            .await?;
        Ok(listing
            .data
            .children
            .into_iter()
            .filter_map(convert_item)
            .collect())
    }

    async fn fetch_item(&self, id: &str) -> Result<Item, ApiError> {
        let listing: Listing<RawItem> = self
            .issue_request(Method::GET, "api/info", &[("id", id.to_string())])
            .await?;
        listing
            .data
            .children
            .into_iter()
            .find_map(convert_item)
            .ok_or_else(|| ApiError::status(404, format!("item {} not found", id)))
    }

    async fn get_me(&self) -> Result<Account, ApiError> {
        self.issue_request(Method::GET, "api/v1/me", &[]).await
    }

    async fn moderated_communities(&self) -> Result<Vec<String>, ApiError> {
        let mut names = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let mut query = vec![("limit", MODERATED_PAGE_SIZE.to_string())];
            if let Some(cursor) = &after {
                query.push(("after", cursor.clone()));
            }
            let page: Listing<RawCommunity> = self
                .issue_request(Method::GET, "subreddits/mine/moderator", &query)
                .await?;
            names.extend(page.data.children.into_iter().map(|t| t.data.display_name));
            match page.data.after {
                Some(next) => after = Some(next),
                None => break,
            }
        }
        Ok(names)
    }

    async fn accept_moderator_invite(&self, community: &str) -> Result<(), ApiError> {
        let _: serde_json::Value = self
            .issue_request(
                Method::POST,
                &format!("r/{}/api/accept_moderator_invite", community),
                &[("api_type", "json".to_string())],
            )
            .await?;
        Ok(())
    }

    fn remaining_quota(&self) -> u32 {
        self.quota.read().remaining
    }

    fn quota_reset_at(&self) -> DateTime<Utc> {
        self.quota.read().reset_at
    }
}
