//! In-memory collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::client::{Account, Item, ItemKind, ListingRequest, ModerationFlags, PlatformClient, SourceType};
use crate::config::{ConfigSnapshot, ConfigSource, content_hash};
use crate::error::ApiError;
use crate::manager::{ItemProcessor, ProcessError, ProcessOutcome};
use crate::notification::{Notification, NotificationEventType, Notifier};
use crate::{Error, Result};

pub fn item(id: &str, community: &str) -> Item {
    item_aged(id, community, chrono::Duration::hours(1))
}

pub fn item_aged(id: &str, community: &str, age: chrono::Duration) -> Item {
    Item {
        id: id.to_string(),
        kind: ItemKind::Submission,
        community: community.to_string(),
        author: "author".to_string(),
        created_at: Utc::now() - age,
        moderation: ModerationFlags::default(),
    }
}

/// Scripted platform client.
///
/// Listing responses are queued per source; the last queued response repeats.
pub struct FakeClient {
    listings: Mutex<HashMap<SourceType, VecDeque<std::result::Result<Vec<Item>, ApiError>>>>,
    pub requests: Mutex<Vec<ListingRequest>>,
    items: Mutex<HashMap<String, Item>>,
    latency: Mutex<Duration>,
    remaining: AtomicU32,
    reset_at: Mutex<DateTime<Utc>>,
    me: Mutex<std::result::Result<Account, ApiError>>,
    pub me_calls: AtomicUsize,
    moderated: Mutex<Vec<String>>,
    pub accepted: Mutex<Vec<String>>,
}

impl FakeClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listings: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            items: Mutex::new(HashMap::new()),
            latency: Mutex::new(Duration::ZERO),
            remaining: AtomicU32::new(600),
            reset_at: Mutex::new(Utc::now() + chrono::Duration::minutes(10)),
            me: Mutex::new(Ok(Account {
                name: "modbot".to_string(),
            })),
            me_calls: AtomicUsize::new(0),
            moderated: Mutex::new(Vec::new()),
            accepted: Mutex::new(Vec::new()),
        })
    }

    pub fn push_listing(&self, source: SourceType, items: Vec<Item>) {
        self.listings.lock().entry(source).or_default().push_back(Ok(items));
    }

    pub fn push_error(&self, source: SourceType, err: ApiError) {
        self.listings.lock().entry(source).or_default().push_back(Err(err));
    }

    pub fn add_item(&self, item: Item) {
        self.items.lock().insert(item.id.clone(), item);
    }

    /// Delay every listing response by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn set_remaining(&self, remaining: u32) {
        self.remaining.store(remaining, Ordering::SeqCst);
    }

    pub fn set_reset_at(&self, at: DateTime<Utc>) {
        *self.reset_at.lock() = at;
    }

    pub fn set_me(&self, me: std::result::Result<Account, ApiError>) {
        *self.me.lock() = me;
    }

    pub fn set_moderated(&self, names: &[&str]) {
        *self.moderated.lock() = names.iter().map(|n| n.to_string()).collect();
    }

    pub fn requests_for(&self, source: SourceType) -> Vec<ListingRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.source == source)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PlatformClient for FakeClient {
    async fn list(&self, request: &ListingRequest) -> std::result::Result<Vec<Item>, ApiError> {
        self.requests.lock().push(request.clone());
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut listings = self.listings.lock();
        let Some(queue) = listings.get_mut(&request.source) else {
            return Ok(Vec::new());
        };
        if queue.len() > 1 {
            queue.pop_front().unwrap_or(Ok(Vec::new()))
        } else {
            queue.front().cloned().unwrap_or(Ok(Vec::new()))
        }
    }

    async fn fetch_item(&self, id: &str) -> std::result::Result<Item, ApiError> {
        self.items
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::status(404, format!("{} not found", id)))
    }

    async fn get_me(&self) -> std::result::Result<Account, ApiError> {
        self.me_calls.fetch_add(1, Ordering::SeqCst);
        self.me.lock().clone()
    }

    async fn moderated_communities(&self) -> std::result::Result<Vec<String>, ApiError> {
        Ok(self.moderated.lock().clone())
    }

    async fn accept_moderator_invite(&self, community: &str) -> std::result::Result<(), ApiError> {
        self.accepted.lock().push(community.to_string());
        Ok(())
    }

    fn remaining_quota(&self) -> u32 {
        self.remaining.load(Ordering::SeqCst)
    }

    fn quota_reset_at(&self) -> DateTime<Utc> {
        *self.reset_at.lock()
    }
}

/// Run specifications held in memory, keyed by lowercased community.
#[derive(Default)]
pub struct FakeConfigSource {
    docs: Mutex<HashMap<String, String>>,
}

impl FakeConfigSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, community: &str, json: &str) {
        self.docs
            .lock()
            .insert(community.to_ascii_lowercase(), json.to_string());
    }

    pub fn remove(&self, community: &str) {
        self.docs.lock().remove(&community.to_ascii_lowercase());
    }
}

#[async_trait]
impl ConfigSource for FakeConfigSource {
    async fn fetch(&self, community: &str) -> Result<ConfigSnapshot> {
        let raw = self
            .docs
            .lock()
            .get(&community.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| Error::config(format!("no run specification for {}", community)))?;
        let snapshot = ConfigSnapshot::from_json(raw.as_bytes())?;
        debug_assert_eq!(snapshot.hash, content_hash(raw.as_bytes()));
        Ok(snapshot)
    }
}

/// Records processed items; optionally fails every call.
#[derive(Default)]
pub struct RecordingProcessor {
    pub processed: Mutex<Vec<Item>>,
    fail_with: Mutex<Option<ProcessError>>,
}

impl RecordingProcessor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_with(&self, err: Option<ProcessError>) {
        *self.fail_with.lock() = err;
    }

    pub fn ids(&self) -> Vec<String> {
        self.processed.lock().iter().map(|i| i.id.clone()).collect()
    }
}

#[async_trait]
impl ItemProcessor for RecordingProcessor {
    async fn process(&self, item: &Item) -> std::result::Result<ProcessOutcome, ProcessError> {
        if let Some(err) = self.fail_with.lock().clone() {
            return Err(err);
        }
        self.processed.lock().push(item.clone());
        Ok(ProcessOutcome {
            api_calls: 1,
            triggered: false,
        })
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self, event_type: NotificationEventType) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|n| n.event_type == event_type)
            .count()
    }

    pub fn titles(&self) -> Vec<String> {
        self.sent.lock().iter().map(|n| n.title.clone()).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) {
        self.sent.lock().push(notification);
    }
}
