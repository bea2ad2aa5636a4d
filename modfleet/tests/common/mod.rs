//! Shared fakes for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;

use modfleet::client::{
    Account, Item, ItemKind, ListingRequest, ModerationFlags, PlatformClient, SourceType,
};
use modfleet::config::{ConfigSnapshot, ConfigSource, FleetConfig};
use modfleet::error::ApiError;
use modfleet::fleet::{Fleet, FleetDeps, NoopRetentionStore};
use modfleet::manager::{ItemProcessor, ProcessError, ProcessOutcome};
use modfleet::notification::{Notification, NotificationEventType, Notifier};
use modfleet::{Error, Result};

pub fn submission(id: &str, community: &str) -> Item {
    submission_aged(id, community, chrono::Duration::hours(1))
}

pub fn submission_aged(id: &str, community: &str, age: chrono::Duration) -> Item {
    Item {
        id: id.to_string(),
        kind: ItemKind::Submission,
        community: community.to_string(),
        author: "someone".to_string(),
        created_at: Utc::now() - age,
        moderation: ModerationFlags::default(),
    }
}

/// Platform stand-in. Every listing of a source returns the same page
/// until it is replaced.
pub struct StubPlatform {
    pages: Mutex<HashMap<SourceType, Vec<Item>>>,
    items: Mutex<HashMap<String, Item>>,
    pub requests: Mutex<Vec<ListingRequest>>,
    remaining: AtomicU32,
    moderated: Mutex<Vec<String>>,
    pub accepted: Mutex<Vec<String>>,
}

impl StubPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pages: Mutex::new(HashMap::new()),
            items: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            remaining: AtomicU32::new(600),
            moderated: Mutex::new(Vec::new()),
            accepted: Mutex::new(Vec::new()),
        })
    }

    pub fn set_page(&self, source: SourceType, items: Vec<Item>) {
        self.pages.lock().insert(source, items);
    }

    /// Make `item` available to single-item lookups.
    pub fn add_item(&self, item: Item) {
        self.items.lock().insert(item.id.clone(), item);
    }

    pub fn set_remaining(&self, remaining: u32) {
        self.remaining.store(remaining, Ordering::SeqCst);
    }

    pub fn set_moderated(&self, names: &[&str]) {
        *self.moderated.lock() = names.iter().map(|n| n.to_string()).collect();
    }

    pub fn scopes_for(&self, source: SourceType) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.source == source)
            .map(|r| r.scope.clone())
            .collect()
    }
}

#[async_trait]
impl PlatformClient for StubPlatform {
    async fn list(&self, request: &ListingRequest) -> std::result::Result<Vec<Item>, ApiError> {
        self.requests.lock().push(request.clone());
        Ok(self
            .pages
            .lock()
            .get(&request.source)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_item(&self, id: &str) -> std::result::Result<Item, ApiError> {
        self.items
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::status(404, format!("{} not found", id)))
    }

    async fn get_me(&self) -> std::result::Result<Account, ApiError> {
        Ok(Account {
            name: "modbot".to_string(),
        })
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
        Utc::now() + chrono::Duration::minutes(10)
    }
}

#[derive(Default)]
pub struct MemoryConfigs {
    docs: Mutex<HashMap<String, String>>,
}

impl MemoryConfigs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, community: &str, json: &str) {
        self.docs
            .lock()
            .insert(community.to_ascii_lowercase(), json.to_string());
    }
}

#[async_trait]
impl ConfigSource for MemoryConfigs {
    async fn fetch(&self, community: &str) -> Result<ConfigSnapshot> {
        let raw = self
            .docs
            .lock()
            .get(&community.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| Error::config(format!("no run specification for {}", community)))?;
        ConfigSnapshot::from_json(raw.as_bytes())
    }
}

#[derive(Default)]
pub struct CollectingProcessor {
    pub seen: Mutex<Vec<String>>,
    /// When each item reached the processor.
    pub arrivals: Mutex<Vec<(String, Instant)>>,
    failure: Mutex<Option<ProcessError>>,
}

impl CollectingProcessor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_with(&self, failure: Option<ProcessError>) {
        *self.failure.lock() = failure;
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl ItemProcessor for CollectingProcessor {
    async fn process(&self, item: &Item) -> std::result::Result<ProcessOutcome, ProcessError> {
        if let Some(failure) = self.failure.lock().clone() {
            return Err(failure);
        }
        self.seen.lock().push(item.id.clone());
        self.arrivals.lock().push((item.id.clone(), Instant::now()));
        Ok(ProcessOutcome::default())
    }
}

#[derive(Default)]
pub struct CollectingNotifier {
    pub sent: Mutex<Vec<Notification>>,
}

impl CollectingNotifier {
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
}

#[async_trait]
impl Notifier for CollectingNotifier {
    async fn notify(&self, notification: Notification) {
        self.sent.lock().push(notification);
    }
}

pub struct TestFleet {
    pub platform: Arc<StubPlatform>,
    pub configs: Arc<MemoryConfigs>,
    pub processor: Arc<CollectingProcessor>,
    pub notifier: Arc<CollectingNotifier>,
    pub fleet: Arc<Fleet>,
}

/// Operator configuration without stagger delays.
pub fn fleet_config(shared: &str) -> FleetConfig {
    FleetConfig::from_json(&format!(
        r#"{{
            "polling": {{"shared": {}}},
            "timing": {{"stagger_ms": 0, "stream_start_spacing_ms": 0}},
            "logging": {{"file_output": false}}
        }}"#,
        shared
    ))
    .expect("valid test configuration")
}

pub fn setup_fleet(config: FleetConfig) -> TestFleet {
    let platform = StubPlatform::new();
    let configs = MemoryConfigs::new();
    let processor = CollectingProcessor::new();
    let notifier = CollectingNotifier::new();
    let fleet = Fleet::new(
        config,
        FleetDeps {
            client: platform.clone(),
            config_source: configs.clone(),
            processor: processor.clone(),
            notifier: notifier.clone(),
            retention: Arc::new(NoopRetentionStore),
        },
    );
    TestFleet {
        platform,
        configs,
        processor,
        notifier,
        fleet,
    }
}
