//! Per-community manager.
//!
//! A [`Manager`] owns one community's worker queue, its own (non-shared)
//! polling streams, its run states, its configuration snapshot and its guest
//! grants. Processing results are reported back to the fleet over a channel.

mod processor;
mod queue;
mod registry;
mod run_state;
mod usage;

pub use processor::{ItemProcessor, LoggingProcessor, ProcessError, ProcessOutcome};
pub use queue::{ItemHandler, WorkerQueue};
pub use registry::ManagerRegistry;
pub use run_state::{CausedBy, RunState, RunStates, RunStatus, Subsystem};
pub use usage::{UsageSnapshot, UsageTracker};

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::{Item, ListingRequest, PlatformClient, SourceType};
use crate::config::{ConfigSource, PollSubscription, PollingDefaults, RunSpec};
use crate::notification::{Notification, NotificationEventType, NotificationSeverity, Notifier};
use crate::retry::{RetryBudget, RetryBudgetConfig};
use crate::stream::{ContinuityHandle, PollStream, PollStreamConfig, StreamEvent};
use crate::{Error, Result};

/// Collaborators and operator settings every manager needs.
#[derive(Clone)]
pub struct ManagerContext {
    pub client: Arc<dyn PlatformClient>,
    pub config_source: Arc<dyn ConfigSource>,
    pub processor: Arc<dyn ItemProcessor>,
    pub notifier: Arc<dyn Notifier>,
    pub reports: mpsc::UnboundedSender<ManagerReport>,
    pub polling: PollingDefaults,
    /// Operator cap on concurrent processing.
    pub max_workers: usize,
    pub stream_retry: RetryBudgetConfig,
}

/// Processing results sent to the fleet.
#[derive(Debug, Clone)]
pub enum ManagerReport {
    Processed {
        community: String,
    },
    Failed {
        community: String,
        item_id: String,
        error: ProcessError,
    },
}

/// Who asks for a state change and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub caused_by: CausedBy,
    pub reason: Option<String>,
    /// Skip notifications for this change.
    pub suppress: bool,
}

impl StateChange {
    pub fn system() -> Self {
        Self {
            caused_by: CausedBy::System,
            reason: None,
            suppress: false,
        }
    }

    pub fn user() -> Self {
        Self {
            caused_by: CausedBy::User,
            ..Self::system()
        }
    }

    pub fn by(caused_by: CausedBy) -> Self {
        Self {
            caused_by,
            ..Self::system()
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn suppressed(mut self) -> Self {
        self.suppress = true;
        self
    }
}

/// Temporary access grant to a community's controls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guest {
    pub user: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ConfigState {
    hash: Option<String>,
    /// Last known good specification.
    spec: Option<RunSpec>,
    subscriptions: Vec<PollSubscription>,
    last_error: Option<String>,
}

struct OwnStream {
    source: SourceType,
    stream: Arc<PollStream>,
}

#[derive(Default)]
struct OwnStreams {
    running: Vec<OwnStream>,
    parked: HashMap<SourceType, ContinuityHandle>,
}

pub struct Manager {
    community: String,
    ctx: ManagerContext,
    states: Mutex<RunStates>,
    queue: WorkerQueue,
    config: Mutex<ConfigState>,
    streams: Mutex<OwnStreams>,
    stream_retry: Arc<RetryBudget>,
    guests: Mutex<Vec<Guest>>,
    usage: Arc<UsageTracker>,
    self_ref: Weak<Manager>,
}

impl Manager {
    /// Create a stopped manager. Call [`parse_configuration`](Self::parse_configuration)
    /// before starting it.
    pub fn new(community: impl Into<String>, ctx: ManagerContext) -> Arc<Self> {
        let community = community.into();
        let usage = Arc::new(UsageTracker::new());
        let handler = processing_handler(&community, &ctx, usage.clone());
        let queue = WorkerQueue::new(community.clone(), ctx.max_workers, handler);
        let stream_retry = Arc::new(RetryBudget::new(
            format!("{} streams", community),
            ctx.stream_retry.clone(),
        ));

        Arc::new_cyclic(|self_ref| Self {
            community,
            ctx,
            states: Mutex::new(RunStates::default()),
            queue,
            config: Mutex::new(ConfigState::default()),
            streams: Mutex::new(OwnStreams::default()),
            stream_retry,
            guests: Mutex::new(Vec::new()),
            usage,
            self_ref: self_ref.clone(),
        })
    }

    pub fn community(&self) -> &str {
        &self.community
    }

    pub fn states(&self) -> RunStates {
        self.states.lock().clone()
    }

    pub fn state(&self, subsystem: Subsystem) -> RunState {
        self.states.lock().get(subsystem).clone()
    }

    pub fn manager_state(&self) -> RunState {
        self.states.lock().manager.clone()
    }

    pub fn queue(&self) -> &WorkerQueue {
        &self.queue
    }

    // --- configuration ---

    /// Fetch and apply the community's run specification.
    ///
    /// Returns `Ok(false)` when the content is unchanged and `force` is not
    /// set. An invalid specification leaves the last known good one in place.
    pub async fn parse_configuration(&self, force: bool) -> Result<bool> {
        let snapshot = match self.ctx.config_source.fetch(&self.community).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.config_failed(&e).await;
                return Err(e);
            }
        };

        {
            let config = self.config.lock();
            if !force && config.hash.as_deref() == Some(snapshot.hash.as_str()) {
                debug!(community = %self.community, "Configuration unchanged");
                return Ok(false);
            }
        }

        if let Err(e) = snapshot.spec.validate() {
            self.config_failed(&e).await;
            return Err(e);
        }

        let subscriptions = snapshot
            .spec
            .subscriptions(&self.community, &self.ctx.polling);
        let workers = snapshot.spec.effective_workers(self.ctx.max_workers);
        {
            let mut config = self.config.lock();
            config.hash = Some(snapshot.hash);
            config.spec = Some(snapshot.spec);
            config.subscriptions = subscriptions;
            config.last_error = None;
        }
        self.queue.set_max_workers(workers);

        info!(community = %self.community, workers, "Configuration applied");
        Ok(true)
    }

    async fn config_failed(&self, err: &Error) {
        let keeps_previous = {
            let mut config = self.config.lock();
            config.last_error = Some(err.to_string());
            config.spec.is_some()
        };
        warn!(
            community = %self.community,
            error = %err,
            keeps_previous,
            "Configuration could not be loaded"
        );

        let body = if keeps_previous {
            format!("{}. The last valid configuration stays in use.", err)
        } else {
            err.to_string()
        };
        self.ctx
            .notifier
            .notify(
                Notification::new(NotificationEventType::ConfigInvalid, "Configuration Invalid", body)
                    .for_community(&self.community)
                    .severity(NotificationSeverity::Warn),
            )
            .await;
    }

    pub fn has_valid_config(&self) -> bool {
        self.config.lock().spec.is_some()
    }

    pub fn config_error(&self) -> Option<String> {
        self.config.lock().last_error.clone()
    }

    pub fn run_spec(&self) -> Option<RunSpec> {
        self.config.lock().spec.clone()
    }

    pub fn subscriptions(&self) -> Vec<PollSubscription> {
        self.config.lock().subscriptions.clone()
    }

    /// Whether this manager takes `source` from the fleet's shared stream.
    pub fn subscribes_shared(&self, source: SourceType) -> bool {
        self.ctx.polling.is_shared(source)
            && self
                .config
                .lock()
                .subscriptions
                .iter()
                .any(|s| s.source == source && s.uses_defaults)
    }

    pub fn shared_sources(&self) -> Vec<SourceType> {
        SourceType::ALL
            .into_iter()
            .filter(|s| self.subscribes_shared(*s))
            .collect()
    }

    fn own_subscriptions(&self) -> Vec<PollSubscription> {
        self.config
            .lock()
            .subscriptions
            .iter()
            .filter(|s| !(s.uses_defaults && self.ctx.polling.is_shared(s.source)))
            .cloned()
            .collect()
    }

    // --- queue ---

    pub async fn start_queue(&self, change: StateChange) {
        self.queue.set_status(RunStatus::Running);
        self.set_state(Subsystem::Queue, RunStatus::Running, change)
            .await;
    }

    pub async fn pause_queue(&self, change: StateChange) {
        self.queue.set_status(RunStatus::Paused);
        self.set_state(Subsystem::Queue, RunStatus::Paused, change)
            .await;
    }

    /// Stop processing and discard buffered items.
    pub async fn stop_queue(&self, change: StateChange) {
        self.queue.set_status(RunStatus::Stopped);
        self.set_state(Subsystem::Queue, RunStatus::Stopped, change)
            .await;
    }

    // --- events ---

    /// (Re)build this community's own streams and start receiving events.
    pub async fn start_events(&self, change: StateChange) -> Result<()> {
        if !self.has_valid_config() {
            return Err(Error::config(format!(
                "{} has no valid configuration",
                self.community
            )));
        }

        let subscriptions = self.own_subscriptions();
        {
            let mut streams = self.streams.lock();
            park_running(&mut streams, "restarting");

            for sub in subscriptions {
                let continuity = streams.parked.remove(&sub.source);
                let stream = Arc::new(PollStream::new(
                    PollStreamConfig {
                        label: format!("{} ({})", sub.source, self.community),
                        request: ListingRequest {
                            source: sub.source,
                            scope: self.community.clone(),
                            limit: sub.limit,
                        },
                        interval: sub.interval,
                        delay_until: sub.delay_until,
                    },
                    self.ctx.client.clone(),
                    self.stream_retry.clone(),
                    continuity,
                    self.ctx.polling.continuity_cap,
                ));
                if let Some(rx) = stream.start() {
                    tokio::spawn(own_stream_events(
                        self.self_ref.clone(),
                        sub.source,
                        rx,
                    ));
                }
                streams.running.push(OwnStream {
                    source: sub.source,
                    stream,
                });
            }
        }

        self.set_state(Subsystem::Events, RunStatus::Running, change)
            .await;
        Ok(())
    }

    pub async fn pause_events(&self, change: StateChange) {
        self.end_own_streams("events paused");
        self.set_state(Subsystem::Events, RunStatus::Paused, change)
            .await;
    }

    pub async fn stop_events(&self, change: StateChange) {
        self.end_own_streams("events stopped");
        self.set_state(Subsystem::Events, RunStatus::Stopped, change)
            .await;
    }

    fn end_own_streams(&self, reason: &str) {
        park_running(&mut self.streams.lock(), reason);
    }

    /// Sources this manager currently polls itself.
    pub fn own_stream_sources(&self) -> Vec<SourceType> {
        self.streams
            .lock()
            .running
            .iter()
            .map(|s| s.source)
            .collect()
    }

    // --- whole manager ---

    pub async fn start(&self, change: StateChange) -> Result<()> {
        if !self.has_valid_config() {
            return Err(Error::config(format!(
                "{} has no valid configuration",
                self.community
            )));
        }
        self.start_queue(change.clone()).await;
        self.start_events(change).await
    }

    pub async fn stop(&self, change: StateChange) {
        self.stop_events(change.clone()).await;
        self.stop_queue(change).await;
    }

    /// Stop everything and shut the worker queue down for good.
    pub async fn destroy(&self, reason: &str) {
        info!(community = %self.community, reason, "Destroying manager");
        self.stop(StateChange::system().reason(reason)).await;
        self.queue.shutdown().await;
    }

    /// Hand an item to the worker queue.
    ///
    /// Dropped (and logged) unless the queue is running.
    pub fn intake(&self, item: Item) -> bool {
        self.usage.record_event();
        let queue_state = self.state(Subsystem::Queue);
        if !queue_state.is_running() {
            debug!(
                community = %self.community,
                item = %item.id,
                queue = %queue_state.status,
                "Dropping item because the queue is not running"
            );
            return false;
        }
        self.queue.push(item)
    }

    // --- slow mode and usage ---

    pub fn set_delay(&self, delay: Option<Duration>) {
        if self.queue.delay() != delay {
            info!(community = %self.community, delay = ?delay, "Slow mode changed");
        }
        self.queue.set_delay(delay);
    }

    pub fn delay(&self) -> Option<Duration> {
        self.queue.delay()
    }

    pub fn sample_usage(&self, period: Duration) -> UsageSnapshot {
        self.usage.sample(period)
    }

    pub fn usage(&self) -> UsageSnapshot {
        self.usage.snapshot()
    }

    // --- guests ---

    pub fn add_guest(&self, user: impl Into<String>, expires_at: DateTime<Utc>) {
        let user = user.into();
        let mut guests = self.guests.lock();
        match guests.iter_mut().find(|g| g.user.eq_ignore_ascii_case(&user)) {
            Some(existing) => existing.expires_at = expires_at,
            None => guests.push(Guest { user, expires_at }),
        }
    }

    pub fn remove_guest(&self, user: &str) -> bool {
        let mut guests = self.guests.lock();
        let before = guests.len();
        guests.retain(|g| !g.user.eq_ignore_ascii_case(user));
        guests.len() != before
    }

    /// Drop expired grants and return the users removed.
    pub fn remove_expired_guests(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut removed = Vec::new();
        self.guests.lock().retain(|g| {
            if g.expires_at <= now {
                removed.push(g.user.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            info!(community = %self.community, users = ?removed, "Removed expired guests");
        }
        removed
    }

    pub fn guests(&self) -> Vec<Guest> {
        self.guests.lock().clone()
    }

    async fn set_state(&self, subsystem: Subsystem, status: RunStatus, change: StateChange) {
        let (previous, manager_change) = {
            let mut states = self.states.lock();
            let previous = states.get(subsystem).clone();
            let manager_change = states.set(
                subsystem,
                RunState::new(status, change.caused_by, change.reason.clone()),
            );
            (previous, manager_change)
        };

        if previous.status == status {
            return;
        }
        info!(
            community = %self.community,
            subsystem = %subsystem,
            from = %previous.status,
            to = %status,
            caused_by = %change.caused_by,
            reason = change.reason.as_deref().unwrap_or("-"),
            "Run state changed"
        );
        if change.suppress {
            return;
        }

        let reason = change
            .reason
            .as_deref()
            .map(|r| format!(" ({})", r))
            .unwrap_or_default();
        let mut title = format!("{} {}", capitalize(&subsystem.to_string()), status);
        let mut body = format!("{} is now {}{}", subsystem, status, reason);
        if let Some(manager) = manager_change {
            title = format!("Manager {}", manager.status);
            body = format!("{}; manager is now {}", body, manager.status);
        }
        let severity = match status {
            RunStatus::Running => NotificationSeverity::Info,
            _ => NotificationSeverity::Warn,
        };

        self.ctx
            .notifier
            .notify(
                Notification::new(NotificationEventType::RunStateChanged, title, body)
                    .for_community(&self.community)
                    .caused_by(change.caused_by)
                    .severity(severity),
            )
            .await;
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("community", &self.community)
            .field("states", &self.states())
            .finish()
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn park_running(streams: &mut OwnStreams, reason: &str) {
    for own in std::mem::take(&mut streams.running) {
        let continuity = own.stream.end(reason);
        streams.parked.insert(own.source, continuity);
    }
}

fn processing_handler(
    community: &str,
    ctx: &ManagerContext,
    usage: Arc<UsageTracker>,
) -> ItemHandler {
    let community = community.to_string();
    let processor = ctx.processor.clone();
    let reports = ctx.reports.clone();

    Arc::new(move |item: Item| {
        let community = community.clone();
        let processor = processor.clone();
        let reports = reports.clone();
        let usage = usage.clone();
        Box::pin(async move {
            let report = match processor.process(&item).await {
                Ok(outcome) => {
                    usage.record_api_calls(outcome.api_calls);
                    debug!(
                        community = %community,
                        item = %item.id,
                        triggered = outcome.triggered,
                        "Processed item"
                    );
                    ManagerReport::Processed { community }
                }
                Err(error) => {
                    warn!(community = %community, item = %item.id, error = %error, "Processing failed");
                    ManagerReport::Failed {
                        community,
                        item_id: item.id,
                        error,
                    }
                }
            };
            // the fleet may already be gone during shutdown
            let _ = reports.send(report);
        })
    })
}

/// Feed a manager's own stream into its queue.
async fn own_stream_events(
    manager: Weak<Manager>,
    source: SourceType,
    mut rx: mpsc::UnboundedReceiver<StreamEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(manager) = manager.upgrade() else { break };
        match event {
            StreamEvent::Listing(items) => {
                for item in items {
                    manager.intake(item);
                }
            }
            StreamEvent::Error(err) => {
                manager
                    .ctx
                    .notifier
                    .notify(
                        Notification::new(
                            NotificationEventType::PollingStopped,
                            format!("{} Polling Stopped", source.to_string().to_ascii_uppercase()),
                            format!("Polling stopped after repeated errors: {}", err),
                        )
                        .for_community(manager.community())
                        .severity(NotificationSeverity::Warn),
                    )
                    .await;
                manager
                    .stop_events(
                        StateChange::system().reason(format!("{} polling stopped", source)),
                    )
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeClient, FakeConfigSource, RecordingNotifier, RecordingProcessor, item};

    struct Harness {
        client: Arc<FakeClient>,
        configs: Arc<FakeConfigSource>,
        processor: Arc<RecordingProcessor>,
        notifier: Arc<RecordingNotifier>,
        reports: mpsc::UnboundedReceiver<ManagerReport>,
        ctx: ManagerContext,
    }

    fn harness(polling: PollingDefaults) -> Harness {
        let client = FakeClient::new();
        let configs = FakeConfigSource::new();
        let processor = RecordingProcessor::new();
        let notifier = RecordingNotifier::new();
        let (tx, reports) = mpsc::unbounded_channel();
        let ctx = ManagerContext {
            client: client.clone(),
            config_source: configs.clone(),
            processor: processor.clone(),
            notifier: notifier.clone(),
            reports: tx,
            polling,
            max_workers: 4,
            stream_retry: RetryBudgetConfig::default(),
        };
        Harness {
            client,
            configs,
            processor,
            notifier,
            reports,
            ctx,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_parse_configuration_detects_changes() {
        let h = harness(PollingDefaults::default());
        h.configs
            .set("pics", r#"{"polling": ["unmoderated"], "max_workers": 8}"#);
        let manager = Manager::new("pics", h.ctx.clone());

        assert!(manager.parse_configuration(false).await.unwrap());
        assert!(!manager.parse_configuration(false).await.unwrap());
        assert!(manager.parse_configuration(true).await.unwrap());
        // capped by the operator
        assert_eq!(manager.queue().max_workers(), 4);

        h.configs.set("pics", r#"{"polling": ["modqueue"]}"#);
        assert!(manager.parse_configuration(false).await.unwrap());
        assert_eq!(manager.subscriptions()[0].source, SourceType::Modqueue);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_configuration_keeps_last_known_good() {
        let h = harness(PollingDefaults::default());
        h.configs.set("pics", r#"{"polling": ["modqueue"]}"#);
        let manager = Manager::new("pics", h.ctx.clone());
        manager.parse_configuration(true).await.unwrap();

        h.configs.set("pics", r#"{"polling": []}"#);
        assert!(manager.parse_configuration(false).await.is_err());
        assert!(manager.has_valid_config());
        assert!(manager.config_error().is_some());
        assert_eq!(manager.subscriptions()[0].source, SourceType::Modqueue);
        assert_eq!(h.notifier.count(NotificationEventType::ConfigInvalid), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_requires_valid_config() {
        let h = harness(PollingDefaults::default());
        let manager = Manager::new("pics", h.ctx.clone());
        assert!(manager.parse_configuration(true).await.is_err());
        assert!(manager.start(StateChange::system()).await.is_err());
        assert_eq!(manager.manager_state().status, RunStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_stream_feeds_queue() {
        let mut h = harness(PollingDefaults::default());
        h.configs.set("pics", r#"{"polling": ["newSubmissions"]}"#);
        h.client
            .push_listing(SourceType::NewSubmissions, vec![item("a", "pics")]);
        h.client.push_listing(
            SourceType::NewSubmissions,
            vec![item("b", "pics"), item("a", "pics")],
        );

        let manager = Manager::new("pics", h.ctx.clone());
        manager.parse_configuration(true).await.unwrap();
        manager.start(StateChange::system()).await.unwrap();
        assert!(manager.manager_state().is_running());
        assert_eq!(manager.own_stream_sources(), vec![SourceType::NewSubmissions]);

        match h.reports.recv().await {
            Some(ManagerReport::Processed { community }) => assert_eq!(community, "pics"),
            other => panic!("unexpected report: {:?}", other),
        }
        assert_eq!(h.processor.ids(), vec!["b"]);
        let request = &h.client.requests_for(SourceType::NewSubmissions)[0];
        assert_eq!(request.scope, "pics");
        assert_eq!(request.limit, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_subscriptions_are_not_polled_by_manager() {
        let polling = PollingDefaults {
            shared: vec![SourceType::Modqueue],
            ..PollingDefaults::default()
        };
        let h = harness(polling);
        h.configs.set(
            "pics",
            r#"{"polling": ["modqueue", {"source": "unmoderated", "limit": 10}]}"#,
        );
        let manager = Manager::new("pics", h.ctx.clone());
        manager.parse_configuration(true).await.unwrap();

        assert!(manager.subscribes_shared(SourceType::Modqueue));
        assert!(!manager.subscribes_shared(SourceType::Unmoderated));
        assert_eq!(manager.shared_sources(), vec![SourceType::Modqueue]);

        manager.start(StateChange::system()).await.unwrap();
        assert_eq!(manager.own_stream_sources(), vec![SourceType::Unmoderated]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_intake_respects_queue_state() {
        let h = harness(PollingDefaults::default());
        h.configs.set("pics", r#"{"polling": ["unmoderated"]}"#);
        let manager = Manager::new("pics", h.ctx.clone());
        manager.parse_configuration(true).await.unwrap();

        assert!(!manager.intake(item("a", "pics")));
        manager.start_queue(StateChange::system()).await;
        assert!(manager.intake(item("b", "pics")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_changes_are_tagged_and_notified() {
        let h = harness(PollingDefaults::default());
        h.configs.set("pics", r#"{"polling": ["unmoderated"]}"#);
        let manager = Manager::new("pics", h.ctx.clone());
        manager.parse_configuration(true).await.unwrap();

        manager.start(StateChange::system()).await.unwrap();
        manager
            .pause_events(StateChange::user().reason("maintenance"))
            .await;

        let states = manager.states();
        assert_eq!(states.events.status, RunStatus::Paused);
        assert_eq!(states.events.caused_by, CausedBy::User);
        assert_eq!(states.manager.status, RunStatus::Paused);
        assert_eq!(states.manager.reason.as_deref(), Some("maintenance"));
        assert!(manager.own_stream_sources().is_empty());

        let before = h.notifier.count(NotificationEventType::RunStateChanged);
        manager
            .start_events(StateChange::system().suppressed())
            .await
            .unwrap();
        assert_eq!(
            h.notifier.count(NotificationEventType::RunStateChanged),
            before
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_guests() {
        let h = harness(PollingDefaults::default());
        let manager = Manager::new("pics", h.ctx.clone());
        let now = Utc::now();

        manager.add_guest("alice", now + chrono::Duration::hours(1));
        manager.add_guest("bob", now - chrono::Duration::seconds(1));
        manager.add_guest("Alice", now + chrono::Duration::hours(2));
        assert_eq!(manager.guests().len(), 2);

        assert_eq!(manager.remove_expired_guests(now), vec!["bob".to_string()]);
        assert!(manager.remove_guest("ALICE"));
        assert!(manager.guests().is_empty());
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("queue"), "Queue");
        assert_eq!(capitalize(""), "");
    }
}
