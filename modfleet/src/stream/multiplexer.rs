//! Fleet-wide shared polling streams.
//!
//! Communities whose subscription for a source is left at the operator
//! defaults share one stream per source. Moderator listings (`unmoderated`,
//! `modqueue`) cover every moderated community through the `mod` scope;
//! `newSubmissions`/`newComments` combine the members into one `a+b+c`
//! scope, so a membership change replaces the stream. The replacement is
//! seeded with the old stream's continuity and therefore neither skips nor
//! repeats items at the boundary.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::{ContinuityHandle, PollStream, PollStreamConfig, StreamEvent, StreamStatus};
use crate::client::{ListingRequest, PlatformClient, SourceType};
use crate::config::{FleetConfig, SHARED_STREAM_LIMIT};
use crate::manager::{Manager, ManagerRegistry, Subsystem};
use crate::notification::{Notification, NotificationEventType, NotificationSeverity, Notifier};
use crate::retry::RetryBudget;

/// Members above which a combined scope gets unwieldy for the platform.
const MAX_COMBINED_MEMBERS: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct MultiplexerSettings {
    /// Sources the operator shares.
    pub shared: Vec<SourceType>,
    pub interval: Duration,
    pub continuity_cap: usize,
    /// Wait between two items fanned out from one listing.
    pub stagger: Duration,
    /// Wait between two stream starts.
    pub start_spacing: Duration,
    /// Minimum item age before a shared stream hands it over.
    pub delay_until: Option<Duration>,
}

impl MultiplexerSettings {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            shared: config.polling.shared.clone(),
            interval: config.polling.interval(),
            continuity_cap: config.polling.continuity_cap,
            stagger: config.timing.stagger(),
            start_spacing: config.timing.stream_start_spacing(),
            delay_until: config.polling.delay_until_secs.map(Duration::from_secs),
        }
    }
}

struct SharedStream {
    stream: Arc<PollStream>,
    members: Vec<String>,
}

pub struct StreamMultiplexer {
    settings: MultiplexerSettings,
    client: Arc<dyn PlatformClient>,
    retry: Arc<RetryBudget>,
    notifier: Arc<dyn Notifier>,
    registry: ManagerRegistry,
    streams: BTreeMap<SourceType, SharedStream>,
    /// Continuity of keys that lost every subscriber.
    parked: HashMap<SourceType, ContinuityHandle>,
}

impl StreamMultiplexer {
    pub fn new(
        settings: MultiplexerSettings,
        client: Arc<dyn PlatformClient>,
        retry: Arc<RetryBudget>,
        notifier: Arc<dyn Notifier>,
        registry: ManagerRegistry,
    ) -> Self {
        Self {
            settings,
            client,
            retry,
            notifier,
            registry,
            streams: BTreeMap::new(),
            parked: HashMap::new(),
        }
    }

    /// Bring the shared streams in line with the managers' subscriptions.
    ///
    /// Streams are created here but only started by [`run_shared_streams`].
    /// Returns whether anything changed.
    ///
    /// [`run_shared_streams`]: Self::run_shared_streams
    pub fn reconcile(&mut self) -> bool {
        let managers = self.registry.snapshot();
        let mut changed = false;

        for source in SourceType::ALL {
            let members = self.desired_members(source, &managers);

            if members.is_empty() {
                if let Some(existing) = self.streams.remove(&source) {
                    let continuity = existing.stream.end("no subscribers");
                    self.parked.insert(source, continuity);
                    info!(stream = %source, "Removed shared stream without subscribers");
                    changed = true;
                }
                continue;
            }

            let current = self.streams.get(&source).map(|s| s.members.clone());
            match current {
                Some(current) if current == members => {}
                Some(_) if source.is_moderator_scoped() => {
                    debug!(stream = %source, members = members.len(), "Updated shared stream members");
                    if let Some(existing) = self.streams.get_mut(&source) {
                        existing.members = members;
                    }
                    changed = true;
                }
                Some(_) => {
                    let continuity = self
                        .streams
                        .get(&source)
                        .map(|s| s.stream.end("membership changed"));
                    let stream = self.build_stream(source, &members, continuity);
                    info!(stream = %source, scope = %stream.request().scope, "Replaced shared stream");
                    self.streams.insert(source, SharedStream { stream, members });
                    changed = true;
                }
                None => {
                    let continuity = self.parked.remove(&source);
                    let stream = self.build_stream(source, &members, continuity);
                    info!(stream = %source, scope = %stream.request().scope, "Created shared stream");
                    self.streams.insert(source, SharedStream { stream, members });
                    changed = true;
                }
            }
        }

        changed
    }

    /// Start every shared stream that has subscribers and is not running.
    ///
    /// Ended streams are rebuilt from their continuity first. Returns the
    /// number of streams started.
    pub async fn run_shared_streams(&mut self, notify: bool) -> usize {
        let mut started = 0;
        let keys: Vec<SourceType> = self.streams.keys().copied().collect();

        for source in keys {
            let Some((status, members, continuity)) = self
                .streams
                .get(&source)
                .map(|s| (s.stream.status(), s.members.clone(), s.stream.continuity()))
            else {
                continue;
            };
            if members.is_empty() || status == StreamStatus::Running {
                continue;
            }
            if status == StreamStatus::Ended {
                let stream = self.build_stream(source, &members, Some(continuity));
                if let Some(entry) = self.streams.get_mut(&source) {
                    entry.stream = stream;
                }
            }

            if started > 0 && !self.settings.start_spacing.is_zero() {
                tokio::time::sleep(self.settings.start_spacing).await;
            }

            let Some(stream) = self.streams.get(&source).map(|s| s.stream.clone()) else {
                continue;
            };
            let Some(rx) = stream.start() else { continue };
            tokio::spawn(fan_out(
                source,
                rx,
                self.registry.clone(),
                self.notifier.clone(),
                self.settings.stagger,
            ));
            started += 1;

            if notify {
                for manager in self.subscribers(source) {
                    self.notifier
                        .notify(
                            Notification::new(
                                NotificationEventType::PollingStarted,
                                format!("{} Polling Started", key_title(source)),
                                format!("Shared polling for {} started", stream.label()),
                            )
                            .for_community(manager.community()),
                        )
                        .await;
                }
            }
        }

        if started > 0 {
            info!(count = started, "Started shared streams");
        }
        started
    }

    /// End every stream but keep it registered, so the next
    /// [`run_shared_streams`](Self::run_shared_streams) resumes from the
    /// same continuity.
    pub fn suspend_all(&mut self, reason: &str) {
        for shared in self.streams.values() {
            shared.stream.end(reason);
        }
    }

    /// End and forget every stream.
    pub fn end_all(&mut self, reason: &str) {
        for (source, shared) in std::mem::take(&mut self.streams) {
            let continuity = shared.stream.end(reason);
            self.parked.insert(source, continuity);
        }
    }

    pub fn keys(&self) -> Vec<SourceType> {
        self.streams.keys().copied().collect()
    }

    pub fn members(&self, source: SourceType) -> Option<Vec<String>> {
        self.streams.get(&source).map(|s| s.members.clone())
    }

    pub fn stream(&self, source: SourceType) -> Option<Arc<PollStream>> {
        self.streams.get(&source).map(|s| s.stream.clone())
    }

    fn desired_members(&self, source: SourceType, managers: &[Arc<Manager>]) -> Vec<String> {
        if !self.settings.shared.contains(&source) {
            return Vec::new();
        }
        normalize_members(
            managers
                .iter()
                .filter(|m| m.subscribes_shared(source))
                .map(|m| m.community().to_string())
                .collect(),
        )
    }

    fn subscribers(&self, source: SourceType) -> Vec<Arc<Manager>> {
        self.registry
            .snapshot()
            .into_iter()
            .filter(|m| m.subscribes_shared(source))
            .collect()
    }

    fn build_stream(
        &self,
        source: SourceType,
        members: &[String],
        continuity: Option<ContinuityHandle>,
    ) -> Arc<PollStream> {
        let scope = if source.is_moderator_scoped() {
            "mod".to_string()
        } else {
            if members.len() > MAX_COMBINED_MEMBERS {
                warn!(
                    stream = %source,
                    members = members.len(),
                    "Combined stream has more than {} members, requests may be rejected",
                    MAX_COMBINED_MEMBERS
                );
            }
            members.join("+")
        };

        let config = PollStreamConfig {
            label: format!("{} (shared: {})", source, scope),
            request: ListingRequest {
                source,
                scope,
                limit: SHARED_STREAM_LIMIT,
            },
            interval: self.settings.interval,
            delay_until: self.settings.delay_until,
        };
        Arc::new(PollStream::new(
            config,
            self.client.clone(),
            self.retry.clone(),
            continuity,
            self.settings.continuity_cap,
        ))
    }
}

/// Sort case-insensitively and drop case-insensitive duplicates.
fn normalize_members(mut names: Vec<String>) -> Vec<String> {
    names.sort_by_key(|n| n.to_ascii_lowercase());
    names.dedup_by(|a, b| a.eq_ignore_ascii_case(b));
    names
}

fn key_title(source: SourceType) -> String {
    source.to_string().to_ascii_uppercase()
}

/// Deliver a shared stream's listings to the subscribing managers.
async fn fan_out(
    source: SourceType,
    mut rx: mpsc::UnboundedReceiver<StreamEvent>,
    registry: ManagerRegistry,
    notifier: Arc<dyn Notifier>,
    stagger: Duration,
) {
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Listing(items) => {
                for item in items {
                    let Some(manager) = registry.get(&item.community) else {
                        trace!(stream = %source, community = %item.community, "No manager for item");
                        continue;
                    };
                    if !manager.state(Subsystem::Events).is_running()
                        || !manager.subscribes_shared(source)
                    {
                        trace!(stream = %source, community = %item.community, "Manager not receiving shared events");
                        continue;
                    }
                    manager.intake(item);
                    if !stagger.is_zero() {
                        tokio::time::sleep(stagger).await;
                    }
                }
            }
            StreamEvent::Error(err) => {
                let subscribers: Vec<_> = registry
                    .snapshot()
                    .into_iter()
                    .filter(|m| m.subscribes_shared(source))
                    .collect();
                for manager in subscribers {
                    notifier
                        .notify(
                            Notification::new(
                                NotificationEventType::PollingStopped,
                                format!("{} Polling Stopped", key_title(source)),
                                format!(
                                    "Shared polling stopped after repeated errors, it will be restarted on the next heartbeat: {}",
                                    err
                                ),
                            )
                            .for_community(manager.community())
                            .severity(NotificationSeverity::Warn),
                        )
                        .await;
                }
            }
        }
    }
    debug!(stream = %source, "Shared stream fan-out finished");
}
