//! Fleet coordinator.
//!
//! The [`Fleet`] owns the platform client, every [`Manager`], the shared
//! stream multiplexer, the retry budgets and the rate nanny. After
//! [`Fleet::run`] a health loop ticks for the lifetime of the fleet:
//!
//! 1. sample the remaining quota
//! 2. expire guests and invites
//! 3. sample per-community usage
//! 4. run the nanny every `nanny.check_interval_secs`
//! 5. run the heartbeat every `timing.heartbeat_interval_secs`
//! 6. spawn history retention every `timing.retention_interval_secs`

mod housekeeping;

pub use housekeeping::{Invite, NoopRetentionStore, RetentionStore, partition_expired};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{Account, PlatformClient, SourceType};
use crate::config::{ConfigSource, FleetConfig};
use crate::error::ApiError;
use crate::manager::{
    CausedBy, ItemProcessor, Manager, ManagerContext, ManagerRegistry, ManagerReport, RunStatus,
    StateChange, Subsystem,
};
use crate::nanny::{NannyAction, NannyMode, QuotaSampler, RateNanny, refresh_quota};
use crate::notification::{Notification, NotificationEventType, NotificationSeverity, Notifier};
use crate::retry::{RetryBudget, RetryDecision};
use crate::stream::{MultiplexerSettings, StreamMultiplexer};
use crate::{Error, Result};

/// External collaborators of the fleet.
#[derive(Clone)]
pub struct FleetDeps {
    pub client: Arc<dyn PlatformClient>,
    pub config_source: Arc<dyn ConfigSource>,
    pub processor: Arc<dyn ItemProcessor>,
    pub notifier: Arc<dyn Notifier>,
    pub retention: Arc<dyn RetentionStore>,
}

/// Operator commands on one community. Always user-caused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ManagerCommand {
    Start,
    Stop,
    StartQueue,
    PauseQueue,
    StopQueue,
    StartEvents,
    PauseEvents,
    StopEvents,
}

pub struct Fleet {
    config: FleetConfig,
    client: Arc<dyn PlatformClient>,
    config_source: Arc<dyn ConfigSource>,
    processor: Arc<dyn ItemProcessor>,
    notifier: Arc<dyn Notifier>,
    retention: Arc<dyn RetentionStore>,
    registry: ManagerRegistry,
    multiplexer: tokio::sync::Mutex<StreamMultiplexer>,
    nanny: Mutex<RateNanny>,
    quota: Mutex<QuotaSampler>,
    nanny_budget: RetryBudget,
    escalation: RetryBudget,
    invites: Mutex<Vec<Invite>>,
    account: Mutex<Option<Account>>,
    reports_tx: mpsc::UnboundedSender<ManagerReport>,
    reports_rx: Mutex<Option<mpsc::UnboundedReceiver<ManagerReport>>>,
    heartbeat_running: Arc<AtomicBool>,
    cancellation_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Fleet {
    pub fn new(config: FleetConfig, deps: FleetDeps) -> Arc<Self> {
        let registry = ManagerRegistry::new();
        let multiplexer = StreamMultiplexer::new(
            MultiplexerSettings::from_config(&config),
            deps.client.clone(),
            Arc::new(RetryBudget::new(
                "shared streams",
                config.retry.shared_stream.clone(),
            )),
            deps.notifier.clone(),
            registry.clone(),
        );
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            nanny: Mutex::new(RateNanny::new(config.nanny.clone())),
            quota: Mutex::new(QuotaSampler::new(config.timing.health_tick())),
            nanny_budget: RetryBudget::new("nanny", config.retry.nanny.clone()),
            escalation: RetryBudget::new(
                "manager escalation",
                config.retry.manager_escalation.clone(),
            ),
            client: deps.client,
            config_source: deps.config_source,
            processor: deps.processor,
            notifier: deps.notifier,
            retention: deps.retention,
            registry,
            multiplexer: tokio::sync::Mutex::new(multiplexer),
            invites: Mutex::new(Vec::new()),
            account: Mutex::new(None),
            reports_tx,
            reports_rx: Mutex::new(Some(reports_rx)),
            heartbeat_running: Arc::new(AtomicBool::new(false)),
            cancellation_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            config,
        })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn registry(&self) -> &ManagerRegistry {
        &self.registry
    }

    pub fn manager(&self, community: &str) -> Option<Arc<Manager>> {
        self.registry.get(community)
    }

    pub fn multiplexer(&self) -> &tokio::sync::Mutex<StreamMultiplexer> {
        &self.multiplexer
    }

    pub fn account(&self) -> Option<Account> {
        self.account.lock().clone()
    }

    pub fn nanny_mode(&self) -> NannyMode {
        self.nanny.lock().mode()
    }

    fn manager_context(&self) -> ManagerContext {
        ManagerContext {
            client: self.client.clone(),
            config_source: self.config_source.clone(),
            processor: self.processor.clone(),
            notifier: self.notifier.clone(),
            reports: self.reports_tx.clone(),
            polling: self.config.polling.clone(),
            max_workers: self.config.queue.max_workers,
            stream_retry: self.config.retry.manager_stream.clone(),
        }
    }

    /// Start the fleet and spawn the health loop.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        info!("Starting fleet");
        self.test_client().await?;
        self.sync_managers().await?;

        let stagger = self.config.timing.stagger();
        let mut started = 0usize;
        for manager in self.registry.snapshot() {
            let state = manager.manager_state();
            if state.caused_by == CausedBy::User && !state.is_running() {
                info!(community = %manager.community(), "Not starting manager stopped by a user");
                continue;
            }
            if !manager.has_valid_config() {
                warn!(community = %manager.community(), "Not starting manager without a valid configuration");
                continue;
            }
            if started > 0 && !self.pause(stagger).await {
                return Ok(());
            }
            match manager.start(StateChange::system().reason("startup")).await {
                Ok(()) => started += 1,
                Err(e) => warn!(community = %manager.community(), error = %e, "Manager failed to start"),
            }
        }
        if started == 0 && !self.registry.is_empty() {
            warn!("No community has a valid configuration, nothing will be processed until one is fixed");
        }

        {
            let mut multiplexer = self.multiplexer.lock().await;
            multiplexer.reconcile();
            multiplexer.run_shared_streams(false).await;
        }
        self.check_invites().await;
        self.spawn_background_tasks();

        info!(communities = self.registry.len(), started, "Fleet running");
        Ok(())
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if let Some(rx) = self.reports_rx.lock().take() {
            tasks.push(tokio::spawn(self.clone().report_loop(rx)));
        }
        tasks.push(tokio::spawn(self.clone().health_loop()));
    }

    /// Verify the credential works and remember the account.
    pub async fn test_client(&self) -> Result<Account> {
        let account = self.client.get_me().await?;
        debug!(account = %account.name, "Platform client is reachable");
        *self.account.lock() = Some(account.clone());
        Ok(account)
    }

    /// Bring the manager set in line with the moderated communities and the
    /// operator selection. Returns whether the set changed.
    pub async fn sync_managers(&self) -> Result<bool> {
        let account = match self.account() {
            Some(account) => account,
            None => self.test_client().await?,
        };
        let own_profile = format!("u_{}", account.name);
        let moderated: Vec<String> = self
            .client
            .moderated_communities()
            .await?
            .into_iter()
            .filter(|c| !c.eq_ignore_ascii_case(&own_profile))
            .collect();

        let selection = &self.config.subreddits;
        let wanted: Vec<String> = if selection.names.is_empty() {
            moderated
                .iter()
                .filter(|c| !selection.exclude.iter().any(|e| e.eq_ignore_ascii_case(c)))
                .cloned()
                .collect()
        } else {
            selection
                .names
                .iter()
                .filter_map(|name| {
                    let found = moderated.iter().find(|c| c.eq_ignore_ascii_case(name));
                    if found.is_none() {
                        warn!(community = %name, "Configured community is not moderated by this account");
                    }
                    found.cloned()
                })
                .collect()
        };

        let mut changed = false;
        for name in self.registry.names() {
            if wanted.iter().any(|w| w.eq_ignore_ascii_case(&name)) {
                continue;
            }
            let reason = if moderated.iter().any(|c| c.eq_ignore_ascii_case(&name)) {
                "not listed"
            } else {
                "de-modded"
            };
            if let Some(manager) = self.registry.remove(&name) {
                manager.destroy(reason).await;
                changed = true;
            }
        }

        for name in wanted {
            if self.registry.contains(&name) {
                continue;
            }
            let manager = Manager::new(name.clone(), self.manager_context());
            if let Err(e) = manager.parse_configuration(true).await {
                warn!(community = %name, error = %e, "New manager has no valid configuration yet");
            }
            info!(community = %name, "Added manager");
            self.registry.insert(manager);
            changed = true;
        }

        if changed {
            self.multiplexer.lock().await.reconcile();
        }
        Ok(changed)
    }

    async fn report_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ManagerReport>) {
        loop {
            let report = tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => break,
                report = rx.recv() => match report {
                    Some(report) => report,
                    None => break,
                },
            };
            self.handle_report(report).await;
        }
        debug!("Report loop exited");
    }

    /// Charge a processing result to the escalation budget.
    pub async fn handle_report(&self, report: ManagerReport) {
        match report {
            ManagerReport::Processed { .. } => self.escalation.record_success(),
            ManagerReport::Failed {
                community,
                item_id,
                error,
            } => {
                let message = format!("{} ({}): {}", community, item_id, error);
                if let RetryDecision::GiveUp = self.escalation.charge(error.class(), &message) {
                    self.fleet_panic(&message).await;
                }
            }
        }
    }

    async fn fleet_panic(&self, cause: &str) {
        error!(cause, "Too many processing errors, stopping every manager");
        for manager in self.registry.snapshot() {
            manager
                .stop(StateChange::system().reason("too many processing errors"))
                .await;
        }
        self.notifier
            .notify(
                Notification::new(
                    NotificationEventType::FleetPanic,
                    "All Managers Stopped",
                    format!(
                        "Processing kept failing ({}). Managers restart on the next heartbeat once the platform is reachable.",
                        cause
                    ),
                )
                .severity(NotificationSeverity::Error),
            )
            .await;
        self.escalation.reset();
    }

    async fn health_loop(self: Arc<Self>) {
        let tick = self.config.timing.health_tick();
        let check_interval = self.config.nanny.check_interval();
        let cooldown = self.config.nanny.error_cooldown();
        let heartbeat_interval = self.config.timing.heartbeat_interval();
        let retention_interval = self.config.timing.retention_interval();

        let started = Instant::now();
        let mut ticker = tokio::time::interval_at(started + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut next_nanny = started + check_interval;
        let mut next_heartbeat = started + heartbeat_interval;
        let mut next_retention = started + retention_interval;

        loop {
            tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.health_tick(tick, Utc::now());
            let now = Instant::now();

            if now >= next_nanny {
                next_nanny = match self.run_api_nanny().await {
                    Ok(()) => now + check_interval,
                    Err(e) => {
                        warn!(error = %e, cooldown = ?cooldown, "Nanny check failed");
                        now + cooldown
                    }
                };
            }
            if now >= next_heartbeat {
                next_heartbeat = now + heartbeat_interval;
                self.spawn_heartbeat();
            }
            if now >= next_retention {
                next_retention = now + retention_interval;
                self.retention_cleanup();
            }
        }
        debug!("Health loop exited");
    }

    /// Per-tick sampling and expiry.
    pub fn health_tick(&self, elapsed: Duration, now: DateTime<Utc>) {
        self.quota.lock().record(self.client.remaining_quota());
        self.guest_cleanup(now);
        self.expire_invites(now);
        for manager in self.registry.snapshot() {
            manager.sample_usage(elapsed);
        }
    }

    /// Evaluate the quota and apply the nanny's decision.
    pub async fn run_api_nanny(&self) -> std::result::Result<(), ApiError> {
        refresh_quota(self.client.as_ref(), &self.nanny_budget).await?;

        let remaining = self.client.remaining_quota();
        let depletion = self.quota.lock().depletion(remaining);
        let usage: Vec<(String, f64)> = self
            .registry
            .snapshot()
            .iter()
            .map(|m| (m.community().to_string(), m.usage().combined()))
            .collect();
        let action = self.nanny.lock().evaluate(remaining, depletion, &usage);
        debug!("{}", self.usage_summary());

        self.apply_nanny_action(action, remaining).await;
        Ok(())
    }

    async fn apply_nanny_action(&self, action: NannyAction, remaining: u32) {
        let config = self.config.nanny.clone();
        match action {
            NannyAction::Stay => {}
            NannyAction::EnterHard => {
                warn!(remaining, "Hard limit reached, pausing event polling everywhere");
                for manager in self.registry.snapshot() {
                    // already halted events keep their cause
                    if !manager.state(Subsystem::Events).is_running() {
                        continue;
                    }
                    manager
                        .pause_events(StateChange::system().reason("Hard limit cutoff"))
                        .await;
                    self.notifier
                        .notify(
                            Notification::new(
                                NotificationEventType::NannyModeChanged,
                                "Hard Limit Triggered",
                                format!(
                                    "Hard limit of {} hit (API remaining: {}). Event polling has been paused.",
                                    config.hard_limit, remaining
                                ),
                            )
                            .for_community(manager.community())
                            .severity(NotificationSeverity::Error),
                        )
                        .await;
                }
                self.multiplexer.lock().await.suspend_all("Hard limit cutoff");
            }
            NannyAction::EnterSoft { slowed, threshold } => {
                let delay = config.slow_mode_delay();
                for name in &slowed {
                    if let Some(manager) = self.registry.get(name) {
                        manager.set_delay(Some(delay));
                    }
                }
                let who = match threshold {
                    Some(t) => format!("communities above {}/s", t),
                    None => "every community".to_string(),
                };
                self.notifier
                    .notify(
                        Notification::new(
                            NotificationEventType::NannyModeChanged,
                            "Soft Limit Triggered",
                            format!(
                                "Soft limit of {} hit (API remaining: {}). Processing for {} is slowed to one item per {:?}: {}",
                                config.soft_limit,
                                remaining,
                                who,
                                delay,
                                slowed.join(", ")
                            ),
                        )
                        .severity(NotificationSeverity::Warn),
                    )
                    .await;
            }
            NannyAction::Recover => {
                let change = StateChange::system().reason("API quota recovered");
                for manager in self.registry.snapshot() {
                    manager.set_delay(None);
                    if manager.state(Subsystem::Queue).is_system(RunStatus::Paused) {
                        manager.start_queue(change.clone()).await;
                    }
                    if manager.state(Subsystem::Events).is_system(RunStatus::Paused) {
                        if let Err(e) = manager.start_events(change.clone()).await {
                            warn!(community = %manager.community(), error = %e, "Could not resume events");
                        }
                    }
                }
                self.multiplexer.lock().await.run_shared_streams(true).await;
                self.notifier
                    .notify(Notification::new(
                        NotificationEventType::NannyModeChanged,
                        "Normal Processing Resumed",
                        format!("API conditions improved ({} remaining)", remaining),
                    ))
                    .await;
            }
        }
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        if self.heartbeat_running.swap(true, Ordering::SeqCst) {
            debug!("Previous heartbeat still running, skipping");
            return;
        }
        let fleet = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = fleet.heartbeat_cycle().await {
                warn!(error = %e, "Heartbeat failed, retrying next interval");
            }
            fleet.heartbeat_running.store(false, Ordering::SeqCst);
        });
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Connectivity test, invites, manager sync and heartbeat.
    pub async fn heartbeat_cycle(&self) -> Result<()> {
        self.test_client().await?;
        self.check_invites().await;
        self.sync_managers().await?;
        self.heartbeat().await;
        info!("{}", self.usage_summary());
        Ok(())
    }

    /// Reload every manager's configuration and restart what the system halted.
    pub async fn heartbeat(&self) {
        let hard = self.nanny_mode() == NannyMode::Hard;
        let stagger = self.config.timing.stagger();
        let mut config_changed = false;
        let mut first = true;

        for manager in self.registry.snapshot() {
            let state = manager.manager_state();
            if state.status == RunStatus::Stopped && state.caused_by == CausedBy::User {
                debug!(community = %manager.community(), "Skipping manager stopped by a user");
                continue;
            }
            if !first && !self.pause(stagger).await {
                return;
            }
            first = false;

            let change = StateChange::system().reason("heartbeat");
            match manager.parse_configuration(false).await {
                Ok(changed) => {
                    config_changed |= changed;
                    if manager.state(Subsystem::Queue).is_system_halted() {
                        manager.start_queue(change.clone()).await;
                    }
                    let events = manager.state(Subsystem::Events);
                    if hard {
                        continue;
                    }
                    if events.is_system_halted() || (changed && events.is_running()) {
                        if let Err(e) = manager.start_events(change).await {
                            warn!(community = %manager.community(), error = %e, "Could not start events");
                        }
                    }
                }
                Err(e) => {
                    debug!(community = %manager.community(), error = %e, "Configuration check failed");
                    if !manager.has_valid_config()
                        && manager.state(Subsystem::Events).status != RunStatus::Stopped
                    {
                        manager
                            .stop_events(StateChange::system().reason("invalid configuration"))
                            .await;
                    }
                }
            }
        }

        let mut multiplexer = self.multiplexer.lock().await;
        if config_changed {
            multiplexer.reconcile();
        }
        if !hard {
            multiplexer.run_shared_streams(false).await;
        }
    }

    /// Spawn history retention for every community without waiting for it.
    pub fn retention_cleanup(&self) {
        for manager in self.registry.snapshot() {
            let store = self.retention.clone();
            let community = manager.community().to_string();
            let days = manager.run_spec().and_then(|s| s.retention_days);
            tokio::spawn(async move {
                if let Err(e) = store.retention_cleanup(&community, days).await {
                    warn!(community = %community, error = %e, "Retention cleanup failed");
                }
            });
        }
    }

    // --- guests and invites ---

    pub fn add_guest(
        &self,
        user: &str,
        expires_at: DateTime<Utc>,
        communities: &[String],
    ) -> Result<()> {
        let managers = communities
            .iter()
            .map(|c| {
                self.registry
                    .get(c)
                    .ok_or_else(|| Error::not_found("community", c.as_str()))
            })
            .collect::<Result<Vec<_>>>()?;
        for manager in managers {
            manager.add_guest(user, expires_at);
        }
        info!(user, communities = ?communities, %expires_at, "Added guest");
        Ok(())
    }

    /// Remove `user` from each listed community. Returns how many grants were removed.
    pub fn remove_guest(&self, user: &str, communities: &[String]) -> usize {
        communities
            .iter()
            .filter_map(|c| self.registry.get(c))
            .filter(|m| m.remove_guest(user))
            .count()
    }

    pub fn guest_cleanup(&self, now: DateTime<Utc>) {
        for manager in self.registry.snapshot() {
            manager.remove_expired_guests(now);
        }
    }

    pub fn add_invite(&self, invite: Invite) {
        let mut invites = self.invites.lock();
        invites.retain(|i| !i.community.eq_ignore_ascii_case(&invite.community));
        info!(community = %invite.community, expires_at = %invite.expires_at, "Added invite");
        invites.push(invite);
    }

    pub fn delete_invite(&self, community: &str) -> bool {
        let mut invites = self.invites.lock();
        let before = invites.len();
        invites.retain(|i| !i.community.eq_ignore_ascii_case(community));
        invites.len() != before
    }

    pub fn invites(&self) -> Vec<Invite> {
        self.invites.lock().clone()
    }

    fn expire_invites(&self, now: DateTime<Utc>) {
        let mut invites = self.invites.lock();
        let (pending, expired) = partition_expired(std::mem::take(&mut *invites), now);
        *invites = pending;
        for invite in expired {
            info!(community = %invite.community, "Removed expired invite");
        }
    }

    /// Drop expired invites and accept the ones that need no operator input.
    pub async fn check_invites(&self) {
        self.expire_invites(Utc::now());
        let to_accept: Vec<String> = self
            .invites
            .lock()
            .iter()
            .filter(|i| i.auto_accept())
            .map(|i| i.community.clone())
            .collect();

        for community in to_accept {
            match self.client.accept_moderator_invite(&community).await {
                Ok(()) => {
                    info!(community = %community, "Accepted moderator invite");
                    self.delete_invite(&community);
                }
                Err(e) => warn!(community = %community, error = %e, "Could not accept moderator invite"),
            }
        }
    }

    // --- commands ---

    pub async fn command(&self, community: &str, command: ManagerCommand) -> Result<()> {
        let manager = self
            .registry
            .get(community)
            .ok_or_else(|| Error::not_found("community", community))?;
        let change = StateChange::user();
        info!(community = %manager.community(), %command, "User command");

        match command {
            ManagerCommand::Start => manager.start(change).await?,
            ManagerCommand::Stop => manager.stop(change).await,
            ManagerCommand::StartQueue => manager.start_queue(change).await,
            ManagerCommand::PauseQueue => manager.pause_queue(change).await,
            ManagerCommand::StopQueue => manager.stop_queue(change).await,
            ManagerCommand::StartEvents => manager.start_events(change).await?,
            ManagerCommand::PauseEvents => manager.pause_events(change).await,
            ManagerCommand::StopEvents => manager.stop_events(change).await,
        }
        Ok(())
    }

    pub fn usage_summary(&self) -> String {
        self.quota.lock().summary(self.client.remaining_quota())
    }

    /// Communities currently sharing `source`.
    pub async fn shared_members(&self, source: SourceType) -> Option<Vec<String>> {
        self.multiplexer.lock().await.members(source)
    }

    /// Stop the health loop, shared streams and every manager.
    pub async fn destroy(&self, caused_by: CausedBy) {
        info!(caused_by = %caused_by, "Shutting down fleet");
        self.cancellation_token.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        self.multiplexer.lock().await.end_all("shutdown");
        for manager in self.registry.snapshot() {
            manager
                .stop(StateChange::by(caused_by).reason("shutdown").suppressed())
                .await;
            manager.queue().shutdown().await;
        }

        self.notifier
            .notify(
                Notification::new(
                    NotificationEventType::SystemShutdown,
                    "Shutdown",
                    format!("Stopped {} managers", self.registry.len()),
                )
                .caused_by(caused_by),
            )
            .await;
    }

    /// Sleep unless the fleet shuts down first. Returns `false` on shutdown.
    async fn pause(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.cancellation_token.is_cancelled();
        }
        tokio::select! {
            biased;
            _ = self.cancellation_token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
