//! A polling loop against one listing endpoint.
//!
//! ```text
//! idle -> running -> errored -> running ...
//!            \           \
//!             +-----------+--> ended
//! ```
//!
//! Every tick issues one listing request, drops identifiers already in the
//! continuity set and emits what is left oldest-first. The first listing of
//! a stream whose continuity has never been seeded is only recorded, so a
//! fresh stream does not replay the backlog.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::ContinuityHandle;
use crate::client::{Item, ListingRequest, PlatformClient};
use crate::error::ApiError;
use crate::retry::{RetryBudget, RetryDecision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum StreamStatus {
    Idle,
    Running,
    Errored,
    Ended,
}

/// Signals sent by a running stream. The channel closing means the loop exited.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// New items, oldest first. Never empty.
    Listing(Vec<Item>),
    /// The retry budget is exhausted and the stream stopped.
    Error(ApiError),
}

#[derive(Debug, Clone)]
pub struct PollStreamConfig {
    /// Name used in logs and notifications.
    pub label: String,
    pub request: ListingRequest,
    pub interval: Duration,
    /// Items younger than this are held back until they reach the age.
    pub delay_until: Option<Duration>,
}

pub struct PollStream {
    config: PollStreamConfig,
    client: Arc<dyn PlatformClient>,
    retry: Arc<RetryBudget>,
    continuity: ContinuityHandle,
    status: Arc<Mutex<StreamStatus>>,
    cancellation_token: Mutex<CancellationToken>,
}

impl PollStream {
    /// Create an idle stream, optionally seeded with the continuity of a
    /// stream it replaces.
    pub fn new(
        config: PollStreamConfig,
        client: Arc<dyn PlatformClient>,
        retry: Arc<RetryBudget>,
        continuity: Option<ContinuityHandle>,
        continuity_cap: usize,
    ) -> Self {
        Self {
            config,
            client,
            retry,
            continuity: continuity.unwrap_or_else(|| ContinuityHandle::new(continuity_cap)),
            status: Arc::new(Mutex::new(StreamStatus::Idle)),
            cancellation_token: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn label(&self) -> &str {
        &self.config.label
    }

    pub fn request(&self) -> &ListingRequest {
        &self.config.request
    }

    pub fn status(&self) -> StreamStatus {
        *self.status.lock()
    }

    pub fn is_running(&self) -> bool {
        self.status() == StreamStatus::Running
    }

    /// Whether the stream will emit its first listing instead of recording it.
    pub fn is_seeded(&self) -> bool {
        self.continuity.is_baselined()
    }

    pub fn continuity(&self) -> ContinuityHandle {
        self.continuity.clone()
    }

    /// Spawn the polling loop.
    ///
    /// Returns `None` when the stream is already running or has ended.
    pub fn start(&self) -> Option<mpsc::UnboundedReceiver<StreamEvent>> {
        {
            let mut status = self.status.lock();
            if matches!(*status, StreamStatus::Running | StreamStatus::Ended) {
                return None;
            }
            *status = StreamStatus::Running;
        }

        let token = CancellationToken::new();
        *self.cancellation_token.lock() = token.clone();

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = StreamLoop {
            config: self.config.clone(),
            client: self.client.clone(),
            retry: self.retry.clone(),
            continuity: self.continuity.clone(),
            status: self.status.clone(),
            token,
        };
        tokio::spawn(worker.run(tx));

        debug!(
            stream = %self.config.label,
            seeded = self.is_seeded(),
            interval = ?self.config.interval,
            "Stream started"
        );
        Some(rx)
    }

    /// Stop scheduling new requests and hand back the continuity state.
    ///
    /// A request already in flight still completes and its items are still
    /// delivered before the channel closes.
    pub fn end(&self, reason: &str) -> ContinuityHandle {
        let previous = std::mem::replace(&mut *self.status.lock(), StreamStatus::Ended);
        self.cancellation_token.lock().cancel();
        if previous != StreamStatus::Ended {
            info!(stream = %self.config.label, reason, "Stream ended");
        }
        self.continuity.clone()
    }
}

impl Drop for PollStream {
    fn drop(&mut self) {
        self.cancellation_token.lock().cancel();
    }
}

struct StreamLoop {
    config: PollStreamConfig,
    client: Arc<dyn PlatformClient>,
    retry: Arc<RetryBudget>,
    continuity: ContinuityHandle,
    status: Arc<Mutex<StreamStatus>>,
    token: CancellationToken,
}

impl StreamLoop {
    async fn run(self, tx: mpsc::UnboundedSender<StreamEvent>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // not raced against cancellation: an in-flight request is delivered
            let (items, error) = self.poll_once().await;
            if !items.is_empty() {
                trace!(stream = %self.config.label, count = items.len(), "Emitting listing");
                if tx.send(StreamEvent::Listing(items)).is_err() {
                    debug!(stream = %self.config.label, "Listing receiver dropped");
                    break;
                }
            }

            let Some(err) = error else { continue };
            match self.retry.should_retry(&err) {
                RetryDecision::Retry { wait: Some(wait) } => {
                    tokio::select! {
                        biased;
                        _ = self.token.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                RetryDecision::Retry { wait: None } => {}
                RetryDecision::GiveUp => {
                    if self.token.is_cancelled() {
                        debug!(stream = %self.config.label, error = %err, "Ended stream failed its last request");
                        break;
                    }
                    {
                        let mut status = self.status.lock();
                        if *status == StreamStatus::Running {
                            *status = StreamStatus::Errored;
                        }
                    }
                    warn!(stream = %self.config.label, error = %err, "Stream stopped after exhausting retries");
                    let _ = tx.send(StreamEvent::Error(err));
                    break;
                }
            }
        }

        debug!(stream = %self.config.label, "Stream loop exited");
    }

    /// One tick. Returns the items to emit and an error to charge, if any.
    async fn poll_once(&self) -> (Vec<Item>, Option<ApiError>) {
        let listing = match self.client.list(&self.config.request).await {
            Ok(listing) => listing,
            Err(err) => return (Vec::new(), Some(err)),
        };
        self.retry.record_success();

        if !self.continuity.is_baselined() {
            self.continuity
                .record_baseline(listing.iter().map(|i| i.id.as_str()));
            debug!(
                stream = %self.config.label,
                count = listing.len(),
                "Recorded baseline listing"
            );
            return (Vec::new(), None);
        }

        let now = Instant::now();
        let wall_now = Utc::now();
        let mut ready = Vec::new();

        // listings arrive newest first
        for item in listing.into_iter().rev() {
            if !self.continuity.insert(&item.id) {
                continue;
            }
            if let Some(threshold) = self.config.delay_until {
                let age = item.age_at(wall_now);
                if age < threshold {
                    trace!(stream = %self.config.label, item = %item.id, ?age, "Holding item until it is old enough");
                    self.continuity.defer(item.id.clone(), now + (threshold - age));
                    continue;
                }
            }
            ready.push(item);
        }

        let mut error = None;
        let mut due = self.continuity.take_due(now).into_iter();
        while let Some(id) = due.next() {
            match self.client.fetch_item(&id).await {
                Ok(item) => ready.push(item),
                Err(err) => {
                    self.continuity.defer(id, now);
                    for rest in due.by_ref() {
                        self.continuity.defer(rest, now);
                    }
                    error = Some(err);
                }
            }
        }

        ready.sort_by_key(|i| i.created_at);
        (ready, error)
    }
}
