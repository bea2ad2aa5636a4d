//! Notifications.
//!
//! Every suppression or stoppage the engine performs is routed through a
//! [`Notifier`] so operators see why work stopped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::manager::CausedBy;

/// Broadcast channel capacity for [`BroadcastNotifier`].
const NOTIFICATION_BROADCAST_CAPACITY: usize = 256;

/// Kinds of notifications the engine sends.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationEventType {
    /// A queue, events or manager run state changed.
    RunStateChanged,
    /// A polling stream was (re)started.
    PollingStarted,
    /// A polling stream gave up after exhausting its retries.
    PollingStopped,
    /// The rate nanny entered or left a throttling mode.
    NannyModeChanged,
    /// Too many processing errors across the fleet; every manager was stopped.
    FleetPanic,
    /// A community's run specification failed to load or validate.
    ConfigInvalid,
    SystemShutdown,
}

/// Severity of a notification.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NotificationSeverity {
    #[default]
    Info,
    Warn,
    Error,
}

/// A notification routed to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub event_type: NotificationEventType,
    pub title: String,
    pub body: String,
    pub caused_by: CausedBy,
    pub severity: NotificationSeverity,
    /// Community the notification concerns, if any.
    pub community: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        event_type: NotificationEventType,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            title: title.into(),
            body: body.into(),
            caused_by: CausedBy::System,
            severity: NotificationSeverity::Info,
            community: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_community(mut self, community: impl Into<String>) -> Self {
        self.community = Some(community.into());
        self
    }

    pub fn caused_by(mut self, caused_by: CausedBy) -> Self {
        self.caused_by = caused_by;
        self
    }

    pub fn severity(mut self, severity: NotificationSeverity) -> Self {
        self.severity = severity;
        self
    }
}

/// Receives notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, n: Notification) {
        let community = n.community.as_deref().unwrap_or("-");
        match n.severity {
            NotificationSeverity::Info => info!(
                event = %n.event_type,
                community,
                caused_by = %n.caused_by,
                "{}: {}",
                n.title,
                n.body
            ),
            NotificationSeverity::Warn => warn!(
                event = %n.event_type,
                community,
                caused_by = %n.caused_by,
                "{}: {}",
                n.title,
                n.body
            ),
            NotificationSeverity::Error => error!(
                event = %n.event_type,
                community,
                caused_by = %n.caused_by,
                "{}: {}",
                n.title,
                n.body
            ),
        }
    }
}

/// Fans notifications out to in-process subscribers.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFICATION_BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn notify(&self, notification: Notification) {
        // no subscribers is fine
        let _ = self.tx.send(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_notifier_delivers() {
        let notifier = BroadcastNotifier::new();
        let mut rx = notifier.subscribe();

        notifier
            .notify(
                Notification::new(
                    NotificationEventType::PollingStopped,
                    "NEWCOMMENTS Polling Stopped",
                    "retries exhausted",
                )
                .for_community("pics")
                .severity(NotificationSeverity::Error),
            )
            .await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, NotificationEventType::PollingStopped);
        assert_eq!(received.community.as_deref(), Some("pics"));
        assert_eq!(received.caused_by, CausedBy::System);
        assert_eq!(received.severity, NotificationSeverity::Error);
    }

    #[test]
    fn test_severity_defaults_and_display() {
        assert_eq!(NotificationSeverity::default(), NotificationSeverity::Info);
        assert_eq!(NotificationSeverity::Warn.to_string(), "warn");
        assert!(NotificationSeverity::Error > NotificationSeverity::Warn);
        assert_eq!(
            serde_json::to_string(&NotificationSeverity::Error).unwrap(),
            r#""error""#
        );
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers() {
        let notifier = BroadcastNotifier::default();
        notifier
            .notify(Notification::new(
                NotificationEventType::SystemShutdown,
                "Shutdown",
                "bye",
            ))
            .await;
    }

    #[test]
    fn test_event_type_names() {
        assert_eq!(NotificationEventType::RunStateChanged.to_string(), "run_state_changed");
        assert_eq!(NotificationSeverity::Warn.to_string(), "warn");
        let json = serde_json::to_string(&NotificationEventType::NannyModeChanged).unwrap();
        assert_eq!(json, "\"nanny_mode_changed\"");
    }
}
