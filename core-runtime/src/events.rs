//! # Event Bus System
//!
//! Broadcast channel that lets hosts observe the transfer core without
//! polling. Modules publish typed [`CoreEvent`]s; any number of subscribers
//! receive every event emitted after they subscribed.
//!
//! ```text
//! SessionManager ──emit──┐
//!                        ├──> EventBus ──subscribe──> host UI / audit log
//! TransferStatusSink ────┘
//! ```
//!
//! Publishing never blocks and never fails the caller: with no subscribers
//! [`EventBus::emit`] returns an error that publishers ignore.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
//!
//! let bus = EventBus::new(64);
//! let mut rx = bus.subscribe();
//!
//! bus.emit(CoreEvent::Auth(AuthEvent::SignedOut)).ok();
//! assert!(matches!(rx.recv().await?, CoreEvent::Auth(AuthEvent::SignedOut)));
//! ```
//!
//! Slow subscribers receive `RecvError::Lagged(n)` and continue from the
//! oldest retained event.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

/// Which way an object moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level event published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    Auth(AuthEvent),
    Transfer(TransferEvent),
}

impl CoreEvent {
    /// Short human-readable summary.
    pub fn description(&self) -> String {
        match self {
            CoreEvent::Auth(event) => match event {
                AuthEvent::SigningIn {
                    attempt,
                    max_attempts,
                } => format!("Signing in (attempt {}/{})", attempt, max_attempts),
                AuthEvent::SignedIn { .. } => "Signed in".to_string(),
                AuthEvent::AuthError { message, .. } => format!("Sign-in failed: {}", message),
                AuthEvent::SignedOut => "Signed out".to_string(),
            },
            CoreEvent::Transfer(event) => match event {
                TransferEvent::ServiceStarted { pipeline } => {
                    format!("{} pipeline started", pipeline)
                }
                TransferEvent::ServiceStopped { pipeline } => {
                    format!("{} pipeline stopped", pipeline)
                }
                TransferEvent::OutcomeRecorded {
                    subject,
                    direction,
                    success,
                    ..
                } => format!(
                    "{} of {} {}",
                    direction,
                    subject,
                    if *success { "succeeded" } else { "failed" }
                ),
                TransferEvent::AuthorizationDenied { status } => {
                    format!("Store rejected credentials (HTTP {})", status)
                }
            },
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Auth(AuthEvent::AuthError { .. }) => EventSeverity::Error,
            CoreEvent::Transfer(TransferEvent::AuthorizationDenied { .. }) => EventSeverity::Error,
            CoreEvent::Transfer(TransferEvent::OutcomeRecorded { success: false, .. }) => {
                EventSeverity::Warning
            }
            CoreEvent::Auth(AuthEvent::SigningIn { .. }) => EventSeverity::Debug,
            _ => EventSeverity::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Session lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum AuthEvent {
    SigningIn { attempt: u32, max_attempts: u32 },
    /// `expires_at` is a unix timestamp in seconds when known.
    SignedIn { expires_at: Option<i64> },
    AuthError { attempt: u32, message: String },
    SignedOut,
}

/// Pipeline lifecycle and per-object results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum TransferEvent {
    ServiceStarted {
        pipeline: String,
    },
    ServiceStopped {
        pipeline: String,
    },
    OutcomeRecorded {
        subject: String,
        direction: Direction,
        success: bool,
        detail: Option<String>,
    },
    /// First 401/403 after a run of accepted uploads.
    AuthorizationDenied {
        status: u16,
    },
}

/// Broadcast hub for [`CoreEvent`]s. Cheap to clone; clones share the channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// `capacity` is the number of events retained for slow subscribers.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns the number of subscribers reached, or an error when there are
    /// none.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        let event = CoreEvent::Auth(AuthEvent::SignedIn {
            expires_at: Some(1_700_000_000),
        });
        assert_eq!(bus.emit(event.clone()).unwrap(), 1);

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn test_emit_without_subscribers_errors() {
        let bus = EventBus::default();
        assert!(bus.emit(CoreEvent::Auth(AuthEvent::SignedOut)).is_err());
    }

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(CoreEvent::Transfer(TransferEvent::ServiceStarted {
            pipeline: "export".to_string(),
        }))
        .unwrap();

        assert!(matches!(first.recv().await, Ok(CoreEvent::Transfer(_))));
        assert!(matches!(second.recv().await, Ok(CoreEvent::Transfer(_))));
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for attempt in 1..=4 {
            bus.emit(CoreEvent::Auth(AuthEvent::SigningIn {
                attempt,
                max_attempts: 4,
            }))
            .unwrap();
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(2))));
    }

    #[test]
    fn test_severity_and_description() {
        let failed = CoreEvent::Transfer(TransferEvent::OutcomeRecorded {
            subject: "scan.dcm".to_string(),
            direction: Direction::Upload,
            success: false,
            detail: Some("HTTP 500".to_string()),
        });
        assert_eq!(failed.severity(), EventSeverity::Warning);
        assert_eq!(failed.description(), "upload of scan.dcm failed");

        let denied = CoreEvent::Transfer(TransferEvent::AuthorizationDenied { status: 401 });
        assert_eq!(denied.severity(), EventSeverity::Error);
    }

    #[test]
    fn test_serialized_shape() {
        let event = CoreEvent::Auth(AuthEvent::AuthError {
            attempt: 2,
            message: "invalid_grant".to_string(),
        });
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "Auth");
        assert_eq!(json["payload"]["event"], "AuthError");
        assert_eq!(json["payload"]["attempt"], 2);
    }
}
