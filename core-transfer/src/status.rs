//! # Transfer Status
//!
//! Latest outcome per transferred object, plus per-direction totals.
//!
//! Uploads are keyed by local path, downloads by study URL. Recording the same
//! subject again replaces its previous outcome. Every read takes a single
//! lock, so counts and listings always describe the same instant.

use chrono::{DateTime, Utc};
use core_runtime::events::{CoreEvent, EventBus, TransferEvent};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

pub use core_runtime::events::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutcomeStatus {
    Ok,
    Fail,
}

impl OutcomeStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, OutcomeStatus::Ok)
    }
}

/// Terminal result for one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub subject: String,
    pub direction: Direction,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub success: usize,
    pub fail: usize,
    pub total: usize,
}

impl OutcomeCounts {
    fn add(&mut self, status: OutcomeStatus) {
        match status {
            OutcomeStatus::Ok => self.success += 1,
            OutcomeStatus::Fail => self.fail += 1,
        }
        self.total += 1;
    }
}

/// Summary suitable for rendering or serializing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub uploads: OutcomeCounts,
    pub downloads: OutcomeCounts,
    /// Sorted by direction, then subject. Empty unless requested.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outcomes: Vec<TransferOutcome>,
}

/// Thread-safe outcome registry shared by both pipelines.
#[derive(Default)]
pub struct TransferStatusSink {
    outcomes: RwLock<HashMap<(Direction, String), TransferOutcome>>,
    event_bus: Option<EventBus>,
}

impl TransferStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn record_outcome(
        &self,
        direction: Direction,
        subject: impl Into<String>,
        status: OutcomeStatus,
        detail: Option<String>,
    ) {
        let subject = subject.into();
        let outcome = TransferOutcome {
            subject: subject.clone(),
            direction,
            status,
            detail: detail.clone(),
            recorded_at: Utc::now(),
        };

        self.outcomes
            .write()
            .insert((direction, subject.clone()), outcome);

        debug!(%direction, subject = %subject, ?status, "Outcome recorded");

        if let Some(bus) = &self.event_bus {
            let _ = bus.emit(CoreEvent::Transfer(TransferEvent::OutcomeRecorded {
                subject,
                direction,
                success: status.is_ok(),
                detail,
            }));
        }
    }

    pub fn get(&self, direction: Direction, subject: &str) -> Option<TransferOutcome> {
        self.outcomes
            .read()
            .get(&(direction, subject.to_string()))
            .cloned()
    }

    pub fn counts(&self, direction: Direction) -> OutcomeCounts {
        let outcomes = self.outcomes.read();
        let mut counts = OutcomeCounts::default();
        for outcome in outcomes.values().filter(|o| o.direction == direction) {
            counts.add(outcome.status);
        }
        counts
    }

    /// Every outcome, sorted by direction then subject.
    pub fn snapshot(&self) -> Vec<TransferOutcome> {
        let mut all: Vec<TransferOutcome> = self.outcomes.read().values().cloned().collect();
        all.sort_by(|a, b| (a.direction, &a.subject).cmp(&(b.direction, &b.subject)));
        all
    }

    pub fn report(&self, include_outcomes: bool) -> StatusReport {
        let outcomes = self.outcomes.read();
        let mut uploads = OutcomeCounts::default();
        let mut downloads = OutcomeCounts::default();

        for outcome in outcomes.values() {
            match outcome.direction {
                Direction::Upload => uploads.add(outcome.status),
                Direction::Download => downloads.add(outcome.status),
            }
        }

        let mut listed: Vec<TransferOutcome> = if include_outcomes {
            outcomes.values().cloned().collect()
        } else {
            Vec::new()
        };
        drop(outcomes);
        listed.sort_by(|a, b| (a.direction, &a.subject).cmp(&(b.direction, &b.subject)));

        StatusReport {
            generated_at: Utc::now(),
            uploads,
            downloads,
            outcomes: listed,
        }
    }

    pub fn len(&self) -> usize {
        self.outcomes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.read().is_empty()
    }

    pub fn clear(&self) {
        self.outcomes.write().clear();
    }
}

impl std::fmt::Debug for TransferStatusSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferStatusSink")
            .field("outcomes", &self.len())
            .finish()
    }
}
