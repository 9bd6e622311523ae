// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Typed domain events and their single dispatch point.
//!
//! Components publish [`DomainEvent`]s on an [`EventBus`]; anything that
//! cares (the audit trail, an analytics forwarder, a test) subscribes an
//! [`EventSink`].  Every published event is also logged under the
//! `trialgate.events` tracing target.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::types::{AccessReason, ActionKind};

/// Something observable happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    TrialConsumed {
        fingerprint: String,
        action_kind: ActionKind,
        weight: u32,
        remaining: u32,
    },
    /// The ledger moved from active to exhausted.
    TrialExhausted {
        fingerprint: String,
        action_kind: ActionKind,
    },
    AccessDenied {
        fingerprint: String,
        feature: String,
        reason: AccessReason,
    },
    PromptShown {
        fingerprint: String,
        experiment_id: String,
        arm_id: String,
    },
    PromptClicked {
        fingerprint: String,
        experiment_id: String,
        arm_id: String,
    },
    PromptConverted {
        fingerprint: String,
        experiment_id: String,
        arm_id: String,
    },
    /// Mirror reconciliation gave up after its retry budget.
    SyncFailed {
        fingerprint: String,
        attempts: u32,
        error: String,
    },
    RateLimited {
        fingerprint: String,
        retry_after_ms: u64,
    },
    LedgerReset {
        fingerprint: String,
        remaining: u32,
        actions_cleared: bool,
    },
    LedgerBlocked {
        fingerprint: String,
        reason: String,
    },
    LedgerUnblocked {
        fingerprint: String,
    },
    /// Behavioral ingestion keeps failing.
    IngestionDegraded {
        consecutive_failures: u32,
    },
    IngestionRecovered,
}

impl DomainEvent {
    /// Wire name, matching the serde tag.
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::TrialConsumed { .. } => "trial_consumed",
            DomainEvent::TrialExhausted { .. } => "trial_exhausted",
            DomainEvent::AccessDenied { .. } => "access_denied",
            DomainEvent::PromptShown { .. } => "prompt_shown",
            DomainEvent::PromptClicked { .. } => "prompt_clicked",
            DomainEvent::PromptConverted { .. } => "prompt_converted",
            DomainEvent::SyncFailed { .. } => "sync_failed",
            DomainEvent::RateLimited { .. } => "rate_limited",
            DomainEvent::LedgerReset { .. } => "ledger_reset",
            DomainEvent::LedgerBlocked { .. } => "ledger_blocked",
            DomainEvent::LedgerUnblocked { .. } => "ledger_unblocked",
            DomainEvent::IngestionDegraded { .. } => "ingestion_degraded",
            DomainEvent::IngestionRecovered => "ingestion_recovered",
        }
    }

    /// The fingerprint the event concerns, if any.
    pub fn fingerprint(&self) -> Option<&str> {
        match self {
            DomainEvent::TrialConsumed { fingerprint, .. }
            | DomainEvent::TrialExhausted { fingerprint, .. }
            | DomainEvent::AccessDenied { fingerprint, .. }
            | DomainEvent::PromptShown { fingerprint, .. }
            | DomainEvent::PromptClicked { fingerprint, .. }
            | DomainEvent::PromptConverted { fingerprint, .. }
            | DomainEvent::SyncFailed { fingerprint, .. }
            | DomainEvent::RateLimited { fingerprint, .. }
            | DomainEvent::LedgerReset { fingerprint, .. }
            | DomainEvent::LedgerBlocked { fingerprint, .. }
            | DomainEvent::LedgerUnblocked { fingerprint } => Some(fingerprint),
            DomainEvent::IngestionDegraded { .. } | DomainEvent::IngestionRecovered => None,
        }
    }
}

/// A published event with its publication time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub event: DomainEvent,
}

/// Receiver of published events.  Must not block; sinks run inline on the
/// publishing thread.
pub trait EventSink: Send + Sync {
    fn emit(&self, record: &EventRecord);
}

/// Fan-out dispatch point.  Clones share subscribers.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use trialgate_core::events::{DomainEvent, EventBus, RecordingSink};
///
/// let bus = EventBus::new();
/// let sink = Arc::new(RecordingSink::default());
/// bus.subscribe(sink.clone());
///
/// bus.publish(DomainEvent::LedgerUnblocked { fingerprint: "f1".into() }, 0);
/// assert_eq!(sink.kinds(), vec!["ledger_unblocked"]);
/// ```
#[derive(Clone, Default)]
pub struct EventBus {
    sinks: Arc<RwLock<Vec<Arc<dyn EventSink>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sinks.read().len()
    }

    pub fn publish(&self, event: DomainEvent, timestamp_ms: u64) {
        tracing::info!(
            target: "trialgate.events",
            kind = event.kind(),
            fingerprint = event.fingerprint().unwrap_or("-"),
            timestamp_ms,
            "domain event"
        );
        let record = EventRecord { timestamp_ms, event };
        for sink in self.sinks.read().iter() {
            sink.emit(&record);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Keeps every record in memory.  Useful in tests and the demo.
#[derive(Debug, Default)]
pub struct RecordingSink {
    records: Mutex<Vec<EventRecord>>,
}

impl RecordingSink {
    pub fn records(&self) -> Vec<EventRecord> {
        self.records.lock().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.records.lock().iter().map(|record| record.event.kind()).collect()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, record: &EventRecord) {
        self.records.lock().push(record.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_receives_the_event() {
        let bus = EventBus::new();
        let first = Arc::new(RecordingSink::default());
        let second = Arc::new(RecordingSink::default());
        bus.subscribe(first.clone());
        bus.clone().subscribe(second.clone());

        bus.publish(
            DomainEvent::RateLimited {
                fingerprint: "f1".into(),
                retry_after_ms: 500,
            },
            42,
        );

        assert_eq!(first.records().len(), 1);
        assert_eq!(second.records()[0].timestamp_ms, 42);
    }

    #[test]
    fn record_serialises_flat_with_type_tag() {
        let record = EventRecord {
            timestamp_ms: 7,
            event: DomainEvent::TrialExhausted {
                fingerprint: "f1".into(),
                action_kind: ActionKind::VideoAnalysis,
            },
        };
        let json = serde_json::to_value(&record).expect("serialise");
        assert_eq!(json["type"], "trial_exhausted");
        assert_eq!(json["action_kind"], "video_analysis");
        assert_eq!(json["timestamp_ms"], 7);
    }

    #[test]
    fn kind_matches_serde_tag() {
        let event = DomainEvent::IngestionDegraded {
            consecutive_failures: 5,
        };
        let json = serde_json::to_value(&event).expect("serialise");
        assert_eq!(json["type"], event.kind());
        assert_eq!(event.fingerprint(), None);
    }
}
