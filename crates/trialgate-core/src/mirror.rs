// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Client-side optimistic mirror of a trial ledger.
//!
//! The server is authoritative.  The mirror keeps two things apart:
//!
//! * the last authoritative snapshot ([`LedgerStatus`] from a status GET)
//! * pending local consumptions not yet seen in a snapshot
//!
//! Reconciliation is one-directional: a snapshot always overwrites the
//! authoritative half, and a pending entry is dropped only once its
//! `request_id` shows up in a snapshot's recent actions (or the server
//! refused it).  Access decisions should read [`LocalMirror::authoritative`];
//! [`LocalMirror::display_remaining`] is for UI only.

use serde::{Deserialize, Serialize};

use crate::config::RetryPolicy;
use crate::error::{StoreError, TrialError};
use crate::events::{DomainEvent, EventBus};
use crate::retry;
use crate::storage::LedgerStore;
use crate::trial::{ConsumeRequest, TrialManager};
use crate::types::{ActionKind, ConsumeOutcome, LedgerStatus, Metadata};

pub use crate::trial::REQUEST_ID_KEY;

/// Upper bound on remembered pending entries.
const MAX_PENDING: usize = 64;

/// Where authoritative snapshots come from.
pub trait LedgerSource {
    fn fetch_status(&self, fingerprint: &str) -> Result<LedgerStatus, StoreError>;
}

impl<S: LedgerStore> LedgerSource for TrialManager<S> {
    fn fetch_status(&self, fingerprint: &str) -> Result<LedgerStatus, StoreError> {
        self.status(fingerprint).map_err(|error| match error {
            TrialError::Store(source) | TrialError::RetriesExhausted { source, .. } => source,
            other => StoreError::Permanent(other.to_string()),
        })
    }
}

/// A consumption the client has shown but the server has not yet confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub request_id: String,
    pub kind: ActionKind,
    /// Client-side weight hint; advisory only.
    pub weight_hint: u32,
    pub timestamp_ms: u64,
    /// The consume POST succeeded; waiting to see it in a snapshot.
    pub acknowledged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalMirror {
    fingerprint: String,
    /// Quota assumed before the first snapshot arrives.
    assumed_total: u32,
    authoritative: Option<LedgerStatus>,
    pending: Vec<PendingAction>,
    next_sequence: u64,
}

impl LocalMirror {
    pub fn new(fingerprint: &str, assumed_total: u32) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            assumed_total,
            authoritative: None,
            pending: Vec::new(),
            next_sequence: 0,
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Last snapshot received from the server.
    pub fn authoritative(&self) -> Option<&LedgerStatus> {
        self.authoritative.as_ref()
    }

    pub fn pending(&self) -> &[PendingAction] {
        &self.pending
    }

    /// What the UI should show: the snapshot minus unacknowledged pending
    /// weights.  Acknowledged entries are already reflected in `remaining`.
    pub fn display_remaining(&self) -> u32 {
        let base = self
            .authoritative
            .as_ref()
            .map_or(self.assumed_total, |status| status.remaining);
        let in_flight: u32 = self
            .pending
            .iter()
            .filter(|action| !action.acknowledged)
            .map(|action| action.weight_hint)
            .sum();
        base.saturating_sub(in_flight)
    }

    /// Record an optimistic local consumption and build the request to send.
    ///
    /// The returned request carries the idempotency id in its metadata so
    /// the server's action log can confirm it later.
    pub fn optimistic_consume(
        &mut self,
        kind: ActionKind,
        weight_hint: u32,
        now_ms: u64,
    ) -> ConsumeRequest {
        let request_id = format!("{}-{}-{}", self.fingerprint, now_ms, self.next_sequence);
        self.next_sequence += 1;

        if self.pending.len() >= MAX_PENDING {
            // Prefer forgetting entries the server already accepted.
            let victim = self
                .pending
                .iter()
                .position(|action| action.acknowledged)
                .unwrap_or(0);
            let dropped = self.pending.remove(victim);
            tracing::warn!(
                fingerprint = %self.fingerprint,
                request_id = %dropped.request_id,
                "pending mirror queue full, forgetting oldest entry"
            );
        }

        self.pending.push(PendingAction {
            request_id: request_id.clone(),
            kind,
            weight_hint,
            timestamp_ms: now_ms,
            acknowledged: false,
        });

        ConsumeRequest::new(&self.fingerprint, kind).with_metadata(REQUEST_ID_KEY, request_id)
    }

    /// Fold the server's answer to a consume POST into the mirror.
    ///
    /// Success acknowledges the pending entry and adopts the server's
    /// counters; refusal rolls the entry back.
    pub fn apply_consume_response(&mut self, request_id: &str, outcome: &ConsumeOutcome) {
        if outcome.success {
            if let Some(action) = self
                .pending
                .iter_mut()
                .find(|action| action.request_id == request_id)
            {
                action.acknowledged = true;
            }
        } else {
            self.pending.retain(|action| action.request_id != request_id);
        }

        let fingerprint = self.fingerprint.clone();
        let status = self.authoritative.get_or_insert_with(|| LedgerStatus {
            fingerprint,
            remaining: outcome.remaining,
            total: outcome.total,
            is_blocked: outcome.blocked,
            next_reset_at_ms: None,
            recent_actions: Vec::new(),
        });
        status.remaining = outcome.remaining;
        status.total = outcome.total;
        status.is_blocked = outcome.blocked;
    }

    /// Drop a pending entry whose request never reached the server.
    pub fn rollback(&mut self, request_id: &str) {
        self.pending.retain(|action| action.request_id != request_id);
    }

    /// Overwrite the authoritative half with `status` and retire the pending
    /// entries it confirms.  Returns how many were confirmed.
    pub fn reconcile(&mut self, status: LedgerStatus) -> usize {
        let before = self.pending.len();
        self.pending.retain(|pending| {
            !status.recent_actions.iter().any(|action| {
                action
                    .metadata
                    .get(REQUEST_ID_KEY)
                    .and_then(serde_json::Value::as_str)
                    == Some(pending.request_id.as_str())
            })
        });
        let confirmed = before - self.pending.len();
        tracing::debug!(
            fingerprint = %self.fingerprint,
            remaining = status.remaining,
            confirmed,
            still_pending = self.pending.len(),
            "mirror reconciled"
        );
        self.authoritative = Some(status);
        confirmed
    }

    /// Fetch a snapshot from `source` with bounded exponential backoff.
    ///
    /// On failure the local state is kept as-is.  When the retry budget is
    /// spent a [`DomainEvent::SyncFailed`] is published and
    /// [`TrialError::RetriesExhausted`] returned.
    pub fn sync<L: LedgerSource + ?Sized>(
        &mut self,
        source: &L,
        policy: &RetryPolicy,
        events: &EventBus,
        now_ms: u64,
    ) -> Result<LedgerStatus, TrialError> {
        let attempts = policy.attempts();
        let mut attempt = 0;
        let error = loop {
            attempt += 1;
            match source.fetch_status(&self.fingerprint) {
                Ok(status) => {
                    self.reconcile(status.clone());
                    return Ok(status);
                }
                Err(error) if error.is_retryable() && attempt < attempts => {
                    let delay = policy.backoff(attempt);
                    tracing::warn!(
                        fingerprint = %self.fingerprint,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "ledger sync failed, retrying"
                    );
                    retry::pause(delay);
                }
                Err(error) => break error,
            }
        };

        self.sync_failed(events, attempt, &error, now_ms);
        if error.is_retryable() {
            Err(TrialError::RetriesExhausted {
                attempts: attempt,
                source: error,
            })
        } else {
            Err(TrialError::Store(error))
        }
    }

    pub(crate) fn sync_failed(&self, events: &EventBus, attempts: u32, error: &StoreError, now_ms: u64) {
        tracing::error!(
            fingerprint = %self.fingerprint,
            attempts,
            %error,
            "ledger sync gave up; keeping local state"
        );
        events.publish(
            DomainEvent::SyncFailed {
                fingerprint: self.fingerprint.clone(),
                attempts,
                error: error.to_string(),
            },
            now_ms,
        );
    }
}

/// Metadata carried by a pending request, for callers building their own.
pub fn request_metadata(request_id: &str) -> Metadata {
    Metadata::from([(REQUEST_ID_KEY.to_owned(), serde_json::Value::from(request_id))])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use crate::config::Config;
    use crate::events::RecordingSink;
    use crate::storage::InMemoryStorage;
    use std::sync::Arc;

    struct FlakySource {
        failures_left: Cell<u32>,
        status: LedgerStatus,
    }

    impl LedgerSource for FlakySource {
        fn fetch_status(&self, _fingerprint: &str) -> Result<LedgerStatus, StoreError> {
            if self.failures_left.get() > 0 {
                self.failures_left.set(self.failures_left.get() - 1);
                Err(StoreError::Transient("network".into()))
            } else {
                Ok(self.status.clone())
            }
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            multiplier: 2.0,
            timeout_ms: 50,
        }
    }

    fn status(remaining: u32) -> LedgerStatus {
        LedgerStatus {
            fingerprint: "f1".into(),
            remaining,
            total: 5,
            is_blocked: false,
            next_reset_at_ms: None,
            recent_actions: Vec::new(),
        }
    }

    #[test]
    fn optimistic_consume_lowers_display_only() {
        let mut mirror = LocalMirror::new("f1", 5);
        mirror.reconcile(status(5));
        mirror.optimistic_consume(ActionKind::ChannelAnalysis, 2, 10);
        assert_eq!(mirror.display_remaining(), 3);
        assert_eq!(mirror.authoritative().map(|s| s.remaining), Some(5));
    }

    #[test]
    fn server_confirmation_retires_pending_entry() {
        let manager = TrialManager::new(Config::default(), InMemoryStorage::new());
        let mut mirror = LocalMirror::new("f1", 5);

        let request = mirror.optimistic_consume(ActionKind::VideoAnalysis, 1, 10);
        let request_id = mirror.pending()[0].request_id.clone();
        let outcome = manager.consume(request).unwrap();
        mirror.apply_consume_response(&request_id, &outcome);
        assert_eq!(mirror.display_remaining(), 4);
        assert_eq!(mirror.pending().len(), 1);

        let events = EventBus::new();
        mirror.sync(&manager, &fast_policy(), &events, 20).unwrap();
        assert!(mirror.pending().is_empty());
        assert_eq!(mirror.display_remaining(), 4);
    }

    #[test]
    fn unconfirmed_pending_survives_reconcile() {
        let mut mirror = LocalMirror::new("f1", 5);
        mirror.optimistic_consume(ActionKind::VideoAnalysis, 1, 10);
        assert_eq!(mirror.reconcile(status(5)), 0);
        assert_eq!(mirror.pending().len(), 1);
        assert_eq!(mirror.display_remaining(), 4);
    }

    #[test]
    fn refused_consume_rolls_back() {
        let mut mirror = LocalMirror::new("f1", 5);
        mirror.optimistic_consume(ActionKind::BulkAnalysis, 3, 10);
        let request_id = mirror.pending()[0].request_id.clone();
        let outcome = ConsumeOutcome {
            success: false,
            status: crate::types::ConsumeStatus::InsufficientTrials,
            remaining: 1,
            total: 5,
            blocked: false,
            exhausted: false,
            weight: 3,
            message: "Insufficient trials".into(),
        };
        mirror.apply_consume_response(&request_id, &outcome);
        assert!(mirror.pending().is_empty());
        assert_eq!(mirror.display_remaining(), 1);
    }

    #[test]
    fn sync_retries_then_succeeds() {
        let source = FlakySource {
            failures_left: Cell::new(2),
            status: status(2),
        };
        let mut mirror = LocalMirror::new("f1", 5);
        let synced = mirror.sync(&source, &fast_policy(), &EventBus::new(), 0).unwrap();
        assert_eq!(synced.remaining, 2);
        assert_eq!(mirror.display_remaining(), 2);
    }

    #[test]
    fn sync_failure_keeps_local_state_and_signals() {
        let source = FlakySource {
            failures_left: Cell::new(10),
            status: status(0),
        };
        let events = EventBus::new();
        let sink = Arc::new(RecordingSink::default());
        events.subscribe(sink.clone());

        let mut mirror = LocalMirror::new("f1", 5);
        mirror.reconcile(status(4));
        mirror.optimistic_consume(ActionKind::VideoAnalysis, 1, 10);

        let error = mirror.sync(&source, &fast_policy(), &events, 99).unwrap_err();
        assert!(matches!(error, TrialError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(mirror.pending().len(), 1);
        assert_eq!(mirror.display_remaining(), 3);
        assert_eq!(sink.kinds(), vec!["sync_failed"]);
    }
}
