// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Store faults: retries, exhaustion and fail-closed access.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use trialgate_core::{
    config::{Config, RetryPolicy},
    engine::{GateRequest, TrialGateEngine},
    error::{StoreError, TrialError},
    storage::{ArmStore, BehaviorStore, InMemoryStorage, LedgerStore},
    trial::{ConsumeRequest, TrialManager},
    types::{
        AccessReason, BehavioralEvent, DeviceClass, Experiment, PromptCandidate, TrialLedger, VisitorContext,
    },
};

/// Fails the next `failures` ledger reads with `error`.
#[derive(Clone)]
struct FlakyStore {
    inner: InMemoryStorage,
    failures: Arc<AtomicU32>,
    error: StoreError,
}

impl FlakyStore {
    fn new(failures: u32, error: StoreError) -> Self {
        Self {
            inner: InMemoryStorage::new(),
            failures: Arc::new(AtomicU32::new(failures)),
            error,
        }
    }

    fn trip(&self) -> Result<(), StoreError> {
        let tripped = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if tripped {
            Err(self.error.clone())
        } else {
            Ok(())
        }
    }
}

impl LedgerStore for FlakyStore {
    fn get_ledger(&self, fingerprint: &str) -> Result<Option<TrialLedger>, StoreError> {
        self.trip()?;
        self.inner.get_ledger(fingerprint)
    }

    fn put_ledger(&self, ledger: &TrialLedger, expected_version: Option<u64>) -> Result<(), StoreError> {
        self.inner.put_ledger(ledger, expected_version)
    }
}

impl BehaviorStore for FlakyStore {
    fn append_event(&self, event: BehavioralEvent, max_events: usize) -> Result<(), StoreError> {
        self.inner.append_event(event, max_events)
    }

    fn events_since(&self, fingerprint: &str, since_ms: u64) -> Result<Vec<BehavioralEvent>, StoreError> {
        self.inner.events_since(fingerprint, since_ms)
    }

    fn evict_before(&self, cutoff_ms: u64) -> Result<usize, StoreError> {
        self.inner.evict_before(cutoff_ms)
    }
}

impl ArmStore for FlakyStore {
    fn get_experiment(&self, experiment_id: &str) -> Result<Option<Experiment>, StoreError> {
        self.inner.get_experiment(experiment_id)
    }

    fn put_experiment(&self, experiment: &Experiment) -> Result<(), StoreError> {
        self.inner.put_experiment(experiment)
    }

    fn arms(&self, experiment_id: &str) -> Result<Vec<PromptCandidate>, StoreError> {
        self.inner.arms(experiment_id)
    }

    fn get_arm(&self, arm_id: &str) -> Result<Option<PromptCandidate>, StoreError> {
        self.inner.get_arm(arm_id)
    }

    fn put_arm(&self, arm: &PromptCandidate) -> Result<(), StoreError> {
        self.inner.put_arm(arm)
    }

    fn evict_arm(&self, arm_id: &str) -> Result<(), StoreError> {
        self.inner.evict_arm(arm_id)
    }
}

fn fast_retry() -> Config {
    Config {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            ..RetryPolicy::default()
        },
        ..Config::default()
    }
}

#[test]
fn transient_failures_within_budget_are_absorbed() {
    let manager = TrialManager::new(fast_retry(), FlakyStore::new(2, StoreError::Transient("reset".into())));
    let outcome = manager.consume(ConsumeRequest::new("f1", "video_analysis")).unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.remaining, 4);
}

#[test]
fn exhausted_retries_surface_an_explicit_error() {
    let manager = TrialManager::new(fast_retry(), FlakyStore::new(100, StoreError::Timeout(50)));
    let error = manager.consume(ConsumeRequest::new("f1", "video_analysis")).unwrap_err();
    assert!(matches!(error, TrialError::RetriesExhausted { attempts: 3, .. }));
    assert_eq!(error.status_code(), 503);
}

#[test]
fn permanent_failure_is_not_retried() {
    let store = FlakyStore::new(1, StoreError::Permanent("corrupt".into()));
    let manager = TrialManager::new(fast_retry(), store.clone());
    let error = manager.status("f1").unwrap_err();
    assert_eq!(error, TrialError::Store(StoreError::Permanent("corrupt".into())));
    // The single injected failure was consumed by exactly one attempt.
    assert!(manager.status("f1").is_ok());
}

#[test]
fn unavailable_ledger_fails_closed() {
    let engine = TrialGateEngine::new(fast_retry(), FlakyStore::new(100, StoreError::Transient("down".into())));
    let visitor = VisitorContext {
        device_class: DeviceClass::Desktop,
        user_type: None,
        hour_of_day: 3,
    };
    let decision = engine
        .check(GateRequest::anonymous("f1", "video_analysis", visitor))
        .unwrap();
    assert!(!decision.access.allowed);
    assert_eq!(decision.access.reason, AccessReason::Unavailable);
    assert!(decision.prompt.is_none());
}
