// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Storage abstractions.
//!
//! Each component receives the store it needs instead of reaching for a
//! process-wide cache:
//!
//! * [`LedgerStore`]   — trial ledgers, with compare-and-swap writes
//! * [`BehaviorStore`] — rolling per-fingerprint event windows
//! * [`ArmStore`]      — bandit experiments and their candidate arms
//!
//! [`InMemoryStorage`] implements all three and is what tests and the WASM
//! bindings use.  Durable implementations live in downstream crates
//! (`trialgate-std` ships a JSON file store).
//!
//! All methods take `&self`; implementations handle their own locking so a
//! single store can be shared across threads behind an `Arc` or a cheap
//! `Clone`.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::error::StoreError;
use crate::types::{BehavioralEvent, Experiment, PromptCandidate, TrialLedger};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Durable per-fingerprint ledger records.
pub trait LedgerStore: Send + Sync {
    /// Fetch the ledger for `fingerprint`, if one exists.
    fn get_ledger(&self, fingerprint: &str) -> Result<Option<TrialLedger>, StoreError>;

    /// Write `ledger` only if the stored version equals `expected_version`.
    ///
    /// `expected_version == None` means "insert; the record must not exist".
    /// A mismatch returns [`StoreError::VersionConflict`] and leaves the
    /// stored record untouched.
    fn put_ledger(
        &self,
        ledger: &TrialLedger,
        expected_version: Option<u64>,
    ) -> Result<(), StoreError>;
}

/// Rolling behavioral event windows.
pub trait BehaviorStore: Send + Sync {
    /// Append `event` to its fingerprint's window, evicting the oldest events
    /// beyond `max_events`.
    fn append_event(&self, event: BehavioralEvent, max_events: usize) -> Result<(), StoreError>;

    /// Events for `fingerprint` at or after `since_ms`, oldest first.
    fn events_since(
        &self,
        fingerprint: &str,
        since_ms: u64,
    ) -> Result<Vec<BehavioralEvent>, StoreError>;

    /// Drop every event older than `cutoff_ms`; returns how many were removed.
    fn evict_before(&self, cutoff_ms: u64) -> Result<usize, StoreError>;
}

/// Bandit experiments and arms.
pub trait ArmStore: Send + Sync {
    fn get_experiment(&self, experiment_id: &str) -> Result<Option<Experiment>, StoreError>;

    fn put_experiment(&self, experiment: &Experiment) -> Result<(), StoreError>;

    /// Arms of `experiment_id` in registration order.
    fn arms(&self, experiment_id: &str) -> Result<Vec<PromptCandidate>, StoreError>;

    fn get_arm(&self, arm_id: &str) -> Result<Option<PromptCandidate>, StoreError>;

    /// Insert or overwrite an arm.
    fn put_arm(&self, arm: &PromptCandidate) -> Result<(), StoreError>;

    fn evict_arm(&self, arm_id: &str) -> Result<(), StoreError>;
}

impl<T: LedgerStore + ?Sized> LedgerStore for Arc<T> {
    fn get_ledger(&self, fingerprint: &str) -> Result<Option<TrialLedger>, StoreError> {
        (**self).get_ledger(fingerprint)
    }

    fn put_ledger(
        &self,
        ledger: &TrialLedger,
        expected_version: Option<u64>,
    ) -> Result<(), StoreError> {
        (**self).put_ledger(ledger, expected_version)
    }
}

impl<T: BehaviorStore + ?Sized> BehaviorStore for Arc<T> {
    fn append_event(&self, event: BehavioralEvent, max_events: usize) -> Result<(), StoreError> {
        (**self).append_event(event, max_events)
    }

    fn events_since(
        &self,
        fingerprint: &str,
        since_ms: u64,
    ) -> Result<Vec<BehavioralEvent>, StoreError> {
        (**self).events_since(fingerprint, since_ms)
    }

    fn evict_before(&self, cutoff_ms: u64) -> Result<usize, StoreError> {
        (**self).evict_before(cutoff_ms)
    }
}

impl<T: ArmStore + ?Sized> ArmStore for Arc<T> {
    fn get_experiment(&self, experiment_id: &str) -> Result<Option<Experiment>, StoreError> {
        (**self).get_experiment(experiment_id)
    }

    fn put_experiment(&self, experiment: &Experiment) -> Result<(), StoreError> {
        (**self).put_experiment(experiment)
    }

    fn arms(&self, experiment_id: &str) -> Result<Vec<PromptCandidate>, StoreError> {
        (**self).arms(experiment_id)
    }

    fn get_arm(&self, arm_id: &str) -> Result<Option<PromptCandidate>, StoreError> {
        (**self).get_arm(arm_id)
    }

    fn put_arm(&self, arm: &PromptCandidate) -> Result<(), StoreError> {
        (**self).put_arm(arm)
    }

    fn evict_arm(&self, arm_id: &str) -> Result<(), StoreError> {
        (**self).evict_arm(arm_id)
    }
}

/// Shared compare-and-swap check used by every in-process store.
pub fn check_version(
    key: &str,
    stored: Option<&TrialLedger>,
    expected_version: Option<u64>,
) -> Result<(), StoreError> {
    let found = stored.map(|ledger| ledger.version);
    if found == expected_version {
        Ok(())
    } else {
        Err(StoreError::VersionConflict {
            key: key.into(),
            expected: expected_version,
            found,
        })
    }
}

// ---------------------------------------------------------------------------
// InMemoryStorage
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryState {
    ledgers: HashMap<String, TrialLedger>,
    /// Key: fingerprint → events, oldest first.
    events: HashMap<String, Vec<BehavioralEvent>>,
    experiments: HashMap<String, Experiment>,
    /// Key: arm id → arm.
    arms: HashMap<String, PromptCandidate>,
    /// Key: experiment id → arm ids in registration order.
    arm_order: HashMap<String, Vec<String>>,
}

/// A volatile [`hashbrown::HashMap`]-backed store.
///
/// Clones share the same underlying state, so one instance can be handed to
/// the trial manager, the scoring engine and the optimizer.
///
/// # Examples
///
/// ```rust
/// use trialgate_core::storage::{InMemoryStorage, LedgerStore};
/// use trialgate_core::types::TrialLedger;
///
/// let store = InMemoryStorage::new();
/// let ledger = TrialLedger::new("f1", 5, 0, None);
/// store.put_ledger(&ledger, None).unwrap();
///
/// // A second insert loses the compare-and-swap.
/// assert!(store.put_ledger(&ledger, None).is_err());
/// assert_eq!(store.get_ledger("f1").unwrap().unwrap().remaining, 5);
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryStorage {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryStorage {
    /// Create a new, empty [`InMemoryStorage`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ledgers held.
    pub fn ledger_count(&self) -> usize {
        self.state.read().ledgers.len()
    }
}

impl LedgerStore for InMemoryStorage {
    fn get_ledger(&self, fingerprint: &str) -> Result<Option<TrialLedger>, StoreError> {
        Ok(self.state.read().ledgers.get(fingerprint).cloned())
    }

    fn put_ledger(
        &self,
        ledger: &TrialLedger,
        expected_version: Option<u64>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        check_version(
            &ledger.fingerprint,
            state.ledgers.get(&ledger.fingerprint),
            expected_version,
        )?;
        state.ledgers.insert(ledger.fingerprint.clone(), ledger.clone());
        Ok(())
    }
}

impl BehaviorStore for InMemoryStorage {
    fn append_event(&self, event: BehavioralEvent, max_events: usize) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let window = state.events.entry(event.fingerprint.clone()).or_default();
        window.push(event);
        if window.len() > max_events {
            let overflow = window.len() - max_events;
            window.drain(..overflow);
        }
        Ok(())
    }

    fn events_since(
        &self,
        fingerprint: &str,
        since_ms: u64,
    ) -> Result<Vec<BehavioralEvent>, StoreError> {
        let state = self.state.read();
        Ok(state
            .events
            .get(fingerprint)
            .map(|window| {
                window
                    .iter()
                    .filter(|event| event.timestamp_ms >= since_ms)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn evict_before(&self, cutoff_ms: u64) -> Result<usize, StoreError> {
        let mut state = self.state.write();
        let mut removed = 0;
        for window in state.events.values_mut() {
            let before = window.len();
            window.retain(|event| event.timestamp_ms >= cutoff_ms);
            removed += before - window.len();
        }
        state.events.retain(|_, window| !window.is_empty());
        Ok(removed)
    }
}

impl ArmStore for InMemoryStorage {
    fn get_experiment(&self, experiment_id: &str) -> Result<Option<Experiment>, StoreError> {
        Ok(self.state.read().experiments.get(experiment_id).cloned())
    }

    fn put_experiment(&self, experiment: &Experiment) -> Result<(), StoreError> {
        self.state
            .write()
            .experiments
            .insert(experiment.id.clone(), experiment.clone());
        Ok(())
    }

    fn arms(&self, experiment_id: &str) -> Result<Vec<PromptCandidate>, StoreError> {
        let state = self.state.read();
        Ok(state
            .arm_order
            .get(experiment_id)
            .map(|ids| ids.iter().filter_map(|id| state.arms.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    fn get_arm(&self, arm_id: &str) -> Result<Option<PromptCandidate>, StoreError> {
        Ok(self.state.read().arms.get(arm_id).cloned())
    }

    fn put_arm(&self, arm: &PromptCandidate) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if !state.arms.contains_key(&arm.id) {
            state
                .arm_order
                .entry(arm.experiment_id.clone())
                .or_default()
                .push(arm.id.clone());
        }
        state.arms.insert(arm.id.clone(), arm.clone());
        Ok(())
    }

    fn evict_arm(&self, arm_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if let Some(arm) = state.arms.remove(arm_id) {
            if let Some(ids) = state.arm_order.get_mut(&arm.experiment_id) {
                ids.retain(|id| id != arm_id);
            }
        }
        Ok(())
    }
}
