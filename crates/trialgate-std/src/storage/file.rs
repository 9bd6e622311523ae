// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! File-based JSON storage backend.
//!
//! [`FileStorage`] persists ledgers, behavioral windows and bandit arms to a
//! single JSON file on disk.  Every mutation flushes the file atomically
//! (write-rename) so that a crash mid-write does not corrupt existing data.
//!
//! ## Layout
//!
//! ```json
//! {
//!   "ledgers":     { "<fingerprint>":   TrialLedger,            ... },
//!   "events":      { "<fingerprint>":   [ BehavioralEvent, ... ], ... },
//!   "experiments": { "<experiment_id>": Experiment,             ... },
//!   "arms":        [ PromptCandidate, ... ]
//! }
//! ```
//!
//! ## Caveats
//!
//! * The full state is held in memory and rewritten on every mutation.  It is
//!   not intended for high-frequency write workloads; behavioral ingestion in
//!   particular should go through a bounded window.
//! * Compare-and-swap holds within one process only.  Concurrent access from
//!   multiple processes is not supported.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use trialgate_core::error::StoreError;
use trialgate_core::storage::{check_version, ArmStore, BehaviorStore, LedgerStore};
use trialgate_core::types::{BehavioralEvent, Experiment, PromptCandidate, TrialLedger};

/// Everything the file holds, serialised to / deserialised from disk.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StorageSnapshot {
    #[serde(default)]
    ledgers: BTreeMap<String, TrialLedger>,
    #[serde(default)]
    events: BTreeMap<String, Vec<BehavioralEvent>>,
    #[serde(default)]
    experiments: BTreeMap<String, Experiment>,
    /// Registration order is the vector order.
    #[serde(default)]
    arms: Vec<PromptCandidate>,
}

/// A file-backed store implementing [`LedgerStore`], [`BehaviorStore`] and
/// [`ArmStore`].
///
/// A failed flush leaves both the file and the in-memory view unchanged and
/// reports [`StoreError::Transient`], so the trial manager's retry policy
/// applies to disk hiccups the same way it does to network stores.
///
/// # Examples
///
/// ```rust,no_run
/// use trialgate_core::storage::LedgerStore;
/// use trialgate_core::types::TrialLedger;
/// use trialgate_std::FileStorage;
///
/// let storage = FileStorage::open("/tmp/trialgate.json").expect("could not open storage");
/// storage.put_ledger(&TrialLedger::new("device-1", 5, 0, None), None).unwrap();
/// assert_eq!(storage.get_ledger("device-1").unwrap().unwrap().remaining, 5);
/// ```
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    data: RwLock<StorageSnapshot>,
}

impl FileStorage {
    /// Open an existing JSON storage file, or start empty if the path does
    /// not exist yet.  The file itself is created on the first mutation.
    ///
    /// # Errors
    ///
    /// Returns an [`io::Error`] if the file exists but cannot be read or if
    /// the JSON is malformed.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw).map_err(|error| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("trialgate storage JSON parse error: {error}"),
                )
            })?
        } else {
            StorageSnapshot::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush the current in-memory state to disk.
    ///
    /// # Errors
    ///
    /// Returns an [`io::Error`] if serialisation fails or the file cannot be
    /// written or renamed.
    pub fn flush(&self) -> io::Result<()> {
        write_snapshot(&self.path, &self.data.read())
    }

    /// Apply `mutation` to a copy of the state, persist the copy, then swap it
    /// in.  The write lock is held throughout so mutations are serialised.
    fn mutate<T>(
        &self,
        mutation: impl FnOnce(&mut StorageSnapshot) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.data.write();
        let mut next = guard.clone();
        let value = mutation(&mut next)?;
        write_snapshot(&self.path, &next).map_err(|error| {
            tracing::warn!(path = %self.path.display(), %error, "storage flush failed");
            StoreError::Transient(format!("flush {}: {error}", self.path.display()))
        })?;
        *guard = next;
        Ok(value)
    }
}

/// Atomic write-rename: `<path>.tmp` is written first, then renamed over the
/// target, so a crash during the write never leaves a partial file.
fn write_snapshot(path: &Path, snapshot: &StorageSnapshot) -> io::Result<()> {
    let json = serde_json::to_string_pretty(snapshot).map_err(|error| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("trialgate storage serialisation error: {error}"),
        )
    })?;

    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

impl LedgerStore for FileStorage {
    fn get_ledger(&self, fingerprint: &str) -> Result<Option<TrialLedger>, StoreError> {
        Ok(self.data.read().ledgers.get(fingerprint).cloned())
    }

    fn put_ledger(&self, ledger: &TrialLedger, expected_version: Option<u64>) -> Result<(), StoreError> {
        self.mutate(|data| {
            check_version(
                &ledger.fingerprint,
                data.ledgers.get(&ledger.fingerprint),
                expected_version,
            )?;
            data.ledgers.insert(ledger.fingerprint.clone(), ledger.clone());
            Ok(())
        })
    }
}

impl BehaviorStore for FileStorage {
    fn append_event(&self, event: BehavioralEvent, max_events: usize) -> Result<(), StoreError> {
        self.mutate(|data| {
            let window = data.events.entry(event.fingerprint.clone()).or_default();
            window.push(event);
            if window.len() > max_events {
                let overflow = window.len() - max_events;
                window.drain(..overflow);
            }
            Ok(())
        })
    }

    fn events_since(&self, fingerprint: &str, since_ms: u64) -> Result<Vec<BehavioralEvent>, StoreError> {
        Ok(self
            .data
            .read()
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
        let stale = self
            .data
            .read()
            .events
            .values()
            .flatten()
            .filter(|event| event.timestamp_ms < cutoff_ms)
            .count();
        if stale == 0 {
            return Ok(0);
        }
        self.mutate(|data| {
            let mut removed = 0;
            for window in data.events.values_mut() {
                let before = window.len();
                window.retain(|event| event.timestamp_ms >= cutoff_ms);
                removed += before - window.len();
            }
            data.events.retain(|_, window| !window.is_empty());
            Ok(removed)
        })
    }
}

impl ArmStore for FileStorage {
    fn get_experiment(&self, experiment_id: &str) -> Result<Option<Experiment>, StoreError> {
        Ok(self.data.read().experiments.get(experiment_id).cloned())
    }

    fn put_experiment(&self, experiment: &Experiment) -> Result<(), StoreError> {
        self.mutate(|data| {
            data.experiments.insert(experiment.id.clone(), experiment.clone());
            Ok(())
        })
    }

    fn arms(&self, experiment_id: &str) -> Result<Vec<PromptCandidate>, StoreError> {
        Ok(self
            .data
            .read()
            .arms
            .iter()
            .filter(|arm| arm.experiment_id == experiment_id)
            .cloned()
            .collect())
    }

    fn get_arm(&self, arm_id: &str) -> Result<Option<PromptCandidate>, StoreError> {
        Ok(self.data.read().arms.iter().find(|arm| arm.id == arm_id).cloned())
    }

    fn put_arm(&self, arm: &PromptCandidate) -> Result<(), StoreError> {
        self.mutate(|data| {
            match data.arms.iter_mut().find(|existing| existing.id == arm.id) {
                Some(existing) => *existing = arm.clone(),
                None => data.arms.push(arm.clone()),
            }
            Ok(())
        })
    }

    fn evict_arm(&self, arm_id: &str) -> Result<(), StoreError> {
        self.mutate(|data| {
            data.arms.retain(|arm| arm.id != arm_id);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use trialgate_core::types::{EventKind, PromptConfig, PromptStyle, TriggerType};

    static NEXT: AtomicUsize = AtomicUsize::new(0);

    /// A fresh path under the system temp dir, removed on drop.
    struct ScratchFile(PathBuf);

    impl ScratchFile {
        fn new() -> Self {
            let name = format!(
                "trialgate-std-{}-{}.json",
                std::process::id(),
                NEXT.fetch_add(1, Ordering::SeqCst)
            );
            Self(std::env::temp_dir().join(name))
        }
    }

    impl Drop for ScratchFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    fn arm(id: &str) -> PromptCandidate {
        PromptCandidate::new(
            id,
            "exp",
            PromptConfig {
                copy: "save_your_work".into(),
                style: PromptStyle {
                    color: "blue".into(),
                    size: "medium".into(),
                },
                timing_hint: TriggerType::Immediate,
            },
        )
    }

    #[test]
    fn ledgers_survive_reopen() {
        let scratch = ScratchFile::new();
        {
            let storage = FileStorage::open(&scratch.0).unwrap();
            let mut ledger = TrialLedger::new("f1", 5, 0, None);
            storage.put_ledger(&ledger, None).unwrap();
            ledger.remaining = 3;
            ledger.version = 1;
            storage.put_ledger(&ledger, Some(0)).unwrap();
        }

        let reopened = FileStorage::open(&scratch.0).unwrap();
        let ledger = reopened.get_ledger("f1").unwrap().unwrap();
        assert_eq!(ledger.remaining, 3);
        assert_eq!(ledger.version, 1);
    }

    #[test]
    fn stale_write_is_rejected_and_not_persisted() {
        let scratch = ScratchFile::new();
        let storage = FileStorage::open(&scratch.0).unwrap();
        let ledger = TrialLedger::new("f1", 5, 0, None);
        storage.put_ledger(&ledger, None).unwrap();

        let mut stale = ledger.clone();
        stale.remaining = 0;
        let error = storage.put_ledger(&stale, None).unwrap_err();
        assert!(matches!(error, StoreError::VersionConflict { found: Some(0), .. }));

        let reopened = FileStorage::open(&scratch.0).unwrap();
        assert_eq!(reopened.get_ledger("f1").unwrap().unwrap().remaining, 5);
    }

    #[test]
    fn event_window_is_bounded_and_evictable() {
        let scratch = ScratchFile::new();
        let storage = FileStorage::open(&scratch.0).unwrap();
        for timestamp in 0..5u64 {
            let event = BehavioralEvent::new("f1", "s1", EventKind::PageView, timestamp);
            storage.append_event(event, 3).unwrap();
        }
        let stamps: Vec<u64> = storage
            .events_since("f1", 0)
            .unwrap()
            .iter()
            .map(|event| event.timestamp_ms)
            .collect();
        assert_eq!(stamps, vec![2, 3, 4]);

        assert_eq!(storage.evict_before(4).unwrap(), 2);
        assert_eq!(storage.evict_before(4).unwrap(), 0);
        assert_eq!(FileStorage::open(&scratch.0).unwrap().events_since("f1", 0).unwrap().len(), 1);
    }

    #[test]
    fn arms_keep_registration_order_across_reopen() {
        let scratch = ScratchFile::new();
        let storage = FileStorage::open(&scratch.0).unwrap();
        for id in ["b", "a", "c"] {
            storage.put_arm(&arm(id)).unwrap();
        }
        let mut updated = arm("a");
        updated.performance.impressions = 7;
        storage.put_arm(&updated).unwrap();
        storage.evict_arm("c").unwrap();

        let reopened = FileStorage::open(&scratch.0).unwrap();
        let arms = reopened.arms("exp").unwrap();
        let ids: Vec<&str> = arms.iter().map(|arm| arm.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(arms[1].performance.impressions, 7);
    }

    #[test]
    fn malformed_file_is_reported() {
        let scratch = ScratchFile::new();
        std::fs::write(&scratch.0, "{ not json").unwrap();
        let error = FileStorage::open(&scratch.0).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn failed_flush_leaves_state_untouched() {
        let dir = std::env::temp_dir().join(format!("trialgate-std-missing-{}", std::process::id()));
        let storage = FileStorage::open(dir.join("nested").join("state.json")).unwrap();
        let error = storage
            .put_ledger(&TrialLedger::new("f1", 5, 0, None), None)
            .unwrap_err();
        assert!(error.is_retryable());
        assert!(storage.get_ledger("f1").unwrap().is_none());
    }
}
