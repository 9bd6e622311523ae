// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Async TrialGate service backed by Tokio.
//!
//! This module is only compiled when the `async` feature flag is enabled
//! (it is on by default):
//!
//! ```toml
//! [dependencies]
//! trialgate-core = { version = "0.1", features = ["async"] }
//! ```
//!
//! # Design
//!
//! [`AsyncTrialGate`] shares one [`TrialGateEngine`] behind an `Arc` and adds
//! the runtime concerns the sync engine leaves to its caller:
//!
//! * every store-touching call runs on the blocking pool under a deadline
//!   (`retry.timeout_ms`).  A missed deadline is a retryable
//!   [`StoreError::Timeout`] for reads and for charges carrying a request
//!   id (replays are answered from the ledger); a charge without one
//!   reports [`TrialError::OutcomeUnknown`], since the abandoned call may
//!   still commit
//! * behavioral events go through a bounded channel to a background worker
//!   and never block the caller; after `degraded_after_failures`
//!   consecutive failures an `ingestion_degraded` event is published, and
//!   `ingestion_recovered` on the next success
//! * [`spawn_batch_updater`](AsyncTrialGate::spawn_batch_updater) runs the
//!   optimizer batch update on a fixed interval, skipping missed ticks
//! * [`sync_mirror`](AsyncTrialGate::sync_mirror) reconciles a
//!   [`LocalMirror`] with async backoff
//!
//! # Example
//!
//! ```rust,no_run
//! use trialgate_core::{
//!     async_engine::AsyncTrialGate,
//!     config::Config,
//!     engine::{GateRequest, TrialGateEngine},
//!     storage::InMemoryStorage,
//!     types::{DeviceClass, VisitorContext},
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = TrialGateEngine::new(Config::default(), InMemoryStorage::new());
//!     let gate = AsyncTrialGate::spawn(engine);
//!     let _updater = gate.spawn_batch_updater();
//!
//!     let visitor = VisitorContext { device_class: DeviceClass::Mobile, user_type: None, hour_of_day: 8 };
//!     let decision = gate.check(GateRequest::anonymous("f1", "video_analysis", visitor)).await.unwrap();
//!     assert!(decision.access.allowed);
//! }
//! ```

#![cfg(feature = "async")]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::engine::{GateDecision, GateRequest, TrialGateEngine};
use crate::error::{StoreError, TrialError};
use crate::events::DomainEvent;
use crate::mirror::{LedgerSource, LocalMirror};
use crate::storage::{ArmStore, BehaviorStore, LedgerStore};
use crate::trial::{request_id_of, ConsumeRequest};
use crate::types::{BehavioralEvent, ConsumeOutcome, LedgerStatus};

// ---------------------------------------------------------------------------
// Ingestion health
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct IngestionHealth {
    consecutive_failures: AtomicU32,
    degraded: AtomicBool,
    threshold: u32,
}

impl IngestionHealth {
    fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            degraded: AtomicBool::new(false),
            threshold: threshold.max(1),
        }
    }

    /// `Some(failures)` when this failure tipped the service into degraded mode.
    fn failure(&self) -> Option<u32> {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        if failures >= self.threshold && !self.degraded.swap(true, Ordering::AcqRel) {
            Some(failures)
        } else {
            None
        }
    }

    /// `true` when this success ended degraded mode.
    fn success(&self) -> bool {
        self.consecutive_failures.store(0, Ordering::Release);
        self.degraded.swap(false, Ordering::AcqRel)
    }

    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// AsyncTrialGate
// ---------------------------------------------------------------------------

/// Tokio front-end for a shared [`TrialGateEngine`].
pub struct AsyncTrialGate<S>
where
    S: LedgerStore + BehaviorStore + ArmStore + 'static,
{
    engine: Arc<TrialGateEngine<S>>,
    deadline: Duration,
    ingest_tx: mpsc::Sender<BehavioralEvent>,
    health: Arc<IngestionHealth>,
}

impl<S> AsyncTrialGate<S>
where
    S: LedgerStore + BehaviorStore + ArmStore + 'static,
{
    /// Wrap `engine` and start the ingestion worker.  Must be called from
    /// within a Tokio runtime.  The worker stops once the service is dropped.
    pub fn spawn(engine: TrialGateEngine<S>) -> Self {
        let config = engine.trials.config();
        let deadline = Duration::from_millis(config.retry.timeout_ms.max(1));
        let (ingest_tx, ingest_rx) = mpsc::channel(config.ingestion.queue_capacity.max(1));
        let health = Arc::new(IngestionHealth::new(config.ingestion.degraded_after_failures));

        let engine = Arc::new(engine);
        tokio::spawn(ingestion_worker(engine.clone(), health.clone(), ingest_rx));

        Self {
            engine,
            deadline,
            ingest_tx,
            health,
        }
    }

    pub fn engine(&self) -> &Arc<TrialGateEngine<S>> {
        &self.engine
    }

    pub fn is_degraded(&self) -> bool {
        self.health.is_degraded()
    }

    // -----------------------------------------------------------------------
    // Gate and ledger
    // -----------------------------------------------------------------------

    pub async fn check(&self, request: GateRequest) -> Result<GateDecision, TrialError> {
        let replay_safe = request_id_of(&request.metadata).is_some();
        self.blocking("check", replay_safe, move |engine| engine.check(request)).await
    }

    /// Charge a trial.  Attach a request id
    /// ([`ConsumeRequest::with_request_id`]) to make a timed-out call safe
    /// to re-send.
    pub async fn consume(&self, request: ConsumeRequest) -> Result<ConsumeOutcome, TrialError> {
        let replay_safe = request.request_id().is_some();
        self.blocking("consume", replay_safe, move |engine| engine.trials.consume(request)).await
    }

    pub async fn status(&self, fingerprint: &str) -> Result<LedgerStatus, TrialError> {
        let fingerprint = fingerprint.to_owned();
        self.blocking("status", true, move |engine| engine.trials.status(&fingerprint)).await
    }

    /// Run `call` on the blocking pool under the service deadline.  The
    /// blocking task cannot be cancelled, so when `replay_safe` is false a
    /// missed deadline means the call may yet commit.
    async fn blocking<T, F>(&self, operation: &'static str, replay_safe: bool, call: F) -> Result<T, TrialError>
    where
        T: Send + 'static,
        F: FnOnce(&TrialGateEngine<S>) -> Result<T, TrialError> + Send + 'static,
    {
        let engine = self.engine.clone();
        let task = tokio::task::spawn_blocking(move || call(engine.as_ref()));
        match time::timeout(self.deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                tracing::error!(operation, error = %join_error, "blocking task failed");
                Err(TrialError::Store(StoreError::Permanent(join_error.to_string())))
            }
            Err(_) if replay_safe => {
                let deadline_ms = self.deadline.as_millis() as u64;
                tracing::warn!(operation, deadline_ms, "store call timed out");
                Err(TrialError::Store(StoreError::Timeout(deadline_ms)))
            }
            Err(_) => {
                let deadline_ms = self.deadline.as_millis() as u64;
                tracing::error!(operation, deadline_ms, "charging call timed out, outcome unknown");
                Err(TrialError::OutcomeUnknown { operation, deadline_ms })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Behavioral ingestion
    // -----------------------------------------------------------------------

    /// Queue `event` for ingestion.  Never waits: a full queue drops the
    /// event and counts as an ingestion failure.
    pub fn ingest(&self, event: BehavioralEvent) {
        match self.ingest_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!(fingerprint = %event.fingerprint, "ingestion queue full, event dropped");
                if let Some(failures) = self.health.failure() {
                    publish_degraded(&self.engine, failures);
                }
            }
            Err(TrySendError::Closed(event)) => {
                tracing::warn!(fingerprint = %event.fingerprint, "ingestion worker stopped, event dropped");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Optimizer
    // -----------------------------------------------------------------------

    /// Run the optimizer batch update every `optimizer.update_interval_ms`.
    /// Late ticks are skipped rather than bunched up.  Abort the handle to
    /// stop.
    pub fn spawn_batch_updater(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let period = Duration::from_millis(engine.optimizer.config().update_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let engine = engine.clone();
                match tokio::task::spawn_blocking(move || engine.run_batch_update()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(error)) => tracing::warn!(%error, "optimizer batch update failed"),
                    Err(error) => tracing::error!(%error, "optimizer batch task failed"),
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Mirror reconciliation
    // -----------------------------------------------------------------------

    /// Refresh `mirror` from the authoritative ledger with bounded
    /// exponential backoff.  Each attempt is subject to the service deadline.
    pub async fn sync_mirror(&self, mirror: &mut LocalMirror) -> Result<LedgerStatus, TrialError> {
        let policy = self.engine.trials.config().retry.clone();
        let attempts = policy.attempts();
        let mut attempt = 0;

        let error = loop {
            attempt += 1;
            match self.fetch_status(mirror.fingerprint()).await {
                Ok(status) => {
                    mirror.reconcile(status.clone());
                    return Ok(status);
                }
                Err(error) if error.is_retryable() && attempt < attempts => {
                    let delay = policy.backoff(attempt);
                    tracing::warn!(
                        fingerprint = %mirror.fingerprint(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "ledger sync failed, retrying"
                    );
                    time::sleep(delay).await;
                }
                Err(error) => break error,
            }
        };

        mirror.sync_failed(self.engine.events(), attempt, &error, self.engine.now_ms());
        if error.is_retryable() {
            Err(TrialError::RetriesExhausted {
                attempts: attempt,
                source: error,
            })
        } else {
            Err(TrialError::Store(error))
        }
    }

    async fn fetch_status(&self, fingerprint: &str) -> Result<LedgerStatus, StoreError> {
        let fingerprint = fingerprint.to_owned();
        let engine = self.engine.clone();
        let task = tokio::task::spawn_blocking(move || engine.trials.fetch_status(&fingerprint));
        match time::timeout(self.deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(StoreError::Permanent(join_error.to_string())),
            Err(_) => Err(StoreError::Timeout(self.deadline.as_millis() as u64)),
        }
    }
}

async fn ingestion_worker<S>(
    engine: Arc<TrialGateEngine<S>>,
    health: Arc<IngestionHealth>,
    mut events: mpsc::Receiver<BehavioralEvent>,
) where
    S: LedgerStore + BehaviorStore + ArmStore + 'static,
{
    while let Some(event) = events.recv().await {
        let fingerprint = event.fingerprint.clone();
        match engine.scoring.ingest(event) {
            Ok(()) => {
                if health.success() {
                    tracing::info!("behavioral ingestion recovered");
                    engine.events().publish(DomainEvent::IngestionRecovered, engine.now_ms());
                }
            }
            Err(error) => {
                tracing::warn!(%fingerprint, %error, "behavioral event dropped");
                if let Some(failures) = health.failure() {
                    publish_degraded(&engine, failures);
                }
            }
        }
    }
    tracing::debug!("ingestion worker stopped");
}

fn publish_degraded<S>(engine: &TrialGateEngine<S>, consecutive_failures: u32)
where
    S: LedgerStore + BehaviorStore + ArmStore,
{
    tracing::warn!(consecutive_failures, "behavioral ingestion degraded");
    engine
        .events()
        .publish(DomainEvent::IngestionDegraded { consecutive_failures }, engine.now_ms());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::RecordingSink;
    use crate::storage::InMemoryStorage;
    use crate::types::{
        DeviceClass, EventKind, Experiment, FeedbackEvent, FeedbackKind, PromptCandidate, PromptConfig,
        PromptStyle, RewardMetric, TriggerType, TrialLedger, VisitorContext,
    };

    /// In-memory storage whose behavioral writes can be switched off.
    #[derive(Clone, Default)]
    struct SwitchableStore {
        inner: InMemoryStorage,
        failing: Arc<AtomicBool>,
    }

    impl LedgerStore for SwitchableStore {
        fn get_ledger(&self, fingerprint: &str) -> Result<Option<TrialLedger>, StoreError> {
            self.inner.get_ledger(fingerprint)
        }

        fn put_ledger(&self, ledger: &TrialLedger, expected_version: Option<u64>) -> Result<(), StoreError> {
            self.inner.put_ledger(ledger, expected_version)
        }
    }

    impl BehaviorStore for SwitchableStore {
        fn append_event(&self, event: BehavioralEvent, max_events: usize) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Transient("behavior store offline".into()));
            }
            self.inner.append_event(event, max_events)
        }

        fn events_since(&self, fingerprint: &str, since_ms: u64) -> Result<Vec<BehavioralEvent>, StoreError> {
            self.inner.events_since(fingerprint, since_ms)
        }

        fn evict_before(&self, cutoff_ms: u64) -> Result<usize, StoreError> {
            self.inner.evict_before(cutoff_ms)
        }
    }

    impl ArmStore for SwitchableStore {
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

    fn visitor() -> VisitorContext {
        VisitorContext {
            device_class: DeviceClass::Tablet,
            user_type: None,
            hour_of_day: 21,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn check_and_status_run_off_the_runtime() {
        let gate = AsyncTrialGate::spawn(TrialGateEngine::new(Config::default(), InMemoryStorage::new()));
        let decision = gate
            .check(GateRequest::anonymous("f1", "keyword_research", visitor()))
            .await
            .unwrap();
        assert!(decision.access.allowed);

        let outcome = gate.consume(ConsumeRequest::new("f1", "video_analysis")).await.unwrap();
        assert!(outcome.success);

        let status = gate.status("f1").await.unwrap();
        assert_eq!(status.remaining, outcome.remaining);
    }

    #[tokio::test]
    async fn ingestion_degrades_and_recovers() {
        let mut config = Config::default();
        config.ingestion.degraded_after_failures = 3;
        let store = SwitchableStore::default();
        let gate = AsyncTrialGate::spawn(TrialGateEngine::new(config, store.clone()));
        let sink = Arc::new(RecordingSink::default());
        gate.engine().events().subscribe(sink.clone());

        store.failing.store(true, Ordering::SeqCst);
        for index in 0..3 {
            gate.ingest(BehavioralEvent::new("f1", "s1", EventKind::Click, index));
        }
        assert!(wait_until(|| gate.is_degraded()).await);

        store.failing.store(false, Ordering::SeqCst);
        gate.ingest(BehavioralEvent::new("f1", "s1", EventKind::Click, 10));
        assert!(wait_until(|| !gate.is_degraded()).await);

        let kinds = sink.kinds();
        assert_eq!(kinds, vec!["ingestion_degraded", "ingestion_recovered"]);
    }

    #[tokio::test]
    async fn batch_updater_applies_feedback() {
        let mut config = Config::default();
        config.optimizer.update_interval_ms = 10;
        let engine = TrialGateEngine::new(config, InMemoryStorage::new());
        let experiment = Experiment::with_defaults("login", RewardMetric::ClickThroughRate, engine.optimizer.config());
        engine.optimizer.register_experiment(experiment).unwrap();
        let prompt = PromptConfig {
            copy: "keep_going".into(),
            style: PromptStyle {
                color: "orange".into(),
                size: "small".into(),
            },
            timing_hint: TriggerType::ExitIntent,
        };
        engine
            .optimizer
            .add_candidate(PromptCandidate::new("arm-a", "login", prompt))
            .unwrap();

        let gate = AsyncTrialGate::spawn(engine);
        gate.engine().optimizer.record_feedback(FeedbackEvent {
            event_id: "imp-1".into(),
            arm_id: "arm-a".into(),
            kind: FeedbackKind::Impression,
            timestamp_ms: gate.engine().now_ms(),
        });
        let updater = gate.spawn_batch_updater();

        let engine = gate.engine().clone();
        let applied = wait_until(move || {
            engine
                .optimizer
                .candidates("login")
                .map(|arms| arms[0].performance.impressions == 1)
                .unwrap_or(false)
        })
        .await;
        updater.abort();
        assert!(applied);
    }

    /// In-memory ledgers whose writes stall past the service deadline.
    #[derive(Clone, Default)]
    struct SlowLedgers {
        inner: InMemoryStorage,
        stall_ms: Arc<AtomicU32>,
    }

    impl LedgerStore for SlowLedgers {
        fn get_ledger(&self, fingerprint: &str) -> Result<Option<TrialLedger>, StoreError> {
            self.inner.get_ledger(fingerprint)
        }

        fn put_ledger(&self, ledger: &TrialLedger, expected_version: Option<u64>) -> Result<(), StoreError> {
            let stall = self.stall_ms.load(Ordering::SeqCst);
            if stall > 0 {
                std::thread::sleep(Duration::from_millis(u64::from(stall)));
            }
            self.inner.put_ledger(ledger, expected_version)
        }
    }

    impl BehaviorStore for SlowLedgers {
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

    impl ArmStore for SlowLedgers {
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

    fn slow_gate(store: &SlowLedgers) -> AsyncTrialGate<SlowLedgers> {
        let mut config = Config::default();
        config.retry.timeout_ms = 20;
        let gate = AsyncTrialGate::spawn(TrialGateEngine::new(config, store.clone()));
        // Create the ledger while writes are still fast.
        gate.engine().trials.initialize("f1").unwrap();
        gate
    }

    #[tokio::test]
    async fn timed_out_charge_without_request_id_is_not_retryable() {
        let store = SlowLedgers::default();
        let gate = slow_gate(&store);
        store.stall_ms.store(150, Ordering::SeqCst);

        let error = gate
            .consume(ConsumeRequest::new("f1", "video_analysis"))
            .await
            .unwrap_err();
        assert!(matches!(error, TrialError::OutcomeUnknown { operation: "consume", .. }));
        assert!(!error.is_retryable());

        // The abandoned call still lands.
        store.stall_ms.store(0, Ordering::SeqCst);
        let engine = gate.engine().clone();
        assert!(wait_until(move || engine.trials.status("f1").map(|s| s.remaining == 4).unwrap_or(false)).await);
    }

    #[tokio::test]
    async fn timed_out_charge_with_request_id_is_charged_once() {
        let store = SlowLedgers::default();
        let gate = slow_gate(&store);
        store.stall_ms.store(150, Ordering::SeqCst);

        let request = ConsumeRequest::new("f1", "channel_analysis").with_request_id("req-7");
        let error = gate.consume(request.clone()).await.unwrap_err();
        assert_eq!(error, TrialError::Store(StoreError::Timeout(20)));
        assert!(error.is_retryable());

        store.stall_ms.store(0, Ordering::SeqCst);
        let engine = gate.engine().clone();
        assert!(wait_until(move || engine.trials.status("f1").map(|s| s.remaining == 3).unwrap_or(false)).await);

        let outcome = gate.consume(request).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.weight, 2);
        assert_eq!(outcome.remaining, 3);
        assert_eq!(gate.status("f1").await.unwrap().remaining, 3);
        assert_eq!(gate.engine().trials.initialize("f1").unwrap().actions.len(), 1);
    }

    #[tokio::test]
    async fn mirror_sync_reconciles() {
        let gate = AsyncTrialGate::spawn(TrialGateEngine::new(Config::default(), InMemoryStorage::new()));
        let mut mirror = LocalMirror::new("f9", 5);
        let request = mirror.optimistic_consume(crate::types::ActionKind::TrendReport, 1, 0);
        let request_id = request
            .metadata
            .get(crate::mirror::REQUEST_ID_KEY)
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned)
            .unwrap();
        assert_eq!(mirror.display_remaining(), 4);

        gate.consume(request).await.unwrap();
        let status = gate.sync_mirror(&mut mirror).await.unwrap();
        assert_eq!(status.remaining, 4);
        assert!(mirror.pending().iter().all(|pending| pending.request_id != request_id));
        assert_eq!(mirror.display_remaining(), 4);
    }
}
