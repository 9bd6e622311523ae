// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! TrialGate engine: the top-level composition of every component.
//!
//! [`TrialGateEngine`] exposes the trial manager, resolver, scoring engine
//! and optimizer as public fields and wires them to one [`EventBus`] with an
//! [`AuditTrail`] subscribed.
//!
//! ## Evaluation order of [`check`](TrialGateEngine::check)
//!
//! 1. **Ledger** — anonymous callers get their ledger loaded (or created).
//!    A store failure fails closed with reason `unavailable`.
//! 2. **Resolve** — the resolver produces the verdict.
//! 3. **Consume** — a `trial` verdict debits the ledger.  Losing the race
//!    for the last trial turns the verdict into `exhausted`.
//! 4. **Prompt** — a denial publishes `access_denied`, asks the scoring
//!    engine when to prompt and, if a prompt experiment is configured, the
//!    optimizer which prompt to show.
//!
//! Scoring and optimizer failures never change the verdict.

use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::access::{FeatureAccessResolver, FeaturePermissionTable};
use crate::audit::{AuditFilter, AuditRecord, AuditTrail};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{OptimizerError, ScoringError, TrialError};
use crate::events::{DomainEvent, EventBus};
use crate::optimizer::{BatchReport, PromptOptimizer};
use crate::scoring::BehavioralScoringEngine;
use crate::storage::{ArmStore, BehaviorStore, LedgerStore};
use crate::trial::{ConsumeRequest, TrialManager};
use crate::types::{
    Access, AccessReason, AuthState, BehavioralEvent, ConsumeOutcome, ConsumeStatus, FeedbackEvent,
    FeedbackKind, Metadata, ScoringContext, Selection, TimingPrediction, TrialLedger, VisitorContext,
};

/// Everything needed to gate one feature use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateRequest {
    pub fingerprint: String,
    pub feature: String,
    pub auth: AuthState,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub source_ip: Option<IpAddr>,
    #[serde(default)]
    pub session_duration_ms: u64,
    pub visitor: VisitorContext,
    #[serde(default)]
    pub current_page: Option<String>,
}

impl GateRequest {
    pub fn anonymous(fingerprint: &str, feature: &str, visitor: VisitorContext) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            feature: feature.into(),
            auth: AuthState::Anonymous,
            metadata: Metadata::new(),
            source_ip: None,
            session_duration_ms: 0,
            visitor,
            current_page: None,
        }
    }
}

/// When and what to prompt after a denial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptPlan {
    pub prediction: TimingPrediction,
    /// `None` when no experiment is configured, the prediction says not to
    /// prompt, or the optimizer failed.
    pub selection: Option<Selection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub feature: String,
    pub access: Access,
    /// Present when a trial was consumed (or the attempt lost a race).
    pub consumption: Option<ConsumeOutcome>,
    pub prompt: Option<PromptPlan>,
    pub timestamp_ms: u64,
}

/// Composes every TrialGate component behind one API.
///
/// # Examples
///
/// ```rust
/// use trialgate_core::config::Config;
/// use trialgate_core::engine::{GateRequest, TrialGateEngine};
/// use trialgate_core::storage::InMemoryStorage;
/// use trialgate_core::types::{AccessReason, DeviceClass, VisitorContext};
///
/// let engine = TrialGateEngine::new(Config::default(), InMemoryStorage::new());
/// let visitor = VisitorContext { device_class: DeviceClass::Desktop, user_type: None, hour_of_day: 14 };
///
/// let decision = engine.check(GateRequest::anonymous("f1", "video_analysis", visitor.clone())).unwrap();
/// assert!(decision.access.allowed);
/// assert_eq!(decision.access.remaining, Some(4));
///
/// let decision = engine.check(GateRequest::anonymous("f1", "save_report", visitor)).unwrap();
/// assert_eq!(decision.access.reason, AccessReason::LoginRequired);
/// assert!(decision.prompt.is_some());
/// ```
pub struct TrialGateEngine<S>
where
    S: LedgerStore + BehaviorStore + ArmStore,
{
    pub trials: TrialManager<S>,
    pub resolver: FeatureAccessResolver,
    pub scoring: BehavioralScoringEngine<S>,
    pub optimizer: PromptOptimizer<S>,
    events: EventBus,
    audit: Arc<AuditTrail>,
    clock: Arc<dyn Clock>,
    prompt_experiment: Option<String>,
}

impl<S> TrialGateEngine<S>
where
    S: LedgerStore + BehaviorStore + ArmStore + Clone,
{
    /// `storage` is cloned once per component; clones of
    /// [`InMemoryStorage`](crate::storage::InMemoryStorage) share state.
    pub fn new(config: Config, storage: S) -> Self {
        let scoring = BehavioralScoringEngine::new(
            config.scoring.clone(),
            config.retention.clone(),
            storage.clone(),
        );
        let optimizer = PromptOptimizer::new(config.optimizer.clone(), storage.clone());
        let resolver = FeatureAccessResolver::new(FeaturePermissionTable::default(), config.weights.clone());
        let trials = TrialManager::new(config, storage);
        Self::from_parts(trials, resolver, scoring, optimizer)
    }
}

impl<S> TrialGateEngine<S>
where
    S: LedgerStore + BehaviorStore + ArmStore,
{
    /// Assemble from pre-built components.  Build the resolver and the
    /// trial manager from the same weight table.
    pub fn from_parts(
        trials: TrialManager<S>,
        resolver: FeatureAccessResolver,
        scoring: BehavioralScoringEngine<S>,
        optimizer: PromptOptimizer<S>,
    ) -> Self {
        let events = trials.events().clone();
        let audit = Arc::new(AuditTrail::with_capacity(trials.config().retention.max_audit_records));
        events.subscribe(audit.clone());
        Self {
            trials,
            resolver,
            scoring,
            optimizer,
            events,
            audit,
            clock: Arc::new(SystemClock),
            prompt_experiment: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.trials = self.trials.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    /// Experiment whose arms are offered on denial.
    pub fn with_prompt_experiment(mut self, experiment_id: &str) -> Self {
        self.prompt_experiment = Some(experiment_id.into());
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn query_audit(&self, filter: &AuditFilter) -> Vec<AuditRecord> {
        self.audit.query(filter)
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Gate one feature use.
    ///
    /// Returns `Err` for invalid input and rate limiting.  Store failures
    /// do not surface as errors: the decision fails closed instead.
    pub fn check(&self, request: GateRequest) -> Result<GateDecision, TrialError> {
        let timestamp_ms = self.clock.now_ms();

        let ledger = if request.auth.is_authenticated() {
            None
        } else {
            match self.trials.initialize(&request.fingerprint) {
                Ok(ledger) => Some(ledger),
                Err(error) if is_store_failure(&error) => {
                    tracing::error!(fingerprint = %request.fingerprint, %error, "ledger unavailable, denying");
                    let access = Access::deny(AccessReason::Unavailable, None);
                    return Ok(self.deny(&request, access, None, timestamp_ms));
                }
                Err(error) => return Err(error),
            }
        };

        let mut access = self.resolver.resolve(&request.feature, &request.auth, ledger.as_ref());

        let mut consumption = None;
        if let (AccessReason::Trial, Some(kind)) = (access.reason, access.trial_action) {
            let consume = ConsumeRequest {
                fingerprint: request.fingerprint.clone(),
                action_kind: kind.to_string(),
                metadata: request.metadata.clone(),
                source_ip: request.source_ip,
            };
            match self.trials.consume(consume) {
                Ok(outcome) => {
                    if outcome.success {
                        access.remaining = Some(outcome.remaining);
                    } else {
                        let reason = match outcome.status {
                            ConsumeStatus::Blocked => AccessReason::Blocked,
                            _ => AccessReason::Exhausted,
                        };
                        access = Access::deny(reason, Some(outcome.remaining));
                    }
                    consumption = Some(outcome);
                }
                Err(error) if is_store_failure(&error) => {
                    tracing::error!(fingerprint = %request.fingerprint, %error, "consume failed, denying");
                    access = Access::deny(AccessReason::Unavailable, access.remaining);
                }
                Err(error) => return Err(error),
            }
        }

        if access.allowed {
            tracing::debug!(
                fingerprint = %request.fingerprint,
                feature = %request.feature,
                reason = access.reason.as_str(),
                "access granted"
            );
            return Ok(GateDecision {
                feature: request.feature,
                access,
                consumption,
                prompt: None,
                timestamp_ms,
            });
        }

        Ok(self.deny(&request, access, consumption, timestamp_ms))
    }

    fn deny(
        &self,
        request: &GateRequest,
        access: Access,
        consumption: Option<ConsumeOutcome>,
        timestamp_ms: u64,
    ) -> GateDecision {
        self.events.publish(
            DomainEvent::AccessDenied {
                fingerprint: request.fingerprint.clone(),
                feature: request.feature.clone(),
                reason: access.reason,
            },
            timestamp_ms,
        );

        let prompt = (access.reason != AccessReason::Unavailable)
            .then(|| self.plan_prompt(request, access.remaining.unwrap_or(0), timestamp_ms));

        GateDecision {
            feature: request.feature.clone(),
            access,
            consumption,
            prompt,
            timestamp_ms,
        }
    }

    fn plan_prompt(&self, request: &GateRequest, trial_remaining: u32, now_ms: u64) -> PromptPlan {
        let context = ScoringContext {
            fingerprint: request.fingerprint.clone(),
            session_duration_ms: request.session_duration_ms,
            trial_remaining,
            device_class: request.visitor.device_class,
            current_page: request.current_page.clone(),
            now_ms,
        };
        let prediction = self.scoring.predict(&context);

        let selection = match (&self.prompt_experiment, prediction.should_trigger) {
            (Some(experiment_id), true) => match self.optimizer.select(experiment_id, &request.visitor) {
                Ok(selection) => Some(selection),
                Err(error) => {
                    tracing::warn!(experiment = %experiment_id, %error, "prompt selection failed");
                    None
                }
            },
            _ => None,
        };

        PromptPlan { prediction, selection }
    }

    /// Ledger for `fingerprint`, created on first access.
    pub fn ledger(&self, fingerprint: &str) -> Result<TrialLedger, TrialError> {
        self.trials.initialize(fingerprint)
    }

    /// Record a behavioral event.  Failures are logged and swallowed.
    pub fn record_event(&self, event: BehavioralEvent) {
        let fingerprint = event.fingerprint.clone();
        if let Err(error) = self.scoring.ingest(event) {
            tracing::warn!(%fingerprint, %error, "behavioral event dropped");
        }
    }

    /// Drop behavioral events past their retention age.
    pub fn evict_expired_events(&self) -> Result<usize, ScoringError> {
        self.scoring.evict_expired(self.clock.now_ms())
    }

    /// Report an impression.  Returns `false` for a replayed `event_id`.
    pub fn prompt_shown(&self, fingerprint: &str, arm_id: &str, event_id: &str) -> Result<bool, OptimizerError> {
        self.feedback(fingerprint, arm_id, event_id, FeedbackKind::Impression)
    }

    pub fn prompt_clicked(&self, fingerprint: &str, arm_id: &str, event_id: &str) -> Result<bool, OptimizerError> {
        self.feedback(fingerprint, arm_id, event_id, FeedbackKind::Click)
    }

    pub fn prompt_converted(&self, fingerprint: &str, arm_id: &str, event_id: &str) -> Result<bool, OptimizerError> {
        self.feedback(fingerprint, arm_id, event_id, FeedbackKind::Conversion)
    }

    fn feedback(
        &self,
        fingerprint: &str,
        arm_id: &str,
        event_id: &str,
        kind: FeedbackKind,
    ) -> Result<bool, OptimizerError> {
        let arm = self
            .optimizer
            .store()
            .get_arm(arm_id)?
            .ok_or_else(|| OptimizerError::UnknownArm(arm_id.into()))?;
        let now = self.clock.now_ms();

        let recorded = self.optimizer.record_feedback(FeedbackEvent {
            event_id: event_id.into(),
            arm_id: arm_id.into(),
            kind,
            timestamp_ms: now,
        });
        if !recorded {
            return Ok(false);
        }

        let fingerprint = fingerprint.to_owned();
        let experiment_id = arm.experiment_id;
        let arm_id = arm_id.to_owned();
        let event = match kind {
            FeedbackKind::Impression => DomainEvent::PromptShown { fingerprint, experiment_id, arm_id },
            FeedbackKind::Click => DomainEvent::PromptClicked { fingerprint, experiment_id, arm_id },
            FeedbackKind::Conversion => DomainEvent::PromptConverted { fingerprint, experiment_id, arm_id },
        };
        self.events.publish(event, now);
        Ok(true)
    }

    /// Fold buffered prompt feedback into the optimizer.
    pub fn run_batch_update(&self) -> Result<BatchReport, OptimizerError> {
        self.optimizer.run_batch_update(self.clock.now_ms())
    }
}

/// Persistence faults, as opposed to bad input or rate limiting.
pub(crate) fn is_store_failure(error: &TrialError) -> bool {
    matches!(
        error,
        TrialError::Store(_) | TrialError::RetriesExhausted { .. } | TrialError::Contention(_)
    )
}
