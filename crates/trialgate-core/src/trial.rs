// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Trial quota management.
//!
//! [`TrialManager`] owns the ledger state machine:
//!
//! ```text
//!   Active(remaining > 0) ──consume──▶ Exhausted(remaining = 0)
//!          ▲                                 │
//!          └──────── reset / renewal ◀───────┘
//!   Active | Exhausted ──block──▶ Blocked ──clear_block──▶ Active
//! ```
//!
//! Operations:
//!
//! * [`initialize`](TrialManager::initialize)   — load or lazily create a ledger
//! * [`can_consume`](TrialManager::can_consume) — pure affordability check
//! * [`consume`](TrialManager::consume)         — atomic weighted debit
//! * [`status`](TrialManager::status)           — read-only projection
//! * [`reset`](TrialManager::reset)             — administrative renewal
//! * [`block`](TrialManager::block) / [`clear_block`](TrialManager::clear_block)
//!
//! Every write is a compare-and-swap on [`TrialLedger::version`]; a lost
//! race reloads the ledger and re-evaluates, so two concurrent consumes can
//! never both spend the last trial.

use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{StoreError, TrialError};
use crate::events::{DomainEvent, EventBus};
use crate::rate_limit::RateLimiter;
use crate::retry::retry_blocking;
use crate::storage::LedgerStore;
use crate::types::{
    ActionKind, ConsumeOutcome, ConsumeStatus, LedgerStatus, Metadata, TrialAction, TrialLedger,
};

/// Metadata key carrying the client's idempotency id.  A consume whose id
/// is already on the ledger is answered from the ledger, not charged again.
pub const REQUEST_ID_KEY: &str = "request_id";

/// A consumption request as received from a client.
///
/// Fields are raw strings so validation (missing vs unknown) happens in one
/// place.  Any weight the client believes in is deliberately absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumeRequest {
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub action_kind: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub source_ip: Option<IpAddr>,
}

impl ConsumeRequest {
    pub fn new(fingerprint: &str, action_kind: impl ToString) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            action_kind: action_kind.to_string(),
            metadata: Metadata::new(),
            source_ip: None,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn from_ip(mut self, source_ip: IpAddr) -> Self {
        self.source_ip = Some(source_ip);
        self
    }

    pub fn with_request_id(self, request_id: impl Into<String>) -> Self {
        self.with_metadata(REQUEST_ID_KEY, request_id.into())
    }

    /// The idempotency id, if the client sent one.
    pub fn request_id(&self) -> Option<&str> {
        request_id_of(&self.metadata)
    }
}

pub(crate) fn request_id_of(metadata: &Metadata) -> Option<&str> {
    metadata
        .get(REQUEST_ID_KEY)
        .and_then(serde_json::Value::as_str)
        .filter(|id| !id.is_empty())
}

/// Server-authoritative quota manager.
///
/// # Examples
///
/// ```rust
/// use trialgate_core::config::Config;
/// use trialgate_core::storage::InMemoryStorage;
/// use trialgate_core::trial::{ConsumeRequest, TrialManager};
/// use trialgate_core::types::ConsumeStatus;
///
/// let manager = TrialManager::new(Config::default(), InMemoryStorage::new());
///
/// let outcome = manager.consume(ConsumeRequest::new("f1", "channel_analysis")).unwrap();
/// assert!(outcome.success);
/// assert_eq!(outcome.remaining, 3);
///
/// let outcome = manager.consume(ConsumeRequest::new("f1", "bulk_analysis")).unwrap();
/// assert_eq!(outcome.status, ConsumeStatus::Consumed);
/// assert_eq!(outcome.remaining, 0);
/// assert!(outcome.exhausted);
/// ```
pub struct TrialManager<S: LedgerStore> {
    config: Config,
    store: S,
    limiter: RateLimiter,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl<S: LedgerStore> TrialManager<S> {
    /// Create a manager with the system clock and a private event bus.
    pub fn new(config: Config, store: S) -> Self {
        let limiter = RateLimiter::new(config.rate_limit.clone());
        Self {
            config,
            store,
            limiter,
            events: EventBus::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Publish domain events on `events` instead of the private bus.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Replace the time source.  Ledger timestamps, renewal deadlines and the
    /// rate limiter's window all read it.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Authoritative weight of `kind`.
    pub fn weight_of(&self, kind: ActionKind) -> Result<u32, TrialError> {
        self.config
            .weights
            .weight_of(kind)
            .ok_or_else(|| TrialError::InvalidActionType(kind.to_string()))
    }

    /// Load the ledger for `fingerprint`, creating it with full quota on
    /// first access and renewing it when its reset deadline has passed.
    /// Idempotent.
    pub fn initialize(&self, fingerprint: &str) -> Result<TrialLedger, TrialError> {
        require("fingerprint", fingerprint)?;
        let now = self.clock.now_ms();

        for _ in 0..self.cas_attempts() {
            match self.fetch(fingerprint)? {
                Some(ledger) if !ledger.is_due_for_reset(now) => return Ok(ledger),
                Some(ledger) => {
                    let mut renewed = ledger.clone();
                    self.renew(&mut renewed, now);
                    renewed.version = ledger.version + 1;
                    match self.persist(&renewed, Some(ledger.version)) {
                        Ok(()) => {
                            tracing::info!(fingerprint, total = renewed.total, "ledger renewed on expiry");
                            self.events.publish(
                                DomainEvent::LedgerReset {
                                    fingerprint: fingerprint.into(),
                                    remaining: renewed.remaining,
                                    actions_cleared: false,
                                },
                                now,
                            );
                            return Ok(renewed);
                        }
                        Err(error) if is_conflict(&error) => continue,
                        Err(error) => return Err(error),
                    }
                }
                None => {
                    let fresh = TrialLedger::new(
                        fingerprint,
                        self.config.default_trial_count,
                        now,
                        self.next_reset(now),
                    );
                    match self.persist(&fresh, None) {
                        Ok(()) => {
                            tracing::debug!(fingerprint, total = fresh.total, "ledger created");
                            return Ok(fresh);
                        }
                        Err(error) if is_conflict(&error) => continue,
                        Err(error) => return Err(error),
                    }
                }
            }
        }

        tracing::warn!(fingerprint, "gave up initializing ledger under contention");
        Err(TrialError::Contention(fingerprint.into()))
    }

    /// `!is_blocked && remaining >= weight_of(kind)`.  Unknown or unbillable
    /// kinds are never consumable.
    pub fn can_consume(&self, ledger: &TrialLedger, kind: ActionKind) -> bool {
        self.config
            .weights
            .weight_of(kind)
            .map_or(false, |weight| ledger.can_afford(weight))
    }

    /// Debit the authoritative weight of `request.action_kind`.
    ///
    /// Validation and rate limiting run first and surface as errors without
    /// touching the ledger.  A blocked or short ledger is reported through
    /// [`ConsumeOutcome::status`], also without mutation.
    ///
    /// A request carrying a [`REQUEST_ID_KEY`] that the ledger already
    /// records is a replay: it succeeds with the current balance and charges
    /// nothing.
    pub fn consume(&self, request: ConsumeRequest) -> Result<ConsumeOutcome, TrialError> {
        require("fingerprint", &request.fingerprint)?;
        require("action_kind", &request.action_kind)?;
        let kind: ActionKind = request.action_kind.parse()?;
        let weight = self.weight_of(kind)?;
        let fingerprint = request.fingerprint.as_str();

        let checked_at = self.clock.now_ms();
        if let Err(error) = self.limiter.check(fingerprint, request.source_ip, checked_at) {
            if let TrialError::RateLimited { retry_after_ms } = &error {
                self.events.publish(
                    DomainEvent::RateLimited {
                        fingerprint: fingerprint.into(),
                        retry_after_ms: *retry_after_ms,
                    },
                    checked_at,
                );
            }
            return Err(error);
        }

        for attempt in 1..=self.cas_attempts() {
            let ledger = self.initialize(fingerprint)?;

            if let Some(request_id) = request.request_id() {
                let applied = ledger
                    .actions
                    .iter()
                    .find(|action| request_id_of(&action.metadata) == Some(request_id));
                if let Some(action) = applied {
                    tracing::debug!(fingerprint, request_id, "consume replay answered from ledger");
                    return Ok(ConsumeOutcome {
                        success: true,
                        status: ConsumeStatus::Consumed,
                        remaining: ledger.remaining,
                        total: ledger.total,
                        blocked: false,
                        exhausted: ledger.remaining == 0,
                        weight: action.weight,
                        message: "Request already applied".into(),
                    });
                }
            }

            if ledger.is_blocked {
                tracing::debug!(fingerprint, %kind, "consume refused: ledger blocked");
                return Ok(ConsumeOutcome {
                    success: false,
                    status: ConsumeStatus::Blocked,
                    remaining: ledger.remaining,
                    total: ledger.total,
                    blocked: true,
                    exhausted: false,
                    weight,
                    message: match &ledger.blocked_reason {
                        Some(reason) => format!("Trial access is blocked: {reason}"),
                        None => "Trial access is blocked".into(),
                    },
                });
            }

            if ledger.remaining < weight {
                tracing::debug!(
                    fingerprint,
                    %kind,
                    weight,
                    remaining = ledger.remaining,
                    "consume refused: insufficient trials"
                );
                let message = if ledger.remaining == 0 {
                    "Trial quota exhausted; sign in to continue".to_owned()
                } else {
                    format!(
                        "Insufficient trials: {kind} requires {weight}, {} remaining",
                        ledger.remaining
                    )
                };
                return Ok(ConsumeOutcome {
                    success: false,
                    status: ConsumeStatus::InsufficientTrials,
                    remaining: ledger.remaining,
                    total: ledger.total,
                    blocked: false,
                    exhausted: false,
                    weight,
                    message,
                });
            }

            let now = self.clock.now_ms();
            let mut next = ledger.clone();
            next.remaining -= weight;
            next.actions.push(TrialAction {
                kind,
                weight,
                timestamp_ms: now,
                metadata: request.metadata.clone(),
            });
            next.updated_at_ms = now;
            next.version = ledger.version + 1;

            match self.persist(&next, Some(ledger.version)) {
                Ok(()) => {
                    let exhausted = next.remaining == 0;
                    tracing::debug!(fingerprint, %kind, weight, remaining = next.remaining, "trial consumed");
                    self.events.publish(
                        DomainEvent::TrialConsumed {
                            fingerprint: fingerprint.into(),
                            action_kind: kind,
                            weight,
                            remaining: next.remaining,
                        },
                        now,
                    );
                    if exhausted {
                        tracing::info!(fingerprint, "trial quota exhausted");
                        self.events.publish(
                            DomainEvent::TrialExhausted {
                                fingerprint: fingerprint.into(),
                                action_kind: kind,
                            },
                            now,
                        );
                    }
                    return Ok(ConsumeOutcome {
                        success: true,
                        status: ConsumeStatus::Consumed,
                        remaining: next.remaining,
                        total: next.total,
                        blocked: false,
                        exhausted,
                        weight,
                        message: format!("{} of {} trials remaining", next.remaining, next.total),
                    });
                }
                Err(error) if is_conflict(&error) => {
                    tracing::debug!(fingerprint, attempt, "consume lost compare-and-swap, reloading");
                }
                Err(error) => return Err(error),
            }
        }

        tracing::warn!(fingerprint, attempts = self.cas_attempts(), "consume gave up under contention");
        Err(TrialError::Contention(fingerprint.into()))
    }

    /// Read-only view for the status endpoint.
    pub fn status(&self, fingerprint: &str) -> Result<LedgerStatus, TrialError> {
        self.initialize(fingerprint).map(|ledger| LedgerStatus::from(&ledger))
    }

    /// Administrative reset: full quota, block cleared, actions optionally
    /// kept.  Refused outside [`Environment::Development`](crate::config::Environment).
    pub fn reset(&self, fingerprint: &str, preserve_actions: bool) -> Result<TrialLedger, TrialError> {
        require("fingerprint", fingerprint)?;
        if !self.config.environment.allows_reset() {
            tracing::warn!(fingerprint, environment = ?self.config.environment, "reset refused");
            return Err(TrialError::Forbidden(
                "ledger reset is only available in development".into(),
            ));
        }

        let default_trial_count = self.config.default_trial_count;
        let ledger = self.update(fingerprint, |ledger, now, next_reset| {
            ledger.remaining = default_trial_count;
            ledger.total = default_trial_count;
            ledger.is_blocked = false;
            ledger.blocked_reason = None;
            ledger.reset_at_ms = next_reset;
            if !preserve_actions {
                ledger.actions.clear();
            }
            ledger.updated_at_ms = now;
        })?;

        tracing::info!(fingerprint, preserve_actions, "ledger reset");
        self.events.publish(
            DomainEvent::LedgerReset {
                fingerprint: fingerprint.into(),
                remaining: ledger.remaining,
                actions_cleared: !preserve_actions,
            },
            ledger.updated_at_ms,
        );
        Ok(ledger)
    }

    /// Anti-fraud trip.  Consumption is refused until [`clear_block`](Self::clear_block).
    pub fn block(&self, fingerprint: &str, reason: &str) -> Result<TrialLedger, TrialError> {
        require("fingerprint", fingerprint)?;
        let ledger = self.update(fingerprint, |ledger, now, _| {
            ledger.is_blocked = true;
            ledger.blocked_reason = Some(reason.to_owned());
            ledger.updated_at_ms = now;
        })?;

        tracing::info!(fingerprint, reason, "ledger blocked");
        self.events.publish(
            DomainEvent::LedgerBlocked {
                fingerprint: fingerprint.into(),
                reason: reason.into(),
            },
            ledger.updated_at_ms,
        );
        Ok(ledger)
    }

    /// Manual clear of the block flag.  Quota and actions are untouched.
    pub fn clear_block(&self, fingerprint: &str) -> Result<TrialLedger, TrialError> {
        require("fingerprint", fingerprint)?;
        let ledger = self.update(fingerprint, |ledger, now, _| {
            ledger.is_blocked = false;
            ledger.blocked_reason = None;
            ledger.updated_at_ms = now;
        })?;

        tracing::info!(fingerprint, "ledger unblocked");
        self.events.publish(
            DomainEvent::LedgerUnblocked {
                fingerprint: fingerprint.into(),
            },
            ledger.updated_at_ms,
        );
        Ok(ledger)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Compare-and-swap loop around `mutate`.  The closure receives the
    /// current ledger, the clock reading and the next renewal deadline.
    fn update<F>(&self, fingerprint: &str, mut mutate: F) -> Result<TrialLedger, TrialError>
    where
        F: FnMut(&mut TrialLedger, u64, Option<u64>),
    {
        for attempt in 1..=self.cas_attempts() {
            let ledger = self.initialize(fingerprint)?;
            let now = self.clock.now_ms();
            let mut next = ledger.clone();
            mutate(&mut next, now, self.next_reset(now));
            next.version = ledger.version + 1;

            match self.persist(&next, Some(ledger.version)) {
                Ok(()) => return Ok(next),
                Err(error) if is_conflict(&error) => {
                    tracing::debug!(fingerprint, attempt, "update lost compare-and-swap, reloading");
                }
                Err(error) => return Err(error),
            }
        }
        tracing::warn!(fingerprint, "update gave up under contention");
        Err(TrialError::Contention(fingerprint.into()))
    }

    /// Periodic renewal keeps the block flag and the action log.
    fn renew(&self, ledger: &mut TrialLedger, now: u64) {
        ledger.total = self.config.default_trial_count;
        ledger.remaining = ledger.total;
        ledger.reset_at_ms = self.next_reset(now);
        ledger.updated_at_ms = now;
    }

    fn next_reset(&self, now: u64) -> Option<u64> {
        self.config
            .reset_period_ms
            .map(|period| now.saturating_add(period))
    }

    fn fetch(&self, fingerprint: &str) -> Result<Option<TrialLedger>, TrialError> {
        retry_blocking(&self.config.retry, "get_ledger", || {
            self.store.get_ledger(fingerprint)
        })
    }

    fn persist(&self, ledger: &TrialLedger, expected_version: Option<u64>) -> Result<(), TrialError> {
        retry_blocking(&self.config.retry, "put_ledger", || {
            self.store.put_ledger(ledger, expected_version)
        })
    }

    fn cas_attempts(&self) -> u32 {
        self.config.max_cas_retries.max(1)
    }
}

fn require(name: &'static str, value: &str) -> Result<(), TrialError> {
    if value.trim().is_empty() {
        Err(TrialError::MissingParameter(name))
    } else {
        Ok(())
    }
}

fn is_conflict(error: &TrialError) -> bool {
    matches!(error, TrialError::Store(StoreError::VersionConflict { .. }))
}
