// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Error types.
//!
//! Quota exhaustion and blocking are *not* errors: they are reported through
//! [`ConsumeOutcome`](crate::types::ConsumeOutcome).  The enums here cover bad
//! input, rate limiting, and persistence faults.

use thiserror::Error;

/// Failure reported by a store implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Retryable fault (connection reset, lock timeout, ...).
    #[error("transient store failure: {0}")]
    Transient(String),
    /// Non-retryable fault (corrupt record, permission denied, ...).
    #[error("permanent store failure: {0}")]
    Permanent(String),
    /// Compare-and-swap lost against a concurrent writer.
    #[error("version conflict on '{key}': expected {expected:?}, found {found:?}")]
    VersionConflict {
        key: String,
        expected: Option<u64>,
        found: Option<u64>,
    },
    /// The call exceeded its deadline.
    #[error("store call timed out after {0} ms")]
    Timeout(u64),
    #[error("record not found: {0}")]
    NotFound(String),
}

impl StoreError {
    /// Whether a retry with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::Timeout(_))
    }
}

/// Errors surfaced by the trial manager and the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrialError {
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),
    #[error("invalid action type: {0}")]
    InvalidActionType(String),
    #[error("rate limit exceeded, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },
    /// Optimistic concurrency gave up after the configured number of attempts.
    #[error("ledger '{0}' is under heavy contention")]
    Contention(String),
    #[error("store failure after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Administrative operation refused in this environment.
    #[error("operation not permitted: {0}")]
    Forbidden(String),
    /// A charging call missed its deadline after it may already have
    /// committed.  Not retryable: re-sending without a request id could
    /// charge twice.  Read the ledger status to learn what happened.
    #[error("{operation} outcome unknown after {deadline_ms} ms")]
    OutcomeUnknown {
        operation: &'static str,
        deadline_ms: u64,
    },
}

impl TrialError {
    /// HTTP status code the error maps to at the API boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            TrialError::MissingParameter(_) | TrialError::InvalidActionType(_) => 400,
            TrialError::Forbidden(_) => 403,
            TrialError::RateLimited { .. } => 429,
            TrialError::Contention(_) => 409,
            TrialError::RetriesExhausted { .. } | TrialError::Store(_) => 503,
            TrialError::OutcomeUnknown { .. } => 504,
        }
    }

    /// Whether re-sending the same call may succeed without side effects.
    pub fn is_retryable(&self) -> bool {
        match self {
            TrialError::Store(error) => error.is_retryable(),
            TrialError::Contention(_) => true,
            _ => false,
        }
    }
}

/// Errors from the prompt optimizer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptimizerError {
    #[error("unknown experiment: {0}")]
    UnknownExperiment(String),
    #[error("unknown arm: {0}")]
    UnknownArm(String),
    #[error("experiment '{0}' has no candidates")]
    NoCandidates(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the behavioral scoring engine.  Never reach callers of
/// [`predict`](crate::scoring::BehavioralScoringEngine::predict), which
/// falls back to a conservative prediction instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScoringError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("non-finite score in factor '{0}'")]
    NonFinite(&'static str),
}
