// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Engine-level configuration.
//!
//! [`Config`] is the single entry point for tuning TrialGate at construction
//! time.  Every field has a default so that `Config::default()` is always a
//! valid starting point.  The scoring coefficients are deliberately exposed
//! as configuration: they are heuristics awaiting empirical recalibration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::ActionKind;

/// Quota granted to a fresh ledger.
pub const DEFAULT_TRIAL_COUNT: u32 = 5;

const MINUTE_MS: u64 = 60_000;
const DAY_MS: u64 = 24 * 60 * MINUTE_MS;

/// Deployment environment.  Administrative resets are only honoured in
/// [`Environment::Development`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    #[default]
    Production,
}

impl Environment {
    pub fn allows_reset(self) -> bool {
        self == Environment::Development
    }
}

// ---------------------------------------------------------------------------
// Weights
// ---------------------------------------------------------------------------

/// The server's authoritative action weight table.
///
/// ```rust
/// use trialgate_core::config::WeightTable;
/// use trialgate_core::types::ActionKind;
///
/// let table = WeightTable::default();
/// assert_eq!(table.weight_of(ActionKind::VideoAnalysis), Some(1));
/// assert_eq!(table.weight_of(ActionKind::ChannelAnalysis), Some(2));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeightTable(BTreeMap<ActionKind, u32>);

impl WeightTable {
    pub fn new(weights: BTreeMap<ActionKind, u32>) -> Self {
        Self(weights)
    }

    /// Weight of `kind`, or `None` when the kind is not billable here.
    /// Zero weights are rejected so every action costs at least one trial.
    pub fn weight_of(&self, kind: ActionKind) -> Option<u32> {
        self.0.get(&kind).copied().filter(|weight| *weight >= 1)
    }

    pub fn set(&mut self, kind: ActionKind, weight: u32) {
        self.0.insert(kind, weight);
    }
}

impl Default for WeightTable {
    fn default() -> Self {
        Self(BTreeMap::from([
            (ActionKind::VideoAnalysis, 1),
            (ActionKind::ChannelAnalysis, 2),
            (ActionKind::KeywordResearch, 1),
            (ActionKind::CompetitorAnalysis, 2),
            (ActionKind::TrendReport, 1),
            (ActionKind::BulkAnalysis, 3),
        ]))
    }
}

// ---------------------------------------------------------------------------
// Rate limiting and retries
// ---------------------------------------------------------------------------

/// Sliding-window limiter keyed by `(fingerprint, source ip)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Consumption requests allowed per key per window.
    pub max_requests: u32,
    pub window_ms: u64,
    /// Run a cleanup pass every N checks.
    pub cleanup_interval: u64,
    /// Hard cap on tracked keys.
    pub max_tracked_keys: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window_ms: MINUTE_MS,
            cleanup_interval: 100,
            max_tracked_keys: 10_000,
        }
    }
}

/// Bounded exponential backoff for store calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Deadline for a single attempt (enforced by the async service).
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
            multiplier: 2.0,
            timeout_ms: 5_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementWeights {
    pub pages: f64,
    pub interactions: f64,
    pub scroll: f64,
    pub session: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrustrationWeights {
    pub rapid_clicks: f64,
    pub back_and_forth: f64,
    pub idle: f64,
    pub repeated_actions: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeWeights {
    pub engagement: f64,
    pub intent: f64,
    /// Subtracted from the composite.
    pub frustration: f64,
    pub time_spent: f64,
    pub action_pattern: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternScores {
    pub power_user: f64,
    pub goal_oriented: f64,
    pub explorer: f64,
    pub casual: f64,
}

/// Every coefficient of the behavioral scoring model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub engagement_window_ms: u64,
    pub intent_window_ms: u64,
    pub frustration_window_ms: u64,

    pub page_cap: f64,
    pub interaction_cap: f64,
    pub session_cap_ms: u64,
    pub engagement: EngagementWeights,

    pub high_intent_weight: f64,
    pub medium_intent_weight: f64,
    pub intent_action_cap: f64,
    pub urgency_weight: f64,

    pub rapid_click_gap_ms: u64,
    pub rapid_click_cap: f64,
    pub back_and_forth_cap: f64,
    pub idle_cap: f64,
    /// An action counts as repeated once seen more than this many times.
    pub repeat_threshold: usize,
    pub repeated_action_cap: f64,
    pub frustration: FrustrationWeights,

    pub optimal_session_min_ms: u64,
    pub optimal_session_max_ms: u64,
    /// Time over which the score decays from 1.0 past the optimal window.
    pub session_decay_span_ms: u64,
    pub session_floor: f64,

    /// Average session length at or above which a visitor who has not
    /// matched a stronger archetype is classified as an explorer.
    pub explorer_session_ms: u64,
    pub patterns: PatternScores,
    pub composite: CompositeWeights,

    pub immediate_threshold: f64,
    pub delayed_threshold: f64,
    pub exit_intent_frustration: f64,
    pub short_delay_ms: u64,
    pub deferred_delay_ms: u64,
    /// At or below this many trials left, prompt immediately.
    pub force_prompt_remaining: u32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            engagement_window_ms: 30 * MINUTE_MS,
            intent_window_ms: 10 * MINUTE_MS,
            frustration_window_ms: 5 * MINUTE_MS,

            page_cap: 5.0,
            interaction_cap: 10.0,
            session_cap_ms: 5 * MINUTE_MS,
            engagement: EngagementWeights {
                pages: 0.25,
                interactions: 0.35,
                scroll: 0.20,
                session: 0.20,
            },

            high_intent_weight: 0.8,
            medium_intent_weight: 0.3,
            intent_action_cap: 5.0,
            urgency_weight: 0.3,

            rapid_click_gap_ms: 1_000,
            rapid_click_cap: 5.0,
            back_and_forth_cap: 3.0,
            idle_cap: 3.0,
            repeat_threshold: 3,
            repeated_action_cap: 2.0,
            frustration: FrustrationWeights {
                rapid_clicks: 0.30,
                back_and_forth: 0.25,
                idle: 0.20,
                repeated_actions: 0.25,
            },

            optimal_session_min_ms: 2 * MINUTE_MS,
            optimal_session_max_ms: 10 * MINUTE_MS,
            session_decay_span_ms: 20 * MINUTE_MS,
            session_floor: 0.3,

            explorer_session_ms: 10 * MINUTE_MS,

            patterns: PatternScores {
                power_user: 0.8,
                goal_oriented: 0.9,
                explorer: 0.6,
                casual: 0.4,
            },
            composite: CompositeWeights {
                engagement: 0.25,
                intent: 0.30,
                frustration: 0.15,
                time_spent: 0.20,
                action_pattern: 0.25,
            },

            immediate_threshold: 0.8,
            delayed_threshold: 0.6,
            exit_intent_frustration: 0.7,
            short_delay_ms: 3_000,
            deferred_delay_ms: 30_000,
            force_prompt_remaining: 1,
        }
    }
}

/// Rolling behavioral window bounds, and the in-process audit trail's
/// size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Per-fingerprint event cap; oldest events are evicted first.
    pub max_events: usize,
    pub max_age_ms: u64,
    /// Audit records kept in memory; older ones are pruned from the front
    /// of the chain.
    pub max_audit_records: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_events: 1_000,
            max_age_ms: 7 * DAY_MS,
            max_audit_records: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Optimizer and ingestion
// ---------------------------------------------------------------------------

/// Defaults applied to experiments registered without explicit parameters,
/// plus the batch-update schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub min_sample_size: u64,
    pub confidence_threshold: f64,
    pub exploration_rate: f64,
    pub update_interval_ms: u64,
    /// Feedback older than this at batch time is discarded.
    pub feedback_window_ms: u64,
    pub spawn_reward_threshold: f64,
    pub max_arms_per_experiment: usize,
    /// Remembered event ids for replay protection.
    pub dedup_capacity: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            min_sample_size: 30,
            confidence_threshold: 0.8,
            exploration_rate: 0.1,
            update_interval_ms: MINUTE_MS,
            feedback_window_ms: DAY_MS,
            spawn_reward_threshold: 0.1,
            max_arms_per_experiment: 12,
            dedup_capacity: 100_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Bounded queue between callers and the ingestion worker.
    pub queue_capacity: usize,
    /// Consecutive failures before the degraded signal is raised.
    pub degraded_after_failures: u32,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1_024,
            degraded_after_failures: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Top-level configuration.
///
/// # Examples
///
/// ```rust
/// use trialgate_core::config::{Config, Environment};
///
/// let config = Config {
///     environment: Environment::Development,
///     ..Config::default()
/// };
/// assert_eq!(config.default_trial_count, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub default_trial_count: u32,
    /// Renewal period of a ledger.  `None` disables periodic renewal.
    pub reset_period_ms: Option<u64>,
    pub weights: WeightTable,
    pub environment: Environment,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryPolicy,
    /// Compare-and-swap attempts before a consume reports contention.
    pub max_cas_retries: u32,
    pub scoring: ScoringConfig,
    pub retention: RetentionPolicy,
    pub optimizer: OptimizerConfig,
    pub ingestion: IngestionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_trial_count: DEFAULT_TRIAL_COUNT,
            reset_period_ms: Some(7 * DAY_MS),
            weights: WeightTable::default(),
            environment: Environment::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
            max_cas_retries: 8,
            scoring: ScoringConfig::default(),
            retention: RetentionPolicy::default(),
            optimizer: OptimizerConfig::default(),
            ingestion: IngestionConfig::default(),
        }
    }
}
