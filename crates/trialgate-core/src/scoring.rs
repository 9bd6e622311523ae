// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Behavioral scoring engine.
//!
//! [`BehavioralScoringEngine`] keeps a rolling event window per fingerprint
//! in a [`BehaviorStore`] and turns it into a [`TimingPrediction`]:
//!
//! * [`ingest`](BehavioralScoringEngine::ingest)   — append one UI event
//! * [`score`](BehavioralScoringEngine::score)     — factor scores + composite
//! * [`predict`](BehavioralScoringEngine::predict) — prompt timing decision
//!
//! `predict` never fails.  A store fault or a non-finite score degrades to
//! a conservative "do not prompt" answer with medium urgency.

use crate::config::{CompositeWeights, RetentionPolicy, ScoringConfig};
use crate::error::ScoringError;
use crate::factors;
use crate::storage::BehaviorStore;
use crate::types::{
    BehavioralEvent, FactorScores, ScoringContext, TimingPrediction, TriggerType, Urgency,
    UserPattern,
};

/// Factor scores, the inferred archetype and the composite.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub factors: FactorScores,
    pub pattern: UserPattern,
    pub composite: f64,
}

/// Weighted blend of the factors, frustration subtracted, clamped to `0..=1`.
///
/// ```rust
/// use trialgate_core::config::ScoringConfig;
/// use trialgate_core::scoring::composite;
/// use trialgate_core::types::FactorScores;
///
/// let weights = ScoringConfig::default().composite;
/// let all_max = FactorScores { engagement: 1.0, intent: 1.0, frustration: 0.0, time_spent: 1.0, action_pattern: 1.0 };
/// assert!((composite(&all_max, &weights) - 1.0).abs() < 1e-9);
/// assert_eq!(composite(&FactorScores { frustration: 1.0, ..FactorScores::default() }, &weights), 0.0);
/// ```
pub fn composite(factors: &FactorScores, weights: &CompositeWeights) -> f64 {
    (factors.engagement * weights.engagement + factors.intent * weights.intent
        - factors.frustration * weights.frustration
        + factors.time_spent * weights.time_spent
        + factors.action_pattern * weights.action_pattern)
        .clamp(0.0, 1.0)
}

/// Map a score to a prompt decision.  The low-quota override is checked
/// first and wins over everything else.
pub fn decide(score: &Score, trial_remaining: u32, config: &ScoringConfig) -> TimingPrediction {
    let (should_trigger, trigger_type, urgency, recommended_delay_ms, message) =
        if trial_remaining <= config.force_prompt_remaining {
            (
                true,
                TriggerType::Immediate,
                Urgency::High,
                0,
                "Trials nearly gone; prompt to sign in now",
            )
        } else if score.composite > config.immediate_threshold {
            (
                true,
                TriggerType::Immediate,
                Urgency::High,
                0,
                "Visitor is highly receptive; prompt now",
            )
        } else if score.composite > config.delayed_threshold {
            (
                true,
                TriggerType::Delayed,
                Urgency::Medium,
                config.short_delay_ms,
                "Visitor is receptive; prompt after a short delay",
            )
        } else if score.factors.frustration > config.exit_intent_frustration {
            (
                true,
                TriggerType::ExitIntent,
                Urgency::Medium,
                0,
                "Visitor seems frustrated; prompt on exit intent",
            )
        } else {
            (
                false,
                TriggerType::Deferred,
                Urgency::Low,
                config.deferred_delay_ms,
                "Not yet receptive; defer the prompt",
            )
        };

    TimingPrediction {
        should_trigger,
        confidence: score.composite,
        recommended_delay_ms,
        trigger_type,
        urgency,
        message: message.into(),
        factors: score.factors,
        pattern: Some(score.pattern),
    }
}

/// Answer used whenever scoring itself fails.  The low-trial override
/// still applies: with `force_prompt_remaining` or fewer trials left the
/// prompt is immediate whatever the store says.
pub fn fallback_prediction(trial_remaining: u32, config: &ScoringConfig) -> TimingPrediction {
    if trial_remaining <= config.force_prompt_remaining {
        return TimingPrediction {
            should_trigger: true,
            confidence: 0.0,
            recommended_delay_ms: 0,
            trigger_type: TriggerType::Immediate,
            urgency: Urgency::High,
            message: "Trials nearly gone; prompt to sign in now".into(),
            factors: FactorScores::default(),
            pattern: None,
        };
    }
    TimingPrediction {
        should_trigger: false,
        confidence: 0.0,
        recommended_delay_ms: config.deferred_delay_ms,
        trigger_type: TriggerType::Deferred,
        urgency: Urgency::Medium,
        message: "Scoring unavailable; not prompting".into(),
        factors: FactorScores::default(),
        pattern: None,
    }
}

/// Rolling-window login-timing predictor.
///
/// # Examples
///
/// ```rust
/// use trialgate_core::config::{RetentionPolicy, ScoringConfig};
/// use trialgate_core::scoring::BehavioralScoringEngine;
/// use trialgate_core::storage::InMemoryStorage;
/// use trialgate_core::types::{BehavioralEvent, DeviceClass, EventKind, ScoringContext, TriggerType};
///
/// let engine = BehavioralScoringEngine::new(
///     ScoringConfig::default(),
///     RetentionPolicy::default(),
///     InMemoryStorage::new(),
/// );
/// engine.ingest(BehavioralEvent::new("f1", "s1", EventKind::SaveAttempt, 1_000)).unwrap();
///
/// let prediction = engine.predict(&ScoringContext {
///     fingerprint: "f1".into(),
///     session_duration_ms: 60_000,
///     trial_remaining: 1,
///     device_class: DeviceClass::Desktop,
///     current_page: None,
///     now_ms: 2_000,
/// });
/// assert!(prediction.should_trigger);
/// assert_eq!(prediction.trigger_type, TriggerType::Immediate);
/// ```
pub struct BehavioralScoringEngine<S: BehaviorStore> {
    config: ScoringConfig,
    retention: RetentionPolicy,
    store: S,
}

impl<S: BehaviorStore> BehavioralScoringEngine<S> {
    pub fn new(config: ScoringConfig, retention: RetentionPolicy, store: S) -> Self {
        Self {
            config,
            retention,
            store,
        }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Append `event` to its fingerprint's window.
    pub fn ingest(&self, event: BehavioralEvent) -> Result<(), ScoringError> {
        self.store.append_event(event, self.retention.max_events)?;
        Ok(())
    }

    /// Drop events older than the retention age.
    pub fn evict_expired(&self, now_ms: u64) -> Result<usize, ScoringError> {
        let cutoff = now_ms.saturating_sub(self.retention.max_age_ms);
        let removed = self.store.evict_before(cutoff)?;
        if removed > 0 {
            tracing::debug!(removed, cutoff, "evicted expired behavioral events");
        }
        Ok(removed)
    }

    /// Compute every factor from the stored window.
    pub fn score(&self, context: &ScoringContext) -> Result<Score, ScoringError> {
        let now = context.now_ms;
        let retained_since = now.saturating_sub(self.retention.max_age_ms);
        let mut window = self.store.events_since(&context.fingerprint, retained_since)?;
        // Late deliveries can arrive out of order.
        window.sort_by_key(|event| event.timestamp_ms);

        let engagement_events = since(&window, now, self.config.engagement_window_ms);
        let intent_events = since(&window, now, self.config.intent_window_ms);
        let frustration_events = since(&window, now, self.config.frustration_window_ms);

        let pattern = factors::classify(&window, &self.config);
        let scores = FactorScores {
            engagement: factors::engagement(engagement_events, context.session_duration_ms, &self.config),
            intent: factors::intent(intent_events, context.trial_remaining, &self.config),
            frustration: factors::frustration(frustration_events, &self.config),
            time_spent: factors::time_spent(context.session_duration_ms, &self.config),
            action_pattern: factors::pattern_score(pattern, &self.config),
        };

        for (name, value) in [
            ("engagement", scores.engagement),
            ("intent", scores.intent),
            ("frustration", scores.frustration),
            ("time_spent", scores.time_spent),
            ("action_pattern", scores.action_pattern),
        ] {
            if !value.is_finite() {
                return Err(ScoringError::NonFinite(name));
            }
        }

        Ok(Score {
            factors: scores,
            pattern,
            composite: composite(&scores, &self.config.composite),
        })
    }

    /// Timing recommendation for `context`.  Never fails: scoring errors
    /// degrade to [`fallback_prediction`].
    pub fn predict(&self, context: &ScoringContext) -> TimingPrediction {
        match self.score(context) {
            Ok(score) => {
                let prediction = decide(&score, context.trial_remaining, &self.config);
                tracing::debug!(
                    fingerprint = %context.fingerprint,
                    composite = score.composite,
                    trigger = ?prediction.trigger_type,
                    urgency = ?prediction.urgency,
                    "timing predicted"
                );
                prediction
            }
            Err(error) => {
                tracing::warn!(
                    fingerprint = %context.fingerprint,
                    %error,
                    "scoring failed, falling back"
                );
                fallback_prediction(context.trial_remaining, &self.config)
            }
        }
    }
}

/// Suffix of `window` (oldest first) inside the last `span_ms` before `now`.
fn since(window: &[BehavioralEvent], now: u64, span_ms: u64) -> &[BehavioralEvent] {
    let cutoff = now.saturating_sub(span_ms);
    let start = window.partition_point(|event| event.timestamp_ms < cutoff);
    &window[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::storage::InMemoryStorage;
    use crate::types::{DeviceClass, EventKind};

    const MINUTE: u64 = 60_000;

    fn engine() -> BehavioralScoringEngine<InMemoryStorage> {
        BehavioralScoringEngine::new(
            ScoringConfig::default(),
            RetentionPolicy::default(),
            InMemoryStorage::new(),
        )
    }

    fn context(trial_remaining: u32, session_duration_ms: u64, now_ms: u64) -> ScoringContext {
        ScoringContext {
            fingerprint: "f1".into(),
            session_duration_ms,
            trial_remaining,
            device_class: DeviceClass::Desktop,
            current_page: None,
            now_ms,
        }
    }

    fn score_with(composite: f64, frustration: f64) -> Score {
        Score {
            factors: FactorScores {
                frustration,
                ..FactorScores::default()
            },
            pattern: UserPattern::Casual,
            composite,
        }
    }

    #[test]
    fn decision_thresholds() {
        let config = ScoringConfig::default();
        assert_eq!(decide(&score_with(0.85, 0.0), 5, &config).trigger_type, TriggerType::Immediate);

        let delayed = decide(&score_with(0.7, 0.0), 5, &config);
        assert_eq!(delayed.trigger_type, TriggerType::Delayed);
        assert_eq!(delayed.recommended_delay_ms, config.short_delay_ms);

        let exit = decide(&score_with(0.2, 0.75), 5, &config);
        assert_eq!(exit.trigger_type, TriggerType::ExitIntent);
        assert!(exit.should_trigger);

        let deferred = decide(&score_with(0.2, 0.1), 5, &config);
        assert!(!deferred.should_trigger);
        assert_eq!(deferred.urgency, Urgency::Low);
    }

    #[test]
    fn low_quota_override_wins() {
        let config = ScoringConfig::default();
        for remaining in [0, 1] {
            let prediction = decide(&score_with(0.0, 0.9), remaining, &config);
            assert_eq!(prediction.trigger_type, TriggerType::Immediate);
            assert_eq!(prediction.urgency, Urgency::High);
            assert!(prediction.should_trigger);
        }
    }

    #[test]
    fn sub_windows_ignore_old_events() {
        let engine = engine();
        let now = 60 * MINUTE;
        // Saves 20 minutes ago are outside the 10 minute intent window.
        for offset in 0..5 {
            engine
                .ingest(BehavioralEvent::new("f1", "s1", EventKind::SaveAttempt, now - 20 * MINUTE + offset))
                .unwrap();
        }
        let score = engine.score(&context(10, 5 * MINUTE, now)).unwrap();
        assert!((score.factors.intent - 0.06).abs() < 1e-9);
        assert_eq!(score.pattern, UserPattern::GoalOriented);
    }

    #[test]
    fn engaged_visitor_scores_high() {
        let engine = engine();
        let now = 30 * MINUTE;
        let mut timestamp = now - 8 * MINUTE;
        for page in ["home", "pricing", "reports"] {
            engine
                .ingest(BehavioralEvent::new("f1", "s1", EventKind::PageView, timestamp).with("page", page))
                .unwrap();
            timestamp += 20_000;
        }
        for index in 0..10 {
            engine
                .ingest(
                    BehavioralEvent::new("f1", "s1", EventKind::FeatureClick, timestamp)
                        .with("feature", format!("chart-{index}")),
                )
                .unwrap();
            timestamp += 5_000;
        }
        engine
            .ingest(BehavioralEvent::new("f1", "s1", EventKind::Scroll, timestamp).with("depth", 0.9))
            .unwrap();
        engine
            .ingest(BehavioralEvent::new("f1", "s1", EventKind::SaveAttempt, timestamp + 1_000))
            .unwrap();

        let prediction = engine.predict(&context(4, 6 * MINUTE, now));
        assert!(prediction.confidence > 0.6, "confidence {}", prediction.confidence);
        assert!(prediction.should_trigger);
    }

    struct BrokenStore;

    impl BehaviorStore for BrokenStore {
        fn append_event(&self, _: BehavioralEvent, _: usize) -> Result<(), StoreError> {
            Err(StoreError::Transient("down".into()))
        }

        fn events_since(&self, _: &str, _: u64) -> Result<Vec<BehavioralEvent>, StoreError> {
            Err(StoreError::Transient("down".into()))
        }

        fn evict_before(&self, _: u64) -> Result<usize, StoreError> {
            Ok(0)
        }
    }

    #[test]
    fn store_failure_falls_back_conservatively() {
        let engine = BehavioralScoringEngine::new(
            ScoringConfig::default(),
            RetentionPolicy::default(),
            BrokenStore,
        );
        let prediction = engine.predict(&context(3, MINUTE, MINUTE));
        assert!(!prediction.should_trigger);
        assert_eq!(prediction.trigger_type, TriggerType::Deferred);
        assert_eq!(prediction.urgency, Urgency::Medium);
        assert!(engine.ingest(BehavioralEvent::new("f1", "s1", EventKind::Click, 0)).is_err());
    }

    #[test]
    fn store_failure_keeps_the_last_trial_override() {
        let engine = BehavioralScoringEngine::new(
            ScoringConfig::default(),
            RetentionPolicy::default(),
            BrokenStore,
        );
        for remaining in [0, 1] {
            let prediction = engine.predict(&context(remaining, MINUTE, MINUTE));
            assert!(prediction.should_trigger);
            assert_eq!(prediction.trigger_type, TriggerType::Immediate);
            assert_eq!(prediction.urgency, Urgency::High);
            assert_eq!(prediction.recommended_delay_ms, 0);
        }
    }

    #[test]
    fn retention_eviction_by_age() {
        let engine = engine();
        engine.ingest(BehavioralEvent::new("f1", "s1", EventKind::Click, 0)).unwrap();
        engine.ingest(BehavioralEvent::new("f1", "s1", EventKind::Click, 8 * 24 * 60 * MINUTE)).unwrap();
        let removed = engine.evict_expired(8 * 24 * 60 * MINUTE).unwrap();
        assert_eq!(removed, 1);
    }
}
