// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Adaptive prompt optimizer.
//!
//! A multi-armed bandit over [`PromptCandidate`]s, one experiment at a time:
//!
//! 1. **Segmentation** — segmented arms whose predicate matches the visitor
//!    compete; when none match, the unsegmented arms do.
//! 2. **Cold start** — any arm below the experiment's `min_sample_size`
//!    impressions is served first (fewest impressions, then registration
//!    order).
//! 3. **Exploration** — with probability `exploration_rate` a uniformly
//!    random arm is served.
//! 4. **Exploitation** — UCB1 argmax:
//!    `reward_rate + sqrt(2 · ln(total impressions) / impressions)`.
//!
//! Feedback is buffered by [`record_feedback`](PromptOptimizer::record_feedback)
//! and folded in by [`run_batch_update`](PromptOptimizer::run_batch_update),
//! which is safe to call late, early or twice: event ids are deduplicated
//! and stale events are discarded.  Counters only ever grow.

use std::collections::VecDeque;

use hashbrown::HashSet;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::OptimizerConfig;
use crate::error::OptimizerError;
use crate::storage::ArmStore;
use crate::types::{
    Experiment, FeedbackEvent, FeedbackKind, Performance, PromptCandidate, PromptStyle,
    RewardMetric, Selection, SelectionStrategy, VisitorContext,
};

/// Accent colours cycled through when spawning variants.
const COLORS: [&str; 4] = ["blue", "green", "orange", "purple"];
const SIZES: [&str; 3] = ["small", "medium", "large"];

impl Experiment {
    /// An experiment using the optimizer-wide defaults.
    pub fn with_defaults(id: &str, reward: RewardMetric, config: &OptimizerConfig) -> Self {
        Self {
            id: id.into(),
            reward,
            min_sample_size: config.min_sample_size,
            confidence_threshold: config.confidence_threshold,
            exploration_rate: config.exploration_rate,
            spawn_reward_threshold: config.spawn_reward_threshold,
            max_arms: config.max_arms_per_experiment,
        }
    }
}

/// Clicks or conversions per impression; `0` before the first impression.
pub fn reward_rate(performance: &Performance, metric: RewardMetric) -> f64 {
    if performance.impressions == 0 {
        return 0.0;
    }
    let successes = match metric {
        RewardMetric::ConversionRate => performance.conversions,
        RewardMetric::ClickThroughRate => performance.clicks,
    };
    successes as f64 / performance.impressions as f64
}

/// Saturating confidence in an arm's reward estimate.
///
/// ```rust
/// use trialgate_core::optimizer::confidence;
///
/// assert_eq!(confidence(29, 30), 0.0);
/// assert!(confidence(30, 30) > 0.5);
/// assert!(confidence(10_000, 30) < 0.95);
/// ```
pub fn confidence(impressions: u64, min_sample_size: u64) -> f64 {
    if impressions < min_sample_size {
        return 0.0;
    }
    let scale = min_sample_size.max(1) as f64;
    0.95 * (1.0 - (-(impressions as f64) / scale).exp())
}

/// UCB1 score.  Arms never shown score infinitely high.
pub fn ucb1(performance: &Performance, metric: RewardMetric, total_impressions: u64) -> f64 {
    if performance.impressions == 0 {
        return f64::INFINITY;
    }
    let total = total_impressions.max(1) as f64;
    let bonus = (2.0 * total.ln() / performance.impressions as f64).sqrt();
    reward_rate(performance, metric) + bonus
}

/// What a batch update did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Feedback events folded into counters.
    pub applied: usize,
    /// Events dropped for being older than the feedback window.
    pub expired: usize,
    /// Events naming an arm that no longer exists.
    pub orphaned: usize,
    /// Ids of newly spawned variants.
    pub spawned: Vec<String>,
}

/// Bounded memory of seen feedback ids.
#[derive(Debug)]
struct SeenIds {
    capacity: usize,
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ids: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// `false` when `id` was already seen.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.ids.insert(id.to_owned());
        self.order.push_back(id.to_owned());
        true
    }
}

/// Bandit prompt optimizer.
///
/// # Examples
///
/// ```rust
/// use trialgate_core::config::OptimizerConfig;
/// use trialgate_core::optimizer::PromptOptimizer;
/// use trialgate_core::storage::InMemoryStorage;
/// use trialgate_core::types::*;
///
/// let optimizer = PromptOptimizer::with_seed(OptimizerConfig::default(), InMemoryStorage::new(), 7);
/// optimizer
///     .register_experiment(Experiment::with_defaults("login", RewardMetric::ConversionRate, optimizer.config()))
///     .unwrap();
///
/// let style = PromptStyle { color: "blue".into(), size: "medium".into() };
/// for id in ["a", "b"] {
///     let config = PromptConfig { copy: id.into(), style: style.clone(), timing_hint: TriggerType::Immediate };
///     optimizer.add_candidate(PromptCandidate::new(id, "login", config)).unwrap();
/// }
///
/// let visitor = VisitorContext { device_class: DeviceClass::Mobile, user_type: None, hour_of_day: 9 };
/// let selection = optimizer.select("login", &visitor).unwrap();
/// assert_eq!(selection.strategy, SelectionStrategy::ColdStart);
/// assert_eq!(selection.candidate.id, "a");
/// ```
pub struct PromptOptimizer<S: ArmStore> {
    config: OptimizerConfig,
    store: S,
    rng: Mutex<StdRng>,
    /// Serialises read-modify-write of arm counters.
    write_lock: Mutex<()>,
    pending: Mutex<Vec<FeedbackEvent>>,
    seen: Mutex<SeenIds>,
}

impl<S: ArmStore> PromptOptimizer<S> {
    pub fn new(config: OptimizerConfig, store: S) -> Self {
        Self::from_rng(config, store, StdRng::from_entropy())
    }

    /// Deterministic exploration, for tests and replays.
    pub fn with_seed(config: OptimizerConfig, store: S, seed: u64) -> Self {
        Self::from_rng(config, store, StdRng::seed_from_u64(seed))
    }

    fn from_rng(config: OptimizerConfig, store: S, rng: StdRng) -> Self {
        let seen = SeenIds::new(config.dedup_capacity);
        Self {
            config,
            store,
            rng: Mutex::new(rng),
            write_lock: Mutex::new(()),
            pending: Mutex::new(Vec::new()),
            seen: Mutex::new(seen),
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn register_experiment(&self, experiment: Experiment) -> Result<(), OptimizerError> {
        tracing::debug!(experiment = %experiment.id, reward = ?experiment.reward, "experiment registered");
        self.store.put_experiment(&experiment)?;
        Ok(())
    }

    pub fn experiment(&self, experiment_id: &str) -> Result<Experiment, OptimizerError> {
        self.store
            .get_experiment(experiment_id)?
            .ok_or_else(|| OptimizerError::UnknownExperiment(experiment_id.into()))
    }

    /// Add an arm.  Re-adding an existing id updates its config and segment
    /// but keeps its counters.
    pub fn add_candidate(&self, mut candidate: PromptCandidate) -> Result<(), OptimizerError> {
        self.experiment(&candidate.experiment_id)?;
        let _guard = self.write_lock.lock();
        if let Some(existing) = self.store.get_arm(&candidate.id)? {
            candidate.performance = existing.performance;
        }
        self.store.put_arm(&candidate)?;
        Ok(())
    }

    pub fn candidates(&self, experiment_id: &str) -> Result<Vec<PromptCandidate>, OptimizerError> {
        self.experiment(experiment_id)?;
        Ok(self.store.arms(experiment_id)?)
    }

    pub fn retire_candidate(&self, arm_id: &str) -> Result<(), OptimizerError> {
        let _guard = self.write_lock.lock();
        self.store.evict_arm(arm_id)?;
        Ok(())
    }

    /// Pick the arm to show `visitor`.
    pub fn select(&self, experiment_id: &str, visitor: &VisitorContext) -> Result<Selection, OptimizerError> {
        let experiment = self.experiment(experiment_id)?;
        let arms = self.store.arms(experiment_id)?;

        let matching: Vec<PromptCandidate> = arms
            .iter()
            .filter(|arm| arm.segment.as_ref().map_or(false, |segment| segment.matches(visitor)))
            .cloned()
            .collect();
        let (pool, fell_back) = if matching.is_empty() {
            let unsegmented: Vec<PromptCandidate> =
                arms.into_iter().filter(|arm| arm.segment.is_none()).collect();
            (unsegmented, true)
        } else {
            (matching, false)
        };

        if pool.is_empty() {
            return Err(OptimizerError::NoCandidates(experiment_id.into()));
        }

        if let Some(cold) = pool
            .iter()
            .filter(|arm| arm.performance.impressions < experiment.min_sample_size)
            .min_by_key(|arm| arm.performance.impressions)
        {
            return Ok(Selection {
                candidate: cold.clone(),
                strategy: SelectionStrategy::ColdStart,
                score: None,
                fell_back,
            });
        }

        let explore = {
            let mut rng = self.rng.lock();
            if rng.gen::<f64>() < experiment.exploration_rate {
                Some(rng.gen_range(0..pool.len()))
            } else {
                None
            }
        };
        if let Some(index) = explore {
            return Ok(Selection {
                candidate: pool[index].clone(),
                strategy: SelectionStrategy::Explore,
                score: None,
                fell_back,
            });
        }

        let total: u64 = pool.iter().map(|arm| arm.performance.impressions).sum();
        let mut best: Option<(usize, f64)> = None;
        for (index, arm) in pool.iter().enumerate() {
            let score = ucb1(&arm.performance, experiment.reward, total);
            if best.map_or(true, |(_, best_score)| score > best_score) {
                best = Some((index, score));
            }
        }
        let (index, score) = best.ok_or_else(|| OptimizerError::NoCandidates(experiment_id.into()))?;

        Ok(Selection {
            candidate: pool[index].clone(),
            strategy: SelectionStrategy::Exploit,
            score: Some(score),
            fell_back,
        })
    }

    /// Add the given increments to an arm's counters.
    pub fn update_performance(
        &self,
        arm_id: &str,
        impressions: u64,
        clicks: u64,
        conversions: u64,
    ) -> Result<Performance, OptimizerError> {
        let _guard = self.write_lock.lock();
        let delta = Performance {
            impressions,
            clicks,
            conversions,
        };
        self.apply_increments(arm_id, &delta).map(|arm| arm.performance)
    }

    fn apply_increments(&self, arm_id: &str, delta: &Performance) -> Result<PromptCandidate, OptimizerError> {
        let mut arm = self
            .store
            .get_arm(arm_id)?
            .ok_or_else(|| OptimizerError::UnknownArm(arm_id.into()))?;
        let performance = &mut arm.performance;
        performance.impressions = performance.impressions.saturating_add(delta.impressions);
        performance.clicks = performance.clicks.saturating_add(delta.clicks);
        performance.conversions = performance.conversions.saturating_add(delta.conversions);
        self.store.put_arm(&arm)?;
        Ok(arm)
    }

    /// Put events back at the front of the buffer, ahead of anything
    /// recorded meanwhile.
    fn requeue(&self, events: Vec<FeedbackEvent>) {
        if events.is_empty() {
            return;
        }
        let mut pending = self.pending.lock();
        let newer = std::mem::replace(&mut *pending, events);
        pending.extend(newer);
    }

    /// Buffer feedback for the next batch update.  Returns `false` for a
    /// replayed event id.
    pub fn record_feedback(&self, event: FeedbackEvent) -> bool {
        if !self.seen.lock().insert(&event.event_id) {
            tracing::debug!(event_id = %event.event_id, "duplicate feedback ignored");
            return false;
        }
        self.pending.lock().push(event);
        true
    }

    pub fn pending_feedback(&self) -> usize {
        self.pending.lock().len()
    }

    /// Highest reward rate among arms with enough samples and confidence.
    pub fn winner(&self, experiment_id: &str) -> Result<Option<PromptCandidate>, OptimizerError> {
        let experiment = self.experiment(experiment_id)?;
        let arms = self.store.arms(experiment_id)?;
        Ok(best_arm(&experiment, &arms).cloned())
    }

    /// Fold buffered feedback into counters, then spawn variants from the
    /// winner when it clears the reward and confidence thresholds.
    ///
    /// On a store error, events for arms not yet written go back into the
    /// buffer so the next run applies them; arms already written keep their
    /// increments and are not replayed.
    pub fn run_batch_update(&self, now_ms: u64) -> Result<BatchReport, OptimizerError> {
        let drained = std::mem::take(&mut *self.pending.lock());
        let cutoff = now_ms.saturating_sub(self.config.feedback_window_ms);
        let mut report = BatchReport::default();

        let mut batches: Vec<(String, Performance, Vec<FeedbackEvent>)> = Vec::new();
        for event in drained {
            if event.timestamp_ms < cutoff {
                report.expired += 1;
                continue;
            }
            let position = match batches.iter().position(|(arm, _, _)| *arm == event.arm_id) {
                Some(position) => position,
                None => {
                    batches.push((event.arm_id.clone(), Performance::default(), Vec::new()));
                    batches.len() - 1
                }
            };
            let (_, delta, events) = &mut batches[position];
            match event.kind {
                FeedbackKind::Impression => delta.impressions += 1,
                FeedbackKind::Click => delta.clicks += 1,
                FeedbackKind::Conversion => delta.conversions += 1,
            }
            events.push(event);
        }

        let mut touched_experiments: Vec<String> = Vec::new();
        {
            let _guard = self.write_lock.lock();
            let mut remaining = batches.into_iter();
            while let Some((arm_id, delta, events)) = remaining.next() {
                match self.apply_increments(&arm_id, &delta) {
                    Ok(arm) => {
                        report.applied += events.len();
                        if !touched_experiments.contains(&arm.experiment_id) {
                            touched_experiments.push(arm.experiment_id);
                        }
                    }
                    Err(OptimizerError::UnknownArm(_)) => {
                        tracing::warn!(arm_id = %arm_id, events = events.len(), "feedback for unknown arm dropped");
                        report.orphaned += events.len();
                    }
                    Err(error) => {
                        let unapplied: Vec<FeedbackEvent> =
                            events.into_iter().chain(remaining.by_ref().flat_map(|(_, _, events)| events)).collect();
                        tracing::warn!(
                            %error,
                            requeued = unapplied.len(),
                            "batch update interrupted, feedback kept for the next run"
                        );
                        self.requeue(unapplied);
                        return Err(error);
                    }
                }
            }

            for experiment_id in &touched_experiments {
                let spawned = self.spawn_variants(experiment_id, now_ms)?;
                report.spawned.extend(spawned);
            }
        }

        if report.applied > 0 || report.expired > 0 || !report.spawned.is_empty() {
            tracing::info!(
                applied = report.applied,
                expired = report.expired,
                orphaned = report.orphaned,
                spawned = report.spawned.len(),
                "optimizer batch update"
            );
        }
        Ok(report)
    }

    /// Colour and size perturbations of the winner.  Idempotent: a winner
    /// that already has children of the next generation spawns nothing.
    fn spawn_variants(&self, experiment_id: &str, now_ms: u64) -> Result<Vec<String>, OptimizerError> {
        let experiment = self.experiment(experiment_id)?;
        let arms = self.store.arms(experiment_id)?;
        let Some(parent) = best_arm(&experiment, &arms) else {
            return Ok(Vec::new());
        };
        if reward_rate(&parent.performance, experiment.reward) < experiment.spawn_reward_threshold {
            return Ok(Vec::new());
        }

        let generation = parent.generation + 1;
        let already_spawned = arms
            .iter()
            .any(|arm| arm.parent_id.as_deref() == Some(parent.id.as_str()) && arm.generation == generation);
        if already_spawned {
            return Ok(Vec::new());
        }

        let room = experiment.max_arms.saturating_sub(arms.len());
        let styles = [
            PromptStyle {
                color: next_in(&COLORS, &parent.config.style.color).into(),
                size: parent.config.style.size.clone(),
            },
            PromptStyle {
                color: parent.config.style.color.clone(),
                size: next_in(&SIZES, &parent.config.style.size).into(),
            },
        ];

        let mut spawned = Vec::new();
        for (index, style) in styles.into_iter().take(room).enumerate() {
            let mut config = parent.config.clone();
            config.style = style;
            let child = PromptCandidate {
                id: format!("{}-g{}-{}", parent.id, generation, index + 1),
                experiment_id: experiment_id.into(),
                config,
                performance: Performance::default(),
                segment: parent.segment.clone(),
                parent_id: Some(parent.id.clone()),
                generation,
                created_at_ms: now_ms,
            };
            self.store.put_arm(&child)?;
            tracing::info!(experiment = experiment_id, parent = %parent.id, child = %child.id, "variant spawned");
            spawned.push(child.id);
        }
        Ok(spawned)
    }
}

fn best_arm<'a>(experiment: &Experiment, arms: &'a [PromptCandidate]) -> Option<&'a PromptCandidate> {
    let mut best: Option<(&PromptCandidate, f64)> = None;
    for arm in arms {
        let impressions = arm.performance.impressions;
        if impressions < experiment.min_sample_size
            || confidence(impressions, experiment.min_sample_size) < experiment.confidence_threshold
        {
            continue;
        }
        let rate = reward_rate(&arm.performance, experiment.reward);
        if best.map_or(true, |(_, best_rate)| rate > best_rate) {
            best = Some((arm, rate));
        }
    }
    best.map(|(arm, _)| arm)
}

/// The entry after `current` in `values`, wrapping; the first entry when
/// `current` is unknown.
fn next_in<'a>(values: &[&'a str], current: &str) -> &'a str {
    let position = values.iter().position(|value| *value == current);
    let next = position.map_or(0, |index| (index + 1) % values.len());
    values[next]
}
