// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! The five behavioral factors.
//!
//! Pure functions over an event slice (oldest first) and the scoring
//! coefficients.  Each returns a value in `0..=1`.  The caller is
//! responsible for cutting the slice to the factor's sub-window.

use std::collections::BTreeSet;

use hashbrown::HashMap;

use crate::config::ScoringConfig;
use crate::types::{BehavioralEvent, EventKind, UserPattern};

/// Feature-click share above which a visitor may be a power user.
const POWER_USER_FEATURE_RATIO: f64 = 0.5;
/// Events per session above which a visitor may be a power user.
const POWER_USER_EVENTS_PER_SESSION: f64 = 20.0;
/// Goal-oriented visitors stay on few pages.
const GOAL_ORIENTED_MAX_PAGES: usize = 3;
const EXPLORER_MIN_PAGES: usize = 5;

fn ratio(count: f64, cap: f64) -> f64 {
    if cap <= 0.0 {
        return 0.0;
    }
    (count / cap).clamp(0.0, 1.0)
}

fn distinct_pages(events: &[BehavioralEvent]) -> usize {
    events
        .iter()
        .filter(|event| event.kind == EventKind::PageView)
        .filter_map(BehavioralEvent::page)
        .collect::<BTreeSet<_>>()
        .len()
}

/// Distinct pages, feature interactions, deepest scroll and session length.
pub fn engagement(events: &[BehavioralEvent], session_duration_ms: u64, config: &ScoringConfig) -> f64 {
    let pages = ratio(distinct_pages(events) as f64, config.page_cap);
    let interactions = ratio(
        events
            .iter()
            .filter(|event| event.kind == EventKind::FeatureClick)
            .count() as f64,
        config.interaction_cap,
    );
    let scroll = events
        .iter()
        .filter(|event| event.kind == EventKind::Scroll)
        .filter_map(BehavioralEvent::scroll_depth)
        .fold(0.0_f64, f64::max);
    let session = ratio(session_duration_ms as f64, config.session_cap_ms as f64);

    let weights = &config.engagement;
    (pages * weights.pages
        + interactions * weights.interactions
        + scroll * weights.scroll
        + session * weights.session)
        .clamp(0.0, 1.0)
}

/// Trial urgency: the fewer trials left, the more pressing the prompt.
pub fn trial_urgency(trial_remaining: u32) -> f64 {
    match trial_remaining {
        0..=2 => 0.8,
        3..=5 => 0.5,
        _ => 0.2,
    }
}

/// Save/export/share attempts weigh heavily, searches and clicks lightly,
/// blended with trial urgency.
pub fn intent(events: &[BehavioralEvent], trial_remaining: u32, config: &ScoringConfig) -> f64 {
    let high = events.iter().filter(|event| event.kind.is_high_intent()).count() as f64;
    let medium = events.iter().filter(|event| event.kind.is_medium_intent()).count() as f64;
    let actions = ratio(
        high * config.high_intent_weight + medium * config.medium_intent_weight,
        config.intent_action_cap,
    );
    (actions + trial_urgency(trial_remaining) * config.urgency_weight).min(1.0)
}

/// Rapid clicks, A→B→A navigation, idling and repeated actions.
pub fn frustration(events: &[BehavioralEvent], config: &ScoringConfig) -> f64 {
    let clicks: Vec<u64> = events
        .iter()
        .filter(|event| event.kind.is_click())
        .map(|event| event.timestamp_ms)
        .collect();
    let rapid = clicks
        .windows(2)
        .filter(|pair| pair[1].saturating_sub(pair[0]) < config.rapid_click_gap_ms)
        .count();

    let pages: Vec<&str> = events
        .iter()
        .filter(|event| event.kind == EventKind::PageView)
        .filter_map(BehavioralEvent::page)
        .collect();
    let back_and_forth = pages
        .windows(3)
        .filter(|triple| triple[0] == triple[2] && triple[0] != triple[1])
        .count();

    let idle = events
        .iter()
        .filter(|event| event.kind == EventKind::IdleStart)
        .count();

    let mut seen: HashMap<(EventKind, Option<&str>), usize> = HashMap::new();
    for event in events.iter().filter(|event| event.kind != EventKind::Scroll) {
        *seen.entry((event.kind, event.target())).or_default() += 1;
    }
    let repeated = seen
        .values()
        .filter(|count| **count > config.repeat_threshold)
        .count();

    let weights = &config.frustration;
    (ratio(rapid as f64, config.rapid_click_cap) * weights.rapid_clicks
        + ratio(back_and_forth as f64, config.back_and_forth_cap) * weights.back_and_forth
        + ratio(idle as f64, config.idle_cap) * weights.idle
        + ratio(repeated as f64, config.repeated_action_cap) * weights.repeated_actions)
        .clamp(0.0, 1.0)
}

/// Ramps up to 1.0 over the optimal window's lower bound, holds, then
/// decays linearly to the floor.
///
/// ```rust
/// use trialgate_core::config::ScoringConfig;
/// use trialgate_core::factors::time_spent;
///
/// let config = ScoringConfig::default();
/// assert_eq!(time_spent(60_000, &config), 0.5);
/// assert_eq!(time_spent(5 * 60_000, &config), 1.0);
/// assert_eq!(time_spent(60 * 60_000, &config), 0.3);
/// ```
pub fn time_spent(session_duration_ms: u64, config: &ScoringConfig) -> f64 {
    let duration = session_duration_ms as f64;
    let lower = config.optimal_session_min_ms as f64;
    let upper = config.optimal_session_max_ms as f64;

    if duration < lower {
        ratio(duration, lower)
    } else if duration <= upper {
        1.0
    } else {
        let span = (config.session_decay_span_ms as f64).max(1.0);
        (1.0 - (duration - upper) / span).max(config.session_floor)
    }
}

/// Mean first-to-last event span per session id.
fn average_session_ms(events: &[BehavioralEvent]) -> u64 {
    let mut spans: HashMap<&str, (u64, u64)> = HashMap::new();
    for event in events {
        let span = spans
            .entry(event.session_id.as_str())
            .or_insert((event.timestamp_ms, event.timestamp_ms));
        span.0 = span.0.min(event.timestamp_ms);
        span.1 = span.1.max(event.timestamp_ms);
    }
    if spans.is_empty() {
        return 0;
    }
    let total: u64 = spans.values().map(|(first, last)| last - first).sum();
    total / spans.len() as u64
}

/// Archetype over the full retained window.
///
/// Rules in order: feature-heavy dense sessions make a power user; a
/// high-intent action on few pages is goal-oriented; wide page variety or
/// long average sessions make an explorer; anything else is casual.
pub fn classify(events: &[BehavioralEvent], config: &ScoringConfig) -> UserPattern {
    if events.is_empty() {
        return UserPattern::Casual;
    }

    let sessions = events
        .iter()
        .map(|event| event.session_id.as_str())
        .collect::<BTreeSet<_>>()
        .len()
        .max(1);
    let per_session = events.len() as f64 / sessions as f64;
    let feature_ratio = events
        .iter()
        .filter(|event| event.kind == EventKind::FeatureClick)
        .count() as f64
        / events.len() as f64;
    let pages = distinct_pages(events);
    let has_high_intent = events.iter().any(|event| event.kind.is_high_intent());

    if feature_ratio > POWER_USER_FEATURE_RATIO && per_session > POWER_USER_EVENTS_PER_SESSION {
        UserPattern::PowerUser
    } else if has_high_intent && pages <= GOAL_ORIENTED_MAX_PAGES {
        UserPattern::GoalOriented
    } else if pages >= EXPLORER_MIN_PAGES || average_session_ms(events) >= config.explorer_session_ms {
        UserPattern::Explorer
    } else {
        UserPattern::Casual
    }
}

pub fn pattern_score(pattern: UserPattern, config: &ScoringConfig) -> f64 {
    let scores = &config.patterns;
    match pattern {
        UserPattern::PowerUser => scores.power_user,
        UserPattern::GoalOriented => scores.goal_oriented,
        UserPattern::Explorer => scores.explorer,
        UserPattern::Casual => scores.casual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, timestamp_ms: u64) -> BehavioralEvent {
        BehavioralEvent::new("f1", "s1", kind, timestamp_ms)
    }

    fn page(name: &str, timestamp_ms: u64) -> BehavioralEvent {
        event(EventKind::PageView, timestamp_ms).with("page", name)
    }

    #[test]
    fn engagement_saturates() {
        let config = ScoringConfig::default();
        let mut events: Vec<_> = (0..6).map(|i| page(&format!("p{i}"), i)).collect();
        events.extend((0..12).map(|i| event(EventKind::FeatureClick, 10 + i)));
        events.push(event(EventKind::Scroll, 30).with("depth", 1.0));
        let score = engagement(&events, 10 * 60_000, &config);
        assert!((score - 1.0).abs() < 1e-9);
        assert_eq!(engagement(&[], 0, &config), 0.0);
    }

    #[test]
    fn intent_blends_actions_and_urgency() {
        let config = ScoringConfig::default();
        assert!((intent(&[], 10, &config) - 0.06).abs() < 1e-9);
        assert!((intent(&[], 2, &config) - 0.24).abs() < 1e-9);

        let events = vec![event(EventKind::SaveAttempt, 0), event(EventKind::Search, 1)];
        // (0.8 + 0.3) / 5 + 0.5 * 0.3
        assert!((intent(&events, 4, &config) - 0.37).abs() < 1e-9);
    }

    #[test]
    fn frustration_detects_each_signal() {
        let config = ScoringConfig::default();
        let rapid: Vec<_> = (0..6).map(|i| event(EventKind::Click, i * 100).with("target", format!("b{i}"))).collect();
        assert!((frustration(&rapid, &config) - 0.30).abs() < 1e-9);

        let bounce = vec![page("a", 0), page("b", 1), page("a", 2), page("b", 3), page("a", 4)];
        assert!((frustration(&bounce, &config) - 0.25).abs() < 1e-9);

        let idle: Vec<_> = (0..3).map(|i| event(EventKind::IdleStart, i * 10_000)).collect();
        assert!((frustration(&idle, &config) - 0.20).abs() < 1e-9);
    }

    #[test]
    fn repeated_actions_need_more_than_threshold() {
        let config = ScoringConfig::default();
        let three: Vec<_> = (0..3)
            .map(|i| event(EventKind::Search, i * 5_000).with("target", "q"))
            .collect();
        assert_eq!(frustration(&three, &config), 0.0);

        let four: Vec<_> = (0..4)
            .map(|i| event(EventKind::Search, i * 5_000).with("target", "q"))
            .collect();
        assert!((frustration(&four, &config) - 0.125).abs() < 1e-9);
    }

    #[test]
    fn time_spent_decays_past_optimum() {
        let config = ScoringConfig::default();
        assert_eq!(time_spent(0, &config), 0.0);
        assert!((time_spent(20 * 60_000, &config) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn classification_rules() {
        let config = ScoringConfig::default();
        assert_eq!(classify(&[], &config), UserPattern::Casual);

        let goal = vec![page("pricing", 0), event(EventKind::ExportAttempt, 1)];
        assert_eq!(classify(&goal, &config), UserPattern::GoalOriented);

        let explorer: Vec<_> = (0..5).map(|i| page(&format!("p{i}"), i)).collect();
        assert_eq!(classify(&explorer, &config), UserPattern::Explorer);

        let power: Vec<_> = (0..25).map(|i| event(EventKind::FeatureClick, i)).collect();
        assert_eq!(classify(&power, &config), UserPattern::PowerUser);
    }

    #[test]
    fn long_average_sessions_classify_as_explorer() {
        let config = ScoringConfig::default();
        let visit = |session: &str, end_ms: u64| {
            vec![
                BehavioralEvent::new("f1", session, EventKind::PageView, 0).with("page", "home"),
                BehavioralEvent::new("f1", session, EventKind::Scroll, end_ms / 2).with("depth", 0.4),
                BehavioralEvent::new("f1", session, EventKind::PageView, end_ms).with("page", "blog"),
            ]
        };

        let brief = visit("s1", 2 * 60_000);
        assert_eq!(classify(&brief, &config), UserPattern::Casual);

        let lingering = visit("s1", 12 * 60_000);
        assert_eq!(classify(&lingering, &config), UserPattern::Explorer);

        // Averaged across sessions: one long and one short visit fall under the bar.
        let mut mixed = visit("s1", 12 * 60_000);
        mixed.extend(visit("s2", 60_000));
        assert_eq!(classify(&mixed, &config), UserPattern::Casual);

        let patient = ScoringConfig {
            explorer_session_ms: 30 * 60_000,
            ..ScoringConfig::default()
        };
        assert_eq!(classify(&lingering, &patient), UserPattern::Casual);
    }
}
