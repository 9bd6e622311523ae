// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Shared data types used across all TrialGate sub-systems.
//!
//! All types implement [`Clone`], [`Debug`], [`serde::Serialize`], and
//! [`serde::Deserialize`] so they can be serialised to JSON, stored, and
//! transmitted across WASM boundaries without additional conversion steps.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TrialError;

/// Opaque key/value payload attached to trial actions and behavioral events.
pub type Metadata = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Trial actions
// ---------------------------------------------------------------------------

/// A quota-consuming feature action.
///
/// The weight of each kind lives in the authoritative
/// [`WeightTable`](crate::config::WeightTable); the enum itself carries no
/// cost so that a client can never smuggle its own weight in.
///
/// # Examples
///
/// ```rust
/// use trialgate_core::types::ActionKind;
///
/// let kind: ActionKind = "channel_analysis".parse().unwrap();
/// assert_eq!(kind, ActionKind::ChannelAnalysis);
/// assert!("teleport".parse::<ActionKind>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    VideoAnalysis,
    ChannelAnalysis,
    KeywordResearch,
    CompetitorAnalysis,
    TrendReport,
    BulkAnalysis,
}

impl ActionKind {
    /// Every action kind, in declaration order.
    pub const ALL: [ActionKind; 6] = [
        ActionKind::VideoAnalysis,
        ActionKind::ChannelAnalysis,
        ActionKind::KeywordResearch,
        ActionKind::CompetitorAnalysis,
        ActionKind::TrendReport,
        ActionKind::BulkAnalysis,
    ];

    /// Wire name of the action kind.
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::VideoAnalysis      => "video_analysis",
            ActionKind::ChannelAnalysis    => "channel_analysis",
            ActionKind::KeywordResearch    => "keyword_research",
            ActionKind::CompetitorAnalysis => "competitor_analysis",
            ActionKind::TrendReport        => "trend_report",
            ActionKind::BulkAnalysis       => "bulk_analysis",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = TrialError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| TrialError::InvalidActionType(value.to_owned()))
    }
}

/// One entry of a ledger's append-only consumption log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialAction {
    /// The action that consumed quota.
    pub kind: ActionKind,
    /// Weight resolved from the server's table at consumption time.
    pub weight: u32,
    /// Unix epoch milliseconds at which the action was recorded.
    pub timestamp_ms: u64,
    /// Caller-supplied context (page, item id, ...).  Only the
    /// `request_id` entry is read, for replay detection.
    #[serde(default)]
    pub metadata: Metadata,
}

// ---------------------------------------------------------------------------
// Trial ledger
// ---------------------------------------------------------------------------

/// Per-fingerprint quota record.
///
/// Invariant: `remaining <= total`.  The ledger is never deleted, only reset,
/// so `actions` doubles as the audit trail of consumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialLedger {
    /// Opaque device fingerprint (primary key).
    pub fingerprint: String,
    /// Quota left in the current period.
    pub remaining: u32,
    /// Quota granted per period.
    pub total: u32,
    /// Consumption log in insertion order.
    #[serde(default)]
    pub actions: Vec<TrialAction>,
    /// Anti-fraud flag. Consumption is refused while set.
    #[serde(default)]
    pub is_blocked: bool,
    /// Why the ledger was blocked, if it is.
    #[serde(default)]
    pub blocked_reason: Option<String>,
    /// When the ledger becomes eligible for periodic renewal.
    #[serde(default)]
    pub reset_at_ms: Option<u64>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    /// Monotonic write counter used for optimistic concurrency.
    #[serde(default)]
    pub version: u64,
}

impl TrialLedger {
    /// A fresh ledger with full quota.
    pub fn new(fingerprint: &str, total: u32, now_ms: u64, reset_at_ms: Option<u64>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            remaining: total,
            total,
            actions: Vec::new(),
            is_blocked: false,
            blocked_reason: None,
            reset_at_ms,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            version: 0,
        }
    }

    /// Current position in the ledger state machine.
    ///
    /// ```rust
    /// use trialgate_core::types::{LedgerState, TrialLedger};
    ///
    /// let mut ledger = TrialLedger::new("f1", 5, 0, None);
    /// assert_eq!(ledger.state(), LedgerState::Active);
    /// ledger.remaining = 0;
    /// assert_eq!(ledger.state(), LedgerState::Exhausted);
    /// ledger.is_blocked = true;
    /// assert_eq!(ledger.state(), LedgerState::Blocked);
    /// ```
    pub fn state(&self) -> LedgerState {
        if self.is_blocked {
            LedgerState::Blocked
        } else if self.remaining == 0 {
            LedgerState::Exhausted
        } else {
            LedgerState::Active
        }
    }

    /// Whether an action of `weight` fits: not blocked and enough quota left.
    pub fn can_afford(&self, weight: u32) -> bool {
        !self.is_blocked && self.remaining >= weight
    }

    /// Whether the renewal deadline has passed at `now_ms`.
    pub fn is_due_for_reset(&self, now_ms: u64) -> bool {
        matches!(self.reset_at_ms, Some(reset_at) if now_ms >= reset_at)
    }

    /// The `limit` most recent actions, newest last.
    pub fn recent_actions(&self, limit: usize) -> Vec<TrialAction> {
        let skip = self.actions.len().saturating_sub(limit);
        self.actions[skip..].to_vec()
    }
}

/// State machine position of a [`TrialLedger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerState {
    Active,
    Exhausted,
    Blocked,
}

/// How a consumption attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumeStatus {
    /// Quota was debited.
    Consumed,
    /// `remaining < weight`; nothing changed.
    InsufficientTrials,
    /// Ledger is blocked; nothing changed.
    Blocked,
}

/// Result of [`TrialManager::consume`](crate::trial::TrialManager::consume).
///
/// Exhaustion and blocking are business outcomes, not errors, so they are
/// reported here with distinct [`ConsumeStatus`] values and messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumeOutcome {
    pub success: bool,
    pub status: ConsumeStatus,
    /// Quota left after the call (unchanged on failure).
    pub remaining: u32,
    pub total: u32,
    /// `true` only when the ledger carries the anti-fraud flag.
    pub blocked: bool,
    /// `true` when this call moved the ledger from active to exhausted.
    pub exhausted: bool,
    /// Authoritative weight of the requested action.
    pub weight: u32,
    pub message: String,
}

/// Read-only projection of a ledger served by the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerStatus {
    pub fingerprint: String,
    pub remaining: u32,
    pub total: u32,
    pub is_blocked: bool,
    pub next_reset_at_ms: Option<u64>,
    pub recent_actions: Vec<TrialAction>,
}

impl From<&TrialLedger> for LedgerStatus {
    fn from(ledger: &TrialLedger) -> Self {
        Self {
            fingerprint: ledger.fingerprint.clone(),
            remaining: ledger.remaining,
            total: ledger.total,
            is_blocked: ledger.is_blocked,
            next_reset_at_ms: ledger.reset_at_ms,
            recent_actions: ledger.recent_actions(RECENT_ACTION_LIMIT),
        }
    }
}

/// Number of actions included in a [`LedgerStatus`].
pub const RECENT_ACTION_LIMIT: usize = 10;

// ---------------------------------------------------------------------------
// Feature access
// ---------------------------------------------------------------------------

/// Subscription tier of an authenticated user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Free,
    Pro,
    Enterprise,
}

/// Authentication state supplied by the (external) identity layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuthState {
    Anonymous,
    Authenticated { plan: Plan },
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::Authenticated { .. })
    }
}

/// Static access rule for one feature key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeaturePermission {
    pub requires_auth: bool,
    pub allows_trial: bool,
    /// Action debited when the feature is used on trial.
    #[serde(default)]
    pub trial_action_kind: Option<ActionKind>,
    #[serde(default)]
    pub requires_elevated_plan: bool,
}

impl Default for FeaturePermission {
    /// Unknown features fail closed: login required, no trial.
    fn default() -> Self {
        Self {
            requires_auth: true,
            allows_trial: false,
            trial_action_kind: None,
            requires_elevated_plan: false,
        }
    }
}

/// Why an [`Access`] verdict was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessReason {
    Authenticated,
    Trial,
    LoginRequired,
    PremiumRequired,
    Exhausted,
    Blocked,
    /// The ledger could not be read; access fails closed.
    Unavailable,
}

impl AccessReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessReason::Authenticated   => "authenticated",
            AccessReason::Trial           => "trial",
            AccessReason::LoginRequired   => "login_required",
            AccessReason::PremiumRequired => "premium_required",
            AccessReason::Exhausted       => "exhausted",
            AccessReason::Blocked         => "blocked",
            AccessReason::Unavailable     => "unavailable",
        }
    }
}

/// Verdict of the feature access resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
    pub allowed: bool,
    pub reason: AccessReason,
    /// Action the caller must consume when `reason == Trial`.
    pub trial_action: Option<ActionKind>,
    /// Authoritative weight of `trial_action`.
    pub weight: Option<u32>,
    /// Quota left according to the ledger the verdict was computed from.
    pub remaining: Option<u32>,
}

impl Access {
    pub(crate) fn deny(reason: AccessReason, remaining: Option<u32>) -> Self {
        Self {
            allowed: false,
            reason,
            trial_action: None,
            weight: None,
            remaining,
        }
    }
}

// ---------------------------------------------------------------------------
// Behavioral events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Mobile,
    Desktop,
    Tablet,
}

/// Interaction captured by the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PageView,
    FeatureClick,
    Click,
    Search,
    Scroll,
    IdleStart,
    IdleEnd,
    SaveAttempt,
    ExportAttempt,
    ShareAttempt,
    ExitIntent,
}

impl EventKind {
    /// Save/export/share attempts signal that the visitor wants to keep work.
    pub fn is_high_intent(self) -> bool {
        matches!(
            self,
            EventKind::SaveAttempt | EventKind::ExportAttempt | EventKind::ShareAttempt
        )
    }

    pub fn is_medium_intent(self) -> bool {
        matches!(self, EventKind::Search | EventKind::Click | EventKind::FeatureClick)
    }

    pub fn is_click(self) -> bool {
        matches!(self, EventKind::Click | EventKind::FeatureClick)
    }
}

/// One UI interaction of an anonymous visitor.
///
/// Well-known `data` keys: `page` (page views), `feature` / `target`
/// (clicks), `depth` (scroll depth in `0..=1` or percent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehavioralEvent {
    pub fingerprint: String,
    pub session_id: String,
    pub kind: EventKind,
    #[serde(default)]
    pub data: Metadata,
    pub timestamp_ms: u64,
    pub device_class: DeviceClass,
}

impl BehavioralEvent {
    pub fn new(fingerprint: &str, session_id: &str, kind: EventKind, timestamp_ms: u64) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            session_id: session_id.into(),
            kind,
            data: Metadata::new(),
            timestamp_ms,
            device_class: DeviceClass::Desktop,
        }
    }

    /// Attach a string datum (builder style).
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_device(mut self, device_class: DeviceClass) -> Self {
        self.device_class = device_class;
        self
    }

    pub fn page(&self) -> Option<&str> {
        self.data.get("page").and_then(serde_json::Value::as_str)
    }

    /// The thing that was acted on: `feature`, then `target`, then `page`.
    pub fn target(&self) -> Option<&str> {
        ["feature", "target", "page"]
            .iter()
            .find_map(|key| self.data.get(*key).and_then(serde_json::Value::as_str))
    }

    /// Scroll depth normalised to `0..=1`. Values above 1 are read as percent.
    pub fn scroll_depth(&self) -> Option<f64> {
        let raw = self.data.get("depth").and_then(serde_json::Value::as_f64)?;
        let depth = if raw > 1.0 { raw / 100.0 } else { raw };
        Some(depth.clamp(0.0, 1.0))
    }
}

// ---------------------------------------------------------------------------
// Login timing
// ---------------------------------------------------------------------------

/// Caller-side context for a timing prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringContext {
    pub fingerprint: String,
    pub session_duration_ms: u64,
    pub trial_remaining: u32,
    pub device_class: DeviceClass,
    #[serde(default)]
    pub current_page: Option<String>,
    /// Evaluation instant; sub-windows are measured back from here.
    pub now_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Immediate,
    Delayed,
    ExitIntent,
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Medium,
    High,
}

/// Visitor archetype inferred from long-run behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserPattern {
    PowerUser,
    GoalOriented,
    Explorer,
    Casual,
}

/// The five independent factor scores, each in `0..=1`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FactorScores {
    pub engagement: f64,
    pub intent: f64,
    pub frustration: f64,
    pub time_spent: f64,
    pub action_pattern: f64,
}

/// Recommendation of the behavioral scoring engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingPrediction {
    pub should_trigger: bool,
    /// The composite score.
    pub confidence: f64,
    pub recommended_delay_ms: u64,
    pub trigger_type: TriggerType,
    pub urgency: Urgency,
    pub message: String,
    pub factors: FactorScores,
    pub pattern: Option<UserPattern>,
}

// ---------------------------------------------------------------------------
// Prompt optimisation
// ---------------------------------------------------------------------------

/// Visual treatment of a login prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptStyle {
    /// Accent colour name (e.g. `"blue"`).
    pub color: String,
    /// Size token: `"small"`, `"medium"` or `"large"`.
    pub size: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Copy key handed to the (external) i18n layer.
    pub copy: String,
    pub style: PromptStyle,
    pub timing_hint: TriggerType,
}

/// Feedback counters. Only ever incremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Performance {
    pub impressions: u64,
    pub clicks: u64,
    pub conversions: u64,
}

/// Time-of-day range in local hours, `start..end`, wrapping past midnight
/// when `start > end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourRange {
    pub start: u8,
    pub end: u8,
}

impl HourRange {
    pub fn contains(&self, hour: u8) -> bool {
        if self.start <= self.end {
            hour >= self.start && hour < self.end
        } else {
            hour >= self.start || hour < self.end
        }
    }
}

/// Personalisation predicate. `None` fields match anything.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Segment {
    #[serde(default)]
    pub device_class: Option<DeviceClass>,
    #[serde(default)]
    pub user_type: Option<UserPattern>,
    #[serde(default)]
    pub hours: Option<HourRange>,
}

impl Segment {
    pub fn matches(&self, visitor: &VisitorContext) -> bool {
        let device_ok = self
            .device_class
            .map_or(true, |device| device == visitor.device_class);
        let user_ok = self
            .user_type
            .map_or(true, |user_type| visitor.user_type == Some(user_type));
        let hours_ok = self.hours.map_or(true, |range| range.contains(visitor.hour_of_day));
        device_ok && user_ok && hours_ok
    }
}

/// Who is about to see a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitorContext {
    pub device_class: DeviceClass,
    #[serde(default)]
    pub user_type: Option<UserPattern>,
    /// Local hour, `0..24`.
    pub hour_of_day: u8,
}

/// One bandit arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptCandidate {
    pub id: String,
    pub experiment_id: String,
    pub config: PromptConfig,
    #[serde(default)]
    pub performance: Performance,
    /// `None` means the arm belongs to the unsegmented set.
    #[serde(default)]
    pub segment: Option<Segment>,
    /// Arm this variant was spawned from, if any.
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub generation: u32,
    #[serde(default)]
    pub created_at_ms: u64,
}

impl PromptCandidate {
    pub fn new(id: &str, experiment_id: &str, config: PromptConfig) -> Self {
        Self {
            id: id.into(),
            experiment_id: experiment_id.into(),
            config,
            performance: Performance::default(),
            segment: None,
            parent_id: None,
            generation: 0,
            created_at_ms: 0,
        }
    }

    pub fn with_segment(mut self, segment: Segment) -> Self {
        self.segment = Some(segment);
        self
    }
}

/// Which ratio an experiment optimises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardMetric {
    ConversionRate,
    ClickThroughRate,
}

/// Per-experiment bandit parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub reward: RewardMetric,
    pub min_sample_size: u64,
    pub confidence_threshold: f64,
    pub exploration_rate: f64,
    /// Reward rate the best arm must reach before variants are spawned.
    pub spawn_reward_threshold: f64,
    /// Upper bound on arms; spawning stops here.
    pub max_arms: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    Impression,
    Click,
    Conversion,
}

/// Buffered feedback awaiting the periodic batch update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    /// Caller-unique id; replays of the same id are ignored.
    pub event_id: String,
    pub arm_id: String,
    pub kind: FeedbackKind,
    pub timestamp_ms: u64,
}

/// How an arm was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    ColdStart,
    Explore,
    Exploit,
}

/// Result of a bandit selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub candidate: PromptCandidate,
    pub strategy: SelectionStrategy,
    /// UCB1 score for exploit selections, `None` otherwise.
    pub score: Option<f64>,
    /// Whether segmentation found no match and the unsegmented set was used.
    pub fell_back: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_recent_actions_keeps_newest() {
        let mut ledger = TrialLedger::new("f1", 20, 0, None);
        for index in 0..15u64 {
            ledger.actions.push(TrialAction {
                kind: ActionKind::VideoAnalysis,
                weight: 1,
                timestamp_ms: index,
                metadata: Metadata::new(),
            });
        }
        let recent = ledger.recent_actions(RECENT_ACTION_LIMIT);
        assert_eq!(recent.len(), 10);
        assert_eq!(recent.first().map(|action| action.timestamp_ms), Some(5));
        assert_eq!(recent.last().map(|action| action.timestamp_ms), Some(14));
    }

    #[test]
    fn hour_range_wraps_midnight() {
        let night = HourRange { start: 22, end: 6 };
        assert!(night.contains(23));
        assert!(night.contains(2));
        assert!(!night.contains(12));
    }

    #[test]
    fn scroll_depth_accepts_percent() {
        let event = BehavioralEvent::new("f1", "s1", EventKind::Scroll, 0).with("depth", 75);
        assert_eq!(event.scroll_depth(), Some(0.75));
    }

    #[test]
    fn auth_state_serialises_with_tag() {
        let json = serde_json::to_string(&AuthState::Authenticated { plan: Plan::Free })
            .expect("serialise");
        assert_eq!(json, r#"{"status":"authenticated","plan":"free"}"#);
    }
}
