// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Feature access resolution.
//!
//! [`FeatureAccessResolver::resolve`] is a total, side-effect free function
//! of `(feature, auth state, ledger)`.  It never consumes quota: a `Trial`
//! verdict tells the caller which action to consume next.
//!
//! Evaluation order:
//!
//! 1. Authenticated — allowed, unless the feature needs an elevated plan and
//!    the user is on the free plan (`premium_required`).
//! 2. Auth required and no trial path — `login_required`.
//! 3. Trial path — `trial` when affordable, else `blocked` or `exhausted`
//!    depending on the ledger.
//! 4. Anything else — denied as `blocked`.
//!
//! Unknown features resolve with [`FeaturePermission::default`], which
//! requires login.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::WeightTable;
use crate::types::{
    Access, AccessReason, ActionKind, AuthState, FeaturePermission, LedgerStatus, Plan,
    TrialLedger,
};

/// The part of a ledger an access decision needs.  Implemented for the
/// server-side [`TrialLedger`] and for the [`LedgerStatus`] snapshot a
/// client mirror holds.
pub trait QuotaView {
    fn remaining(&self) -> u32;
    fn is_blocked(&self) -> bool;
}

impl QuotaView for TrialLedger {
    fn remaining(&self) -> u32 {
        self.remaining
    }

    fn is_blocked(&self) -> bool {
        self.is_blocked
    }
}

impl QuotaView for LedgerStatus {
    fn remaining(&self) -> u32 {
        self.remaining
    }

    fn is_blocked(&self) -> bool {
        self.is_blocked
    }
}

/// Static per-feature rules.
///
/// ```rust
/// use trialgate_core::access::FeaturePermissionTable;
///
/// let table = FeaturePermissionTable::default();
/// assert!(table.get("video_analysis").allows_trial);
/// assert!(!table.get("save_report").allows_trial);
/// // Unknown features fail closed.
/// assert!(table.get("time_travel").requires_auth);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeaturePermissionTable(BTreeMap<String, FeaturePermission>);

impl FeaturePermissionTable {
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, feature: &str, permission: FeaturePermission) {
        self.0.insert(feature.into(), permission);
    }

    /// Rule for `feature`, or the fail-closed default.
    pub fn get(&self, feature: &str) -> FeaturePermission {
        self.0.get(feature).cloned().unwrap_or_default()
    }

    pub fn features(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl Default for FeaturePermissionTable {
    fn default() -> Self {
        let trial = |kind: ActionKind| FeaturePermission {
            requires_auth: true,
            allows_trial: true,
            trial_action_kind: Some(kind),
            requires_elevated_plan: false,
        };
        let login_only = FeaturePermission::default();

        let mut table = Self::empty();
        for kind in ActionKind::ALL {
            table.insert(kind.as_str(), trial(kind));
        }
        table.insert("save_report", login_only.clone());
        table.insert("export_report", login_only.clone());
        table.insert("share_report", login_only);
        table.insert(
            "api_access",
            FeaturePermission {
                requires_elevated_plan: true,
                ..FeaturePermission::default()
            },
        );
        table
    }
}

/// Combines auth state, quota state and the permission table.
#[derive(Debug, Clone, Default)]
pub struct FeatureAccessResolver {
    permissions: FeaturePermissionTable,
    weights: WeightTable,
}

impl FeatureAccessResolver {
    pub fn new(permissions: FeaturePermissionTable, weights: WeightTable) -> Self {
        Self { permissions, weights }
    }

    pub fn permissions(&self) -> &FeaturePermissionTable {
        &self.permissions
    }

    /// Decide whether `feature` may be used right now.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use trialgate_core::access::FeatureAccessResolver;
    /// use trialgate_core::types::{AccessReason, AuthState, TrialLedger};
    ///
    /// let resolver = FeatureAccessResolver::default();
    /// let ledger = TrialLedger::new("f1", 5, 0, None);
    ///
    /// let access = resolver.resolve("save_report", &AuthState::Anonymous, Some(&ledger));
    /// assert!(!access.allowed);
    /// assert_eq!(access.reason, AccessReason::LoginRequired);
    ///
    /// let access = resolver.resolve("video_analysis", &AuthState::Anonymous, Some(&ledger));
    /// assert!(access.allowed);
    /// assert_eq!(access.reason, AccessReason::Trial);
    /// ```
    pub fn resolve<Q: QuotaView>(&self, feature: &str, auth: &AuthState, ledger: Option<&Q>) -> Access {
        let permission = self.permissions.get(feature);
        let remaining = ledger.map(QuotaView::remaining);

        if let AuthState::Authenticated { plan } = auth {
            if permission.requires_elevated_plan && *plan == Plan::Free {
                return Access::deny(AccessReason::PremiumRequired, remaining);
            }
            return Access {
                allowed: true,
                reason: AccessReason::Authenticated,
                trial_action: None,
                weight: None,
                remaining,
            };
        }

        let trial = self.trial_path(&permission).zip(ledger);

        match trial {
            None if permission.requires_auth => Access::deny(AccessReason::LoginRequired, remaining),
            Some(((kind, weight), ledger)) => {
                if !ledger.is_blocked() && ledger.remaining() >= weight {
                    Access {
                        allowed: true,
                        reason: AccessReason::Trial,
                        trial_action: Some(kind),
                        weight: Some(weight),
                        remaining,
                    }
                } else if ledger.is_blocked() {
                    Access::deny(AccessReason::Blocked, remaining)
                } else {
                    Access::deny(AccessReason::Exhausted, remaining)
                }
            }
            None => Access::deny(AccessReason::Blocked, remaining),
        }
    }

    /// `(kind, weight)` when the feature can be used on trial at all.
    fn trial_path(&self, permission: &FeaturePermission) -> Option<(ActionKind, u32)> {
        if !permission.allows_trial {
            return None;
        }
        let kind = permission.trial_action_kind?;
        self.weights.weight_of(kind).map(|weight| (kind, weight))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> FeatureAccessResolver {
        FeatureAccessResolver::default()
    }

    fn ledger(remaining: u32, blocked: bool) -> TrialLedger {
        let mut ledger = TrialLedger::new("f1", 5, 0, None);
        ledger.remaining = remaining;
        ledger.is_blocked = blocked;
        ledger
    }

    #[test]
    fn authenticated_users_are_never_exhausted() {
        let empty = ledger(0, false);
        for feature in ["video_analysis", "bulk_analysis", "save_report", "unknown"] {
            let access = resolver().resolve(
                feature,
                &AuthState::Authenticated { plan: Plan::Free },
                Some(&empty),
            );
            assert!(access.allowed, "{feature}");
            assert_ne!(access.reason, AccessReason::Exhausted);
        }
    }

    #[test]
    fn free_plan_needs_premium_for_elevated_features() {
        let access = resolver().resolve(
            "api_access",
            &AuthState::Authenticated { plan: Plan::Free },
            None::<&TrialLedger>,
        );
        assert_eq!(access.reason, AccessReason::PremiumRequired);

        let access = resolver().resolve(
            "api_access",
            &AuthState::Authenticated { plan: Plan::Pro },
            None::<&TrialLedger>,
        );
        assert!(access.allowed);
    }

    #[test]
    fn trial_verdict_carries_action_and_weight() {
        let access = resolver().resolve("channel_analysis", &AuthState::Anonymous, Some(&ledger(2, false)));
        assert!(access.allowed);
        assert_eq!(access.trial_action, Some(ActionKind::ChannelAnalysis));
        assert_eq!(access.weight, Some(2));
    }

    #[test]
    fn short_ledger_is_exhausted_and_blocked_ledger_is_blocked() {
        let access = resolver().resolve("channel_analysis", &AuthState::Anonymous, Some(&ledger(1, false)));
        assert_eq!(access.reason, AccessReason::Exhausted);

        let access = resolver().resolve("video_analysis", &AuthState::Anonymous, Some(&ledger(5, true)));
        assert_eq!(access.reason, AccessReason::Blocked);
    }

    #[test]
    fn missing_ledger_means_login() {
        let access = resolver().resolve("video_analysis", &AuthState::Anonymous, None::<&TrialLedger>);
        assert_eq!(access.reason, AccessReason::LoginRequired);
    }

    #[test]
    fn no_auth_and_no_trial_denies_as_blocked() {
        let mut table = FeaturePermissionTable::empty();
        table.insert(
            "preview",
            FeaturePermission {
                requires_auth: false,
                allows_trial: false,
                trial_action_kind: None,
                requires_elevated_plan: false,
            },
        );
        let resolver = FeatureAccessResolver::new(table, WeightTable::default());
        let access = resolver.resolve("preview", &AuthState::Anonymous, Some(&ledger(5, false)));
        assert_eq!(access.reason, AccessReason::Blocked);
    }

    #[test]
    fn snapshot_view_resolves_like_ledger() {
        let status = LedgerStatus::from(&ledger(0, false));
        let access = resolver().resolve("trend_report", &AuthState::Anonymous, Some(&status));
        assert_eq!(access.reason, AccessReason::Exhausted);
    }

    #[test]
    fn table_parses_from_json() {
        let table: FeaturePermissionTable = serde_json::from_str(
            r#"{"preview": {"requires_auth": false, "allows_trial": true, "trial_action_kind": "trend_report"}}"#,
        )
        .expect("parse");
        assert_eq!(table.get("preview").trial_action_kind, Some(ActionKind::TrendReport));
    }
}
