//! Trial Policy (global, versioned configuration of the Pro trial offer)
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use protrial::audit::{AuditContext, AuditLog};
//! use protrial::clock::SystemClock;
//! use protrial::policy::{PolicyPatch, TrialConfigStore, TrialPolicy};
//!
//! let clock = Arc::new(SystemClock);
//! let audit = Arc::new(AuditLog::in_memory(clock.clone()));
//! let store = TrialConfigStore::new(audit, clock);
//! store.seed(TrialPolicy::default())?;
//!
//! let patch = PolicyPatch::default().duration_days(14);
//! let policy = store.update(&AuditContext::operator("ops"), patch)?;
//! assert_eq!(policy.duration_days, 14);
//! # Ok::<(), protrial::Error>(())
//! ```

mod store;

pub use store::{PolicyVersion, TrialConfigStore};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Longest trial the policy may grant.
pub const MAX_DURATION_DAYS: i64 = 30;

/// Which users may start a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Eligibility {
    /// Users with no prior trial record
    NewUsers,
    /// Users whose earlier trial has ended
    ReturningUsers,
    /// Users carrying a campaign attribution
    CampaignBased,
    /// Everyone
    AllUsers,
}

/// UX applied when a trial ends without conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DowngradeBehavior {
    /// Silently drop back to the free tier
    Automatic,
    /// Drop back but keep prompting to upgrade
    SoftPrompt,
    /// Block premium content behind the paywall
    HardBlock,
}

/// Global trial policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialPolicy {
    /// Whether new trials may start at all
    pub enabled: bool,
    /// Trial length (1..=30)
    pub duration_days: i64,
    /// Who may start a trial
    pub eligibility: Eligibility,
    /// What happens when a trial lapses
    pub downgrade_behavior: DowngradeBehavior,
    /// Day the paywall starts showing (0..=duration_days)
    pub paywall_after_days: i64,
    /// Convenience flag mirroring `downgrade_behavior == SoftPrompt`
    pub soft_downgrade_enabled: bool,
}

impl Default for TrialPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            duration_days: 7,
            eligibility: Eligibility::NewUsers,
            downgrade_behavior: DowngradeBehavior::SoftPrompt,
            paywall_after_days: 3,
            soft_downgrade_enabled: true,
        }
    }
}

impl TrialPolicy {
    /// Check range constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `duration_days` is outside 1..=30 or
    /// `paywall_after_days` is outside `0..=duration_days`.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_DURATION_DAYS).contains(&self.duration_days) {
            return Err(Error::Validation(format!(
                "durationDays must be between 1 and {MAX_DURATION_DAYS}, got {}",
                self.duration_days
            )));
        }
        if self.paywall_after_days < 0 {
            return Err(Error::Validation(format!(
                "paywallAfterDays must not be negative, got {}",
                self.paywall_after_days
            )));
        }
        if self.paywall_after_days > self.duration_days {
            return Err(Error::Validation(format!(
                "paywallAfterDays ({}) must not exceed durationDays ({})",
                self.paywall_after_days, self.duration_days
            )));
        }
        Ok(())
    }

    /// Field-level diff, `{field: {"from": old, "to": new}}`.
    #[must_use]
    pub fn diff(&self, next: &Self) -> serde_json::Map<String, serde_json::Value> {
        let mut changes = serde_json::Map::new();
        let (Ok(serde_json::Value::Object(old)), Ok(serde_json::Value::Object(new))) =
            (serde_json::to_value(self), serde_json::to_value(next))
        else {
            return changes;
        };

        for (field, to) in new {
            let from = old.get(&field).cloned().unwrap_or(serde_json::Value::Null);
            if from != to {
                changes.insert(field, serde_json::json!({ "from": from, "to": to }));
            }
        }
        changes
    }
}

/// Partial policy update.
///
/// Unset fields keep their current value. The whole result is validated
/// before it replaces the current policy; fields are never merged with a
/// concurrent writer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyPatch {
    /// New `enabled`
    pub enabled: Option<bool>,
    /// New `duration_days`
    pub duration_days: Option<i64>,
    /// New `eligibility`
    pub eligibility: Option<Eligibility>,
    /// New `downgrade_behavior`; wins over `soft_downgrade_enabled`
    pub downgrade_behavior: Option<DowngradeBehavior>,
    /// New `paywall_after_days`
    pub paywall_after_days: Option<i64>,
    /// New `soft_downgrade_enabled`; `true` alone implies `SoftPrompt`
    pub soft_downgrade_enabled: Option<bool>,
    /// Reject with `Conflict` unless this is still the current version
    pub expected_version: Option<u64>,
}

impl PolicyPatch {
    /// Set `enabled`.
    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Set `duration_days`.
    #[must_use]
    pub const fn duration_days(mut self, days: i64) -> Self {
        self.duration_days = Some(days);
        self
    }

    /// Set `eligibility`.
    #[must_use]
    pub const fn eligibility(mut self, eligibility: Eligibility) -> Self {
        self.eligibility = Some(eligibility);
        self
    }

    /// Set `downgrade_behavior`.
    #[must_use]
    pub const fn downgrade_behavior(mut self, behavior: DowngradeBehavior) -> Self {
        self.downgrade_behavior = Some(behavior);
        self
    }

    /// Set `paywall_after_days`.
    #[must_use]
    pub const fn paywall_after_days(mut self, days: i64) -> Self {
        self.paywall_after_days = Some(days);
        self
    }

    /// Set `soft_downgrade_enabled`.
    #[must_use]
    pub const fn soft_downgrade_enabled(mut self, enabled: bool) -> Self {
        self.soft_downgrade_enabled = Some(enabled);
        self
    }

    /// Require the current version to be `version`.
    #[must_use]
    pub const fn expect_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    /// Apply the patch to `base`, normalizing the soft-downgrade flag.
    ///
    /// The result is not validated.
    #[must_use]
    pub fn apply(&self, base: &TrialPolicy) -> TrialPolicy {
        let mut next = base.clone();
        if let Some(enabled) = self.enabled {
            next.enabled = enabled;
        }
        if let Some(days) = self.duration_days {
            next.duration_days = days;
        }
        if let Some(eligibility) = self.eligibility {
            next.eligibility = eligibility;
        }
        if let Some(days) = self.paywall_after_days {
            next.paywall_after_days = days;
        }

        match (self.downgrade_behavior, self.soft_downgrade_enabled) {
            (Some(behavior), _) => {
                next.downgrade_behavior = behavior;
                next.soft_downgrade_enabled = behavior == DowngradeBehavior::SoftPrompt;
            }
            (None, Some(true)) => {
                next.downgrade_behavior = DowngradeBehavior::SoftPrompt;
                next.soft_downgrade_enabled = true;
            }
            (None, Some(false)) => next.soft_downgrade_enabled = false,
            (None, None) => {}
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_valid() {
        TrialPolicy::default().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_paywall_after_end() {
        let policy = TrialPolicy {
            duration_days: 5,
            paywall_after_days: 6,
            ..TrialPolicy::default()
        };
        assert!(matches!(policy.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_validate_duration_range() {
        for days in [0, 31, -1] {
            let policy = TrialPolicy {
                duration_days: days,
                paywall_after_days: 0,
                ..TrialPolicy::default()
            };
            assert!(policy.validate().is_err(), "{days} days should be rejected");
        }
    }

    #[test]
    fn test_soft_flag_implies_soft_prompt() {
        let base = TrialPolicy {
            downgrade_behavior: DowngradeBehavior::HardBlock,
            soft_downgrade_enabled: false,
            ..TrialPolicy::default()
        };
        let next = PolicyPatch::default().soft_downgrade_enabled(true).apply(&base);
        assert_eq!(next.downgrade_behavior, DowngradeBehavior::SoftPrompt);
        assert!(next.soft_downgrade_enabled);
    }

    #[test]
    fn test_explicit_behavior_wins_over_soft_flag() {
        let next = PolicyPatch::default()
            .soft_downgrade_enabled(true)
            .downgrade_behavior(DowngradeBehavior::Automatic)
            .apply(&TrialPolicy::default());
        assert_eq!(next.downgrade_behavior, DowngradeBehavior::Automatic);
        assert!(!next.soft_downgrade_enabled);
    }

    #[test]
    fn test_clearing_soft_flag_keeps_behavior() {
        let next = PolicyPatch::default()
            .soft_downgrade_enabled(false)
            .apply(&TrialPolicy::default());
        assert_eq!(next.downgrade_behavior, DowngradeBehavior::SoftPrompt);
        assert!(!next.soft_downgrade_enabled);
    }

    #[test]
    fn test_diff_lists_changed_fields_only() {
        let old = TrialPolicy::default();
        let new = PolicyPatch::default().duration_days(14).apply(&old);
        let diff = old.diff(&new);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff["durationDays"], serde_json::json!({"from": 7, "to": 14}));
    }
}
