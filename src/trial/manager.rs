//! Trial Lifecycle Manager - eligibility, transitions and expiry sweep

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

use super::{
    CampaignAttribution, CancelFlag, Entitlement, SweepReport, TrialStats, TrialStatus, UserTrial,
};
use crate::audit::{AuditAction, AuditContext, AuditDraft, AuditLog};
use crate::clock::Clock;
use crate::policy::{DowngradeBehavior, Eligibility, TrialConfigStore, TrialPolicy};
use crate::{Error, Result};

/// Knobs that shape lifecycle rules beyond the global policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleSettings {
    /// Largest number of days one `extend_trial` call may add
    pub max_extension_days: i64,
    /// Allow `Expired -> Converted` without an intervening extend
    pub allow_late_conversion: bool,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            max_extension_days: 90,
            allow_late_conversion: false,
        }
    }
}

/// Result of a transition closure: `None` means "already there".
type Step = Option<(UserTrial, AuditDraft)>;

/// Owner of every [`UserTrial`].
///
/// ## Design
///
/// Trials live in a concurrent map keyed by id. A transition holds the
/// trial's entry guard while it computes the next state, appends the audit
/// entry and installs the new state, so concurrent commands on one trial
/// serialize and an audit failure leaves the trial untouched. A second map
/// indexes trial ids by user; its entry guard serializes `start_trial` per
/// user so eligibility is decided against a stable history.
#[derive(Debug)]
pub struct TrialLifecycleManager {
    trials: DashMap<String, UserTrial, FxBuildHasher>,
    by_user: DashMap<String, Vec<String>, FxBuildHasher>,
    next_id: AtomicU64,
    policy: Arc<TrialConfigStore>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    settings: LifecycleSettings,
}

impl TrialLifecycleManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new(
        policy: Arc<TrialConfigStore>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            trials: DashMap::with_hasher(FxBuildHasher),
            by_user: DashMap::with_hasher(FxBuildHasher),
            next_id: AtomicU64::new(1),
            policy,
            audit,
            clock,
            settings,
        }
    }

    /// Start a trial for `user_id` under the current policy.
    ///
    /// # Errors
    ///
    /// - [`Error::NotEligible`] if trials are disabled, the user already has
    ///   an active trial, or the eligibility rule rejects the user
    /// - [`Error::NotFound`] if no policy has been seeded
    /// - [`Error::StorageError`] if the audit entry cannot be written
    pub fn start_trial(
        &self,
        ctx: &AuditContext,
        user_id: &str,
        attribution: Option<&CampaignAttribution>,
    ) -> Result<UserTrial> {
        let policy = self.policy.get_current()?;

        let mut owned = self.by_user.entry(user_id.to_string()).or_default();
        match self.admit(ctx, &policy, user_id, &owned, attribution) {
            Ok(trial) => {
                owned.push(trial.id.clone());
                tracing::info!(trial_id = %trial.id, user_id, "trial started");
                Ok(trial)
            }
            Err(e) => {
                let vacant = owned.is_empty();
                drop(owned);
                // rejected callers leave no index entry behind
                if vacant {
                    self.by_user.remove_if(user_id, |_, ids| ids.is_empty());
                }
                Err(e)
            }
        }
    }

    /// Eligibility check, audit append and insert for a new trial.
    ///
    /// Runs under the caller's user-index guard.
    fn admit(
        &self,
        ctx: &AuditContext,
        policy: &TrialPolicy,
        user_id: &str,
        owned: &[String],
        attribution: Option<&CampaignAttribution>,
    ) -> Result<UserTrial> {
        let prior: Vec<TrialStatus> = owned
            .iter()
            .filter_map(|id| self.trials.get(id).map(|t| t.status))
            .collect();
        check_eligibility(policy, user_id, &prior, attribution)?;

        let now = self.clock.now();
        let id = format!("trial-{:06}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let trial = UserTrial {
            id: id.clone(),
            user_id: user_id.to_string(),
            status: TrialStatus::Active,
            started_at: now,
            expires_at: now + Duration::days(policy.duration_days),
            converted_at: None,
            features_used: std::collections::BTreeSet::new(),
            downgrade_behavior: None,
            campaign: attribution.map(|a| a.campaign.clone()),
            revision: 0,
        };

        self.audit.append(
            AuditDraft::new(AuditAction::TrialStarted)
                .context(ctx)
                .affected_user(user_id)
                .details(serde_json::json!({
                    "trialId": id,
                    "durationDays": policy.duration_days,
                    "eligibility": policy.eligibility,
                    "expiresAt": trial.expires_at,
                    "campaign": trial.campaign,
                })),
        )?;

        self.trials.insert(id, trial.clone());
        Ok(trial)
    }

    /// Add `days` to a trial, reactivating it if it had ended.
    ///
    /// From `Active` the expiry moves out by `days`; from `Expired` or
    /// `Revoked` the trial becomes `Active` again with `expires_at = now + days`.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if `days` is not in `1..=max_extension_days`
    /// - [`Error::InvalidTransition`] for a converted trial
    /// - [`Error::NotFound`] for an unknown trial
    /// - [`Error::StorageError`] if the audit entry cannot be written
    pub fn extend_trial(&self, ctx: &AuditContext, trial_id: &str, days: i64) -> Result<UserTrial> {
        if !(1..=self.settings.max_extension_days).contains(&days) {
            return Err(Error::Validation(format!(
                "extension must be between 1 and {} days, got {days}",
                self.settings.max_extension_days
            )));
        }

        self.transition(trial_id, |trial, now| {
            let mut next = trial.clone();
            match trial.status {
                TrialStatus::Active => next.expires_at = trial.expires_at + Duration::days(days),
                TrialStatus::Expired | TrialStatus::Revoked => {
                    next.status = TrialStatus::Active;
                    next.expires_at = now + Duration::days(days);
                    next.downgrade_behavior = None;
                }
                TrialStatus::Converted => {
                    return Err(Error::transition(trial_id, trial.status, TrialStatus::Active));
                }
            }

            let draft = AuditDraft::new(AuditAction::TrialExtended)
                .context(ctx)
                .affected_user(&trial.user_id)
                .details(serde_json::json!({
                    "trialId": trial.id,
                    "days": days,
                    "previousStatus": trial.status,
                    "expiresAt": next.expires_at,
                }));
            Ok(Some((next, draft)))
        })
        .map(|(trial, _)| trial)
    }

    /// Restart an expired or revoked trial for a full policy duration.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidTransition`] unless the trial is `Expired` or `Revoked`
    /// - [`Error::NotFound`] for an unknown trial or unseeded policy
    /// - [`Error::StorageError`] if the audit entry cannot be written
    pub fn reactivate_trial(&self, ctx: &AuditContext, trial_id: &str) -> Result<UserTrial> {
        let policy = self.policy.get_current()?;

        self.transition(trial_id, |trial, now| {
            if !matches!(trial.status, TrialStatus::Expired | TrialStatus::Revoked) {
                return Err(Error::transition(trial_id, trial.status, TrialStatus::Active));
            }

            let mut next = trial.clone();
            next.status = TrialStatus::Active;
            next.expires_at = now + Duration::days(policy.duration_days);
            next.downgrade_behavior = None;

            let draft = AuditDraft::new(AuditAction::TrialReactivated)
                .context(ctx)
                .affected_user(&trial.user_id)
                .details(serde_json::json!({
                    "trialId": trial.id,
                    "previousStatus": trial.status,
                    "durationDays": policy.duration_days,
                    "expiresAt": next.expires_at,
                }));
            Ok(Some((next, draft)))
        })
        .map(|(trial, _)| trial)
    }

    /// Mark a trial as converted to Pro.
    ///
    /// Converting an already converted trial succeeds without writing
    /// anything, so billing callbacks can retry safely. `receipt` metadata
    /// is echoed into the audit entry.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidTransition`] from `Revoked`, or from `Expired` unless
    ///   late conversion is enabled
    /// - [`Error::NotFound`] for an unknown trial
    /// - [`Error::StorageError`] if the audit entry cannot be written
    pub fn convert_to_pro(
        &self,
        ctx: &AuditContext,
        trial_id: &str,
        receipt: Option<serde_json::Value>,
    ) -> Result<UserTrial> {
        let allow_late = self.settings.allow_late_conversion;

        self.transition(trial_id, |trial, now| {
            match trial.status {
                TrialStatus::Converted => return Ok(None),
                TrialStatus::Active => {}
                TrialStatus::Expired if allow_late => {}
                TrialStatus::Expired | TrialStatus::Revoked => {
                    return Err(Error::transition(trial_id, trial.status, TrialStatus::Converted));
                }
            }

            let mut next = trial.clone();
            next.status = TrialStatus::Converted;
            next.converted_at = Some(now);
            next.downgrade_behavior = None;

            let draft = AuditDraft::new(AuditAction::UserConverted)
                .context(ctx)
                .affected_user(&trial.user_id)
                .details(serde_json::json!({
                    "trialId": trial.id,
                    "previousStatus": trial.status,
                    "featuresUsed": trial.features_used,
                    "receipt": receipt,
                }));
            Ok(Some((next, draft)))
        })
        .map(|(trial, _)| trial)
    }

    /// Revoke a trial or a conversion.
    ///
    /// The downgrade UX comes from the policy current at revoke time.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidTransition`] unless the trial is `Active` or `Converted`
    /// - [`Error::NotFound`] for an unknown trial or unseeded policy
    /// - [`Error::StorageError`] if the audit entry cannot be written
    pub fn revoke_trial(&self, ctx: &AuditContext, trial_id: &str) -> Result<UserTrial> {
        let policy = self.policy.get_current()?;

        self.transition(trial_id, |trial, _| {
            if !matches!(trial.status, TrialStatus::Active | TrialStatus::Converted) {
                return Err(Error::transition(trial_id, trial.status, TrialStatus::Revoked));
            }

            let mut next = trial.clone();
            next.status = TrialStatus::Revoked;
            next.downgrade_behavior = Some(policy.downgrade_behavior);

            let draft = AuditDraft::new(AuditAction::TrialRevoked)
                .context(ctx)
                .affected_user(&trial.user_id)
                .details(serde_json::json!({
                    "trialId": trial.id,
                    "previousStatus": trial.status,
                    "downgradeBehavior": policy.downgrade_behavior,
                }));
            Ok(Some((next, draft)))
        })
        .map(|(trial, _)| trial)
    }

    /// Expire every active trial whose `expires_at` has passed.
    pub fn sweep_expirations(&self) -> SweepReport {
        self.sweep_expirations_with(&CancelFlag::new())
    }

    /// Cancellable sweep.
    ///
    /// Checks `cancel` before each trial; trials already expired stay
    /// expired. Per-trial failures are logged and counted, never abort the
    /// sweep. A trial moved by someone else since the scan is skipped.
    pub fn sweep_expirations_with(&self, cancel: &CancelFlag) -> SweepReport {
        let now = self.clock.now();
        let due: Vec<String> = self
            .trials
            .iter()
            .filter(|t| t.status == TrialStatus::Active && t.expires_at <= now)
            .map(|t| t.id.clone())
            .collect();

        let mut report = SweepReport::default();
        for trial_id in due {
            if cancel.is_cancelled() {
                report.cancelled = true;
                tracing::info!(expired = report.expired, "sweep cancelled");
                break;
            }
            match self.expire_one(&trial_id) {
                Ok(true) => report.expired += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(trial_id = %trial_id, error = %e, "failed to expire trial");
                }
            }
        }

        tracing::info!(
            expired = report.expired,
            failed = report.failed,
            "expiration sweep finished"
        );
        report
    }

    fn expire_one(&self, trial_id: &str) -> Result<bool> {
        let behavior = self.policy.get_current()?.downgrade_behavior;

        self.transition(trial_id, |trial, now| {
            if trial.status != TrialStatus::Active || trial.expires_at > now {
                return Ok(None);
            }

            let mut next = trial.clone();
            next.status = TrialStatus::Expired;
            next.downgrade_behavior = Some(behavior);

            let action = match behavior {
                DowngradeBehavior::Automatic => AuditAction::TrialDowngraded,
                DowngradeBehavior::SoftPrompt => AuditAction::TrialDowngradePrompted,
                DowngradeBehavior::HardBlock => AuditAction::TrialBlocked,
            };
            let draft = AuditDraft::new(action)
                .context(&AuditContext::system())
                .affected_user(&trial.user_id)
                .details(serde_json::json!({
                    "trialId": trial.id,
                    "expiresAt": trial.expires_at,
                    "downgradeBehavior": behavior,
                    "featuresUsed": trial.features_used,
                }));
            Ok(Some((next, draft)))
        })
        .map(|(_, changed)| changed)
    }

    /// Note that a premium feature was used. Not audited.
    ///
    /// Returns `true` the first time a feature is recorded.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidTransition`] unless the trial is `Active`
    /// - [`Error::NotFound`] for an unknown trial
    pub fn record_feature_usage(&self, trial_id: &str, feature: &str) -> Result<bool> {
        let mut trial = self
            .trials
            .get_mut(trial_id)
            .ok_or_else(|| Error::not_found("trial", trial_id))?;
        if trial.status != TrialStatus::Active {
            return Err(Error::InvalidTransition {
                entity: trial_id.to_string(),
                from: format!("{:?}", trial.status),
                to: "feature usage".to_string(),
            });
        }
        Ok(trial.features_used.insert(feature.to_string()))
    }

    /// Look up one trial.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown trial.
    pub fn get(&self, trial_id: &str) -> Result<UserTrial> {
        self.trials
            .get(trial_id)
            .map(|t| t.clone())
            .ok_or_else(|| Error::not_found("trial", trial_id))
    }

    /// Every trial of one user, oldest first.
    #[must_use]
    pub fn trials_for_user(&self, user_id: &str) -> Vec<UserTrial> {
        let ids = self
            .by_user
            .get(user_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        let mut trials: Vec<UserTrial> = ids
            .iter()
            .filter_map(|id| self.trials.get(id).map(|t| t.clone()))
            .collect();
        trials.sort_by_key(|t| (t.started_at, t.id.clone()));
        trials
    }

    /// All trials, optionally restricted to one status, ordered by id.
    #[must_use]
    pub fn list(&self, status: Option<TrialStatus>) -> Vec<UserTrial> {
        let mut trials: Vec<UserTrial> = self
            .trials
            .iter()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .map(|t| t.clone())
            .collect();
        trials.sort_by(|a, b| a.id.cmp(&b.id));
        trials
    }

    /// Counts per status.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> TrialStats {
        let mut stats = TrialStats::default();
        for trial in self.trials.iter() {
            match trial.status {
                TrialStatus::Active => stats.active += 1,
                TrialStatus::Converted => stats.converted += 1,
                TrialStatus::Expired => stats.expired += 1,
                TrialStatus::Revoked => stats.revoked += 1,
            }
        }
        let total = stats.total();
        if total > 0 {
            stats.conversion_rate = stats.converted as f64 / total as f64;
        }
        stats
    }

    /// What the client should unlock for `user_id` right now.
    ///
    /// Active trials past their expiry (sweep not yet run) already count
    /// as downgraded.
    #[must_use]
    pub fn entitlement(&self, user_id: &str) -> Entitlement {
        let trials = self.trials_for_user(user_id);
        let policy = self.policy.get_current().ok();
        let now = self.clock.now();
        let fallback = policy
            .as_ref()
            .map_or(DowngradeBehavior::Automatic, |p| p.downgrade_behavior);

        if trials.iter().any(|t| t.status == TrialStatus::Converted) {
            return Entitlement::Pro;
        }
        if let Some(active) = trials.iter().find(|t| t.status == TrialStatus::Active) {
            if active.expires_at > now {
                let paywall_due = policy.as_ref().is_some_and(|p| {
                    now >= active.started_at + Duration::days(p.paywall_after_days)
                });
                return Entitlement::Trial {
                    expires_at: active.expires_at,
                    paywall_due,
                };
            }
            return Entitlement::Downgraded { behavior: fallback };
        }
        trials.last().map_or(Entitlement::None, |last| Entitlement::Downgraded {
            behavior: last.downgrade_behavior.unwrap_or(fallback),
        })
    }

    /// Run one transactional unit on a trial.
    ///
    /// The entry guard is held across compute, audit append and install.
    /// Returns the resulting trial and whether anything changed.
    fn transition<F>(&self, trial_id: &str, step: F) -> Result<(UserTrial, bool)>
    where
        F: FnOnce(&UserTrial, DateTime<Utc>) -> Result<Step>,
    {
        let mut slot = self
            .trials
            .get_mut(trial_id)
            .ok_or_else(|| Error::not_found("trial", trial_id))?;
        let now = self.clock.now();

        let Some((mut next, draft)) = step(slot.value(), now)? else {
            return Ok((slot.value().clone(), false));
        };
        next.revision = slot.revision + 1;

        let entry = self.audit.append(draft)?;
        tracing::info!(
            trial_id,
            from = ?slot.status,
            to = ?next.status,
            audit_id = entry.id(),
            "trial transition"
        );
        *slot = next.clone();
        Ok((next, true))
    }
}

fn check_eligibility(
    policy: &TrialPolicy,
    user_id: &str,
    prior: &[TrialStatus],
    attribution: Option<&CampaignAttribution>,
) -> Result<()> {
    let deny = |reason: &str| Error::NotEligible {
        user_id: user_id.to_string(),
        reason: reason.to_string(),
    };

    if !policy.enabled {
        return Err(deny("trials are disabled"));
    }
    if prior.contains(&TrialStatus::Active) {
        return Err(deny("user already has an active trial"));
    }
    match policy.eligibility {
        Eligibility::NewUsers if !prior.is_empty() => Err(deny("trial already used")),
        Eligibility::ReturningUsers if prior.is_empty() => {
            Err(deny("only returning users may start a trial"))
        }
        Eligibility::CampaignBased
            if attribution.map_or(true, |a| a.campaign.trim().is_empty()) =>
        {
            Err(deny("no campaign attribution"))
        }
        _ => Ok(()),
    }
}
