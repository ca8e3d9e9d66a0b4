//! Trial Lifecycle (per-user Pro trial state machine)
//!
//! ## State Machine
//!
//! ```text
//! (none) ──start──> Active ──convert──> Converted ──revoke──> Revoked
//!                     │  ╲
//!                     │   ╲──revoke──> Revoked ──extend/reactivate──> Active
//!                     │
//!                     └──sweep──> Expired ──extend/reactivate──> Active
//! ```
//!
//! Trials are never deleted; every transition appends one audit entry in
//! the same unit of work.

mod manager;
mod sweep;

pub use manager::{LifecycleSettings, TrialLifecycleManager};
#[cfg(feature = "tokio")]
pub use sweep::{spawn_sweeper, SweeperHandle};
pub use sweep::{CancelFlag, SweepReport};

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::policy::DowngradeBehavior;

/// Status of a user trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    /// Premium features granted until `expires_at`
    Active,
    /// User bought Pro
    Converted,
    /// Trial lapsed without conversion
    Expired,
    /// Operator withdrew the trial
    Revoked,
}

/// Campaign attribution supplied by the caller of `start_trial`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignAttribution {
    /// Campaign identifier, e.g. `spring-promo`
    pub campaign: String,
}

impl CampaignAttribution {
    /// Attribution for `campaign`.
    #[must_use]
    pub fn new(campaign: impl Into<String>) -> Self {
        Self {
            campaign: campaign.into(),
        }
    }
}

/// One user's trial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTrial {
    pub(crate) id: String,
    pub(crate) user_id: String,
    pub(crate) status: TrialStatus,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) expires_at: DateTime<Utc>,
    pub(crate) converted_at: Option<DateTime<Utc>>,
    pub(crate) features_used: BTreeSet<String>,
    pub(crate) downgrade_behavior: Option<DowngradeBehavior>,
    pub(crate) campaign: Option<String>,
    pub(crate) revision: u64,
}

impl UserTrial {
    /// Trial id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Owning user.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> TrialStatus {
        self.status
    }

    /// When the trial was created.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// When premium access ends (or ended).
    #[must_use]
    pub const fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Conversion time, once converted.
    #[must_use]
    pub const fn converted_at(&self) -> Option<DateTime<Utc>> {
        self.converted_at
    }

    /// Premium features touched during the trial.
    #[must_use]
    pub const fn features_used(&self) -> &BTreeSet<String> {
        &self.features_used
    }

    /// Downgrade UX applied when the trial expired or was revoked.
    #[must_use]
    pub const fn downgrade_behavior(&self) -> Option<DowngradeBehavior> {
        self.downgrade_behavior
    }

    /// Campaign the trial was started under, if any.
    #[must_use]
    pub fn campaign(&self) -> Option<&str> {
        self.campaign.as_deref()
    }

    /// Number of audited transitions applied since creation.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }
}

/// What the client should unlock for a user right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Entitlement {
    /// Paid Pro subscriber
    Pro,
    /// Inside an active trial
    Trial {
        /// End of premium access
        expires_at: DateTime<Utc>,
        /// Whether the paywall should already be shown
        paywall_due: bool,
    },
    /// Trial ended; apply this downgrade UX
    Downgraded {
        /// Downgrade UX to apply
        behavior: DowngradeBehavior,
    },
    /// Never had a trial
    None,
}

/// Aggregate counts for the admin dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialStats {
    /// Active trials
    pub active: usize,
    /// Converted trials
    pub converted: usize,
    /// Expired trials
    pub expired: usize,
    /// Revoked trials
    pub revoked: usize,
    /// `converted / total`, 0 when there are no trials
    pub conversion_rate: f64,
}

impl TrialStats {
    /// Total number of trials.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.active + self.converted + self.expired + self.revoked
    }
}
