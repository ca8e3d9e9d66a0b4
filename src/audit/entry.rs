//! Audit Entry - immutable record of one compliance-relevant change

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse grouping used by the admin console filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    /// Trial lifecycle transitions
    Trial,
    /// Policy and message content changes
    Config,
    /// User-level events (conversion)
    User,
    /// Experiment lifecycle transitions
    Experiment,
    /// Anything else
    Other,
}

impl AuditCategory {
    /// Derive a category from an action tag prefix.
    ///
    /// Only used for [`AuditAction::Custom`]; known actions map through
    /// [`AuditAction::category`].
    #[must_use]
    pub fn from_prefix(tag: &str) -> Self {
        if tag.starts_with("trial_") {
            Self::Trial
        } else if tag.starts_with("config_") || tag.starts_with("message_") {
            Self::Config
        } else if tag.starts_with("user_") {
            Self::User
        } else if tag.starts_with("experiment_") {
            Self::Experiment
        } else {
            Self::Other
        }
    }
}

/// Closed set of audited actions.
///
/// Serialized as its string tag (`trial_extended`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum AuditAction {
    /// New policy version written
    ConfigUpdated,
    /// Regional message template written (messaging registry)
    MessageUpdated,
    /// Trial created
    TrialStarted,
    /// Trial expiry pushed out, possibly reactivating it
    TrialExtended,
    /// Expired or revoked trial restarted with a fresh duration
    TrialReactivated,
    /// Trial revoked by an operator
    TrialRevoked,
    /// Sweep expired a trial under automatic downgrade
    TrialDowngraded,
    /// Sweep expired a trial under soft-prompt downgrade
    TrialDowngradePrompted,
    /// Sweep expired a trial under hard-block downgrade
    TrialBlocked,
    /// Trial converted to a paid Pro subscription
    UserConverted,
    /// Experiment moved out of draft
    ExperimentStarted,
    /// Experiment concluded
    ExperimentConcluded,
    /// Tag outside the known table (written by external collaborators)
    Custom(String),
}

static ACTION_TABLE: &[(AuditAction, &str, AuditCategory)] = &[
    (AuditAction::ConfigUpdated, "config_updated", AuditCategory::Config),
    (AuditAction::MessageUpdated, "message_updated", AuditCategory::Config),
    (AuditAction::TrialStarted, "trial_started", AuditCategory::Trial),
    (AuditAction::TrialExtended, "trial_extended", AuditCategory::Trial),
    (AuditAction::TrialReactivated, "trial_reactivated", AuditCategory::Trial),
    (AuditAction::TrialRevoked, "trial_revoked", AuditCategory::Trial),
    (AuditAction::TrialDowngraded, "trial_downgraded", AuditCategory::Trial),
    (
        AuditAction::TrialDowngradePrompted,
        "trial_downgrade_prompted",
        AuditCategory::Trial,
    ),
    (AuditAction::TrialBlocked, "trial_blocked", AuditCategory::Trial),
    (AuditAction::UserConverted, "user_converted", AuditCategory::User),
    (
        AuditAction::ExperimentStarted,
        "experiment_started",
        AuditCategory::Experiment,
    ),
    (
        AuditAction::ExperimentConcluded,
        "experiment_concluded",
        AuditCategory::Experiment,
    ),
];

impl AuditAction {
    /// Parse a tag; unknown tags become [`AuditAction::Custom`].
    #[must_use]
    pub fn parse(tag: &str) -> Self {
        ACTION_TABLE
            .iter()
            .find(|(_, known, _)| *known == tag)
            .map_or_else(|| Self::Custom(tag.to_string()), |(action, _, _)| action.clone())
    }

    /// The wire tag.
    #[must_use]
    pub fn tag(&self) -> &str {
        match self {
            Self::Custom(tag) => tag,
            known => ACTION_TABLE
                .iter()
                .find(|(action, _, _)| action == known)
                .map_or("", |(_, tag, _)| *tag),
        }
    }

    /// Category of this action.
    #[must_use]
    pub fn category(&self) -> AuditCategory {
        match self {
            Self::Custom(tag) => AuditCategory::from_prefix(tag),
            known => ACTION_TABLE
                .iter()
                .find(|(action, _, _)| action == known)
                .map_or(AuditCategory::Other, |(_, _, category)| *category),
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl From<String> for AuditAction {
    fn from(tag: String) -> Self {
        Self::parse(&tag)
    }
}

impl From<AuditAction> for String {
    fn from(action: AuditAction) -> Self {
        action.tag().to_string()
    }
}

/// Who performed a mutation, echoed into its audit entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditContext {
    /// Operator or system principal
    pub performed_by: Option<String>,
    /// Caller address as seen by the admin API
    pub ip_address: Option<String>,
}

impl AuditContext {
    /// Context for an operator.
    #[must_use]
    pub fn operator(performed_by: impl Into<String>) -> Self {
        Self {
            performed_by: Some(performed_by.into()),
            ip_address: None,
        }
    }

    /// Context for unattended system work (sweeps, billing callbacks).
    #[must_use]
    pub fn system() -> Self {
        Self::operator("system")
    }

    /// Attach the caller's address.
    #[must_use]
    pub fn with_ip(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }
}

/// An audit entry before the log assigns its id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditDraft {
    pub(crate) action: AuditAction,
    pub(crate) performed_by: Option<String>,
    pub(crate) affected_user_id: Option<String>,
    pub(crate) details: serde_json::Value,
    pub(crate) ip_address: Option<String>,
}

impl AuditDraft {
    /// Start a draft for `action` with empty details.
    #[must_use]
    pub fn new(action: AuditAction) -> Self {
        Self {
            action,
            performed_by: None,
            affected_user_id: None,
            details: serde_json::Value::Object(serde_json::Map::new()),
            ip_address: None,
        }
    }

    /// Copy actor and address from a context.
    #[must_use]
    pub fn context(mut self, ctx: &AuditContext) -> Self {
        self.performed_by.clone_from(&ctx.performed_by);
        self.ip_address.clone_from(&ctx.ip_address);
        self
    }

    /// Set the affected user.
    #[must_use]
    pub fn affected_user(mut self, user_id: impl Into<String>) -> Self {
        self.affected_user_id = Some(user_id.into());
        self
    }

    /// Set the structured payload.
    #[must_use]
    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    id: u64,
    action: AuditAction,
    category: AuditCategory,
    performed_by: Option<String>,
    affected_user_id: Option<String>,
    details: serde_json::Value,
    ip_address: Option<String>,
    created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub(crate) fn from_draft(id: u64, created_at: DateTime<Utc>, draft: AuditDraft) -> Self {
        Self {
            id,
            category: draft.action.category(),
            action: draft.action,
            performed_by: draft.performed_by,
            affected_user_id: draft.affected_user_id,
            details: draft.details,
            ip_address: draft.ip_address,
            created_at,
        }
    }

    /// Log-assigned id, increasing in append order.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Action tag.
    #[must_use]
    pub const fn action(&self) -> &AuditAction {
        &self.action
    }

    /// Category derived from the action.
    #[must_use]
    pub const fn category(&self) -> AuditCategory {
        self.category
    }

    /// Actor, if known.
    #[must_use]
    pub fn performed_by(&self) -> Option<&str> {
        self.performed_by.as_deref()
    }

    /// Affected user, if any.
    #[must_use]
    pub fn affected_user_id(&self) -> Option<&str> {
        self.affected_user_id.as_deref()
    }

    /// Structured payload.
    #[must_use]
    pub const fn details(&self) -> &serde_json::Value {
        &self.details
    }

    /// Caller address, if known.
    #[must_use]
    pub fn ip_address(&self) -> Option<&str> {
        self.ip_address.as_deref()
    }

    /// Append timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Position of this entry in the descending query order.
    #[must_use]
    pub const fn cursor(&self) -> AuditCursor {
        AuditCursor {
            created_at: self.created_at,
            id: self.id,
        }
    }
}

/// Resume point for a descending audit query.
///
/// Entries strictly older than the cursor are returned next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AuditCursor {
    created_at: DateTime<Utc>,
    id: u64,
}

/// Query filter; every set field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditFilter {
    /// Only this category
    pub category: Option<AuditCategory>,
    /// Case-insensitive substring over action, actor, affected user and details
    pub search: Option<String>,
    /// Inclusive lower bound on `createdAt`
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `createdAt`
    pub to: Option<DateTime<Utc>>,
    /// Only entries affecting this user
    pub affected_user_id: Option<String>,
}

impl AuditFilter {
    /// Filter matching everything.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to a category.
    #[must_use]
    pub const fn category(mut self, category: AuditCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// Add a free-text search.
    #[must_use]
    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    /// Restrict to `[from, to]`.
    #[must_use]
    pub const fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    /// Restrict to one affected user.
    #[must_use]
    pub fn affected_user(mut self, user_id: impl Into<String>) -> Self {
        self.affected_user_id = Some(user_id.into());
        self
    }

    /// Whether `entry` passes the filter.
    #[must_use]
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        if self.category.is_some_and(|c| c != entry.category) {
            return false;
        }
        if self.from.is_some_and(|from| entry.created_at < from) {
            return false;
        }
        if self.to.is_some_and(|to| entry.created_at > to) {
            return false;
        }
        if let Some(user) = &self.affected_user_id {
            if entry.affected_user_id.as_deref() != Some(user.as_str()) {
                return false;
            }
        }
        match &self.search {
            Some(text) if !text.is_empty() => Self::text_matches(entry, &text.to_lowercase()),
            _ => true,
        }
    }

    fn text_matches(entry: &AuditEntry, needle: &str) -> bool {
        let contains = |haystack: &str| haystack.to_lowercase().contains(needle);
        contains(entry.action.tag())
            || entry.performed_by.as_deref().is_some_and(contains)
            || entry.affected_user_id.as_deref().is_some_and(contains)
            || contains(&entry.details.to_string())
    }
}
