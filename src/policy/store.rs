//! Trial Config Store - single current policy plus immutable history

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{PolicyPatch, TrialPolicy};
use crate::audit::{AuditAction, AuditContext, AuditDraft, AuditLog};
use crate::clock::Clock;
use crate::{Error, Result};

/// One immutable policy version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyVersion {
    version: u64,
    policy: TrialPolicy,
    created_at: DateTime<Utc>,
    created_by: Option<String>,
}

impl PolicyVersion {
    /// Version number, starting at 1.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// The policy as written.
    #[must_use]
    pub const fn policy(&self) -> &TrialPolicy {
        &self.policy
    }

    /// When this version was written.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Who wrote this version, if known.
    #[must_use]
    pub fn created_by(&self) -> Option<&str> {
        self.created_by.as_deref()
    }
}

/// Holder of the global trial policy.
///
/// ## Design
///
/// History is an append-only vector; the last element is the current
/// version. Updates take the write lock for validation, audit append and
/// version push, so concurrent writers are serialized and readers never
/// observe a version whose audit entry does not exist.
#[derive(Debug)]
pub struct TrialConfigStore {
    history: RwLock<Vec<PolicyVersion>>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl TrialConfigStore {
    /// Create an unseeded store.
    #[must_use]
    pub fn new(audit: Arc<AuditLog>, clock: Arc<dyn Clock>) -> Self {
        Self {
            history: RwLock::new(Vec::new()),
            audit,
            clock,
        }
    }

    /// Install the startup policy as version 1.
    ///
    /// No-op when the store already holds a policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `policy` is out of range.
    pub fn seed(&self, policy: TrialPolicy) -> Result<PolicyVersion> {
        policy.validate()?;
        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = history.last() {
            return Ok(current.clone());
        }

        let version = PolicyVersion {
            version: 1,
            policy,
            created_at: self.clock.now(),
            created_by: Some("system".to_string()),
        };
        history.push(version.clone());
        tracing::info!(version = 1, "seeded trial policy");
        Ok(version)
    }

    /// Current policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] before [`TrialConfigStore::seed`].
    pub fn get_current(&self) -> Result<TrialPolicy> {
        self.current_version().map(|v| v.policy)
    }

    /// Current policy with its version metadata.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] before [`TrialConfigStore::seed`].
    pub fn current_version(&self) -> Result<PolicyVersion> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
            .ok_or_else(|| Error::not_found("trial policy", "current"))
    }

    /// Validate and install a new version.
    ///
    /// A patch that changes nothing returns the current policy without
    /// writing a version or an audit entry.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] before seeding
    /// - [`Error::Conflict`] if `expected_version` is stale
    /// - [`Error::Validation`] if the merged policy breaks a range rule
    /// - [`Error::StorageError`] if the audit entry cannot be written
    pub fn update(&self, ctx: &AuditContext, patch: PolicyPatch) -> Result<TrialPolicy> {
        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        let current = history
            .last()
            .ok_or_else(|| Error::not_found("trial policy", "current"))?;

        if let Some(expected) = patch.expected_version {
            if expected != current.version {
                return Err(Error::Conflict {
                    expected,
                    actual: current.version,
                });
            }
        }

        let next = patch.apply(&current.policy);
        next.validate()?;

        let changes = current.policy.diff(&next);
        if changes.is_empty() {
            return Ok(next);
        }

        let version = current.version + 1;
        self.audit.append(
            AuditDraft::new(AuditAction::ConfigUpdated)
                .context(ctx)
                .details(serde_json::json!({
                    "version": version,
                    "previousVersion": current.version,
                    "changes": changes,
                })),
        )?;

        history.push(PolicyVersion {
            version,
            policy: next.clone(),
            created_at: self.clock.now(),
            created_by: ctx.performed_by.clone(),
        });
        tracing::info!(version, "trial policy updated");
        Ok(next)
    }

    /// Every version, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<PolicyVersion> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// A specific version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown version number.
    pub fn version(&self, version: u64) -> Result<PolicyVersion> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|v| v.version == version)
            .cloned()
            .ok_or_else(|| Error::not_found("trial policy version", version.to_string()))
    }
}
