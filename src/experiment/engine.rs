//! Experiment Engine - lifecycle, traffic counters and winner determination

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

use super::{Experiment, ExperimentDraft, ExperimentResults, ExperimentStatus, VariantKey};
use crate::audit::{AuditAction, AuditContext, AuditDraft, AuditLog};
use crate::clock::Clock;
use crate::{Error, Result};

/// Owner of every [`Experiment`].
///
/// ## Design
///
/// Experiments live in a concurrent map keyed by id. Status changes hold
/// the experiment's entry guard across validation, audit append and
/// install, so one experiment's transitions are linearizable while
/// different experiments proceed independently. Traffic counters take the
/// same guard briefly and are never audited.
#[derive(Debug)]
pub struct ExperimentEngine {
    experiments: DashMap<String, Experiment, FxBuildHasher>,
    next_id: AtomicU64,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    threshold: f64,
}

impl ExperimentEngine {
    /// Create an empty engine that declares winners at `threshold` (0-100].
    #[must_use]
    pub fn new(audit: Arc<AuditLog>, clock: Arc<dyn Clock>, threshold: f64) -> Self {
        Self {
            experiments: DashMap::with_hasher(FxBuildHasher),
            next_id: AtomicU64::new(1),
            audit,
            clock,
            threshold,
        }
    }

    /// Significance required to declare a winner.
    #[must_use]
    pub const fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Define a new experiment in `Draft`. Not audited.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an empty name or clashing variant names.
    pub fn create(&self, draft: ExperimentDraft) -> Result<Experiment> {
        draft.validate()?;
        let id = format!("exp-{:04}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let experiment = Experiment::from_draft(id.clone(), draft, self.clock.now());
        self.experiments.insert(id.clone(), experiment.clone());
        tracing::info!(experiment_id = %id, name = %experiment.name, "experiment created");
        Ok(experiment)
    }

    /// Move an experiment through its state machine.
    ///
    /// The first move into `Running` stamps `start_date` and appends
    /// `experiment_started`; concluding freezes a final significance and
    /// appends `experiment_concluded`. Pause and resume are not audited.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidTransition`] for a move the table forbids
    /// - [`Error::NotFound`] for an unknown experiment
    /// - [`Error::StorageError`] if the audit entry cannot be written
    pub fn update_status(
        &self,
        ctx: &AuditContext,
        experiment_id: &str,
        status: ExperimentStatus,
    ) -> Result<Experiment> {
        let mut slot = self
            .experiments
            .get_mut(experiment_id)
            .ok_or_else(|| Error::not_found("experiment", experiment_id))?;
        let current = slot.status;
        if !current.can_transition_to(status) {
            return Err(Error::transition(experiment_id, current, status));
        }

        let now = self.clock.now();
        let mut next = slot.value().clone();
        next.status = status;

        let draft = match status {
            ExperimentStatus::Running if next.start_date.is_none() => {
                next.start_date = Some(now);
                Some(
                    AuditDraft::new(AuditAction::ExperimentStarted)
                        .context(ctx)
                        .details(serde_json::json!({
                            "experimentId": next.id,
                            "name": next.name,
                            "metric": next.metric,
                            "variantA": next.variant_a,
                            "variantB": next.variant_b,
                        })),
                )
            }
            ExperimentStatus::Concluded => {
                let results = next.results(self.threshold);
                next.significance = results.significance;
                next.concluded_at = Some(now);
                Some(
                    AuditDraft::new(AuditAction::ExperimentConcluded)
                        .context(ctx)
                        .details(serde_json::json!({
                            "experimentId": next.id,
                            "name": next.name,
                            "previousStatus": current,
                            "participantsA": next.participants_a,
                            "participantsB": next.participants_b,
                            "conversionsA": next.conversions_a,
                            "conversionsB": next.conversions_b,
                            "results": results,
                        })),
                )
            }
            _ => None,
        };

        if let Some(draft) = draft {
            self.audit.append(draft)?;
        }
        *slot = next.clone();
        tracing::info!(experiment_id, from = ?current, to = ?status, "experiment transition");
        Ok(next)
    }

    /// Count one participant for `variant`. Only while `Running`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidTransition`] unless the experiment is running
    /// - [`Error::NotFound`] for an unknown experiment
    pub fn record_participant(&self, experiment_id: &str, variant: VariantKey) -> Result<()> {
        self.with_running(experiment_id, |experiment| {
            experiment.add_participant(variant);
            Ok(())
        })
    }

    /// Count one conversion for `variant`. Only while `Running`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidTransition`] unless the experiment is running
    /// - [`Error::Validation`] if the arm has no unconverted participant left
    /// - [`Error::NotFound`] for an unknown experiment
    pub fn record_conversion(&self, experiment_id: &str, variant: VariantKey) -> Result<()> {
        self.with_running(experiment_id, |experiment| experiment.add_conversion(variant))
    }

    /// Recompute and store the significance score.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown experiment.
    pub fn compute_significance(&self, experiment_id: &str) -> Result<Experiment> {
        let mut slot = self
            .experiments
            .get_mut(experiment_id)
            .ok_or_else(|| Error::not_found("experiment", experiment_id))?;
        if slot.status != ExperimentStatus::Concluded {
            slot.significance = slot.results(self.threshold).significance;
        }
        Ok(slot.value().clone())
    }

    /// Rates, significance and winner from the live counters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown experiment.
    pub fn results(&self, experiment_id: &str) -> Result<ExperimentResults> {
        self.experiments
            .get(experiment_id)
            .map(|e| e.results(self.threshold))
            .ok_or_else(|| Error::not_found("experiment", experiment_id))
    }

    /// Look up one experiment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown experiment.
    pub fn get(&self, experiment_id: &str) -> Result<Experiment> {
        self.experiments
            .get(experiment_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::not_found("experiment", experiment_id))
    }

    /// All experiments, optionally restricted to one status, ordered by id.
    #[must_use]
    pub fn list(&self, status: Option<ExperimentStatus>) -> Vec<Experiment> {
        let mut experiments: Vec<Experiment> = self
            .experiments
            .iter()
            .filter(|e| status.map_or(true, |s| e.status == s))
            .map(|e| e.value().clone())
            .collect();
        experiments.sort_by(|a, b| a.id.cmp(&b.id));
        experiments
    }

    fn with_running<F>(&self, experiment_id: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut Experiment) -> Result<()>,
    {
        let mut slot = self
            .experiments
            .get_mut(experiment_id)
            .ok_or_else(|| Error::not_found("experiment", experiment_id))?;
        if slot.status != ExperimentStatus::Running {
            return Err(Error::InvalidTransition {
                entity: experiment_id.to_string(),
                from: format!("{:?}", slot.status),
                to: "traffic".to_string(),
            });
        }
        apply(slot.value_mut())
    }
}
