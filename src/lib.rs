//! # protrial: Pro-Trial Lifecycle, Experiments and Audit
//!
//! Backend core for a time-boxed "Pro trial" offer in a mobile game:
//!
//! - **Policy**: one global, versioned [`policy::TrialPolicy`]
//! - **Trials**: per-user state machine with eligibility rules and an
//!   expiration sweep ([`trial::TrialLifecycleManager`])
//! - **Experiments**: A/B tests with a two-proportion z-test
//!   ([`experiment::ExperimentEngine`])
//! - **Audit**: append-only log every mutation above writes to
//!   ([`audit::AuditLog`])
//!
//! Every audited mutation and its audit entry form one unit: if the entry
//! cannot be written, the mutation is not applied.
//!
//! ## Example Usage
//!
//! ```rust
//! use protrial::audit::AuditContext;
//! use protrial::TrialService;
//!
//! let service = TrialService::builder().build()?;
//! let ops = AuditContext::operator("ops@studio");
//!
//! let trial = service.trials().start_trial(&ops, "player-1", None)?;
//! service.trials().extend_trial(&ops, trial.id(), 3)?;
//! service.trials().convert_to_pro(&AuditContext::system(), trial.id(), None)?;
//!
//! assert_eq!(service.audit().len()?, 3);
//! # Ok::<(), protrial::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod audit;
pub mod clock;
pub mod config;
pub mod error;
pub mod experiment;
pub mod logging;
pub mod policy;
pub mod trial;

pub use error::{Error, Result};

use std::sync::Arc;

use audit::{AuditLog, AuditSink, MemoryAuditSink};
use clock::{Clock, SystemClock};
use config::ServiceConfig;
use experiment::ExperimentEngine;
use policy::TrialConfigStore;
use trial::TrialLifecycleManager;

/// The wired-up core: policy store, trial manager, experiment engine and
/// the audit log they share.
#[derive(Debug)]
pub struct TrialService {
    config: ServiceConfig,
    audit: Arc<AuditLog>,
    policy: Arc<TrialConfigStore>,
    trials: Arc<TrialLifecycleManager>,
    experiments: Arc<ExperimentEngine>,
}

impl TrialService {
    /// Create a new service builder
    #[must_use]
    pub fn builder() -> TrialServiceBuilder {
        TrialServiceBuilder::default()
    }

    /// Shared audit log
    #[must_use]
    pub const fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Global policy store
    #[must_use]
    pub const fn policy(&self) -> &Arc<TrialConfigStore> {
        &self.policy
    }

    /// Trial lifecycle manager
    #[must_use]
    pub const fn trials(&self) -> &Arc<TrialLifecycleManager> {
        &self.trials
    }

    /// Experiment engine
    #[must_use]
    pub const fn experiments(&self) -> &Arc<ExperimentEngine> {
        &self.experiments
    }

    /// Configuration the service was built with
    #[must_use]
    pub const fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Start the periodic expiration sweep at the configured interval.
    #[cfg(feature = "tokio")]
    #[must_use]
    pub fn spawn_sweeper(&self) -> trial::SweeperHandle {
        trial::spawn_sweeper(Arc::clone(&self.trials), self.config.sweep_interval())
    }
}

/// Service builder
#[derive(Debug, Default)]
pub struct TrialServiceBuilder {
    config: ServiceConfig,
    clock: Option<Arc<dyn Clock>>,
    sink: Option<Arc<dyn AuditSink>>,
}

impl TrialServiceBuilder {
    /// Use this configuration (default: [`ServiceConfig::default`])
    #[must_use]
    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Use this clock (default: [`SystemClock`])
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Store audit entries here (default: [`MemoryAuditSink`])
    #[must_use]
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Build the service and seed the default policy
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid configuration or
    /// [`Error::StorageError`] if the audit sink cannot be read.
    pub fn build(self) -> Result<TrialService> {
        self.config.validate()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(MemoryAuditSink::new()));

        let audit = Arc::new(
            AuditLog::new(sink, Arc::clone(&clock))?.with_page_size(self.config.audit_page_size),
        );
        let policy = Arc::new(TrialConfigStore::new(Arc::clone(&audit), Arc::clone(&clock)));
        policy.seed(self.config.default_policy.clone())?;

        let trials = Arc::new(TrialLifecycleManager::new(
            Arc::clone(&policy),
            Arc::clone(&audit),
            Arc::clone(&clock),
            self.config.lifecycle(),
        ));
        let experiments = Arc::new(ExperimentEngine::new(
            Arc::clone(&audit),
            clock,
            self.config.significance_threshold,
        ));

        tracing::info!(
            threshold = self.config.significance_threshold,
            sweep_secs = self.config.sweep_interval_secs,
            "trial service ready"
        );
        Ok(TrialService {
            config: self.config,
            audit,
            policy,
            trials,
            experiments,
        })
    }
}
