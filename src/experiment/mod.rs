//! A/B Experimentation Engine
//!
//! This module defines experiments that tune the trial offer, counts
//! participants and conversions per arm, and decides winners with a
//! two-proportion z-test.
//!
//! ## State Machine
//!
//! ```text
//! Draft ──> Running <──> Paused
//!              │            │
//!              └──> Concluded <┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use protrial::audit::{AuditContext, AuditLog};
//! use protrial::clock::SystemClock;
//! use protrial::experiment::{
//!     ExperimentDraft, ExperimentEngine, ExperimentStatus, Variant, VariantKey,
//! };
//!
//! let clock = Arc::new(SystemClock);
//! let audit = Arc::new(AuditLog::in_memory(clock.clone()));
//! let engine = ExperimentEngine::new(audit, clock, 95.0);
//!
//! let draft = ExperimentDraft::new("trial-length", Variant::new("7d", 7), Variant::new("14d", 14));
//! let experiment = engine.create(draft)?;
//! engine.update_status(&AuditContext::operator("growth"), experiment.id(), ExperimentStatus::Running)?;
//!
//! engine.record_participant(experiment.id(), VariantKey::B)?;
//! engine.record_conversion(experiment.id(), VariantKey::B)?;
//!
//! let results = engine.results(experiment.id())?;
//! assert!(results.winner.is_none());
//! # Ok::<(), protrial::Error>(())
//! ```

mod engine;
mod experiment_record;
pub mod significance;

pub use engine::ExperimentEngine;
pub use experiment_record::{
    Experiment, ExperimentDraft, ExperimentResults, ExperimentStatus, Metric, Variant, VariantKey,
};
