//! Service configuration
//!
//! Loaded from JSON; every key is optional and falls back to its default.
//!
//! ```json
//! {
//!   "defaultPolicy": { "enabled": true, "durationDays": 14, "eligibility": "all_users",
//!                      "downgradeBehavior": "hard_block", "paywallAfterDays": 7,
//!                      "softDowngradeEnabled": false },
//!   "significanceThreshold": 99.0,
//!   "sweepIntervalSecs": 60
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audit::DEFAULT_PAGE_SIZE;
use crate::experiment::significance::DEFAULT_THRESHOLD;
use crate::policy::TrialPolicy;
use crate::trial::LifecycleSettings;
use crate::{Error, Result};

/// Top-level service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    /// Policy seeded at startup
    pub default_policy: TrialPolicy,
    /// Significance required to declare a winner, in (0, 100]
    pub significance_threshold: f64,
    /// Seconds between background expiration sweeps
    pub sweep_interval_secs: u64,
    /// Largest number of days one extension may add
    pub max_extension_days: i64,
    /// Allow converting an expired trial without extending it first
    pub allow_late_conversion: bool,
    /// Entries fetched per page by lazy audit queries
    pub audit_page_size: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_policy: TrialPolicy::default(),
            significance_threshold: DEFAULT_THRESHOLD,
            sweep_interval_secs: 300,
            max_extension_days: 90,
            allow_late_conversion: false,
            audit_page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ServiceConfig {
    /// Parse and validate JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for malformed JSON or out-of-range values.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| Error::Config(format!("invalid JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read, otherwise as
    /// [`ServiceConfig::from_json_str`].
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Check every value is in range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        self.default_policy
            .validate()
            .map_err(|e| Error::Config(format!("defaultPolicy: {e}")))?;
        if !(self.significance_threshold > 0.0 && self.significance_threshold <= 100.0) {
            return Err(Error::Config(format!(
                "significanceThreshold must be in (0, 100], got {}",
                self.significance_threshold
            )));
        }
        if self.sweep_interval_secs == 0 {
            return Err(Error::Config("sweepIntervalSecs must be positive".to_string()));
        }
        if self.max_extension_days < 1 {
            return Err(Error::Config(format!(
                "maxExtensionDays must be at least 1, got {}",
                self.max_extension_days
            )));
        }
        if self.audit_page_size == 0 {
            return Err(Error::Config("auditPageSize must be positive".to_string()));
        }
        Ok(())
    }

    /// Sweep period as a [`Duration`].
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Lifecycle knobs for the trial manager.
    #[must_use]
    pub const fn lifecycle(&self) -> LifecycleSettings {
        LifecycleSettings {
            max_extension_days: self.max_extension_days,
            allow_late_conversion: self.allow_late_conversion,
        }
    }
}
