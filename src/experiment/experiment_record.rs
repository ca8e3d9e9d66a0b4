//! Experiment Record - one A/B test and its counters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::significance;
use crate::policy::TrialPolicy;
use crate::{Error, Result};

/// Status of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    /// Defined but not yet live; accepts no traffic.
    Draft,
    /// Live; participants and conversions are counted.
    Running,
    /// Temporarily halted; counters frozen.
    Paused,
    /// Finished; counters frozen for good.
    Concluded,
}

impl ExperimentStatus {
    /// Whether the state machine allows `self -> next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Draft | Self::Paused, Self::Running)
                | (Self::Running, Self::Paused)
                | (Self::Running | Self::Paused, Self::Concluded)
        )
    }
}

/// Metric an experiment optimizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Share of participants who convert
    #[default]
    ConversionRate,
    /// Share of participants who click the offer
    ClickThroughRate,
    /// Share of participants who try a premium feature
    FeatureAdoption,
    /// Share converting within the trial window
    TimeToConvert,
    /// Share producing revenue
    RevenuePerUser,
}

/// One of the two arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariantKey {
    /// Control arm
    A,
    /// Treatment arm
    B,
}

/// A treatment arm: a label and the configuration it applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    /// Display name
    pub name: String,
    /// Arm configuration, opaque to the engine
    pub value: serde_json::Value,
}

impl Variant {
    /// Arm with an arbitrary value.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Arm whose value is a snapshot of `policy`.
    ///
    /// Used to bind the control arm to whatever policy is live when the
    /// experiment is defined. The policy itself is not touched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the policy cannot be serialized.
    pub fn from_policy(name: impl Into<String>, policy: &TrialPolicy) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            value: serde_json::to_value(policy)?,
        })
    }
}

/// Definition handed to `ExperimentEngine::create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentDraft {
    pub(crate) name: String,
    pub(crate) hypothesis: String,
    pub(crate) variant_a: Variant,
    pub(crate) variant_b: Variant,
    pub(crate) metric: Metric,
}

impl ExperimentDraft {
    /// Create a draft with required fields.
    #[must_use]
    pub fn new(name: impl Into<String>, variant_a: Variant, variant_b: Variant) -> Self {
        Self {
            name: name.into(),
            hypothesis: String::new(),
            variant_a,
            variant_b,
            metric: Metric::default(),
        }
    }

    /// Set the hypothesis under test.
    #[must_use]
    pub fn hypothesis(mut self, hypothesis: impl Into<String>) -> Self {
        self.hypothesis = hypothesis.into();
        self
    }

    /// Set the metric.
    #[must_use]
    pub const fn metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("experiment name must not be empty".to_string()));
        }
        if self.variant_a.name.trim().is_empty() || self.variant_b.name.trim().is_empty() {
            return Err(Error::Validation("variant names must not be empty".to_string()));
        }
        if self.variant_a.name == self.variant_b.name {
            return Err(Error::Validation(format!(
                "variants must have distinct names, both are '{}'",
                self.variant_a.name
            )));
        }
        Ok(())
    }
}

/// Derived outcome of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentResults {
    /// conversionsA / participantsA (0 with no participants)
    pub rate_a: f64,
    /// conversionsB / participantsB (0 with no participants)
    pub rate_b: f64,
    /// Relative lift of B over A; `None` when A's rate is 0
    pub lift: Option<f64>,
    /// Confidence score in `[0, 100]`
    pub significance: f64,
    /// Declared winner, only above the significance threshold
    pub winner: Option<VariantKey>,
}

/// A/B experiment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) hypothesis: String,
    pub(crate) status: ExperimentStatus,
    pub(crate) variant_a: Variant,
    pub(crate) variant_b: Variant,
    pub(crate) metric: Metric,
    pub(crate) participants_a: u64,
    pub(crate) participants_b: u64,
    pub(crate) conversions_a: u64,
    pub(crate) conversions_b: u64,
    pub(crate) significance: f64,
    pub(crate) start_date: Option<DateTime<Utc>>,
    pub(crate) concluded_at: Option<DateTime<Utc>>,
    pub(crate) created_at: DateTime<Utc>,
}

impl Experiment {
    pub(crate) fn from_draft(id: String, draft: ExperimentDraft, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            name: draft.name,
            hypothesis: draft.hypothesis,
            status: ExperimentStatus::Draft,
            variant_a: draft.variant_a,
            variant_b: draft.variant_b,
            metric: draft.metric,
            participants_a: 0,
            participants_b: 0,
            conversions_a: 0,
            conversions_b: 0,
            significance: 0.0,
            start_date: None,
            concluded_at: None,
            created_at,
        }
    }

    /// Experiment id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Experiment name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hypothesis under test.
    #[must_use]
    pub fn hypothesis(&self) -> &str {
        &self.hypothesis
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> ExperimentStatus {
        self.status
    }

    /// One of the arms.
    #[must_use]
    pub const fn variant(&self, key: VariantKey) -> &Variant {
        match key {
            VariantKey::A => &self.variant_a,
            VariantKey::B => &self.variant_b,
        }
    }

    /// Metric under test.
    #[must_use]
    pub const fn metric(&self) -> Metric {
        self.metric
    }

    /// Participants counted for an arm.
    #[must_use]
    pub const fn participants(&self, key: VariantKey) -> u64 {
        match key {
            VariantKey::A => self.participants_a,
            VariantKey::B => self.participants_b,
        }
    }

    /// Conversions counted for an arm.
    #[must_use]
    pub const fn conversions(&self, key: VariantKey) -> u64 {
        match key {
            VariantKey::A => self.conversions_a,
            VariantKey::B => self.conversions_b,
        }
    }

    /// Last computed significance.
    #[must_use]
    pub const fn significance(&self) -> f64 {
        self.significance
    }

    /// First time the experiment went live.
    #[must_use]
    pub const fn start_date(&self) -> Option<DateTime<Utc>> {
        self.start_date
    }

    /// When the experiment was concluded.
    #[must_use]
    pub const fn concluded_at(&self) -> Option<DateTime<Utc>> {
        self.concluded_at
    }

    /// Creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Rates, significance and winner from the current counters.
    #[must_use]
    pub fn results(&self, threshold: f64) -> ExperimentResults {
        let rate_a = significance::rate(self.conversions_a, self.participants_a);
        let rate_b = significance::rate(self.conversions_b, self.participants_b);
        let score = significance::significance(
            self.participants_a,
            self.conversions_a,
            self.participants_b,
            self.conversions_b,
        );
        ExperimentResults {
            rate_a,
            rate_b,
            lift: (rate_a > 0.0).then(|| (rate_b - rate_a) / rate_a),
            significance: score,
            winner: significance::winner(rate_a, rate_b, score, threshold),
        }
    }

    pub(crate) fn add_participant(&mut self, key: VariantKey) {
        match key {
            VariantKey::A => self.participants_a += 1,
            VariantKey::B => self.participants_b += 1,
        }
    }

    pub(crate) fn add_conversion(&mut self, key: VariantKey) -> Result<()> {
        if self.conversions(key) >= self.participants(key) {
            return Err(Error::Validation(format!(
                "variant {key:?} of {} has {} participants and cannot take another conversion",
                self.id,
                self.participants(key)
            )));
        }
        match key {
            VariantKey::A => self.conversions_a += 1,
            VariantKey::B => self.conversions_b += 1,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> ExperimentDraft {
        ExperimentDraft::new(
            "trial-length",
            Variant::new("7 days", 7),
            Variant::new("14 days", 14),
        )
    }

    #[test]
    fn test_transition_table() {
        use ExperimentStatus::{Concluded, Draft, Paused, Running};
        assert!(Draft.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Running.can_transition_to(Concluded));
        assert!(Paused.can_transition_to(Concluded));

        assert!(!Draft.can_transition_to(Paused));
        assert!(!Draft.can_transition_to(Concluded));
        assert!(!Concluded.can_transition_to(Running));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn test_draft_validation() {
        draft().validate().unwrap();
        let same = ExperimentDraft::new("x", Variant::new("a", 1), Variant::new("a", 2));
        assert!(same.validate().is_err());
        let unnamed = ExperimentDraft::new(" ", Variant::new("a", 1), Variant::new("b", 2));
        assert!(unnamed.validate().is_err());
    }

    #[test]
    fn test_conversion_needs_participant() {
        let mut experiment = Experiment::from_draft("exp-1".into(), draft(), Utc::now());
        assert!(experiment.add_conversion(VariantKey::A).is_err());
        experiment.add_participant(VariantKey::A);
        experiment.add_conversion(VariantKey::A).unwrap();
        assert_eq!(experiment.conversions(VariantKey::A), 1);
    }

    #[test]
    fn test_variant_from_policy_snapshot() {
        let variant = Variant::from_policy("control", &TrialPolicy::default()).unwrap();
        assert_eq!(variant.value["durationDays"], serde_json::json!(7));
    }
}
