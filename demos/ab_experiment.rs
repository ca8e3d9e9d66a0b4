//! A/B Experiment: trial length test with a significance readout
//!
//! Simulates traffic for a 7-day vs 14-day trial experiment and prints
//! the z-test result as counts come in.
//!
//! Run with: cargo run --example ab_experiment

use anyhow::Result;
use protrial::audit::{AuditCategory, AuditContext, AuditFilter};
use protrial::experiment::{ExperimentDraft, ExperimentStatus, Metric, Variant, VariantKey};
use protrial::TrialService;

/// Conversion rate per arm, in percent
const RATE_A: u64 = 20;
const RATE_B: u64 = 32;

fn main() -> Result<()> {
    protrial::logging::init();

    println!("=== A/B Experiment: Trial Length ===\n");

    let service = TrialService::builder().build()?;
    let growth = AuditContext::operator("growth@studio");
    let engine = service.experiments();

    let control = Variant::from_policy("7-day", &service.policy().get_current()?)?;
    let treatment = Variant::new("14-day", serde_json::json!({"durationDays": 14}));
    let experiment = engine.create(
        ExperimentDraft::new("trial-length", control, treatment)
            .hypothesis("A 14-day trial lifts conversion")
            .metric(Metric::ConversionRate),
    )?;
    engine.update_status(&growth, experiment.id(), ExperimentStatus::Running)?;
    println!("Started {} ({})\n", experiment.id(), experiment.name());

    println!("{:>8} {:>8} {:>8} {:>12} {:>8}", "players", "rate A", "rate B", "significance", "winner");
    for batch in 1..=6u64 {
        for i in 0..50u64 {
            for (key, rate) in [(VariantKey::A, RATE_A), (VariantKey::B, RATE_B)] {
                engine.record_participant(experiment.id(), key)?;
                // deterministic traffic: `rate` conversions per 100 players
                if (batch * 50 + i) % 100 < rate {
                    engine.record_conversion(experiment.id(), key)?;
                }
            }
        }
        let results = engine.results(experiment.id())?;
        println!(
            "{:>8} {:>7.1}% {:>7.1}% {:>11.1}% {:>8}",
            batch * 50,
            results.rate_a * 100.0,
            results.rate_b * 100.0,
            results.significance,
            results.winner.map_or("-".to_string(), |w| format!("{w:?}")),
        );
    }

    let concluded = engine.update_status(&growth, experiment.id(), ExperimentStatus::Concluded)?;
    println!(
        "\nConcluded with significance {:.1}% (threshold {:.0}%)",
        concluded.significance(),
        engine.threshold()
    );

    let trail = service
        .audit()
        .collect(&AuditFilter::all().category(AuditCategory::Experiment))?;
    println!("Experiment audit entries: {}", trail.len());

    Ok(())
}
