//! Trial Lifecycle: start, extend, sweep, convert, audit
//!
//! Walks one player through a Pro trial under a simulated clock and prints
//! the audit trail an admin would see.
//!
//! Run with: cargo run --example trial_lifecycle

use std::sync::Arc;

use anyhow::Result;
use chrono::Duration;
use protrial::audit::{AuditContext, AuditFilter, ExportFormat};
use protrial::clock::ManualClock;
use protrial::policy::{DowngradeBehavior, PolicyPatch};
use protrial::TrialService;

fn main() -> Result<()> {
    protrial::logging::init();

    println!("=== Pro Trial Lifecycle ===\n");

    let clock = Arc::new(ManualClock::default());
    let service = TrialService::builder().clock(clock.clone()).build()?;
    let ops = AuditContext::operator("ops@studio").with_ip("203.0.113.5");

    let policy = service.policy().get_current()?;
    println!("Current policy (v1):");
    println!("  Duration: {} days", policy.duration_days);
    println!("  Eligibility: {:?}", policy.eligibility);
    println!("  Downgrade: {:?}\n", policy.downgrade_behavior);

    println!("=== Step 1: Ops switches to hard block ===");
    let updated = service.policy().update(
        &ops,
        PolicyPatch::default()
            .downgrade_behavior(DowngradeBehavior::HardBlock)
            .expect_version(1),
    )?;
    println!("  Downgrade now: {:?}\n", updated.downgrade_behavior);

    println!("=== Step 2: Two players start trials ===");
    let alice = service.trials().start_trial(&ops, "alice", None)?;
    let bob = service.trials().start_trial(&ops, "bob", None)?;
    println!("  {} -> expires {}", alice.id(), alice.expires_at());
    println!("  {} -> expires {}\n", bob.id(), bob.expires_at());

    println!("=== Step 3: Alice plays, ops extends her trial ===");
    service.trials().record_feature_usage(alice.id(), "cloud_saves")?;
    service.trials().record_feature_usage(alice.id(), "replay_editor")?;
    let alice = service.trials().extend_trial(&ops, alice.id(), 3)?;
    println!("  {} now expires {}\n", alice.id(), alice.expires_at());

    println!("=== Step 4: Eight days pass, sweep runs ===");
    clock.advance(Duration::days(8));
    let report = service.trials().sweep_expirations();
    println!("  Expired: {}  Failed: {}", report.expired, report.failed);
    println!("  Bob's entitlement: {:?}\n", service.trials().entitlement("bob"));

    println!("=== Step 5: Alice buys Pro ===");
    let receipt = serde_json::json!({"store": "app_store", "sku": "pro_monthly"});
    service
        .trials()
        .convert_to_pro(&AuditContext::system(), alice.id(), Some(receipt))?;
    println!("  Alice's entitlement: {:?}", service.trials().entitlement("alice"));
    println!("  Stats: {:?}\n", service.trials().stats());

    println!("=== Audit Trail (newest first) ===");
    for entry in service.audit().query(&AuditFilter::all()) {
        let entry = entry?;
        println!(
            "  #{:<3} {:<26} by {:<14} user {}",
            entry.id(),
            entry.action(),
            entry.performed_by().unwrap_or("-"),
            entry.affected_user_id().unwrap_or("-"),
        );
    }

    let export = service
        .audit()
        .export(&AuditFilter::all().affected_user("alice"), ExportFormat::JsonLines)?;
    println!("\nAlice's export: {} bytes of JSON lines", export.len());

    Ok(())
}
