//! Tests for top-level TrialService API

use std::sync::Arc;

use protrial::audit::{AuditContext, JsonlAuditSink};
use protrial::clock::{Clock, ManualClock};
use protrial::config::ServiceConfig;
use protrial::policy::{Eligibility, TrialPolicy};
use protrial::{Error, TrialService};

#[test]
fn test_service_build_defaults() {
    let service = TrialService::builder().build().unwrap();
    assert_eq!(service.policy().get_current().unwrap(), TrialPolicy::default());
    assert_eq!(service.policy().history().len(), 1);
    assert!(service.audit().is_empty().unwrap());
    assert!((service.experiments().threshold() - 95.0).abs() < f64::EPSILON);
}

#[test]
fn test_service_build_with_config() {
    let config = ServiceConfig {
        default_policy: TrialPolicy {
            eligibility: Eligibility::AllUsers,
            ..TrialPolicy::default()
        },
        significance_threshold: 99.0,
        ..ServiceConfig::default()
    };
    let service = TrialService::builder().config(config).build().unwrap();

    assert_eq!(
        service.policy().get_current().unwrap().eligibility,
        Eligibility::AllUsers
    );
    assert!((service.experiments().threshold() - 99.0).abs() < f64::EPSILON);
}

#[test]
fn test_service_build_rejects_invalid_config() {
    let config = ServiceConfig {
        sweep_interval_secs: 0,
        ..ServiceConfig::default()
    };
    let result = TrialService::builder().config(config).build();
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_service_with_file_sink_continues_ids() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    let ops = AuditContext::operator("ops");

    {
        let sink = Arc::new(JsonlAuditSink::open(&path).unwrap());
        let service = TrialService::builder().audit_sink(sink).build().unwrap();
        service.trials().start_trial(&ops, "u1", None).unwrap();
        service.trials().start_trial(&ops, "u2", None).unwrap();
    }

    let sink = Arc::new(JsonlAuditSink::open(&path).unwrap());
    let service = TrialService::builder().audit_sink(sink).build().unwrap();
    let trial = service.trials().start_trial(&ops, "u3", None).unwrap();
    service.trials().revoke_trial(&ops, trial.id()).unwrap();

    let ids: Vec<u64> = service
        .audit()
        .collect(&protrial::audit::AuditFilter::all())
        .unwrap()
        .iter()
        .map(protrial::audit::AuditEntry::id)
        .collect();
    assert_eq!(ids, vec![4, 3, 2, 1]);
}

#[test]
fn test_service_uses_injected_clock() {
    let clock = Arc::new(ManualClock::default());
    let service = TrialService::builder().clock(clock.clone()).build().unwrap();
    let trial = service
        .trials()
        .start_trial(&AuditContext::system(), "u1", None)
        .unwrap();
    assert_eq!(trial.started_at(), clock.now());
}
