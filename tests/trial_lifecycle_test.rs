//! Trial lifecycle integration tests
//!
//! Drive the public service API the way the admin console, the billing
//! callback and the background sweep do.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::Duration;
use protrial::audit::{
    AuditAction, AuditCategory, AuditContext, AuditCursor, AuditEntry, AuditFilter, AuditSink,
    MemoryAuditSink,
};
use protrial::clock::ManualClock;
use protrial::policy::{DowngradeBehavior, Eligibility, PolicyPatch};
use protrial::trial::{CampaignAttribution, Entitlement, TrialStatus};
use protrial::{Error, TrialService};

fn service() -> (TrialService, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let service = TrialService::builder().clock(clock.clone()).build().unwrap();
    (service, clock)
}

/// Memory sink that refuses entries about selected users.
#[derive(Debug, Default)]
struct SelectiveSink {
    inner: MemoryAuditSink,
    refused: Mutex<HashSet<String>>,
}

impl SelectiveSink {
    fn refuse(&self, user_id: &str) {
        self.refused.lock().unwrap().insert(user_id.to_string());
    }

    fn accept_all(&self) {
        self.refused.lock().unwrap().clear();
    }
}

impl AuditSink for SelectiveSink {
    fn append(&self, entry: &AuditEntry) -> protrial::Result<()> {
        let refused = self.refused.lock().unwrap();
        if entry
            .affected_user_id()
            .is_some_and(|user| refused.contains(user))
        {
            return Err(Error::StorageError("audit shard offline".to_string()));
        }
        drop(refused);
        self.inner.append(entry)
    }

    fn page(
        &self,
        filter: &AuditFilter,
        after: Option<AuditCursor>,
        limit: usize,
    ) -> protrial::Result<Vec<AuditEntry>> {
        self.inner.page(filter, after, limit)
    }

    fn len(&self) -> protrial::Result<usize> {
        self.inner.len()
    }

    fn last_id(&self) -> protrial::Result<u64> {
        self.inner.last_id()
    }
}

fn ops() -> AuditContext {
    AuditContext::operator("ops@studio").with_ip("192.0.2.10")
}

// =============================================================================
// Eligibility
// =============================================================================

#[test]
fn test_new_users_eligibility_scenario() {
    let (service, clock) = service();
    let trials = service.trials();

    let fresh = trials.start_trial(&ops(), "fresh-player", None).unwrap();
    assert_eq!(fresh.status(), TrialStatus::Active);

    let old = trials.start_trial(&ops(), "old-player", None).unwrap();
    clock.advance(Duration::days(8));
    trials.sweep_expirations();
    assert_eq!(trials.get(old.id()).unwrap().status(), TrialStatus::Expired);

    let err = trials.start_trial(&ops(), "old-player", None).unwrap_err();
    assert!(matches!(err, Error::NotEligible { .. }));
    assert!(err.to_string().contains("old-player"));
}

#[test]
fn test_returning_users_after_policy_switch() {
    let (service, clock) = service();
    let trials = service.trials();

    let first = trials.start_trial(&ops(), "p1", None).unwrap();
    clock.advance(Duration::days(8));
    trials.sweep_expirations();

    service
        .policy()
        .update(
            &ops(),
            PolicyPatch::default().eligibility(Eligibility::ReturningUsers),
        )
        .unwrap();

    let second = trials.start_trial(&ops(), "p1", None).unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(trials.trials_for_user("p1").len(), 2);
    assert!(trials.start_trial(&ops(), "p2", None).is_err());
}

#[test]
fn test_all_users_still_blocks_second_active_trial() {
    let (service, _) = service();
    service
        .policy()
        .update(&ops(), PolicyPatch::default().eligibility(Eligibility::AllUsers))
        .unwrap();

    service.trials().start_trial(&ops(), "p1", None).unwrap();
    assert!(matches!(
        service.trials().start_trial(&ops(), "p1", None),
        Err(Error::NotEligible { .. })
    ));
}

#[test]
fn test_campaign_attribution_is_recorded() {
    let (service, _) = service();
    service
        .policy()
        .update(
            &ops(),
            PolicyPatch::default().eligibility(Eligibility::CampaignBased),
        )
        .unwrap();

    let attribution = CampaignAttribution::new("summer-cup");
    let trial = service
        .trials()
        .start_trial(&ops(), "p1", Some(&attribution))
        .unwrap();
    assert_eq!(trial.campaign(), Some("summer-cup"));

    let entries = service
        .audit()
        .collect(&AuditFilter::all().search("summer-cup"))
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action(), &AuditAction::TrialStarted);
}

// =============================================================================
// Transitions
// =============================================================================

#[test]
fn test_expired_to_converted_needs_extend() {
    let (service, clock) = service();
    let trials = service.trials();
    let trial = trials.start_trial(&ops(), "p1", None).unwrap();

    clock.advance(Duration::days(7));
    assert_eq!(trials.sweep_expirations().count(), 1);

    assert!(matches!(
        trials.convert_to_pro(&AuditContext::system(), trial.id(), None),
        Err(Error::InvalidTransition { .. })
    ));
    assert_eq!(trials.get(trial.id()).unwrap().status(), TrialStatus::Expired);

    trials.extend_trial(&ops(), trial.id(), 2).unwrap();
    let converted = trials
        .convert_to_pro(&AuditContext::system(), trial.id(), None)
        .unwrap();
    assert_eq!(converted.status(), TrialStatus::Converted);
}

#[test]
fn test_convert_twice_is_single_side_effect() {
    let (service, _) = service();
    let trials = service.trials();
    let trial = trials.start_trial(&ops(), "p1", None).unwrap();
    let receipt = serde_json::json!({"store": "play", "orderId": "GPA.1234"});

    let first = trials
        .convert_to_pro(&AuditContext::system(), trial.id(), Some(receipt.clone()))
        .unwrap();
    let second = trials
        .convert_to_pro(&AuditContext::system(), trial.id(), Some(receipt))
        .unwrap();

    assert_eq!(first, second);
    let conversions = service
        .audit()
        .collect(&AuditFilter::all().category(AuditCategory::User))
        .unwrap();
    assert_eq!(conversions.len(), 1);
    assert_eq!(
        conversions[0].details()["receipt"]["orderId"],
        serde_json::json!("GPA.1234")
    );
    assert_eq!(trials.stats().converted, 1);
}

#[test]
fn test_revoke_converted_then_reactivate() {
    let (service, clock) = service();
    let trials = service.trials();
    let trial = trials.start_trial(&ops(), "p1", None).unwrap();
    trials.convert_to_pro(&ops(), trial.id(), None).unwrap();

    let revoked = trials.revoke_trial(&ops(), trial.id()).unwrap();
    assert_eq!(revoked.status(), TrialStatus::Revoked);
    assert_eq!(
        revoked.downgrade_behavior(),
        Some(DowngradeBehavior::SoftPrompt)
    );

    clock.advance(Duration::days(1));
    let back = trials.reactivate_trial(&ops(), trial.id()).unwrap();
    assert_eq!(back.status(), TrialStatus::Active);
    assert_eq!(back.downgrade_behavior(), None);
}

#[test]
fn test_unknown_trial_is_not_found() {
    let (service, _) = service();
    assert!(matches!(
        service.trials().extend_trial(&ops(), "trial-999999", 1),
        Err(Error::NotFound { .. })
    ));
    assert!(matches!(
        service.trials().get("trial-999999"),
        Err(Error::NotFound { .. })
    ));
}

// =============================================================================
// Audit completeness
// =============================================================================

#[test]
fn test_every_transition_writes_exactly_one_entry() {
    let (service, clock) = service();
    let trials = service.trials();
    let audit = service.audit();

    let before = audit.len().unwrap();
    let trial = trials.start_trial(&ops(), "p1", None).unwrap();
    assert_eq!(audit.len().unwrap(), before + 1);

    trials.extend_trial(&ops(), trial.id(), 3).unwrap();
    assert_eq!(audit.len().unwrap(), before + 2);

    trials.revoke_trial(&ops(), trial.id()).unwrap();
    assert_eq!(audit.len().unwrap(), before + 3);

    trials.reactivate_trial(&ops(), trial.id()).unwrap();
    assert_eq!(audit.len().unwrap(), before + 4);

    clock.advance(Duration::days(30));
    trials.sweep_expirations();
    assert_eq!(audit.len().unwrap(), before + 5);

    trials.record_feature_usage(trial.id(), "nope").unwrap_err();
    assert_eq!(audit.len().unwrap(), before + 5);

    let history = audit
        .collect(&AuditFilter::all().affected_user("p1"))
        .unwrap();
    let actions: Vec<&AuditAction> = history.iter().map(|e| e.action()).collect();
    assert_eq!(
        actions,
        vec![
            &AuditAction::TrialDowngradePrompted,
            &AuditAction::TrialReactivated,
            &AuditAction::TrialRevoked,
            &AuditAction::TrialExtended,
            &AuditAction::TrialStarted,
        ]
    );
    for entry in &history {
        assert_eq!(entry.details()["trialId"], serde_json::json!(trial.id()));
    }
    assert_eq!(history[1].performed_by(), Some("ops@studio"));
    assert_eq!(history[1].ip_address(), Some("192.0.2.10"));
    assert_eq!(history[0].performed_by(), Some("system"));
}

#[test]
fn test_sweep_outcome_follows_current_policy() {
    let (service, clock) = service();
    let trial = service.trials().start_trial(&ops(), "p1", None).unwrap();
    service
        .policy()
        .update(
            &ops(),
            PolicyPatch::default().downgrade_behavior(DowngradeBehavior::HardBlock),
        )
        .unwrap();

    clock.advance(Duration::days(7));
    service.trials().sweep_expirations();

    let expired = service.trials().get(trial.id()).unwrap();
    assert_eq!(expired.downgrade_behavior(), Some(DowngradeBehavior::HardBlock));
    assert_eq!(
        service.trials().entitlement("p1"),
        Entitlement::Downgraded {
            behavior: DowngradeBehavior::HardBlock
        }
    );
    let blocked = service
        .audit()
        .collect(&AuditFilter::all().search("trial_blocked"))
        .unwrap();
    assert_eq!(blocked.len(), 1);
}

#[test]
fn test_sweep_isolates_per_trial_failures() {
    let clock = Arc::new(ManualClock::default());
    let sink = Arc::new(SelectiveSink::default());
    let service = TrialService::builder()
        .clock(clock.clone())
        .audit_sink(sink.clone())
        .build()
        .unwrap();
    let trials = service.trials();
    let ids: Vec<String> = (0..6)
        .map(|i| {
            trials
                .start_trial(&ops(), &format!("p{i}"), None)
                .unwrap()
                .id()
                .to_string()
        })
        .collect();

    sink.refuse("p1");
    sink.refuse("p4");
    clock.advance(Duration::days(7));

    let report = trials.sweep_expirations();
    assert_eq!(report.expired, 4);
    assert_eq!(report.failed, 2);
    assert!(!report.cancelled);

    for (i, id) in ids.iter().enumerate() {
        let expected = if i == 1 || i == 4 {
            TrialStatus::Active
        } else {
            TrialStatus::Expired
        };
        assert_eq!(trials.get(id).unwrap().status(), expected);
    }
    for user in ["p1", "p4"] {
        let entries = service
            .audit()
            .collect(&AuditFilter::all().affected_user(user))
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action(), &AuditAction::TrialStarted);
    }

    sink.accept_all();
    let retry = trials.sweep_expirations();
    assert_eq!(retry.expired, 2);
    assert_eq!(retry.failed, 0);
    assert_eq!(trials.stats().expired, 6);

    let again = trials.sweep_expirations();
    assert_eq!(again.count(), 0);
    let downgrades = service
        .audit()
        .collect(&AuditFilter::all().search("trial_downgrade_prompted"))
        .unwrap();
    assert_eq!(downgrades.len(), 6);
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_concurrent_extend_and_revoke_serialize() {
    let (service, _) = service();
    let service = Arc::new(service);
    let trial = service.trials().start_trial(&ops(), "p1", None).unwrap();

    let mut handles = vec![];
    for i in 0..8 {
        let service = Arc::clone(&service);
        let id = trial.id().to_string();
        handles.push(thread::spawn(move || {
            if i % 2 == 0 {
                service.trials().extend_trial(&ops(), &id, 1).is_ok()
            } else {
                service.trials().revoke_trial(&ops(), &id).is_ok()
            }
        }));
    }
    let successes = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();

    let final_trial = service.trials().get(trial.id()).unwrap();
    let trial_entries = service
        .audit()
        .collect(&AuditFilter::all().category(AuditCategory::Trial))
        .unwrap();

    // one entry for the start, one per successful command
    assert_eq!(trial_entries.len(), successes + 1);
    assert_eq!(final_trial.revision(), u64::try_from(successes).unwrap());
}

#[test]
fn test_concurrent_start_trial_same_user_creates_one() {
    let (service, _) = service();
    let service = Arc::new(service);

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let service = Arc::clone(&service);
            thread::spawn(move || service.trials().start_trial(&ops(), "racer", None).is_ok())
        })
        .collect();
    let created = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();

    assert_eq!(created, 1);
    assert_eq!(service.trials().trials_for_user("racer").len(), 1);
}

#[test]
fn test_concurrent_sweeps_expire_once() {
    let (service, clock) = service();
    let service = Arc::new(service);
    for i in 0..50 {
        service
            .trials()
            .start_trial(&ops(), &format!("p{i}"), None)
            .unwrap();
    }
    clock.advance(Duration::days(7));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let service = Arc::clone(&service);
            thread::spawn(move || service.trials().sweep_expirations().count())
        })
        .collect();
    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(total, 50);
    assert_eq!(service.trials().stats().expired, 50);
    assert_eq!(service.trials().sweep_expirations().count(), 0);
}
