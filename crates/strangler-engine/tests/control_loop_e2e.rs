//! End-to-end scenarios through the control plane facade: progressive
//! ramp-up, deterministic bucketing, the health-to-rollback loop, a money
//! transfer saga with compensation, and crash recovery.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::json;
use strangler_engine::{
    ActionKind, ControlPlaneFacade, HealthSample, HealthState, InMemoryMigrationStore,
    MigrationStore, PolicyDraft, RecordingAlertSink, SagaDefinition, SagaInstance, SagaStatus,
    SagaStep, StepFailure, StepOutcome, StepRecord, Target, TriggeredBy,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type Facade = ControlPlaneFacade<InMemoryMigrationStore, RecordingAlertSink>;

fn facade() -> Facade {
    ControlPlaneFacade::new(InMemoryMigrationStore::new(), RecordingAlertSink::new())
}

fn no_context() -> BTreeMap<String, String> {
    BTreeMap::new()
}

fn sample(
    operation_id: &str,
    target: Target,
    window_start_ms: u64,
    request_count: u64,
    error_count: u64,
    p99_latency_ms: u64,
) -> HealthSample {
    HealthSample {
        operation_id: operation_id.to_string(),
        target,
        window_start_ms,
        request_count,
        error_count,
        p99_latency_ms,
    }
}

// ===========================================================================
// Routing determinism and convergence
// ===========================================================================

#[test]
fn same_key_routes_identically_forever() {
    let mut cp = facade();
    cp.set_policy(PolicyDraft::percentage_only("checkout", 50), 0, "ops", 0)
        .unwrap();

    let first = cp.route("checkout", "user-42", &no_context(), 0);
    for tick in 1..100u64 {
        let again = cp.route("checkout", "user-42", &no_context(), tick);
        assert_eq!(first.target, again.target);
    }
}

#[test]
fn traffic_split_converges_to_percentage() {
    let mut cp = facade();
    cp.set_policy(PolicyDraft::percentage_only("checkout", 20), 0, "ops", 0)
        .unwrap();

    let total = 10_000;
    let mut new_path = 0;
    for i in 0..total {
        let key = format!("user-{i}");
        if cp.route("checkout", &key, &no_context(), 0).target == Target::New {
            new_path += 1;
        }
    }
    // 20% of 10k with a 2-point tolerance.
    assert!(
        (1_800..=2_200).contains(&new_path),
        "new-path share {new_path} outside tolerance"
    );
}

#[test]
fn sticky_keys_survive_percentage_changes() {
    let mut cp = facade();
    cp.set_policy(
        PolicyDraft {
            operation_id: "checkout".to_string(),
            new_path_percentage: 100,
            targeting_rules: Vec::new(),
            sticky_by_key: true,
        },
        0,
        "ops",
        0,
    )
    .unwrap();

    // Pin a key on the new path, then cut the percentage to zero.
    assert_eq!(
        cp.route("checkout", "user-7", &no_context(), 1).target,
        Target::New
    );
    cp.set_policy(
        PolicyDraft {
            operation_id: "checkout".to_string(),
            new_path_percentage: 0,
            targeting_rules: Vec::new(),
            sticky_by_key: true,
        },
        1,
        "ops",
        2,
    )
    .unwrap();

    // Pinned key stays; a fresh key follows the new percentage.
    assert_eq!(
        cp.route("checkout", "user-7", &no_context(), 3).target,
        Target::New
    );
    assert_eq!(
        cp.route("checkout", "fresh-user", &no_context(), 3).target,
        Target::Legacy
    );

    // Eviction releases the pin.
    assert!(cp.evict_sticky_key("checkout", "user-7"));
    assert_eq!(
        cp.route("checkout", "user-7", &no_context(), 4).target,
        Target::Legacy
    );
}

// ===========================================================================
// Health loop: ramp, degrade, automatic rollback
// ===========================================================================

#[test]
fn unsafe_new_path_is_rolled_back_within_one_cycle() {
    let mut cp = facade();
    cp.set_policy(PolicyDraft::percentage_only("checkout", 10), 0, "ops", 0)
        .unwrap();

    // New path throws 15% errors against a 1% legacy baseline.
    cp.report_sample(sample("checkout", Target::New, 0, 400, 60, 120))
        .unwrap();
    cp.report_sample(sample("checkout", Target::Legacy, 0, 3_600, 36, 110))
        .unwrap();

    let verdicts = cp.evaluate_health(60_000);
    assert_eq!(verdicts.len(), 1);
    assert_eq!(verdicts[0].state, HealthState::Unsafe);

    let policy = cp.get_policy("checkout").unwrap();
    assert_eq!(policy.new_path_percentage, 0);

    let events = cp.rollback_events_for("checkout");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].previous_percentage, 10);
    assert_eq!(events[0].new_percentage, 0);
    assert_eq!(events[0].triggered_by, TriggeredBy::Automatic);

    // All traffic is back on legacy, including keys that bucketed new.
    for i in 0..200 {
        let key = format!("user-{i}");
        assert_eq!(
            cp.route("checkout", &key, &no_context(), 60_001).target,
            Target::Legacy
        );
    }
}

#[test]
fn repeated_evaluation_after_rollback_emits_no_second_event() {
    let mut cp = facade();
    cp.set_policy(PolicyDraft::percentage_only("checkout", 10), 0, "ops", 0)
        .unwrap();
    cp.report_sample(sample("checkout", Target::New, 0, 400, 200, 120))
        .unwrap();
    cp.report_sample(sample("checkout", Target::Legacy, 0, 3_600, 36, 110))
        .unwrap();

    cp.evaluate_health(60_000);
    cp.evaluate_health(120_000);
    cp.evaluate_health(180_000);

    assert_eq!(cp.rollback_events().len(), 1);
    assert_eq!(cp.get_policy("checkout").unwrap().version, 2);
}

#[test]
fn healthy_migration_ramps_without_interference() {
    let mut cp = facade();
    cp.set_policy(PolicyDraft::percentage_only("checkout", 10), 0, "ops", 0)
        .unwrap();

    for (step, window) in [(25u8, 0u64), (50, 60_000), (100, 120_000)] {
        cp.report_sample(sample("checkout", Target::New, window, 500, 2, 100))
            .unwrap();
        cp.report_sample(sample("checkout", Target::Legacy, window, 2_000, 10, 100))
            .unwrap();
        let verdicts = cp.evaluate_health(window + 60_000);
        assert_eq!(verdicts[0].state, HealthState::Healthy);

        let version = cp.get_policy("checkout").unwrap().version;
        cp.set_policy(
            PolicyDraft::percentage_only("checkout", step),
            version,
            "ops",
            window + 60_001,
        )
        .unwrap();
    }

    assert_eq!(cp.get_policy("checkout").unwrap().new_path_percentage, 100);
    assert!(cp.rollback_events().is_empty());
    assert!(cp.alerts().alerts().is_empty());
}

#[test]
fn low_traffic_operation_degrades_without_rollback() {
    let mut cp = facade();
    cp.set_policy(PolicyDraft::percentage_only("search", 5), 0, "ops", 0)
        .unwrap();
    // Only 4 new-path requests: not enough evidence either way.
    cp.report_sample(sample("search", Target::New, 0, 4, 4, 900))
        .unwrap();

    let verdicts = cp.evaluate_health(60_000);
    assert_eq!(verdicts[0].state, HealthState::Degraded);
    assert_eq!(cp.get_policy("search").unwrap().new_path_percentage, 5);
    assert!(cp.rollback_events().is_empty());
}

#[test]
fn manual_rollback_is_audited_alongside_automatic() {
    let mut cp = facade();
    cp.set_policy(PolicyDraft::percentage_only("checkout", 40), 0, "ops", 0)
        .unwrap();

    let event = cp
        .force_rollback("checkout", "deploy gone wrong", "oncall", 5)
        .unwrap();
    assert_eq!(event.triggered_by, TriggeredBy::Manual);
    assert_eq!(event.reason, "deploy gone wrong");
    assert_eq!(cp.get_policy("checkout").unwrap().new_path_percentage, 0);

    // Forcing again still leaves an audit trace.
    cp.force_rollback("checkout", "double tap", "oncall", 6)
        .unwrap();
    assert_eq!(cp.rollback_events_for("checkout").len(), 2);
    assert_eq!(cp.get_policy("checkout").unwrap().version, 2);
}

// ===========================================================================
// Money transfer saga
// ===========================================================================

struct TransferProbes {
    debit_source: Arc<AtomicU32>,
    credit_source: Arc<AtomicU32>,
    credit_destination: Arc<AtomicU32>,
    debit_destination: Arc<AtomicU32>,
    record_ledger: Arc<AtomicU32>,
}

/// DebitSource / CreditDestination / RecordLedger, with compensations on the
/// first two. `fail_credit` makes CreditDestination reject.
fn transfer_definition(probes: &TransferProbes, fail_credit: bool) -> SagaDefinition {
    let debit = Arc::clone(&probes.debit_source);
    let undo_debit = Arc::clone(&probes.credit_source);
    let credit = Arc::clone(&probes.credit_destination);
    let undo_credit = Arc::clone(&probes.debit_destination);
    let ledger = Arc::clone(&probes.record_ledger);

    SagaDefinition::new(
        "transfer_funds",
        vec![
            SagaStep::new("debit_source", move |input| {
                debit.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "debited": input["amount"] }))
            })
            .with_compensation(move |_| {
                undo_debit.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            SagaStep::new("credit_destination", move |input| {
                credit.fetch_add(1, Ordering::SeqCst);
                if fail_credit {
                    Err(StepFailure::failed("destination account frozen"))
                } else {
                    Ok(json!({ "credited": input["debited"] }))
                }
            })
            .with_compensation(move |_| {
                undo_credit.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            SagaStep::new("record_ledger", move |input| {
                ledger.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "ledger_entry": input }))
            }),
        ],
    )
}

fn probes() -> TransferProbes {
    TransferProbes {
        debit_source: Arc::new(AtomicU32::new(0)),
        credit_source: Arc::new(AtomicU32::new(0)),
        credit_destination: Arc::new(AtomicU32::new(0)),
        debit_destination: Arc::new(AtomicU32::new(0)),
        record_ledger: Arc::new(AtomicU32::new(0)),
    }
}

#[test]
fn successful_transfer_touches_every_step_once() {
    let p = probes();
    let mut cp = facade();
    cp.register_definition(transfer_definition(&p, false)).unwrap();

    let result = cp
        .execute_saga("transfer_funds", json!({"amount": 150}), None, 0)
        .unwrap();

    assert_eq!(result.status, SagaStatus::Completed);
    assert_eq!(p.debit_source.load(Ordering::SeqCst), 1);
    assert_eq!(p.credit_destination.load(Ordering::SeqCst), 1);
    assert_eq!(p.record_ledger.load(Ordering::SeqCst), 1);
    assert_eq!(p.credit_source.load(Ordering::SeqCst), 0);
    assert_eq!(p.debit_destination.load(Ordering::SeqCst), 0);
}

#[test]
fn failed_credit_refunds_the_source_exactly_once() {
    let p = probes();
    let mut cp = facade();
    cp.register_definition(transfer_definition(&p, true)).unwrap();

    let result = cp
        .execute_saga(
            "transfer_funds",
            json!({"amount": 150}),
            Some("txn-2041".to_string()),
            0,
        )
        .unwrap();

    assert_eq!(result.status, SagaStatus::Compensated);
    assert!(result.failure.as_deref().unwrap().contains("frozen"));

    // Source debited once then refunded once.
    assert_eq!(p.debit_source.load(Ordering::SeqCst), 1);
    assert_eq!(p.credit_source.load(Ordering::SeqCst), 1);
    // The failed credit never completed, so its compensation must not run,
    // and the ledger step was never reached.
    assert_eq!(p.credit_destination.load(Ordering::SeqCst), 1);
    assert_eq!(p.debit_destination.load(Ordering::SeqCst), 0);
    assert_eq!(p.record_ledger.load(Ordering::SeqCst), 0);

    // Re-executing the same transfer id is a read, not a second refund.
    let again = cp
        .execute_saga(
            "transfer_funds",
            json!({"amount": 150}),
            Some("txn-2041".to_string()),
            10,
        )
        .unwrap();
    assert_eq!(again, result);
    assert_eq!(p.credit_source.load(Ordering::SeqCst), 1);
}

#[test]
fn transfer_compensation_is_recorded_in_the_instance_log() {
    let p = probes();
    let mut cp = facade();
    cp.register_definition(transfer_definition(&p, true)).unwrap();

    let result = cp
        .execute_saga("transfer_funds", json!({"amount": 25}), None, 0)
        .unwrap();
    let instance = cp.saga_instance(&result.instance_id).unwrap().unwrap();

    let actions: Vec<(usize, ActionKind, bool)> = instance
        .completed_steps
        .iter()
        .map(|record| (record.step_index, record.action, record.outcome.is_success()))
        .collect();
    assert_eq!(
        actions,
        vec![
            (0, ActionKind::Invoke, true),
            (1, ActionKind::Invoke, false),
            (0, ActionKind::Compensate, true),
        ]
    );
}

// ===========================================================================
// Crash recovery through the facade
// ===========================================================================

#[test]
fn restart_reconciles_unfinished_transfers() {
    // A process died after debit_source completed.
    let mut crashed = SagaInstance::new("txn-crash", "transfer_funds", json!({"amount": 75}), 0);
    crashed.completed_steps.push(StepRecord {
        step_index: 0,
        step_name: "debit_source".to_string(),
        action: ActionKind::Invoke,
        outcome: StepOutcome::Success {
            output: json!({ "debited": 75 }),
        },
        attempts: 1,
        completed_at_ms: 1,
    });
    let mut store = InMemoryMigrationStore::new();
    store.save(&crashed).unwrap();

    let p = probes();
    let mut cp = ControlPlaneFacade::new(store, RecordingAlertSink::new());
    cp.register_definition(transfer_definition(&p, false)).unwrap();

    let unfinished = cp.unfinished_sagas().unwrap();
    assert_eq!(unfinished, vec!["txn-crash"]);

    let result = cp.recover_saga("txn-crash", 500).unwrap();
    assert_eq!(result.status, SagaStatus::Completed);

    // The already-recorded debit was not repeated.
    assert_eq!(p.debit_source.load(Ordering::SeqCst), 0);
    assert_eq!(p.credit_destination.load(Ordering::SeqCst), 1);
    assert_eq!(p.record_ledger.load(Ordering::SeqCst), 1);
    assert!(cp.unfinished_sagas().unwrap().is_empty());
}

// ===========================================================================
// Full lifecycle: ramp, fail, roll back, drain
// ===========================================================================

#[test]
fn full_migration_lifecycle() {
    let mut cp = facade();

    // Ramp checkout to 10%.
    cp.set_policy(PolicyDraft::percentage_only("checkout", 10), 0, "ops", 0)
        .unwrap();

    // First window looks fine.
    cp.report_sample(sample("checkout", Target::New, 0, 300, 3, 100))
        .unwrap();
    cp.report_sample(sample("checkout", Target::Legacy, 0, 2_700, 27, 100))
        .unwrap();
    assert_eq!(cp.evaluate_health(60_000)[0].state, HealthState::Healthy);

    // Second window: the new path melts down.
    cp.report_sample(sample("checkout", Target::New, 60_000, 300, 90, 700))
        .unwrap();
    cp.report_sample(sample("checkout", Target::Legacy, 60_000, 2_700, 27, 100))
        .unwrap();

    let verdicts = cp.evaluate_health(120_000);
    assert_eq!(verdicts[0].state, HealthState::Unsafe);
    assert!(verdicts[0]
        .reasons
        .iter()
        .any(|reason| reason.contains("error_rate_delta_millionths")));

    // Rolled back, audited, and the in-flight saga machinery is untouched.
    assert_eq!(cp.get_policy("checkout").unwrap().new_path_percentage, 0);
    assert_eq!(cp.rollback_events().len(), 1);
    assert_eq!(
        cp.route("checkout", "any", &no_context(), 120_001).target,
        Target::Legacy
    );
    assert_eq!(cp.last_verdict("checkout").map(|v| v.state), Some(HealthState::Unsafe));
}

#[test]
fn operations_are_isolated_in_the_loop() {
    let mut cp = facade();
    cp.set_policy(PolicyDraft::percentage_only("checkout", 10), 0, "ops", 0)
        .unwrap();
    cp.set_policy(PolicyDraft::percentage_only("search", 10), 0, "ops", 0)
        .unwrap();

    // checkout melts down; search is healthy.
    cp.report_sample(sample("checkout", Target::New, 0, 300, 90, 100))
        .unwrap();
    cp.report_sample(sample("checkout", Target::Legacy, 0, 2_700, 27, 100))
        .unwrap();
    cp.report_sample(sample("search", Target::New, 0, 300, 3, 100))
        .unwrap();
    cp.report_sample(sample("search", Target::Legacy, 0, 2_700, 27, 100))
        .unwrap();

    cp.evaluate_health(60_000);

    assert_eq!(cp.get_policy("checkout").unwrap().new_path_percentage, 0);
    assert_eq!(cp.get_policy("search").unwrap().new_path_percentage, 10);
    assert_eq!(cp.rollback_events().len(), 1);
    assert_eq!(cp.rollback_events()[0].operation_id, "checkout");
}
