//! Single entry point wiring routing, sagas, health, and rollback together.
//!
//! Embedders construct one facade per process, hand it the storage and
//! notification collaborators, and drive it from their own clock. The facade
//! owns the closed control loop: `evaluate_health` renders a verdict per
//! migrating operation and immediately feeds it to the rollback controller,
//! so an unhealthy new path loses traffic within one evaluation cycle.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::alert::AlertSink;
use crate::bucketer::{Bucketer, RoutingDecision};
use crate::coordinator::{CoordinatorConfig, SagaCoordinator, SagaError, SagaEvent, SagaResult};
use crate::health::{HealthConfig, HealthError, HealthEvaluator, HealthSample, HealthVerdict};
use crate::registry::MigrationStore;
use crate::rollback::{RollbackConfig, RollbackController, RollbackEvent};
use crate::routing_policy::{PolicyDraft, PolicyError, RoutingPolicy, RoutingPolicyStore};
use crate::saga::{SagaDefinition, SagaInstance};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Unified error surface for facade callers.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("policy update failed: {0}")]
    Policy(#[from] PolicyError),
    #[error("saga operation failed: {0}")]
    Saga(#[from] SagaError),
    #[error("health sample rejected: {0}")]
    Health(#[from] HealthError),
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlPlaneConfig {
    pub coordinator: CoordinatorConfig,
    pub health: HealthConfig,
    pub rollback: RollbackConfig,
}

// ---------------------------------------------------------------------------
// ControlPlaneFacade
// ---------------------------------------------------------------------------

pub struct ControlPlaneFacade<S: MigrationStore, A: AlertSink> {
    policies: RoutingPolicyStore,
    bucketer: Bucketer,
    coordinator: SagaCoordinator<S>,
    health: HealthEvaluator,
    rollback: RollbackController,
    alerts: A,
}

impl<S: MigrationStore, A: AlertSink> ControlPlaneFacade<S, A> {
    pub fn new(store: S, alerts: A) -> Self {
        Self::with_config(store, alerts, ControlPlaneConfig::default())
    }

    pub fn with_config(store: S, alerts: A, config: ControlPlaneConfig) -> Self {
        Self {
            policies: RoutingPolicyStore::new(),
            bucketer: Bucketer::new(),
            coordinator: SagaCoordinator::new(store, config.coordinator),
            health: HealthEvaluator::new(config.health),
            rollback: RollbackController::new(config.rollback),
            alerts,
        }
    }

    // -- routing --

    /// Route one request. Infallible: operations without a policy go to
    /// Legacy.
    pub fn route(
        &mut self,
        operation_id: &str,
        routing_key: &str,
        context: &BTreeMap<String, String>,
        now_ms: u64,
    ) -> RoutingDecision {
        let snapshot = self.policies.snapshot(operation_id);
        self.bucketer
            .route(snapshot.as_deref(), operation_id, routing_key, context, now_ms)
    }

    /// CAS policy write; see `RoutingPolicyStore::set_policy`.
    pub fn set_policy(
        &mut self,
        draft: PolicyDraft,
        expected_version: u64,
        updated_by: &str,
        now_ms: u64,
    ) -> Result<Arc<RoutingPolicy>, ControlPlaneError> {
        Ok(self
            .policies
            .set_policy(draft, expected_version, updated_by, now_ms)?)
    }

    pub fn get_policy(&self, operation_id: &str) -> Option<Arc<RoutingPolicy>> {
        self.policies.snapshot(operation_id)
    }

    pub fn operation_ids(&self) -> Vec<String> {
        self.policies.operation_ids()
    }

    /// Drop a pinned sticky decision so the next request re-evaluates.
    pub fn evict_sticky_key(&mut self, operation_id: &str, routing_key: &str) -> bool {
        self.bucketer.evict_key(operation_id, routing_key)
    }

    pub fn evict_sticky_operation(&mut self, operation_id: &str) -> usize {
        self.bucketer.evict_operation(operation_id)
    }

    // -- sagas --

    pub fn register_definition(
        &mut self,
        definition: SagaDefinition,
    ) -> Result<(), ControlPlaneError> {
        Ok(self.coordinator.register_definition(definition)?)
    }

    pub fn execute_saga(
        &mut self,
        definition_name: &str,
        input: Value,
        instance_id: Option<String>,
        now_ms: u64,
    ) -> Result<SagaResult, ControlPlaneError> {
        Ok(self
            .coordinator
            .execute(definition_name, input, instance_id, &mut self.alerts, now_ms)?)
    }

    pub fn recover_saga(
        &mut self,
        instance_id: &str,
        now_ms: u64,
    ) -> Result<SagaResult, ControlPlaneError> {
        Ok(self.coordinator.recover(instance_id, &mut self.alerts, now_ms)?)
    }

    pub fn saga_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<SagaInstance>, ControlPlaneError> {
        Ok(self.coordinator.instance(instance_id)?)
    }

    /// Non-terminal instances awaiting `recover_saga`, e.g. after a restart.
    pub fn unfinished_sagas(&self) -> Result<Vec<String>, ControlPlaneError> {
        Ok(self.coordinator.unfinished()?)
    }

    pub fn saga_events(&self) -> &[SagaEvent] {
        self.coordinator.events()
    }

    // -- health and rollback --

    pub fn report_sample(&mut self, sample: HealthSample) -> Result<(), ControlPlaneError> {
        Ok(self.health.report_sample(sample)?)
    }

    /// Evaluate every operation that has a routing policy and feed each
    /// verdict straight into the rollback controller. Returns the verdicts
    /// in operation order.
    pub fn evaluate_health(&mut self, now_ms: u64) -> Vec<HealthVerdict> {
        let mut verdicts = Vec::new();
        for operation_id in self.policies.operation_ids() {
            let verdict = self.health.evaluate(&operation_id, now_ms);
            self.rollback
                .on_verdict(&mut self.policies, &mut self.alerts, &verdict, now_ms);
            verdicts.push(verdict);
        }
        verdicts
    }

    pub fn last_verdict(&self, operation_id: &str) -> Option<&HealthVerdict> {
        self.health.last_verdict(operation_id)
    }

    pub fn force_rollback(
        &mut self,
        operation_id: &str,
        reason: &str,
        requested_by: &str,
        now_ms: u64,
    ) -> Result<RollbackEvent, ControlPlaneError> {
        Ok(self.rollback.force_rollback(
            &mut self.policies,
            operation_id,
            reason,
            requested_by,
            now_ms,
        )?)
    }

    pub fn rollback_events(&self) -> &[RollbackEvent] {
        self.rollback.events()
    }

    pub fn rollback_events_for(&self, operation_id: &str) -> Vec<&RollbackEvent> {
        self.rollback.events_for(operation_id)
    }

    // -- collaborators --

    pub fn alerts(&self) -> &A {
        &self.alerts
    }

    pub fn alerts_mut(&mut self) -> &mut A {
        &mut self.alerts
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::RecordingAlertSink;
    use crate::bucketer::DecisionSource;
    use crate::health::HealthState;
    use crate::registry::InMemoryMigrationStore;
    use crate::routing_policy::Target;
    use crate::saga::{SagaStatus, SagaStep};
    use serde_json::json;

    fn facade() -> ControlPlaneFacade<InMemoryMigrationStore, RecordingAlertSink> {
        ControlPlaneFacade::new(InMemoryMigrationStore::new(), RecordingAlertSink::new())
    }

    fn sample(target: Target, requests: u64, errors: u64, p99: u64) -> HealthSample {
        HealthSample {
            operation_id: "checkout".to_string(),
            target,
            window_start_ms: 0,
            request_count: requests,
            error_count: errors,
            p99_latency_ms: p99,
        }
    }

    #[test]
    fn unconfigured_operation_routes_to_legacy() {
        let mut cp = facade();
        let decision = cp.route("checkout", "user-1", &BTreeMap::new(), 0);
        assert_eq!(decision.target, Target::Legacy);
        assert_eq!(decision.source, DecisionSource::FallbackLegacy);
    }

    #[test]
    fn policy_write_changes_routing() {
        let mut cp = facade();
        cp.set_policy(PolicyDraft::percentage_only("checkout", 100), 0, "ops", 0)
            .unwrap();
        let decision = cp.route("checkout", "user-1", &BTreeMap::new(), 1);
        assert_eq!(decision.target, Target::New);
        assert_eq!(decision.policy_version, 1);
        assert_eq!(cp.operation_ids(), vec!["checkout"]);
    }

    #[test]
    fn stale_policy_write_is_rejected() {
        let mut cp = facade();
        cp.set_policy(PolicyDraft::percentage_only("checkout", 10), 0, "ops", 0)
            .unwrap();
        let err = cp
            .set_policy(PolicyDraft::percentage_only("checkout", 20), 0, "ops", 1)
            .unwrap_err();
        assert!(matches!(
            err,
            ControlPlaneError::Policy(PolicyError::ConcurrentPolicyUpdate { .. })
        ));
    }

    #[test]
    fn saga_round_trip_through_facade() {
        let mut cp = facade();
        cp.register_definition(SagaDefinition::new(
            "transfer",
            vec![SagaStep::new("debit", |_| Ok(json!("done")))],
        ))
        .unwrap();

        let result = cp
            .execute_saga("transfer", json!({"amount": 10}), None, 0)
            .unwrap();
        assert_eq!(result.status, SagaStatus::Completed);
        assert!(cp.saga_instance(&result.instance_id).unwrap().is_some());
        assert!(cp.unfinished_sagas().unwrap().is_empty());
        assert!(!cp.saga_events().is_empty());
    }

    #[test]
    fn evaluate_health_closes_the_loop() {
        let mut cp = facade();
        cp.set_policy(PolicyDraft::percentage_only("checkout", 25), 0, "ops", 0)
            .unwrap();
        cp.report_sample(sample(Target::New, 1000, 200, 100)).unwrap();
        cp.report_sample(sample(Target::Legacy, 3000, 30, 100)).unwrap();

        let verdicts = cp.evaluate_health(60_000);
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].state, HealthState::Unsafe);

        // The rollback landed before evaluate_health returned.
        assert_eq!(cp.get_policy("checkout").unwrap().new_path_percentage, 0);
        assert_eq!(cp.rollback_events().len(), 1);
        assert_eq!(
            cp.route("checkout", "any-user", &BTreeMap::new(), 60_001).target,
            Target::Legacy
        );
    }

    #[test]
    fn force_rollback_through_facade() {
        let mut cp = facade();
        cp.set_policy(PolicyDraft::percentage_only("checkout", 50), 0, "ops", 0)
            .unwrap();
        let event = cp
            .force_rollback("checkout", "incident", "oncall", 10)
            .unwrap();
        assert_eq!(event.previous_percentage, 50);
        assert_eq!(cp.get_policy("checkout").unwrap().new_path_percentage, 0);
        assert_eq!(cp.rollback_events_for("checkout").len(), 1);
    }

    #[test]
    fn health_error_converts() {
        let mut cp = facade();
        let mut bad = sample(Target::New, 1, 2, 0);
        bad.operation_id = "checkout".to_string();
        let err = cp.report_sample(bad).unwrap_err();
        assert!(matches!(err, ControlPlaneError::Health(_)));
    }

    #[test]
    fn error_display_is_prefixed() {
        let err = ControlPlaneError::Policy(PolicyError::EmptyOperationId);
        assert!(err.to_string().starts_with("policy update failed"));
        let err = ControlPlaneError::Saga(SagaError::InstanceNotFound {
            instance_id: "i".to_string(),
        });
        assert!(err.to_string().starts_with("saga operation failed"));
    }
}
