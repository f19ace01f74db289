//! Progressive migration control plane for strangler-fig rewrites.
//!
//! Routes each operation's traffic between a legacy implementation and its
//! replacement by deterministic percentage bucketing, executes multi-step
//! migration workflows as sagas with reverse-order compensation, and closes
//! the loop with a health evaluator that rolls unhealthy operations back to
//! the legacy path automatically.
//!
//! The crate is a pure decision core: no I/O, no threads, no wall clock.
//! Timestamps come from the caller, durability goes through the
//! [`registry::MigrationStore`] port, and notifications go through the
//! [`alert::AlertSink`] port. Given the same inputs, every component
//! produces bit-identical outputs on any platform.
//!
//! [`facade::ControlPlaneFacade`] wires the pieces together for embedders;
//! the individual modules remain usable on their own.

#![forbid(unsafe_code)]

pub mod alert;
pub mod bucketer;
pub mod coordinator;
pub mod facade;
pub mod health;
pub mod registry;
pub mod rollback;
pub mod routing_policy;
pub mod saga;

pub use alert::{Alert, AlertSeverity, AlertSink, RecordingAlertSink};
pub use bucketer::{stable_bucket, Bucketer, DecisionSource, RoutingDecision};
pub use coordinator::{
    backoff_delay_ms, CoordinatorConfig, SagaCoordinator, SagaError, SagaEvent, SagaResult,
};
pub use facade::{ControlPlaneConfig, ControlPlaneError, ControlPlaneFacade};
pub use health::{
    HealthConfig, HealthError, HealthEvaluator, HealthSample, HealthState, HealthVerdict,
};
pub use registry::{InMemoryMigrationStore, MigrationStore, RegistryError};
pub use rollback::{
    RollbackConfig, RollbackController, RollbackEvent, RollbackState, TriggeredBy,
};
pub use routing_policy::{
    PolicyDraft, PolicyError, RoutingPolicy, RoutingPolicyStore, RuleMatch, Target, TargetingRule,
};
pub use saga::{
    ActionKind, SagaDefinition, SagaInstance, SagaStatus, SagaStep, StepFailure, StepFailureKind,
    StepOutcome, StepRecord,
};
