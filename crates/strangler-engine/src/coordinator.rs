//! Saga coordinator: sequential step execution, crash-safe re-drive, and
//! reverse-order compensation with bounded retries.
//!
//! The coordinator persists the instance through the migration registry
//! before attempting each next action (at-least-once toward participants) and
//! holds a per-instance advisory lock so the same instance is never driven by
//! two callers at once. Callers always receive a terminal status; raw step
//! failures never escape the compensation machinery.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::alert::{Alert, AlertSeverity, AlertSink};
use crate::registry::{MigrationStore, RegistryError};
use crate::saga::{
    ActionKind, SagaDefinition, SagaInstance, SagaStatus, StepOutcome, StepRecord,
};

pub const COMPONENT: &str = "saga_coordinator";

// ---------------------------------------------------------------------------
// CoordinatorConfig
// ---------------------------------------------------------------------------

/// Tunables for compensation retries and the event journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Attempts per compensation before the instance is marked
    /// `CompensationFailed`.
    pub max_compensation_attempts: u32,
    /// Base delay for exponential backoff between compensation attempts.
    pub backoff_base_ms: u64,
    /// Upper bound on a single backoff delay.
    pub backoff_cap_ms: u64,
    /// Maximum retained `SagaEvent` entries.
    pub journal_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_compensation_attempts: 3,
            backoff_base_ms: 100,
            backoff_cap_ms: 10_000,
            journal_capacity: 1_024,
        }
    }
}

/// Exponential backoff delay for the given attempt (1-based), capped.
pub fn backoff_delay_ms(config: &CoordinatorConfig, attempt: u32) -> u64 {
    let shift = attempt.saturating_sub(1).min(32);
    config
        .backoff_base_ms
        .saturating_mul(1u64 << shift)
        .min(config.backoff_cap_ms)
}

// ---------------------------------------------------------------------------
// SagaEvent — structured observability record
// ---------------------------------------------------------------------------

/// One entry in the coordinator's bounded event journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaEvent {
    pub instance_id: String,
    pub definition_name: String,
    pub step_index: usize,
    pub step_name: String,
    pub action: ActionKind,
    /// `success`, `replayed`, or the failure diagnostic.
    pub outcome: String,
    pub attempts: u32,
    pub occurred_at_ms: u64,
}

// ---------------------------------------------------------------------------
// SagaError
// ---------------------------------------------------------------------------

/// Errors surfaced by coordinator operations. Step failures are not here:
/// they are absorbed into compensation and reported through `SagaResult`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaError {
    DefinitionNotFound {
        definition_name: String,
    },
    DuplicateDefinition {
        definition_name: String,
    },
    /// A definition must have at least one step.
    EmptySteps {
        definition_name: String,
    },
    /// The instance is being driven by another caller.
    SagaAlreadyRunning {
        instance_id: String,
    },
    InstanceNotFound {
        instance_id: String,
    },
    /// The stored instance belongs to a different definition.
    DefinitionMismatch {
        instance_id: String,
        expected: String,
        actual: String,
    },
    Registry(RegistryError),
}

impl fmt::Display for SagaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DefinitionNotFound { definition_name } => {
                write!(f, "saga definition '{definition_name}' not found")
            }
            Self::DuplicateDefinition { definition_name } => {
                write!(f, "saga definition '{definition_name}' already registered")
            }
            Self::EmptySteps { definition_name } => {
                write!(f, "saga definition '{definition_name}' has no steps")
            }
            Self::SagaAlreadyRunning { instance_id } => {
                write!(f, "saga instance '{instance_id}' is already running")
            }
            Self::InstanceNotFound { instance_id } => {
                write!(f, "saga instance '{instance_id}' not found")
            }
            Self::DefinitionMismatch {
                instance_id,
                expected,
                actual,
            } => write!(
                f,
                "saga instance '{instance_id}' belongs to definition '{actual}', \
                 not '{expected}'"
            ),
            Self::Registry(err) => write!(f, "registry failure: {err}"),
        }
    }
}

impl std::error::Error for SagaError {}

impl From<RegistryError> for SagaError {
    fn from(err: RegistryError) -> Self {
        Self::Registry(err)
    }
}

// ---------------------------------------------------------------------------
// SagaResult
// ---------------------------------------------------------------------------

/// Terminal outcome returned to `execute`/`recover` callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaResult {
    pub instance_id: String,
    pub status: SagaStatus,
    pub completed_steps: Vec<StepRecord>,
    pub failure: Option<String>,
}

impl SagaResult {
    fn from_instance(instance: &SagaInstance) -> Self {
        Self {
            instance_id: instance.instance_id.clone(),
            status: instance.status,
            completed_steps: instance.completed_steps.clone(),
            failure: instance.failure.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// SagaCoordinator
// ---------------------------------------------------------------------------

/// Executes saga definitions against caller-supplied participant actions,
/// persisting every transition through the migration registry.
pub struct SagaCoordinator<S: MigrationStore> {
    config: CoordinatorConfig,
    definitions: BTreeMap<String, SagaDefinition>,
    store: S,
    /// Advisory locks keyed by instance id.
    running: BTreeSet<String>,
    instance_seq: u64,
    journal: Vec<SagaEvent>,
}

impl<S: MigrationStore> SagaCoordinator<S> {
    pub fn new(store: S, config: CoordinatorConfig) -> Self {
        Self {
            config,
            definitions: BTreeMap::new(),
            store,
            running: BTreeSet::new(),
            instance_seq: 0,
            journal: Vec::new(),
        }
    }

    /// Register a definition. Rejects empty step lists and duplicate names.
    pub fn register_definition(&mut self, definition: SagaDefinition) -> Result<(), SagaError> {
        if definition.steps.is_empty() {
            return Err(SagaError::EmptySteps {
                definition_name: definition.name.clone(),
            });
        }
        if self.definitions.contains_key(&definition.name) {
            return Err(SagaError::DuplicateDefinition {
                definition_name: definition.name.clone(),
            });
        }
        self.definitions.insert(definition.name.clone(), definition);
        Ok(())
    }

    /// Registered definition names, in deterministic order.
    pub fn definition_names(&self) -> Vec<String> {
        self.definitions.keys().cloned().collect()
    }

    /// Execute a saga to a terminal status. With an explicit `instance_id`
    /// the call is idempotent: re-driving a terminal instance returns its
    /// stored result, and resuming a non-terminal one picks up where the
    /// step log left off (the supplied input is ignored in favor of the
    /// persisted one).
    pub fn execute(
        &mut self,
        definition_name: &str,
        input: Value,
        instance_id: Option<String>,
        alerts: &mut dyn AlertSink,
        now_ms: u64,
    ) -> Result<SagaResult, SagaError> {
        if !self.definitions.contains_key(definition_name) {
            return Err(SagaError::DefinitionNotFound {
                definition_name: definition_name.to_string(),
            });
        }
        let instance_id = match instance_id {
            Some(id) => id,
            None => {
                self.instance_seq += 1;
                format!("{definition_name}-{:06}", self.instance_seq)
            }
        };

        if !self.running.insert(instance_id.clone()) {
            return Err(SagaError::SagaAlreadyRunning { instance_id });
        }
        let result = self.locked_execute(definition_name, input, &instance_id, alerts, now_ms);
        self.running.remove(&instance_id);
        result
    }

    /// Re-drive an instance loaded from the registry, e.g. after a crash.
    /// Recorded steps are never re-invoked; a terminal instance returns its
    /// stored result unchanged.
    pub fn recover(
        &mut self,
        instance_id: &str,
        alerts: &mut dyn AlertSink,
        now_ms: u64,
    ) -> Result<SagaResult, SagaError> {
        if !self.running.insert(instance_id.to_string()) {
            return Err(SagaError::SagaAlreadyRunning {
                instance_id: instance_id.to_string(),
            });
        }
        let result = self.locked_recover(instance_id, alerts, now_ms);
        self.running.remove(instance_id);
        result
    }

    /// Current instance record, straight from the registry.
    pub fn instance(&self, instance_id: &str) -> Result<Option<SagaInstance>, SagaError> {
        Ok(self.store.load(instance_id)?)
    }

    /// Ids of non-terminal instances awaiting reconciliation.
    pub fn unfinished(&self) -> Result<Vec<String>, SagaError> {
        Ok(self.store.list_unfinished()?)
    }

    /// The bounded event journal, oldest first.
    pub fn events(&self) -> &[SagaEvent] {
        &self.journal
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    fn locked_execute(
        &mut self,
        definition_name: &str,
        input: Value,
        instance_id: &str,
        alerts: &mut dyn AlertSink,
        now_ms: u64,
    ) -> Result<SagaResult, SagaError> {
        let instance = match self.store.load(instance_id)? {
            Some(existing) => {
                if existing.definition_name != definition_name {
                    return Err(SagaError::DefinitionMismatch {
                        instance_id: instance_id.to_string(),
                        expected: definition_name.to_string(),
                        actual: existing.definition_name,
                    });
                }
                if existing.is_terminal() {
                    return Ok(SagaResult::from_instance(&existing));
                }
                existing
            }
            None => {
                let fresh = SagaInstance::new(instance_id, definition_name, input, now_ms);
                self.store.save(&fresh)?;
                fresh
            }
        };

        let definition = self.definitions.get(definition_name).ok_or_else(|| {
            SagaError::DefinitionNotFound {
                definition_name: definition_name.to_string(),
            }
        })?;
        drive(
            definition,
            &self.config,
            &mut self.store,
            &mut self.journal,
            instance,
            alerts,
            now_ms,
        )
    }

    fn locked_recover(
        &mut self,
        instance_id: &str,
        alerts: &mut dyn AlertSink,
        now_ms: u64,
    ) -> Result<SagaResult, SagaError> {
        let instance = self
            .store
            .load(instance_id)?
            .ok_or_else(|| SagaError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;
        if instance.is_terminal() {
            return Ok(SagaResult::from_instance(&instance));
        }
        let definition = self.definitions.get(&instance.definition_name).ok_or_else(|| {
            SagaError::DefinitionNotFound {
                definition_name: instance.definition_name.clone(),
            }
        })?;
        drive(
            definition,
            &self.config,
            &mut self.store,
            &mut self.journal,
            instance,
            alerts,
            now_ms,
        )
    }
}

// ---------------------------------------------------------------------------
// drive — forward execution then compensation
// ---------------------------------------------------------------------------

fn drive<S: MigrationStore>(
    definition: &SagaDefinition,
    config: &CoordinatorConfig,
    store: &mut S,
    journal: &mut Vec<SagaEvent>,
    mut instance: SagaInstance,
    alerts: &mut dyn AlertSink,
    now_ms: u64,
) -> Result<SagaResult, SagaError> {
    let mut failed_index = instance.failed_invoke_index();

    if instance.status == SagaStatus::Running {
        let mut current_input = instance.input.clone();
        for (index, step) in definition.steps.iter().enumerate() {
            // A step already recorded as succeeded is skipped; its cached
            // output feeds the next step.
            if let Some(output) = instance.completed_invoke_output(index) {
                current_input = output.clone();
                push_event(
                    journal,
                    config.journal_capacity,
                    event(&instance, index, &step.name, ActionKind::Invoke, "replayed", 0, now_ms),
                );
                continue;
            }

            match (step.invoke)(&current_input) {
                Ok(output) => {
                    instance.completed_steps.push(StepRecord {
                        step_index: index,
                        step_name: step.name.clone(),
                        action: ActionKind::Invoke,
                        outcome: StepOutcome::Success {
                            output: output.clone(),
                        },
                        attempts: 1,
                        completed_at_ms: now_ms,
                    });
                    instance.updated_at_ms = now_ms;
                    store.save(&instance)?;
                    push_event(
                        journal,
                        config.journal_capacity,
                        event(&instance, index, &step.name, ActionKind::Invoke, "success", 1, now_ms),
                    );
                    current_input = output;
                }
                Err(failure) => {
                    let diagnostic = failure.to_string();
                    instance.completed_steps.push(StepRecord {
                        step_index: index,
                        step_name: step.name.clone(),
                        action: ActionKind::Invoke,
                        outcome: StepOutcome::from_failure(&failure),
                        attempts: 1,
                        completed_at_ms: now_ms,
                    });
                    instance.status = SagaStatus::Compensating;
                    instance.failure = Some(diagnostic.clone());
                    instance.updated_at_ms = now_ms;
                    store.save(&instance)?;
                    push_event(
                        journal,
                        config.journal_capacity,
                        event(&instance, index, &step.name, ActionKind::Invoke, &diagnostic, 1, now_ms),
                    );
                    failed_index = Some(index);
                    break;
                }
            }
        }

        if failed_index.is_none() {
            instance.status = SagaStatus::Completed;
            instance.updated_at_ms = now_ms;
            store.save(&instance)?;
            return Ok(SagaResult::from_instance(&instance));
        }
    }

    let Some(failed_index) = failed_index else {
        // Compensating without a failed invoke record cannot be produced by
        // this coordinator's own writes; nothing to unwind.
        instance.status = SagaStatus::Compensated;
        instance.updated_at_ms = now_ms;
        store.save(&instance)?;
        return Ok(SagaResult::from_instance(&instance));
    };

    // Compensate completed steps in strict reverse order. An exhausted
    // compensation stops the unwind: earlier compensations may depend on
    // later ones having run.
    for index in (0..failed_index).rev() {
        if instance.is_compensated(index) {
            continue;
        }
        let step = &definition.steps[index];
        let Some(compensate) = step.compensate.as_ref() else {
            continue;
        };
        let output = instance
            .completed_invoke_output(index)
            .cloned()
            .unwrap_or(Value::Null);

        let mut attempts = 0;
        let mut last_failure = None;
        while attempts < config.max_compensation_attempts {
            attempts += 1;
            match compensate(&output) {
                Ok(()) => {
                    last_failure = None;
                    break;
                }
                Err(failure) => {
                    push_event(
                        journal,
                        config.journal_capacity,
                        event(
                            &instance,
                            index,
                            &step.name,
                            ActionKind::Compensate,
                            &format!(
                                "{failure}; retry in {}ms",
                                backoff_delay_ms(config, attempts)
                            ),
                            attempts,
                            now_ms,
                        ),
                    );
                    last_failure = Some(failure);
                }
            }
        }

        match last_failure {
            None => {
                instance.completed_steps.push(StepRecord {
                    step_index: index,
                    step_name: step.name.clone(),
                    action: ActionKind::Compensate,
                    outcome: StepOutcome::Success {
                        output: Value::Null,
                    },
                    attempts,
                    completed_at_ms: now_ms,
                });
                instance.updated_at_ms = now_ms;
                store.save(&instance)?;
                push_event(
                    journal,
                    config.journal_capacity,
                    event(&instance, index, &step.name, ActionKind::Compensate, "success", attempts, now_ms),
                );
            }
            Some(failure) => {
                let diagnostic = failure.to_string();
                instance.completed_steps.push(StepRecord {
                    step_index: index,
                    step_name: step.name.clone(),
                    action: ActionKind::Compensate,
                    outcome: StepOutcome::from_failure(&failure),
                    attempts,
                    completed_at_ms: now_ms,
                });
                instance.status = SagaStatus::CompensationFailed;
                instance.failure = Some(format!(
                    "compensation for step '{}' exhausted {} attempts: {diagnostic}",
                    step.name, attempts
                ));
                instance.updated_at_ms = now_ms;
                store.save(&instance)?;
                alerts.notify(
                    Alert::new(
                        AlertSeverity::Critical,
                        COMPONENT,
                        "compensation exhausted retries; manual escalation required",
                        now_ms,
                    )
                    .with_context("instance_id", &instance.instance_id)
                    .with_context("definition", &instance.definition_name)
                    .with_context("step", &step.name)
                    .with_context("attempts", attempts.to_string()),
                );
                return Ok(SagaResult::from_instance(&instance));
            }
        }
    }

    instance.status = SagaStatus::Compensated;
    instance.updated_at_ms = now_ms;
    store.save(&instance)?;
    Ok(SagaResult::from_instance(&instance))
}

fn event(
    instance: &SagaInstance,
    step_index: usize,
    step_name: &str,
    action: ActionKind,
    outcome: &str,
    attempts: u32,
    occurred_at_ms: u64,
) -> SagaEvent {
    SagaEvent {
        instance_id: instance.instance_id.clone(),
        definition_name: instance.definition_name.clone(),
        step_index,
        step_name: step_name.to_string(),
        action,
        outcome: outcome.to_string(),
        attempts,
        occurred_at_ms,
    }
}

fn push_event(journal: &mut Vec<SagaEvent>, capacity: usize, entry: SagaEvent) {
    journal.push(entry);
    if journal.len() > capacity {
        let excess = journal.len() - capacity;
        journal.drain(..excess);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
