//! Saga data model: definitions, step actions, durable instance state.
//!
//! A `SagaDefinition` is an ordered list of steps, each with a caller-supplied
//! invoke action and an optional compensating action. A `SagaInstance` is the
//! durable record of one run: its status and the ordered log of completed
//! step attempts, enough to re-drive the saga after a crash without repeating
//! committed side effects. Participants must implement invoke actions
//! idempotently; the coordinator delivers at-least-once.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// SagaStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a saga instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Steps are executing forward.
    Running,
    /// Every step succeeded.
    Completed,
    /// A step failed; compensations are unwinding in reverse order.
    Compensating,
    /// All required compensations succeeded.
    Compensated,
    /// A compensation exhausted its retries. Terminal; requires operator
    /// escalation, never silently resolved.
    CompensationFailed,
}

impl SagaStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Compensated | Self::CompensationFailed
        )
    }
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Completed => f.write_str("completed"),
            Self::Compensating => f.write_str("compensating"),
            Self::Compensated => f.write_str("compensated"),
            Self::CompensationFailed => f.write_str("compensation_failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Step actions and outcomes
// ---------------------------------------------------------------------------

/// Whether a record belongs to the forward pass or the unwind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Invoke,
    Compensate,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invoke => f.write_str("invoke"),
            Self::Compensate => f.write_str("compensate"),
        }
    }
}

/// Why a participant call did not succeed. A timeout is handled identically
/// to a failure; the distinction is kept for the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepFailureKind {
    Failed,
    TimedOut,
}

/// Failure reported by a participant action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: StepFailureKind,
    pub detail: String,
}

impl StepFailure {
    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            kind: StepFailureKind::Failed,
            detail: detail.into(),
        }
    }

    pub fn timed_out(detail: impl Into<String>) -> Self {
        Self {
            kind: StepFailureKind::TimedOut,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            StepFailureKind::Failed => write!(f, "failed: {}", self.detail),
            StepFailureKind::TimedOut => write!(f, "timed out: {}", self.detail),
        }
    }
}

/// Recorded result of one step attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success { output: Value },
    Failed { detail: String },
    TimedOut { detail: String },
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn from_failure(failure: &StepFailure) -> Self {
        match failure.kind {
            StepFailureKind::Failed => Self::Failed {
                detail: failure.detail.clone(),
            },
            StepFailureKind::TimedOut => Self::TimedOut {
                detail: failure.detail.clone(),
            },
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success { .. } => f.write_str("success"),
            Self::Failed { detail } => write!(f, "failed: {detail}"),
            Self::TimedOut { detail } => write!(f, "timed_out: {detail}"),
        }
    }
}

// ---------------------------------------------------------------------------
// StepRecord — durable log entry
// ---------------------------------------------------------------------------

/// One entry in a saga instance's completed-steps log. Appended after every
/// step or compensation attempt, before the next action runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_index: usize,
    pub step_name: String,
    pub action: ActionKind,
    pub outcome: StepOutcome,
    /// Participant call attempts behind this record (compensations retry).
    pub attempts: u32,
    pub completed_at_ms: u64,
}

// ---------------------------------------------------------------------------
// SagaInstance
// ---------------------------------------------------------------------------

/// Durable record of one saga run. Owned exclusively by the coordinator;
/// persisted through the migration registry after every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaInstance {
    pub instance_id: String,
    pub definition_name: String,
    pub status: SagaStatus,
    /// The original input, kept so recovery never depends on the caller
    /// re-supplying it.
    pub input: Value,
    pub completed_steps: Vec<StepRecord>,
    /// Diagnostic from the step failure that triggered compensation, if any.
    pub failure: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl SagaInstance {
    pub fn new(
        instance_id: impl Into<String>,
        definition_name: impl Into<String>,
        input: Value,
        now_ms: u64,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            definition_name: definition_name.into(),
            status: SagaStatus::Running,
            input,
            completed_steps: Vec::new(),
            failure: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Output of a successfully recorded invoke at `step_index`, if any.
    pub fn completed_invoke_output(&self, step_index: usize) -> Option<&Value> {
        self.completed_steps.iter().rev().find_map(|record| {
            if record.step_index == step_index && record.action == ActionKind::Invoke {
                match &record.outcome {
                    StepOutcome::Success { output } => Some(output),
                    _ => None,
                }
            } else {
                None
            }
        })
    }

    /// Whether a successful compensation is recorded for `step_index`.
    pub fn is_compensated(&self, step_index: usize) -> bool {
        self.completed_steps.iter().any(|record| {
            record.step_index == step_index
                && record.action == ActionKind::Compensate
                && record.outcome.is_success()
        })
    }

    /// Index of the invoke whose failure triggered compensation, derived from
    /// the step log.
    pub fn failed_invoke_index(&self) -> Option<usize> {
        self.completed_steps.iter().find_map(|record| {
            if record.action == ActionKind::Invoke && !record.outcome.is_success() {
                Some(record.step_index)
            } else {
                None
            }
        })
    }

    /// Number of successfully completed forward steps.
    pub fn completed_invoke_count(&self) -> usize {
        self.completed_steps
            .iter()
            .filter(|r| r.action == ActionKind::Invoke && r.outcome.is_success())
            .count()
    }
}

// ---------------------------------------------------------------------------
// SagaStep / SagaDefinition
// ---------------------------------------------------------------------------

/// Participant invoke action: consumes the previous step's output (or the
/// saga input for step 0) and produces this step's output.
pub type InvokeFn = Box<dyn Fn(&Value) -> Result<Value, StepFailure> + Send + Sync>;

/// Participant compensating action: consumes the step's recorded output and
/// semantically reverses its effect.
pub type CompensateFn = Box<dyn Fn(&Value) -> Result<(), StepFailure> + Send + Sync>;

/// Default per-step participant call timeout.
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 30_000;

/// One step of a saga definition. The actions are opaque caller-supplied
/// functions; the coordinator never inspects their behavior.
pub struct SagaStep {
    pub name: String,
    /// Budget the embedder enforces on the participant call; a participant
    /// reporting `TimedOut` is treated like a failure.
    pub timeout_ms: u64,
    pub invoke: InvokeFn,
    pub compensate: Option<CompensateFn>,
}

impl SagaStep {
    pub fn new(
        name: impl Into<String>,
        invoke: impl Fn(&Value) -> Result<Value, StepFailure> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
            invoke: Box::new(invoke),
            compensate: None,
        }
    }

    pub fn with_compensation(
        mut self,
        compensate: impl Fn(&Value) -> Result<(), StepFailure> + Send + Sync + 'static,
    ) -> Self {
        self.compensate = Some(Box::new(compensate));
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

impl fmt::Debug for SagaStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaStep")
            .field("name", &self.name)
            .field("timeout_ms", &self.timeout_ms)
            .field("has_compensation", &self.compensate.is_some())
            .finish()
    }
}

/// Named, ordered list of saga steps. Steps execute strictly in order;
/// compensations run strictly in reverse order of completed steps.
#[derive(Debug)]
pub struct SagaDefinition {
    pub name: String,
    pub steps: Vec<SagaStep>,
}

impl SagaDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<SagaStep>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
