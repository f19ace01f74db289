//! Rollback controller: turns health verdicts into policy mutations.
//!
//! Closes the control loop. An `Unsafe` verdict shrinks the operation's
//! new-path percentage through the policy store's CAS write, and every
//! mutation is recorded as a `RollbackEvent` for the audit trail. The
//! controller is idempotent per verdict: re-delivering an already-handled
//! verdict, or any verdict for an operation already at 0%, changes nothing.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::alert::{Alert, AlertSeverity, AlertSink};
use crate::health::{HealthState, HealthVerdict};
use crate::routing_policy::{PolicyDraft, PolicyError, RoutingPolicyStore};

pub const COMPONENT: &str = "rollback_controller";

// ---------------------------------------------------------------------------
// Config and state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackConfig {
    /// Percentage points removed per automatic rollback. The default of 100
    /// cuts traffic to the new path entirely in one step.
    pub rollback_step_pct: u8,
    /// CAS attempts against the policy store before alerting.
    pub max_cas_retries: u32,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            rollback_step_pct: 100,
            max_cas_retries: 5,
        }
    }
}

/// Per-operation controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackState {
    /// No new-path traffic to protect.
    Stable,
    /// New-path traffic flowing, verdicts being watched.
    Watching,
    /// A rollback write is in flight.
    RollingBack,
}

impl fmt::Display for RollbackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stable => f.write_str("stable"),
            Self::Watching => f.write_str("watching"),
            Self::RollingBack => f.write_str("rolling_back"),
        }
    }
}

// ---------------------------------------------------------------------------
// RollbackEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Automatic,
    Manual,
}

impl fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Automatic => f.write_str("automatic"),
            Self::Manual => f.write_str("manual"),
        }
    }
}

/// Audit record of one rollback decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackEvent {
    pub operation_id: String,
    pub previous_percentage: u8,
    pub new_percentage: u8,
    pub triggered_by: TriggeredBy,
    pub reason: String,
    pub occurred_at_ms: u64,
}

// ---------------------------------------------------------------------------
// RollbackController
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RollbackController {
    config: RollbackConfig,
    states: BTreeMap<String, RollbackState>,
    /// High-water mark of handled verdict timestamps per operation, so a
    /// re-delivered verdict cannot trigger a second step down.
    handled_through_ms: BTreeMap<String, u64>,
    events: Vec<RollbackEvent>,
}

impl RollbackController {
    pub fn new(config: RollbackConfig) -> Self {
        Self {
            config,
            states: BTreeMap::new(),
            handled_through_ms: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    pub fn config(&self) -> &RollbackConfig {
        &self.config
    }

    pub fn state(&self, operation_id: &str) -> RollbackState {
        self.states
            .get(operation_id)
            .copied()
            .unwrap_or(RollbackState::Stable)
    }

    /// Full audit trail, oldest first.
    pub fn events(&self) -> &[RollbackEvent] {
        &self.events
    }

    pub fn events_for(&self, operation_id: &str) -> Vec<&RollbackEvent> {
        self.events
            .iter()
            .filter(|event| event.operation_id == operation_id)
            .collect()
    }

    /// React to a health verdict. Only `Unsafe` mutates policy; the returned
    /// event, when present, records the percentage step that was applied.
    pub fn on_verdict(
        &mut self,
        store: &mut RoutingPolicyStore,
        alerts: &mut dyn AlertSink,
        verdict: &HealthVerdict,
        now_ms: u64,
    ) -> Option<RollbackEvent> {
        let operation_id = verdict.operation_id.as_str();
        let snapshot = store.snapshot(operation_id)?;
        let percentage = snapshot.new_path_percentage;

        if verdict.state != HealthState::Unsafe {
            let next = if percentage == 0 {
                RollbackState::Stable
            } else {
                RollbackState::Watching
            };
            self.states.insert(operation_id.to_string(), next);
            return None;
        }

        // Already fully on legacy; an unsafe verdict changes nothing.
        if percentage == 0 {
            self.states
                .insert(operation_id.to_string(), RollbackState::Stable);
            return None;
        }

        // Duplicate delivery of a verdict this controller already acted on.
        let handled = self
            .handled_through_ms
            .get(operation_id)
            .copied()
            .unwrap_or(0);
        if verdict.evaluated_at_ms <= handled && handled > 0 {
            return None;
        }

        self.states
            .insert(operation_id.to_string(), RollbackState::RollingBack);

        let reason = if verdict.reasons.is_empty() {
            "unsafe verdict".to_string()
        } else {
            verdict.reasons.join("; ")
        };

        match self.apply_reduction(store, operation_id, self.config.rollback_step_pct, now_ms) {
            Ok((previous, new_percentage)) => {
                let event = RollbackEvent {
                    operation_id: operation_id.to_string(),
                    previous_percentage: previous,
                    new_percentage,
                    triggered_by: TriggeredBy::Automatic,
                    reason,
                    occurred_at_ms: now_ms,
                };
                self.events.push(event.clone());
                self.handled_through_ms
                    .insert(operation_id.to_string(), verdict.evaluated_at_ms);
                let next = if new_percentage == 0 {
                    RollbackState::Stable
                } else {
                    RollbackState::Watching
                };
                self.states.insert(operation_id.to_string(), next);
                Some(event)
            }
            Err(err) => {
                alerts.notify(
                    Alert::new(
                        AlertSeverity::Critical,
                        COMPONENT,
                        "rollback policy write failed; new path still receiving traffic",
                        now_ms,
                    )
                    .with_context("operation_id", operation_id)
                    .with_context("error", err.to_string()),
                );
                self.states
                    .insert(operation_id.to_string(), RollbackState::Watching);
                None
            }
        }
    }

    /// Operator-initiated rollback to 0%. Always appends a `Manual` audit
    /// event, even when the operation already routes nothing to the new path.
    pub fn force_rollback(
        &mut self,
        store: &mut RoutingPolicyStore,
        operation_id: &str,
        reason: impl Into<String>,
        requested_by: &str,
        now_ms: u64,
    ) -> Result<RollbackEvent, PolicyError> {
        let snapshot = store
            .snapshot(operation_id)
            .ok_or_else(|| PolicyError::UnknownOperation {
                operation_id: operation_id.to_string(),
            })?;
        let previous = snapshot.new_path_percentage;

        if previous > 0 {
            self.write_percentage(store, operation_id, 0, requested_by, now_ms)?;
        }

        let event = RollbackEvent {
            operation_id: operation_id.to_string(),
            previous_percentage: previous,
            new_percentage: 0,
            triggered_by: TriggeredBy::Manual,
            reason: reason.into(),
            occurred_at_ms: now_ms,
        };
        self.events.push(event.clone());
        self.states
            .insert(operation_id.to_string(), RollbackState::Stable);
        Ok(event)
    }

    /// CAS reduction by `step` percentage points, re-reading the snapshot on
    /// every attempt so a racing writer cannot be clobbered.
    fn apply_reduction(
        &self,
        store: &mut RoutingPolicyStore,
        operation_id: &str,
        step: u8,
        now_ms: u64,
    ) -> Result<(u8, u8), PolicyError> {
        let mut last_err = PolicyError::UnknownOperation {
            operation_id: operation_id.to_string(),
        };
        for _ in 0..self.config.max_cas_retries {
            let snapshot =
                store
                    .snapshot(operation_id)
                    .ok_or_else(|| PolicyError::UnknownOperation {
                        operation_id: operation_id.to_string(),
                    })?;
            let previous = snapshot.new_path_percentage;
            let target = previous.saturating_sub(step);
            match self.write_percentage(store, operation_id, target, COMPONENT, now_ms) {
                Ok(()) => return Ok((previous, target)),
                Err(err @ PolicyError::ConcurrentPolicyUpdate { .. }) => last_err = err,
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    fn write_percentage(
        &self,
        store: &mut RoutingPolicyStore,
        operation_id: &str,
        percentage: u8,
        updated_by: &str,
        now_ms: u64,
    ) -> Result<(), PolicyError> {
        let snapshot =
            store
                .snapshot(operation_id)
                .ok_or_else(|| PolicyError::UnknownOperation {
                    operation_id: operation_id.to_string(),
                })?;
        let draft = PolicyDraft {
            operation_id: operation_id.to_string(),
            new_path_percentage: percentage,
            targeting_rules: snapshot.targeting_rules.clone(),
            sticky_by_key: snapshot.sticky_by_key,
        };
        store.set_policy(draft, snapshot.version, updated_by, now_ms)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
