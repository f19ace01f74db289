//! Deterministic request-to-bucket assignment and sticky routing decisions.
//!
//! `stable_bucket` maps `(operation, routing key)` to a fixed number in
//! `[0, 100)` that is identical across call order, processes, and restarts,
//! so percentage rollouts are reproducible and auditable. The `Bucketer`
//! layers the decision rule on top: sticky cache, then targeting rules, then
//! the percentage cut-off, falling back to the legacy path when no policy
//! exists.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::routing_policy::{RoutingPolicy, Target};

// ---------------------------------------------------------------------------
// stable_bucket — deterministic hash into [0, 100)
// ---------------------------------------------------------------------------

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a_step(hash: u64, byte: u8) -> u64 {
    (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
}

/// Deterministic bucket number in `[0, 100)` for an (operation, key) pair.
///
/// FNV-1a over the operation id, a zero separator, and the routing key. The
/// separator keeps `("ab", "c")` and `("a", "bc")` in independent buckets.
/// Non-cryptographic on purpose: stability and speed, not adversarial
/// resistance.
pub fn stable_bucket(operation_id: &str, routing_key: &str) -> u8 {
    let mut hash = FNV_OFFSET;
    for &byte in operation_id.as_bytes() {
        hash = fnv1a_step(hash, byte);
    }
    hash = fnv1a_step(hash, 0);
    for &byte in routing_key.as_bytes() {
        hash = fnv1a_step(hash, byte);
    }
    (hash % 100) as u8
}

// ---------------------------------------------------------------------------
// RoutingDecision
// ---------------------------------------------------------------------------

/// Which clause of the decision rule produced a routing decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// Pinned by a prior decision under a sticky policy.
    Sticky,
    /// Forced by a matching targeting rule.
    TargetingRule { rule_id: String },
    /// Percentage cut-off on the stable bucket number.
    Percentage,
    /// No policy for the operation; fail safe toward the proven path.
    FallbackLegacy,
}

impl fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sticky => f.write_str("sticky"),
            Self::TargetingRule { rule_id } => write!(f, "targeting_rule:{rule_id}"),
            Self::Percentage => f.write_str("percentage"),
            Self::FallbackLegacy => f.write_str("fallback_legacy"),
        }
    }
}

/// Outcome of one routing call. Derived, not persisted, except for the sticky
/// cache entry it may leave behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub operation_id: String,
    pub routing_key: String,
    pub target: Target,
    pub policy_version: u64,
    pub decided_at_ms: u64,
    pub source: DecisionSource,
}

// ---------------------------------------------------------------------------
// Bucketer
// ---------------------------------------------------------------------------

/// The routing decision engine. Holds the sticky cache; policy snapshots are
/// passed in by the caller so routing never blocks on the policy store.
#[derive(Debug, Default)]
pub struct Bucketer {
    /// operation id -> routing key -> pinned target.
    sticky: BTreeMap<String, BTreeMap<String, Target>>,
}

impl Bucketer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide the target for one request. Infallible: an absent policy routes
    /// to Legacy rather than erroring.
    ///
    /// Precedence: sticky cache entry (when the policy is sticky), then the
    /// first matching targeting rule, then the percentage cut-off. Stickiness
    /// deliberately wins over a later-added targeting rule; evict the key to
    /// force re-evaluation.
    pub fn route(
        &mut self,
        policy: Option<&RoutingPolicy>,
        operation_id: &str,
        routing_key: &str,
        context: &BTreeMap<String, String>,
        now_ms: u64,
    ) -> RoutingDecision {
        let Some(policy) = policy else {
            return RoutingDecision {
                operation_id: operation_id.to_string(),
                routing_key: routing_key.to_string(),
                target: Target::Legacy,
                policy_version: 0,
                decided_at_ms: now_ms,
                source: DecisionSource::FallbackLegacy,
            };
        };

        if policy.sticky_by_key {
            if let Some(&target) = self
                .sticky
                .get(operation_id)
                .and_then(|keys| keys.get(routing_key))
            {
                return RoutingDecision {
                    operation_id: operation_id.to_string(),
                    routing_key: routing_key.to_string(),
                    target,
                    policy_version: policy.version,
                    decided_at_ms: now_ms,
                    source: DecisionSource::Sticky,
                };
            }
        }

        let (target, source) = match policy
            .targeting_rules
            .iter()
            .find(|rule| rule.rule_match.matches(routing_key, context))
        {
            Some(rule) => (
                rule.target,
                DecisionSource::TargetingRule {
                    rule_id: rule.rule_id.clone(),
                },
            ),
            None => {
                let bucket = stable_bucket(operation_id, routing_key);
                let target = if bucket < policy.new_path_percentage {
                    Target::New
                } else {
                    Target::Legacy
                };
                (target, DecisionSource::Percentage)
            }
        };

        if policy.sticky_by_key {
            self.sticky
                .entry(operation_id.to_string())
                .or_default()
                .insert(routing_key.to_string(), target);
        }

        RoutingDecision {
            operation_id: operation_id.to_string(),
            routing_key: routing_key.to_string(),
            target,
            policy_version: policy.version,
            decided_at_ms: now_ms,
            source,
        }
    }

    /// Drop the pinned decision for one key, forcing re-evaluation on the
    /// next call.
    pub fn evict_key(&mut self, operation_id: &str, routing_key: &str) -> bool {
        self.sticky
            .get_mut(operation_id)
            .map(|keys| keys.remove(routing_key).is_some())
            .unwrap_or(false)
    }

    /// Drop every pinned decision for an operation, e.g. when its migration
    /// completes or is abandoned.
    pub fn evict_operation(&mut self, operation_id: &str) -> usize {
        self.sticky
            .remove(operation_id)
            .map(|keys| keys.len())
            .unwrap_or(0)
    }

    /// Number of pinned keys for an operation.
    pub fn sticky_len(&self, operation_id: &str) -> usize {
        self.sticky
            .get(operation_id)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
