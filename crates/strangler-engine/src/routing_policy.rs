//! Rollout policy storage with versioned compare-and-swap updates.
//!
//! The store is the single owner of `RoutingPolicy` records. Writers (the
//! admin surface and the rollback controller) go through `set_policy`, which
//! is a CAS on the policy version; readers take immutable `Arc` snapshots so
//! a concurrent routing call never observes a half-written policy.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Target — the two sides of a migration
// ---------------------------------------------------------------------------

/// Destination of a routed request: the proven legacy path or the new path
/// being migrated to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Legacy,
    New,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => f.write_str("legacy"),
            Self::New => f.write_str("new"),
        }
    }
}

// ---------------------------------------------------------------------------
// TargetingRule — ordered forced overrides
// ---------------------------------------------------------------------------

/// Predicate a targeting rule applies to the routing key and request context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMatch {
    /// Routing key equals the given value exactly.
    KeyEquals(String),
    /// Routing key starts with the given prefix.
    KeyPrefix(String),
    /// Request context carries `key` with exactly `value`.
    ContextEquals { key: String, value: String },
}

impl RuleMatch {
    /// Evaluate the predicate against a routing key and request context.
    pub fn matches(&self, routing_key: &str, context: &BTreeMap<String, String>) -> bool {
        match self {
            Self::KeyEquals(value) => routing_key == value,
            Self::KeyPrefix(prefix) => routing_key.starts_with(prefix.as_str()),
            Self::ContextEquals { key, value } => {
                context.get(key).map(String::as_str) == Some(value.as_str())
            }
        }
    }
}

/// A forced-target override. Rules are evaluated in list order; the first
/// match wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetingRule {
    pub rule_id: String,
    pub rule_match: RuleMatch,
    pub target: Target,
}

// ---------------------------------------------------------------------------
// RoutingPolicy
// ---------------------------------------------------------------------------

/// Per-operation rollout policy. Immutable once stored; updates replace the
/// whole record under a bumped version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    pub operation_id: String,
    /// Share of traffic routed to the new path, 0..=100.
    pub new_path_percentage: u8,
    pub targeting_rules: Vec<TargetingRule>,
    /// When set, the first decision for a routing key is pinned for the
    /// lifetime of the migration.
    pub sticky_by_key: bool,
    /// Monotonic version counter; CAS expectation for the next update.
    pub version: u64,
    pub updated_at_ms: u64,
    pub updated_by: String,
}

/// Caller-supplied fields for a policy write. Version and audit metadata are
/// assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDraft {
    pub operation_id: String,
    pub new_path_percentage: u8,
    pub targeting_rules: Vec<TargetingRule>,
    pub sticky_by_key: bool,
}

impl PolicyDraft {
    /// Draft with no overrides and stickiness off.
    pub fn percentage_only(operation_id: impl Into<String>, new_path_percentage: u8) -> Self {
        Self {
            operation_id: operation_id.into(),
            new_path_percentage,
            targeting_rules: Vec::new(),
            sticky_by_key: false,
        }
    }
}

// ---------------------------------------------------------------------------
// PolicyError
// ---------------------------------------------------------------------------

/// Errors from policy store operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyError {
    /// Percentage outside 0..=100, rejected at write time.
    PercentageOutOfRange { percentage: u8 },
    /// CAS expectation did not match the stored version.
    ConcurrentPolicyUpdate {
        operation_id: String,
        expected_version: u64,
        current_version: u64,
    },
    /// Operation id is empty or blank.
    EmptyOperationId,
    /// No policy exists for the operation.
    UnknownOperation { operation_id: String },
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PercentageOutOfRange { percentage } => {
                write!(f, "percentage {percentage} outside 0..=100")
            }
            Self::ConcurrentPolicyUpdate {
                operation_id,
                expected_version,
                current_version,
            } => write!(
                f,
                "concurrent policy update on '{operation_id}': expected version \
                 {expected_version}, current {current_version}"
            ),
            Self::EmptyOperationId => f.write_str("operation id is empty"),
            Self::UnknownOperation { operation_id } => {
                write!(f, "no policy for operation '{operation_id}'")
            }
        }
    }
}

impl std::error::Error for PolicyError {}

// ---------------------------------------------------------------------------
// RoutingPolicyStore
// ---------------------------------------------------------------------------

/// Owner of all routing policies. One record per operation id, copy-on-write
/// snapshots for readers, CAS-protected writes.
#[derive(Debug, Default)]
pub struct RoutingPolicyStore {
    policies: BTreeMap<String, Arc<RoutingPolicy>>,
}

impl RoutingPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// CAS write. `expected_version` must equal the stored version (0 when no
    /// policy exists yet). On success the stored version is bumped by one and
    /// the new snapshot is returned.
    pub fn set_policy(
        &mut self,
        draft: PolicyDraft,
        expected_version: u64,
        updated_by: impl Into<String>,
        now_ms: u64,
    ) -> Result<Arc<RoutingPolicy>, PolicyError> {
        if draft.operation_id.trim().is_empty() {
            return Err(PolicyError::EmptyOperationId);
        }
        if draft.new_path_percentage > 100 {
            return Err(PolicyError::PercentageOutOfRange {
                percentage: draft.new_path_percentage,
            });
        }
        let current_version = self.version(&draft.operation_id);
        if expected_version != current_version {
            return Err(PolicyError::ConcurrentPolicyUpdate {
                operation_id: draft.operation_id,
                expected_version,
                current_version,
            });
        }
        let policy = Arc::new(RoutingPolicy {
            operation_id: draft.operation_id.clone(),
            new_path_percentage: draft.new_path_percentage,
            targeting_rules: draft.targeting_rules,
            sticky_by_key: draft.sticky_by_key,
            version: current_version + 1,
            updated_at_ms: now_ms,
            updated_by: updated_by.into(),
        });
        self.policies.insert(draft.operation_id, Arc::clone(&policy));
        Ok(policy)
    }

    /// Immutable snapshot of the current policy, if any. Cheap to clone and
    /// safe to hold across a policy update.
    pub fn snapshot(&self, operation_id: &str) -> Option<Arc<RoutingPolicy>> {
        self.policies.get(operation_id).map(Arc::clone)
    }

    /// Current version for the operation; 0 when no policy exists.
    pub fn version(&self, operation_id: &str) -> u64 {
        self.policies
            .get(operation_id)
            .map(|p| p.version)
            .unwrap_or(0)
    }

    /// All operation ids with a policy, in deterministic order.
    pub fn operation_ids(&self) -> Vec<String> {
        self.policies.keys().cloned().collect()
    }

    /// Serializable dump of every policy, for the durable storage
    /// collaborator.
    pub fn export(&self) -> Vec<RoutingPolicy> {
        self.policies
            .values()
            .map(|p| RoutingPolicy::clone(p))
            .collect()
    }

    /// Rebuild a store from exported policies. Validates each record the same
    /// way `set_policy` does, preserving versions.
    pub fn restore(policies: Vec<RoutingPolicy>) -> Result<Self, PolicyError> {
        let mut store = Self::new();
        for policy in policies {
            if policy.operation_id.trim().is_empty() {
                return Err(PolicyError::EmptyOperationId);
            }
            if policy.new_path_percentage > 100 {
                return Err(PolicyError::PercentageOutOfRange {
                    percentage: policy.new_path_percentage,
                });
            }
            store
                .policies
                .insert(policy.operation_id.clone(), Arc::new(policy));
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
