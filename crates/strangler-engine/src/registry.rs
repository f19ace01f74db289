//! Migration registry: the durable-storage port for saga instances.
//!
//! The coordinator persists every instance transition through this boundary
//! before attempting the next action, so after a crash the visible state lags
//! the true world state by at most one in-flight step. The interface is
//! store-agnostic and deterministic: stable listing order, whole-record
//! writes, no partial updates.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::saga::SagaInstance;

// ---------------------------------------------------------------------------
// RegistryError
// ---------------------------------------------------------------------------

/// Failure of the storage collaborator. Surfaced to `execute`/`recover`
/// callers, never swallowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryError {
    StoreUnavailable { detail: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StoreUnavailable { detail } => write!(f, "migration store unavailable: {detail}"),
        }
    }
}

impl std::error::Error for RegistryError {}

// ---------------------------------------------------------------------------
// MigrationStore — the outbound storage port
// ---------------------------------------------------------------------------

/// Durable storage port for saga instances. Implementations back this with
/// any transactional key/document store; the in-memory implementation below
/// is the reference and test double.
pub trait MigrationStore {
    /// Persist the full instance record, replacing any prior version.
    fn save(&mut self, instance: &SagaInstance) -> Result<(), RegistryError>;

    /// Load an instance by id.
    fn load(&self, instance_id: &str) -> Result<Option<SagaInstance>, RegistryError>;

    /// Ids of all non-terminal instances, in deterministic order. Feeds crash
    /// reconciliation: an embedder re-drives each through `recover`.
    fn list_unfinished(&self) -> Result<Vec<String>, RegistryError>;
}

// ---------------------------------------------------------------------------
// InMemoryMigrationStore
// ---------------------------------------------------------------------------

/// BTreeMap-backed reference implementation.
#[derive(Debug, Default)]
pub struct InMemoryMigrationStore {
    instances: BTreeMap<String, SagaInstance>,
}

impl InMemoryMigrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl MigrationStore for InMemoryMigrationStore {
    fn save(&mut self, instance: &SagaInstance) -> Result<(), RegistryError> {
        self.instances
            .insert(instance.instance_id.clone(), instance.clone());
        Ok(())
    }

    fn load(&self, instance_id: &str) -> Result<Option<SagaInstance>, RegistryError> {
        Ok(self.instances.get(instance_id).cloned())
    }

    fn list_unfinished(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self
            .instances
            .values()
            .filter(|instance| !instance.is_terminal())
            .map(|instance| instance.instance_id.clone())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::SagaStatus;
    use serde_json::Value;

    fn instance(id: &str, status: SagaStatus) -> SagaInstance {
        let mut inst = SagaInstance::new(id, "transfer", Value::Null, 0);
        inst.status = status;
        inst
    }

    #[test]
    fn save_then_load_roundtrip() {
        let mut store = InMemoryMigrationStore::new();
        let inst = instance("i1", SagaStatus::Running);
        store.save(&inst).unwrap();
        assert_eq!(store.load("i1").unwrap(), Some(inst));
        assert_eq!(store.load("ghost").unwrap(), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn save_replaces_prior_record() {
        let mut store = InMemoryMigrationStore::new();
        store.save(&instance("i1", SagaStatus::Running)).unwrap();
        store.save(&instance("i1", SagaStatus::Completed)).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.load("i1").unwrap().unwrap().status,
            SagaStatus::Completed
        );
    }

    #[test]
    fn list_unfinished_excludes_terminal_states() {
        let mut store = InMemoryMigrationStore::new();
        store.save(&instance("a", SagaStatus::Completed)).unwrap();
        store.save(&instance("b", SagaStatus::Running)).unwrap();
        store
            .save(&instance("c", SagaStatus::Compensating))
            .unwrap();
        store.save(&instance("d", SagaStatus::Compensated)).unwrap();
        store
            .save(&instance("e", SagaStatus::CompensationFailed))
            .unwrap();

        assert_eq!(store.list_unfinished().unwrap(), vec!["b", "c"]);
    }

    #[test]
    fn list_unfinished_deterministic_order() {
        let mut store = InMemoryMigrationStore::new();
        store.save(&instance("zeta", SagaStatus::Running)).unwrap();
        store.save(&instance("alpha", SagaStatus::Running)).unwrap();
        assert_eq!(store.list_unfinished().unwrap(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn error_display_and_serde() {
        let err = RegistryError::StoreUnavailable {
            detail: "connection refused".to_string(),
        };
        assert!(err.to_string().contains("connection refused"));
        let json = serde_json::to_string(&err).unwrap();
        let restored: RegistryError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, restored);
    }
}
