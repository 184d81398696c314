//! Saga instance persistence.

use crate::{SagaError, SagaInstance};
use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

/// Storage port for saga instances, keyed by correlation id.
///
/// `save` enforces optimistic concurrency: it succeeds only when the caller's
/// version matches what the store holds (or the instance is new and the
/// caller's version is 0). On success both the stored and the caller's copy
/// advance by one; on a conflict the caller's copy is left untouched and the
/// method returns `false`.
#[async_trait]
pub trait SagaRepository: Send + Sync {
    async fn get(&self, correlation_id: Uuid) -> Result<Option<SagaInstance>, SagaError>;

    /// Persist `instance`, returning whether the write won the version race.
    async fn save(&self, instance: &mut SagaInstance) -> Result<bool, SagaError>;

    async fn delete(&self, correlation_id: Uuid) -> Result<(), SagaError>;
}

/// DashMap-backed repository for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemorySagaRepository {
    instances: DashMap<Uuid, SagaInstance>,
}

impl InMemorySagaRepository {
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

#[async_trait]
impl SagaRepository for InMemorySagaRepository {
    async fn get(&self, correlation_id: Uuid) -> Result<Option<SagaInstance>, SagaError> {
        Ok(self.instances.get(&correlation_id).map(|e| e.clone()))
    }

    async fn save(&self, instance: &mut SagaInstance) -> Result<bool, SagaError> {
        // The entry lock makes the compare-and-bump atomic per correlation id.
        match self.instances.entry(instance.correlation_id) {
            dashmap::Entry::Vacant(vacant) => {
                if instance.version != 0 {
                    return Ok(false);
                }
                instance.version = 1;
                vacant.insert(instance.clone());
                Ok(true)
            }
            dashmap::Entry::Occupied(mut occupied) => {
                if occupied.get().version != instance.version {
                    return Ok(false);
                }
                instance.version += 1;
                occupied.insert(instance.clone());
                Ok(true)
            }
        }
    }

    async fn delete(&self, correlation_id: Uuid) -> Result<(), SagaError> {
        self.instances.remove(&correlation_id);
        Ok(())
    }
}
