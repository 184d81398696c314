//! Persisted saga state.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of one saga execution.
///
/// ```text
/// Running ──all steps ok──> Completed
///    │
///    └─step failed─> Compensating ──all compensations ok──> Compensated
///                         │
///                         └────any compensation failed────> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Running,
    Completed,
    Compensating,
    Compensated,
    Failed,
}

/// One persisted saga instance.
///
/// The correlation id is stable for the life of the saga and is the lookup
/// key. The version is bumped by exactly one on every successful save and
/// backs optimistic concurrency; a fresh instance starts at 0 and reaches 1
/// on its first save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaInstance {
    pub correlation_id: Uuid,
    pub conversation_id: Option<Uuid>,
    /// Opaque application state, serialized by the saga's own handlers.
    pub payload: serde_json::Value,
    pub status: Option<SagaStatus>,
    pub version: u64,
}

impl SagaInstance {
    /// Seed a new instance for a freshly started saga.
    pub fn new(correlation_id: Uuid, conversation_id: Option<Uuid>) -> Self {
        Self {
            correlation_id,
            conversation_id,
            payload: serde_json::Value::Null,
            status: Some(SagaStatus::Running),
            version: 0,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == Some(SagaStatus::Completed)
    }
}
