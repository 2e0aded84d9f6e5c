//! Event store write boundary.
//!
//! The store is the sole writer of record; the engine holds a read-only
//! materialized copy driven by the change feed. Writes go through the
//! [`EventStore`] trait: append, partial field patch (used to flip one
//! notification-gate flag), delete, and batched delete with exact
//! partial-failure reporting.

pub mod memory;

pub use memory::MemoryEventStore;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::EngineResult;
use crate::feed::{EventCategory, RawEvent};

/// Partial patch of one record's fields. Nested paths use dots, e.g.
/// `notifiedSteps.step2`.
pub type FieldPatch = Map<String, Value>;

/// Build a one-field patch.
pub fn patch_field(path: &str, value: impl Into<Value>) -> FieldPatch {
    let mut patch = Map::new();
    patch.insert(path.to_string(), value.into());
    patch
}

/// Outcome of a batched mutation. When partial failure is possible the
/// store reports exactly which records succeeded so the host layer can
/// reconcile; a record's notification flags go with it or not at all.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub succeeded: Vec<String>,
    /// Record id plus failure reason.
    pub failed: Vec<(String, String)>,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Async boundary to the event store.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event; the store assigns and returns the id.
    async fn append(
        &self,
        category: EventCategory,
        fields: Map<String, Value>,
    ) -> EngineResult<String>;

    /// Patch a subset of one record's fields.
    async fn update_fields(
        &self,
        category: EventCategory,
        id: &str,
        patch: FieldPatch,
    ) -> EngineResult<()>;

    /// Delete one record.
    async fn delete(&self, category: EventCategory, id: &str) -> EngineResult<()>;

    /// Delete several records as one batch, applied atomically where the
    /// store supports it.
    async fn delete_many(
        &self,
        category: EventCategory,
        ids: &[String],
    ) -> EngineResult<BatchOutcome>;

    /// Export the current full result set for a category.
    async fn export(&self, category: EventCategory) -> EngineResult<Vec<RawEvent>>;
}
