//! In-process event store with live-query snapshots.
//!
//! Backs tests and embedded hosts. Every mutation re-delivers the full
//! result set to the category's subscribers, matching the external store's
//! snapshot-per-change feed behaviour.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{BatchOutcome, EventStore, FieldPatch};
use crate::error::{EngineError, EngineResult};
use crate::feed::{feed_channel, EventCategory, FeedSender, FeedSubscription, RawEvent};

#[derive(Default)]
struct Inner {
    collections: HashMap<EventCategory, Vec<RawEvent>>,
    subscribers: HashMap<EventCategory, Vec<FeedSender>>,
}

/// In-memory [`EventStore`] with uuid-assigned ids.
#[derive(Default)]
pub struct MemoryEventStore {
    inner: Mutex<Inner>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to live snapshots for a category. The current result set
    /// is delivered immediately, then again after every mutation.
    pub async fn subscribe(&self, category: EventCategory) -> FeedSubscription {
        let (sender, subscription) = feed_channel(category, 32);
        // Capture and register under one lock; the send happens after the
        // guard is dropped, like broadcast.
        let snapshot = {
            let mut inner = self.inner.lock().await;
            inner
                .subscribers
                .entry(category)
                .or_default()
                .push(sender.clone());
            inner.collections.get(&category).cloned().unwrap_or_default()
        };
        sender.snapshot(snapshot).await;
        subscription
    }

    /// Export a category's events and atomically clear the collection.
    pub async fn export_and_wipe(&self, category: EventCategory) -> Vec<RawEvent> {
        let exported = {
            let mut inner = self.inner.lock().await;
            inner.collections.remove(&category).unwrap_or_default()
        };
        self.broadcast(category).await;
        exported
    }

    async fn broadcast(&self, category: EventCategory) {
        let (snapshot, senders) = {
            let inner = self.inner.lock().await;
            (
                inner.collections.get(&category).cloned().unwrap_or_default(),
                inner
                    .subscribers
                    .get(&category)
                    .cloned()
                    .unwrap_or_default(),
            )
        };
        let mut live = Vec::new();
        for sender in senders {
            if sender.snapshot(snapshot.clone()).await {
                live.push(sender);
            }
        }
        self.inner.lock().await.subscribers.insert(category, live);
    }
}

/// Apply one dotted-path assignment into a field map, creating
/// intermediate objects as needed.
fn apply_path(fields: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            fields.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = fields
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(nested) = entry {
                apply_path(nested, rest, value);
            }
        }
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(
        &self,
        category: EventCategory,
        fields: Map<String, Value>,
    ) -> EngineResult<String> {
        let id = Uuid::new_v4().to_string();
        {
            let mut inner = self.inner.lock().await;
            inner
                .collections
                .entry(category)
                .or_default()
                .push(RawEvent {
                    id: id.clone(),
                    fields,
                });
        }
        debug!(category = %category, id, "event appended");
        self.broadcast(category).await;
        Ok(id)
    }

    async fn update_fields(
        &self,
        category: EventCategory,
        id: &str,
        patch: FieldPatch,
    ) -> EngineResult<()> {
        {
            let mut inner = self.inner.lock().await;
            let record = inner
                .collections
                .entry(category)
                .or_default()
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or_else(|| EngineError::Store(format!("no record {id} in {category}")))?;
            for (path, value) in patch {
                apply_path(&mut record.fields, &path, value);
            }
        }
        self.broadcast(category).await;
        Ok(())
    }

    async fn delete(&self, category: EventCategory, id: &str) -> EngineResult<()> {
        {
            let mut inner = self.inner.lock().await;
            let collection = inner.collections.entry(category).or_default();
            let before = collection.len();
            collection.retain(|e| e.id != id);
            if collection.len() == before {
                return Err(EngineError::Store(format!("no record {id} in {category}")));
            }
        }
        self.broadcast(category).await;
        Ok(())
    }

    async fn delete_many(
        &self,
        category: EventCategory,
        ids: &[String],
    ) -> EngineResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        {
            // Applied under one lock: the batch is atomic with respect to
            // readers and other writers.
            let mut inner = self.inner.lock().await;
            let collection = inner.collections.entry(category).or_default();
            for id in ids {
                let before = collection.len();
                collection.retain(|e| &e.id != id);
                if collection.len() < before {
                    outcome.succeeded.push(id.clone());
                } else {
                    outcome.failed.push((id.clone(), "not found".to_string()));
                }
            }
        }
        self.broadcast(category).await;
        Ok(outcome)
    }

    async fn export(&self, category: EventCategory) -> EngineResult<Vec<RawEvent>> {
        let inner = self.inner.lock().await;
        Ok(inner.collections.get(&category).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedMessage;
    use crate::store::patch_field;
    use serde_json::json;

    fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_append_assigns_distinct_ids() {
        let store = MemoryEventStore::new();
        let a = store
            .append(EventCategory::Infringement, Map::new())
            .await
            .unwrap();
        let b = store
            .append(EventCategory::Infringement, Map::new())
            .await
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(store.export(EventCategory::Infringement).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_fields_dotted_path() {
        let store = MemoryEventStore::new();
        let id = store
            .append(
                EventCategory::Infringement,
                fields(&[("studentBCEID", json!("S1"))]),
            )
            .await
            .unwrap();

        store
            .update_fields(
                EventCategory::Infringement,
                &id,
                patch_field("notifiedSteps.step2", true),
            )
            .await
            .unwrap();

        let events = store.export(EventCategory::Infringement).await.unwrap();
        assert_eq!(
            events[0].fields["notifiedSteps"]["step2"],
            Value::Bool(true)
        );
    }

    #[tokio::test]
    async fn test_update_missing_record_fails() {
        let store = MemoryEventStore::new();
        let err = store
            .update_fields(
                EventCategory::Infringement,
                "ghost",
                patch_field("notifiedSteps.step1", true),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));
    }

    #[tokio::test]
    async fn test_delete_many_reports_exact_outcome() {
        let store = MemoryEventStore::new();
        let a = store
            .append(EventCategory::OutOfClass, Map::new())
            .await
            .unwrap();
        let b = store
            .append(EventCategory::OutOfClass, Map::new())
            .await
            .unwrap();

        let outcome = store
            .delete_many(
                EventCategory::OutOfClass,
                &[a.clone(), "ghost".to_string(), b.clone()],
            )
            .await
            .unwrap();

        assert_eq!(outcome.succeeded, vec![a, b]);
        assert_eq!(outcome.failed.len(), 1);
        assert!(!outcome.is_complete());
        assert!(store.export(EventCategory::OutOfClass).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_delivers_initial_and_updated_snapshots() {
        let store = MemoryEventStore::new();
        let mut sub = store.subscribe(EventCategory::Affirmation).await;

        match sub.recv().await {
            Some(FeedMessage::Snapshot(events)) => assert!(events.is_empty()),
            other => panic!("expected initial snapshot, got {other:?}"),
        }

        store
            .append(EventCategory::Affirmation, Map::new())
            .await
            .unwrap();
        match sub.recv().await {
            Some(FeedMessage::Snapshot(events)) => assert_eq!(events.len(), 1),
            other => panic!("expected updated snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_current_snapshot_and_updates() {
        let store = MemoryEventStore::new();
        let mut first = store.subscribe(EventCategory::OutOfClass).await;
        store
            .append(EventCategory::OutOfClass, Map::new())
            .await
            .unwrap();

        // A subscriber arriving later still starts from the current set.
        let mut second = store.subscribe(EventCategory::OutOfClass).await;
        match second.recv().await {
            Some(FeedMessage::Snapshot(events)) => assert_eq!(events.len(), 1),
            other => panic!("expected initial snapshot, got {other:?}"),
        }

        // And both keep receiving mutations.
        store
            .append(EventCategory::OutOfClass, Map::new())
            .await
            .unwrap();
        for sub in [&mut first, &mut second] {
            let mut latest = None;
            while let Ok(Some(msg)) =
                tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv()).await
            {
                latest = Some(msg);
            }
            match latest {
                Some(FeedMessage::Snapshot(events)) => assert_eq!(events.len(), 2),
                other => panic!("expected snapshot, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_export_and_wipe() {
        let store = MemoryEventStore::new();
        store
            .append(EventCategory::Infringement, Map::new())
            .await
            .unwrap();

        let exported = store.export_and_wipe(EventCategory::Infringement).await;
        assert_eq!(exported.len(), 1);
        assert!(store.export(EventCategory::Infringement).await.unwrap().is_empty());
    }
}
