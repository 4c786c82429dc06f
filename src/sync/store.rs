//! Record store collaborator
//!
//! The engine never owns records. It reads change-sets through
//! [`RecordStore`] and hands admitted payloads back to it. Stores advance
//! `modified_at` through their [`Timeline`]; the engine only compares it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::clock::Clock;
use super::selector::ChangeQuery;
use super::timeline::Timeline;
use super::types::{CollectionStatus, NewRecord, SyncableRecord};

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures raised by a record store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("Record already exists: {collection}/{id}")]
    AlreadyExists { collection: String, id: String },

    #[error("Collection unavailable: {0}")]
    Unavailable(String),

    #[error("Payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt stored timestamp: {0}")]
    CorruptTimestamp(#[from] chrono::ParseError),
}

/// Outcome of a compare-and-set update
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// Payload persisted; carries the new state
    Applied(SyncableRecord),
    /// `modified_at` no longer matched; carries the current state
    Superseded(SyncableRecord),
    /// Record vanished
    Missing,
}

/// Storage owned by the resource's own business logic
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Records matching `query`, ordered by `modified_at` then `id`
    async fn changed_since(
        &self,
        collection: &str,
        query: &ChangeQuery,
    ) -> StoreResult<Vec<SyncableRecord>>;

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<SyncableRecord>>;

    /// Create a record with `created_at == modified_at == now`
    async fn insert(&self, collection: &str, record: NewRecord) -> StoreResult<SyncableRecord>;

    /// Replace the payload only if `modified_at` still equals `expected`
    async fn update_if_unmodified(
        &self,
        collection: &str,
        id: &str,
        expected: DateTime<Utc>,
        payload: Value,
    ) -> StoreResult<UpdateOutcome>;

    /// Record a delivery. Must not touch `modified_at`.
    async fn mark_delivered(
        &self,
        collection: &str,
        ids: &[String],
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn collection_status(&self, collection: &str) -> StoreResult<CollectionStatus>;

    /// Source of every `modified_at` this store writes
    fn timeline(&self) -> &Timeline;
}

/// In-process store, used for tests and embedding
pub struct MemoryRecordStore {
    timeline: Timeline,
    collections: RwLock<HashMap<String, BTreeMap<String, SyncableRecord>>>,
    unavailable: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            timeline: Timeline::new(clock),
            collections: RwLock::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate a storage outage
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn changed_since(
        &self,
        collection: &str,
        query: &ChangeQuery,
    ) -> StoreResult<Vec<SyncableRecord>> {
        self.ensure_available()?;
        let collections = self.collections.read();
        Ok(collections
            .get(collection)
            .map(|records| query.select(records.values()))
            .unwrap_or_default())
    }

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<SyncableRecord>> {
        self.ensure_available()?;
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|records| records.get(id))
            .cloned())
    }

    async fn insert(&self, collection: &str, record: NewRecord) -> StoreResult<SyncableRecord> {
        self.ensure_available()?;
        let id = record.id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut collections = self.collections.write();
        let records = collections.entry(collection.to_string()).or_default();
        if records.contains_key(&id) {
            return Err(StoreError::AlreadyExists {
                collection: collection.to_string(),
                id,
            });
        }

        let stamp = self.timeline.stamp(None);
        let created = SyncableRecord {
            id: id.clone(),
            scope: record.scope,
            payload: record.payload,
            created_at: stamp.at(),
            modified_at: stamp.at(),
            last_synced_at: None,
        };
        records.insert(id, created.clone());
        Ok(created)
    }

    async fn update_if_unmodified(
        &self,
        collection: &str,
        id: &str,
        expected: DateTime<Utc>,
        payload: Value,
    ) -> StoreResult<UpdateOutcome> {
        self.ensure_available()?;

        let mut collections = self.collections.write();
        let Some(record) = collections
            .get_mut(collection)
            .and_then(|records| records.get_mut(id))
        else {
            return Ok(UpdateOutcome::Missing);
        };

        if record.modified_at != expected {
            return Ok(UpdateOutcome::Superseded(record.clone()));
        }

        let stamp = self.timeline.stamp(Some(record.modified_at));
        record.payload = payload;
        record.modified_at = stamp.at();
        Ok(UpdateOutcome::Applied(record.clone()))
    }

    async fn mark_delivered(
        &self,
        collection: &str,
        ids: &[String],
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.ensure_available()?;
        let mut collections = self.collections.write();
        if let Some(records) = collections.get_mut(collection) {
            for id in ids {
                if let Some(record) = records.get_mut(id) {
                    record.last_synced_at = Some(at);
                }
            }
        }
        Ok(())
    }

    async fn collection_status(&self, collection: &str) -> StoreResult<CollectionStatus> {
        self.ensure_available()?;
        let collections = self.collections.read();
        let records = collections.get(collection);

        let count = records.map(|r| r.len() as u64).unwrap_or(0);
        let latest = records.and_then(|r| r.values().map(|rec| rec.modified_at).max());
        let last_synced = records.and_then(|r| r.values().filter_map(|rec| rec.last_synced_at).max());

        Ok(CollectionStatus::new(collection, count, latest, last_synced))
    }

    fn timeline(&self) -> &Timeline {
        &self.timeline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::clock::ManualClock;
    use crate::sync::types::SyncCursor;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 20, 10, 0, 0).unwrap()
    }

    fn setup() -> (Arc<ManualClock>, MemoryRecordStore) {
        let clock = Arc::new(ManualClock::new(start()));
        let store = MemoryRecordStore::new(clock.clone());
        (clock, store)
    }

    fn new_record(id: &str) -> NewRecord {
        NewRecord {
            id: Some(id.to_string()),
            scope: None,
            payload: json!({"name": id}),
        }
    }

    #[tokio::test]
    async fn test_update_advances_modified_at_with_frozen_clock() {
        let (_, store) = setup();
        let created = store.insert("meds", new_record("m1")).await.unwrap();

        let outcome = store
            .update_if_unmodified("meds", "m1", created.modified_at, json!({"name": "new"}))
            .await
            .unwrap();
        let UpdateOutcome::Applied(updated) = outcome else {
            panic!("expected applied, got {:?}", outcome);
        };
        assert_eq!(updated.modified_at, start() + Duration::microseconds(1));
        assert_eq!(store.timeline().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_insert_after_generation_lands_after_it() {
        let (_, store) = setup();
        let generation = store.timeline().generation_instant();
        let created = store.insert("meds", new_record("m1")).await.unwrap();
        assert!(created.modified_at > generation);
        assert_eq!(created.created_at, created.modified_at);
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_ids() {
        let (_, store) = setup();
        store.insert("meds", new_record("m1")).await.unwrap();

        let err = store.insert("meds", new_record("m1")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));

        // Same id in another collection is fine
        store.insert("inventory", new_record("m1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_generates_missing_ids() {
        let (_, store) = setup();
        let created = store
            .insert("meds", NewRecord { id: None, scope: None, payload: json!({}) })
            .await
            .unwrap();
        assert!(!created.id.is_empty());
        assert_eq!(created.created_at, created.modified_at);
    }

    #[tokio::test]
    async fn test_compare_and_set_update() {
        let (clock, store) = setup();
        let created = store.insert("meds", new_record("m1")).await.unwrap();
        clock.advance(Duration::seconds(10));

        let outcome = store
            .update_if_unmodified("meds", "m1", created.modified_at, json!({"name": "new"}))
            .await
            .unwrap();
        let UpdateOutcome::Applied(updated) = outcome else {
            panic!("expected applied, got {:?}", outcome);
        };
        assert_eq!(updated.modified_at, start() + Duration::seconds(10));
        assert_eq!(updated.created_at, created.created_at);

        // The old precondition no longer holds
        let outcome = store
            .update_if_unmodified("meds", "m1", created.modified_at, json!({"name": "stale"}))
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Superseded(updated));

        let outcome = store
            .update_if_unmodified("meds", "ghost", start(), json!({}))
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Missing);
    }

    #[tokio::test]
    async fn test_mark_delivered_keeps_modified_at() {
        let (clock, store) = setup();
        let created = store.insert("meds", new_record("m1")).await.unwrap();
        let delivered_at = clock.advance(Duration::minutes(1));

        store
            .mark_delivered("meds", &["m1".to_string(), "missing".to_string()], delivered_at)
            .await
            .unwrap();

        let record = store.get("meds", "m1").await.unwrap().unwrap();
        assert_eq!(record.modified_at, created.modified_at);
        assert_eq!(record.last_synced_at, Some(delivered_at));
    }

    #[tokio::test]
    async fn test_changed_since_uses_selector() {
        let (clock, store) = setup();
        store.insert("meds", new_record("m1")).await.unwrap();
        let cursor = clock.advance(Duration::seconds(1));
        clock.advance(Duration::seconds(1));
        store.insert("meds", new_record("m2")).await.unwrap();

        let changed = store
            .changed_since("meds", &ChangeQuery::new(Some(SyncCursor::new(cursor))))
            .await
            .unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].id, "m2");

        let empty = store.changed_since("unknown", &ChangeQuery::default()).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_outage_is_reported() {
        let (_, store) = setup();
        store.set_unavailable(true);
        let err = store.changed_since("meds", &ChangeQuery::default()).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_collection_status() {
        let (clock, store) = setup();
        let status = store.collection_status("meds").await.unwrap();
        assert_eq!(status.record_count, 0);
        assert!(status.latest_modified_at.is_none());

        store.insert("meds", new_record("m1")).await.unwrap();
        let later = clock.advance(Duration::seconds(3));
        store.insert("meds", new_record("m2")).await.unwrap();

        let status = store.collection_status("meds").await.unwrap();
        assert_eq!(status.record_count, 2);
        assert_eq!(status.latest_modified_at, Some(later));
        assert!(status.last_synced_at.is_none());
    }
}
