//! Sync engine
//!
//! Wires the components together for one request at a time. The engine holds
//! no per-client state; everything it needs arrives with the request or lives
//! in the record store.

use std::sync::Arc;

use serde_json::{Map, Value};

use super::arbiter::{ClientAheadPolicy, ConflictArbiter, WriteOutcome};
use super::envelope::{ReadEnvelope, StrategyInfo, WriteEnvelope};
use super::fingerprint::{fingerprint, should_serve_full};
use super::selector::ChangeQuery;
use super::store::RecordStore;
use super::timestamp;
use super::types::{CollectionStatus, NewRecord, RecordSnapshot, SyncCursor, SyncableRecord};
use crate::error::{AppError, InvalidField, InvalidReason, Result};

/// Body key carrying the write precondition
pub const ASSUMED_MODIFIED_AT: &str = "assumedModifiedAt";

/// Reserved path segments that cannot name a collection
const RESERVED_COLLECTIONS: &[&str] = &["status"];

/// A pull
#[derive(Debug, Clone, Default)]
pub struct ReadRequest {
    pub collection: String,
    /// Raw cursor as sent by the client
    pub cursor: Option<String>,
    pub scope: Option<String>,
    /// Raw `If-None-Match` header value
    pub if_none_match: Option<String>,
}

/// A conditional write
#[derive(Debug, Clone, Default)]
pub struct WriteRequest {
    pub collection: String,
    pub id: String,
    /// `{ assumedModifiedAt, ...payload }`
    pub body: Map<String, Value>,
}

/// Incremental sync engine over a record store
///
/// Every instant comes from the store's timeline, so cursors, future checks
/// and write stamps share one ordering.
pub struct SyncEngine<S: ?Sized> {
    store: Arc<S>,
    arbiter: ConflictArbiter,
}

impl<S: RecordStore + ?Sized> SyncEngine<S> {
    pub fn new(store: Arc<S>, client_ahead: ClientAheadPolicy) -> Self {
        Self {
            store,
            arbiter: ConflictArbiter::new(client_ahead),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Validate a raw cursor; absent or blank means bootstrap
    pub fn parse_cursor(&self, raw: Option<&str>) -> Result<Option<SyncCursor>> {
        match raw.filter(|r| !r.is_empty()) {
            None => Ok(None),
            Some(raw) => timestamp::parse(raw, self.store.timeline().now())
                .map(|instant| Some(SyncCursor::new(instant)))
                .map_err(|e| AppError::invalid_timestamp(InvalidField::Cursor, e)),
        }
    }

    /// Read path: codec, selector, fingerprint, cache gate, envelope
    pub async fn read(&self, request: ReadRequest) -> Result<ReadEnvelope> {
        validate_collection(&request.collection)?;
        let cursor = self.parse_cursor(request.cursor.as_deref())?;

        // Captured once, before selection, and handed back verbatim
        let generated_at = self.store.timeline().generation_instant();

        let query = ChangeQuery::new(cursor)
            .with_scope(request.scope)
            .until(generated_at);
        let records = self
            .store
            .changed_since(&request.collection, &query)
            .await?;

        let change_set: Vec<RecordSnapshot> = records.iter().map(SyncableRecord::snapshot).collect();
        let token = fingerprint(&change_set);

        if !should_serve_full(request.if_none_match.as_deref(), &token) {
            tracing::debug!(
                collection = %request.collection,
                etag = %token.as_str(),
                "Change-set unchanged"
            );
            return Ok(ReadEnvelope::not_modified(generated_at, token, change_set.len()));
        }

        tracing::debug!(
            collection = %request.collection,
            cursor = ?query.cursor,
            count = change_set.len(),
            "Serving change-set"
        );

        let ids: Vec<String> = records.into_iter().map(|r| r.id).collect();
        self.record_delivery(&request.collection, &ids).await;

        Ok(ReadEnvelope::full(generated_at, token, change_set))
    }

    /// Write path: codec, arbiter, then persist or report
    pub async fn write(&self, request: WriteRequest) -> Result<WriteEnvelope> {
        validate_collection(&request.collection)?;
        let WriteRequest {
            collection,
            id,
            mut body,
        } = request;

        let assumed = match body.remove(ASSUMED_MODIFIED_AT) {
            None | Some(Value::Null) => {
                return Err(AppError::Validation {
                    field: InvalidField::AssumedModifiedAt,
                    reason: InvalidReason::Missing,
                })
            }
            Some(Value::String(raw)) => timestamp::parse(&raw, self.store.timeline().now())
                .map_err(|e| AppError::invalid_timestamp(InvalidField::AssumedModifiedAt, e))?,
            Some(_) => {
                return Err(AppError::Validation {
                    field: InvalidField::AssumedModifiedAt,
                    reason: InvalidReason::InvalidFormat,
                })
            }
        };

        let record = self
            .store
            .get(&collection, &id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Record not found: {}/{}", collection, id)))?;

        let outcome = self
            .arbiter
            .admit_write(self.store.as_ref(), &collection, &record, assumed, Value::Object(body))
            .await?;

        match outcome {
            WriteOutcome::Admitted(mut persisted) => {
                if let Some(at) = self
                    .record_delivery(&collection, std::slice::from_ref(&persisted.id))
                    .await
                {
                    persisted.last_synced_at = Some(at);
                }
                Ok(WriteEnvelope::Admitted(persisted))
            }
            WriteOutcome::Rejected(report) => Ok(WriteEnvelope::Conflict(report)),
        }
    }

    /// Collaborator plumbing: create a record
    pub async fn create(&self, collection: &str, record: NewRecord) -> Result<SyncableRecord> {
        validate_collection(collection)?;
        if let Some(id) = &record.id {
            if id.is_empty() {
                return Err(AppError::BadRequest("Record id must not be empty".to_string()));
            }
        }

        let created = self.store.insert(collection, record).await?;
        tracing::info!(collection = %collection, id = %created.id, "Record created");
        Ok(created)
    }

    pub async fn collection_status(&self, collection: &str) -> Result<CollectionStatus> {
        validate_collection(collection)?;
        Ok(self.store.collection_status(collection).await?)
    }

    pub fn strategy(&self) -> StrategyInfo {
        let policy = match self.arbiter.client_ahead_policy() {
            ClientAheadPolicy::Admit => "admit",
            ClientAheadPolicy::Reject => "reject",
        };
        StrategyInfo::new(self.store.timeline().now(), policy)
    }

    /// Best effort; delivery bookkeeping never fails a request
    async fn record_delivery(&self, collection: &str, ids: &[String]) -> Option<chrono::DateTime<chrono::Utc>> {
        if ids.is_empty() {
            return None;
        }

        let at = self.store.timeline().now();
        match self.store.mark_delivered(collection, ids, at).await {
            Ok(()) => Some(at),
            Err(e) => {
                tracing::warn!(
                    collection = %collection,
                    count = ids.len(),
                    "Failed to record delivery: {}",
                    e
                );
                None
            }
        }
    }
}

/// 1-64 chars of `[A-Za-z0-9_-]`, starting alphanumeric
pub fn validate_collection(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        && !RESERVED_COLLECTIONS.contains(&name);

    if valid {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!("Invalid collection name: {}", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::clock::{Clock, ManualClock};
    use crate::sync::selector::ChangeQuery;
    use crate::sync::store::{MemoryRecordStore, StoreResult, UpdateOutcome};
    use crate::sync::timeline::Timeline;
    use crate::sync::timestamp::format_instant;
    use crate::sync::types::NewRecord;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use serde_json::json;
    use std::collections::HashMap;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 20, 10, 0, 0).unwrap()
    }

    fn setup() -> (Arc<ManualClock>, Arc<MemoryRecordStore>, SyncEngine<MemoryRecordStore>) {
        let clock = Arc::new(ManualClock::new(start()));
        let store = Arc::new(MemoryRecordStore::new(clock.clone()));
        let engine = SyncEngine::new(store.clone(), ClientAheadPolicy::Admit);
        (clock, store, engine)
    }

    fn pull(cursor: Option<DateTime<Utc>>) -> ReadRequest {
        ReadRequest {
            collection: "inventory".to_string(),
            cursor: cursor.map(format_instant),
            ..Default::default()
        }
    }

    fn write_body(assumed: DateTime<Utc>, payload: Value) -> Map<String, Value> {
        let mut body = payload.as_object().cloned().unwrap_or_default();
        body.insert(ASSUMED_MODIFIED_AT.to_string(), json!(format_instant(assumed)));
        body
    }

    async fn seed(engine: &SyncEngine<MemoryRecordStore>, id: &str, quantity: i64) -> SyncableRecord {
        engine
            .create(
                "inventory",
                NewRecord {
                    id: Some(id.to_string()),
                    scope: None,
                    payload: json!({ "quantity": quantity }),
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_cursor_is_generation_instant_not_max_record() {
        let (clock, _, engine) = setup();
        seed(&engine, "a", 1).await;
        let now = clock.advance(Duration::minutes(10));

        let envelope = engine.read(pull(None)).await.unwrap();
        assert_eq!(envelope.generated_at, now);
        assert_eq!(envelope.count, 1);
    }

    #[tokio::test]
    async fn test_pull_drain_sees_every_write_once() {
        let (clock, _, engine) = setup();
        let mut observed: HashMap<String, Vec<i64>> = HashMap::new();
        let mut cursor = None;
        let mut expected = Vec::new();

        for round in 0..5i64 {
            // A mix of creates and updates between pulls
            for n in 0..3i64 {
                clock.advance(Duration::seconds(1));
                let id = format!("item-{}", n);
                let quantity = round * 10 + n;
                match engine.store().get("inventory", &id).await.unwrap() {
                    None => {
                        seed(&engine, &id, quantity).await;
                    }
                    Some(current) => {
                        let envelope = engine
                            .write(WriteRequest {
                                collection: "inventory".to_string(),
                                id: id.clone(),
                                body: write_body(current.modified_at, json!({ "quantity": quantity })),
                            })
                            .await
                            .unwrap();
                        assert!(matches!(envelope, WriteEnvelope::Admitted(_)));
                    }
                }
                expected.push((id, quantity));
            }

            clock.advance(Duration::seconds(1));
            let envelope = engine.read(pull(cursor)).await.unwrap();
            let records = envelope.change_set.unwrap();
            let mut last = None;
            for snapshot in records {
                if let Some(prev) = last {
                    assert!(snapshot.modified_at >= prev);
                }
                last = Some(snapshot.modified_at);
                observed
                    .entry(snapshot.id.clone())
                    .or_default()
                    .push(snapshot.payload["quantity"].as_i64().unwrap());
            }
            cursor = Some(envelope.generated_at);
        }

        // A final pull with no intervening writes is empty
        clock.advance(Duration::seconds(1));
        let tail = engine.read(pull(cursor)).await.unwrap();
        assert_eq!(tail.count, 0);

        for (id, quantity) in expected {
            let seen = &observed[&id];
            assert_eq!(seen.iter().filter(|q| **q == quantity).count(), 1, "{} {}", id, quantity);
        }
    }

    #[tokio::test]
    async fn test_write_in_generation_instant_is_delivered_once() {
        let (clock, _, engine) = setup();

        // Clock frozen throughout: pull, then create in the same instant
        let bootstrap = engine.read(pull(None)).await.unwrap();
        assert_eq!(bootstrap.count, 0);
        let created = seed(&engine, "a", 1).await;
        assert!(created.modified_at > bootstrap.generated_at);

        let first = engine.read(pull(Some(bootstrap.generated_at))).await.unwrap();
        assert_eq!(first.count, 1);
        let second = engine.read(pull(Some(first.generated_at))).await.unwrap();
        assert_eq!(second.count, 0);

        // Same when the clock moves on before the next pulls
        seed(&engine, "b", 2).await;
        clock.advance(Duration::seconds(5));
        let third = engine.read(pull(Some(second.generated_at))).await.unwrap();
        assert_eq!(third.count, 1);
        let fourth = engine.read(pull(Some(third.generated_at))).await.unwrap();
        assert_eq!(fourth.count, 0);
    }

    #[tokio::test]
    async fn test_update_stamped_ahead_of_clock_is_delivered_once() {
        let (_, store, engine) = setup();
        let created = seed(&engine, "a", 1).await;

        let bootstrap = engine.read(pull(None)).await.unwrap();
        assert_eq!(bootstrap.count, 1);

        // Frozen clock: the update is stamped past it
        let envelope = engine
            .write(WriteRequest {
                collection: "inventory".to_string(),
                id: "a".to_string(),
                body: write_body(created.modified_at, json!({"quantity": 2})),
            })
            .await
            .unwrap();
        let WriteEnvelope::Admitted(updated) = envelope else {
            panic!("expected admitted");
        };
        assert!(updated.modified_at > bootstrap.generated_at);

        let first = engine.read(pull(Some(bootstrap.generated_at))).await.unwrap();
        assert_eq!(first.count, 1);
        assert!(first.generated_at >= updated.modified_at);
        let second = engine.read(pull(Some(first.generated_at))).await.unwrap();
        assert_eq!(second.count, 0);

        // Echoing the server's stamp back is not a future timestamp
        let envelope = engine
            .write(WriteRequest {
                collection: "inventory".to_string(),
                id: "a".to_string(),
                body: write_body(updated.modified_at, json!({"quantity": 3})),
            })
            .await
            .unwrap();
        assert!(matches!(envelope, WriteEnvelope::Admitted(_)));
        assert_eq!(store.timeline().in_flight(), 0);
    }

    /// Store that lands a write while a pull is selecting
    struct RacingStore {
        inner: Arc<MemoryRecordStore>,
        fired: parking_lot::Mutex<bool>,
    }

    #[async_trait]
    impl RecordStore for RacingStore {
        async fn changed_since(&self, collection: &str, query: &ChangeQuery) -> StoreResult<Vec<SyncableRecord>> {
            let snapshot = self.inner.changed_since(collection, query).await?;
            let fire = {
                let mut fired = self.fired.lock();
                !std::mem::replace(&mut *fired, true)
            };
            if fire {
                self.inner
                    .insert(
                        collection,
                        NewRecord {
                            id: Some("late".to_string()),
                            scope: None,
                            payload: json!({"quantity": 99}),
                        },
                    )
                    .await?;
            }
            Ok(snapshot)
        }

        async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<SyncableRecord>> {
            self.inner.get(collection, id).await
        }

        async fn insert(&self, collection: &str, record: NewRecord) -> StoreResult<SyncableRecord> {
            self.inner.insert(collection, record).await
        }

        async fn update_if_unmodified(
            &self,
            collection: &str,
            id: &str,
            expected: DateTime<Utc>,
            payload: Value,
        ) -> StoreResult<UpdateOutcome> {
            self.inner.update_if_unmodified(collection, id, expected, payload).await
        }

        async fn mark_delivered(&self, collection: &str, ids: &[String], at: DateTime<Utc>) -> StoreResult<()> {
            self.inner.mark_delivered(collection, ids, at).await
        }

        async fn collection_status(&self, collection: &str) -> StoreResult<CollectionStatus> {
            self.inner.collection_status(collection).await
        }

        fn timeline(&self) -> &Timeline {
            self.inner.timeline()
        }
    }

    #[tokio::test]
    async fn test_write_during_pull_is_not_skipped() {
        let clock = Arc::new(ManualClock::new(start()));
        let inner = Arc::new(MemoryRecordStore::new(clock.clone()));
        let store = Arc::new(RacingStore {
            inner: inner.clone(),
            fired: parking_lot::Mutex::new(false),
        });
        let engine = SyncEngine::new(store, ClientAheadPolicy::Admit);

        inner
            .insert("inventory", NewRecord { id: Some("early".to_string()), scope: None, payload: json!({}) })
            .await
            .unwrap();
        clock.advance(Duration::seconds(1));

        // The racing insert lands in the generation instant's microsecond
        let first = engine.read(pull(None)).await.unwrap();
        let ids: Vec<String> = first.change_set.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["early".to_string()]);
        assert_eq!(first.generated_at, clock.now());

        let second = engine.read(pull(Some(first.generated_at))).await.unwrap();
        let ids: Vec<String> = second.change_set.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["late".to_string()]);

        let third = engine.read(pull(Some(second.generated_at))).await.unwrap();
        assert_eq!(third.count, 0);
    }

    #[tokio::test]
    async fn test_identical_reads_are_idempotent() {
        let (clock, _, engine) = setup();
        seed(&engine, "a", 1).await;
        seed(&engine, "b", 2).await;
        clock.advance(Duration::seconds(1));

        let first = engine.read(pull(None)).await.unwrap();
        let second = engine.read(pull(None)).await.unwrap();
        assert_eq!(first, second);

        let cached = engine
            .read(ReadRequest {
                if_none_match: Some(first.token.to_entity_tag()),
                ..pull(None)
            })
            .await
            .unwrap();
        assert!(cached.is_not_modified());
        assert_eq!(cached.token, first.token);
    }

    #[tokio::test]
    async fn test_full_serve_marks_delivery() {
        let (clock, store, engine) = setup();
        let created = seed(&engine, "a", 1).await;
        let served_at = clock.advance(Duration::seconds(1));

        engine.read(pull(None)).await.unwrap();

        let record = store.get("inventory", "a").await.unwrap().unwrap();
        assert_eq!(record.last_synced_at, Some(served_at));
        assert_eq!(record.modified_at, created.modified_at);
    }

    #[tokio::test]
    async fn test_stale_write_is_rejected() {
        let (clock, store, engine) = setup();
        let original = seed(&engine, "a", 1).await;
        clock.advance(Duration::minutes(1));

        // Another device updates first
        engine
            .write(WriteRequest {
                collection: "inventory".to_string(),
                id: "a".to_string(),
                body: write_body(original.modified_at, json!({"quantity": 2})),
            })
            .await
            .unwrap();
        let current = store.get("inventory", "a").await.unwrap().unwrap();
        clock.advance(Duration::minutes(1));

        let envelope = engine
            .write(WriteRequest {
                collection: "inventory".to_string(),
                id: "a".to_string(),
                body: write_body(original.modified_at, json!({"quantity": 3})),
            })
            .await
            .unwrap();

        let WriteEnvelope::Conflict(report) = envelope else {
            panic!("expected conflict");
        };
        assert_eq!(report.server_modified_at, current.modified_at);
        assert_eq!(report.client_assumed_modified_at, original.modified_at);

        let after = store.get("inventory", "a").await.unwrap().unwrap();
        assert_eq!(after.payload, current.payload);
        assert_eq!(after.modified_at, current.modified_at);
    }

    #[tokio::test]
    async fn test_write_validation() {
        let (clock, _, engine) = setup();
        seed(&engine, "a", 1).await;

        let missing = engine
            .write(WriteRequest {
                collection: "inventory".to_string(),
                id: "a".to_string(),
                body: Map::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            missing,
            AppError::Validation { field: InvalidField::AssumedModifiedAt, reason: InvalidReason::Missing }
        ));

        let future = engine
            .write(WriteRequest {
                collection: "inventory".to_string(),
                id: "a".to_string(),
                body: write_body(clock.now() + Duration::hours(1), json!({})),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            future,
            AppError::Validation { field: InvalidField::AssumedModifiedAt, reason: InvalidReason::FutureTimestamp }
        ));

        let mut numeric = Map::new();
        numeric.insert(ASSUMED_MODIFIED_AT.to_string(), json!(12345));
        let wrong_type = engine
            .write(WriteRequest {
                collection: "inventory".to_string(),
                id: "a".to_string(),
                body: numeric,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            wrong_type,
            AppError::Validation { reason: InvalidReason::InvalidFormat, .. }
        ));

        let unknown = engine
            .write(WriteRequest {
                collection: "inventory".to_string(),
                id: "ghost".to_string(),
                body: write_body(start(), json!({})),
            })
            .await
            .unwrap_err();
        assert!(matches!(unknown, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_outage_is_not_masked_as_empty() {
        let (_, store, engine) = setup();
        store.set_unavailable(true);
        let err = engine.read(pull(None)).await.unwrap_err();
        assert!(matches!(err, AppError::Store(_)));
    }

    #[test]
    fn test_collection_names() {
        assert!(validate_collection("pharmacy-inventory").is_ok());
        assert!(validate_collection("patients_v2").is_ok());
        assert!(validate_collection("").is_err());
        assert!(validate_collection("_hidden").is_err());
        assert!(validate_collection("status").is_err());
        assert!(validate_collection("a/b").is_err());
        assert!(validate_collection(&"x".repeat(65)).is_err());
    }
}
