//! Sync record database operations

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::sync::timestamp::{decode_stored, format_instant};
use crate::sync::{
    ChangeQuery, Clock, CollectionStatus, NewRecord, RecordStore, StoreError, StoreResult,
    SyncableRecord, Timeline, UpdateOutcome,
};

/// Upper bound on bound parameters per statement
const MAX_IDS_PER_STATEMENT: usize = 500;

/// Database row for a sync record
#[derive(Debug, Clone, sqlx::FromRow)]
struct RecordRow {
    id: String,
    scope: Option<String>,
    payload: String,
    created_at: String,
    modified_at: String,
    last_synced_at: Option<String>,
}

impl RecordRow {
    fn into_record(self) -> StoreResult<SyncableRecord> {
        Ok(SyncableRecord {
            id: self.id,
            scope: self.scope,
            payload: serde_json::from_str(&self.payload)?,
            created_at: decode_stored(&self.created_at)?,
            modified_at: decode_stored(&self.modified_at)?,
            last_synced_at: self
                .last_synced_at
                .as_deref()
                .map(decode_stored)
                .transpose()?,
        })
    }
}

/// SQLite-backed record store
///
/// Stamps stay in flight until their statement returns, so a write blocked
/// on SQLite's write lock is never overtaken by a pull's generation instant.
/// Assumes this process is the only writer to the database.
pub struct SqliteRecordStore {
    pool: SqlitePool,
    timeline: Timeline,
}

impl SqliteRecordStore {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            timeline: Timeline::new(clock),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn changed_since(
        &self,
        collection: &str,
        query: &ChangeQuery,
    ) -> StoreResult<Vec<SyncableRecord>> {
        let sql = format!(
            r#"
            SELECT id, scope, payload, created_at, modified_at, last_synced_at
            FROM sync_records
            WHERE collection = ?{}{}
            "#,
            query.sql_filter(),
            ChangeQuery::SQL_ORDER
        );

        let mut select = sqlx::query_as::<_, RecordRow>(&sql).bind(collection);
        for value in query.sql_binds() {
            select = select.bind(value);
        }

        let rows = select.fetch_all(&self.pool).await?;
        rows.into_iter().map(RecordRow::into_record).collect()
    }

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<SyncableRecord>> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT id, scope, payload, created_at, modified_at, last_synced_at
            FROM sync_records
            WHERE collection = ? AND id = ?
            "#,
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RecordRow::into_record).transpose()
    }

    async fn insert(&self, collection: &str, record: NewRecord) -> StoreResult<SyncableRecord> {
        let id = record.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let payload = serde_json::to_string(&record.payload)?;

        let stamp = self.timeline.stamp(None);
        let now = format_instant(stamp.at());

        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            INSERT INTO sync_records (collection, id, scope, payload, created_at, modified_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(collection, id) DO NOTHING
            RETURNING id, scope, payload, created_at, modified_at, last_synced_at
            "#,
        )
        .bind(collection)
        .bind(&id)
        .bind(&record.scope)
        .bind(&payload)
        .bind(&now)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;
        drop(stamp);

        match row {
            Some(row) => row.into_record(),
            None => Err(StoreError::AlreadyExists {
                collection: collection.to_string(),
                id,
            }),
        }
    }

    async fn update_if_unmodified(
        &self,
        collection: &str,
        id: &str,
        expected: DateTime<Utc>,
        payload: Value,
    ) -> StoreResult<UpdateOutcome> {
        let payload = serde_json::to_string(&payload)?;
        let stamp = self.timeline.stamp(Some(expected));

        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            UPDATE sync_records
            SET payload = ?, modified_at = ?
            WHERE collection = ? AND id = ? AND modified_at = ?
            RETURNING id, scope, payload, created_at, modified_at, last_synced_at
            "#,
        )
        .bind(&payload)
        .bind(format_instant(stamp.at()))
        .bind(collection)
        .bind(id)
        .bind(format_instant(expected))
        .fetch_optional(&self.pool)
        .await?;
        drop(stamp);

        if let Some(row) = row {
            return Ok(UpdateOutcome::Applied(row.into_record()?));
        }

        // Either gone or changed underneath us
        Ok(match self.get(collection, id).await? {
            Some(current) => UpdateOutcome::Superseded(current),
            None => UpdateOutcome::Missing,
        })
    }

    async fn mark_delivered(
        &self,
        collection: &str,
        ids: &[String],
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let at = format_instant(at);

        for chunk in ids.chunks(MAX_IDS_PER_STATEMENT) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "UPDATE sync_records SET last_synced_at = ? WHERE collection = ? AND id IN ({})",
                placeholders
            );

            let mut update = sqlx::query(&sql).bind(at.as_str()).bind(collection);
            for id in chunk {
                update = update.bind(id.as_str());
            }
            update.execute(&self.pool).await?;
        }

        Ok(())
    }

    async fn collection_status(&self, collection: &str) -> StoreResult<CollectionStatus> {
        let (count, latest, last_synced): (i64, Option<String>, Option<String>) = sqlx::query_as(
            r#"
            SELECT COUNT(*), MAX(modified_at), MAX(last_synced_at)
            FROM sync_records
            WHERE collection = ?
            "#,
        )
        .bind(collection)
        .fetch_one(&self.pool)
        .await?;

        Ok(CollectionStatus::new(
            collection,
            count.max(0) as u64,
            latest.as_deref().map(decode_stored).transpose()?,
            last_synced.as_deref().map(decode_stored).transpose()?,
        ))
    }

    fn timeline(&self) -> &Timeline {
        &self.timeline
    }
}
