//! Database schema initialization

use sqlx::SqlitePool;

use crate::sync::StoreResult;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> StoreResult<()> {
    sqlx::query(SCHEMA_SQL).execute(pool).await?;

    Ok(())
}

/// Instants are fixed-width `YYYY-MM-DDTHH:MM:SS.ffffffZ` text, so the
/// BINARY collation orders them chronologically.
const SCHEMA_SQL: &str = r#"
-- Records exposed through sync
CREATE TABLE IF NOT EXISTS sync_records (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    scope TEXT,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    modified_at TEXT NOT NULL,
    last_synced_at TEXT,
    PRIMARY KEY (collection, id),
    CHECK (modified_at >= created_at)
);

-- Change-set selection
CREATE INDEX IF NOT EXISTS idx_sync_records_modified ON sync_records(collection, modified_at, id);
CREATE INDEX IF NOT EXISTS idx_sync_records_scope ON sync_records(collection, scope, modified_at, id);
"#;
