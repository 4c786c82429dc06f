//! Sync data types
//!
//! Defines the values that flow through the engine:
//! - Syncable records and their read-path snapshots
//! - Cursors and cache tokens
//! - Conflict reports for rejected writes
//! - Collection diagnostics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::timestamp::serde_instant;

/// Conflict policy advertised to clients
pub const SYNC_STRATEGY: &str = "server-authoritative";

/// A record exposed through sync.
///
/// The payload is opaque; the engine only reasons about `id`,
/// `created_at` and `modified_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncableRecord {
    pub id: String,
    /// Parent key used by scope filters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub payload: Value,
    #[serde(with = "serde_instant")]
    pub created_at: DateTime<Utc>,
    /// Sole source of truth for change detection and arbitration
    #[serde(with = "serde_instant")]
    pub modified_at: DateTime<Utc>,
    /// Advisory: when the record was last delivered to a client
    #[serde(default, with = "serde_instant::option")]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SyncableRecord {
    /// Read-path view of this record
    pub fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            id: self.id.clone(),
            created_at: self.created_at,
            modified_at: self.modified_at,
            payload: self.payload.clone(),
        }
    }
}

/// A record as it appears inside a change-set.
///
/// Diagnostic fields are left out so that delivery bookkeeping never
/// alters the fingerprint of an otherwise unchanged change-set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSnapshot {
    pub id: String,
    #[serde(with = "serde_instant")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "serde_instant")]
    pub modified_at: DateTime<Utc>,
    pub payload: Value,
}

/// Record creation request forwarded to the owning store
#[derive(Debug, Clone, Deserialize)]
pub struct NewRecord {
    /// Generated when absent
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    pub payload: Value,
}

/// "I have everything up to here"
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SyncCursor(DateTime<Utc>);

impl SyncCursor {
    pub fn new(instant: DateTime<Utc>) -> Self {
        Self(instant)
    }

    pub fn instant(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Opaque cache-validation handle over a change-set
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheToken(String);

impl CacheToken {
    pub(crate) fn from_digest(hex: String) -> Self {
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Strong entity-tag form used in the `ETag` header
    pub fn to_entity_tag(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

/// Kind of write conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    StaleWrite,
}

/// What the client should do after a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecommendedAction {
    RefetchAndRetry,
}

/// Detail returned for a rejected write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    pub kind: ConflictKind,
    #[serde(with = "serde_instant")]
    pub server_modified_at: DateTime<Utc>,
    #[serde(with = "serde_instant")]
    pub client_assumed_modified_at: DateTime<Utc>,
    pub recommended_action: RecommendedAction,
}

impl ConflictReport {
    pub fn stale_write(
        server_modified_at: DateTime<Utc>,
        client_assumed_modified_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: ConflictKind::StaleWrite,
            server_modified_at,
            client_assumed_modified_at,
            recommended_action: RecommendedAction::RefetchAndRetry,
        }
    }
}

/// Coarse state of a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionState {
    Ok,
    NoRecords,
}

/// Diagnostics for a single collection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStatus {
    pub collection: String,
    pub record_count: u64,
    #[serde(with = "serde_instant::option")]
    pub latest_modified_at: Option<DateTime<Utc>>,
    #[serde(with = "serde_instant::option")]
    pub last_synced_at: Option<DateTime<Utc>>,
    pub status: CollectionState,
}

impl CollectionStatus {
    pub fn new(
        collection: &str,
        record_count: u64,
        latest_modified_at: Option<DateTime<Utc>>,
        last_synced_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            collection: collection.to_string(),
            record_count,
            latest_modified_at,
            last_synced_at,
            status: if record_count == 0 {
                CollectionState::NoRecords
            } else {
                CollectionState::Ok
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_conflict_report_wire_format() {
        let report = ConflictReport::stale_write(
            Utc.with_ymd_and_hms(2024, 1, 20, 11, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 20, 10, 0, 0).unwrap(),
        );

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["kind"], "stale-write");
        assert_eq!(json["recommendedAction"], "refetch-and-retry");
        assert_eq!(json["serverModifiedAt"], "2024-01-20T11:00:00.000000Z");
        assert_eq!(json["clientAssumedModifiedAt"], "2024-01-20T10:00:00.000000Z");
    }

    #[test]
    fn test_snapshot_drops_diagnostics() {
        let at = Utc.with_ymd_and_hms(2024, 1, 20, 10, 0, 0).unwrap();
        let record = SyncableRecord {
            id: "r1".to_string(),
            scope: Some("pharmacy-5".to_string()),
            payload: serde_json::json!({"quantity": 3}),
            created_at: at,
            modified_at: at,
            last_synced_at: Some(at),
        };

        let json = serde_json::to_value(record.snapshot()).unwrap();
        assert!(json.get("lastSyncedAt").is_none());
        assert!(json.get("scope").is_none());
        assert_eq!(json["payload"]["quantity"], 3);
    }

    #[test]
    fn test_collection_status_state() {
        assert_eq!(
            CollectionStatus::new("meds", 0, None, None).status,
            CollectionState::NoRecords
        );
        let at = Utc.with_ymd_and_hms(2024, 1, 20, 10, 0, 0).unwrap();
        assert_eq!(
            CollectionStatus::new("meds", 2, Some(at), None).status,
            CollectionState::Ok
        );
    }

    #[test]
    fn test_entity_tag_is_quoted() {
        let token = CacheToken::from_digest("abc123".to_string());
        assert_eq!(token.to_entity_tag(), "\"abc123\"");
        assert_eq!(token.as_str(), "abc123");
    }
}
