//! Sync envelopes
//!
//! Assembles what goes back to the client after a pull or a write:
//! - Read: change-set (omitted on cache hit), next cursor, count, token
//! - Write: persisted record or conflict report
//!
//! Both carry the conflict strategy header so clients can discover policy.

use axum::{
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::timestamp::{format_instant, serde_instant};
use super::types::{CacheToken, ConflictReport, RecordSnapshot, SyncableRecord, SYNC_STRATEGY};

/// Next cursor for the client
pub const X_SYNC_CURSOR: HeaderName = HeaderName::from_static("x-sync-cursor");
/// Number of records in the change-set
pub const X_RECORD_COUNT: HeaderName = HeaderName::from_static("x-record-count");
/// Conflict resolution strategy
pub const X_SYNC_STRATEGY: HeaderName = HeaderName::from_static("x-sync-strategy");

/// Response to a pull
#[derive(Debug, Clone, PartialEq)]
pub struct ReadEnvelope {
    /// Captured before selection; becomes the client's next cursor
    pub generated_at: DateTime<Utc>,
    pub token: CacheToken,
    pub count: usize,
    /// `None` when the client's token matched
    pub change_set: Option<Vec<RecordSnapshot>>,
}

impl ReadEnvelope {
    pub fn full(generated_at: DateTime<Utc>, token: CacheToken, change_set: Vec<RecordSnapshot>) -> Self {
        Self {
            generated_at,
            token,
            count: change_set.len(),
            change_set: Some(change_set),
        }
    }

    pub fn not_modified(generated_at: DateTime<Utc>, token: CacheToken, count: usize) -> Self {
        Self {
            generated_at,
            token,
            count,
            change_set: None,
        }
    }

    pub fn is_not_modified(&self) -> bool {
        self.change_set.is_none()
    }
}

/// JSON body of a full pull
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadBody {
    pub records: Vec<RecordSnapshot>,
    #[serde(with = "serde_instant")]
    pub cursor: DateTime<Utc>,
    pub count: usize,
    pub etag: String,
}

impl IntoResponse for ReadEnvelope {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(header::ETAG, header_value(&self.token.to_entity_tag()));
        headers.insert(X_SYNC_CURSOR, header_value(&format_instant(self.generated_at)));
        headers.insert(X_SYNC_STRATEGY, HeaderValue::from_static(SYNC_STRATEGY));

        match self.change_set {
            None => (StatusCode::NOT_MODIFIED, headers).into_response(),
            Some(records) => {
                headers.insert(X_RECORD_COUNT, HeaderValue::from(self.count));
                let body = ReadBody {
                    records,
                    cursor: self.generated_at,
                    count: self.count,
                    etag: self.token.as_str().to_string(),
                };
                (StatusCode::OK, headers, Json(body)).into_response()
            }
        }
    }
}

/// Response to a write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteEnvelope {
    Admitted(SyncableRecord),
    Conflict(ConflictReport),
}

impl IntoResponse for WriteEnvelope {
    fn into_response(self) -> Response {
        let strategy = [(X_SYNC_STRATEGY, HeaderValue::from_static(SYNC_STRATEGY))];
        match self {
            WriteEnvelope::Admitted(record) => (StatusCode::OK, strategy, Json(record)).into_response(),
            WriteEnvelope::Conflict(report) => {
                (StatusCode::CONFLICT, strategy, Json(report)).into_response()
            }
        }
    }
}

/// Machine-readable description of the sync contract
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyInfo {
    #[serde(with = "serde_instant")]
    pub server_time: DateTime<Utc>,
    pub sync_strategy: StrategyDescription,
    pub supported_parameters: SupportedParameters,
    pub headers: HeaderDescriptions,
    pub conflict_handling: ConflictHandling,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyDescription {
    pub strategy: &'static str,
    pub description: &'static str,
    pub client_ahead_policy: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedParameters {
    pub cursor: &'static str,
    pub scope: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeaderDescriptions {
    #[serde(rename = "ETag")]
    pub etag: &'static str,
    #[serde(rename = "If-None-Match")]
    pub if_none_match: &'static str,
    #[serde(rename = "X-Sync-Cursor")]
    pub sync_cursor: &'static str,
    #[serde(rename = "X-Record-Count")]
    pub record_count: &'static str,
    #[serde(rename = "X-Sync-Strategy")]
    pub sync_strategy: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictHandling {
    pub kind: &'static str,
    pub http_status: u16,
    pub recommended_action: &'static str,
    pub precondition_field: &'static str,
}

impl StrategyInfo {
    pub fn new(server_time: DateTime<Utc>, client_ahead_policy: &'static str) -> Self {
        Self {
            server_time,
            sync_strategy: StrategyDescription {
                strategy: SYNC_STRATEGY,
                description: "Server data is the source of truth; stale writes are rejected, never merged.",
                client_ahead_policy,
            },
            supported_parameters: SupportedParameters {
                cursor: "ISO-8601 instant with offset (e.g. 2024-01-20T10:00:00Z); percent-encode '+' in offsets as %2B; omit for a full pull",
                scope: "Optional parent key restricting the change-set",
            },
            headers: HeaderDescriptions {
                etag: "Fingerprint of the change-set",
                if_none_match: "Previously received ETag; a match yields 304 Not Modified",
                sync_cursor: "Generation instant to send as the next cursor",
                record_count: "Number of records in the change-set",
                sync_strategy: "Conflict resolution approach",
            },
            conflict_handling: ConflictHandling {
                kind: "stale-write",
                http_status: StatusCode::CONFLICT.as_u16(),
                recommended_action: "refetch-and-retry",
                precondition_field: "assumedModifiedAt",
            },
        }
    }
}

fn header_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or_else(|_| HeaderValue::from_static(""))
}
