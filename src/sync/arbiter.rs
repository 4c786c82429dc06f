//! Conflict arbitration for writes
//!
//! Server-authoritative: a write is admitted only when the client proves it
//! saw the record's current version. Nothing is merged and nothing is queued;
//! a stale client must refetch and retry.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::store::{RecordStore, StoreError, StoreResult, UpdateOutcome};
use super::types::{ConflictReport, SyncableRecord};

/// What to do when the client claims a version newer than the server's
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientAheadPolicy {
    /// Fail open: treat as a match, log an anomaly
    #[default]
    Admit,
    /// Refuse with a conflict report
    Reject,
}

impl std::str::FromStr for ClientAheadPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admit" => Ok(Self::Admit),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown client-ahead policy: {}", other)),
        }
    }
}

/// Result of comparing timestamps, before anything is persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    /// Client is ahead of the server; admitted under [`ClientAheadPolicy::Admit`]
    AdmitClientAhead,
    Reject(ConflictReport),
}

/// Final outcome of a write attempt
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Admitted(SyncableRecord),
    Rejected(ConflictReport),
}

impl WriteOutcome {
    pub fn into_result(self) -> Result<SyncableRecord, ConflictReport> {
        match self {
            WriteOutcome::Admitted(record) => Ok(record),
            WriteOutcome::Rejected(report) => Err(report),
        }
    }
}

/// Decides whether a write may proceed
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictArbiter {
    client_ahead: ClientAheadPolicy,
}

impl ConflictArbiter {
    pub fn new(client_ahead: ClientAheadPolicy) -> Self {
        Self { client_ahead }
    }

    pub fn client_ahead_policy(&self) -> ClientAheadPolicy {
        self.client_ahead
    }

    /// Compare the client's assumed version against the server's
    pub fn check(
        &self,
        server_modified_at: DateTime<Utc>,
        client_assumed_modified_at: DateTime<Utc>,
    ) -> Verdict {
        if client_assumed_modified_at == server_modified_at {
            return Verdict::Admit;
        }

        if client_assumed_modified_at < server_modified_at {
            return Verdict::Reject(ConflictReport::stale_write(
                server_modified_at,
                client_assumed_modified_at,
            ));
        }

        match self.client_ahead {
            ClientAheadPolicy::Admit => Verdict::AdmitClientAhead,
            ClientAheadPolicy::Reject => Verdict::Reject(ConflictReport::stale_write(
                server_modified_at,
                client_assumed_modified_at,
            )),
        }
    }

    /// Check and, if admitted, forward `payload` to the store.
    ///
    /// The store update is a compare-and-set on the `modified_at` observed
    /// here; losing that race turns the write into a rejection.
    pub async fn admit_write<S>(
        &self,
        store: &S,
        collection: &str,
        record: &SyncableRecord,
        client_assumed_modified_at: DateTime<Utc>,
        payload: Value,
    ) -> StoreResult<WriteOutcome>
    where
        S: RecordStore + ?Sized,
    {
        match self.check(record.modified_at, client_assumed_modified_at) {
            Verdict::Reject(report) => {
                tracing::info!(
                    collection = %collection,
                    id = %record.id,
                    server_modified_at = %report.server_modified_at,
                    client_assumed_modified_at = %report.client_assumed_modified_at,
                    "Rejected stale write"
                );
                return Ok(WriteOutcome::Rejected(report));
            }
            Verdict::AdmitClientAhead => {
                tracing::warn!(
                    collection = %collection,
                    id = %record.id,
                    server_modified_at = %record.modified_at,
                    client_assumed_modified_at = %client_assumed_modified_at,
                    "Client assumed a version newer than the server's; admitting"
                );
            }
            Verdict::Admit => {}
        }

        match store
            .update_if_unmodified(collection, &record.id, record.modified_at, payload)
            .await?
        {
            UpdateOutcome::Applied(updated) => {
                tracing::debug!(
                    collection = %collection,
                    id = %updated.id,
                    modified_at = %updated.modified_at,
                    "Write admitted"
                );
                Ok(WriteOutcome::Admitted(updated))
            }
            UpdateOutcome::Superseded(current) => {
                tracing::info!(
                    collection = %collection,
                    id = %current.id,
                    server_modified_at = %current.modified_at,
                    "Write lost a concurrent update race"
                );
                Ok(WriteOutcome::Rejected(ConflictReport::stale_write(
                    current.modified_at,
                    client_assumed_modified_at,
                )))
            }
            UpdateOutcome::Missing => Err(StoreError::NotFound {
                collection: collection.to_string(),
                id: record.id.clone(),
            }),
        }
    }
}
