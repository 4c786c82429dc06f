//! Incremental sync module
//!
//! Lets intermittently connected clients pull only what changed since their
//! last cursor, skip unchanged change-sets via ETags, and detect writes that
//! would clobber newer server state.
//!
//! Read path: timestamp codec, change-set selector, fingerprint, cache gate,
//! envelope. Write path: timestamp codec, conflict arbiter, envelope.

mod arbiter;
mod clock;
mod engine;
mod envelope;
mod fingerprint;
mod selector;
mod store;
mod timeline;
pub mod timestamp;
mod types;

pub use arbiter::{ClientAheadPolicy, ConflictArbiter, Verdict, WriteOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{validate_collection, ReadRequest, SyncEngine, WriteRequest, ASSUMED_MODIFIED_AT};
pub use envelope::{ReadEnvelope, StrategyInfo, WriteEnvelope, X_RECORD_COUNT, X_SYNC_CURSOR, X_SYNC_STRATEGY};
pub use fingerprint::{fingerprint, should_serve_full};
pub use selector::{change_order, ChangeQuery};
pub use store::{MemoryRecordStore, RecordStore, StoreError, StoreResult, UpdateOutcome};
pub use timeline::{Stamp, Timeline};
pub use timestamp::TimestampError;
pub use types::*;
