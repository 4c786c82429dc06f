//! Change-set selection
//!
//! A [`ChangeQuery`] describes which records of a collection a pull should
//! return. The same value drives the in-memory predicate and the SQL filter,
//! so every store backend agrees on membership and order.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use super::timestamp::format_instant;
use super::types::{SyncCursor, SyncableRecord};

/// Selection criteria for one pull
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeQuery {
    /// Parent key; applied before the timestamp predicate
    pub scope: Option<String>,
    /// Absent on bootstrap
    pub cursor: Option<DateTime<Utc>>,
    /// Inclusive upper bound, the pull's generation instant
    pub until: Option<DateTime<Utc>>,
}

impl ChangeQuery {
    pub fn new(cursor: Option<SyncCursor>) -> Self {
        Self {
            scope: None,
            cursor: cursor.map(|c| c.instant()),
            until: None,
        }
    }

    pub fn with_scope(mut self, scope: Option<String>) -> Self {
        self.scope = scope;
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    /// Whether `record` belongs in the change-set
    pub fn matches(&self, record: &SyncableRecord) -> bool {
        if let Some(scope) = &self.scope {
            if record.scope.as_deref() != Some(scope.as_str()) {
                return false;
            }
        }

        if let Some(cursor) = self.cursor {
            if record.modified_at <= cursor {
                return false;
            }
        }

        match self.until {
            Some(until) => record.modified_at <= until,
            None => true,
        }
    }

    /// Filter and order an unordered record collection
    pub fn select<'a, I>(&self, records: I) -> Vec<SyncableRecord>
    where
        I: IntoIterator<Item = &'a SyncableRecord>,
    {
        let mut selected: Vec<SyncableRecord> = records
            .into_iter()
            .filter(|record| self.matches(record))
            .cloned()
            .collect();
        selected.sort_by(change_order);
        selected
    }

    /// Extra `WHERE` conditions, to be appended after `collection = ?`.
    ///
    /// Placeholders appear in the order of [`ChangeQuery::sql_binds`].
    pub fn sql_filter(&self) -> String {
        let mut clause = String::new();
        if self.scope.is_some() {
            clause.push_str(" AND scope = ?");
        }
        if self.cursor.is_some() {
            clause.push_str(" AND modified_at > ?");
        }
        if self.until.is_some() {
            clause.push_str(" AND modified_at <= ?");
        }
        clause
    }

    /// Values for the placeholders in [`ChangeQuery::sql_filter`]
    pub fn sql_binds(&self) -> Vec<String> {
        let mut binds = Vec::with_capacity(3);
        if let Some(scope) = &self.scope {
            binds.push(scope.clone());
        }
        if let Some(cursor) = self.cursor {
            binds.push(format_instant(cursor));
        }
        if let Some(until) = self.until {
            binds.push(format_instant(until));
        }
        binds
    }

    /// Matches [`change_order`] under SQLite's BINARY collation
    pub const SQL_ORDER: &'static str = " ORDER BY modified_at ASC, id ASC";
}

/// `modified_at` ascending, ties broken by `id`
pub fn change_order(a: &SyncableRecord, b: &SyncableRecord) -> Ordering {
    a.modified_at
        .cmp(&b.modified_at)
        .then_with(|| a.id.cmp(&b.id))
}
