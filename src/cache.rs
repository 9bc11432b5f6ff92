//! Per-database query cache and migration ledger.
//!
//! The cache is owned by a lead queue and is read-mostly once bootstrap and migration loading
//! have filled it.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::DbQueueError;
use crate::types::QueueType;

/// A compiled query template addressable by its public reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryCacheEntry {
    pub query_ref: i64,
    pub sql_template: String,
    pub description: String,
    pub queue_type: QueueType,
    pub ttl_seconds: u64,
}

impl QueryCacheEntry {
    #[must_use]
    pub fn new(
        query_ref: i64,
        sql_template: impl Into<String>,
        description: impl Into<String>,
        queue_type: QueueType,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            query_ref,
            sql_template: sql_template.into(),
            description: description.into(),
            queue_type,
            ttl_seconds,
        }
    }
}

/// Kind of a migration ledger row; the discriminant is the `query_type` code used in
/// bootstrap result sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum LedgerKind {
    Forward = 1000,
    Reverse = 1001,
    Diagram = 1002,
    Applied = 1003,
}

impl LedgerKind {
    #[must_use]
    pub fn code(self) -> i64 {
        self as i64
    }

    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1000 => Some(LedgerKind::Forward),
            1001 => Some(LedgerKind::Reverse),
            1002 => Some(LedgerKind::Diagram),
            1003 => Some(LedgerKind::Applied),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub number: i64,
    pub kind: LedgerKind,
    pub sql: String,
    pub description: String,
}

/// Migration bookkeeping for one database.
///
/// Every mutator keeps `applied <= loaded <= available`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationLedger {
    available: i64,
    loaded: i64,
    applied: i64,
    #[serde(skip)]
    entries: BTreeMap<(i64, LedgerKind), LedgerEntry>,
}

impl MigrationLedger {
    #[must_use]
    pub fn available(&self) -> i64 {
        self.available
    }

    #[must_use]
    pub fn loaded(&self) -> i64 {
        self.loaded
    }

    #[must_use]
    pub fn applied(&self) -> i64 {
        self.applied
    }

    /// Set the highest migration number present in the script set.
    ///
    /// Returns `false` when `n` is below what is already loaded; `available` is then held at
    /// `loaded`.
    pub fn set_available(&mut self, n: i64) -> bool {
        self.available = n.max(self.loaded);
        n >= self.loaded
    }

    /// Record a ledger row. Forward, reverse and diagram rows raise `loaded`.
    pub fn record(&mut self, entry: LedgerEntry) {
        if entry.kind == LedgerKind::Applied {
            self.observe_applied(entry.number);
            return;
        }
        if entry.number > self.loaded {
            self.loaded = entry.number;
            self.available = self.available.max(self.loaded);
        }
        self.entries.insert((entry.number, entry.kind), entry);
    }

    /// Account for a migration the database reports as already applied.
    pub fn observe_applied(&mut self, n: i64) {
        if n <= self.applied {
            return;
        }
        self.applied = n;
        self.loaded = self.loaded.max(n);
        self.available = self.available.max(self.loaded);
        self.entries.insert(
            (n, LedgerKind::Applied),
            LedgerEntry {
                number: n,
                kind: LedgerKind::Applied,
                sql: String::new(),
                description: String::new(),
            },
        );
    }

    /// Advance `applied` to `n`.
    ///
    /// # Errors
    /// Returns [`DbQueueError::MigrationError`] unless `n` is exactly `applied + 1` and already
    /// loaded.
    pub fn mark_applied(&mut self, n: i64) -> Result<(), DbQueueError> {
        if n != self.applied + 1 || n > self.loaded {
            return Err(DbQueueError::migration(
                crate::error::MigrationStage::Execute,
                format!(
                    "cannot mark migration {n} applied (applied = {}, loaded = {})",
                    self.applied, self.loaded
                ),
            ));
        }
        self.observe_applied(n);
        Ok(())
    }

    /// Step `applied` back from `n` to `n - 1` after a reverse migration.
    ///
    /// # Errors
    /// Returns [`DbQueueError::MigrationError`] unless `n` is the current `applied`.
    pub fn mark_reverted(&mut self, n: i64) -> Result<(), DbQueueError> {
        if n != self.applied || n <= 0 {
            return Err(DbQueueError::migration(
                crate::error::MigrationStage::Execute,
                format!("cannot revert migration {n} (applied = {})", self.applied),
            ));
        }
        self.entries.remove(&(n, LedgerKind::Applied));
        self.applied = n - 1;
        Ok(())
    }

    #[must_use]
    pub fn entry(&self, n: i64, kind: LedgerKind) -> Option<&LedgerEntry> {
        self.entries.get(&(n, kind))
    }

    /// Next forward migration to apply, or 0 when there is none.
    #[must_use]
    pub fn next_forward(&self) -> i64 {
        let next = self.applied + 1;
        if next <= self.loaded && self.entries.contains_key(&(next, LedgerKind::Forward)) {
            next
        } else {
            0
        }
    }

    /// Next reverse migration to apply, or 0 when there is none.
    #[must_use]
    pub fn next_reverse(&self) -> i64 {
        if self.applied > 0 && self.entries.contains_key(&(self.applied, LedgerKind::Reverse)) {
            self.applied
        } else {
            0
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.values()
    }
}

/// Query templates keyed by reference, plus the migration ledger.
#[derive(Debug, Clone, Default)]
pub struct QueryCache {
    entries: BTreeMap<i64, QueryCacheEntry>,
    ledger: MigrationLedger,
}

impl QueryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns [`DbQueueError::QueryError`] if the reference is not positive or already present.
    pub fn add_entry(&mut self, entry: QueryCacheEntry) -> Result<(), DbQueueError> {
        if entry.query_ref <= 0 {
            return Err(DbQueueError::QueryError(format!(
                "query ref must be positive, got {}",
                entry.query_ref
            )));
        }
        if self.entries.contains_key(&entry.query_ref) {
            return Err(DbQueueError::QueryError(format!(
                "duplicate query ref {}",
                entry.query_ref
            )));
        }
        self.entries.insert(entry.query_ref, entry);
        Ok(())
    }

    #[must_use]
    pub fn lookup(&self, query_ref: i64) -> Option<&QueryCacheEntry> {
        if query_ref <= 0 {
            return None;
        }
        self.entries.get(&query_ref)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &QueryCacheEntry> {
        self.entries.values()
    }

    #[must_use]
    pub fn ledger(&self) -> &MigrationLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut MigrationLedger {
        &mut self.ledger
    }

    /// Drop all query entries, keeping the ledger.
    pub fn clear_entries(&mut self) {
        self.entries.clear();
    }
}
