//! Engine adapters: one implementation per database behind a common async interface.
//!
//! [`EngineRegistry::load`] plays the role of loading the per-engine client libraries once
//! per process; queues then ask it for the adapter matching their connection string.

#[cfg(feature = "db2")]
pub mod db2;
#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::connstring::ConnectionConfig;
use crate::error::DbQueueError;
use crate::json::{JsonBuffer, write_rows};
use crate::types::{CellValue, EngineType, IsolationLevel, QueryRequest, QueryResult, Transaction};

/// Per-engine factory for live connections.
#[async_trait]
pub trait EngineAdapter: Send + Sync + fmt::Debug {
    fn engine_type(&self) -> EngineType;

    /// Open a new connection.
    ///
    /// # Errors
    /// Returns [`DbQueueError::ConnectionError`] (or the engine's own error) when the
    /// database cannot be reached.
    async fn connect(
        &self,
        config: &ConnectionConfig,
        label: &str,
    ) -> Result<Box<dyn EngineConnection>, DbQueueError>;
}

/// Server-side statement handle returned by [`EngineConnection::prepare`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    pub name: String,
    pub sql: String,
}

/// An open connection to one database.
///
/// All methods take `&mut self`; the owning queue serialises access behind its connection lock.
#[async_trait]
pub trait EngineConnection: Send {
    fn engine_type(&self) -> EngineType;

    /// Run one statement with positional parameters.
    ///
    /// # Errors
    /// Returns the engine's execution error, or [`DbQueueError::ParameterError`] when a value
    /// cannot be bound.
    async fn execute_query(&mut self, request: &QueryRequest) -> Result<QueryResult, DbQueueError>;

    /// Prepare `sql` for repeated execution under `name`.
    ///
    /// # Errors
    /// Returns the engine's error if the statement does not parse.
    async fn prepare(&mut self, name: &str, sql: &str) -> Result<PreparedStatement, DbQueueError>;

    /// Run a statement previously returned by [`EngineConnection::prepare`].
    ///
    /// # Errors
    /// As [`EngineConnection::execute_query`].
    async fn execute_prepared(
        &mut self,
        stmt: &PreparedStatement,
        request: &QueryRequest,
    ) -> Result<QueryResult, DbQueueError>;

    /// Run parameterless SQL text, possibly holding several statements.
    ///
    /// # Errors
    /// Returns the engine's execution error.
    async fn execute_batch(&mut self, sql: &str) -> Result<(), DbQueueError>;

    /// # Errors
    /// Fails if a transaction is already open or the engine refuses to start one.
    async fn begin_transaction(
        &mut self,
        isolation: IsolationLevel,
    ) -> Result<Transaction, DbQueueError>;

    /// # Errors
    /// Fails if `tx` is not the open transaction or the commit is rejected.
    async fn commit_transaction(&mut self, tx: Transaction) -> Result<(), DbQueueError>;

    /// # Errors
    /// Fails if `tx` is not the open transaction.
    async fn rollback_transaction(&mut self, tx: Transaction) -> Result<(), DbQueueError>;

    /// Cheap liveness check; never errors.
    async fn health_check(&mut self) -> bool;

    /// # Errors
    /// Returns the engine's error if the close handshake fails.
    async fn disconnect(&mut self) -> Result<(), DbQueueError>;
}

/// Adapters available to this process, keyed by engine.
#[derive(Debug, Clone, Default)]
pub struct EngineRegistry {
    adapters: HashMap<EngineType, Arc<dyn EngineAdapter>>,
}

impl EngineRegistry {
    /// Registry with every adapter compiled into this build.
    #[must_use]
    pub fn load() -> Self {
        let mut registry = Self::default();
        #[cfg(feature = "sqlite")]
        registry.register(Arc::new(sqlite::SqliteAdapter));
        #[cfg(feature = "postgres")]
        registry.register(Arc::new(postgres::PostgresAdapter));
        #[cfg(feature = "mysql")]
        registry.register(Arc::new(mysql::MysqlAdapter));
        #[cfg(feature = "db2")]
        registry.register(Arc::new(db2::Db2Adapter::default()));
        registry
    }

    /// Install or replace the adapter for its engine.
    pub fn register(&mut self, adapter: Arc<dyn EngineAdapter>) {
        self.adapters.insert(adapter.engine_type(), adapter);
    }

    /// # Errors
    /// Returns [`DbQueueError::ConnectionError`] when no adapter for `engine` is available.
    pub fn adapter(&self, engine: EngineType) -> Result<Arc<dyn EngineAdapter>, DbQueueError> {
        self.adapters.get(&engine).cloned().ok_or_else(|| {
            DbQueueError::ConnectionError(format!("{engine} support not compiled in"))
        })
    }

    /// Parse `conn_str` and connect with the matching adapter.
    ///
    /// # Errors
    /// Propagates parse, lookup and connect failures.
    pub async fn connect(
        &self,
        conn_str: &str,
        label: &str,
    ) -> Result<Box<dyn EngineConnection>, DbQueueError> {
        let config = ConnectionConfig::parse(conn_str)?;
        let adapter = self.adapter(config.engine)?;
        adapter.connect(&config, label).await
    }

    #[must_use]
    pub fn engines(&self) -> Vec<EngineType> {
        self.adapters.keys().copied().collect()
    }
}

/// Rows as read back from an engine, before serialisation.
#[derive(Debug, Default)]
pub(crate) struct RawRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
    pub affected: u64,
}

impl RawRows {
    pub(crate) fn into_result(self, started: Instant) -> Result<QueryResult, DbQueueError> {
        let mut buffer = JsonBuffer::new();
        write_rows(&mut buffer, &self.columns, &self.rows)?;
        Ok(QueryResult {
            success: true,
            row_count: self.rows.len(),
            column_count: self.columns.len(),
            affected_rows: self.affected,
            column_names: self.columns,
            data_json: buffer.into_string(),
            error_message: None,
            execution_time_us: elapsed_us(started),
        })
    }
}

pub(crate) fn elapsed_us(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX)
}

/// Transaction bookkeeping for engines that drive transactions with plain SQL.
#[derive(Debug, Default)]
pub(crate) struct TxTracker {
    next_id: u64,
    active: Option<u64>,
}

impl TxTracker {
    pub(crate) fn begin(&mut self, isolation: IsolationLevel) -> Result<Transaction, DbQueueError> {
        if let Some(active) = self.active {
            return Err(DbQueueError::QueryError(format!(
                "transaction {active} already in progress"
            )));
        }
        self.next_id = self.next_id.saturating_add(1);
        self.active = Some(self.next_id);
        Ok(Transaction::begin(self.next_id, isolation))
    }

    /// Close `tx` if it is the open one.
    pub(crate) fn finish(&mut self, tx: &Transaction) -> Result<(), DbQueueError> {
        match self.active {
            Some(active) if active == tx.transaction_id => {
                self.active = None;
                Ok(())
            }
            Some(active) => Err(DbQueueError::QueryError(format!(
                "transaction mismatch: active {active}, requested {}",
                tx.transaction_id
            ))),
            None => Err(DbQueueError::QueryError(
                "no active transaction".to_string(),
            )),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.is_some()
    }
}
