//! `SQLite` adapter.
//!
//! rusqlite connections are blocking, so each connection lives on its own thread and the
//! async side talks to it over a command channel.

pub mod values;
mod worker;

use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use crate::connstring::ConnectionConfig;
use crate::engine::{EngineAdapter, EngineConnection, PreparedStatement};
use crate::error::DbQueueError;
use crate::types::{EngineType, IsolationLevel, QueryRequest, QueryResult, Transaction};

use values::to_sqlite_value;
use worker::{Command, SqliteWorker};

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteAdapter;

#[async_trait]
impl EngineAdapter for SqliteAdapter {
    fn engine_type(&self) -> EngineType {
        EngineType::Sqlite
    }

    async fn connect(
        &self,
        config: &ConnectionConfig,
        label: &str,
    ) -> Result<Box<dyn EngineConnection>, DbQueueError> {
        if config.database.is_empty() {
            return Err(DbQueueError::ConnectionError(
                "SQLite connection string has no path".to_string(),
            ));
        }
        let worker = SqliteWorker::spawn(config.database.clone(), label).await?;
        debug!(dqm = %label, path = %config.database, "opened SQLite database");
        Ok(Box::new(SqliteConnection { worker }))
    }
}

/// One `SQLite` database handle.
pub struct SqliteConnection {
    worker: SqliteWorker,
}

impl SqliteConnection {
    async fn run(&self, request: &QueryRequest, cached: bool) -> Result<QueryResult, DbQueueError> {
        let started = Instant::now();
        let params = request.params.iter().map(to_sqlite_value).collect();
        let sql = request.sql.clone();
        let rows = self
            .worker
            .request(
                |respond_to| Command::Execute {
                    sql,
                    params,
                    cached,
                    respond_to,
                },
                "SQLite worker dropped execute response",
            )
            .await?;
        rows.into_result(started)
    }
}

#[async_trait]
impl EngineConnection for SqliteConnection {
    fn engine_type(&self) -> EngineType {
        EngineType::Sqlite
    }

    async fn execute_query(&mut self, request: &QueryRequest) -> Result<QueryResult, DbQueueError> {
        self.run(request, false).await
    }

    async fn prepare(&mut self, name: &str, sql: &str) -> Result<PreparedStatement, DbQueueError> {
        let owned = sql.to_string();
        self.worker
            .request(
                |respond_to| Command::Prepare {
                    sql: owned,
                    respond_to,
                },
                "SQLite worker dropped prepare response",
            )
            .await?;
        Ok(PreparedStatement {
            name: name.to_string(),
            sql: sql.to_string(),
        })
    }

    async fn execute_prepared(
        &mut self,
        stmt: &PreparedStatement,
        request: &QueryRequest,
    ) -> Result<QueryResult, DbQueueError> {
        let request = QueryRequest {
            sql: stmt.sql.clone(),
            ..request.clone()
        };
        self.run(&request, true).await
    }

    async fn execute_batch(&mut self, sql: &str) -> Result<(), DbQueueError> {
        let sql = sql.to_string();
        self.worker
            .request(
                |respond_to| Command::ExecuteBatch { sql, respond_to },
                "SQLite worker dropped batch response",
            )
            .await
    }

    async fn begin_transaction(
        &mut self,
        isolation: IsolationLevel,
    ) -> Result<Transaction, DbQueueError> {
        let tx_id = self
            .worker
            .request(
                |respond_to| Command::BeginTransaction {
                    isolation,
                    respond_to,
                },
                "SQLite worker dropped begin response",
            )
            .await?;
        Ok(Transaction::begin(tx_id, isolation))
    }

    async fn commit_transaction(&mut self, tx: Transaction) -> Result<(), DbQueueError> {
        let tx_id = tx.transaction_id;
        self.worker
            .request(
                |respond_to| Command::CommitTx { tx_id, respond_to },
                "SQLite worker dropped commit response",
            )
            .await
    }

    async fn rollback_transaction(&mut self, tx: Transaction) -> Result<(), DbQueueError> {
        let tx_id = tx.transaction_id;
        self.worker
            .request(
                |respond_to| Command::RollbackTx { tx_id, respond_to },
                "SQLite worker dropped rollback response",
            )
            .await
    }

    async fn health_check(&mut self) -> bool {
        self.worker
            .request(
                |respond_to| Command::Ping { respond_to },
                "SQLite worker dropped ping response",
            )
            .await
            .is_ok()
    }

    async fn disconnect(&mut self) -> Result<(), DbQueueError> {
        // The worker thread closes the connection when its handle is dropped.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypedValue;

    async fn memory() -> Result<Box<dyn EngineConnection>, DbQueueError> {
        let config = ConnectionConfig::parse("sqlite::memory:")?;
        SqliteAdapter.connect(&config, "test").await
    }

    #[test]
    fn executes_and_serialises() -> Result<(), Box<dyn std::error::Error>> {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            let mut conn = memory().await?;
            conn.execute_batch("CREATE TABLE t (id INTEGER, name TEXT);").await?;
            let insert = QueryRequest::new("q1", "INSERT INTO t VALUES (?, ?)").with_params(vec![
                TypedValue::Integer(123),
                TypedValue::String("a\"b".into()),
            ]);
            let inserted = conn.execute_query(&insert).await?;
            assert_eq!(inserted.affected_rows, 1);
            assert_eq!(inserted.data_json, "[]");

            let select = QueryRequest::new("q2", "SELECT id, name FROM t WHERE id = ?")
                .with_params(vec![TypedValue::Integer(123)]);
            let result = conn.execute_query(&select).await?;
            assert_eq!(result.row_count, 1);
            assert_eq!(result.column_names, vec!["id", "name"]);
            assert_eq!(result.data_json, r#"[{"id":123,"name":"a\"b"}]"#);
            Ok(())
        })
    }

    #[test]
    fn rollback_discards_and_ids_are_checked() -> Result<(), Box<dyn std::error::Error>> {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            let mut conn = memory().await?;
            conn.execute_batch("CREATE TABLE t (id INTEGER);").await?;

            let tx = conn.begin_transaction(IsolationLevel::ReadCommitted).await?;
            assert!(conn.begin_transaction(IsolationLevel::ReadCommitted).await.is_err());
            conn.execute_query(&QueryRequest::new("i", "INSERT INTO t VALUES (1)"))
                .await?;
            let stale = Transaction::begin(tx.transaction_id + 1, IsolationLevel::ReadCommitted);
            assert!(conn.commit_transaction(stale).await.is_err());
            conn.rollback_transaction(tx).await?;

            let count = conn
                .execute_query(&QueryRequest::new("c", "SELECT COUNT(*) AS n FROM t"))
                .await?;
            assert_eq!(count.data_json, r#"[{"n":0}]"#);

            let orphan = Transaction::begin(99, IsolationLevel::ReadCommitted);
            assert!(conn.commit_transaction(orphan).await.is_err());
            Ok(())
        })
    }

    #[test]
    fn prepared_statements_and_health() -> Result<(), Box<dyn std::error::Error>> {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            let mut conn = memory().await?;
            assert!(conn.health_check().await);
            let stmt = conn.prepare("plus_one", "SELECT ? + 1 AS v").await?;
            let request = QueryRequest::new("p", "").with_params(vec![TypedValue::Integer(41)]);
            let result = conn.execute_prepared(&stmt, &request).await?;
            assert_eq!(result.data_json, r#"[{"v":42}]"#);
            assert!(conn.prepare("bad", "SELEC nope").await.is_err());
            conn.disconnect().await?;
            Ok(())
        })
    }
}
