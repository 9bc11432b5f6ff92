//! `MySQL` / `MariaDB` adapter over a single `sqlx` connection.

use std::time::Instant;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use sqlx::mysql::{MySql, MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column, Connection, Executor, Row, Statement, TypeInfo, ValueRef};
use tracing::debug;

use crate::connstring::ConnectionConfig;
use crate::engine::{EngineAdapter, EngineConnection, PreparedStatement, RawRows, TxTracker};
use crate::error::DbQueueError;
use crate::types::{
    CellValue, EngineType, IsolationLevel, QueryRequest, QueryResult, Transaction, TypedValue,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlAdapter;

#[async_trait]
impl EngineAdapter for MysqlAdapter {
    fn engine_type(&self) -> EngineType {
        EngineType::Mysql
    }

    async fn connect(
        &self,
        config: &ConnectionConfig,
        label: &str,
    ) -> Result<Box<dyn EngineConnection>, DbQueueError> {
        let mut options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database);
        if let Some(user) = &config.username {
            options = options.username(user);
        }
        if let Some(password) = &config.password {
            options = options.password(password);
        }
        let conn = MySqlConnection::connect_with(&options).await.map_err(|e| {
            DbQueueError::ConnectionError(format!(
                "failed to connect to MySQL at {}:{}: {e}",
                config.host, config.port
            ))
        })?;
        debug!(dqm = %label, host = %config.host, db = %config.database, "connected to MySQL");
        Ok(Box::new(MysqlEngineConnection {
            conn: Some(conn),
            tx: TxTracker::default(),
        }))
    }
}

pub struct MysqlEngineConnection {
    conn: Option<MySqlConnection>,
    tx: TxTracker,
}

impl MysqlEngineConnection {
    fn conn(&mut self) -> Result<&mut MySqlConnection, DbQueueError> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbQueueError::ConnectionError("MySQL connection is closed".into()))
    }

    async fn run(&mut self, sql: &str, params: &[TypedValue]) -> Result<QueryResult, DbQueueError> {
        let started = Instant::now();
        let conn = self.conn()?;
        let stmt = (&mut *conn).prepare(sql).await?;

        if stmt.columns().is_empty() {
            let done = bind_params(sql, params).execute(&mut *conn).await?;
            return RawRows {
                affected: done.rows_affected(),
                ..RawRows::default()
            }
            .into_result(started);
        }

        let columns: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();
        let rows = bind_params(sql, params).fetch_all(&mut *conn).await?;
        let mut raw = RawRows {
            columns,
            rows: Vec::with_capacity(rows.len()),
            affected: 0,
        };
        for row in &rows {
            let mut values = Vec::with_capacity(raw.columns.len());
            for idx in 0..raw.columns.len() {
                values.push(mysql_extract_value(row, idx)?);
            }
            raw.rows.push(values);
        }
        raw.into_result(started)
    }

    async fn batch(&mut self, sql: &str) -> Result<(), DbQueueError> {
        let conn = self.conn()?;
        sqlx::raw_sql(sql).execute(&mut *conn).await?;
        Ok(())
    }
}

fn bind_params<'q>(sql: &'q str, params: &'q [TypedValue]) -> Query<'q, MySql, MySqlArguments> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, param| match param {
            TypedValue::Integer(i) => query.bind(*i),
            TypedValue::Float(f) => query.bind(*f),
            TypedValue::Boolean(b) => query.bind(*b),
            TypedValue::String(s) | TypedValue::Text(s) => query.bind(s.as_str()),
            TypedValue::Date(d) => query.bind(*d),
            TypedValue::Time(t) => query.bind(*t),
            TypedValue::DateTime(dt) | TypedValue::Timestamp(dt) => query.bind(*dt),
        })
}

/// Extract a cell from a `MySQL` row by column type name.
///
/// # Errors
/// Returns the driver's error if the column cannot be decoded.
pub fn mysql_extract_value(row: &MySqlRow, idx: usize) -> Result<CellValue, DbQueueError> {
    if row.try_get_raw(idx)?.is_null() {
        return Ok(CellValue::Null);
    }
    let type_name = row.column(idx).type_info().name().to_string();
    Ok(match type_name.as_str() {
        "BOOLEAN" => CellValue::Bool(row.try_get_unchecked::<bool, _>(idx)?),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            CellValue::Int(row.try_get_unchecked::<i64, _>(idx)?)
        }
        name if name.ends_with("UNSIGNED") => {
            let value = row.try_get_unchecked::<u64, _>(idx)?;
            i64::try_from(value).map_or_else(|_| CellValue::Text(value.to_string()), CellValue::Int)
        }
        "FLOAT" => CellValue::Float(f64::from(row.try_get_unchecked::<f32, _>(idx)?)),
        "DOUBLE" => CellValue::Float(row.try_get_unchecked::<f64, _>(idx)?),
        "DATE" => CellValue::Text(
            row.try_get_unchecked::<NaiveDate, _>(idx)?
                .format("%Y-%m-%d")
                .to_string(),
        ),
        "TIME" => CellValue::Text(
            row.try_get_unchecked::<NaiveTime, _>(idx)?
                .format("%H:%M:%S%.f")
                .to_string(),
        ),
        "DATETIME" | "TIMESTAMP" => {
            CellValue::Timestamp(row.try_get_unchecked::<NaiveDateTime, _>(idx)?)
        }
        "JSON" => {
            let text = row.try_get_unchecked::<String, _>(idx)?;
            CellValue::JSON(serde_json::from_str(&text)?)
        }
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT" => {
            CellValue::Blob(row.try_get_unchecked::<Vec<u8>, _>(idx)?)
        }
        // DECIMAL travels as text in both protocols.
        _ => CellValue::Text(row.try_get_unchecked::<String, _>(idx)?),
    })
}

#[async_trait]
impl EngineConnection for MysqlEngineConnection {
    fn engine_type(&self) -> EngineType {
        EngineType::Mysql
    }

    async fn execute_query(&mut self, request: &QueryRequest) -> Result<QueryResult, DbQueueError> {
        self.run(&request.sql, &request.params).await
    }

    async fn prepare(&mut self, name: &str, sql: &str) -> Result<PreparedStatement, DbQueueError> {
        // sqlx keeps its own per-connection statement cache; preparing here validates and warms it.
        let conn = self.conn()?;
        (&mut *conn).prepare(sql).await?;
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
        self.run(&stmt.sql, &request.params).await
    }

    async fn execute_batch(&mut self, sql: &str) -> Result<(), DbQueueError> {
        self.batch(sql).await
    }

    async fn begin_transaction(
        &mut self,
        isolation: IsolationLevel,
    ) -> Result<Transaction, DbQueueError> {
        let tx = self.tx.begin(isolation)?;
        let begin = format!(
            "SET TRANSACTION ISOLATION LEVEL {}; START TRANSACTION",
            isolation.sql_name()
        );
        if let Err(e) = self.batch(&begin).await {
            self.tx.finish(&tx)?;
            return Err(e);
        }
        Ok(tx)
    }

    async fn commit_transaction(&mut self, tx: Transaction) -> Result<(), DbQueueError> {
        self.tx.finish(&tx)?;
        self.batch("COMMIT").await
    }

    async fn rollback_transaction(&mut self, tx: Transaction) -> Result<(), DbQueueError> {
        self.tx.finish(&tx)?;
        self.batch("ROLLBACK").await
    }

    async fn health_check(&mut self) -> bool {
        match self.conn.as_mut() {
            Some(conn) => conn.ping().await.is_ok(),
            None => false,
        }
    }

    async fn disconnect(&mut self) -> Result<(), DbQueueError> {
        if let Some(conn) = self.conn.take() {
            conn.close().await?;
        }
        Ok(())
    }
}
