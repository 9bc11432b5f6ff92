//! `PostgreSQL` adapter over `tokio-postgres`.

use std::collections::HashMap;
use std::error::Error;
use std::fmt::Write as _;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_postgres::types::{FromSql, IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::{Client, NoTls, Statement};
use tokio_util::bytes;
use tracing::{debug, warn};

use crate::connstring::ConnectionConfig;
use crate::engine::{EngineAdapter, EngineConnection, PreparedStatement, RawRows, TxTracker};
use crate::error::DbQueueError;
use crate::types::{
    CellValue, EngineType, IsolationLevel, QueryRequest, QueryResult, Transaction, TypedValue,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresAdapter;

#[async_trait]
impl EngineAdapter for PostgresAdapter {
    fn engine_type(&self) -> EngineType {
        EngineType::Postgresql
    }

    async fn connect(
        &self,
        config: &ConnectionConfig,
        label: &str,
    ) -> Result<Box<dyn EngineConnection>, DbQueueError> {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&config.host)
            .port(config.port)
            .dbname(&config.database)
            .application_name(label);
        if let Some(user) = &config.username {
            pg_config.user(user);
        }
        if let Some(password) = &config.password {
            pg_config.password(password);
        }

        let (client, connection) = pg_config.connect(NoTls).await.map_err(|e| {
            DbQueueError::ConnectionError(format!(
                "failed to connect to PostgreSQL at {}:{}: {e}",
                config.host, config.port
            ))
        })?;
        let dqm = label.to_string();
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(dqm = %dqm, error = %e, "PostgreSQL connection closed with error");
            }
        });
        debug!(dqm = %label, host = %config.host, db = %config.database, "connected to PostgreSQL");

        Ok(Box::new(PostgresConnection {
            client,
            driver,
            statements: HashMap::new(),
            tx: TxTracker::default(),
        }))
    }
}

pub struct PostgresConnection {
    client: Client,
    driver: JoinHandle<()>,
    statements: HashMap<String, Statement>,
    tx: TxTracker,
}

impl PostgresConnection {
    async fn run(
        &self,
        stmt: &Statement,
        request: &QueryRequest,
    ) -> Result<QueryResult, DbQueueError> {
        let started = Instant::now();
        let params: Vec<&(dyn ToSql + Sync)> = request
            .params
            .iter()
            .map(|p| p as &(dyn ToSql + Sync))
            .collect();

        if stmt.columns().is_empty() {
            let affected = self.client.execute(stmt, &params).await?;
            return RawRows {
                affected,
                ..RawRows::default()
            }
            .into_result(started);
        }

        let rows = self.client.query(stmt, &params).await?;
        let columns: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();
        let mut raw = RawRows {
            columns,
            rows: Vec::with_capacity(rows.len()),
            affected: 0,
        };
        for row in &rows {
            let mut values = Vec::with_capacity(raw.columns.len());
            for idx in 0..raw.columns.len() {
                values.push(postgres_extract_value(row, idx)?);
            }
            raw.rows.push(values);
        }
        raw.into_result(started)
    }
}

#[async_trait]
impl EngineConnection for PostgresConnection {
    fn engine_type(&self) -> EngineType {
        EngineType::Postgresql
    }

    async fn execute_query(&mut self, request: &QueryRequest) -> Result<QueryResult, DbQueueError> {
        let stmt = self.client.prepare(&request.sql).await?;
        self.run(&stmt, request).await
    }

    async fn prepare(&mut self, name: &str, sql: &str) -> Result<PreparedStatement, DbQueueError> {
        let stmt = self.client.prepare(sql).await?;
        self.statements.insert(name.to_string(), stmt);
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
        let statement = match self.statements.get(&stmt.name) {
            Some(s) => s.clone(),
            None => {
                let s = self.client.prepare(&stmt.sql).await?;
                self.statements.insert(stmt.name.clone(), s.clone());
                s
            }
        };
        self.run(&statement, request).await
    }

    async fn execute_batch(&mut self, sql: &str) -> Result<(), DbQueueError> {
        self.client.batch_execute(sql).await?;
        Ok(())
    }

    async fn begin_transaction(
        &mut self,
        isolation: IsolationLevel,
    ) -> Result<Transaction, DbQueueError> {
        let tx = self.tx.begin(isolation)?;
        let begin = format!("BEGIN ISOLATION LEVEL {}", isolation.sql_name());
        if let Err(e) = self.client.batch_execute(&begin).await {
            self.tx.finish(&tx)?;
            return Err(e.into());
        }
        Ok(tx)
    }

    async fn commit_transaction(&mut self, tx: Transaction) -> Result<(), DbQueueError> {
        self.tx.finish(&tx)?;
        self.client.batch_execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback_transaction(&mut self, tx: Transaction) -> Result<(), DbQueueError> {
        self.tx.finish(&tx)?;
        self.client.batch_execute("ROLLBACK").await?;
        Ok(())
    }

    async fn health_check(&mut self) -> bool {
        !self.client.is_closed() && self.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn disconnect(&mut self) -> Result<(), DbQueueError> {
        self.statements.clear();
        self.driver.abort();
        Ok(())
    }
}

impl ToSql for TypedValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut bytes::BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match (self, ty) {
            (TypedValue::Integer(i), &Type::INT2) => i16::try_from(*i)?.to_sql_checked(ty, out),
            (TypedValue::Integer(i), &Type::INT4) => i32::try_from(*i)?.to_sql_checked(ty, out),
            (TypedValue::Integer(i), &Type::INT8) => i.to_sql_checked(ty, out),
            #[allow(clippy::cast_precision_loss)]
            (TypedValue::Integer(i), &Type::FLOAT8) => (*i as f64).to_sql_checked(ty, out),
            #[allow(clippy::cast_possible_truncation)]
            (TypedValue::Float(f), &Type::FLOAT4) => (*f as f32).to_sql_checked(ty, out),
            (TypedValue::Float(f), &Type::FLOAT8) => f.to_sql_checked(ty, out),
            (TypedValue::Boolean(b), _) => b.to_sql_checked(ty, out),
            (TypedValue::String(s) | TypedValue::Text(s), _) => s.as_str().to_sql_checked(ty, out),
            (TypedValue::Date(d), _) => d.to_sql_checked(ty, out),
            (TypedValue::Time(t), _) => t.to_sql_checked(ty, out),
            (TypedValue::DateTime(dt) | TypedValue::Timestamp(dt), &Type::TIMESTAMPTZ) => {
                dt.and_utc().to_sql_checked(ty, out)
            }
            (TypedValue::DateTime(dt) | TypedValue::Timestamp(dt), _) => dt.to_sql_checked(ty, out),
            (value, _) => Err(format!("cannot bind {:?} as {ty}", value.kind()).into()),
        }
    }

    fn accepts(ty: &Type) -> bool {
        matches!(
            *ty,
            Type::INT2
                | Type::INT4
                | Type::INT8
                | Type::FLOAT4
                | Type::FLOAT8
                | Type::BOOL
                | Type::TEXT
                | Type::VARCHAR
                | Type::BPCHAR
                | Type::NAME
                | Type::UNKNOWN
                | Type::DATE
                | Type::TIME
                | Type::TIMESTAMP
                | Type::TIMESTAMPTZ
        )
    }

    to_sql_checked!();
}

/// Extract a cell from a `PostgreSQL` row by column type name.
///
/// # Errors
/// Returns the driver's error if the column cannot be decoded.
pub fn postgres_extract_value(
    row: &tokio_postgres::Row,
    idx: usize,
) -> Result<CellValue, DbQueueError> {
    let type_info = row.columns()[idx].type_();
    Ok(match type_info.name() {
        "int2" => row
            .try_get::<_, Option<i16>>(idx)?
            .map_or(CellValue::Null, |v| CellValue::Int(i64::from(v))),
        "int4" => row
            .try_get::<_, Option<i32>>(idx)?
            .map_or(CellValue::Null, |v| CellValue::Int(i64::from(v))),
        "int8" => row
            .try_get::<_, Option<i64>>(idx)?
            .map_or(CellValue::Null, CellValue::Int),
        "float4" => row
            .try_get::<_, Option<f32>>(idx)?
            .map_or(CellValue::Null, |v| CellValue::Float(f64::from(v))),
        "float8" => row
            .try_get::<_, Option<f64>>(idx)?
            .map_or(CellValue::Null, CellValue::Float),
        "bool" => row
            .try_get::<_, Option<bool>>(idx)?
            .map_or(CellValue::Null, CellValue::Bool),
        "timestamp" => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map_or(CellValue::Null, CellValue::Timestamp),
        "timestamptz" => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?
            .map_or(CellValue::Null, |v| CellValue::Timestamp(v.naive_utc())),
        "date" => row
            .try_get::<_, Option<NaiveDate>>(idx)?
            .map_or(CellValue::Null, |v| {
                CellValue::Text(v.format("%Y-%m-%d").to_string())
            }),
        "time" => row
            .try_get::<_, Option<NaiveTime>>(idx)?
            .map_or(CellValue::Null, |v| {
                CellValue::Text(v.format("%H:%M:%S%.f").to_string())
            }),
        "json" | "jsonb" => row
            .try_get::<_, Option<Value>>(idx)?
            .map_or(CellValue::Null, CellValue::JSON),
        "bytea" => row
            .try_get::<_, Option<Vec<u8>>>(idx)?
            .map_or(CellValue::Null, CellValue::Blob),
        "text" | "varchar" | "bpchar" | "name" | "char" => row
            .try_get::<_, Option<String>>(idx)?
            .map_or(CellValue::Null, CellValue::Text),
        _ => row
            .try_get::<_, Option<AnyText>>(idx)?
            .map_or(CellValue::Null, |v| CellValue::Text(v.0)),
    })
}

/// Text rendering of column types the driver has no native mapping for.
struct AnyText(String);

impl<'a> FromSql<'a> for AnyText {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        match *ty {
            Type::NUMERIC => decode_numeric(raw).map(AnyText),
            Type::UUID => decode_uuid(raw).map(AnyText),
            _ => Ok(AnyText(String::from_utf8_lossy(raw).into_owned())),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

fn read_u16(raw: &[u8], at: usize) -> Result<u16, Box<dyn Error + Sync + Send>> {
    raw.get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| "truncated numeric".into())
}

/// Decode the binary NUMERIC wire format (base-10000 digit groups) into decimal text.
fn decode_numeric(raw: &[u8]) -> Result<String, Box<dyn Error + Sync + Send>> {
    const NUMERIC_NEG: u16 = 0x4000;
    const NUMERIC_NAN: u16 = 0xC000;

    let ndigits = usize::from(read_u16(raw, 0)?);
    let weight = i32::from(i16::from_be_bytes(read_u16(raw, 2)?.to_be_bytes()));
    let sign = read_u16(raw, 4)?;
    let dscale = usize::from(read_u16(raw, 6)?);
    if sign == NUMERIC_NAN {
        return Ok("NaN".to_string());
    }
    let digits = (0..ndigits)
        .map(|i| read_u16(raw, 8 + i * 2))
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        for group in 0..=weight {
            let digit = usize::try_from(group)
                .ok()
                .and_then(|g| digits.get(g))
                .copied()
                .unwrap_or(0);
            if group == 0 {
                write!(out, "{digit}")?;
            } else {
                write!(out, "{digit:04}")?;
            }
        }
    }
    if dscale > 0 {
        let mut frac = String::new();
        let mut group = weight + 1;
        while frac.len() < dscale {
            let digit = usize::try_from(group)
                .ok()
                .and_then(|g| digits.get(g))
                .copied()
                .unwrap_or(0);
            write!(frac, "{digit:04}")?;
            group += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Ok(out)
}

fn decode_uuid(raw: &[u8]) -> Result<String, Box<dyn Error + Sync + Send>> {
    if raw.len() != 16 {
        return Err("uuid must be 16 bytes".into());
    }
    let mut out = String::with_capacity(36);
    for (i, b) in raw.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        write!(out, "{b:02x}")?;
    }
    Ok(out)
}
