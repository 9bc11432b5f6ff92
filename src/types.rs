use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Routing class of a worker queue.
///
/// Round-trips through its lowercase name; anything unrecognised (including the wrong
/// case) falls back to [`QueueType::Medium`]:
/// ```rust
/// use dbqueue::prelude::*;
///
/// assert_eq!(QueueType::from_name("fast"), QueueType::Fast);
/// assert_eq!(QueueType::from_name("FAST"), QueueType::Medium);
/// assert_eq!(QueueType::Cache.as_str(), "cache");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueType {
    Slow,
    Medium,
    Fast,
    Cache,
}

/// Stats index used for the lead queue itself.
pub const LEAD_QUEUE_INDEX: usize = 4;
/// Number of stats slots: four worker types plus the lead.
pub const QUEUE_INDEX_COUNT: usize = 5;

impl QueueType {
    pub const ALL: [QueueType; 4] = [
        QueueType::Slow,
        QueueType::Medium,
        QueueType::Fast,
        QueueType::Cache,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            QueueType::Slow => "slow",
            QueueType::Medium => "medium",
            QueueType::Fast => "fast",
            QueueType::Cache => "cache",
        }
    }

    /// Parse a queue type name, defaulting to `Medium`.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self::parse(name).unwrap_or(QueueType::Medium)
    }

    /// Strict variant of [`QueueType::from_name`].
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "slow" => Some(QueueType::Slow),
            "medium" => Some(QueueType::Medium),
            "fast" => Some(QueueType::Fast),
            "cache" => Some(QueueType::Cache),
            _ => None,
        }
    }

    /// Stats slot for this type (slow=0 .. cache=3).
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            QueueType::Slow => 0,
            QueueType::Medium => 1,
            QueueType::Fast => 2,
            QueueType::Cache => 3,
        }
    }

    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Capability letter used in queue tags.
    #[must_use]
    pub fn tag(self) -> char {
        match self {
            QueueType::Slow => 'S',
            QueueType::Medium => 'M',
            QueueType::Fast => 'F',
            QueueType::Cache => 'C',
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Database engine behind a connection string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    /// `PostgreSQL`
    Postgresql,
    /// `MySQL` / `MariaDB`
    Mysql,
    /// `SQLite`
    Sqlite,
    /// IBM DB2 through the CLI library
    Db2,
}

impl EngineType {
    /// Classify a connection string.
    ///
    /// URL schemes win; a `DATABASE=` key marks a DB2 CLI string; everything else is taken
    /// to be an `SQLite` path.
    #[must_use]
    pub fn from_connection_string(conn_str: &str) -> Self {
        if conn_str.starts_with("postgresql://") || conn_str.starts_with("postgres://") {
            EngineType::Postgresql
        } else if conn_str.starts_with("mysql://") {
            EngineType::Mysql
        } else if conn_str.contains("DATABASE=") {
            EngineType::Db2
        } else {
            EngineType::Sqlite
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EngineType::Postgresql => "postgresql",
            EngineType::Mysql => "mysql",
            EngineType::Sqlite => "sqlite",
            EngineType::Db2 => "db2",
        }
    }

    /// Whether positional parameters are numbered (`$1`) rather than anonymous (`?`).
    #[must_use]
    pub fn numbered_placeholders(self) -> bool {
        matches!(self, EngineType::Postgresql)
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction isolation requested from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// The SQL-standard spelling, e.g. `READ COMMITTED`.
    #[must_use]
    pub fn sql_name(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Type tag of a request parameter, matching the section names of the parameter JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Integer,
    String,
    Boolean,
    Float,
    Text,
    Date,
    Time,
    DateTime,
    Timestamp,
}

impl ParamKind {
    pub const ALL: [ParamKind; 9] = [
        ParamKind::Integer,
        ParamKind::String,
        ParamKind::Boolean,
        ParamKind::Float,
        ParamKind::Text,
        ParamKind::Date,
        ParamKind::Time,
        ParamKind::DateTime,
        ParamKind::Timestamp,
    ];

    #[must_use]
    pub fn section_name(self) -> &'static str {
        match self {
            ParamKind::Integer => "INTEGER",
            ParamKind::String => "STRING",
            ParamKind::Boolean => "BOOLEAN",
            ParamKind::Float => "FLOAT",
            ParamKind::Text => "TEXT",
            ParamKind::Date => "DATE",
            ParamKind::Time => "TIME",
            ParamKind::DateTime => "DATETIME",
            ParamKind::Timestamp => "TIMESTAMP",
        }
    }

    #[must_use]
    pub fn from_section_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.section_name() == name)
    }
}

/// A validated parameter value ready to bind.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Integer(i64),
    String(String),
    Boolean(bool),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    Timestamp(NaiveDateTime),
}

impl TypedValue {
    #[must_use]
    pub fn kind(&self) -> ParamKind {
        match self {
            TypedValue::Integer(_) => ParamKind::Integer,
            TypedValue::String(_) => ParamKind::String,
            TypedValue::Boolean(_) => ParamKind::Boolean,
            TypedValue::Float(_) => ParamKind::Float,
            TypedValue::Text(_) => ParamKind::Text,
            TypedValue::Date(_) => ParamKind::Date,
            TypedValue::Time(_) => ParamKind::Time,
            TypedValue::DateTime(_) => ParamKind::DateTime,
            TypedValue::Timestamp(_) => ParamKind::Timestamp,
        }
    }

    /// Canonical text form, used by engines that bind everything as character data.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            TypedValue::Integer(i) => i.to_string(),
            TypedValue::String(s) | TypedValue::Text(s) => s.clone(),
            TypedValue::Boolean(b) => if *b { "1" } else { "0" }.to_string(),
            TypedValue::Float(f) => f.to_string(),
            TypedValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            TypedValue::Time(t) => t.format("%H:%M:%S%.f").to_string(),
            TypedValue::DateTime(dt) | TypedValue::Timestamp(dt) => {
                dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()
            }
        }
    }
}

/// Named parameter parsed from request JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedParameter {
    pub name: String,
    pub value: TypedValue,
}

impl TypedParameter {
    #[must_use]
    pub fn new(name: impl Into<String>, value: TypedValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ParamKind {
        self.value.kind()
    }
}

/// Value read back from a result row.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    Timestamp(NaiveDateTime),
    Null,
    JSON(JsonValue),
    Blob(Vec<u8>),
}

impl CellValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            CellValue::Int(value) => Some(*value),
            CellValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        if let CellValue::Text(value) = self {
            Some(value)
        } else {
            None
        }
    }
}

/// One statement ready for an engine: positional SQL plus bound values.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query_id: String,
    pub sql: String,
    pub params: Vec<TypedValue>,
    pub timeout: Duration,
    pub isolation_level: IsolationLevel,
}

impl QueryRequest {
    #[must_use]
    pub fn new(query_id: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            sql: sql.into(),
            params: Vec::new(),
            timeout: Duration::from_secs(30),
            isolation_level: IsolationLevel::default(),
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: Vec<TypedValue>) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Outcome of one statement, with rows already serialised as a JSON array of objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub success: bool,
    pub row_count: usize,
    pub column_count: usize,
    pub affected_rows: u64,
    pub column_names: Vec<String>,
    pub data_json: String,
    pub error_message: Option<String>,
    pub execution_time_us: u64,
}

impl QueryResult {
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data_json: "[]".to_string(),
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Parse `data_json` back into JSON values.
    ///
    /// # Errors
    /// Returns [`crate::DbQueueError::JsonError`] if the payload is not valid JSON.
    pub fn rows(&self) -> Result<Vec<JsonValue>, crate::DbQueueError> {
        Ok(serde_json::from_str(&self.data_json)?)
    }
}

/// Handle for an open engine transaction.
///
/// Commit and rollback consume it, so it is finished exactly once.
#[derive(Debug)]
#[must_use = "a transaction must be committed or rolled back"]
pub struct Transaction {
    pub transaction_id: u64,
    pub isolation_level: IsolationLevel,
    pub started_at: Instant,
    pub active: bool,
}

impl Transaction {
    pub(crate) fn begin(transaction_id: u64, isolation_level: IsolationLevel) -> Self {
        Self {
            transaction_id,
            isolation_level,
            started_at: Instant::now(),
            active: true,
        }
    }
}

/// A query as submitted by a caller, owned by the queue holding it.
#[derive(Debug, Clone)]
pub struct DatabaseQuery {
    pub query_id: String,
    pub template: String,
    pub parameter_json: String,
    pub queue_type_hint: QueueType,
    pub submitted_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error_message: Option<String>,
}

impl DatabaseQuery {
    #[must_use]
    pub fn new(
        query_id: impl Into<String>,
        template: impl Into<String>,
        parameter_json: impl Into<String>,
        queue_type_hint: QueueType,
    ) -> Self {
        Self {
            query_id: query_id.into(),
            template: template.into(),
            parameter_json: parameter_json.into(),
            queue_type_hint,
            submitted_at: Utc::now(),
            processed_at: None,
            retry_count: 0,
            error_message: None,
        }
    }
}
