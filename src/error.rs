use std::fmt;

use thiserror::Error;

#[cfg(feature = "sqlite")]
use rusqlite;
#[cfg(feature = "mysql")]
use sqlx;
#[cfg(feature = "postgres")]
use tokio_postgres;

/// Where in the migration pipeline a failure happened.
///
/// The first three are the load stages of a single migration; each one short-circuits
/// before the connection is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStage {
    /// The migration set (design) could not be resolved.
    Module,
    /// The numbered script is not part of the set.
    File,
    /// The script failed to compile or did not produce SQL.
    Compile,
    /// The generated SQL failed against the database.
    Execute,
}

impl fmt::Display for MigrationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationStage::Module => "module",
            MigrationStage::File => "file",
            MigrationStage::Compile => "compile",
            MigrationStage::Execute => "execute",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum DbQueueError {
    #[cfg(feature = "postgres")]
    #[error(transparent)]
    PostgresError(#[from] tokio_postgres::Error),

    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    SqliteError(#[from] rusqlite::Error),

    #[cfg(feature = "mysql")]
    #[error(transparent)]
    MysqlError(#[from] sqlx::Error),

    #[error(transparent)]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Parameter error: {0}")]
    ParameterError(String),

    #[error("Migration error ({stage}): {message}")]
    MigrationError {
        stage: MigrationStage,
        message: String,
    },

    #[error("Allocation error: {0}")]
    AllocationError(String),

    #[error("Timeout: {0}")]
    TimeoutError(String),
}

impl DbQueueError {
    pub(crate) fn migration(stage: MigrationStage, message: impl Into<String>) -> Self {
        DbQueueError::MigrationError {
            stage,
            message: message.into(),
        }
    }

    /// Stage of a migration failure, if this is one.
    #[must_use]
    pub fn migration_stage(&self) -> Option<MigrationStage> {
        match self {
            DbQueueError::MigrationError { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
