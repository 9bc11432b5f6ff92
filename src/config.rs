//! Orchestrator configuration, loadable from JSON or built in code.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DbQueueError;
use crate::types::QueueType;

pub const DEFAULT_MAX_DATABASES: usize = 10;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_PENDING_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_CHILD_QUEUES: usize = 8;
pub const DEFAULT_MAX_PER_TYPE: usize = 3;
pub const DEFAULT_IDLE_GRACE_SECS: u64 = 60;
pub const DEFAULT_SCALE_UP_DEPTH: usize = 10;

fn default_max_databases() -> usize {
    DEFAULT_MAX_DATABASES
}
fn default_heartbeat_interval_secs() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}
fn default_pending_timeout_secs() -> u64 {
    DEFAULT_PENDING_TIMEOUT_SECS
}
fn default_max_child_queues() -> usize {
    DEFAULT_MAX_CHILD_QUEUES
}
fn default_max_per_type() -> usize {
    DEFAULT_MAX_PER_TYPE
}
fn default_idle_grace_secs() -> u64 {
    DEFAULT_IDLE_GRACE_SECS
}
fn default_scale_up_depth() -> usize {
    DEFAULT_SCALE_UP_DEPTH
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_databases")]
    pub max_databases: usize,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_pending_timeout_secs")]
    pub pending_timeout_secs: u64,
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_databases: DEFAULT_MAX_DATABASES,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            pending_timeout_secs: DEFAULT_PENDING_TIMEOUT_SECS,
            databases: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    /// # Errors
    /// Returns [`DbQueueError::JsonError`] for malformed JSON and
    /// [`DbQueueError::ConfigError`] when a database entry is invalid.
    pub fn from_json_str(json: &str) -> Result<Self, DbQueueError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// As [`OrchestratorConfig::from_json_str`], plus [`DbQueueError::ConfigError`] when the
    /// file cannot be read.
    pub fn from_path(path: &Path) -> Result<Self, DbQueueError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            DbQueueError::ConfigError(format!("cannot read '{}': {e}", path.display()))
        })?;
        Self::from_json_str(&json)
    }

    /// # Errors
    /// Returns [`DbQueueError::ConfigError`] naming the first problem found.
    pub fn validate(&self) -> Result<(), DbQueueError> {
        if self.max_databases == 0 {
            return Err(DbQueueError::ConfigError(
                "max_databases must be at least 1".into(),
            ));
        }
        let enabled = self.databases.iter().filter(|d| d.enabled).count();
        if enabled > self.max_databases {
            return Err(DbQueueError::ConfigError(format!(
                "{enabled} databases enabled but max_databases is {}",
                self.max_databases
            )));
        }
        for database in &self.databases {
            database.validate()?;
        }
        Ok(())
    }

    #[must_use]
    pub fn pending_timeout(&self) -> Duration {
        Duration::from_secs(self.pending_timeout_secs)
    }
}

/// Worker counts for one queue type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueScaleConfig {
    /// Workers launched when the lead reaches steady state.
    #[serde(default)]
    pub start: usize,
    /// Workers never scaled below.
    #[serde(default)]
    pub min: usize,
    #[serde(default = "default_max_per_type")]
    pub max: usize,
}

impl Default for QueueScaleConfig {
    fn default() -> Self {
        Self {
            start: 0,
            min: 0,
            max: DEFAULT_MAX_PER_TYPE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStartConfig {
    #[serde(default)]
    pub slow: QueueScaleConfig,
    #[serde(default)]
    pub medium: QueueScaleConfig,
    #[serde(default)]
    pub fast: QueueScaleConfig,
    #[serde(default)]
    pub cache: QueueScaleConfig,
}

impl QueueStartConfig {
    #[must_use]
    pub fn for_type(&self, queue_type: QueueType) -> QueueScaleConfig {
        match queue_type {
            QueueType::Slow => self.slow,
            QueueType::Medium => self.medium,
            QueueType::Fast => self.fast,
            QueueType::Cache => self.cache,
        }
    }

    fn for_type_mut(&mut self, queue_type: QueueType) -> &mut QueueScaleConfig {
        match queue_type {
            QueueType::Slow => &mut self.slow,
            QueueType::Medium => &mut self.medium,
            QueueType::Fast => &mut self.fast,
            QueueType::Cache => &mut self.cache,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingConfig {
    #[serde(default = "default_idle_grace_secs")]
    pub idle_grace_secs: u64,
    /// Depth every child of a type must reach before another is added.
    #[serde(default = "default_scale_up_depth")]
    pub scale_up_depth: usize,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            idle_grace_secs: DEFAULT_IDLE_GRACE_SECS,
            scale_up_depth: DEFAULT_SCALE_UP_DEPTH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    pub connection_string: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub bootstrap_query: Option<String>,
    #[serde(default)]
    pub auto_migration: bool,
    #[serde(default)]
    pub test_migration: bool,
    /// `PAYLOAD:<design>` or a directory of migration scripts.
    #[serde(default)]
    pub migrations: Option<String>,
    #[serde(default)]
    pub schema: String,
    #[serde(default = "default_max_child_queues")]
    pub max_child_queues: usize,
    #[serde(default)]
    pub queues: QueueStartConfig,
    #[serde(default)]
    pub scaling: ScalingConfig,
    #[serde(default)]
    pub heartbeat_interval_secs: Option<u64>,
}

impl DatabaseConfig {
    #[must_use]
    pub fn builder(
        name: impl Into<String>,
        connection_string: impl Into<String>,
    ) -> DatabaseConfigBuilder {
        DatabaseConfigBuilder::new(name, connection_string)
    }

    /// # Errors
    /// Returns [`DbQueueError::ConfigError`] for a missing name or connection string, or
    /// starting worker counts the child limit cannot hold.
    pub fn validate(&self) -> Result<(), DbQueueError> {
        if self.name.trim().is_empty() {
            return Err(DbQueueError::ConfigError("name is required".into()));
        }
        if self.connection_string.trim().is_empty() {
            return Err(DbQueueError::ConfigError(format!(
                "connection_string is required for '{}'",
                self.name
            )));
        }
        let starting: usize = QueueType::ALL
            .iter()
            .map(|t| self.queues.for_type(*t).start)
            .sum();
        if starting > self.max_child_queues {
            return Err(DbQueueError::ConfigError(format!(
                "'{}' starts {starting} workers but max_child_queues is {}",
                self.name, self.max_child_queues
            )));
        }
        Ok(())
    }

    /// Heartbeat interval for this database, falling back to `default_secs`.
    #[must_use]
    pub fn heartbeat_interval(&self, default_secs: u64) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.unwrap_or(default_secs))
    }
}

/// Fluent builder for [`DatabaseConfig`].
#[derive(Debug, Clone)]
pub struct DatabaseConfigBuilder {
    config: DatabaseConfig,
}

impl DatabaseConfigBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>, connection_string: impl Into<String>) -> Self {
        Self {
            config: DatabaseConfig {
                name: name.into(),
                connection_string: connection_string.into(),
                enabled: true,
                bootstrap_query: None,
                auto_migration: false,
                test_migration: false,
                migrations: None,
                schema: String::new(),
                max_child_queues: DEFAULT_MAX_CHILD_QUEUES,
                queues: QueueStartConfig::default(),
                scaling: ScalingConfig::default(),
                heartbeat_interval_secs: None,
            },
        }
    }

    #[must_use]
    pub fn bootstrap_query(mut self, sql: impl Into<String>) -> Self {
        self.config.bootstrap_query = Some(sql.into());
        self
    }

    /// Enable automatic migration from `PAYLOAD:<design>` or a script directory.
    #[must_use]
    pub fn migrations(mut self, source: impl Into<String>) -> Self {
        self.config.migrations = Some(source.into());
        self.config.auto_migration = true;
        self
    }

    #[must_use]
    pub fn test_migration(mut self, enabled: bool) -> Self {
        self.config.test_migration = enabled;
        self
    }

    #[must_use]
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.config.schema = schema.into();
        self
    }

    #[must_use]
    pub fn max_child_queues(mut self, max: usize) -> Self {
        self.config.max_child_queues = max;
        self
    }

    #[must_use]
    pub fn queue(mut self, queue_type: QueueType, scale: QueueScaleConfig) -> Self {
        *self.config.queues.for_type_mut(queue_type) = scale;
        self
    }

    #[must_use]
    pub fn scaling(mut self, scaling: ScalingConfig) -> Self {
        self.config.scaling = scaling;
        self
    }

    #[must_use]
    pub fn heartbeat_interval_secs(mut self, secs: u64) -> Self {
        self.config.heartbeat_interval_secs = Some(secs);
        self
    }

    /// # Errors
    /// Returns [`DbQueueError::ConfigError`] as [`DatabaseConfig::validate`] does.
    pub fn build(self) -> Result<DatabaseConfig, DbQueueError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_defaults() -> Result<(), DbQueueError> {
        let config = OrchestratorConfig::from_json_str(
            r#"{"databases":[{"name":"acuranzo","connection_string":"sqlite:///tmp/a.db",
                "queues":{"fast":{"start":1}}}]}"#,
        )?;
        assert_eq!(config.max_databases, 10);
        assert_eq!(config.heartbeat_interval_secs, 30);
        let db = &config.databases[0];
        assert!(db.enabled);
        assert!(!db.auto_migration);
        assert_eq!(db.max_child_queues, 8);
        assert_eq!(db.queues.fast, QueueScaleConfig { start: 1, min: 0, max: 3 });
        assert_eq!(db.scaling.scale_up_depth, 10);
        assert_eq!(db.heartbeat_interval(5), Duration::from_secs(5));
        Ok(())
    }

    #[test]
    fn builder_validates() {
        let err = DatabaseConfig::builder("", "sqlite::memory:").build().expect_err("no name");
        assert!(matches!(err, DbQueueError::ConfigError(m) if m == "name is required"));
        assert!(DatabaseConfig::builder("db", " ").build().is_err());

        let too_many = DatabaseConfig::builder("db", "sqlite::memory:")
            .max_child_queues(1)
            .queue(QueueType::Fast, QueueScaleConfig { start: 2, min: 0, max: 3 })
            .build();
        assert!(too_many.is_err());

        let ok = DatabaseConfig::builder("db", "sqlite::memory:")
            .migrations("PAYLOAD:db")
            .build()
            .expect("valid");
        assert!(ok.auto_migration);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            OrchestratorConfig::from_json_str("{"),
            Err(DbQueueError::JsonError(_))
        ));
        assert!(matches!(
            OrchestratorConfig::from_json_str(r#"{"max_databases":0}"#),
            Err(DbQueueError::ConfigError(_))
        ));
    }
}
