//! The queue manager: registry of lead queues plus the entry points callers use.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::QueryCacheEntry;
use crate::config::{DatabaseConfig, OrchestratorConfig};
use crate::error::DbQueueError;
use crate::migration::MigrationSet;
use crate::pending::QueryStatus;
use crate::queue::{DatabaseQueue, QueueContext};
use crate::types::{DatabaseQuery, QueryResult, QueueType};

/// Owns every lead queue in the process, keyed by database name.
#[derive(Debug)]
pub struct QueueManager {
    databases: RwLock<HashMap<String, Arc<DatabaseQueue>>>,
    capacity: usize,
    context: Arc<QueueContext>,
}

impl QueueManager {
    /// Manager for up to `capacity` databases.
    ///
    /// # Errors
    /// Returns [`DbQueueError::AllocationError`] if the registry cannot be reserved.
    pub fn new(capacity: usize) -> Result<Self, DbQueueError> {
        Self::with_context(capacity, QueueContext::default())
    }

    /// # Errors
    /// As [`QueueManager::new`].
    pub fn with_context(capacity: usize, context: QueueContext) -> Result<Self, DbQueueError> {
        let mut databases = HashMap::new();
        databases.try_reserve(capacity).map_err(|e| {
            DbQueueError::AllocationError(format!("cannot reserve {capacity} database slots: {e}"))
        })?;
        Ok(Self {
            databases: RwLock::new(databases),
            capacity,
            context: Arc::new(context),
        })
    }

    /// Build a manager and start every enabled database in `config`.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    /// Returns the first registration or startup failure.
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self, DbQueueError> {
        config.validate()?;
        let context = QueueContext {
            query_timeout: config.pending_timeout(),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs.max(1)),
            ..QueueContext::default()
        };
        let manager = Self::with_context(config.max_databases, context)?;
        for database in config.databases.iter().filter(|d| d.enabled) {
            manager.start_database(database.clone())?;
        }
        Ok(manager)
    }

    #[must_use]
    pub fn context(&self) -> &Arc<QueueContext> {
        &self.context
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.databases.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make an in-memory migration set resolvable as `PAYLOAD:<design>`.
    pub fn register_migration_set(&self, set: MigrationSet) {
        self.context.migration_sets.register(set);
    }

    /// Register a lead queue under its database name.
    ///
    /// Queues built with [`QueueManager::context`] report into this manager's pending
    /// results and stats.
    ///
    /// # Errors
    /// Returns [`DbQueueError::ConfigError`] for a worker queue, a full registry, or a name
    /// already present.
    pub fn add_database(&self, queue: Arc<DatabaseQueue>) -> Result<(), DbQueueError> {
        if !queue.is_lead() {
            return Err(DbQueueError::ConfigError(format!(
                "{} is not a lead queue",
                queue.label()
            )));
        }
        let mut databases = self.databases.write().unwrap_or_else(PoisonError::into_inner);
        if databases.contains_key(queue.database_name()) {
            return Err(DbQueueError::ConfigError(format!(
                "database '{}' is already registered",
                queue.database_name()
            )));
        }
        if databases.len() >= self.capacity {
            return Err(DbQueueError::ConfigError(format!(
                "cannot add '{}': all {} database slots are in use",
                queue.database_name(),
                self.capacity
            )));
        }
        databases.insert(queue.database_name().to_string(), queue);
        Ok(())
    }

    /// Lead queue for `name`, if registered.
    #[must_use]
    pub fn get_database(&self, name: &str) -> Option<Arc<DatabaseQueue>> {
        self.databases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    #[must_use]
    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .databases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Create a lead for `config`, register it, and start its task.
    ///
    /// # Errors
    /// Returns [`DbQueueError::ConfigError`] for an invalid or disabled config, a full
    /// registry, a duplicate name, or a call outside a tokio runtime.
    pub fn start_database(&self, config: DatabaseConfig) -> Result<Arc<DatabaseQueue>, DbQueueError> {
        config.validate()?;
        if !config.enabled {
            return Err(DbQueueError::ConfigError(format!(
                "database '{}' is disabled",
                config.name
            )));
        }
        let queue = DatabaseQueue::create_lead(config, Arc::clone(&self.context));
        self.add_database(Arc::clone(&queue))?;
        if let Err(e) = queue.start() {
            self.databases
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(queue.database_name());
            return Err(e);
        }
        info!(dqm = %queue.label(), "database queue started");
        Ok(queue)
    }

    /// Queue a query for `database`.
    ///
    /// Returns false for an unknown database, an empty template, a queue type hint that is
    /// not one of `slow|medium|fast|cache` (an empty hint means `medium`), a query id that is
    /// already pending, or a queue that is shutting down.
    pub fn submit_query(
        &self,
        database: &str,
        query_id: &str,
        template: &str,
        parameters_json: &str,
        queue_type_hint: &str,
    ) -> bool {
        let Some(queue) = self.get_database(database) else {
            debug!(database, query_id, "submit rejected: unknown database");
            return false;
        };
        if template.trim().is_empty() {
            debug!(dqm = %queue.label(), query_id, "submit rejected: empty template");
            return false;
        }
        let queue_type = if queue_type_hint.is_empty() {
            QueueType::Medium
        } else if let Some(queue_type) = QueueType::parse(queue_type_hint) {
            queue_type
        } else {
            debug!(dqm = %queue.label(), query_id, queue_type_hint, "submit rejected: unknown queue type");
            return false;
        };
        let index = queue_type.index();
        let pending = &self.context.pending;
        if let Err(e) = pending.register_for_queue(query_id, index, self.context.query_timeout) {
            debug!(dqm = %queue.label(), "submit rejected: {e}");
            return false;
        }
        let query = DatabaseQuery::new(query_id, template, parameters_json, queue_type);
        if let Err(e) = queue.submit(query) {
            pending.forget(query_id);
            debug!(dqm = %queue.label(), "submit rejected: {e}");
            return false;
        }
        self.context.stats.record_submission(index);
        true
    }

    #[must_use]
    pub fn query_status(&self, query_id: &str) -> Option<QueryStatus> {
        self.context.pending.status(query_id)
    }

    /// Wait for a submitted query's result.
    ///
    /// # Errors
    /// Returns [`DbQueueError::TimeoutError`] on expiry and [`DbQueueError::QueryError`] for
    /// an unknown id.
    pub async fn wait_for_result(&self, query_id: &str) -> Result<QueryResult, DbQueueError> {
        self.context.pending.wait(query_id).await
    }

    /// Resolve a public query reference against a database's cache.
    #[must_use]
    pub fn lookup_cache_entry(&self, database: &str, query_ref: i64) -> Option<QueryCacheEntry> {
        self.get_database(database)?.lookup_cache(query_ref)
    }

    pub fn record_submission(&self, index: usize) {
        self.context.stats.record_submission(index);
    }

    pub fn record_completion(&self, index: usize, execution_time_us: u64) {
        self.context.stats.record_completion(index, execution_time_us);
    }

    pub fn record_failure(&self, index: usize) {
        self.context.stats.record_failure(index, 0);
    }

    pub fn record_timeout(&self, index: usize) {
        self.context.stats.record_timeout(index);
    }

    pub fn increment_queue_selection(&self, index: usize) -> u64 {
        self.context.stats.increment_queue_selection(index)
    }

    /// # Errors
    /// Returns [`DbQueueError::JsonError`] if serialisation fails.
    pub fn stats_json(&self) -> Result<String, DbQueueError> {
        self.context.stats.stats_json()
    }

    #[must_use]
    pub fn stats_string(&self) -> String {
        self.context.stats.stats_string()
    }

    /// Shut down every database, leads and their children, and empty the registry.
    pub async fn shutdown(&self) {
        let queues: Vec<Arc<DatabaseQueue>> = self
            .databases
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, queue)| queue)
            .collect();
        for queue in queues {
            queue.shutdown().await;
        }
        let dropped = self.context.pending.cleanup_expired();
        if dropped > 0 {
            warn!(dropped, "expired results discarded at shutdown");
        }
        info!("queue manager shut down");
    }
}
