//! Lead and worker queues.
//!
//! Every database has one lead queue. The lead owns the persistent connection used for
//! bootstrap, migrations and heartbeats, the query cache, and a bounded set of worker
//! children, one task each. Workers never spawn children of their own.

pub mod heartbeat;
pub mod label;
pub mod lead;
pub mod scaling;
pub mod stats;
pub mod worker;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::cache::{MigrationLedger, QueryCache, QueryCacheEntry};
use crate::config::{DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_PENDING_TIMEOUT_SECS, DatabaseConfig};
use crate::engine::{EngineConnection, EngineRegistry};
use crate::error::DbQueueError;
use crate::migration::MigrationSets;
use crate::pending::PendingResultRegistry;
use crate::types::{DatabaseQuery, LEAD_QUEUE_INDEX, QueryResult, QueueType};

use label::generate_label;
use stats::{ManagerStats, QueueStats, QueueStatsSnapshot};

/// Depth above which `health_check` raises an alert.
pub const DEPTH_ALERT_THRESHOLD: usize = 10_000;
/// Tags a lead starts with.
pub const LEAD_TAGS: &str = "LSMFC";

/// State shared by every queue a manager owns.
#[derive(Debug)]
pub struct QueueContext {
    pub engines: EngineRegistry,
    pub pending: PendingResultRegistry,
    pub stats: Arc<ManagerStats>,
    pub migration_sets: MigrationSets,
    pub query_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for QueueContext {
    fn default() -> Self {
        let stats = Arc::new(ManagerStats::default());
        Self {
            engines: EngineRegistry::load(),
            pending: PendingResultRegistry::with_stats(Arc::clone(&stats)),
            stats,
            migration_sets: MigrationSets::default(),
            query_timeout: Duration::from_secs(DEFAULT_PENDING_TIMEOUT_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRole {
    Lead,
    Worker(QueueType),
}

/// Lifecycle of a lead queue. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum LeadPhase {
    Created,
    Bootstrapping,
    MigrationLoad,
    MigrationApply,
    MigrationValidate,
    Steady,
    ShuttingDown,
    Destroyed,
}

/// Everything only a lead owns.
#[derive(Debug)]
pub(crate) struct LeadState {
    pub(crate) config: DatabaseConfig,
    pub(crate) cache: RwLock<QueryCache>,
    pub(crate) children: Mutex<Vec<Arc<DatabaseQueue>>>,
    pub(crate) empty_database: AtomicBool,
    phase: watch::Sender<LeadPhase>,
}

impl LeadState {
    pub(crate) fn set_phase(&self, phase: LeadPhase) {
        self.phase.send_if_modified(|current| {
            if phase > *current {
                *current = phase;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn cache(&self) -> std::sync::RwLockReadGuard<'_, QueryCache> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn cache_mut(&self) -> std::sync::RwLockWriteGuard<'_, QueryCache> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the migration ledger, to be mutated without holding the cache lock.
    pub(crate) fn ledger(&self) -> MigrationLedger {
        self.cache().ledger().clone()
    }

    pub(crate) fn store_ledger(&self, ledger: MigrationLedger) {
        *self.cache_mut().ledger_mut() = ledger;
    }

    pub(crate) fn children(&self) -> MutexGuard<'_, Vec<Arc<DatabaseQueue>>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct HeartbeatTimes {
    pub(crate) last_heartbeat: Option<Instant>,
    pub(crate) last_connection_attempt: Option<Instant>,
}

/// Snapshot returned by [`DatabaseQueue::stats_json`].
#[derive(Debug, Serialize)]
struct QueueReport<'a> {
    label: String,
    database: &'a str,
    queue_number: i32,
    tags: String,
    is_lead: bool,
    connected: bool,
    depth: usize,
    children: usize,
    stats: QueueStatsSnapshot,
}

pub struct DatabaseQueue {
    database_name: String,
    connection_string: String,
    role: QueueRole,
    queue_number: AtomicI32,
    tags: Mutex<String>,
    parent_label: Option<String>,
    fifo: Mutex<VecDeque<DatabaseQuery>>,
    pub(crate) wake: Notify,
    /// The connection lock: every direct use of the connection goes through it.
    pub(crate) connection: AsyncMutex<Option<Box<dyn EngineConnection>>>,
    pub(crate) is_connected: AtomicBool,
    pub(crate) heartbeat: Mutex<HeartbeatTimes>,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) cancel: CancellationToken,
    busy: AtomicBool,
    last_activity: Mutex<Instant>,
    stats: QueueStats,
    task: Mutex<Option<JoinHandle<()>>>,
    pub(crate) context: Arc<QueueContext>,
    pub(crate) lead: Option<LeadState>,
}

impl std::fmt::Debug for DatabaseQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseQueue")
            .field("label", &self.label())
            .field("role", &self.role)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl DatabaseQueue {
    #[allow(clippy::too_many_arguments)]
    fn build(
        database_name: &str,
        connection_string: &str,
        role: QueueRole,
        queue_number: i32,
        tags: String,
        parent_label: Option<String>,
        cancel: CancellationToken,
        heartbeat_interval: Duration,
        context: Arc<QueueContext>,
        lead: Option<LeadState>,
    ) -> Self {
        Self {
            database_name: database_name.to_string(),
            connection_string: connection_string.to_string(),
            role,
            queue_number: AtomicI32::new(queue_number),
            tags: Mutex::new(tags),
            parent_label,
            fifo: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            connection: AsyncMutex::new(None),
            is_connected: AtomicBool::new(false),
            heartbeat: Mutex::new(HeartbeatTimes {
                last_heartbeat: None,
                last_connection_attempt: None,
            }),
            heartbeat_interval,
            cancel,
            busy: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            stats: QueueStats::default(),
            task: Mutex::new(None),
            context,
            lead,
        }
    }

    /// A standalone worker queue of type `queue_type` (unknown names become `medium`).
    ///
    /// The worker is not attached to any lead: it has queue number -1 and only its own type
    /// letter as tags. `parent_label` is carried into its log lines.
    #[must_use]
    pub fn create_worker(
        database_name: &str,
        connection_string: &str,
        queue_type: &str,
        parent_label: Option<&str>,
    ) -> Arc<Self> {
        Self::new_worker(
            database_name,
            connection_string,
            QueueType::from_name(queue_type),
            -1,
            parent_label.map(str::to_string),
            CancellationToken::new(),
            Arc::new(QueueContext::default()),
        )
    }

    pub(crate) fn new_worker(
        database_name: &str,
        connection_string: &str,
        queue_type: QueueType,
        queue_number: i32,
        parent_label: Option<String>,
        cancel: CancellationToken,
        context: Arc<QueueContext>,
    ) -> Arc<Self> {
        let heartbeat_interval = context.heartbeat_interval;
        Arc::new(Self::build(
            database_name,
            connection_string,
            QueueRole::Worker(queue_type),
            queue_number,
            queue_type.tag().to_string(),
            parent_label,
            cancel,
            heartbeat_interval,
            context,
            None,
        ))
    }

    /// A lead queue for `config`. Call [`DatabaseQueue::start`] to run it.
    #[must_use]
    pub fn create_lead(config: DatabaseConfig, context: Arc<QueueContext>) -> Arc<Self> {
        let heartbeat_interval =
            config.heartbeat_interval(context.heartbeat_interval.as_secs().max(1));
        let name = config.name.clone();
        let connection_string = config.connection_string.clone();
        let (phase, _) = watch::channel(LeadPhase::Created);
        let lead = LeadState {
            cache: RwLock::new(QueryCache::new()),
            children: Mutex::new(Vec::new()),
            empty_database: AtomicBool::new(false),
            phase,
            config,
        };
        Arc::new(Self::build(
            &name,
            &connection_string,
            QueueRole::Lead,
            0,
            LEAD_TAGS.to_string(),
            None,
            CancellationToken::new(),
            heartbeat_interval,
            context,
            Some(lead),
        ))
    }

    /// Spawn this queue's task on the current tokio runtime.
    ///
    /// # Errors
    /// Returns [`DbQueueError::ConfigError`] outside a tokio runtime or when already started.
    pub fn start(self: &Arc<Self>) -> Result<(), DbQueueError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            DbQueueError::ConfigError(format!("queues must be started inside a tokio runtime: {e}"))
        })?;
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return Err(DbQueueError::ConfigError(format!(
                "{} is already running",
                self.label()
            )));
        }
        let queue = Arc::clone(self);
        *task = Some(match self.role {
            QueueRole::Lead => handle.spawn(lead::run_lead(queue)),
            QueueRole::Worker(_) => handle.spawn(worker::run_worker(queue)),
        });
        trace!(dqm = %self.label(), "queue task started");
        Ok(())
    }

    #[must_use]
    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    #[must_use]
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    #[must_use]
    pub fn role(&self) -> QueueRole {
        self.role
    }

    /// Worker type, or `None` for a lead.
    #[must_use]
    pub fn queue_type(&self) -> Option<QueueType> {
        match self.role {
            QueueRole::Lead => None,
            QueueRole::Worker(queue_type) => Some(queue_type),
        }
    }

    /// Stats slot this queue reports into.
    #[must_use]
    pub fn queue_index(&self) -> usize {
        self.queue_type().map_or(LEAD_QUEUE_INDEX, QueueType::index)
    }

    #[must_use]
    pub fn is_lead(&self) -> bool {
        self.role == QueueRole::Lead
    }

    #[must_use]
    pub fn can_spawn_queues(&self) -> bool {
        self.is_lead()
    }

    #[must_use]
    pub fn queue_number(&self) -> i32 {
        self.queue_number.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn parent_label(&self) -> Option<&str> {
        self.parent_label.as_deref()
    }

    #[must_use]
    pub fn tags(&self) -> String {
        self.tags.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[must_use]
    pub fn has_tag(&self, tag: char) -> bool {
        self.tags.lock().unwrap_or_else(PoisonError::into_inner).contains(tag)
    }

    /// Add a capability letter; returns false if it was already present.
    pub fn add_tag(&self, tag: char) -> bool {
        let mut tags = self.tags.lock().unwrap_or_else(PoisonError::into_inner);
        if tags.contains(tag) {
            return false;
        }
        tags.push(tag);
        true
    }

    /// Remove a capability letter; returns false if it was not present.
    pub fn remove_tag(&self, tag: char) -> bool {
        let mut tags = self.tags.lock().unwrap_or_else(PoisonError::into_inner);
        let before = tags.len();
        tags.retain(|c| c != tag);
        tags.len() != before
    }

    #[must_use]
    pub fn label(&self) -> String {
        generate_label(&self.database_name, self.queue_number(), &self.tags())
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_heartbeat
    }

    #[must_use]
    pub fn last_connection_attempt(&self) -> Option<Instant> {
        self.heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_connection_attempt
    }

    fn fifo(&self) -> MutexGuard<'_, VecDeque<DatabaseQuery>> {
        self.fifo.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// How long the queue has had nothing to do, or `None` while it has work.
    #[must_use]
    pub fn idle_for(&self) -> Option<Duration> {
        if self.busy.load(Ordering::Relaxed) || self.own_depth() > 0 {
            return None;
        }
        Some(
            self.last_activity
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .elapsed(),
        )
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Relaxed);
        self.touch();
    }

    /// Submit a query.
    ///
    /// A lead forwards it to the least-loaded child of the query's type, or holds it until a
    /// child of that type exists (or runs it itself when none can be spawned).
    ///
    /// # Errors
    /// Returns [`DbQueueError::QueryError`] once shutdown has been requested.
    pub fn submit(&self, query: DatabaseQuery) -> Result<(), DbQueueError> {
        if self.shutdown_requested() {
            return Err(DbQueueError::QueryError(format!(
                "{} is shutting down",
                self.label()
            )));
        }
        match self.route_target(query.queue_type_hint) {
            Some(child) => child.enqueue(query),
            None => self.enqueue(query),
        }
        Ok(())
    }

    /// Least-loaded child of `queue_type`; ties go round-robin.
    pub(crate) fn route_target(&self, queue_type: QueueType) -> Option<Arc<DatabaseQueue>> {
        let lead = self.lead.as_ref()?;
        let candidates: Vec<Arc<DatabaseQueue>> = lead
            .children()
            .iter()
            .filter(|c| c.queue_type() == Some(queue_type) && !c.shutdown_requested())
            .cloned()
            .collect();
        let min_depth = candidates.iter().map(|c| c.own_depth()).min()?;
        let tied: Vec<&Arc<DatabaseQueue>> = candidates
            .iter()
            .filter(|c| c.own_depth() == min_depth)
            .collect();
        let turn = self.context.stats.increment_queue_selection(queue_type.index());
        let pick = usize::try_from(turn).unwrap_or(0) % tied.len().max(1);
        tied.get(pick).map(|c| Arc::clone(*c))
    }

    pub(crate) fn enqueue(&self, query: DatabaseQuery) {
        trace!(dqm = %self.label(), query_id = %query.query_id, "query queued");
        self.fifo().push_back(query);
        self.stats.record_submitted();
        self.touch();
        self.wake.notify_one();
    }

    /// Pop the oldest query without waiting.
    #[must_use]
    pub fn process_next(&self) -> Option<DatabaseQuery> {
        let mut query = self.fifo().pop_front()?;
        query.processed_at = Some(chrono::Utc::now());
        Some(query)
    }

    /// Remove held queries of one type, oldest first.
    pub(crate) fn drain_type(&self, queue_type: QueueType) -> Vec<DatabaseQuery> {
        let mut fifo = self.fifo();
        let (taken, kept): (Vec<_>, Vec<_>) = fifo
            .drain(..)
            .partition(|q| q.queue_type_hint == queue_type);
        fifo.extend(kept);
        taken
    }

    pub(crate) fn drain_all(&self) -> Vec<DatabaseQuery> {
        self.fifo().drain(..).collect()
    }

    /// Held queries per queue type, indexed by [`QueueType::index`].
    pub(crate) fn held_by_type(&self) -> [usize; 4] {
        let mut held = [0; 4];
        for query in self.fifo().iter() {
            held[query.queue_type_hint.index()] += 1;
        }
        held
    }

    /// Queries waiting in this queue alone.
    #[must_use]
    pub fn own_depth(&self) -> usize {
        self.fifo().len()
    }

    /// Queries waiting here and, for a lead, in all its children.
    #[must_use]
    pub fn depth(&self) -> usize {
        let children: usize = self
            .children()
            .iter()
            .map(|child| child.own_depth())
            .sum();
        self.own_depth() + children
    }

    #[must_use]
    pub fn children(&self) -> Vec<Arc<DatabaseQueue>> {
        self.lead
            .as_ref()
            .map(|lead| lead.children().clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn child_count(&self) -> usize {
        self.lead.as_ref().map_or(0, |lead| lead.children().len())
    }

    /// False once shutdown is requested or while disconnected.
    pub fn health_check(&self) -> bool {
        if self.shutdown_requested() || !self.is_connected() {
            return false;
        }
        let depth = self.depth();
        if depth > DEPTH_ALERT_THRESHOLD {
            warn!(dqm = %self.label(), alert = true, depth, "queue depth exceeds {DEPTH_ALERT_THRESHOLD}");
        }
        true
    }

    /// Cached query by reference. Workers have no cache and always miss.
    #[must_use]
    pub fn lookup_cache(&self, query_ref: i64) -> Option<QueryCacheEntry> {
        self.lead.as_ref()?.cache().lookup(query_ref).cloned()
    }

    /// Add a query template to a lead's cache.
    ///
    /// # Errors
    /// Returns [`DbQueueError::QueryError`] for a worker, a non-positive or a duplicate ref.
    pub fn add_cache_entry(&self, entry: QueryCacheEntry) -> Result<(), DbQueueError> {
        let lead = self.lead.as_ref().ok_or_else(|| {
            DbQueueError::QueryError(format!("{} has no query cache", self.label()))
        })?;
        lead.cache_mut().add_entry(entry)
    }

    /// `(available, loaded, applied)` migration counters; all zero for a worker.
    #[must_use]
    pub fn migration_status(&self) -> (i64, i64, i64) {
        self.lead.as_ref().map_or((0, 0, 0), |lead| {
            let cache = lead.cache();
            let ledger = cache.ledger();
            (ledger.available(), ledger.loaded(), ledger.applied())
        })
    }

    #[must_use]
    pub fn is_empty_database(&self) -> bool {
        self.lead
            .as_ref()
            .is_some_and(|lead| lead.empty_database.load(Ordering::Relaxed))
    }

    /// Current lifecycle phase; `None` for a worker.
    #[must_use]
    pub fn phase(&self) -> Option<LeadPhase> {
        self.lead.as_ref().map(|lead| *lead.phase.borrow())
    }

    /// Wait for a lead to reach [`LeadPhase::Steady`].
    ///
    /// # Errors
    /// Returns [`DbQueueError::TimeoutError`] if it does not get there in time, and
    /// [`DbQueueError::QueryError`] for a worker or a lead already shutting down.
    pub async fn wait_until_steady(&self, timeout: Duration) -> Result<(), DbQueueError> {
        let lead = self.lead.as_ref().ok_or_else(|| {
            DbQueueError::QueryError(format!("{} is not a lead queue", self.label()))
        })?;
        let mut phases = lead.phase.subscribe();
        let reached = tokio::time::timeout(timeout, phases.wait_for(|p| *p >= LeadPhase::Steady))
            .await
            .map_err(|_| {
                DbQueueError::TimeoutError(format!("{} did not reach steady state", self.label()))
            })?
            .map(|phase| *phase)
            .map_err(|_| DbQueueError::QueryError("lead queue dropped".into()))?;
        if reached == LeadPhase::Steady {
            Ok(())
        } else {
            Err(DbQueueError::QueryError(format!(
                "{} is {reached:?}",
                self.label()
            )))
        }
    }

    /// # Errors
    /// Returns [`DbQueueError::JsonError`] if serialisation fails.
    pub fn stats_json(&self) -> Result<String, DbQueueError> {
        let report = QueueReport {
            label: self.label(),
            database: &self.database_name,
            queue_number: self.queue_number(),
            tags: self.tags(),
            is_lead: self.is_lead(),
            connected: self.is_connected(),
            depth: self.depth(),
            children: self.child_count(),
            stats: self.stats.snapshot(),
        };
        Ok(serde_json::to_string(&report)?)
    }

    #[must_use]
    pub fn stats(&self) -> QueueStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn record_outcome(&self, result: &QueryResult) {
        if result.success {
            self.stats.record_completed(result.execution_time_us);
        } else {
            self.stats.record_failed(result.execution_time_us);
        }
    }

    /// Cancel the task and wait for it to finish.
    pub(crate) async fn join_task(&self) {
        self.cancel.cancel();
        self.wake.notify_one();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(dqm = %self.label(), "queue task ended abnormally: {e}");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_task_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Close the persistent connection, if any.
    pub(crate) async fn release_connection(&self) {
        let conn = self.connection.lock().await.take();
        if let Some(mut conn) = conn {
            if let Err(e) = conn.disconnect().await {
                debug!(dqm = %self.label(), "disconnect failed: {e}");
            }
        }
        self.is_connected.store(false, Ordering::Relaxed);
    }

    /// Join the task, close the connection, and hand back unprocessed queries.
    pub(crate) async fn stop(&self) -> Vec<DatabaseQuery> {
        self.join_task().await;
        self.release_connection().await;
        self.drain_all()
    }

    pub(crate) fn fail_queries(&self, queries: Vec<DatabaseQuery>, reason: &str) {
        for query in queries {
            let result = QueryResult::failure(reason);
            self.record_outcome(&result);
            self.context.stats.record_failure(query.queue_type_hint.index(), 0);
            self.context.pending.complete(&query.query_id, result);
        }
    }

    /// Shut the queue down: stop its task, join all children, then release the connection
    /// and, for a lead, destroy the cache. Queries still waiting fail with an error result.
    pub async fn shutdown(&self) {
        if let Some(lead) = &self.lead {
            lead.set_phase(LeadPhase::ShuttingDown);
        }
        debug!(dqm = %self.label(), "shutting down");
        self.join_task().await;

        let children: Vec<Arc<DatabaseQueue>> = self
            .lead
            .as_ref()
            .map(|lead| lead.children().drain(..).collect())
            .unwrap_or_default();
        for child in children {
            let queries = child.stop().await;
            child.fail_queries(queries, "queue shut down");
            trace!(dqm = %child.label(), "child queue stopped");
        }
        self.release_connection().await;
        let leftovers = self.drain_all();
        self.fail_queries(leftovers, "queue shut down");

        if let Some(lead) = &self.lead {
            *lead.cache_mut() = QueryCache::new();
            lead.set_phase(LeadPhase::Destroyed);
        }
        debug!(dqm = %self.label(), "shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_defaults() {
        let worker = DatabaseQueue::create_worker("testdb", "sqlite:///tmp/test.db", "medium", None);
        assert!(!worker.is_lead());
        assert!(!worker.can_spawn_queues());
        assert_eq!(worker.tags(), "M");
        assert_eq!(worker.queue_number(), -1);
        assert_eq!(worker.queue_type(), Some(QueueType::Medium));
        assert_eq!(worker.label(), "DQM-testdb-00-M");
        assert!(worker.lookup_cache(1).is_none());
        assert_eq!(worker.phase(), None);

        let odd = DatabaseQueue::create_worker("testdb", "sqlite::memory:", "bogus", Some("DQM-testdb-00-SMFC"));
        assert_eq!(odd.queue_type(), Some(QueueType::Medium));
        assert_eq!(odd.parent_label(), Some("DQM-testdb-00-SMFC"));
    }

    #[test]
    fn tags_and_fifo() {
        let worker = DatabaseQueue::create_worker("db", "sqlite::memory:", "fast", None);
        assert!(worker.add_tag('C'));
        assert!(!worker.add_tag('C'));
        assert!(worker.has_tag('F') && worker.has_tag('C'));
        assert!(worker.remove_tag('C'));
        assert!(!worker.remove_tag('C'));
        assert_eq!(worker.tags(), "F");

        assert!(worker.process_next().is_none());
        for id in ["a", "b"] {
            worker
                .submit(DatabaseQuery::new(id, "SELECT 1", "{}", QueueType::Fast))
                .expect("submit");
        }
        assert_eq!(worker.depth(), 2);
        assert!(worker.idle_for().is_none());
        let first = worker.process_next().expect("first");
        assert_eq!(first.query_id, "a");
        assert!(first.processed_at.is_some());
        assert_eq!(worker.own_depth(), 1);
        assert_eq!(worker.stats().submitted, 2);
    }

    #[test]
    fn lead_defaults_and_cache() -> Result<(), DbQueueError> {
        let config = DatabaseConfig::builder("acuranzo", "sqlite::memory:").build()?;
        let lead = DatabaseQueue::create_lead(config, Arc::new(QueueContext::default()));
        assert!(lead.is_lead() && lead.can_spawn_queues());
        assert_eq!(lead.tags(), LEAD_TAGS);
        assert_eq!(lead.queue_number(), 0);
        assert_eq!(lead.label(), "DQM-acuranzo-00-SMFC");
        assert_eq!(lead.phase(), Some(LeadPhase::Created));
        assert!(!lead.health_check());

        let entry = QueryCacheEntry::new(1, "SELECT * FROM users", "all users", QueueType::Slow, 60);
        lead.add_cache_entry(entry.clone())?;
        assert_eq!(lead.lookup_cache(1), Some(entry));
        assert!(lead.lookup_cache(0).is_none());
        assert!(lead.lookup_cache(-1).is_none());
        Ok(())
    }

    #[test]
    fn lead_holds_queries_without_children() -> Result<(), DbQueueError> {
        let config = DatabaseConfig::builder("db", "sqlite::memory:").build()?;
        let lead = DatabaseQueue::create_lead(config, Arc::new(QueueContext::default()));
        lead.submit(DatabaseQuery::new("q1", "SELECT 1", "", QueueType::Fast))?;
        lead.submit(DatabaseQuery::new("q2", "SELECT 2", "", QueueType::Slow))?;
        assert_eq!(lead.held_by_type(), [1, 0, 1, 0]);
        let fast = lead.drain_type(QueueType::Fast);
        assert_eq!(fast.len(), 1);
        assert_eq!(lead.depth(), 1);
        Ok(())
    }
}
