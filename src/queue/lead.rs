//! The lead queue's task: startup sequence, then the steady-state tick.
//!
//! Startup runs connect, bootstrap, migrations, validation and the configured starting
//! workers in order. After that the lead ticks once a second (or when woken by a
//! submission) to heartbeat, scale its children and dispatch held queries.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::cache::{LedgerEntry, LedgerKind, QueryCacheEntry};
use crate::connstring::normalize_engine_name;
use crate::error::{DbQueueError, MigrationStage};
use crate::migration::{
    MAX_MIGRATION_CYCLES, MigrationAction, MigrationSet, apply_migrations, determine_action,
    load_migrations, log_status, reverse_migrations,
};
use crate::queue::heartbeat::{heartbeat_due, perform_heartbeat, start_heartbeat};
use crate::queue::scaling::{ChildSnapshot, ScalingAction, next_queue_number, plan};
use crate::queue::worker::execute_query;
use crate::queue::{DatabaseQueue, LeadPhase, LeadState};
use crate::types::{EngineType, QueryRequest, QueueType};

/// Probe issued when no bootstrap query is configured.
pub const DEFAULT_BOOTSTRAP_PROBE: &str = "SELECT 42 AS test_value";
/// Steady-state tick.
pub const LEAD_TICK: Duration = Duration::from_secs(1);

pub(crate) async fn run_lead(queue: Arc<DatabaseQueue>) {
    let Some(lead) = queue.lead.as_ref() else {
        return;
    };
    let label = queue.label();
    info!(dqm = %label, "lead queue starting");

    start_heartbeat(&queue).await;
    if queue.shutdown_requested() {
        return;
    }

    lead.set_phase(LeadPhase::Bootstrapping);
    bootstrap(&queue, lead).await;

    if lead.config.auto_migration && !queue.shutdown_requested() {
        if let Err(e) = run_migration_cycles(&queue, lead).await {
            error!(dqm = %label, "migrations halted: {e}");
        }
    }
    if lead.config.test_migration && !queue.shutdown_requested() {
        if let Err(e) = test_migrations(&queue, lead).await {
            error!(dqm = %label, "migration test failed: {e}");
        }
    }

    lead.set_phase(LeadPhase::MigrationValidate);
    validate_migrations(&queue, lead);

    launch_starting_workers(&queue, lead);
    lead.set_phase(LeadPhase::Steady);
    info!(dqm = %label, children = queue.child_count(), "lead queue steady");

    steady_state(&queue, lead).await;
    trace!(dqm = %label, "lead loop stopped");
}

async fn steady_state(queue: &Arc<DatabaseQueue>, lead: &LeadState) {
    let mut tick = tokio::time::interval(LEAD_TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = queue.cancel.cancelled() => break,
            () = queue.wake.notified() => {}
            _ = tick.tick() => {}
        }
        if heartbeat_due(queue) {
            perform_heartbeat(queue).await;
        }
        manage_child_queues(queue, lead).await;
        dispatch_held(queue).await;
        queue.context.pending.cleanup_expired();
    }
}

/// Run the bootstrap query (or the default liveness query) and load its rows into the cache.
///
/// Failures are logged; startup continues either way.
pub(crate) async fn bootstrap(queue: &DatabaseQueue, lead: &LeadState) {
    let label = queue.label();
    let configured = lead.config.bootstrap_query.as_deref();
    let sql = configured.unwrap_or(DEFAULT_BOOTSTRAP_PROBE);
    let request = QueryRequest::new("bootstrap", sql).with_timeout(queue.context.query_timeout);

    let outcome = {
        let mut conn = queue.connection.lock().await;
        match conn.as_mut() {
            Some(conn) => conn.execute_query(&request).await,
            None => Err(DbQueueError::ConnectionError("not connected".into())),
        }
    };
    let rows = match outcome.and_then(|result| result.rows()) {
        Ok(rows) => rows,
        Err(e) => {
            error!(dqm = %label, "bootstrap query failed: {e}");
            lead.empty_database.store(true, Ordering::Relaxed);
            return;
        }
    };

    if configured.is_none() {
        debug!(dqm = %label, "no bootstrap query; database treated as empty");
        lead.empty_database.store(true, Ordering::Relaxed);
        return;
    }
    lead.empty_database.store(rows.is_empty(), Ordering::Relaxed);

    let mut cache = lead.cache_mut();
    cache.clear_entries();
    let mut queries = 0;
    for row in &rows {
        let Some(query_ref) = field_int(row, "query_ref") else {
            continue;
        };
        let query_type = field_int(row, "query_type").unwrap_or(0);
        let sql = field_text(row, &["sql_template", "code"]);
        let description = field_text(row, &["description", "name"]);
        match LedgerKind::from_code(query_type) {
            Some(LedgerKind::Applied) => cache.ledger_mut().observe_applied(query_ref),
            Some(kind) => cache.ledger_mut().record(LedgerEntry {
                number: query_ref,
                kind,
                sql,
                description,
            }),
            None => {
                let queue_type = QueueType::from_name(&field_text(row, &["queue_type"]));
                let ttl = field_int(row, "timeout")
                    .and_then(|t| u64::try_from(t).ok())
                    .unwrap_or(0);
                let entry = QueryCacheEntry::new(query_ref, sql, description, queue_type, ttl);
                match cache.add_entry(entry) {
                    Ok(()) => queries += 1,
                    Err(e) => warn!(dqm = %label, "bootstrap row skipped: {e}"),
                }
            }
        }
    }
    let ledger = cache.ledger();
    debug!(
        dqm = %label,
        rows = rows.len(),
        queries,
        loaded = ledger.loaded(),
        applied = ledger.applied(),
        "bootstrap complete"
    );
}

fn field_int(row: &JsonValue, key: &str) -> Option<i64> {
    match row.get(key)? {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn field_text(row: &JsonValue, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|key| match row.get(*key)? {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Null => None,
            other => Some(other.to_string()),
        })
        .unwrap_or_default()
}

fn engine_name(queue: &DatabaseQueue) -> &'static str {
    let engine = EngineType::from_connection_string(queue.connection_string());
    normalize_engine_name(engine.as_str()).unwrap_or("sqlite")
}

fn migration_set(queue: &DatabaseQueue, lead: &LeadState) -> Result<Arc<MigrationSet>, DbQueueError> {
    let source = lead.config.migrations.as_deref().ok_or_else(|| {
        DbQueueError::migration(MigrationStage::Module, "no migrations configured")
    })?;
    let set = queue.context.migration_sets.resolve(source)?;
    if set.is_empty() {
        return Err(DbQueueError::migration(
            MigrationStage::Module,
            format!("migration set '{}' has no migration files", set.design()),
        ));
    }
    Ok(set)
}

/// Evaluate LOAD / APPLY / NONE until nothing is left to do.
///
/// # Errors
/// Returns the first migration failure; the ledger keeps whatever progress was made.
pub(crate) async fn run_migration_cycles(
    queue: &DatabaseQueue,
    lead: &LeadState,
) -> Result<(), DbQueueError> {
    let label = queue.label();
    let set = migration_set(queue, lead)?;
    let engine = engine_name(queue);
    let schema = lead.config.schema.clone();
    {
        let mut cache = lead.cache_mut();
        if !cache.ledger_mut().set_available(set.latest_available()) {
            warn!(dqm = %label, alert = true, "database is ahead of migration set '{}'", set.design());
        }
    }

    for _ in 0..MAX_MIGRATION_CYCLES {
        if queue.shutdown_requested() {
            return Ok(());
        }
        let mut ledger = lead.ledger();
        match determine_action(&ledger) {
            MigrationAction::None => {
                log_status("Current", &ledger, &label);
                return Ok(());
            }
            MigrationAction::Load => {
                lead.set_phase(LeadPhase::MigrationLoad);
                log_status("Loading", &ledger, &label);
                let outcome = {
                    let mut conn = queue.connection.lock().await;
                    let conn = conn.as_mut().ok_or_else(|| {
                        DbQueueError::ConnectionError("not connected".into())
                    })?;
                    load_migrations(conn.as_mut(), &set, &mut ledger, engine, &schema, &label).await
                };
                lead.store_ledger(ledger);
                outcome?;
                bootstrap(queue, lead).await;
            }
            MigrationAction::Apply => {
                lead.set_phase(LeadPhase::MigrationApply);
                log_status("Updating", &ledger, &label);
                let outcome = {
                    let mut conn = queue.connection.lock().await;
                    let conn = conn.as_mut().ok_or_else(|| {
                        DbQueueError::ConnectionError("not connected".into())
                    })?;
                    apply_migrations(conn.as_mut(), &mut ledger, &label).await
                };
                lead.store_ledger(ledger);
                outcome?;
            }
        }
    }
    warn!(dqm = %label, "migrations still pending after {MAX_MIGRATION_CYCLES} cycles");
    Ok(())
}

/// Walk every reverse migration down, then apply forward again.
///
/// # Errors
/// Returns the first failure of either pass.
pub(crate) async fn test_migrations(queue: &DatabaseQueue, lead: &LeadState) -> Result<(), DbQueueError> {
    let label = queue.label();
    let mut ledger = lead.ledger();
    log_status("Testing", &ledger, &label);
    let outcome = {
        let mut conn = queue.connection.lock().await;
        let conn = conn
            .as_mut()
            .ok_or_else(|| DbQueueError::ConnectionError("not connected".into()))?;
        match reverse_migrations(conn.as_mut(), &mut ledger, &label).await {
            Ok(reversed) => {
                debug!(dqm = %label, reversed, "reverse migrations passed");
                apply_migrations(conn.as_mut(), &mut ledger, &label).await
            }
            Err(e) => Err(e),
        }
    };
    lead.store_ledger(ledger);
    outcome.map(|_| ())
}

/// Check the migration state the lead ended startup with.
///
/// An empty database reporting applied migrations is left alone (with a debug line);
/// a populated database that is behind its migration set raises an alert.
pub(crate) fn validate_migrations(queue: &DatabaseQueue, lead: &LeadState) {
    let label = queue.label();
    let ledger = lead.ledger();
    let empty = lead.empty_database.load(Ordering::Relaxed);
    if empty && ledger.applied() > 0 {
        debug!(dqm = %label, applied = ledger.applied(), "empty database reports applied migrations");
    }
    if ledger.applied() == ledger.available() {
        log_status("Current", &ledger, &label);
        return;
    }
    if empty {
        debug!(dqm = %label, "migrations incomplete on an empty database");
    } else {
        warn!(
            dqm = %label,
            alert = true,
            "Migration validation failed: Available = {}, Loaded = {}, Applied = {}",
            ledger.available(),
            ledger.loaded(),
            ledger.applied()
        );
    }
}

fn launch_starting_workers(queue: &Arc<DatabaseQueue>, lead: &LeadState) {
    for queue_type in QueueType::ALL {
        let start = lead.config.queues.for_type(queue_type).start;
        for _ in 0..start {
            if spawn_child(queue, lead, queue_type).is_none() {
                return;
            }
        }
    }
}

/// Create, start and register a worker child, handing it any held queries of its type.
pub(crate) fn spawn_child(
    queue: &Arc<DatabaseQueue>,
    lead: &LeadState,
    queue_type: QueueType,
) -> Option<Arc<DatabaseQueue>> {
    let mut children = lead.children();
    if children.len() >= lead.config.max_child_queues {
        return None;
    }
    let used: Vec<i32> = children.iter().map(|c| c.queue_number()).collect();
    let child = DatabaseQueue::new_worker(
        queue.database_name(),
        queue.connection_string(),
        queue_type,
        next_queue_number(&used),
        Some(queue.label()),
        queue.cancel.child_token(),
        Arc::clone(&queue.context),
    );
    if let Err(e) = child.start() {
        error!(dqm = %queue.label(), "could not start {queue_type} worker: {e}");
        return None;
    }
    for query in queue.drain_type(queue_type) {
        child.enqueue(query);
    }
    trace!(dqm = %queue.label(), child = %child.label(), "spawned child queue");
    children.push(Arc::clone(&child));
    Some(child)
}

/// Apply one round of scaling decisions.
pub(crate) async fn manage_child_queues(queue: &Arc<DatabaseQueue>, lead: &LeadState) {
    let snapshot: Vec<ChildSnapshot> = lead
        .children()
        .iter()
        .filter_map(|child| {
            Some(ChildSnapshot {
                number: child.queue_number(),
                queue_type: child.queue_type()?,
                depth: child.own_depth(),
                idle_for: child.idle_for(),
            })
        })
        .collect();
    let actions = plan(
        &lead.config.queues,
        &lead.config.scaling,
        queue.held_by_type(),
        &snapshot,
        lead.config.max_child_queues,
    );
    for action in actions {
        match action {
            ScalingAction::Spawn(queue_type) => {
                spawn_child(queue, lead, queue_type);
            }
            ScalingAction::Shutdown { number, .. } => {
                let removed = {
                    let mut children = lead.children();
                    children
                        .iter()
                        .position(|c| c.queue_number() == number)
                        .map(|i| children.remove(i))
                };
                if let Some(child) = removed {
                    let leftovers = child.stop().await;
                    trace!(dqm = %queue.label(), child = %child.label(), "retired idle child queue");
                    for query in leftovers {
                        route_or_hold(queue, query);
                    }
                }
            }
        }
    }
}

fn route_or_hold(queue: &DatabaseQueue, query: crate::types::DatabaseQuery) {
    match queue.route_target(query.queue_type_hint) {
        Some(child) => child.enqueue(query),
        None => queue.enqueue(query),
    }
}

/// Forward held queries to children that now exist, and run the rest on the lead's own
/// connection: a held query with no child after scaling has no child coming.
async fn dispatch_held(queue: &Arc<DatabaseQueue>) {
    for query in queue.drain_all() {
        if queue.shutdown_requested() {
            queue.enqueue(query);
            continue;
        }
        match queue.route_target(query.queue_type_hint) {
            Some(child) => child.enqueue(query),
            None => execute_query(queue, query).await,
        }
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::queue::QueueContext;

    fn lead_for(bootstrap: Option<&str>) -> Result<Arc<DatabaseQueue>, DbQueueError> {
        let mut builder = DatabaseConfig::builder("acuranzo", "sqlite::memory:");
        if let Some(sql) = bootstrap {
            builder = builder.bootstrap_query(sql);
        }
        Ok(DatabaseQueue::create_lead(builder.build()?, Arc::new(QueueContext::default())))
    }

    #[test]
    fn bootstrap_rows_fill_cache_and_ledger() -> Result<(), Box<dyn std::error::Error>> {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            let sql = "SELECT 1 AS query_ref, 0 AS query_type, 'SELECT 1' AS sql_template, \
                       'liveness' AS description, 'fast' AS queue_type, 30 AS timeout \
                       UNION ALL SELECT 1, 1000, 'CREATE TABLE a (id INT)', 'a', '', 0 \
                       UNION ALL SELECT 2, 1000, 'CREATE TABLE b (id INT)', 'b', '', 0 \
                       UNION ALL SELECT 1, 1003, '', '', '', 0";
            let queue = lead_for(Some(sql))?;
            let lead = queue.lead.as_ref().ok_or("lead")?;
            start_heartbeat(&queue).await;
            bootstrap(&queue, lead).await;

            assert!(!queue.is_empty_database());
            let entry = queue.lookup_cache(1).ok_or("cached")?;
            assert_eq!(entry.queue_type, QueueType::Fast);
            assert_eq!(entry.ttl_seconds, 30);
            assert_eq!(queue.migration_status(), (2, 2, 1));
            Ok::<(), Box<dyn std::error::Error>>(())
        })
    }

    #[test]
    fn default_bootstrap_marks_database_empty() -> Result<(), Box<dyn std::error::Error>> {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            let queue = lead_for(None)?;
            let lead = queue.lead.as_ref().ok_or("lead")?;
            start_heartbeat(&queue).await;
            bootstrap(&queue, lead).await;
            assert!(queue.is_empty_database());
            assert_eq!(queue.migration_status(), (0, 0, 0));
            Ok::<(), Box<dyn std::error::Error>>(())
        })
    }

    #[test]
    fn spawned_children_take_held_queries() -> Result<(), Box<dyn std::error::Error>> {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            let queue = lead_for(None)?;
            let lead = queue.lead.as_ref().ok_or("lead")?;
            queue.enqueue(crate::types::DatabaseQuery::new("q1", "SELECT 1", "", QueueType::Slow));
            queue.enqueue(crate::types::DatabaseQuery::new("q2", "SELECT 2", "", QueueType::Fast));

            let first = spawn_child(&queue, lead, QueueType::Slow).ok_or("spawn")?;
            let second = spawn_child(&queue, lead, QueueType::Slow).ok_or("spawn")?;
            assert_eq!((first.queue_number(), second.queue_number()), (1, 2));
            assert_eq!(first.label(), "DQM-acuranzo-01-S");
            assert_eq!(queue.held_by_type(), [0, 0, 1, 0]);
            assert_eq!(first.parent_label(), Some("DQM-acuranzo-00-SMFC"));

            queue.shutdown().await;
            assert_eq!(queue.child_count(), 0);
            assert_eq!(queue.phase(), Some(LeadPhase::Destroyed));
            Ok::<(), Box<dyn std::error::Error>>(())
        })
    }

    #[test]
    fn shutdown_joins_children_before_releasing_the_connection() -> Result<(), Box<dyn std::error::Error>> {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            let queue = lead_for(None)?;
            let lead = queue.lead.as_ref().ok_or("lead")?;
            start_heartbeat(&queue).await;
            assert!(queue.is_connected());
            let child = spawn_child(&queue, lead, QueueType::Slow).ok_or("spawn")?;
            assert!(child.is_task_running());

            // First shutdown step: the lead's own task is gone, its children are not.
            queue.join_task().await;
            assert!(queue.connection.lock().await.is_some());
            assert_eq!(queue.child_count(), 1);

            queue.shutdown().await;
            assert!(!child.is_task_running());
            assert!(!child.is_connected());
            assert!(queue.connection.lock().await.is_none());
            assert_eq!(queue.child_count(), 0);
            Ok::<(), Box<dyn std::error::Error>>(())
        })
    }

    #[test]
    fn leftovers_follow_the_routing_rules() -> Result<(), Box<dyn std::error::Error>> {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            let queue = lead_for(None)?;
            let lead = queue.lead.as_ref().ok_or("lead")?;
            let slow = spawn_child(&queue, lead, QueueType::Slow).ok_or("spawn")?;
            queue.context.pending.register("s", Duration::from_secs(5))?;

            route_or_hold(&queue, crate::types::DatabaseQuery::new("s", "SELECT 1", "", QueueType::Slow));
            route_or_hold(&queue, crate::types::DatabaseQuery::new("f", "SELECT 1", "", QueueType::Fast));
            assert_eq!(slow.stats().submitted, 1);
            assert_eq!(queue.held_by_type(), [0, 0, 1, 0]);
            assert!(queue.context.pending.wait("s").await?.success);

            queue.shutdown().await;
            Ok::<(), Box<dyn std::error::Error>>(())
        })
    }
}
