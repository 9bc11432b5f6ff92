use std::sync::Arc;
use std::time::Instant;

use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::engine::elapsed_us;
use crate::error::DbQueueError;
use crate::params::{convert_named_to_positional, parse_typed_parameters};
use crate::queue::DatabaseQueue;
use crate::queue::heartbeat::{check_connection, perform_heartbeat, start_heartbeat};
use crate::types::{DatabaseQuery, EngineType, QueryRequest, QueryResult};

/// Task body of a worker queue: drain the FIFO, then sleep until woken, heartbeat, or
/// cancelled.
pub(crate) async fn run_worker(queue: Arc<DatabaseQueue>) {
    start_heartbeat(&queue).await;
    let mut heartbeat = tokio::time::interval(queue.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;
    trace!(dqm = %queue.label(), "worker running");

    loop {
        while !queue.shutdown_requested() {
            let Some(query) = queue.process_next() else {
                break;
            };
            execute_query(&queue, query).await;
        }
        tokio::select! {
            () = queue.cancel.cancelled() => break,
            () = queue.wake.notified() => {}
            _ = heartbeat.tick() => {
                perform_heartbeat(&queue).await;
            }
        }
    }
    trace!(dqm = %queue.label(), "worker stopped");
}

/// Run one query on the queue's connection and publish the outcome.
///
/// Failures become an error [`QueryResult`]; nothing here can take the loop down.
pub(crate) async fn execute_query(queue: &DatabaseQueue, mut query: DatabaseQuery) {
    let context = &queue.context;
    context.pending.mark_running(&query.query_id);
    queue.set_busy(true);
    let started = Instant::now();

    let result = match run_query(queue, &query).await {
        Ok(result) => result,
        Err(e) => {
            debug!(dqm = %queue.label(), query_id = %query.query_id, "query failed: {e}");
            query.error_message = Some(e.to_string());
            QueryResult {
                execution_time_us: elapsed_us(started),
                ..QueryResult::failure(e.to_string())
            }
        }
    };

    queue.record_outcome(&result);
    let index = query.queue_type_hint.index();
    if result.success {
        context.stats.record_completion(index, result.execution_time_us);
    } else {
        context.stats.record_failure(index, result.execution_time_us);
    }
    context.pending.complete(&query.query_id, result);
    queue.set_busy(false);
}

async fn run_query(queue: &DatabaseQueue, query: &DatabaseQuery) -> Result<QueryResult, DbQueueError> {
    let params = parse_typed_parameters(&query.parameter_json)?;
    let engine = EngineType::from_connection_string(queue.connection_string());
    let converted = convert_named_to_positional(&query.template, &params, engine)?;
    let request = QueryRequest::new(query.query_id.clone(), converted.sql.clone())
        .with_params(converted.values())
        .with_timeout(queue.context.query_timeout);

    if !queue.is_connected() && !check_connection(queue).await {
        return Err(DbQueueError::ConnectionError(format!(
            "{} has no database connection",
            queue.label()
        )));
    }
    let mut conn = queue.connection.lock().await;
    let conn = conn.as_mut().ok_or_else(|| {
        DbQueueError::ConnectionError(format!("{} has no database connection", queue.label()))
    })?;
    let result = tokio::time::timeout(request.timeout, conn.execute_query(&request))
        .await
        .map_err(|_| {
            DbQueueError::TimeoutError(format!(
                "query '{}' exceeded {:?}",
                request.query_id, request.timeout
            ))
        })??;
    if !result.success {
        return Err(DbQueueError::QueryError(
            result.error_message.unwrap_or_else(|| "query failed".into()),
        ));
    }
    Ok(result)
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::pending::QueryStatus;
    use crate::types::QueueType;
    use std::time::Duration;

    #[test]
    fn worker_executes_named_parameter_queries() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let conn_str = format!("sqlite://{}", dir.path().join("worker.db").display());
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            let worker = DatabaseQueue::create_worker("testdb", &conn_str, "fast", None);
            let pending = &worker.context.pending;
            pending.register("ok", Duration::from_secs(5))?;
            pending.register("bad", Duration::from_secs(5))?;
            worker.start()?;

            worker.submit(DatabaseQuery::new(
                "ok",
                "SELECT :userId AS user_id, :name AS name",
                r#"{"INTEGER":{"userId":123},"STRING":{"name":"ann"}}"#,
                QueueType::Fast,
            ))?;
            worker.submit(DatabaseQuery::new(
                "bad",
                "SELECT :missing",
                "{}",
                QueueType::Fast,
            ))?;

            let ok = pending.wait("ok").await?;
            assert_eq!(ok.data_json, r#"[{"user_id":123,"name":"ann"}]"#);
            let bad = pending.wait("bad").await?;
            assert!(!bad.success);
            assert!(bad.error_message.unwrap_or_default().contains(":missing"));
            assert_eq!(pending.status("bad"), Some(QueryStatus::Error));

            let stats = worker.stats();
            assert_eq!((stats.completed, stats.failed), (1, 1));
            worker.shutdown().await;
            assert!(!worker.is_connected());
            Ok::<(), Box<dyn std::error::Error>>(())
        })
    }
}
