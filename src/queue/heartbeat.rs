//! Connection health for queues.
//!
//! None of these functions return errors: an unreachable database is an ordinary state that
//! the next heartbeat retries.

use std::sync::PoisonError;
use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::connstring::{ConnectionConfig, mask_connection_string};
use crate::queue::DatabaseQueue;

/// Record heartbeat timestamps and connect if the queue has no connection yet.
pub async fn start_heartbeat(queue: &DatabaseQueue) {
    {
        let mut times = queue.heartbeat.lock().unwrap_or_else(PoisonError::into_inner);
        times.last_heartbeat = Some(Instant::now());
    }
    if !queue.is_connected() {
        check_connection(queue).await;
    }
}

/// Make sure the queue holds a live connection, connecting if needed.
///
/// Returns false for an empty or unparsable connection string and for an unreachable
/// database.
pub async fn check_connection(queue: &DatabaseQueue) -> bool {
    let label = queue.label();
    if let Err(e) = ConnectionConfig::parse(queue.connection_string()) {
        debug!(dqm = %label, "invalid connection string: {e}");
        queue.is_connected.store(false, Ordering::Relaxed);
        return false;
    }

    let mut conn = queue.connection.lock().await;
    if let Some(live) = conn.as_mut() {
        if live.health_check().await {
            queue.is_connected.store(true, Ordering::Relaxed);
            return true;
        }
        warn!(dqm = %label, "connection failed its health check; reconnecting");
        *conn = None;
    }

    {
        let mut times = queue.heartbeat.lock().unwrap_or_else(PoisonError::into_inner);
        times.last_connection_attempt = Some(Instant::now());
    }
    match queue
        .context
        .engines
        .connect(queue.connection_string(), &label)
        .await
    {
        Ok(new_conn) => {
            *conn = Some(new_conn);
            queue.is_connected.store(true, Ordering::Relaxed);
            info!(
                dqm = %label,
                target = %mask_connection_string(queue.connection_string()),
                "connected"
            );
            true
        }
        Err(e) => {
            queue.is_connected.store(false, Ordering::Relaxed);
            warn!(
                dqm = %label,
                target = %mask_connection_string(queue.connection_string()),
                "connection failed: {e}"
            );
            false
        }
    }
}

/// One heartbeat: ping a live connection, or try to reconnect a dropped one.
pub async fn perform_heartbeat(queue: &DatabaseQueue) -> bool {
    {
        let mut times = queue.heartbeat.lock().unwrap_or_else(PoisonError::into_inner);
        times.last_heartbeat = Some(Instant::now());
    }
    let was_connected = queue.is_connected();
    let healthy = check_connection(queue).await;
    if was_connected && !healthy {
        warn!(dqm = %queue.label(), "lost connection");
    } else if !was_connected && healthy {
        info!(dqm = %queue.label(), "reconnected");
    }
    healthy && queue.health_check()
}

/// Whether the heartbeat interval has passed since the last heartbeat.
#[must_use]
pub fn heartbeat_due(queue: &DatabaseQueue) -> bool {
    queue
        .last_heartbeat()
        .is_none_or(|last| last.elapsed() >= queue.heartbeat_interval)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_connection_strings_are_unhealthy() -> Result<(), Box<dyn std::error::Error>> {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            for conn_str in ["", "   ", "postgresql://", "mysql://user@host/"] {
                let queue = DatabaseQueue::create_worker("db", conn_str, "fast", None);
                assert!(!check_connection(&queue).await, "{conn_str:?}");
                assert!(!perform_heartbeat(&queue).await, "{conn_str:?}");
                assert!(!queue.is_connected());
                assert!(queue.last_heartbeat().is_some());
            }
        });
        Ok(())
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn connects_and_pings_sqlite() -> Result<(), Box<dyn std::error::Error>> {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            let queue = DatabaseQueue::create_worker("db", "sqlite::memory:", "fast", None);
            assert!(heartbeat_due(&queue));
            start_heartbeat(&queue).await;
            assert!(queue.is_connected());
            assert!(queue.last_connection_attempt().is_some());
            assert!(!heartbeat_due(&queue));
            assert!(perform_heartbeat(&queue).await);
        });
        Ok(())
    }
}
