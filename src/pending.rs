//! Results awaited by callers that submitted queries.
//!
//! Timeouts live here rather than on the queues: a query that outlives its registered
//! timeout is reported as [`QueryStatus::Timeout`] even if a worker later finishes it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;

use crate::error::DbQueueError;
use crate::queue::stats::ManagerStats;
use crate::types::QueryResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Pending,
    Running,
    Complete,
    Error,
    Timeout,
}

impl QueryStatus {
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            QueryStatus::Complete | QueryStatus::Error | QueryStatus::Timeout
        )
    }
}

#[derive(Debug)]
struct PendingEntry {
    status: QueryStatus,
    result: Option<QueryResult>,
    registered_at: Instant,
    timeout: Duration,
    queue_index: Option<usize>,
    done: Arc<Notify>,
}

impl PendingEntry {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.registered_at) >= self.timeout
    }

    /// Flip an unfinished, expired entry to `Timeout`. Returns true on the transition.
    fn expire(&mut self, now: Instant) -> bool {
        if self.status.is_finished() || !self.expired(now) {
            return false;
        }
        self.status = QueryStatus::Timeout;
        self.done.notify_waiters();
        true
    }
}

/// Timeouts of queries registered with a queue index are counted in `stats` when they
/// happen, whether or not anyone is waiting.
#[derive(Debug, Default)]
pub struct PendingResultRegistry {
    entries: Mutex<HashMap<String, PendingEntry>>,
    stats: Option<Arc<ManagerStats>>,
}

impl PendingResultRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_stats(stats: Arc<ManagerStats>) -> Self {
        Self {
            entries: Mutex::default(),
            stats: Some(stats),
        }
    }

    fn expire(&self, entry: &mut PendingEntry, now: Instant) {
        if entry.expire(now) {
            if let (Some(stats), Some(index)) = (&self.stats, entry.queue_index) {
                stats.record_timeout(index);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// # Errors
    /// Returns [`DbQueueError::QueryError`] if `query_id` is already registered.
    pub fn register(&self, query_id: &str, timeout: Duration) -> Result<(), DbQueueError> {
        self.insert(query_id, None, timeout)
    }

    /// Register a query routed to queue `index`, so its timeout can be attributed.
    ///
    /// # Errors
    /// As [`PendingResultRegistry::register`].
    pub fn register_for_queue(
        &self,
        query_id: &str,
        index: usize,
        timeout: Duration,
    ) -> Result<(), DbQueueError> {
        self.insert(query_id, Some(index), timeout)
    }

    fn insert(
        &self,
        query_id: &str,
        queue_index: Option<usize>,
        timeout: Duration,
    ) -> Result<(), DbQueueError> {
        let mut entries = self.lock();
        if entries.contains_key(query_id) {
            return Err(DbQueueError::QueryError(format!(
                "query id '{query_id}' is already pending"
            )));
        }
        entries.insert(
            query_id.to_string(),
            PendingEntry {
                status: QueryStatus::Pending,
                result: None,
                registered_at: Instant::now(),
                timeout,
                queue_index,
                done: Arc::new(Notify::new()),
            },
        );
        Ok(())
    }

    pub fn mark_running(&self, query_id: &str) {
        if let Some(entry) = self.lock().get_mut(query_id) {
            if entry.status == QueryStatus::Pending {
                entry.status = QueryStatus::Running;
            }
        }
    }

    /// Store the result of a finished query. Results for timed-out or unknown ids are dropped.
    pub fn complete(&self, query_id: &str, result: QueryResult) {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(query_id) else {
            return;
        };
        if entry.status == QueryStatus::Timeout {
            return;
        }
        entry.status = if result.success {
            QueryStatus::Complete
        } else {
            QueryStatus::Error
        };
        entry.result = Some(result);
        entry.done.notify_waiters();
    }

    /// Current status, with expiry applied.
    #[must_use]
    pub fn status(&self, query_id: &str) -> Option<QueryStatus> {
        let mut entries = self.lock();
        let entry = entries.get_mut(query_id)?;
        self.expire(entry, Instant::now());
        Some(entry.status)
    }

    /// Queue index a query was registered against, if any.
    #[must_use]
    pub fn queue_index(&self, query_id: &str) -> Option<usize> {
        self.lock().get(query_id).and_then(|e| e.queue_index)
    }

    /// Wait for a query to finish, up to its registered timeout.
    ///
    /// # Errors
    /// Returns [`DbQueueError::TimeoutError`] when the timeout passes first, and
    /// [`DbQueueError::QueryError`] for an unknown id.
    pub async fn wait(&self, query_id: &str) -> Result<QueryResult, DbQueueError> {
        loop {
            let (done, deadline) = {
                let mut entries = self.lock();
                let entry = entries.get_mut(query_id).ok_or_else(|| {
                    DbQueueError::QueryError(format!("unknown query id '{query_id}'"))
                })?;
                self.expire(entry, Instant::now());
                match entry.status {
                    QueryStatus::Complete | QueryStatus::Error => {
                        return Ok(entry
                            .result
                            .clone()
                            .unwrap_or_else(|| QueryResult::failure("result missing")));
                    }
                    QueryStatus::Timeout => {
                        return Err(DbQueueError::TimeoutError(format!(
                            "query '{query_id}' timed out after {:?}",
                            entry.timeout
                        )));
                    }
                    QueryStatus::Pending | QueryStatus::Running => {}
                }
                (Arc::clone(&entry.done), entry.registered_at + entry.timeout)
            };

            let notified = done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // A completion between releasing the lock and enabling is caught by re-checking.
            if self.status(query_id).is_some_and(QueryStatus::is_finished) {
                continue;
            }
            let _ = tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), notified).await;
        }
    }

    /// Remove a finished entry and return its result.
    #[must_use]
    pub fn take_result(&self, query_id: &str) -> Option<QueryResult> {
        let mut entries = self.lock();
        let finished = entries.get(query_id).is_some_and(|e| {
            matches!(e.status, QueryStatus::Complete | QueryStatus::Error)
        });
        if !finished {
            return None;
        }
        entries.remove(query_id).and_then(|e| e.result)
    }

    /// Drop an entry whatever its state.
    pub fn forget(&self, query_id: &str) {
        self.lock().remove(query_id);
    }

    /// Drop finished entries older than their timeout. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            self.expire(entry, now);
            !(entry.status.is_finished() && entry.expired(now))
        });
        before - entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_result() -> QueryResult {
        QueryResult {
            success: true,
            data_json: "[]".into(),
            ..QueryResult::default()
        }
    }

    #[test]
    fn lifecycle() {
        let registry = PendingResultRegistry::new();
        registry.register("q1", Duration::from_secs(30)).expect("register");
        assert!(registry.register("q1", Duration::from_secs(30)).is_err());
        assert_eq!(registry.status("q1"), Some(QueryStatus::Pending));
        registry.mark_running("q1");
        assert_eq!(registry.status("q1"), Some(QueryStatus::Running));
        registry.complete("q1", QueryResult::failure("boom"));
        assert_eq!(registry.status("q1"), Some(QueryStatus::Error));
        let result = registry.take_result("q1").expect("finished");
        assert_eq!(result.error_message.as_deref(), Some("boom"));
        assert_eq!(registry.status("q1"), None);
    }

    #[test]
    fn expiry_wins_over_late_completion() {
        let registry = PendingResultRegistry::new();
        registry.register_for_queue("q1", 2, Duration::ZERO).expect("register");
        assert_eq!(registry.status("q1"), Some(QueryStatus::Timeout));
        registry.complete("q1", ok_result());
        assert_eq!(registry.status("q1"), Some(QueryStatus::Timeout));
        assert_eq!(registry.queue_index("q1"), Some(2));
        assert!(registry.take_result("q1").is_none());
        assert_eq!(registry.cleanup_expired(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn timeouts_are_counted_once_without_a_waiter() {
        let stats = Arc::new(ManagerStats::default());
        let registry = PendingResultRegistry::with_stats(Arc::clone(&stats));
        registry.register_for_queue("polled", 1, Duration::ZERO).expect("register");
        registry.register("unattributed", Duration::ZERO).expect("register");
        assert_eq!(registry.status("polled"), Some(QueryStatus::Timeout));
        assert_eq!(registry.status("polled"), Some(QueryStatus::Timeout));
        assert_eq!(registry.status("unattributed"), Some(QueryStatus::Timeout));
        assert_eq!(registry.cleanup_expired(), 2);
        assert_eq!(stats.snapshot().timeouts, 1);
    }

    #[tokio::test]
    async fn wait_returns_result_or_times_out() -> Result<(), DbQueueError> {
        let registry = Arc::new(PendingResultRegistry::new());
        registry.register("fast", Duration::from_secs(5))?;
        let completer = Arc::clone(&registry);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            completer.complete("fast", ok_result());
        });
        assert!(registry.wait("fast").await?.success);

        registry.register("slow", Duration::from_millis(30))?;
        let err = registry.wait("slow").await.expect_err("times out");
        assert!(matches!(err, DbQueueError::TimeoutError(_)));
        assert_eq!(registry.status("slow"), Some(QueryStatus::Timeout));
        Ok(())
    }
}
