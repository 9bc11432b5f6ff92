//! Counters for queues and for the manager.
//!
//! Counters are atomics; the running average and last-used time share one small mutex.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{LEAD_QUEUE_INDEX, QUEUE_INDEX_COUNT, QueueType};

#[derive(Debug, Default)]
struct Timing {
    average_us: f64,
    samples: u64,
    last_used: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct QueueStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timing: Mutex<Timing>,
}

/// Point-in-time copy of a [`QueueStats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub avg_execution_time_us: f64,
    pub last_used: Option<DateTime<Utc>>,
}

impl QueueStats {
    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        self.touch(None);
    }

    pub fn record_completed(&self, execution_time_us: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.touch(Some(execution_time_us));
    }

    pub fn record_failed(&self, execution_time_us: u64) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.touch(Some(execution_time_us));
    }

    #[allow(clippy::cast_precision_loss)]
    fn touch(&self, execution_time_us: Option<u64>) {
        let mut timing = self.timing.lock().unwrap_or_else(PoisonError::into_inner);
        timing.last_used = Some(Utc::now());
        if let Some(us) = execution_time_us {
            timing.samples += 1;
            timing.average_us += (us as f64 - timing.average_us) / timing.samples as f64;
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        let timing = self.timing.lock().unwrap_or_else(PoisonError::into_inner);
        QueueStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            avg_execution_time_us: timing.average_us,
            last_used: timing.last_used,
        }
    }
}

/// Global counters plus one [`QueueStats`] per queue index.
#[derive(Debug, Default)]
pub struct ManagerStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    per_queue: [QueueStats; QUEUE_INDEX_COUNT],
    selection: [AtomicU64; QUEUE_INDEX_COUNT],
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub queues: Vec<(String, QueueStatsSnapshot)>,
}

fn index_name(index: usize) -> &'static str {
    match QueueType::from_index(index) {
        Some(queue_type) => queue_type.as_str(),
        None if index == LEAD_QUEUE_INDEX => "lead",
        None => "unknown",
    }
}

impl ManagerStats {
    pub fn record_submission(&self, index: usize) {
        let Some(queue) = self.per_queue.get(index) else {
            return;
        };
        self.submitted.fetch_add(1, Ordering::Relaxed);
        queue.record_submitted();
    }

    pub fn record_completion(&self, index: usize, execution_time_us: u64) {
        let Some(queue) = self.per_queue.get(index) else {
            return;
        };
        self.completed.fetch_add(1, Ordering::Relaxed);
        queue.record_completed(execution_time_us);
    }

    pub fn record_failure(&self, index: usize, execution_time_us: u64) {
        let Some(queue) = self.per_queue.get(index) else {
            return;
        };
        self.failed.fetch_add(1, Ordering::Relaxed);
        queue.record_failed(execution_time_us);
    }

    /// Timeouts are only counted globally, but the index must still be in range.
    pub fn record_timeout(&self, index: usize) {
        if index < self.per_queue.len() {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Bump the selection counter for `index` and return its previous value.
    ///
    /// Returns 0 for an out-of-range index.
    pub fn increment_queue_selection(&self, index: usize) -> u64 {
        self.selection
            .get(index)
            .map_or(0, |counter| counter.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn snapshot(&self) -> ManagerStatsSnapshot {
        ManagerStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            queues: self
                .per_queue
                .iter()
                .enumerate()
                .map(|(i, q)| (index_name(i).to_string(), q.snapshot()))
                .collect(),
        }
    }

    /// # Errors
    /// Returns [`crate::DbQueueError::JsonError`] if serialisation fails.
    pub fn stats_json(&self) -> Result<String, crate::DbQueueError> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    #[must_use]
    pub fn stats_string(&self) -> String {
        let snap = self.snapshot();
        let mut out = format!(
            "submitted={} completed={} failed={} timeouts={}",
            snap.submitted, snap.completed, snap.failed, snap.timeouts
        );
        for (name, q) in &snap.queues {
            let _ = write!(
                out,
                "\n  {name}: submitted={} completed={} failed={} avg={:.1}us",
                q.submitted, q.completed, q.failed, q.avg_execution_time_us
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_index_is_a_no_op() {
        let stats = ManagerStats::default();
        stats.record_submission(99);
        stats.record_completion(QUEUE_INDEX_COUNT, 5);
        stats.record_failure(99, 10);
        stats.record_timeout(usize::MAX);
        assert_eq!(stats.increment_queue_selection(99), 0);
        let snap = stats.snapshot();
        assert_eq!((snap.submitted, snap.completed, snap.failed, snap.timeouts), (0, 0, 0, 0));
        assert!(snap.queues.iter().all(|(_, q)| q.submitted == 0));
    }

    #[test]
    fn running_average() {
        let stats = ManagerStats::default();
        let fast = QueueType::Fast.index();
        stats.record_submission(fast);
        stats.record_completion(fast, 100);
        stats.record_completion(fast, 300);
        stats.record_timeout(fast);
        let snap = stats.snapshot();
        let (name, q) = &snap.queues[fast];
        assert_eq!(name, "fast");
        assert_eq!(q.completed, 2);
        assert!((q.avg_execution_time_us - 200.0).abs() < f64::EPSILON);
        assert!(q.last_used.is_some());
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.queues[LEAD_QUEUE_INDEX].0, "lead");
        assert!(stats.stats_string().contains("fast: submitted=1 completed=2"));
        assert!(stats.stats_json().expect("json").contains("\"timeouts\":1"));
    }

    #[test]
    fn selection_counter_advances() {
        let stats = ManagerStats::default();
        assert_eq!(stats.increment_queue_selection(1), 0);
        assert_eq!(stats.increment_queue_selection(1), 1);
        assert_eq!(stats.increment_queue_selection(2), 0);
    }
}
