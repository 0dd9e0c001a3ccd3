//! Reaper metrics tracking
//!
//! Provides thread-safe metrics collection for reap cycles using atomic counters.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Thread-safe counters shared by all worker loops of a fleet.
#[derive(Debug, Clone)]
pub struct ReaperMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    entries_deleted: AtomicUsize,
    contention_batches: AtomicUsize,
    batches_abandoned: AtomicUsize,
    cycles_completed: AtomicUsize,
    cycles_failed: AtomicUsize,
}

impl Default for ReaperMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ReaperMetrics {
    /// Create a new metrics tracker
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                entries_deleted: AtomicUsize::new(0),
                contention_batches: AtomicUsize::new(0),
                batches_abandoned: AtomicUsize::new(0),
                cycles_completed: AtomicUsize::new(0),
                cycles_failed: AtomicUsize::new(0),
            }),
        }
    }

    /// Record successfully deleted entries
    pub fn record_deleted(&self, count: usize) {
        self.inner.entries_deleted.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a batch deferred because of backend lock contention
    pub fn record_contention(&self) {
        self.inner.contention_batches.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a batch abandoned because a dependent record was already gone
    pub fn record_batch_abandoned(&self) {
        self.inner.batches_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed reap cycle
    pub fn record_cycle_completed(&self) {
        self.inner.cycles_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cycle aborted by an unclassified failure
    pub fn record_cycle_failed(&self) {
        self.inner.cycles_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the number of entries deleted
    pub fn entries_deleted(&self) -> usize {
        self.inner.entries_deleted.load(Ordering::Relaxed)
    }

    /// Get the number of batches quarantined due to contention
    pub fn contention_batches(&self) -> usize {
        self.inner.contention_batches.load(Ordering::Relaxed)
    }

    /// Get the number of batches abandoned
    pub fn batches_abandoned(&self) -> usize {
        self.inner.batches_abandoned.load(Ordering::Relaxed)
    }

    /// Get the number of completed cycles
    pub fn cycles_completed(&self) -> usize {
        self.inner.cycles_completed.load(Ordering::Relaxed)
    }

    /// Get the number of failed cycles
    pub fn cycles_failed(&self) -> usize {
        self.inner.cycles_failed.load(Ordering::Relaxed)
    }

    /// Get a summary of all metrics
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            entries_deleted: self.entries_deleted(),
            contention_batches: self.contention_batches(),
            batches_abandoned: self.batches_abandoned(),
            cycles_completed: self.cycles_completed(),
            cycles_failed: self.cycles_failed(),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSummary {
    pub entries_deleted: usize,
    pub contention_batches: usize,
    pub batches_abandoned: usize,
    pub cycles_completed: usize,
    pub cycles_failed: usize,
}

impl MetricsSummary {
    /// Log the metrics summary
    pub fn log(&self) {
        log::info!("=== Reaper Metrics Summary ===");
        log::info!(
            "Cycles: {} completed, {} failed",
            self.cycles_completed,
            self.cycles_failed
        );
        log::info!("Entries deleted: {}", self.entries_deleted);
        log::info!(
            "Batches: {} deferred on contention, {} abandoned",
            self.contention_batches,
            self.batches_abandoned
        );
    }
}
