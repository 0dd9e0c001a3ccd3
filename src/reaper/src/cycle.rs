//! One reap pass over a single worker's partition shard.
//!
//! A cycle refreshes the quarantine ledger, fetches expired candidates for
//! the shard, subtracts quarantined keys and feeds the remainder to the
//! deletion gateway in chunks. Batches fail independently: a contended or
//! racy batch never blocks progress on the healthy ones, while an unknown
//! failure class aborts the remainder of the cycle so it stays visible.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;

use common::EntryKey;

use crate::classify::{ErrorClassifier, FailureKind};
use crate::fleet::WorkerAssignment;
use crate::gateway::{DeletionGateway, WorkSource};
use crate::metrics::ReaperMetrics;
use crate::quarantine::QuarantineLedger;

/// Orchestrates one pass: select, filter, chunk, delete, classify.
pub struct ReaperCycle {
    chunk_size: usize,
    candidate_limit: usize,
    source: Arc<dyn WorkSource>,
    gateway: Arc<dyn DeletionGateway>,
    classifier: ErrorClassifier,
    metrics: ReaperMetrics,
}

impl ReaperCycle {
    pub fn new(
        chunk_size: usize,
        candidate_limit: usize,
        source: Arc<dyn WorkSource>,
        gateway: Arc<dyn DeletionGateway>,
        classifier: ErrorClassifier,
        metrics: ReaperMetrics,
    ) -> Self {
        Self {
            chunk_size,
            candidate_limit,
            source,
            gateway,
            classifier,
            metrics,
        }
    }

    /// Run one reap pass for this worker's shard.
    ///
    /// Mutates `ledger` in place; side effects are deletions, quarantine
    /// updates and metric increments. An `Err` means an unclassified
    /// failure aborted the remainder of this cycle — the caller logs it
    /// and proceeds with the next scheduled cycle.
    pub async fn run_once(
        &self,
        assignment: WorkerAssignment,
        ledger: &mut QuarantineLedger,
    ) -> Result<()> {
        let WorkerAssignment {
            worker_number,
            total_workers,
        } = assignment;

        ledger.purge_expired(Utc::now());

        let candidates = self
            .source
            .list_expired(worker_number, total_workers, self.candidate_limit)
            .await
            .context("failed to list expired entries")?;

        let candidates: Vec<EntryKey> = candidates
            .into_iter()
            .filter(|key| !ledger.contains(key))
            .collect();

        if candidates.is_empty() {
            tracing::info!(worker_number, total_workers, "did not get any work");
            return Ok(());
        }

        tracing::info!(
            worker_number,
            total_workers,
            candidates = candidates.len(),
            quarantined = ledger.len(),
            "starting reap pass"
        );

        for batch in candidates.chunks(self.chunk_size) {
            match self.gateway.delete(batch, true).await {
                Ok(()) => {
                    self.metrics.record_deleted(batch.len());
                    tracing::info!(worker_number, batch_size = batch.len(), "deleted batch");
                }
                Err(error) => match self.classifier.classify(&error) {
                    FailureKind::DependencyGone => {
                        self.metrics.record_batch_abandoned();
                        tracing::error!(
                            worker_number,
                            batch_size = batch.len(),
                            %error,
                            "dependent record already gone, abandoning batch"
                        );
                    }
                    FailureKind::LockConflict => {
                        let now = Utc::now();
                        for key in batch {
                            ledger.quarantine(key.clone(), now);
                        }
                        self.metrics.record_contention();
                        tracing::warn!(
                            worker_number,
                            batch_size = batch.len(),
                            "locks detected for batch, keys quarantined"
                        );
                    }
                    FailureKind::Unclassified => {
                        tracing::error!(
                            worker_number,
                            batch_size = batch.len(),
                            %error,
                            "unclassified deletion failure, aborting remainder of cycle"
                        );
                        return Err(error).context("unclassified deletion failure");
                    }
                },
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::gateway::{GatewayError, MockDeletionGateway, MockWorkSource};

    fn keys(count: usize) -> Vec<EntryKey> {
        (0..count)
            .map(|i| EntryKey::new("mc23", format!("dataset_{i:03}")))
            .collect()
    }

    fn ledger() -> QuarantineLedger {
        QuarantineLedger::new(Duration::from_secs(600), Duration::from_secs(2400))
    }

    fn assignment() -> WorkerAssignment {
        WorkerAssignment {
            worker_number: 0,
            total_workers: 1,
        }
    }

    fn source_returning(candidates: Vec<EntryKey>) -> Arc<dyn WorkSource> {
        let mut source = MockWorkSource::new();
        source
            .expect_list_expired()
            .returning(move |_, _, limit| Ok(candidates.iter().take(limit).cloned().collect()));
        Arc::new(source)
    }

    fn recording_gateway(
        calls: Arc<Mutex<Vec<Vec<EntryKey>>>>,
        fail_batch: Option<(usize, fn() -> GatewayError)>,
    ) -> Arc<dyn DeletionGateway> {
        let mut gateway = MockDeletionGateway::new();
        gateway.expect_delete().returning(move |batch, _| {
            let mut calls = calls.lock().unwrap();
            calls.push(batch.to_vec());
            if let Some((index, make_error)) = fail_batch {
                if calls.len() == index + 1 {
                    return Err(make_error());
                }
            }
            Ok(())
        });
        Arc::new(gateway)
    }

    fn lock_conflict() -> GatewayError {
        GatewayError::Database {
            code: Some("55P03".to_string()),
            message: "could not obtain lock on relation \"catalog_entries\"".to_string(),
        }
    }

    fn unclassified() -> GatewayError {
        GatewayError::Database {
            code: Some("23505".to_string()),
            message: "duplicate key value violates unique constraint".to_string(),
        }
    }

    fn dependency_gone() -> GatewayError {
        GatewayError::DependencyGone {
            detail: "2 of 10 entries already removed".to_string(),
        }
    }

    fn cycle(
        chunk_size: usize,
        source: Arc<dyn WorkSource>,
        gateway: Arc<dyn DeletionGateway>,
        metrics: ReaperMetrics,
    ) -> ReaperCycle {
        ReaperCycle::new(
            chunk_size,
            10_000,
            source,
            gateway,
            ErrorClassifier::new(),
            metrics,
        )
    }

    #[tokio::test]
    async fn test_chunking_covers_each_candidate_exactly_once() {
        let candidates = keys(25);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let metrics = ReaperMetrics::new();
        let cycle = cycle(
            10,
            source_returning(candidates.clone()),
            recording_gateway(Arc::clone(&calls), None),
            metrics.clone(),
        );

        cycle.run_once(assignment(), &mut ledger()).await.unwrap();

        let calls = calls.lock().unwrap();
        let sizes: Vec<usize> = calls.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        // Batches partition the candidate list without reordering
        let flattened: Vec<EntryKey> = calls.iter().flatten().cloned().collect();
        assert_eq!(flattened, candidates);
        assert_eq!(metrics.entries_deleted(), 25);
    }

    #[tokio::test]
    async fn test_quarantined_candidates_are_excluded() {
        let candidates = keys(10);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let cycle = cycle(
            10,
            source_returning(candidates.clone()),
            recording_gateway(Arc::clone(&calls), None),
            ReaperMetrics::new(),
        );

        let mut ledger = ledger();
        let now = Utc::now();
        for key in &candidates[..4] {
            ledger.quarantine(key.clone(), now);
        }

        cycle.run_once(assignment(), &mut ledger).await.unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], candidates[4..].to_vec());
    }

    #[tokio::test]
    async fn test_cycle_with_no_candidates_is_a_noop() {
        let mut gateway = MockDeletionGateway::new();
        gateway.expect_delete().times(0);
        let metrics = ReaperMetrics::new();
        let cycle = cycle(
            10,
            source_returning(Vec::new()),
            Arc::new(gateway),
            metrics.clone(),
        );

        cycle.run_once(assignment(), &mut ledger()).await.unwrap();

        assert_eq!(metrics.entries_deleted(), 0);
        assert_eq!(metrics.contention_batches(), 0);
    }

    #[tokio::test]
    async fn test_lock_conflict_quarantines_batch_and_spares_the_rest() {
        // 25 candidates, chunk_size=10: batches of [10, 10, 5]; batch 2
        // hits a lock conflict, batches 1 and 3 go through.
        let candidates = keys(25);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let metrics = ReaperMetrics::new();
        let cycle = cycle(
            10,
            source_returning(candidates.clone()),
            recording_gateway(Arc::clone(&calls), Some((1, lock_conflict))),
            metrics.clone(),
        );

        let mut ledger = ledger();
        let before = Utc::now();
        cycle.run_once(assignment(), &mut ledger).await.unwrap();

        assert_eq!(calls.lock().unwrap().len(), 3);
        assert_eq!(metrics.entries_deleted(), 15);
        assert_eq!(metrics.contention_batches(), 1);

        // The contended batch's keys are all quarantined with a jittered
        // deadline inside the configured 10-40 minute window.
        assert_eq!(ledger.len(), 10);
        for key in &candidates[10..20] {
            let deadline = ledger.retry_not_before(key).expect("key quarantined");
            let window = deadline - before;
            assert!(window >= chrono::Duration::minutes(10));
            assert!(window <= chrono::Duration::minutes(40) + chrono::Duration::seconds(5));
        }
        for key in candidates[..10].iter().chain(&candidates[20..]) {
            assert!(!ledger.contains(key));
        }
    }

    #[tokio::test]
    async fn test_quarantined_keys_skip_the_next_cycle() {
        let candidates = keys(20);
        let metrics = ReaperMetrics::new();
        let mut ledger = ledger();

        // First cycle: second batch of 10 is contended
        let calls = Arc::new(Mutex::new(Vec::new()));
        let first = cycle(
            10,
            source_returning(candidates.clone()),
            recording_gateway(Arc::clone(&calls), Some((1, lock_conflict))),
            metrics.clone(),
        );
        first.run_once(assignment(), &mut ledger).await.unwrap();
        assert_eq!(ledger.len(), 10);

        // Second cycle: the source still reports every key, but the
        // quarantined half must not reach the gateway.
        let calls = Arc::new(Mutex::new(Vec::new()));
        let second = cycle(
            10,
            source_returning(candidates.clone()),
            recording_gateway(Arc::clone(&calls), None),
            metrics.clone(),
        );
        second.run_once(assignment(), &mut ledger).await.unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], candidates[..10].to_vec());
    }

    #[tokio::test]
    async fn test_dependency_gone_abandons_batch_but_continues() {
        let candidates = keys(20);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let metrics = ReaperMetrics::new();
        let cycle = cycle(
            10,
            source_returning(candidates),
            recording_gateway(Arc::clone(&calls), Some((0, dependency_gone))),
            metrics.clone(),
        );

        let mut ledger = ledger();
        cycle.run_once(assignment(), &mut ledger).await.unwrap();

        assert_eq!(calls.lock().unwrap().len(), 2);
        assert_eq!(metrics.entries_deleted(), 10);
        assert_eq!(metrics.batches_abandoned(), 1);
        // Abandoned, not quarantined
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_unclassified_failure_aborts_remaining_batches() {
        let candidates = keys(25);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let metrics = ReaperMetrics::new();
        let cycle = cycle(
            10,
            source_returning(candidates),
            recording_gateway(Arc::clone(&calls), Some((1, unclassified))),
            metrics.clone(),
        );

        let mut ledger = ledger();
        let result = cycle.run_once(assignment(), &mut ledger).await;

        assert!(result.is_err());
        // Batch 1's effects are retained, batch 3 is never attempted
        assert_eq!(calls.lock().unwrap().len(), 2);
        assert_eq!(metrics.entries_deleted(), 10);
        assert!(ledger.is_empty());

        // The failure does not poison the cycle; the next pass proceeds
        cycle.run_once(assignment(), &mut ledger).await.unwrap();
        assert_eq!(metrics.entries_deleted(), 10 + 25);
    }

    #[tokio::test]
    async fn test_source_failure_aborts_cycle() {
        let mut source = MockWorkSource::new();
        source.expect_list_expired().returning(|_, _, _| {
            Err(GatewayError::Database {
                code: None,
                message: "connection refused".to_string(),
            })
        });
        let mut gateway = MockDeletionGateway::new();
        gateway.expect_delete().times(0);

        let cycle = cycle(
            10,
            Arc::new(source),
            Arc::new(gateway),
            ReaperMetrics::new(),
        );
        assert!(cycle.run_once(assignment(), &mut ledger()).await.is_err());
    }
}
