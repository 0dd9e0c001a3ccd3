//! End-to-end reaping against a real SQLite catalog.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use common::config::ReaperConfig;
use common::{Catalog, EntryKey};
use reaper::{
    DeletionGateway, ErrorClassifier, FleetCoordinator, GatewayError, QuarantineLedger,
    ReaperCycle, ReaperMetrics, WorkSource, WorkerAssignment,
};

async fn seeded_catalog(expired: usize, retained: usize) -> Arc<Catalog> {
    let catalog = Catalog::new("sqlite::memory:").await.unwrap();
    let yesterday = Utc::now() - chrono::Duration::days(1);
    let tomorrow = Utc::now() + chrono::Duration::days(1);

    for i in 0..expired {
        let key = EntryKey::new("mc23", format!("dataset_{i:03}"));
        catalog.insert_entry(&key, yesterday).await.unwrap();
        catalog.insert_obligation(&key, "SITE_A_DATADISK").await.unwrap();
        catalog.insert_obligation(&key, "SITE_B_DATADISK").await.unwrap();
    }
    for i in 0..retained {
        let key = EntryKey::new("mc23", format!("retained_{i:03}"));
        catalog.insert_entry(&key, tomorrow).await.unwrap();
        catalog.insert_obligation(&key, "SITE_A_DATADISK").await.unwrap();
    }

    Arc::new(catalog)
}

fn fleet_config(total_workers: usize) -> ReaperConfig {
    ReaperConfig {
        enabled: true,
        sleep_time: Duration::from_secs(60),
        chunk_size: 10,
        total_workers,
        candidate_limit: 10_000,
        min_backoff: Duration::from_secs(600),
        max_backoff: Duration::from_secs(2400),
    }
}

#[tokio::test]
async fn test_once_mode_empties_the_expired_backlog() {
    let catalog = seeded_catalog(25, 0).await;
    let metrics = ReaperMetrics::new();
    let mut coordinator = FleetCoordinator::new(
        fleet_config(1),
        Arc::clone(&catalog) as Arc<dyn WorkSource>,
        Arc::clone(&catalog) as Arc<dyn DeletionGateway>,
        metrics.clone(),
    );

    coordinator.start(true);
    coordinator.join().await;

    assert_eq!(catalog.count_entries().await.unwrap(), 0);
    assert_eq!(catalog.count_obligations().await.unwrap(), 0);
    assert_eq!(metrics.entries_deleted(), 25);
    assert_eq!(metrics.cycles_completed(), 1);
    assert_eq!(metrics.cycles_failed(), 0);
}

#[tokio::test]
async fn test_worker_shards_jointly_cover_the_backlog() {
    let catalog = seeded_catalog(30, 0).await;
    let metrics = ReaperMetrics::new();
    let mut coordinator = FleetCoordinator::new(
        fleet_config(3),
        Arc::clone(&catalog) as Arc<dyn WorkSource>,
        Arc::clone(&catalog) as Arc<dyn DeletionGateway>,
        metrics.clone(),
    );

    coordinator.start(true);
    coordinator.join().await;

    // Disjoint shards, so no batch races another worker's batch and
    // every expired entry is claimed by exactly one worker.
    assert_eq!(catalog.count_entries().await.unwrap(), 0);
    assert_eq!(metrics.entries_deleted(), 30);
    assert_eq!(metrics.batches_abandoned(), 0);
    assert_eq!(metrics.cycles_completed(), 3);
}

#[tokio::test]
async fn test_unexpired_entries_survive_a_pass() {
    let catalog = seeded_catalog(10, 5).await;
    let metrics = ReaperMetrics::new();
    let mut coordinator = FleetCoordinator::new(
        fleet_config(1),
        Arc::clone(&catalog) as Arc<dyn WorkSource>,
        Arc::clone(&catalog) as Arc<dyn DeletionGateway>,
        metrics.clone(),
    );

    coordinator.start(true);
    coordinator.join().await;

    assert_eq!(catalog.count_entries().await.unwrap(), 5);
    assert_eq!(catalog.count_obligations().await.unwrap(), 5);
    assert_eq!(metrics.entries_deleted(), 10);
}

/// Gateway that reports a lock conflict on its first call and then
/// delegates to the real catalog.
struct ContendedGateway {
    inner: Arc<Catalog>,
    fail_next: AtomicBool,
}

#[async_trait]
impl DeletionGateway for ContendedGateway {
    async fn delete(&self, batch: &[EntryKey], cascade: bool) -> Result<(), GatewayError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(GatewayError::Database {
                code: Some("55P03".to_string()),
                message: "could not obtain lock on relation \"catalog_entries\"".to_string(),
            });
        }
        self.inner.delete(batch, cascade).await
    }
}

#[tokio::test]
async fn test_contended_batch_is_quarantined_then_reaped() {
    let catalog = seeded_catalog(20, 0).await;
    let gateway = Arc::new(ContendedGateway {
        inner: Arc::clone(&catalog),
        fail_next: AtomicBool::new(true),
    });
    let metrics = ReaperMetrics::new();
    let cycle = ReaperCycle::new(
        10,
        10_000,
        Arc::clone(&catalog) as Arc<dyn WorkSource>,
        gateway as Arc<dyn DeletionGateway>,
        ErrorClassifier::new(),
        metrics.clone(),
    );
    let assignment = WorkerAssignment {
        worker_number: 0,
        total_workers: 1,
    };

    // First pass: batch one hits the lock conflict, batch two goes through
    let mut ledger = QuarantineLedger::new(Duration::from_secs(600), Duration::from_secs(2400));
    cycle.run_once(assignment, &mut ledger).await.unwrap();

    assert_eq!(metrics.entries_deleted(), 10);
    assert_eq!(metrics.contention_batches(), 1);
    assert_eq!(ledger.len(), 10);
    assert_eq!(catalog.count_entries().await.unwrap(), 10);

    // Second pass with the same ledger: all survivors are quarantined,
    // nothing reaches the gateway.
    cycle.run_once(assignment, &mut ledger).await.unwrap();
    assert_eq!(catalog.count_entries().await.unwrap(), 10);

    // Once the quarantine window elapses the survivors are reaped; a
    // fresh ledger stands in for the elapsed window.
    let mut ledger = QuarantineLedger::new(Duration::from_secs(600), Duration::from_secs(2400));
    cycle.run_once(assignment, &mut ledger).await.unwrap();

    assert_eq!(catalog.count_entries().await.unwrap(), 0);
    assert_eq!(catalog.count_obligations().await.unwrap(), 0);
    assert_eq!(metrics.entries_deleted(), 20);
}
