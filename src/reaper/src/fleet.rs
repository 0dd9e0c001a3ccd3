//! Worker-fleet lifecycle: spawning, liveness, cooperative shutdown.
//!
//! One process hosts `total_workers` independent loop tasks. Each task owns
//! its own quarantine ledger, refreshes its shard assignment once per
//! cycle, runs one reap pass, then sleeps. Shutdown is cooperative: a
//! watch flag is observed at iteration boundaries and during the
//! inter-cycle sleep, and joins happen with bounded, repeated waits.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use common::config::ReaperConfig;

use crate::classify::ErrorClassifier;
use crate::cycle::ReaperCycle;
use crate::gateway::{DeletionGateway, WorkSource};
use crate::metrics::ReaperMetrics;
use crate::quarantine::QuarantineLedger;

/// Shard assignment for one worker loop, refreshed once per cycle.
///
/// Stable for the duration of one cycle; may change between cycles when
/// the fleet is resized externally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerAssignment {
    pub worker_number: usize,
    pub total_workers: usize,
}

/// Per-worker liveness handle.
///
/// Implementations may report a dynamic assignment when fleet membership
/// is tracked externally; the in-process default is static.
pub trait Liveness: Send + Sync {
    /// Refresh liveness and return the current shard assignment.
    fn live(&self) -> WorkerAssignment;
}

/// Fixed in-process assignment.
pub struct StaticLiveness {
    assignment: WorkerAssignment,
}

impl StaticLiveness {
    pub fn new(worker_number: usize, total_workers: usize) -> Self {
        Self {
            assignment: WorkerAssignment {
                worker_number,
                total_workers,
            },
        }
    }
}

impl Liveness for StaticLiveness {
    fn live(&self) -> WorkerAssignment {
        self.assignment
    }
}

/// Interval between repeated join attempts during shutdown.
const JOIN_WAIT: Duration = Duration::from_secs(3);

/// Owns the worker loop tasks and the shared stop flag.
pub struct FleetCoordinator {
    config: ReaperConfig,
    source: Arc<dyn WorkSource>,
    gateway: Arc<dyn DeletionGateway>,
    metrics: ReaperMetrics,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl FleetCoordinator {
    pub fn new(
        config: ReaperConfig,
        source: Arc<dyn WorkSource>,
        gateway: Arc<dyn DeletionGateway>,
        metrics: ReaperMetrics,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            config,
            source,
            gateway,
            metrics,
            stop_tx,
            stop_rx,
            handles: Vec::new(),
        }
    }

    /// Spawn the worker loops.
    ///
    /// With `once` each loop runs exactly one cycle and returns instead of
    /// sleeping; use [`FleetCoordinator::join`] to wait for completion.
    pub fn start(&mut self, once: bool) {
        tracing::info!(
            total_workers = self.config.total_workers,
            sleep_time = ?self.config.sleep_time,
            once,
            "starting reaper fleet"
        );

        for worker_number in 0..self.config.total_workers {
            let liveness: Arc<dyn Liveness> = Arc::new(StaticLiveness::new(
                worker_number,
                self.config.total_workers,
            ));
            let cycle = ReaperCycle::new(
                self.config.chunk_size,
                self.config.candidate_limit,
                Arc::clone(&self.source),
                Arc::clone(&self.gateway),
                ErrorClassifier::new(),
                self.metrics.clone(),
            );
            let ctx = WorkerContext {
                worker_number,
                sleep_time: self.config.sleep_time,
                min_backoff: self.config.min_backoff,
                max_backoff: self.config.max_backoff,
                liveness,
                cycle,
                metrics: self.metrics.clone(),
                stop_rx: self.stop_rx.clone(),
            };
            self.handles.push(tokio::spawn(worker_loop(ctx, once)));
        }
    }

    /// Request cooperative stop. Idempotent; safe to call from a signal
    /// handler path.
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Wait for natural completion of all worker loops (once mode).
    pub async fn join(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(error) = handle.await {
                tracing::error!(%error, "worker loop terminated abnormally");
            }
        }
    }

    /// Stop the fleet and join every loop with bounded, repeated waits.
    ///
    /// A loop mid-cycle is tolerated: the join keeps waiting in
    /// `JOIN_WAIT` increments rather than blocking without bound.
    pub async fn shutdown(&mut self) {
        self.signal_stop();

        for (worker_number, mut handle) in self.handles.drain(..).enumerate() {
            loop {
                match tokio::time::timeout(JOIN_WAIT, &mut handle).await {
                    Ok(Ok(())) => break,
                    Ok(Err(error)) => {
                        tracing::error!(worker_number, %error, "worker loop terminated abnormally");
                        break;
                    }
                    Err(_) => {
                        tracing::info!(worker_number, "waiting for worker loop to finish its cycle");
                    }
                }
            }
        }

        tracing::info!("reaper fleet stopped");
    }
}

struct WorkerContext {
    worker_number: usize,
    sleep_time: Duration,
    min_backoff: Duration,
    max_backoff: Duration,
    liveness: Arc<dyn Liveness>,
    cycle: ReaperCycle,
    metrics: ReaperMetrics,
    stop_rx: watch::Receiver<bool>,
}

async fn worker_loop(mut ctx: WorkerContext, once: bool) {
    // Quarantine state is loop-local: duplicate backoff bookkeeping across
    // workers, but no shared-map lock.
    let mut ledger = QuarantineLedger::new(ctx.min_backoff, ctx.max_backoff);

    if !once {
        // Desynchronize the fleet so cycles do not all fire together.
        let jitter_ms = rand::thread_rng().gen_range(0..=ctx.sleep_time.as_millis() as u64);
        if interruptible_sleep(Duration::from_millis(jitter_ms), &mut ctx.stop_rx).await {
            tracing::info!(worker_number = ctx.worker_number, "worker loop stopped");
            return;
        }
    }

    loop {
        if *ctx.stop_rx.borrow() {
            break;
        }

        let assignment = ctx.liveness.live();
        match ctx.cycle.run_once(assignment, &mut ledger).await {
            Ok(()) => ctx.metrics.record_cycle_completed(),
            Err(error) => {
                // Cycle-fatal only; the next scheduled cycle proceeds.
                ctx.metrics.record_cycle_failed();
                tracing::error!(
                    worker_number = ctx.worker_number,
                    error = ?error,
                    "reap cycle aborted"
                );
            }
        }

        if once {
            break;
        }
        if interruptible_sleep(ctx.sleep_time, &mut ctx.stop_rx).await {
            break;
        }
    }

    tracing::info!(worker_number = ctx.worker_number, "worker loop stopped");
}

/// Sleep that wakes early when the stop flag flips.
///
/// Returns true if the loop should stop. A closed channel counts as a
/// stop request so orphaned loops cannot spin.
async fn interruptible_sleep(duration: Duration, stop_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => *stop_rx.borrow(),
        changed = stop_rx.changed() => changed.is_err() || *stop_rx.borrow(),
    }
}
