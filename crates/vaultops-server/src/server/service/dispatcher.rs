use super::blocking;
use crate::server::{
    pool::{manager::WorkerPool, worker::Executor},
    telemetry::{increment_dispatch_deferred, increment_operations_dispatched},
};
use core::time::Duration;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use vaultops_core::{ClaimOutcome, OperationStore, Result, SharedClock, vaultops::TimeSource};

/// What one dispatch pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// `retrying` operations whose backoff had elapsed.
    pub promoted: usize,
    /// Attempts started.
    pub dispatched: usize,
    /// Candidates whose target filled up between listing and claiming.
    pub deferred: usize,
}

/// Matches pending operations to free target slots and free workers.
///
/// A pass never awaits: it reads candidates, claims them one at a time and
/// hands each claimed operation to the worker pool. A candidate whose target
/// is full, or whose claim fails, is skipped without holding up candidates
/// for other targets. Passes run on the blocking pool because store calls
/// may do file I/O.
pub struct Dispatcher {
    store: Arc<dyn OperationStore>,
    pool: Arc<WorkerPool>,
    executor: Arc<Executor>,
    clock: SharedClock,
    batch_size: usize,
    interval: Duration,
    wake: Arc<Notify>,
    stop: CancellationToken,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn OperationStore>,
        pool: Arc<WorkerPool>,
        executor: Arc<Executor>,
        clock: SharedClock,
        batch_size: usize,
        interval: Duration,
        wake: Arc<Notify>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            store,
            pool,
            executor,
            clock,
            batch_size,
            interval,
            wake,
            stop,
        }
    }

    /// Runs passes until `stop` is cancelled: on every wake-up (submission,
    /// limit change, finished attempt) and at least once per interval so that
    /// elapsed backoffs are picked up.
    pub async fn run(self) {
        tracing::debug!("Dispatcher started");
        let dispatcher = Arc::new(self);
        loop {
            let pass = Arc::clone(&dispatcher);
            if let Err(e) = blocking(move || pass.run_pass()).await {
                tracing::error!("Dispatch pass failed: {e}");
            }

            tokio::select! {
                biased;
                () = dispatcher.stop.cancelled() => break,
                () = dispatcher.wake.notified() => {}
                () = tokio::time::sleep(dispatcher.interval) => {}
            }
        }
        tracing::debug!("Dispatcher stopped");
    }

    pub fn run_pass(&self) -> Result<PassReport> {
        let now = self.clock.current_millis();
        let mut report = PassReport {
            promoted: self.store.promote_due_retries(now)?,
            ..PassReport::default()
        };

        loop {
            let candidates = self.store.dispatchable(now, self.batch_size)?;
            let fetched = candidates.len();
            let mut progressed = false;

            for candidate in candidates {
                // Reserve a worker first so a claimed slot is never left
                // without one.
                let Some(permit) = self.pool.try_reserve() else {
                    return Ok(self.finish(report));
                };

                let claimed = match self.store.claim(candidate.id, now) {
                    Ok(claimed) => claimed,
                    Err(e) => {
                        tracing::warn!(operation = %candidate.id, "Claim failed, skipping: {e}");
                        continue;
                    }
                };
                match claimed {
                    ClaimOutcome::Claimed { operation, target } => {
                        tracing::debug!(
                            operation = %operation.id,
                            priority = %operation.priority,
                            attempt = operation.attempt_count,
                            "Dispatching"
                        );
                        increment_operations_dispatched();
                        let executor = Arc::clone(&self.executor);
                        let shutdown = self.pool.shutdown_token().clone();
                        self.pool
                            .spawn(permit, executor.run(operation, target, shutdown));
                        report.dispatched += 1;
                        progressed = true;
                    }
                    ClaimOutcome::NoCapacity => {
                        increment_dispatch_deferred();
                        report.deferred += 1;
                    }
                    ClaimOutcome::NotDispatchable => {}
                }
            }

            if fetched < self.batch_size || !progressed {
                break;
            }
        }

        Ok(self.finish(report))
    }

    fn finish(&self, report: PassReport) -> PassReport {
        if report != PassReport::default() {
            tracing::trace!(
                promoted = report.promoted,
                dispatched = report.dispatched,
                deferred = report.deferred,
                busy_workers = self.pool.active(),
                "Dispatch pass"
            );
        }
        report
    }
}
