//! Bounded pool of attempt tasks.
//!
//! This module defines the [`WorkerPool`], which caps how many attempts run at
//! once across every target. Each attempt is its own Tokio task holding one
//! semaphore permit; the dispatcher reserves a permit *before* claiming a
//! slot in the store, so a claimed operation always has a worker.
//!
//! When a task finishes its permit is returned and the dispatcher is woken,
//! so freed capacity is picked up without waiting for the next tick.

use core::{future::Future, time::Duration};
use std::sync::Arc;
use tokio::{
    sync::{Notify, OwnedSemaphorePermit, Semaphore},
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

pub struct WorkerPool {
    size: usize,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
    wake: Arc<Notify>,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    /// Creates a pool of `size` workers. `wake` is notified every time a
    /// worker frees up.
    pub fn new(
        size: usize,
        wake: Arc<Notify>,
        shutdown_token: CancellationToken,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            size,
            permits: Arc::new(Semaphore::new(size)),
            tasks: TaskTracker::new(),
            wake,
            shutdown_token,
            shutdown_timeout,
        }
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    /// Attempts currently holding a worker.
    pub fn active(&self) -> usize {
        self.size.saturating_sub(self.permits.available_permits())
    }

    /// Cancelled when the pool gives up on draining. Attempts select on it
    /// and abandon their work.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown_token
    }

    pub fn is_closed(&self) -> bool {
        self.tasks.is_closed()
    }

    /// Reserves a worker without waiting. Returns `None` when every worker is
    /// busy or the pool is shutting down.
    pub fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        if self.tasks.is_closed() {
            return None;
        }
        Arc::clone(&self.permits).try_acquire_owned().ok()
    }

    /// Waits for a free worker. Returns `None` once the pool is shutting down.
    pub async fn reserve(&self) -> Option<OwnedSemaphorePermit> {
        if self.tasks.is_closed() {
            return None;
        }
        Arc::clone(&self.permits).acquire_owned().await.ok()
    }

    /// Runs `work` on the worker reserved by `permit`.
    pub fn spawn<F>(&self, permit: OwnedSemaphorePermit, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let wake = Arc::clone(&self.wake);
        self.tasks.spawn(async move {
            work.await;
            drop(permit);
            wake.notify_one();
        });
    }

    /// Gracefully shuts the pool down.
    ///
    /// Returns how many attempts were abandoned. Their operations stay
    /// `running` in the store until recovery runs on the next start.
    pub async fn shutdown(&self) -> usize {
        // === Phase 0: Stop accepting work ===
        tracing::debug!("Closing worker pool to new attempts");
        self.tasks.close();
        self.permits.close();

        // === Phase 1: Drain running attempts ===
        let running = self.tasks.len();
        if running > 0 {
            tracing::info!(
                "Waiting up to {:?} for {running} running attempts",
                self.shutdown_timeout
            );
        }
        if timeout(self.shutdown_timeout, self.tasks.wait()).await.is_ok() {
            tracing::info!("Worker pool drained");
            return 0;
        }

        // === Phase 2: Abandon what is left ===
        let abandoned = self.tasks.len();
        tracing::warn!("Drain timed out, abandoning {abandoned} attempts");
        self.shutdown_token.cancel();

        // === Phase 3: Give abandoned tasks a moment to unwind ===
        if timeout(Duration::from_secs(3), self.tasks.wait()).await.is_err() {
            tracing::error!(
                "{} attempts did not stop after cancellation",
                self.tasks.len()
            );
        }

        tracing::info!("Worker pool shutdown complete");
        abandoned
    }
}
