//! The engine handle.
//!
//! [`Engine`] is the only way in: it validates submissions, owns the worker
//! pool and the dispatcher task, and exposes status queries. Cloning is cheap
//! and every clone drives the same engine.
//!
//! Submission, cancellation and query methods are synchronous and call the
//! store inline. The scheduling path (dispatch passes, cancel checks, outcome
//! recording) runs its store calls on the blocking pool.
//!
//! ## Lifecycle
//!
//! 1. [`EngineBuilder::build`] wires the store, handler registry, clock and
//!    credential provider together. Nothing runs yet, so targets and
//!    operations can be loaded first.
//! 2. [`Engine::start`] applies the recovery policy to operations a previous
//!    process left `running`, resumes retained attempts and starts the
//!    dispatcher.
//! 3. [`Engine::shutdown`] stops dispatching, drains running attempts and
//!    abandons whatever is still running after the shutdown timeout.

use super::{
    EngineConfig, blocking,
    dispatcher::Dispatcher,
    recorder::Recorder,
};
use crate::server::{
    pool::{manager::WorkerPool, worker::Executor},
    telemetry::{increment_operations_failed, increment_operations_submitted},
};
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use vaultops_core::{
    CancelEffect, CredentialProvider, Error, FailureReason, HandlerRegistry, Ids, NewOperation,
    NewTarget, Operation, OperationFilter, OperationStore, QueueStats, RecoveryReport, Result,
    SessionCredentials, SessionLimit, SharedClock, Target, system_clock,
    vaultops::{OperationId, TargetId, TimeSource},
};

/// Configures an [`Engine`].
pub struct EngineBuilder {
    store: Arc<dyn OperationStore>,
    registry: HandlerRegistry,
    config: EngineConfig,
    clock: Option<SharedClock>,
    credentials: Option<Arc<dyn CredentialProvider>>,
}

impl EngineBuilder {
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the system clock (timestamps, backoff deadlines, IDs).
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replaces the default [`SessionCredentials`] provider.
    #[must_use]
    pub fn credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    pub fn build(self) -> Engine {
        let Self {
            store,
            registry,
            config,
            clock,
            credentials,
        } = self;

        let clock = clock.unwrap_or_else(system_clock);
        let ids = Arc::new(Ids::new(clock.clone()));
        let credentials = credentials
            .unwrap_or_else(|| Arc::new(SessionCredentials::new(Arc::clone(&ids), clock.clone())));
        let registry = Arc::new(registry);

        let wake = Arc::new(Notify::new());
        let settled = Arc::new(Notify::new());
        let pool = Arc::new(WorkerPool::new(
            config.num_workers,
            Arc::clone(&wake),
            CancellationToken::new(),
            config.shutdown_timeout,
        ));
        let recorder = Recorder::new(
            Arc::clone(&store),
            config.retry,
            clock.clone(),
            Arc::clone(&settled),
        );
        let executor = Arc::new(Executor::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            credentials,
            recorder,
            config.attempt_timeout,
        ));

        Engine {
            store,
            registry,
            ids,
            clock,
            config,
            pool,
            executor,
            wake,
            settled,
            stop: CancellationToken::new(),
            tasks: TaskTracker::new(),
            started: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Handle to a running (or not yet started) orchestration engine.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn OperationStore>,
    registry: Arc<HandlerRegistry>,
    ids: Arc<Ids>,
    clock: SharedClock,
    config: EngineConfig,
    pool: Arc<WorkerPool>,
    executor: Arc<Executor>,
    /// Wakes the dispatcher.
    wake: Arc<Notify>,
    /// Notified whenever an operation changes state outside the dispatcher.
    settled: Arc<Notify>,
    stop: CancellationToken,
    tasks: TaskTracker,
    started: Arc<AtomicBool>,
}

impl Engine {
    pub fn builder(store: Arc<dyn OperationStore>, registry: HandlerRegistry) -> EngineBuilder {
        EngineBuilder {
            store,
            registry,
            config: EngineConfig::default(),
            clock: None,
            credentials: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn now(&self) -> u64 {
        self.clock.current_millis()
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.stop.is_cancelled() {
            Err(Error::ServiceShutdown)
        } else {
            Ok(())
        }
    }

    /// Recovers interrupted work and starts dispatching.
    ///
    /// A failed start leaves nothing running and may be retried.
    ///
    /// # Errors
    ///
    /// Fails if the engine was already started or is shutting down, or if
    /// the store cannot be read.
    pub async fn start(&self) -> Result<RecoveryReport> {
        self.ensure_accepting()?;
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::validation("engine already started"));
        }

        let result = self.launch().await;
        if result.is_err() {
            self.started.store(false, Ordering::Release);
        }
        result
    }

    async fn launch(&self) -> Result<RecoveryReport> {
        let (store, recovery, retry, now) = (
            Arc::clone(&self.store),
            self.config.recovery,
            self.config.retry,
            self.now(),
        );
        let report = blocking(move || store.recover(recovery, &retry, now)).await?;
        tracing::info!(
            policy = %self.config.recovery,
            requeued = report.requeued.len(),
            failed = report.failed.len(),
            resumed = report.resumed.len(),
            reconciled_targets = report.reconciled_targets,
            "Recovery complete"
        );
        for id in &report.failed {
            tracing::warn!(operation = %id, "Interrupted operation failed during recovery");
        }

        // Resolve every target before spawning anything, so an error here
        // leaves no attempt running.
        let store = Arc::clone(&self.store);
        let resumed = report.resumed.clone();
        let resumed = blocking(move || {
            resumed
                .into_iter()
                .map(|operation| -> Result<_> {
                    let target = operation
                        .target_id
                        .map(|id| store.target(id))
                        .transpose()?;
                    Ok((operation, target))
                })
                .collect::<Result<Vec<_>>>()
        })
        .await?;

        for (operation, target) in resumed {
            let Some(permit) = self.pool.reserve().await else {
                return Err(Error::ServiceShutdown);
            };
            tracing::info!(operation = %operation.id, "Resuming interrupted attempt");
            let shutdown = self.pool.shutdown_token().clone();
            self.pool.spawn(
                permit,
                Arc::clone(&self.executor).run(operation, target, shutdown),
            );
        }

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.store),
            Arc::clone(&self.pool),
            Arc::clone(&self.executor),
            self.clock.clone(),
            self.config.dispatch_batch_size,
            self.config.dispatch_interval,
            Arc::clone(&self.wake),
            self.stop.clone(),
        );
        self.tasks.spawn(dispatcher.run());

        tracing::info!(
            workers = self.pool.size(),
            kinds = ?self.registry.kinds().collect::<Vec<_>>(),
            "Engine started"
        );
        Ok(report)
    }

    /// Registers a target.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an empty name or endpoint, an
    /// invalid limit or a duplicate name.
    pub fn register_target(&self, request: NewTarget) -> Result<Target> {
        let target = Target::new(self.ids.target_id(), request, self.now())?;
        self.store.insert_target(target.clone())?;
        tracing::info!(
            target = %target.id,
            name = %target.name,
            limit = %target.limit,
            "Target registered"
        );
        Ok(target)
    }

    /// Changes a target's session limit. Running attempts keep their slots
    /// when the limit is lowered; new claims wait until usage drops below it.
    pub fn set_target_limit(&self, id: TargetId, limit: SessionLimit) -> Result<Target> {
        let target = self.store.set_target_limit(id, limit, self.now())?;
        tracing::info!(target = %id, %limit, in_flight = target.in_flight, "Target limit changed");
        self.wake.notify_one();
        Ok(target)
    }

    pub fn target(&self, id: TargetId) -> Result<Target> {
        self.store.target(id)
    }

    pub fn targets(&self) -> Result<Vec<Target>> {
        self.store.targets()
    }

    pub fn find_target(&self, name: &str) -> Result<Option<Target>> {
        self.store.find_target_by_name(name)
    }

    /// Validates and queues an operation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when no handler accepts the request,
    /// [`Error::TargetNotFound`] for an unknown target and
    /// [`Error::ServiceShutdown`] once shutdown has begun.
    pub fn submit(&self, request: NewOperation) -> Result<OperationId> {
        self.ensure_accepting()?;
        self.registry.validate(&request)?;

        let operation = Operation::new(self.ids.operation_id(), request, self.now());
        let (id, kind, priority) = (operation.id, operation.kind, operation.priority);
        self.store.insert_operation(operation)?;

        increment_operations_submitted(kind);
        tracing::info!(operation = %id, %kind, %priority, "Operation submitted");
        self.wake.notify_one();
        Ok(id)
    }

    pub fn operation(&self, id: OperationId) -> Result<Operation> {
        self.store.operation(id)
    }

    pub fn operations(&self, filter: OperationFilter) -> Result<Vec<Operation>> {
        self.store.operations(filter)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.store.stats()
    }

    /// Cancels an operation.
    ///
    /// A waiting operation fails immediately. A running one is flagged; its
    /// executor checks the flag before calling the vault and the recorded
    /// outcome becomes a cancellation either way.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transition`] if the operation is already terminal.
    pub fn cancel(&self, id: OperationId) -> Result<CancelEffect> {
        let effect = self.store.cancel(id, self.now())?;
        match effect {
            CancelEffect::Cancelled => {
                increment_operations_failed(FailureReason::Cancelled);
                tracing::info!(operation = %id, "Operation cancelled");
                self.settled.notify_waiters();
            }
            CancelEffect::Requested => {
                tracing::info!(operation = %id, "Cancellation requested for running operation");
            }
        }
        Ok(effect)
    }

    /// Returns `true` when nothing is pending, running or retrying.
    pub fn is_idle(&self) -> Result<bool> {
        Ok(self.stats()?.active() == 0)
    }

    /// Resolves once the engine is idle.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn wait_idle(&self) -> Result<()> {
        loop {
            let settled = self.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            if self.is_idle()? {
                return Ok(());
            }

            tokio::select! {
                () = settled => {}
                () = tokio::time::sleep(self.config.dispatch_interval) => {}
            }
        }
    }

    /// Stops dispatching and shuts the worker pool down.
    ///
    /// Returns how many attempts had to be abandoned.
    pub async fn shutdown(&self) -> usize {
        // === Phase 0: Refuse new submissions and stop the dispatcher ===
        tracing::info!("Stopping dispatcher");
        self.stop.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        // === Phase 1..3: Drain, then abandon, running attempts ===
        let abandoned = self.pool.shutdown().await;
        if abandoned > 0 {
            tracing::warn!("{abandoned} attempts left running; they will be recovered on restart");
        }
        tracing::info!("Engine shut down");
        abandoned
    }
}
