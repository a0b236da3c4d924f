use crate::server::{
    service::{blocking, recorder::Recorder},
    telemetry::{decrement_operations_inflight, increment_operations_inflight},
};
use core::{any::Any, time::Duration};
use std::{sync::Arc, time::Instant};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use vaultops_core::{
    CredentialProvider, ExecutionContext, HandlerRegistry, Operation, OperationStore, Outcome,
    Target, TargetConnection,
};

/// Runs exactly one attempt of a claimed operation and hands the result to
/// the [`Recorder`].
///
/// The executor never retries. Whatever happens inside the handler (an
/// error, a panic, a hang past the attempt timeout) is turned into an
/// [`Outcome`], so the slot taken by the claim is always released through
/// the recorder. The exceptions are engine shutdown, where an abandoned
/// attempt is left `running` for recovery to deal with, and a store that
/// refuses both the outcome and the release.
pub struct Executor {
    store: Arc<dyn OperationStore>,
    registry: Arc<HandlerRegistry>,
    credentials: Arc<dyn CredentialProvider>,
    recorder: Recorder,
    attempt_timeout: Duration,
}

impl Executor {
    pub fn new(
        store: Arc<dyn OperationStore>,
        registry: Arc<HandlerRegistry>,
        credentials: Arc<dyn CredentialProvider>,
        recorder: Recorder,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            credentials,
            recorder,
            attempt_timeout,
        }
    }

    /// Executes `operation` (already `running`) against `target` and records
    /// the outcome.
    #[tracing::instrument(
        name = "attempt",
        skip_all,
        fields(
            operation = %operation.id,
            kind = %operation.kind,
            attempt = operation.attempt_count,
        )
    )]
    pub async fn run(
        self: Arc<Self>,
        operation: Operation,
        target: Option<Target>,
        shutdown: CancellationToken,
    ) {
        let started = Instant::now();
        let id = operation.id;
        increment_operations_inflight();

        let outcome = self.attempt(operation, target, &shutdown).await;
        decrement_operations_inflight();

        let Some(outcome) = outcome else {
            tracing::warn!("Attempt abandoned by shutdown; left running for recovery");
            return;
        };

        if let Err(e) = self.recorder.settle(id, outcome, started.elapsed()).await {
            tracing::error!("Outcome lost, slot stays held until recovery: {e}");
        }
    }

    async fn attempt(
        &self,
        operation: Operation,
        target: Option<Target>,
        shutdown: &CancellationToken,
    ) -> Option<Outcome> {
        if self.cancel_requested(&operation).await {
            tracing::debug!("Cancelled before the external call");
            return Some(Outcome::Cancelled);
        }

        let Some(handler) = self.registry.get(operation.kind).cloned() else {
            return Some(Outcome::PermanentFailure(format!(
                "no handler registered for `{}`",
                operation.kind
            )));
        };

        let target = target.as_ref().map(TargetConnection::from);
        let credential = match self.credentials.issue(operation.id, target.as_ref()) {
            Ok(credential) => credential,
            Err(e) => return Some(e.into()),
        };
        tracing::debug!(session = %credential.session_id, "Issued credential");

        // The handler runs on its own task so a panic surfaces as a
        // `JoinError` instead of unwinding through the worker.
        let task = tokio::spawn(async move {
            let ctx = ExecutionContext {
                operation: &operation,
                target: target.as_ref(),
                credential: &credential,
            };
            handler.execute(ctx).await
        });
        let abort = task.abort_handle();

        let joined = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                abort.abort();
                return None;
            }
            joined = timeout(self.attempt_timeout, task) => joined,
        };

        let outcome = match joined {
            Ok(Ok(Ok(()))) => Outcome::Succeeded,
            Ok(Ok(Err(e))) => e.into(),
            Ok(Err(e)) if e.is_panic() => Outcome::TransientFailure(format!(
                "handler panicked: {}",
                panic_message(e.into_panic())
            )),
            Ok(Err(e)) => Outcome::TransientFailure(format!("handler task failed: {e}")),
            Err(_) => {
                abort.abort();
                Outcome::TransientFailure(format!(
                    "attempt timed out after {}s",
                    self.attempt_timeout.as_secs_f64()
                ))
            }
        };
        Some(outcome)
    }

    async fn cancel_requested(&self, operation: &Operation) -> bool {
        let store = Arc::clone(&self.store);
        let id = operation.id;
        match blocking(move || store.operation(id)).await {
            Ok(current) => current.cancel_requested,
            Err(e) => {
                tracing::warn!("Could not re-read cancel flag: {e}");
                operation.cancel_requested
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map_or_else(|| "unknown panic".to_string(), |s| (*s).to_string()),
    }
}
