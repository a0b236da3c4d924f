use super::blocking;
use crate::server::telemetry::{record_attempt_duration, record_transition};
use core::time::Duration;
use std::sync::Arc;
use tokio::sync::Notify;
use vaultops_core::{
    Backoff, Completion, Error, OperationStore, Outcome, Result, RetryPolicy, SharedClock,
    Transition,
};
use vaultops_core::vaultops::{OperationId, TimeSource};

/// Store calls made when settling one attempt, per step.
const STORE_ATTEMPTS: u32 = 5;
const STORE_BACKOFF: Backoff = Backoff::new(20, 500);

/// Persists attempt outcomes.
///
/// The transition and the slot release happen in one store call, so a crash
/// can never leave a finished operation holding a slot.
#[derive(Clone)]
pub struct Recorder {
    store: Arc<dyn OperationStore>,
    retry: RetryPolicy,
    clock: SharedClock,
    settled: Arc<Notify>,
}

impl Recorder {
    /// `settled` is notified after every recorded outcome.
    pub fn new(
        store: Arc<dyn OperationStore>,
        retry: RetryPolicy,
        clock: SharedClock,
        settled: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            retry,
            clock,
            settled,
        }
    }

    pub fn record(
        &self,
        id: OperationId,
        outcome: Outcome,
        elapsed: Duration,
    ) -> Result<Completion> {
        let now = self.clock.current_millis();
        let completion = self.store.complete(id, outcome, &self.retry, now)?;

        record_attempt_duration(elapsed.as_secs_f64() * 1_000.0);
        record_transition(&completion.transition);

        let op = &completion.operation;
        match completion.transition {
            Transition::Succeeded => {
                tracing::info!(operation = %id, attempts = op.attempt_count, "Operation succeeded");
            }
            Transition::Failed(reason) => tracing::warn!(
                operation = %id,
                attempts = op.attempt_count,
                %reason,
                error = op.last_error.as_deref().unwrap_or_default(),
                "Operation failed"
            ),
            Transition::Retrying { not_before } => tracing::info!(
                operation = %id,
                attempts = op.attempt_count,
                retry_in_ms = not_before.saturating_sub(now),
                error = op.last_error.as_deref().unwrap_or_default(),
                "Attempt failed, retry scheduled"
            ),
            Transition::Requeued => tracing::debug!(operation = %id, "Operation requeued"),
        }

        self.settled.notify_waiters();
        Ok(completion)
    }

    /// Requeues a `running` operation without its outcome and frees its slot.
    pub fn release(&self, id: OperationId) -> Result<Completion> {
        let now = self.clock.current_millis();
        let completion = self.store.release(id, &self.retry, now)?;
        record_transition(&completion.transition);
        tracing::warn!(
            operation = %id,
            status = %completion.operation.status,
            "Released slot of an attempt whose outcome was lost"
        );
        self.settled.notify_waiters();
        Ok(completion)
    }

    /// Records `outcome` off the async runtime, retrying storage failures.
    ///
    /// When the store keeps refusing the outcome the operation is released
    /// instead: the attempt is treated like one interrupted by a restart, so
    /// the target slot is freed now rather than on the next start.
    pub async fn settle(
        &self,
        id: OperationId,
        outcome: Outcome,
        elapsed: Duration,
    ) -> Result<Completion> {
        let recorded = self
            .retry_storage(id, "record outcome", move |recorder| {
                recorder.record(id, outcome.clone(), elapsed)
            })
            .await;
        match recorded {
            Err(Error::Storage { .. }) => {
                self.retry_storage(id, "release slot", move |recorder| recorder.release(id))
                    .await
            }
            other => other,
        }
    }

    async fn retry_storage<F>(
        &self,
        id: OperationId,
        step: &'static str,
        call: F,
    ) -> Result<Completion>
    where
        F: Fn(&Recorder) -> Result<Completion> + Clone + Send + 'static,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let recorder = self.clone();
            let call = call.clone();
            match blocking(move || call(&recorder)).await {
                Err(e @ Error::Storage { .. }) if attempt < STORE_ATTEMPTS => {
                    let delay = STORE_BACKOFF.delay_ms(attempt);
                    tracing::warn!(
                        operation = %id,
                        attempt,
                        retry_in_ms = delay,
                        "Failed to {step}: {e}"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => {
                    tracing::error!(operation = %id, attempt, "Failed to {step}: {e}");
                    return Err(e);
                }
                Ok(completion) => return Ok(completion),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultops_core::{
        Backoff, ClaimOutcome, FailureReason, Ids, MemoryStore, NewOperation, NewTarget,
        Operation, OperationKind, OperationStatus, Target, system_clock,
    };

    fn setup() -> (Recorder, Arc<MemoryStore>, OperationId, vaultops_core::vaultops::TargetId) {
        let clock = system_clock();
        let ids = Ids::new(clock.clone());
        let store = Arc::new(MemoryStore::new());
        let now = clock.current_millis();

        let target = Target::new(
            ids.target_id(),
            NewTarget::new("vault-a", "https://vault-a.internal"),
            now,
        )
        .unwrap();
        let target_id = target.id;
        store.insert_target(target).unwrap();

        let request = NewOperation::new(
            OperationKind::DeleteResource,
            target_id,
            serde_json::json!({ "resource_name": "old" }),
        );
        let op = Operation::new(ids.operation_id(), request, now);
        let id = op.id;
        store.insert_operation(op).unwrap();
        assert!(matches!(
            store.claim(id, now).unwrap(),
            ClaimOutcome::Claimed { .. }
        ));

        let retry = RetryPolicy::new(2, Backoff::new(1, 1).without_jitter());
        let recorder = Recorder::new(store.clone(), retry, clock, Arc::new(Notify::new()));
        (recorder, store, id, target_id)
    }

    #[test]
    fn success_releases_the_slot() {
        let (recorder, store, id, target_id) = setup();
        let completion = recorder
            .record(id, Outcome::Succeeded, Duration::from_millis(3))
            .unwrap();

        assert_eq!(completion.transition, Transition::Succeeded);
        assert_eq!(completion.operation.status, OperationStatus::Succeeded);
        assert_eq!(store.target(target_id).unwrap().in_flight, 0);
    }

    #[test]
    fn permanent_failure_keeps_the_message() {
        let (recorder, store, id, target_id) = setup();
        let completion = recorder
            .record(
                id,
                Outcome::PermanentFailure("safe already exists".into()),
                Duration::ZERO,
            )
            .unwrap();

        assert_eq!(
            completion.transition,
            Transition::Failed(FailureReason::Rejected)
        );
        assert_eq!(
            completion.operation.last_error.as_deref(),
            Some("safe already exists")
        );
        assert_eq!(store.target(target_id).unwrap().in_flight, 0);
    }

    #[test]
    fn recording_twice_is_refused() {
        let (recorder, _store, id, _) = setup();
        recorder
            .record(id, Outcome::Succeeded, Duration::ZERO)
            .unwrap();
        assert!(
            recorder
                .record(id, Outcome::Succeeded, Duration::ZERO)
                .is_err()
        );
    }
}
