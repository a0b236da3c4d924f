//! The operation state machine.
//!
//! ```text
//!            begin_attempt              Succeeded
//!  pending ───────────────▶ running ──────────────▶ succeeded
//!     ▲                      │  │    Permanent / Cancelled / exhausted
//!     │ promote_if_due       │  └──────────────────────────────▶ failed
//!     │                      │ Transient
//!  retrying ◀────────────────┘
//! ```
//!
//! Every method checks the current status first and refuses to touch a
//! terminal operation. Stores call these methods inside their atomic
//! sections; nothing here performs I/O.

use crate::{FailureReason, Operation, OperationStatus, Priority, RetryPolicy};
use core::cmp::Reverse;
use vaultops::OperationId;

/// Result of a single execution attempt, as classified by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    PermanentFailure(String),
    TransientFailure(String),
    /// The attempt was abandoned because the operation was cancelled.
    Cancelled,
}

/// Where an operation ended up after an outcome was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Succeeded,
    Failed(FailureReason),
    Retrying { not_before: u64 },
    /// Put back in the queue without a delay (crash recovery).
    Requeued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelEffect {
    /// The operation was not running and is now failed.
    Cancelled,
    /// The operation is running; its executor will honour the request.
    Requested,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("operation {id} is already {status}")]
    Terminal {
        id: OperationId,
        status: OperationStatus,
    },

    #[error("operation {id} cannot {action} while {status}")]
    Invalid {
        id: OperationId,
        status: OperationStatus,
        action: &'static str,
    },
}

/// Ordering key for dispatch: priority descending, then oldest first, then
/// identifier.
pub type DispatchKey = (Reverse<Priority>, u64, OperationId);

const INTERRUPTED: &str = "attempt interrupted by engine restart";
const UNRECORDED: &str = "attempt outcome could not be recorded";

impl Operation {
    fn guard(&self, action: &'static str, allowed: &[OperationStatus]) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal {
                id: self.id,
                status: self.status,
            });
        }
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(TransitionError::Invalid {
                id: self.id,
                status: self.status,
                action,
            })
        }
    }

    pub fn dispatch_key(&self) -> DispatchKey {
        (Reverse(self.priority), self.created_at, self.id)
    }

    /// `pending` and past any backoff deadline.
    pub fn is_dispatchable(&self, now: u64) -> bool {
        self.status == OperationStatus::Pending && self.not_before.is_none_or(|t| t <= now)
    }

    /// Moves a `retrying` operation back to `pending` once its backoff has
    /// elapsed. Returns `true` if it moved.
    pub fn promote_if_due(&mut self, now: u64) -> bool {
        let due = self.status == OperationStatus::Retrying && self.not_before.is_none_or(|t| t <= now);
        if due {
            self.status = OperationStatus::Pending;
            self.not_before = None;
            self.updated_at = now;
        }
        due
    }

    /// Moves the operation to `running` and counts the attempt. The caller
    /// must already hold a slot on the target.
    ///
    /// # Errors
    ///
    /// Fails unless the operation is `pending` or `retrying`.
    pub fn begin_attempt(&mut self, now: u64) -> Result<(), TransitionError> {
        self.guard(
            "start an attempt",
            &[OperationStatus::Pending, OperationStatus::Retrying],
        )?;
        self.status = OperationStatus::Running;
        self.attempt_count += 1;
        self.not_before = None;
        self.updated_at = now;
        Ok(())
    }

    /// Records the outcome of the running attempt.
    ///
    /// A pending cancellation overrides whatever the attempt returned. A
    /// transient failure on the last allowed attempt fails the operation with
    /// [`FailureReason::RetriesExhausted`], keeping the error message.
    ///
    /// # Errors
    ///
    /// Fails unless the operation is `running`.
    pub fn apply_outcome(
        &mut self,
        outcome: Outcome,
        policy: &RetryPolicy,
        now: u64,
    ) -> Result<Transition, TransitionError> {
        self.guard("record an outcome", &[OperationStatus::Running])?;
        let outcome = if self.cancel_requested {
            Outcome::Cancelled
        } else {
            outcome
        };

        self.updated_at = now;
        let transition = match outcome {
            Outcome::Succeeded => {
                self.status = OperationStatus::Succeeded;
                self.last_error = None;
                Transition::Succeeded
            }
            Outcome::PermanentFailure(message) => self.fail(FailureReason::Rejected, message),
            Outcome::Cancelled => self.fail(FailureReason::Cancelled, "cancelled by operator".into()),
            Outcome::TransientFailure(message) if policy.is_exhausted(self.attempt_count) => {
                self.fail(FailureReason::RetriesExhausted, message)
            }
            Outcome::TransientFailure(message) => {
                let not_before = now.saturating_add(policy.backoff.delay_ms(self.attempt_count));
                self.status = OperationStatus::Retrying;
                self.not_before = Some(not_before);
                self.last_error = Some(message);
                Transition::Retrying { not_before }
            }
        };
        Ok(transition)
    }

    fn fail(&mut self, reason: FailureReason, message: String) -> Transition {
        self.status = OperationStatus::Failed;
        self.failure = Some(reason);
        self.last_error = Some(message);
        self.not_before = None;
        Transition::Failed(reason)
    }

    /// Cancels the operation: immediately when it is waiting, cooperatively
    /// when it is running.
    ///
    /// # Errors
    ///
    /// Fails for terminal operations.
    pub fn cancel(&mut self, now: u64) -> Result<CancelEffect, TransitionError> {
        self.guard(
            "be cancelled",
            &[
                OperationStatus::Pending,
                OperationStatus::Retrying,
                OperationStatus::Running,
            ],
        )?;
        self.updated_at = now;
        if self.status == OperationStatus::Running {
            self.cancel_requested = true;
            return Ok(CancelEffect::Requested);
        }
        self.fail(FailureReason::Cancelled, "cancelled by operator".into());
        Ok(CancelEffect::Cancelled)
    }

    /// Re-evaluates an operation found `running` after a restart.
    ///
    /// The interrupted attempt counts against the ceiling. The caller releases
    /// the target slot.
    ///
    /// # Errors
    ///
    /// Fails unless the operation is `running`.
    pub fn requeue_interrupted(
        &mut self,
        policy: &RetryPolicy,
        now: u64,
    ) -> Result<Transition, TransitionError> {
        self.requeue_running(policy, now, INTERRUPTED)
    }

    /// Re-evaluates a `running` operation whose attempt finished but whose
    /// outcome never made it to the store. Same rules as
    /// [`Self::requeue_interrupted`].
    ///
    /// # Errors
    ///
    /// Fails unless the operation is `running`.
    pub fn requeue_unrecorded(
        &mut self,
        policy: &RetryPolicy,
        now: u64,
    ) -> Result<Transition, TransitionError> {
        self.requeue_running(policy, now, UNRECORDED)
    }

    fn requeue_running(
        &mut self,
        policy: &RetryPolicy,
        now: u64,
        message: &str,
    ) -> Result<Transition, TransitionError> {
        self.guard("be requeued", &[OperationStatus::Running])?;
        self.updated_at = now;
        if self.cancel_requested {
            return Ok(self.fail(FailureReason::Cancelled, "cancelled by operator".into()));
        }
        if policy.is_exhausted(self.attempt_count) {
            return Ok(self.fail(FailureReason::RetriesExhausted, message.into()));
        }
        self.status = OperationStatus::Pending;
        self.not_before = None;
        self.last_error = Some(message.into());
        Ok(Transition::Requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Backoff, NewOperation, OperationKind};
    use serde_json::json;
    use vaultops::{IdGenerator, MonotonicClock};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Backoff::new(100, 1_000).without_jitter())
    }

    fn pending_op() -> Operation {
        let ids = IdGenerator::new(MonotonicClock::default());
        Operation::new(
            ids.operation_id(),
            NewOperation::new(OperationKind::GrantAccess, ids.target_id(), json!({})),
            1_000,
        )
    }

    #[test]
    fn success_path() {
        let mut op = pending_op();
        op.begin_attempt(1_010).unwrap();
        assert_eq!(op.status, OperationStatus::Running);
        assert_eq!(op.attempt_count, 1);
        let t = op.apply_outcome(Outcome::Succeeded, &policy(3), 1_020).unwrap();
        assert_eq!(t, Transition::Succeeded);
        assert_eq!(op.status, OperationStatus::Succeeded);
        assert_eq!(op.updated_at, 1_020);
    }

    #[test]
    fn permanent_failure_keeps_message_verbatim() {
        let mut op = pending_op();
        op.begin_attempt(1_010).unwrap();
        op.apply_outcome(Outcome::PermanentFailure("safe already exists".into()), &policy(3), 1_020)
            .unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.failure, Some(FailureReason::Rejected));
        assert_eq!(op.last_error.as_deref(), Some("safe already exists"));
    }

    #[test]
    fn transient_failure_schedules_backoff() {
        let mut op = pending_op();
        op.begin_attempt(1_000).unwrap();
        let t = op
            .apply_outcome(Outcome::TransientFailure("503".into()), &policy(3), 2_000)
            .unwrap();
        assert_eq!(t, Transition::Retrying { not_before: 2_100 });
        assert!(!op.is_dispatchable(2_100));
        assert!(!op.promote_if_due(2_099));
        assert!(op.promote_if_due(2_100));
        assert!(op.is_dispatchable(2_100));
        assert_eq!(op.last_error.as_deref(), Some("503"));
    }

    #[test]
    fn third_transient_failure_exhausts_retries() {
        let mut op = pending_op();
        let policy = policy(3);
        let mut now = 1_000;
        for _ in 0..2 {
            op.begin_attempt(now).unwrap();
            let t = op
                .apply_outcome(Outcome::TransientFailure("timeout".into()), &policy, now)
                .unwrap();
            assert!(matches!(t, Transition::Retrying { .. }));
            now += 10_000;
            assert!(op.promote_if_due(now));
        }
        op.begin_attempt(now).unwrap();
        let t = op
            .apply_outcome(Outcome::TransientFailure("timeout".into()), &policy, now)
            .unwrap();
        assert_eq!(t, Transition::Failed(FailureReason::RetriesExhausted));
        assert_eq!(op.attempt_count, 3);
        assert_eq!(op.failure.map(|r| r.to_string()).as_deref(), Some("retries exhausted"));
        assert_eq!(op.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn terminal_operations_are_immutable() {
        let mut op = pending_op();
        op.begin_attempt(1_000).unwrap();
        op.apply_outcome(Outcome::Succeeded, &policy(3), 1_001).unwrap();
        let before = op.clone();

        assert!(matches!(op.begin_attempt(2_000), Err(TransitionError::Terminal { .. })));
        assert!(matches!(
            op.apply_outcome(Outcome::Succeeded, &policy(3), 2_000),
            Err(TransitionError::Terminal { .. })
        ));
        assert!(matches!(op.cancel(2_000), Err(TransitionError::Terminal { .. })));
        assert!(!op.promote_if_due(2_000));
        assert_eq!(op, before);
    }

    #[test]
    fn outcome_requires_running() {
        let mut op = pending_op();
        assert!(matches!(
            op.apply_outcome(Outcome::Succeeded, &policy(3), 1_001),
            Err(TransitionError::Invalid { .. })
        ));
        op.begin_attempt(1_000).unwrap();
        assert!(matches!(op.begin_attempt(1_000), Err(TransitionError::Invalid { .. })));
    }

    #[test]
    fn cancel_waiting_operation_fails_it() {
        let mut op = pending_op();
        assert_eq!(op.cancel(1_005).unwrap(), CancelEffect::Cancelled);
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.failure, Some(FailureReason::Cancelled));
    }

    #[test]
    fn cancel_running_operation_overrides_outcome() {
        let mut op = pending_op();
        op.begin_attempt(1_000).unwrap();
        assert_eq!(op.cancel(1_005).unwrap(), CancelEffect::Requested);
        assert_eq!(op.status, OperationStatus::Running);
        let t = op.apply_outcome(Outcome::Succeeded, &policy(3), 1_010).unwrap();
        assert_eq!(t, Transition::Failed(FailureReason::Cancelled));
    }

    #[test]
    fn interrupted_attempts_are_requeued_until_the_ceiling() {
        let mut op = pending_op();
        op.begin_attempt(1_000).unwrap();
        assert_eq!(op.requeue_interrupted(&policy(2), 5_000).unwrap(), Transition::Requeued);
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.attempt_count, 1);

        op.begin_attempt(6_000).unwrap();
        assert_eq!(
            op.requeue_interrupted(&policy(2), 7_000).unwrap(),
            Transition::Failed(FailureReason::RetriesExhausted)
        );
    }

    #[test]
    fn dispatch_key_orders_priority_then_age() {
        let mut high = pending_op();
        high.priority = Priority::High;
        high.created_at = 2_000;
        let mut old_normal = pending_op();
        old_normal.created_at = 1_000;
        let mut new_normal = pending_op();
        new_normal.created_at = 1_500;

        let mut ops = [new_normal.clone(), old_normal.clone(), high.clone()];
        ops.sort_by_key(Operation::dispatch_key);
        assert_eq!(ops.map(|op| op.id), [high.id, old_normal.id, new_normal.id]);
    }
}
