//! Persistence contract for operations and targets.
//!
//! Implementations are responsible for making slot ownership explicit:
//! - `dispatchable` must return candidates in dispatch order (priority
//!   descending, oldest first, identifier as the final tie-break).
//! - `claim` must atomically take a slot on the operation's target and move
//!   the operation to `running`, or do neither.
//! - `complete` must atomically record the outcome and release the slot.
//! - `release` must atomically requeue (or fail, at the ceiling) a running
//!   operation and release its slot.
//! - `recover` must leave every target's `in_flight` equal to the number of
//!   operations still `running` against it.

mod memory;
mod sqlite;

pub use memory::*;
pub use sqlite::*;

use crate::{
    CancelEffect, Error, Operation, OperationFilter, OperationStatus, Outcome, QueueStats, Result,
    RetryPolicy, SessionLimit, Target, Transition,
};
use core::{fmt, str::FromStr};
use vaultops::{OperationId, TargetId};

/// Result of trying to start an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The operation is now `running` and holds a slot on `target`.
    Claimed {
        operation: Operation,
        target: Option<Target>,
    },
    /// The target is at its limit; the operation stays `pending`.
    NoCapacity,
    /// The operation is no longer `pending` or is still backing off.
    NotDispatchable,
}

/// The recorded result of an attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub operation: Operation,
    pub transition: Transition,
}

/// What to do with operations found `running` when the engine starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecoveryPolicy {
    /// Release their slots and put them back in the queue. The interrupted
    /// attempt counts against the retry ceiling.
    #[default]
    Requeue,
    /// Keep them `running` with their slots and resume the interrupted
    /// attempt.
    Retain,
}

impl FromStr for RecoveryPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "requeue" => Ok(Self::Requeue),
            "retain" => Ok(Self::Retain),
            other => Err(Error::validation(format!(
                "unknown recovery policy `{other}` (expected `requeue` or `retain`)"
            ))),
        }
    }
}

impl fmt::Display for RecoveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Requeue => "requeue",
            Self::Retain => "retain",
        })
    }
}

/// What recovery did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub requeued: Vec<OperationId>,
    pub failed: Vec<OperationId>,
    /// Operations left `running` that the engine must resume.
    pub resumed: Vec<Operation>,
    /// Targets whose stored `in_flight` disagreed with reality.
    pub reconciled_targets: usize,
}

/// Durable record of operations and targets, and the atomic slot primitives
/// the dispatcher relies on.
///
/// Methods are synchronous; callers on an async runtime keep the critical
/// sections short and never hold them across external I/O.
pub trait OperationStore: Send + Sync {
    /// Stores a new target.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Validation`] when the name is already taken.
    fn insert_target(&self, target: Target) -> Result<()>;

    fn target(&self, id: TargetId) -> Result<Target>;

    fn targets(&self) -> Result<Vec<Target>>;

    fn find_target_by_name(&self, name: &str) -> Result<Option<Target>>;

    /// Changes a target's limit. Running operations keep their slots even if
    /// the new limit is lower.
    fn set_target_limit(&self, id: TargetId, limit: SessionLimit, now: u64) -> Result<Target>;

    /// Stores a new operation.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::TargetNotFound`] when it references an unknown
    /// target.
    fn insert_operation(&self, operation: Operation) -> Result<()>;

    fn operation(&self, id: OperationId) -> Result<Operation>;

    /// Lists matching operations in identifier (creation) order.
    fn operations(&self, filter: OperationFilter) -> Result<Vec<Operation>>;

    /// Moves every `retrying` operation whose backoff has elapsed back to
    /// `pending`. Returns how many moved.
    fn promote_due_retries(&self, now: u64) -> Result<usize>;

    /// Returns up to `limit` dispatchable operations whose target currently
    /// has a free slot, in dispatch order.
    fn dispatchable(&self, now: u64, limit: usize) -> Result<Vec<Operation>>;

    fn claim(&self, id: OperationId, now: u64) -> Result<ClaimOutcome>;

    fn complete(
        &self,
        id: OperationId,
        outcome: Outcome,
        policy: &RetryPolicy,
        now: u64,
    ) -> Result<Completion>;

    /// Frees the slot of a `running` operation whose outcome could not be
    /// recorded. The operation goes back to `pending`, or to `failed` when
    /// its attempts are used up or it was cancelled.
    fn release(&self, id: OperationId, policy: &RetryPolicy, now: u64) -> Result<Completion>;

    fn cancel(&self, id: OperationId, now: u64) -> Result<CancelEffect>;

    /// Reconciles state after a restart. See [`RecoveryPolicy`].
    fn recover(
        &self,
        policy: RecoveryPolicy,
        retry: &RetryPolicy,
        now: u64,
    ) -> Result<RecoveryReport>;

    fn stats(&self) -> Result<QueueStats>;
}

/// Applies recovery to one `running` operation and files the result.
pub(crate) fn recover_operation(
    operation: &mut Operation,
    policy: RecoveryPolicy,
    retry: &RetryPolicy,
    now: u64,
    report: &mut RecoveryReport,
) -> Result<()> {
    debug_assert_eq!(operation.status, OperationStatus::Running);
    match policy {
        RecoveryPolicy::Retain => report.resumed.push(operation.clone()),
        RecoveryPolicy::Requeue => match operation.requeue_interrupted(retry, now)? {
            Transition::Failed(_) => report.failed.push(operation.id),
            _ => report.requeued.push(operation.id),
        },
    }
    Ok(())
}
