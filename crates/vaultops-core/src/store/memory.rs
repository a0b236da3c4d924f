use crate::{
    CancelEffect, ClaimOutcome, Completion, Error, Operation, OperationFilter, OperationStatus,
    OperationStore, Outcome, QueueStats, RecoveryPolicy, RecoveryReport, Result, RetryPolicy,
    SessionLimit, Target, store::recover_operation,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use vaultops::{OperationId, TargetId};

#[derive(Default)]
struct Inner {
    targets: HashMap<TargetId, Target>,
    operations: BTreeMap<OperationId, Operation>,
}

impl Inner {
    fn operation_mut(&mut self, id: OperationId) -> Result<&mut Operation> {
        self.operations
            .get_mut(&id)
            .ok_or(Error::OperationNotFound(id))
    }

    fn target_mut(&mut self, id: TargetId) -> Result<&mut Target> {
        self.targets.get_mut(&id).ok_or(Error::TargetNotFound(id))
    }

    fn has_capacity(&self, op: &Operation) -> bool {
        op.target_id
            .is_none_or(|t| self.targets.get(&t).is_some_and(Target::has_capacity))
    }
}

/// An in-process [`OperationStore`].
///
/// Everything lives behind one mutex, so every trait method is atomic with
/// respect to every other. State does not survive a restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OperationStore for MemoryStore {
    fn insert_target(&self, target: Target) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.targets.values().any(|t| t.name == target.name) {
            return Err(Error::validation(format!(
                "target `{}` already exists",
                target.name
            )));
        }
        inner.targets.insert(target.id, target);
        Ok(())
    }

    fn target(&self, id: TargetId) -> Result<Target> {
        self.inner
            .lock()
            .targets
            .get(&id)
            .cloned()
            .ok_or(Error::TargetNotFound(id))
    }

    fn targets(&self) -> Result<Vec<Target>> {
        let mut targets: Vec<_> = self.inner.lock().targets.values().cloned().collect();
        targets.sort_by_key(|t| t.id);
        Ok(targets)
    }

    fn find_target_by_name(&self, name: &str) -> Result<Option<Target>> {
        Ok(self
            .inner
            .lock()
            .targets
            .values()
            .find(|t| t.name == name)
            .cloned())
    }

    fn set_target_limit(&self, id: TargetId, limit: SessionLimit, now: u64) -> Result<Target> {
        let mut inner = self.inner.lock();
        let target = inner.target_mut(id)?;
        target.limit = limit;
        target.updated_at = now;
        Ok(target.clone())
    }

    fn insert_operation(&self, operation: Operation) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(target_id) = operation.target_id {
            if !inner.targets.contains_key(&target_id) {
                return Err(Error::TargetNotFound(target_id));
            }
        }
        inner.operations.insert(operation.id, operation);
        Ok(())
    }

    fn operation(&self, id: OperationId) -> Result<Operation> {
        self.inner
            .lock()
            .operations
            .get(&id)
            .cloned()
            .ok_or(Error::OperationNotFound(id))
    }

    fn operations(&self, filter: OperationFilter) -> Result<Vec<Operation>> {
        Ok(self
            .inner
            .lock()
            .operations
            .values()
            .filter(|op| filter.matches(op))
            .cloned()
            .collect())
    }

    fn promote_due_retries(&self, now: u64) -> Result<usize> {
        let mut inner = self.inner.lock();
        Ok(inner
            .operations
            .values_mut()
            .filter(|op| op.status == OperationStatus::Retrying)
            .map(|op| op.promote_if_due(now))
            .filter(|&moved| moved)
            .count())
    }

    fn dispatchable(&self, now: u64, limit: usize) -> Result<Vec<Operation>> {
        let inner = self.inner.lock();
        let mut candidates: Vec<_> = inner
            .operations
            .values()
            .filter(|op| op.is_dispatchable(now) && inner.has_capacity(op))
            .collect();
        candidates.sort_by_key(|op| op.dispatch_key());
        Ok(candidates.into_iter().take(limit).cloned().collect())
    }

    fn claim(&self, id: OperationId, now: u64) -> Result<ClaimOutcome> {
        let mut inner = self.inner.lock();
        let op = inner.operation_mut(id)?;
        if !op.is_dispatchable(now) {
            return Ok(ClaimOutcome::NotDispatchable);
        }
        let target_id = op.target_id;
        let target = match target_id {
            Some(target_id) => {
                let target = inner.target_mut(target_id)?;
                if !target.try_acquire() {
                    return Ok(ClaimOutcome::NoCapacity);
                }
                target.updated_at = now;
                Some(target.clone())
            }
            None => None,
        };
        let op = inner.operation_mut(id)?;
        op.begin_attempt(now)?;
        Ok(ClaimOutcome::Claimed {
            operation: op.clone(),
            target,
        })
    }

    fn complete(
        &self,
        id: OperationId,
        outcome: Outcome,
        policy: &RetryPolicy,
        now: u64,
    ) -> Result<Completion> {
        let mut inner = self.inner.lock();
        let op = inner.operation_mut(id)?;
        let transition = op.apply_outcome(outcome, policy, now)?;
        let operation = op.clone();
        if let Some(target_id) = operation.target_id {
            let target = inner.target_mut(target_id)?;
            target.release();
            target.updated_at = now;
        }
        Ok(Completion {
            operation,
            transition,
        })
    }

    fn release(&self, id: OperationId, policy: &RetryPolicy, now: u64) -> Result<Completion> {
        let mut inner = self.inner.lock();
        let op = inner.operation_mut(id)?;
        let transition = op.requeue_unrecorded(policy, now)?;
        let operation = op.clone();
        if let Some(target_id) = operation.target_id {
            let target = inner.target_mut(target_id)?;
            target.release();
            target.updated_at = now;
        }
        Ok(Completion {
            operation,
            transition,
        })
    }

    fn cancel(&self, id: OperationId, now: u64) -> Result<CancelEffect> {
        Ok(self.inner.lock().operation_mut(id)?.cancel(now)?)
    }

    fn recover(
        &self,
        policy: RecoveryPolicy,
        retry: &RetryPolicy,
        now: u64,
    ) -> Result<RecoveryReport> {
        let mut inner = self.inner.lock();
        let mut report = RecoveryReport::default();
        let mut running: HashMap<TargetId, u32> = HashMap::new();

        for op in inner.operations.values_mut() {
            if op.status != OperationStatus::Running {
                continue;
            }
            recover_operation(op, policy, retry, now, &mut report)?;
            if let (OperationStatus::Running, Some(target_id)) = (op.status, op.target_id) {
                *running.entry(target_id).or_default() += 1;
            }
        }

        for target in inner.targets.values_mut() {
            let actual = running.get(&target.id).copied().unwrap_or(0);
            if target.in_flight != actual {
                target.in_flight = actual;
                target.updated_at = now;
                report.reconciled_targets += 1;
            }
        }
        Ok(report)
    }

    fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        for op in self.inner.lock().operations.values() {
            stats.record(op.status);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::store::tests::store_behaviour_tests!(MemoryStore::new());
}
