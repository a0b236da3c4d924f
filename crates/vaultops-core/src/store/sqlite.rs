use crate::{
    CancelEffect, ClaimOutcome, Completion, Error, FailureReason, Operation, OperationFilter,
    OperationKind, OperationStatus, OperationStore, Outcome, Priority, QueueStats, RecoveryPolicy,
    RecoveryReport, Result, RetryPolicy, SessionLimit, Target, store::recover_operation,
};
use core::str::FromStr;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params, types::Type};
use std::{path::Path, time::Duration};
use vaultops::{OperationId, TargetId};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS targets (
    id           TEXT PRIMARY KEY,
    name         TEXT NOT NULL UNIQUE,
    endpoint     TEXT NOT NULL,
    max_sessions INTEGER,
    in_flight    INTEGER NOT NULL DEFAULT 0,
    created_at   INTEGER NOT NULL,
    updated_at   INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS operations (
    id               TEXT PRIMARY KEY,
    kind             TEXT NOT NULL,
    priority         INTEGER NOT NULL,
    target_id        TEXT REFERENCES targets(id),
    payload          TEXT NOT NULL,
    status           TEXT NOT NULL,
    attempt_count    INTEGER NOT NULL DEFAULT 0,
    created_at       INTEGER NOT NULL,
    updated_at       INTEGER NOT NULL,
    not_before       INTEGER,
    last_error       TEXT,
    failure          TEXT,
    cancel_requested INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS operations_dispatch
    ON operations (status, priority DESC, created_at, id);
";

const TARGET_COLUMNS: &str = "id, name, endpoint, max_sessions, in_flight, created_at, updated_at";

const OPERATION_COLUMNS: &str = "id, kind, priority, target_id, payload, status, attempt_count, \
     created_at, updated_at, not_before, last_error, failure, cancel_requested";

/// A durable [`OperationStore`] backed by a single SQLite database.
///
/// The connection sits behind one mutex. Claim, complete, cancel and recover
/// each run inside one transaction, so a crash leaves either the old or the
/// new state of both the operation and its target.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened or the schema cannot be applied.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::storage(format!("create directory {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::storage(format!("open sqlite db {}: {e}", path.display())))?;
        #[cfg(feature = "tracing")]
        tracing::debug!("Opened operation store at {}", path.display());
        Self::init(conn)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// SQLite integers are signed; timestamps and counters never approach the
/// sign bit.
fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    row.get::<_, String>(idx)?
        .parse()
        .map_err(|e| conversion_error(idx, e))
}

fn target_from_row(row: &Row<'_>) -> rusqlite::Result<Target> {
    let max: Option<i64> = row.get(3)?;
    let limit = match max {
        Some(n) => SessionLimit::bounded(u32::try_from(n).unwrap_or(0))
            .map_err(|e| conversion_error(3, e))?,
        None => SessionLimit::Unlimited,
    };
    Ok(Target {
        id: parse_col(row, 0)?,
        name: row.get(1)?,
        endpoint: row.get(2)?,
        limit,
        in_flight: row.get(4)?,
        created_at: from_sql_int(row.get(5)?),
        updated_at: from_sql_int(row.get(6)?),
    })
}

fn operation_from_row(row: &Row<'_>) -> rusqlite::Result<Operation> {
    let priority: u8 = row.get(2)?;
    let payload: String = row.get(4)?;
    let failure: Option<String> = row.get(11)?;
    Ok(Operation {
        id: parse_col(row, 0)?,
        kind: parse_col::<OperationKind>(row, 1)?,
        priority: Priority::from_rank(priority)
            .ok_or_else(|| conversion_error(2, Error::storage(format!("priority rank {priority}"))))?,
        target_id: row
            .get::<_, Option<String>>(3)?
            .map(|s| s.parse::<TargetId>())
            .transpose()
            .map_err(|e| conversion_error(3, e))?,
        payload: serde_json::from_str(&payload).map_err(|e| conversion_error(4, e))?,
        status: parse_col::<OperationStatus>(row, 5)?,
        attempt_count: row.get(6)?,
        created_at: from_sql_int(row.get(7)?),
        updated_at: from_sql_int(row.get(8)?),
        not_before: row.get::<_, Option<i64>>(9)?.map(from_sql_int),
        last_error: row.get(10)?,
        failure: failure.as_deref().and_then(FailureReason::from_key),
        cancel_requested: row.get(12)?,
    })
}

fn load_operation(tx: &Transaction<'_>, id: OperationId) -> Result<Operation> {
    tx.query_row(
        &format!("SELECT {OPERATION_COLUMNS} FROM operations WHERE id = ?1"),
        [id.to_string()],
        operation_from_row,
    )
    .optional()?
    .ok_or(Error::OperationNotFound(id))
}

fn load_target(conn: &Connection, id: TargetId) -> Result<Target> {
    conn.query_row(
        &format!("SELECT {TARGET_COLUMNS} FROM targets WHERE id = ?1"),
        [id.to_string()],
        target_from_row,
    )
    .optional()?
    .ok_or(Error::TargetNotFound(id))
}

/// Writes every mutable column of `op` back to its row.
fn save_operation(tx: &Transaction<'_>, op: &Operation) -> Result<()> {
    tx.execute(
        "UPDATE operations
            SET status = ?2, attempt_count = ?3, updated_at = ?4, not_before = ?5,
                last_error = ?6, failure = ?7, cancel_requested = ?8
          WHERE id = ?1",
        params![
            op.id.to_string(),
            op.status.as_str(),
            op.attempt_count,
            to_sql_int(op.updated_at),
            op.not_before.map(to_sql_int),
            op.last_error,
            op.failure.map(FailureReason::as_key),
            op.cancel_requested,
        ],
    )?;
    Ok(())
}

fn save_in_flight(tx: &Transaction<'_>, id: TargetId, in_flight: u32, now: u64) -> Result<()> {
    tx.execute(
        "UPDATE targets SET in_flight = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.to_string(), in_flight, to_sql_int(now)],
    )?;
    Ok(())
}

fn collect<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Result<Vec<T>> {
    rows.map(|r| r.map_err(Error::from)).collect()
}

impl OperationStore for SqliteStore {
    fn insert_target(&self, target: Target) -> Result<()> {
        let conn = self.conn.lock();
        let taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM targets WHERE name = ?1)",
            [&target.name],
            |row| row.get(0),
        )?;
        if taken {
            return Err(Error::validation(format!(
                "target `{}` already exists",
                target.name
            )));
        }
        conn.execute(
            &format!("INSERT INTO targets ({TARGET_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                target.id.to_string(),
                target.name,
                target.endpoint,
                target.limit.max(),
                target.in_flight,
                to_sql_int(target.created_at),
                to_sql_int(target.updated_at),
            ],
        )?;
        Ok(())
    }

    fn target(&self, id: TargetId) -> Result<Target> {
        load_target(&self.conn.lock(), id)
    }

    fn targets(&self) -> Result<Vec<Target>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {TARGET_COLUMNS} FROM targets ORDER BY id"))?;
        let rows = stmt.query_map([], target_from_row)?;
        collect(rows)
    }

    fn find_target_by_name(&self, name: &str) -> Result<Option<Target>> {
        Ok(self
            .conn
            .lock()
            .query_row(
                &format!("SELECT {TARGET_COLUMNS} FROM targets WHERE name = ?1"),
                [name],
                target_from_row,
            )
            .optional()?)
    }

    fn set_target_limit(&self, id: TargetId, limit: SessionLimit, now: u64) -> Result<Target> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE targets SET max_sessions = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), limit.max(), to_sql_int(now)],
        )?;
        if changed == 0 {
            return Err(Error::TargetNotFound(id));
        }
        load_target(&conn, id)
    }

    fn insert_operation(&self, op: Operation) -> Result<()> {
        let conn = self.conn.lock();
        if let Some(target_id) = op.target_id {
            load_target(&conn, target_id)?;
        }
        conn.execute(
            &format!(
                "INSERT INTO operations ({OPERATION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                op.id.to_string(),
                op.kind.as_str(),
                op.priority.rank(),
                op.target_id.map(|t| t.to_string()),
                serde_json::to_string(&op.payload)?,
                op.status.as_str(),
                op.attempt_count,
                to_sql_int(op.created_at),
                to_sql_int(op.updated_at),
                op.not_before.map(to_sql_int),
                op.last_error,
                op.failure.map(FailureReason::as_key),
                op.cancel_requested,
            ],
        )?;
        Ok(())
    }

    fn operation(&self, id: OperationId) -> Result<Operation> {
        self.conn
            .lock()
            .query_row(
                &format!("SELECT {OPERATION_COLUMNS} FROM operations WHERE id = ?1"),
                [id.to_string()],
                operation_from_row,
            )
            .optional()?
            .ok_or(Error::OperationNotFound(id))
    }

    fn operations(&self, filter: OperationFilter) -> Result<Vec<Operation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {OPERATION_COLUMNS} FROM operations
              WHERE (?1 IS NULL OR status = ?1)
                AND (?2 IS NULL OR target_id = ?2)
              ORDER BY id"
        ))?;
        let rows = stmt.query_map(
            params![
                filter.status.map(OperationStatus::as_str),
                filter.target_id.map(|t| t.to_string()),
            ],
            operation_from_row,
        )?;
        collect(rows)
    }

    fn promote_due_retries(&self, now: u64) -> Result<usize> {
        let changed = self.conn.lock().execute(
            "UPDATE operations
                SET status = 'pending', not_before = NULL, updated_at = ?1
              WHERE status = 'retrying' AND (not_before IS NULL OR not_before <= ?1)",
            [to_sql_int(now)],
        )?;
        Ok(changed)
    }

    fn dispatchable(&self, now: u64, limit: usize) -> Result<Vec<Operation>> {
        let conn = self.conn.lock();
        let columns = OPERATION_COLUMNS
            .split(", ")
            .map(|c| format!("o.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT {columns} FROM operations o
               LEFT JOIN targets t ON t.id = o.target_id
              WHERE o.status = 'pending'
                AND (o.not_before IS NULL OR o.not_before <= ?1)
                AND (o.target_id IS NULL OR t.max_sessions IS NULL OR t.in_flight < t.max_sessions)
              ORDER BY o.priority DESC, o.created_at ASC, o.id ASC
              LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            params![to_sql_int(now), i64::try_from(limit).unwrap_or(i64::MAX)],
            operation_from_row,
        )?;
        collect(rows)
    }

    fn claim(&self, id: OperationId, now: u64) -> Result<ClaimOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut op = load_operation(&tx, id)?;
        if !op.is_dispatchable(now) {
            return Ok(ClaimOutcome::NotDispatchable);
        }
        let target = match op.target_id {
            Some(target_id) => {
                let mut target = load_target(&tx, target_id)?;
                if !target.try_acquire() {
                    return Ok(ClaimOutcome::NoCapacity);
                }
                target.updated_at = now;
                save_in_flight(&tx, target.id, target.in_flight, now)?;
                Some(target)
            }
            None => None,
        };
        op.begin_attempt(now)?;
        save_operation(&tx, &op)?;
        tx.commit()?;
        Ok(ClaimOutcome::Claimed {
            operation: op,
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
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut op = load_operation(&tx, id)?;
        let transition = op.apply_outcome(outcome, policy, now)?;
        save_operation(&tx, &op)?;
        if let Some(target_id) = op.target_id {
            let mut target = load_target(&tx, target_id)?;
            target.release();
            save_in_flight(&tx, target.id, target.in_flight, now)?;
        }
        tx.commit()?;
        Ok(Completion {
            operation: op,
            transition,
        })
    }

    fn release(&self, id: OperationId, policy: &RetryPolicy, now: u64) -> Result<Completion> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut op = load_operation(&tx, id)?;
        let transition = op.requeue_unrecorded(policy, now)?;
        save_operation(&tx, &op)?;
        if let Some(target_id) = op.target_id {
            let mut target = load_target(&tx, target_id)?;
            target.release();
            save_in_flight(&tx, target.id, target.in_flight, now)?;
        }
        tx.commit()?;
        Ok(Completion {
            operation: op,
            transition,
        })
    }

    fn cancel(&self, id: OperationId, now: u64) -> Result<CancelEffect> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut op = load_operation(&tx, id)?;
        let effect = op.cancel(now)?;
        save_operation(&tx, &op)?;
        tx.commit()?;
        Ok(effect)
    }

    fn recover(
        &self,
        policy: RecoveryPolicy,
        retry: &RetryPolicy,
        now: u64,
    ) -> Result<RecoveryReport> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut report = RecoveryReport::default();

        let running = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {OPERATION_COLUMNS} FROM operations WHERE status = 'running' ORDER BY id"
            ))?;
            let rows = stmt.query_map([], operation_from_row)?;
            collect(rows)?
        };
        for mut op in running {
            recover_operation(&mut op, policy, retry, now, &mut report)?;
            if op.status != OperationStatus::Running {
                save_operation(&tx, &op)?;
            }
        }

        report.reconciled_targets = tx.execute(
            "UPDATE targets
                SET in_flight = (SELECT COUNT(*) FROM operations o
                                  WHERE o.target_id = targets.id AND o.status = 'running'),
                    updated_at = ?1
              WHERE in_flight <> (SELECT COUNT(*) FROM operations o
                                   WHERE o.target_id = targets.id AND o.status = 'running')",
            [to_sql_int(now)],
        )?;
        tx.commit()?;
        #[cfg(feature = "tracing")]
        if report.reconciled_targets > 0 {
            tracing::warn!(
                targets = report.reconciled_targets,
                "Reconciled drifted in-flight counters"
            );
        }
        Ok(report)
    }

    fn stats(&self) -> Result<QueueStats> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM operations GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((parse_col::<OperationStatus>(row, 0)?, row.get::<_, i64>(1)?))
        })?;
        let mut stats = QueueStats::default();
        for (status, count) in collect(rows)? {
            stats.add(status, from_sql_int(count));
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Backoff, NewOperation, NewTarget};
    use serde_json::json;
    use vaultops::{IdGenerator, MonotonicClock};

    crate::store::tests::store_behaviour_tests!(SqliteStore::open_in_memory().unwrap());

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("vaultops.db");
        let ids = IdGenerator::new(MonotonicClock::default());
        let target_id = ids.target_id();
        let op_id = ids.operation_id();

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .insert_target(
                    Target::new(
                        target_id,
                        NewTarget::new("vault-a", "https://vault-a.internal")
                            .with_concurrent_sessions(true),
                        1,
                    )
                    .unwrap(),
                )
                .unwrap();
            let request = NewOperation::new(
                OperationKind::ProvisionResource,
                target_id,
                json!({"resource_name": "payroll"}),
            )
            .with_priority(Priority::High);
            store.insert_operation(Operation::new(op_id, request, 2)).unwrap();
            assert!(matches!(store.claim(op_id, 3).unwrap(), ClaimOutcome::Claimed { .. }));
        }

        let store = SqliteStore::open(&path).unwrap();
        let op = store.operation(op_id).unwrap();
        assert_eq!(op.status, OperationStatus::Running);
        assert_eq!(op.priority, Priority::High);
        assert_eq!(op.payload, json!({"resource_name": "payroll"}));
        let target = store.target(target_id).unwrap();
        assert_eq!(target.limit, SessionLimit::Unlimited);
        assert_eq!(target.in_flight, 1);

        let retry = RetryPolicy::new(3, Backoff::default());
        let report = store.recover(RecoveryPolicy::Requeue, &retry, 10).unwrap();
        assert_eq!(report.requeued, [op_id]);
        assert_eq!(report.reconciled_targets, 1);
        assert_eq!(store.target(target_id).unwrap().in_flight, 0);
    }

    #[test]
    fn reconciles_drifted_counter() {
        let store = SqliteStore::open_in_memory().unwrap();
        let ids = IdGenerator::new(MonotonicClock::default());
        let target_id = ids.target_id();
        let mut target =
            Target::new(target_id, NewTarget::new("vault-a", "https://a").with_max_sessions(3), 0)
                .unwrap();
        target.in_flight = 2;
        store.insert_target(target).unwrap();

        let report = store
            .recover(RecoveryPolicy::Retain, &RetryPolicy::default(), 5)
            .unwrap();
        assert_eq!(report.reconciled_targets, 1);
        assert_eq!(store.target(target_id).unwrap().in_flight, 0);
    }
}
