use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::error::StoreError;
use crate::task::{
    Claim, NewTask, StatusCounts, Task, TaskStatus, STATUS_DONE, STATUS_IN_PROGRESS, STATUS_PENDING,
};

use super::{check_transition, check_unique_keys, TaskStore};

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Open (or create) a database file in WAL mode with a busy timeout. The
/// parent directory must exist.
pub fn open_connection(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    Ok(conn)
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    job TEXT NOT NULL,
    seq INTEGER NOT NULL,
    task_key TEXT NOT NULL,
    task_data TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT '',
    result TEXT,
    claimed_by TEXT,
    claimed_at INTEGER,
    PRIMARY KEY (job, task_key)
);
CREATE INDEX IF NOT EXISTS tasks_job_seq ON tasks (job, seq);
CREATE TABLE IF NOT EXISTS scratch (
    job TEXT NOT NULL,
    name TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (job, name)
);
";

const TASK_COLUMNS: &str = "task_key, task_data, status, result, claimed_by, claimed_at";

/// Task store backed by a SQLite file. Several jobs can share one file; every
/// query is scoped to `job`.
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
    job: String,
}

impl SqliteTaskStore {
    pub fn open(path: impl AsRef<Path>, job: impl Into<String>) -> Result<Self, StoreError> {
        Self::from_connection(open_connection(path.as_ref())?, job)
    }

    pub fn in_memory(job: impl Into<String>) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, job)
    }

    pub fn from_connection(conn: Connection, job: impl Into<String>) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            job: job.into(),
        })
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_status(conn: &Connection, job: &str, key: &str) -> Result<TaskStatus, StoreError> {
        conn.query_row(
            "SELECT status FROM tasks WHERE job = ?1 AND task_key = ?2",
            params![job, key],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .map(|cell| TaskStatus::from_cell(&cell))
        .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }
}

type TaskRow = (String, String, String, Option<String>, Option<String>, Option<i64>);

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode_task((key, data, status, result, claimed_by, claimed_at): TaskRow) -> Result<Task, StoreError> {
    let claim = match (claimed_by, claimed_at) {
        (Some(run_id), Some(at)) => Some(Claim::new(run_id, at)),
        _ => None,
    };
    Ok(Task {
        key,
        payload: serde_json::from_str(&data)?,
        status: TaskStatus::from_cell(&status),
        result: result.map(|r| serde_json::from_str(&r)).transpose()?,
        claim,
    })
}

impl TaskStore for SqliteTaskStore {
    fn create_all(&self, tasks: Vec<NewTask>) -> Result<usize, StoreError> {
        check_unique_keys(&tasks)?;
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM tasks WHERE job = ?1", params![self.job])?;
        tx.execute("DELETE FROM scratch WHERE job = ?1", params![self.job])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO tasks (job, seq, task_key, task_data, status) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (seq, task) in tasks.iter().enumerate() {
                let data = serde_json::to_string(&task.payload)?;
                insert.execute(params![self.job, seq as i64, task.key, data, STATUS_PENDING])?;
            }
        }
        tx.commit()?;
        Ok(tasks.len())
    }

    fn list_all(&self) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE job = ?1 ORDER BY seq"
        ))?;
        let rows = stmt
            .query_map(params![self.job], task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(decode_task).collect()
    }

    fn list_pending(&self) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE job = ?1 AND status IN (?2, ?3) ORDER BY seq"
        ))?;
        let rows = stmt
            .query_map(params![self.job, STATUS_PENDING, STATUS_IN_PROGRESS], task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(decode_task).collect()
    }

    fn get(&self, key: &str) -> Result<Task, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE job = ?1 AND task_key = ?2"),
                params![self.job, key],
                task_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        decode_task(row)
    }

    fn claim(&self, key: &str, claim: &Claim, lease: Duration) -> Result<bool, StoreError> {
        let conn = self.conn();
        let expired_before = claim.claimed_at_ms - lease.as_millis() as i64;
        let updated = conn.execute(
            "UPDATE tasks SET status = ?1, claimed_by = ?2, claimed_at = ?3
             WHERE job = ?4 AND task_key = ?5
               AND (status = ?6
                    OR (status = ?1 AND (claimed_by IS NULL OR claimed_by = ?2 OR claimed_at <= ?7)))",
            params![
                STATUS_IN_PROGRESS,
                claim.run_id,
                claim.claimed_at_ms,
                self.job,
                key,
                STATUS_PENDING,
                expired_before
            ],
        )?;
        if updated == 1 {
            return Ok(true);
        }
        // Distinguish "held elsewhere" from "no such task".
        Self::current_status(&conn, &self.job, key)?;
        Ok(false)
    }

    fn release(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        Self::current_status(&conn, &self.job, key)?;
        conn.execute(
            "UPDATE tasks SET claimed_by = NULL, claimed_at = NULL
             WHERE job = ?1 AND task_key = ?2 AND status = ?3",
            params![self.job, key, STATUS_IN_PROGRESS],
        )?;
        Ok(())
    }

    fn set_status(&self, key: &str, status: TaskStatus) -> Result<(), StoreError> {
        let conn = self.conn();
        let current = Self::current_status(&conn, &self.job, key)?;
        check_transition(key, &current, &status)?;
        conn.execute(
            "UPDATE tasks SET status = ?1 WHERE job = ?2 AND task_key = ?3",
            params![status.to_cell(), self.job, key],
        )?;
        Ok(())
    }

    fn write_result(&self, key: &str, result: &Value) -> Result<(), StoreError> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE tasks SET result = ?1 WHERE job = ?2 AND task_key = ?3",
            params![serde_json::to_string(result)?, self.job, key],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(())
    }

    fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks WHERE job = ?1 GROUP BY status")?;
        let rows = stmt
            .query_map(params![self.job], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut counts = StatusCounts::default();
        for (cell, n) in rows {
            let kind = TaskStatus::from_cell(&cell).kind();
            for _ in 0..n {
                counts.add(kind);
            }
        }
        Ok(counts)
    }

    fn read_scratch(&self, name: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                "SELECT value FROM scratch WHERE job = ?1 AND name = ?2",
                params![self.job, name],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn write_scratch(&self, name: &str, value: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO scratch (job, name, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(job, name) DO UPDATE SET value = excluded.value",
            params![self.job, name, value],
        )?;
        Ok(())
    }

    fn clear_scratch(&self, name: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "DELETE FROM scratch WHERE job = ?1 AND name = ?2",
            params![self.job, name],
        )?;
        Ok(())
    }

    fn rearm_failed(&self) -> Result<usize, StoreError> {
        let updated = self.conn().execute(
            "UPDATE tasks SET status = ?1, result = NULL, claimed_by = NULL, claimed_at = NULL
             WHERE job = ?2 AND status NOT IN (?1, ?3, ?4)",
            params![STATUS_PENDING, self.job, STATUS_IN_PROGRESS, STATUS_DONE],
        )?;
        Ok(updated)
    }

    fn discard(&self) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM tasks WHERE job = ?1", params![self.job])?;
        tx.execute("DELETE FROM scratch WHERE job = ?1", params![self.job])?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::conformance;
    use crate::task::STATUS_FAILED_PREFIX;

    fn store() -> SqliteTaskStore {
        SqliteTaskStore::in_memory("categories").unwrap()
    }

    #[test]
    fn test_create_and_list() {
        conformance::create_and_list(&store());
    }

    #[test]
    fn test_lifecycle() {
        conformance::lifecycle(&store());
    }

    #[test]
    fn test_claims() {
        conformance::claims(&store());
    }

    #[test]
    fn test_scratch() {
        conformance::scratch(&store());
    }

    #[test]
    fn test_failed_cell_is_human_readable() {
        let store = store();
        store.create_all(vec![NewTask::new("t1", json!(null))]).unwrap();
        store.claim("t1", &Claim::new("r", 0), Duration::from_secs(1)).unwrap();
        store.set_status("t1", TaskStatus::failed("quota exceeded")).unwrap();

        let cell: String = store
            .conn()
            .query_row("SELECT status FROM tasks WHERE task_key = 't1'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(cell, format!("{STATUS_FAILED_PREFIX}: quota exceeded"));
    }

    #[test]
    fn test_jobs_share_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.db");

        let first = SqliteTaskStore::open(&path, "feedback").unwrap();
        let second = SqliteTaskStore::open(&path, "images").unwrap();
        first.create_all(vec![NewTask::new("a", json!(1))]).unwrap();
        second
            .create_all(vec![NewTask::new("a", json!(2)), NewTask::new("b", json!(3))])
            .unwrap();

        assert_eq!(first.list_all().unwrap().len(), 1);
        assert_eq!(second.list_all().unwrap().len(), 2);

        second.discard().unwrap();
        drop(first);
        let reopened = SqliteTaskStore::open(&path, "feedback").unwrap();
        assert_eq!(reopened.get("a").unwrap().payload, json!(1));
    }
}
