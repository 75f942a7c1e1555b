use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};

use crate::error::LedgerError;
use crate::store::sqlite::open_connection;

use super::{RateLedger, StoredWindow};

/// Ledger kept in a SQLite file shared by every invocation on the host.
///
/// The lock is an immediate write transaction; `busy_timeout` bounds the wait.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
    name: String,
}

impl SqliteLedger {
    pub fn open(path: impl AsRef<Path>, name: impl Into<String>) -> Result<Self, LedgerError> {
        let conn = open_connection(path.as_ref())?;
        Self::from_connection(conn, name)
    }

    pub fn from_connection(conn: Connection, name: impl Into<String>) -> Result<Self, LedgerError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rate_window (
                name TEXT PRIMARY KEY,
                payload TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            name: name.into(),
        })
    }
}

fn is_busy(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}

impl RateLedger for SqliteLedger {
    fn transact(
        &self,
        timeout: Duration,
        f: &mut dyn FnMut(&mut Option<StoredWindow>),
    ) -> Result<(), LedgerError> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.busy_timeout(timeout)?;

        let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
            Ok(tx) => tx,
            Err(e) if is_busy(&e) => return Err(LedgerError::LockTimeout(timeout)),
            Err(e) => return Err(e.into()),
        };

        let payload: Option<String> = tx
            .query_row(
                "SELECT payload FROM rate_window WHERE name = ?1",
                params![self.name],
                |row| row.get(0),
            )
            .optional()?;
        let mut slot = match payload.map(|p| serde_json::from_str::<StoredWindow>(&p)) {
            Some(Ok(stored)) => Some(stored),
            Some(Err(err)) => {
                tracing::warn!(error = %err, "Discarding unreadable rate window");
                None
            }
            None => None,
        };

        f(&mut slot);

        match slot {
            Some(stored) => {
                let payload = serde_json::to_string(&stored)
                    .map_err(|e| LedgerError::Storage(e.to_string()))?;
                tx.execute(
                    "INSERT INTO rate_window (name, payload) VALUES (?1, ?2)
                     ON CONFLICT(name) DO UPDATE SET payload = excluded.payload",
                    params![self.name, payload],
                )?;
            }
            None => {
                tx.execute("DELETE FROM rate_window WHERE name = ?1", params![self.name])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}
