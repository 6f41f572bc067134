//! SQLite-backed store: the durable default.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde_json::{Map, Value};
use tracing::debug;

use stepqueue_core::{Job, JobUuid};

use super::{QueueStore, StoreError, Transaction};
use crate::queue::state::QueueState;

const SCHEMA: &str = r#"
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=FULL;

    CREATE TABLE IF NOT EXISTS queue_meta (
      key TEXT PRIMARY KEY,
      value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS queue_jobs (
      uuid INTEGER PRIMARY KEY,
      record TEXT NOT NULL
    );
"#;

/// [`QueueStore`] persisted in a single SQLite file.
///
/// Queue state lives in `queue_meta`, one JSON value per key; job records
/// live in `queue_jobs`. Transactions are `BEGIN IMMEDIATE`, so processes
/// sharing the file are serialized by SQLite's write lock.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "opened queue store");

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    /// Private database that disappears with the store.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn load_state(conn: &Connection) -> Result<QueueState, StoreError> {
    let mut stmt = conn.prepare("SELECT key, value FROM queue_meta")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

    let mut fields = Map::new();
    for row in rows {
        let (key, value) = row?;
        fields.insert(key, serde_json::from_str(&value)?);
    }
    Ok(serde_json::from_value(Value::Object(fields))?)
}

fn save_state(conn: &Connection, state: &QueueState) -> Result<(), StoreError> {
    let Value::Object(fields) = serde_json::to_value(state)? else {
        return Ok(());
    };
    let mut stmt = conn.prepare("INSERT OR REPLACE INTO queue_meta (key, value) VALUES (?1, ?2)")?;
    for (key, value) in fields {
        stmt.execute(params![key, value.to_string()])?;
    }
    Ok(())
}

fn row_key(uuid: JobUuid) -> Result<i64, StoreError> {
    i64::try_from(uuid.get()).map_err(|_| StoreError::UuidOutOfRange(uuid.get()))
}

struct SqliteTransaction<'a> {
    conn: &'a Connection,
    state: QueueState,
}

impl Transaction for SqliteTransaction<'_> {
    fn state(&mut self) -> &mut QueueState {
        &mut self.state
    }

    fn load_job(&mut self, uuid: JobUuid) -> Result<Option<Job>, StoreError> {
        let record: Option<String> = self
            .conn
            .query_row(
                "SELECT record FROM queue_jobs WHERE uuid = ?1",
                params![row_key(uuid)?],
                |row| row.get(0),
            )
            .optional()?;
        record
            .map(|record| serde_json::from_str(&record))
            .transpose()
            .map_err(StoreError::from)
    }

    fn save_job(&mut self, job: &Job) -> Result<(), StoreError> {
        let Some(uuid) = job.uuid else {
            return Ok(());
        };
        let record = serde_json::to_string(job)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO queue_jobs (uuid, record) VALUES (?1, ?2)",
            params![row_key(uuid)?, record],
        )?;
        Ok(())
    }

    fn delete_job(&mut self, uuid: JobUuid) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM queue_jobs WHERE uuid = ?1", params![row_key(uuid)?])?;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        self.conn
            .execute_batch("DELETE FROM queue_jobs; DELETE FROM queue_meta;")?;
        self.state = QueueState::default();
        Ok(())
    }
}

impl QueueStore for SqliteStore {
    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn Transaction) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;

        let loaded = load_state(&tx)?;
        let mut view = SqliteTransaction {
            conn: &tx,
            state: loaded.clone(),
        };
        // Dropping `tx` on the error path rolls everything back.
        let value = f(&mut view)?;

        // Reads leave `queue_meta` alone.
        if view.state != loaded {
            save_state(&tx, &view.state)?;
        }
        tx.commit().map_err(StoreError::from)?;
        Ok(value)
    }
}
