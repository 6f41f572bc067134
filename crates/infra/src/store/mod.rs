//! Durable storage behind the job queue.
//!
//! A store keeps two things: the [`QueueState`] (lanes, counters, statistics)
//! and one serialized [`Job`] record per uuid. Every queue operation runs as a
//! single [`QueueStore::transaction`]; a closure returning `Err` leaves the
//! store untouched.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use stepqueue_core::{Job, JobUuid};

use crate::queue::state::QueueState;

/// Store error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("job uuid {0} does not fit a sqlite key")]
    UuidOutOfRange(u64),
}

/// Transactional queue storage.
pub trait QueueStore: Send + Sync {
    /// Run `f` against a consistent view of the store, serialized with every
    /// other transaction on the same store. Changes are kept only if `f`
    /// returns `Ok`.
    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn Transaction) -> Result<T, E>,
        E: From<StoreError>;
}

/// View of the store inside one transaction.
pub trait Transaction {
    /// Queue state, loaded at transaction start and written back on commit.
    fn state(&mut self) -> &mut QueueState;

    fn load_job(&mut self, uuid: JobUuid) -> Result<Option<Job>, StoreError>;

    /// Insert or replace the record for `job.uuid`. Jobs without a uuid are ignored.
    fn save_job(&mut self, job: &Job) -> Result<(), StoreError>;

    fn delete_job(&mut self, uuid: JobUuid) -> Result<(), StoreError>;

    /// Drop every record and reset the state to its defaults.
    fn clear(&mut self) -> Result<(), StoreError>;
}
