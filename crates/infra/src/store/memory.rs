//! In-memory store for tests and single-process use.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use stepqueue_core::{Job, JobUuid};

use super::{QueueStore, StoreError, Transaction};
use crate::queue::state::QueueState;

#[derive(Debug, Default)]
struct Inner {
    state: QueueState,
    jobs: BTreeMap<JobUuid, Job>,
}

/// In-memory [`QueueStore`]. Not durable across processes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

/// Pending changes, applied to `Inner` only on commit.
struct MemoryTransaction<'a> {
    committed: &'a Inner,
    state: QueueState,
    writes: BTreeMap<JobUuid, Option<Job>>,
    cleared: bool,
}

impl Transaction for MemoryTransaction<'_> {
    fn state(&mut self) -> &mut QueueState {
        &mut self.state
    }

    fn load_job(&mut self, uuid: JobUuid) -> Result<Option<Job>, StoreError> {
        if let Some(write) = self.writes.get(&uuid) {
            return Ok(write.clone());
        }
        if self.cleared {
            return Ok(None);
        }
        Ok(self.committed.jobs.get(&uuid).cloned())
    }

    fn save_job(&mut self, job: &Job) -> Result<(), StoreError> {
        if let Some(uuid) = job.uuid {
            self.writes.insert(uuid, Some(job.clone()));
        }
        Ok(())
    }

    fn delete_job(&mut self, uuid: JobUuid) -> Result<(), StoreError> {
        self.writes.insert(uuid, None);
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        self.state = QueueState::default();
        self.writes.clear();
        self.cleared = true;
        Ok(())
    }
}

impl QueueStore for MemoryStore {
    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn Transaction) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;

        let mut tx = MemoryTransaction {
            committed: &*inner,
            state: inner.state.clone(),
            writes: BTreeMap::new(),
            cleared: false,
        };
        let value = f(&mut tx)?;

        let MemoryTransaction {
            state, writes, cleared, ..
        } = tx;
        if cleared {
            inner.jobs.clear();
        }
        for (uuid, write) in writes {
            match write {
                Some(job) => inner.jobs.insert(uuid, job),
                None => inner.jobs.remove(&uuid),
            };
        }
        inner.state = state;

        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn honors_the_store_contract() {
        crate::store::contract::run_all(MemoryStore::new);
    }
}
