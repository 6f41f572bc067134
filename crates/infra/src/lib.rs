//! Infrastructure layer: persistent queue, stores, worker, configuration.

pub mod config;
pub mod queue;
pub mod store;
pub mod worker;

pub use config::QueueConfig;
pub use queue::{Enqueued, JobListing, JobQueue, Lane, QueueError, QueueState, QueueStats, WorkerContact};
pub use store::{MemoryStore, QueueStore, SqliteStore, StoreError, Transaction};
pub use worker::{Worker, WorkerConfig, WorkerHandle, WorkerStats};
