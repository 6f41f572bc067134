//! Strongly-typed identifiers used across the queue.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Identifier assigned to a job when it is submitted to a queue.
///
/// Issued from a per-store monotonic counter starting at 1; never reused
/// within one store generation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobUuid(u64);

impl JobUuid {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for JobUuid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<u64> for JobUuid {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<JobUuid> for u64 {
    fn from(value: JobUuid) -> Self {
        value.0
    }
}

impl FromStr for JobUuid {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s
            .trim()
            .parse::<u64>()
            .map_err(|e| JobError::invalid_uuid(format!("{s:?}: {e}")))?;
        Ok(Self(value))
    }
}

/// Identity of a worker process: host name plus process id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub host: String,
    pub pid: u32,
}

impl WorkerIdentity {
    pub fn new(host: impl Into<String>, pid: u32) -> Self {
        Self {
            host: host.into(),
            pid,
        }
    }

    /// Identity of the current process.
    pub fn current() -> Self {
        Self::new(local_host_name(), std::process::id())
    }
}

impl core::fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.host, self.pid)
    }
}

/// Best-effort host name: `HOSTNAME`, then `/etc/hostname`, then `localhost`.
pub fn local_host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
