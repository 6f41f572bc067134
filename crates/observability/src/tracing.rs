//! Log output and the spans queue workers run under.

use ::tracing::{Span, info_span};
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "info";

/// Install the JSON subscriber, filtered by `RUST_LOG`.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with_default(DEFAULT_FILTER);
}

/// Same as [`init`], with a caller-chosen fallback filter (e.g. `"stepqueue=debug"`).
pub fn init_with_default(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // One JSON object per line; spans are flattened into each event so a
    // job's lines carry its uuid and the worker that ran it.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_thread_names(true)
        .with_target(false)
        .try_init();
}

/// Span covering a worker's driver loop.
pub fn worker_span(name: &str, host: &str, pid: u32) -> Span {
    info_span!("worker", name, host, pid)
}

/// Span covering one claimed job while it runs.
pub fn job_span(job_uuid: Option<u64>, ordered: bool) -> Span {
    let lane = if ordered { "ordered" } else { "unordered" };
    info_span!("job", job_uuid, lane)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_initialisation_is_harmless() {
        init();
        init_with_default("debug");
        ::tracing::info!(component = "observability", "subscriber installed");
    }

    #[test]
    fn job_spans_nest_under_the_worker() {
        ::tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            let worker = worker_span("test-worker", "box", 7);
            let _worker = worker.enter();
            let job = job_span(Some(3), false);
            let _job = job.enter();
            assert_eq!(Span::current().metadata().map(|m| m.name()), Some("job"));
            assert!(job.metadata().is_some_and(|m| m.fields().field("lane").is_some()));
        });
    }
}
