use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Inspect and administer a job queue database.
///
/// The database and environment come from `STEPQUEUE_*` variables.
#[derive(Parser, Debug)]
#[command(name = "stepqueue", about, long_about = None, version)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    /// Print lane sizes, counters and timing statistics.
    Stats,
    /// List every job record, grouped by lane.
    Jobs,
    /// Print one job record.
    Job {
        /// Numeric job uuid.
        uuid: String,
    },
    /// Submit a job described by a JSON file.
    Submit {
        path: PathBuf,
    },
    /// Requeue jobs held by workers that are no longer in touch.
    Reconcile,
    /// Drop every job and reset all counters.
    HardReset {
        /// Confirm the reset.
        #[arg(long)]
        yes: bool,
    },
}
