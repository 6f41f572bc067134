//! Admin tool for a job queue database.
//!
//! Reads `STEPQUEUE_*` configuration from the environment and prints JSON.

mod args;

use anyhow::{Context, bail};
use clap::Parser;
use serde_json::json;

use stepqueue_core::{Job, JobSpec};
use stepqueue_infra::{JobQueue, QueueConfig, SqliteStore};

use crate::args::{Cli, Command};

fn run(command: Command, queue: &JobQueue<SqliteStore>) -> anyhow::Result<serde_json::Value> {
    let output = match command {
        Command::Stats => serde_json::to_value(queue.stats()?)?,
        Command::Jobs => serde_json::to_value(queue.jobs()?)?,
        Command::Job { uuid } => match queue.job_by_str(&uuid)? {
            Some(job) => serde_json::to_value(job)?,
            None => bail!("no job with uuid {uuid}"),
        },
        Command::Submit { path } => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let spec: JobSpec = serde_json::from_str(&text)
                .with_context(|| format!("{} is not a valid job spec", path.display()))?;
            let mut job = Job::try_from(spec)?;
            let uuid = queue.submit(&mut job)?;
            json!({ "submitted": uuid })
        }
        Command::Reconcile => json!({ "requeued": queue.reconcile_abandoned()? }),
        Command::HardReset { yes: false } => bail!("hard-reset drops every job; pass --yes to confirm"),
        Command::HardReset { yes: true } => {
            queue.hard_reset()?;
            json!({ "reset": true })
        }
    };
    Ok(output)
}

fn main() -> anyhow::Result<()> {
    stepqueue_observability::init();

    let command = Cli::parse().command;

    let config = QueueConfig::from_env()?;
    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("failed to open queue database {}", config.db_path.display()))?;
    tracing::debug!(db_path = %config.db_path.display(), ?command, "running admin command");
    let queue = JobQueue::new(store, config);

    let output = run(command, &queue)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepqueue_infra::QueueStats;

    fn parse(words: &[&str]) -> Result<Command, clap::Error> {
        Cli::try_parse_from(std::iter::once("stepqueue").chain(words.iter().copied())).map(|cli| cli.command)
    }

    fn queue() -> JobQueue<SqliteStore> {
        JobQueue::new(SqliteStore::in_memory().unwrap(), QueueConfig::for_env("test"))
    }

    #[test]
    fn parses_commands() {
        assert_eq!(parse(&["stats"]).unwrap(), Command::Stats);
        assert_eq!(parse(&["job", "12"]).unwrap(), Command::Job { uuid: "12".into() });
        assert_eq!(parse(&["hard-reset", "--yes"]).unwrap(), Command::HardReset { yes: true });
        assert_eq!(parse(&["hard-reset"]).unwrap(), Command::HardReset { yes: false });
        assert!(parse(&["job"]).is_err());
        assert!(parse(&[]).is_err());
    }

    #[test]
    fn hard_reset_needs_confirmation() {
        let queue = queue();
        let mut job = Job::new(Vec::new());
        queue.submit(&mut job).unwrap();

        assert!(run(Command::HardReset { yes: false }, &queue).is_err());
        assert_eq!(queue.stats().unwrap().next_uuid, 2);
    }

    #[test]
    fn submits_and_reports() {
        let queue = queue();
        let path = std::env::temp_dir().join(format!("stepqueue-cli-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"unordered": true, "steps": [{"do": {"kind": "method", "name": "noop"}}]}"#)
            .unwrap();

        let out = run(Command::Submit { path: path.clone() }, &queue).unwrap();
        assert_eq!(out, json!({ "submitted": 1 }));

        let stats = run(Command::Stats, &queue).unwrap();
        assert_eq!(stats["jobs_waiting_unordered"], 1);
        assert_eq!(stats["next_uuid"], 2);

        let job = run(Command::Job { uuid: "1".into() }, &queue).unwrap();
        assert_eq!(job["uuid"], 1);
        assert!(run(Command::Job { uuid: "2".into() }, &queue).is_err());
        assert!(run(Command::Job { uuid: "x".into() }, &queue).is_err());

        run(Command::HardReset { yes: true }, &queue).unwrap();
        let stats: QueueStats = queue.stats().unwrap();
        assert_eq!(stats.next_uuid, 1);

        let _ = std::fs::remove_file(&path);
    }
}
