//! Hourglass: slot-scheduled extraction into an object store
//!
//! Main binary with subcommands:
//! - `daemon`: Continuous scheduling loop
//! - `run-once`: Execute a single slot and print the written key
//! - `runs`: Print run history
//! - `clear`: Replay a failed run

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;

use config::{StoreArgs, WorkflowArgs, parse_instant};

#[derive(Parser)]
#[command(name = "hourglass")]
#[command(about = "Slot-scheduled extraction into an object store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduling loop until interrupted
    Daemon {
        #[command(flatten)]
        store: StoreArgs,

        #[command(flatten)]
        workflow: WorkflowArgs,

        /// Upper bound on the sleep between scheduler passes, in seconds
        #[arg(long, env = "HOURGLASS_POLL_INTERVAL", default_value = "60")]
        poll_interval: u64,
    },

    /// Execute one slot now and print the object key
    RunOnce {
        #[command(flatten)]
        store: StoreArgs,

        #[command(flatten)]
        workflow: WorkflowArgs,

        /// Slot to execute (RFC 3339); defaults to the newest due slot
        #[arg(long, value_parser = parse_instant)]
        slot: Option<DateTime<Utc>>,
    },

    /// Print the run history as JSON lines
    Runs {
        #[command(flatten)]
        workflow: WorkflowArgs,
    },

    /// Return a failed run to pending so it is executed again
    Clear {
        #[command(flatten)]
        workflow: WorkflowArgs,

        /// Slot of the failed run (RFC 3339)
        #[arg(long, value_parser = parse_instant)]
        slot: DateTime<Utc>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "hourglass=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            store,
            workflow,
            poll_interval,
        } => commands::daemon(&store, &workflow, poll_interval).await,

        Commands::RunOnce {
            store,
            workflow,
            slot,
        } => commands::run_once(&store, &workflow, slot).await,

        Commands::Runs { workflow } => commands::runs(&workflow).await,

        Commands::Clear { workflow, slot } => commands::clear(&workflow, slot).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_once_accepts_a_slot() {
        let cli = Cli::try_parse_from([
            "hourglass",
            "run-once",
            "--access-key",
            "ak",
            "--secret-key",
            "sk",
            "--slot",
            "2025-11-14T05:00:00Z",
        ])
        .unwrap();

        match cli.command {
            Commands::RunOnce { slot, store, .. } => {
                assert_eq!(slot, Some(Utc.with_ymd_and_hms(2025, 11, 14, 5, 0, 0).unwrap()));
                assert_eq!(store.access_key, "ak");
            }
            _ => panic!("expected run-once"),
        }
    }

    #[test]
    fn clear_requires_a_slot() {
        assert!(Cli::try_parse_from(["hourglass", "clear"]).is_err());
    }
}
