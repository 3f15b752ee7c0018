//! Subcommand implementations.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use miette::Result;
use tokio::sync::watch;
use tracing::info;

use hourglass_objstore::{ObjectSink, S3Client};
use hourglass_scheduler::{JsonFileExtractor, JsonRunStore, RunStore, Scheduler};

use crate::config::{StoreArgs, WorkflowArgs};

fn open_store(workflow: &WorkflowArgs) -> Result<Arc<JsonRunStore>> {
    let path = workflow.state_path()?;
    let store = JsonRunStore::open(&path)
        .map_err(|e| miette::miette!("failed to open run store {}: {}", path.display(), e))?;
    Ok(Arc::new(store))
}

/// Resolve configuration and wire the scheduler. Nothing runs yet.
fn build_scheduler(store: &StoreArgs, workflow: &WorkflowArgs) -> Result<Scheduler> {
    let definition = workflow.definition()?;
    let client = S3Client::new(&store.to_config()).map_err(|e| miette::miette!("{}", e))?;
    let sink = Arc::new(ObjectSink::new(Arc::new(client)));
    let extractor = Arc::new(JsonFileExtractor::new(&workflow.data));

    Scheduler::new(definition, open_store(workflow)?, sink, extractor)
        .map_err(|e| miette::miette!("{}", e))
}

/// Run the scheduling loop until Ctrl-C.
pub async fn daemon(store: &StoreArgs, workflow: &WorkflowArgs, poll_interval: u64) -> Result<()> {
    let scheduler = Arc::new(
        build_scheduler(store, workflow)?.with_poll_interval(Duration::from_secs(poll_interval)),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    scheduler
        .run(shutdown_rx)
        .await
        .map_err(|e| miette::miette!("{}", e))
}

/// Execute one slot synchronously and print the written key.
pub async fn run_once(
    store: &StoreArgs,
    workflow: &WorkflowArgs,
    slot: Option<DateTime<Utc>>,
) -> Result<()> {
    let scheduler = build_scheduler(store, workflow)?;

    let slot = match slot {
        Some(slot) => slot,
        None => {
            let definition = scheduler.workflow();
            definition
                .latest_slot(scheduler.now())
                .ok_or_else(|| miette::miette!("no slot is due before {}", definition.start))?
        }
    };

    let key = scheduler
        .run_slot(slot)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    println!("{}", key);
    Ok(())
}

/// Print the run history as JSON lines.
pub async fn runs(workflow: &WorkflowArgs) -> Result<()> {
    let store = open_store(workflow)?;
    let runs = store
        .list_runs(&workflow.workflow)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    for run in runs {
        let line = serde_json::to_string(&run).map_err(|e| miette::miette!("{}", e))?;
        println!("{}", line);
    }
    Ok(())
}

/// Replay a Failed run.
pub async fn clear(workflow: &WorkflowArgs, slot: DateTime<Utc>) -> Result<()> {
    let store = open_store(workflow)?;
    let run = store
        .clear_run(&workflow.workflow, slot)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    info!(workflow = %run.workflow_id, %slot, replays = run.clear_count, "run cleared");
    println!("{} {}", run.slot.to_rfc3339(), run.state);
    Ok(())
}
