//! File-backed run store.
//!
//! The whole run table is kept in memory and rewritten to a JSON file after
//! every mutation. The file is replaced atomically (write to a sibling temp
//! file, then rename), so a crash leaves either the old or the new table.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{AdmitPolicy, Admission, Completion, RunStore, RunTable};
use crate::{Run, SchedulerError, TaskAttempt, TaskId};

const FILE_VERSION: u32 = 1;

/// On-disk format.
#[derive(Debug, Serialize, Deserialize)]
struct RunFile {
    version: u32,
    runs: Vec<Run>,
}

/// Run store persisted to a JSON file; survives process restarts.
#[derive(Debug)]
pub struct JsonRunStore {
    path: PathBuf,
    table: Mutex<RunTable>,
}

impl JsonRunStore {
    /// Open the store at `path`, starting empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SchedulerError> {
        let path = path.into();

        let table = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let file: RunFile = serde_json::from_str(&content)?;
            if file.version != FILE_VERSION {
                return Err(SchedulerError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "unsupported run store version {} in {}",
                        file.version,
                        path.display()
                    ),
                )));
            }
            info!(path = %path.display(), runs = file.runs.len(), "loaded run store");
            RunTable::from_runs(file.runs)
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            RunTable::default()
        };

        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `f` to a copy of the table, persist it, then publish it.
    ///
    /// If writing fails the in-memory table is left untouched. The write runs
    /// on the blocking pool while the table lock is held, so mutations reach
    /// the file in the order they were applied.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut RunTable) -> Result<T, SchedulerError>,
    ) -> Result<T, SchedulerError> {
        let mut guard = self.table.lock().await;
        let mut next = guard.clone();
        let out = f(&mut next)?;

        let path = self.path.clone();
        let next = tokio::task::spawn_blocking(move || persist(&path, &next).map(|()| next))
            .await
            .map_err(|e| SchedulerError::Io(std::io::Error::other(e)))??;

        *guard = next;
        Ok(out)
    }
}

fn persist(path: &Path, table: &RunTable) -> Result<(), SchedulerError> {
    let file = RunFile {
        version: FILE_VERSION,
        runs: table.to_runs(),
    };
    let json = serde_json::to_vec_pretty(&file)?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&json)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    debug!(path = %path.display(), runs = file.runs.len(), "run store flushed");
    Ok(())
}

#[async_trait]
impl RunStore for JsonRunStore {
    async fn create_run_if_absent(
        &self,
        workflow: &str,
        slot: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(Run, bool), SchedulerError> {
        {
            let table = self.table.lock().await;
            if let Some(run) = table.get(workflow, slot) {
                return Ok((run, false));
            }
        }
        self.mutate(|table| Ok(table.create_if_absent(workflow, slot, now)))
            .await
    }

    async fn get_run(
        &self,
        workflow: &str,
        slot: DateTime<Utc>,
    ) -> Result<Option<Run>, SchedulerError> {
        Ok(self.table.lock().await.get(workflow, slot))
    }

    async fn list_runs(&self, workflow: &str) -> Result<Vec<Run>, SchedulerError> {
        Ok(self.table.lock().await.list(workflow))
    }

    async fn try_admit(
        &self,
        workflow: &str,
        slot: DateTime<Utc>,
        policy: AdmitPolicy,
        now: DateTime<Utc>,
    ) -> Result<Admission, SchedulerError> {
        self.mutate(|table| table.try_admit(workflow, slot, policy, now))
            .await
    }

    async fn begin_attempt(
        &self,
        workflow: &str,
        slot: DateTime<Utc>,
        task: TaskId,
        now: DateTime<Utc>,
    ) -> Result<TaskAttempt, SchedulerError> {
        self.mutate(|table| table.begin_attempt(workflow, slot, task, now))
            .await
    }

    async fn finish_attempt(
        &self,
        workflow: &str,
        slot: DateTime<Utc>,
        task: TaskId,
        attempt: u32,
        failure: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<TaskAttempt, SchedulerError> {
        self.mutate(|table| table.finish_attempt(workflow, slot, task, attempt, failure, now))
            .await
    }

    async fn finish_run(
        &self,
        workflow: &str,
        slot: DateTime<Utc>,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<Run, SchedulerError> {
        self.mutate(|table| table.finish_run(workflow, slot, completion, now))
            .await
    }

    async fn requeue_run(
        &self,
        workflow: &str,
        slot: DateTime<Utc>,
    ) -> Result<Run, SchedulerError> {
        self.mutate(|table| table.requeue(workflow, slot)).await
    }

    async fn clear_run(&self, workflow: &str, slot: DateTime<Utc>) -> Result<Run, SchedulerError> {
        self.mutate(|table| table.clear(workflow, slot)).await
    }

    async fn recover_interrupted(
        &self,
        workflow: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, SchedulerError> {
        self.mutate(|table| Ok(table.recover_interrupted(workflow, now)))
            .await
    }
}
