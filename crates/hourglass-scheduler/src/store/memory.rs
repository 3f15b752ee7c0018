//! In-memory run store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{AdmitPolicy, Admission, Completion, RunStore, RunTable};
use crate::{Run, SchedulerError, TaskAttempt, TaskId};

/// Run store that lives for the duration of the process.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    table: Mutex<RunTable>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run_if_absent(
        &self,
        workflow: &str,
        slot: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(Run, bool), SchedulerError> {
        Ok(self.table.lock().await.create_if_absent(workflow, slot, now))
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
        self.table.lock().await.try_admit(workflow, slot, policy, now)
    }

    async fn begin_attempt(
        &self,
        workflow: &str,
        slot: DateTime<Utc>,
        task: TaskId,
        now: DateTime<Utc>,
    ) -> Result<TaskAttempt, SchedulerError> {
        self.table.lock().await.begin_attempt(workflow, slot, task, now)
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
        self.table
            .lock()
            .await
            .finish_attempt(workflow, slot, task, attempt, failure, now)
    }

    async fn finish_run(
        &self,
        workflow: &str,
        slot: DateTime<Utc>,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<Run, SchedulerError> {
        self.table
            .lock()
            .await
            .finish_run(workflow, slot, completion, now)
    }

    async fn requeue_run(
        &self,
        workflow: &str,
        slot: DateTime<Utc>,
    ) -> Result<Run, SchedulerError> {
        self.table.lock().await.requeue(workflow, slot)
    }

    async fn clear_run(&self, workflow: &str, slot: DateTime<Utc>) -> Result<Run, SchedulerError> {
        self.table.lock().await.clear(workflow, slot)
    }

    async fn recover_interrupted(
        &self,
        workflow: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, SchedulerError> {
        Ok(self.table.lock().await.recover_interrupted(workflow, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    #[tokio::test]
    async fn concurrent_creates_yield_one_run() {
        let store = Arc::new(MemoryRunStore::new());
        let slot = Utc.with_ymd_and_hms(2025, 11, 14, 5, 0, 0).unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.create_run_if_absent("extract", slot, slot).await.unwrap()
            }));
        }

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().1 {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(store.list_runs("extract").await.unwrap().len(), 1);
    }
}
