//! Run state persistence.
//!
//! The [`RunStore`] trait is the single source of truth for runs and their
//! task attempts. Every method is atomic with respect to the others, which
//! gives the scheduler two primitives it relies on:
//!
//! - **Create-if-absent**: at most one run per `(workflow, slot)`, even with
//!   concurrent schedulers.
//! - **Checked admission**: the concurrency cap and the past-dependency check
//!   are evaluated and the run flipped to Running in one step.

mod json;
mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use hourglass_objstore::Artifact;

use crate::{Run, RunState, SchedulerError, TaskAttempt, TaskId, TaskState};

pub use json::JsonRunStore;
pub use memory::MemoryRunStore;

/// Constraints checked when moving a run from Pending to Running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmitPolicy {
    /// Slot whose run, if it exists, must have succeeded first.
    pub predecessor: Option<DateTime<Utc>>,
    /// Maximum number of Running runs of the workflow.
    pub max_active: Option<usize>,
}

/// Result of an admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The run is now Running.
    Admitted(Run),
    /// The workflow already has `running` runs in flight.
    AtCapacity { running: usize },
    /// The predecessor run exists and has not succeeded.
    Blocked {
        predecessor: DateTime<Utc>,
        state: RunState,
    },
    /// The run is not Pending.
    NotPending(RunState),
}

/// Terminal result recorded on a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Success(Artifact),
    Failed(String),
}

/// Storage abstraction for runs.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Return the run for a slot, creating a Pending one if none exists.
    ///
    /// The flag is true when the run was created by this call.
    async fn create_run_if_absent(
        &self,
        workflow: &str,
        slot: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(Run, bool), SchedulerError>;

    async fn get_run(
        &self,
        workflow: &str,
        slot: DateTime<Utc>,
    ) -> Result<Option<Run>, SchedulerError>;

    /// All runs of a workflow in slot order.
    async fn list_runs(&self, workflow: &str) -> Result<Vec<Run>, SchedulerError>;

    /// Atomically check `policy` and move the run from Pending to Running.
    async fn try_admit(
        &self,
        workflow: &str,
        slot: DateTime<Utc>,
        policy: AdmitPolicy,
        now: DateTime<Utc>,
    ) -> Result<Admission, SchedulerError>;

    /// Record the start of the next attempt of `task` in the current round.
    async fn begin_attempt(
        &self,
        workflow: &str,
        slot: DateTime<Utc>,
        task: TaskId,
        now: DateTime<Utc>,
    ) -> Result<TaskAttempt, SchedulerError>;

    /// Close an attempt; `failure` is `None` on success.
    async fn finish_attempt(
        &self,
        workflow: &str,
        slot: DateTime<Utc>,
        task: TaskId,
        attempt: u32,
        failure: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<TaskAttempt, SchedulerError>;

    /// Move a Running run to Success or Failed.
    async fn finish_run(
        &self,
        workflow: &str,
        slot: DateTime<Utc>,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<Run, SchedulerError>;

    /// Return an interrupted Running run to Pending in a new round.
    async fn requeue_run(&self, workflow: &str, slot: DateTime<Utc>)
    -> Result<Run, SchedulerError>;

    /// Replay a Failed run: back to Pending in a new attempt round.
    async fn clear_run(&self, workflow: &str, slot: DateTime<Utc>) -> Result<Run, SchedulerError>;

    /// Re-queue every run left Running by a previous process, each in a new
    /// round.
    async fn recover_interrupted(
        &self,
        workflow: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, SchedulerError>;
}

/// Plain in-memory run table shared by the store implementations.
#[derive(Debug, Clone, Default)]
pub(crate) struct RunTable {
    runs: BTreeMap<(String, DateTime<Utc>), Run>,
}

impl RunTable {
    pub(crate) fn from_runs(runs: Vec<Run>) -> Self {
        Self {
            runs: runs
                .into_iter()
                .map(|run| ((run.workflow_id.clone(), run.slot), run))
                .collect(),
        }
    }

    pub(crate) fn to_runs(&self) -> Vec<Run> {
        self.runs.values().cloned().collect()
    }

    pub(crate) fn create_if_absent(
        &mut self,
        workflow: &str,
        slot: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> (Run, bool) {
        let key = (workflow.to_string(), slot);
        if let Some(run) = self.runs.get(&key) {
            return (run.clone(), false);
        }
        let run = Run::new(workflow, slot, now);
        self.runs.insert(key, run.clone());
        (run, true)
    }

    pub(crate) fn get(&self, workflow: &str, slot: DateTime<Utc>) -> Option<Run> {
        self.runs.get(&(workflow.to_string(), slot)).cloned()
    }

    pub(crate) fn list(&self, workflow: &str) -> Vec<Run> {
        self.runs
            .values()
            .filter(|run| run.workflow_id == workflow)
            .cloned()
            .collect()
    }

    fn running_count(&self, workflow: &str) -> usize {
        self.runs
            .values()
            .filter(|run| run.workflow_id == workflow && run.state == RunState::Running)
            .count()
    }

    fn get_mut(&mut self, workflow: &str, slot: DateTime<Utc>) -> Result<&mut Run, SchedulerError> {
        self.runs
            .get_mut(&(workflow.to_string(), slot))
            .ok_or_else(|| SchedulerError::RunNotFound {
                workflow: workflow.to_string(),
                slot,
            })
    }

    pub(crate) fn try_admit(
        &mut self,
        workflow: &str,
        slot: DateTime<Utc>,
        policy: AdmitPolicy,
        now: DateTime<Utc>,
    ) -> Result<Admission, SchedulerError> {
        let state = self.get_mut(workflow, slot)?.state;
        if state != RunState::Pending {
            return Ok(Admission::NotPending(state));
        }

        if let Some(max_active) = policy.max_active {
            let running = self.running_count(workflow);
            if running >= max_active {
                return Ok(Admission::AtCapacity { running });
            }
        }

        if let Some(predecessor) = policy.predecessor
            && let Some(prev) = self.runs.get(&(workflow.to_string(), predecessor))
            && prev.state != RunState::Success
        {
            return Ok(Admission::Blocked {
                predecessor,
                state: prev.state,
            });
        }

        let run = self.get_mut(workflow, slot)?;
        transition(run, RunState::Running)?;
        run.started_at = Some(now);
        run.failure = None;
        Ok(Admission::Admitted(run.clone()))
    }

    pub(crate) fn begin_attempt(
        &mut self,
        workflow: &str,
        slot: DateTime<Utc>,
        task: TaskId,
        now: DateTime<Utc>,
    ) -> Result<TaskAttempt, SchedulerError> {
        let run = self.get_mut(workflow, slot)?;
        if run.state != RunState::Running {
            return Err(SchedulerError::InvalidTransition {
                slot,
                from: run.state,
                to: RunState::Running,
            });
        }

        let attempt = TaskAttempt {
            task,
            round: run.round,
            attempt: run.attempts_for(task).count() as u32 + 1,
            state: TaskState::Running,
            started_at: now,
            ended_at: None,
            failure: None,
        };
        run.attempts.push(attempt.clone());
        Ok(attempt)
    }

    pub(crate) fn finish_attempt(
        &mut self,
        workflow: &str,
        slot: DateTime<Utc>,
        task: TaskId,
        attempt: u32,
        failure: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<TaskAttempt, SchedulerError> {
        let run = self.get_mut(workflow, slot)?;
        let round = run.round;
        let record = run
            .attempts
            .iter_mut()
            .find(|a| a.task == task && a.round == round && a.attempt == attempt)
            .ok_or_else(|| SchedulerError::RunNotFound {
                workflow: workflow.to_string(),
                slot,
            })?;

        if record.state != TaskState::Running {
            // Attempts are immutable once completed.
            return Ok(record.clone());
        }

        record.state = if failure.is_some() {
            TaskState::Failed
        } else {
            TaskState::Success
        };
        record.failure = failure;
        record.ended_at = Some(now);
        Ok(record.clone())
    }

    pub(crate) fn finish_run(
        &mut self,
        workflow: &str,
        slot: DateTime<Utc>,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<Run, SchedulerError> {
        let run = self.get_mut(workflow, slot)?;
        match completion {
            Completion::Success(artifact) => {
                transition(run, RunState::Success)?;
                run.artifact = Some(artifact);
                run.failure = None;
            }
            Completion::Failed(reason) => {
                transition(run, RunState::Failed)?;
                run.failure = Some(reason);
            }
        }
        run.finished_at = Some(now);
        Ok(run.clone())
    }

    pub(crate) fn requeue(
        &mut self,
        workflow: &str,
        slot: DateTime<Utc>,
    ) -> Result<Run, SchedulerError> {
        let run = self.get_mut(workflow, slot)?;
        if run.state != RunState::Running {
            return Err(SchedulerError::InvalidTransition {
                slot,
                from: run.state,
                to: RunState::Pending,
            });
        }
        transition(run, RunState::Pending)?;
        run.round += 1;
        run.started_at = None;
        Ok(run.clone())
    }

    pub(crate) fn clear(&mut self, workflow: &str, slot: DateTime<Utc>) -> Result<Run, SchedulerError> {
        let run = self.get_mut(workflow, slot)?;
        if run.state != RunState::Failed {
            return Err(SchedulerError::InvalidTransition {
                slot,
                from: run.state,
                to: RunState::Pending,
            });
        }
        transition(run, RunState::Pending)?;
        run.clear_count += 1;
        run.round += 1;
        run.started_at = None;
        run.finished_at = None;
        Ok(run.clone())
    }

    pub(crate) fn recover_interrupted(
        &mut self,
        workflow: &str,
        now: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        let mut recovered = Vec::new();
        for run in self
            .runs
            .values_mut()
            .filter(|run| run.workflow_id == workflow && run.state == RunState::Running)
        {
            for attempt in run
                .attempts
                .iter_mut()
                .filter(|a| a.state == TaskState::Running)
            {
                attempt.state = TaskState::Failed;
                attempt.failure = Some("interrupted by process exit".to_string());
                attempt.ended_at = Some(now);
            }
            run.state = RunState::Pending;
            run.round += 1;
            run.started_at = None;
            recovered.push(run.slot);
        }
        recovered
    }
}

fn transition(run: &mut Run, to: RunState) -> Result<(), SchedulerError> {
    if !run.state.can_transition_to(to) {
        return Err(SchedulerError::InvalidTransition {
            slot: run.slot,
            from: run.state,
            to,
        });
    }
    run.state = to;
    Ok(())
}
