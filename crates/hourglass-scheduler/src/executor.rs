//! Per-slot task graph execution.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use hourglass_objstore::{Artifact, ObjectSink};

use crate::extract::Extractor;
use crate::retry::{RetryController, TaskFailure};
use crate::store::{Completion, RunStore};
use crate::types::system_clock;
use crate::{Clock, RetryPolicy, SchedulerError, TaskError, TaskId, WorkflowDefinition};

/// What a task does when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Bounds the run; has no effect.
    Marker,
    /// Calls the extractor and writes the artifact.
    Extract,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskDescriptor {
    pub id: TaskId,
    pub kind: TaskKind,
}

/// The tasks of every run, in execution order.
pub const TASK_GRAPH: [TaskDescriptor; 3] = [
    TaskDescriptor {
        id: TaskId::Start,
        kind: TaskKind::Marker,
    },
    TaskDescriptor {
        id: TaskId::Extract,
        kind: TaskKind::Extract,
    },
    TaskDescriptor {
        id: TaskId::End,
        kind: TaskKind::Marker,
    },
];

/// How an executed run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every task succeeded; the run is Success.
    Succeeded(Artifact),
    /// A task failed terminally; the run is Failed.
    Failed {
        reason: String,
        /// The failure was a configuration failure, not an exhausted retry.
        configuration: bool,
    },
    /// Cancelled before finishing; the run is back to Pending.
    Interrupted,
    /// The run store failed mid-run; the run is back to Pending.
    Deferred { reason: String },
}

/// Executes `start -> extract -> end` for one admitted run.
#[derive(Clone)]
pub struct TaskGraphExecutor {
    workflow: Arc<WorkflowDefinition>,
    store: Arc<dyn RunStore>,
    sink: Arc<ObjectSink>,
    extractor: Arc<dyn Extractor>,
    clock: Clock,
}

impl TaskGraphExecutor {
    pub fn new(
        workflow: Arc<WorkflowDefinition>,
        store: Arc<dyn RunStore>,
        sink: Arc<ObjectSink>,
        extractor: Arc<dyn Extractor>,
    ) -> Self {
        Self {
            workflow,
            store,
            sink,
            extractor,
            clock: system_clock(),
        }
    }

    /// Timestamp attempts and runs with `clock` instead of the wall clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Run the graph for `slot`, whose run must already be Running.
    ///
    /// The run is left in Success or Failed, or returned to Pending when
    /// `cancel` fires or the run store fails mid-run. An `Err` means the
    /// store failed and the run could not be returned to Pending either.
    #[tracing::instrument(skip(self, cancel), fields(workflow = %self.workflow.id))]
    pub async fn execute(
        &self,
        slot: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, SchedulerError> {
        let err = match self.run_graph(slot, cancel).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) => err,
        };

        match self.store.requeue_run(&self.workflow.id, slot).await {
            Ok(_) => {
                warn!(%slot, error = %err, "run store failed mid-run, returned to pending");
                Ok(RunOutcome::Deferred {
                    reason: err.to_string(),
                })
            }
            Err(requeue) => {
                error!(%slot, error = %err, requeue_error = %requeue, "run store failed, run left running");
                Err(err)
            }
        }
    }

    async fn run_graph(
        &self,
        slot: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, SchedulerError> {
        let workflow = self.workflow.id.as_str();
        let controller = RetryController::new(self.store.as_ref(), workflow, slot, cancel)
            .with_clock(self.clock.clone());
        let mut artifact = None;

        for task in TASK_GRAPH {
            let result = match task.kind {
                TaskKind::Marker => {
                    controller
                        .run(task.id, &RetryPolicy::once(), |_| async {
                            Ok::<Option<Artifact>, TaskError>(None)
                        })
                        .await
                }
                TaskKind::Extract => {
                    controller
                        .run(task.id, &self.workflow.retry, |_| async move {
                            self.extract_once(slot).await.map(Some)
                        })
                        .await
                }
            };

            match result {
                Ok(Some(written)) => artifact = Some(written),
                Ok(None) => {}
                Err(TaskFailure::Cancelled(task)) => {
                    self.store.requeue_run(workflow, slot).await?;
                    warn!(%slot, %task, "run interrupted, returned to pending");
                    return Ok(RunOutcome::Interrupted);
                }
                Err(TaskFailure::Store(err)) => return Err(err),
                Err(failure) => {
                    let configuration = matches!(
                        failure,
                        TaskFailure::Fatal {
                            error: TaskError::Configuration(_),
                            ..
                        }
                    );
                    return self.fail(slot, failure.to_string(), configuration).await;
                }
            }
        }

        let Some(artifact) = artifact else {
            return self
                .fail(slot, "no artifact was written".to_string(), false)
                .await;
        };

        self.store
            .finish_run(workflow, slot, Completion::Success(artifact.clone()), (self.clock)())
            .await?;
        info!(%slot, key = %artifact.key, "run succeeded");
        Ok(RunOutcome::Succeeded(artifact))
    }

    async fn extract_once(&self, slot: DateTime<Utc>) -> Result<Artifact, TaskError> {
        let payload = self.extractor.extract().await?;

        let container = self.workflow.container.as_str();
        self.sink.ensure_container(container).await?;

        let key = self.workflow.layout.key_for(slot);
        let artifact = self
            .sink
            .put_object(container, &key, payload.bytes, &payload.content_type)
            .await?;

        info!(%slot, container, key = %artifact.key, size = artifact.size, "artifact written");
        Ok(artifact)
    }

    async fn fail(
        &self,
        slot: DateTime<Utc>,
        reason: String,
        configuration: bool,
    ) -> Result<RunOutcome, SchedulerError> {
        self.store
            .finish_run(
                &self.workflow.id,
                slot,
                Completion::Failed(reason.clone()),
                (self.clock)(),
            )
            .await?;
        error!(%slot, reason = %reason, "run failed");
        Ok(RunOutcome::Failed {
            reason,
            configuration,
        })
    }
}
