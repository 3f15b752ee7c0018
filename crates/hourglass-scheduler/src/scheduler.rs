//! Cross-slot scheduler.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hourglass_objstore::{ObjectKey, ObjectSink};

use crate::executor::{RunOutcome, TaskGraphExecutor};
use crate::extract::Extractor;
use crate::slots::DueSlots;
use crate::store::{AdmitPolicy, Admission, RunStore};
use crate::types::system_clock;
use crate::{Clock, Run, RunState, SchedulerError, WorkflowDefinition};

/// Minimum sleep between scheduler passes.
const MIN_SLEEP: Duration = Duration::from_secs(1);

/// Default upper bound on the sleep between scheduler passes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Discovers due slots, admits their runs and executes them.
pub struct Scheduler {
    workflow: Arc<WorkflowDefinition>,
    store: Arc<dyn RunStore>,
    executor: Arc<TaskGraphExecutor>,
    poll_interval: Duration,
    clock: Clock,
}

impl Scheduler {
    /// Create a scheduler for one workflow. The definition is validated here
    /// and never changes afterwards.
    pub fn new(
        workflow: WorkflowDefinition,
        store: Arc<dyn RunStore>,
        sink: Arc<ObjectSink>,
        extractor: Arc<dyn Extractor>,
    ) -> Result<Self, SchedulerError> {
        workflow.validate()?;
        let workflow = Arc::new(workflow);
        let executor = Arc::new(TaskGraphExecutor::new(
            workflow.clone(),
            store.clone(),
            sink,
            extractor,
        ));

        Ok(Self {
            workflow,
            store,
            executor,
            poll_interval: DEFAULT_POLL_INTERVAL,
            clock: system_clock(),
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Replace the clock used for scheduling and for run history.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self.executor = Arc::new(self.executor.as_ref().clone().with_clock(self.clock.clone()));
        self
    }

    pub fn workflow(&self) -> &WorkflowDefinition {
        &self.workflow
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Slots due at `now` that have no run past Pending.
    pub async fn due_slots(&self, now: DateTime<Utc>) -> Result<DueSlots, SchedulerError> {
        let started: HashSet<_> = self
            .store
            .list_runs(&self.workflow.id)
            .await?
            .into_iter()
            .filter(|run| run.state != RunState::Pending)
            .map(|run| run.slot)
            .collect();
        Ok(DueSlots::new(&self.workflow, now, started))
    }

    /// Create a Pending run for every due slot that lacks one.
    ///
    /// Returns the slots whose run was created by this call.
    pub async fn enqueue_due(&self, now: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>, SchedulerError> {
        let mut created = Vec::new();
        for slot in self.due_slots(now).await? {
            let (_, is_new) = self
                .store
                .create_run_if_absent(&self.workflow.id, slot, now)
                .await?;
            if is_new {
                info!(workflow = %self.workflow.id, %slot, "run created");
                created.push(slot);
            }
        }
        Ok(created)
    }

    fn admit_policy(&self, slot: DateTime<Utc>, capped: bool) -> AdmitPolicy {
        AdmitPolicy {
            predecessor: if self.workflow.depends_on_past {
                self.workflow.predecessor(slot)
            } else {
                None
            },
            max_active: capped.then_some(self.workflow.max_active_runs),
        }
    }

    /// Move Pending runs to Running, oldest slot first, until the
    /// concurrency cap is reached.
    pub async fn admit(&self, now: DateTime<Utc>) -> Result<Vec<Run>, SchedulerError> {
        let workflow = self.workflow.id.as_str();
        let pending: Vec<_> = self
            .store
            .list_runs(workflow)
            .await?
            .into_iter()
            .filter(|run| run.state == RunState::Pending && run.slot <= now)
            .map(|run| run.slot)
            .collect();

        let mut admitted = Vec::new();
        for slot in pending {
            match self
                .store
                .try_admit(workflow, slot, self.admit_policy(slot, true), now)
                .await?
            {
                Admission::Admitted(run) => {
                    info!(workflow, %slot, "run admitted");
                    admitted.push(run);
                }
                Admission::AtCapacity { running } => {
                    debug!(workflow, %slot, running, "concurrency cap reached");
                    break;
                }
                Admission::Blocked {
                    predecessor,
                    state: RunState::Failed,
                } => {
                    warn!(workflow, %slot, %predecessor, "slot held: predecessor failed, clear it to continue");
                }
                Admission::Blocked { predecessor, state } => {
                    debug!(workflow, %slot, %predecessor, %state, "slot waiting on predecessor");
                }
                Admission::NotPending(state) => {
                    debug!(workflow, %slot, %state, "run no longer pending");
                }
            }
        }
        Ok(admitted)
    }

    /// One scheduler pass: enqueue due slots, then admit what fits.
    #[tracing::instrument(skip(self), fields(workflow = %self.workflow.id))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<Run>, SchedulerError> {
        self.enqueue_due(now).await?;
        self.admit(now).await
    }

    /// Execute an admitted run to completion.
    pub async fn execute_run(&self, slot: DateTime<Utc>) -> Result<RunOutcome, SchedulerError> {
        self.executor.execute(slot, &CancellationToken::new()).await
    }

    /// Run one slot synchronously, outside the concurrency cap.
    ///
    /// A Failed run is replayed; a run that already succeeded is not
    /// executed again and its key is returned. The past dependency is
    /// still enforced.
    #[tracing::instrument(skip(self), fields(workflow = %self.workflow.id))]
    pub async fn run_slot(&self, slot: DateTime<Utc>) -> Result<ObjectKey, SchedulerError> {
        let now = self.now();
        if !self.workflow.is_slot(slot) {
            return Err(SchedulerError::InvalidSlot {
                slot,
                reason: format!(
                    "not on the schedule starting {} every {}",
                    self.workflow.start, self.workflow.interval
                ),
            });
        }
        if slot > now {
            return Err(SchedulerError::InvalidSlot {
                slot,
                reason: "not due yet".to_string(),
            });
        }

        let workflow = self.workflow.id.as_str();
        let (run, _) = self.store.create_run_if_absent(workflow, slot, now).await?;
        match run.state {
            RunState::Success => {
                return run.artifact.map(|a| a.key).ok_or_else(|| SchedulerError::RunFailed {
                    slot,
                    reason: "run succeeded without recording an artifact".to_string(),
                });
            }
            RunState::Running => return Err(SchedulerError::SlotBusy(slot)),
            RunState::Failed => {
                self.store.clear_run(workflow, slot).await?;
                info!(workflow, %slot, "replaying failed run");
            }
            RunState::Pending => {}
        }

        match self
            .store
            .try_admit(workflow, slot, self.admit_policy(slot, false), now)
            .await?
        {
            Admission::Admitted(_) => {}
            Admission::Blocked { predecessor, state } => {
                return Err(SchedulerError::OrderingViolation {
                    slot,
                    predecessor,
                    state,
                });
            }
            Admission::AtCapacity { .. } | Admission::NotPending(_) => {
                return Err(SchedulerError::SlotBusy(slot));
            }
        }

        match self.execute_run(slot).await? {
            RunOutcome::Succeeded(artifact) => Ok(artifact.key),
            RunOutcome::Failed { reason, .. } => Err(SchedulerError::RunFailed { slot, reason }),
            RunOutcome::Interrupted | RunOutcome::Deferred { .. } => {
                Err(SchedulerError::Interrupted(slot))
            }
        }
    }

    /// Replay a Failed run: it returns to Pending with a fresh attempt budget.
    pub async fn clear_run(&self, slot: DateTime<Utc>) -> Result<Run, SchedulerError> {
        let run = self.store.clear_run(&self.workflow.id, slot).await?;
        info!(workflow = %self.workflow.id, %slot, replays = run.clear_count, "run cleared");
        Ok(run)
    }

    pub async fn list_runs(&self) -> Result<Vec<Run>, SchedulerError> {
        self.store.list_runs(&self.workflow.id).await
    }

    pub async fn get_run(&self, slot: DateTime<Utc>) -> Result<Option<Run>, SchedulerError> {
        self.store.get_run(&self.workflow.id, slot).await
    }

    /// Return runs left Running by a previous process to Pending.
    pub async fn recover(&self) -> Result<Vec<DateTime<Utc>>, SchedulerError> {
        let recovered = self
            .store
            .recover_interrupted(&self.workflow.id, self.now())
            .await?;
        for slot in &recovered {
            warn!(workflow = %self.workflow.id, %slot, "interrupted run re-queued");
        }
        Ok(recovered)
    }

    /// Time until the next slot falls due, bounded by the poll interval.
    pub fn sleep_duration(&self, now: DateTime<Utc>) -> Duration {
        let next_index = self.workflow.slot_index_at(now).map_or(0, |k| k + 1);
        let until = self
            .workflow
            .slot_at(next_index)
            .and_then(|next| (next - now).to_std().ok())
            .unwrap_or(self.poll_interval);
        until.max(MIN_SLEEP).min(self.poll_interval)
    }

    /// Run the scheduling loop until `shutdown_rx` flips to true.
    ///
    /// On shutdown no further runs are admitted; in-flight runs are
    /// cancelled and awaited. A configuration failure in any run, or a run
    /// the store could not return to Pending, stops the loop and is returned.
    /// Every call uses its own cancellation scope, so a stopped scheduler
    /// can be started again.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), SchedulerError> {
        info!(workflow = %self.workflow.id, "scheduler starting");
        self.recover().await?;

        let cancel = CancellationToken::new();
        let mut in_flight = JoinSet::new();
        let mut result = Ok(());

        loop {
            if *shutdown_rx.borrow() {
                info!("scheduler shutting down");
                break;
            }

            let now = self.now();
            match self.tick(now).await {
                Ok(admitted) => {
                    for run in admitted {
                        let executor = self.executor.clone();
                        let cancel = cancel.child_token();
                        in_flight.spawn(async move {
                            let outcome = executor.execute(run.slot, &cancel).await;
                            (run.slot, outcome)
                        });
                    }
                }
                Err(e) => error!(error = %e, "scheduler pass failed"),
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        info!("shutdown channel closed");
                        break;
                    }
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = self.handle_finished(joined) {
                        result = Err(e);
                        break;
                    }
                }
                _ = sleep(self.sleep_duration(now)) => {}
            }
        }

        cancel.cancel();
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = self.handle_finished(joined)
                && result.is_ok()
            {
                result = Err(e);
            }
        }

        info!(workflow = %self.workflow.id, "scheduler stopped");
        result
    }

    fn handle_finished(
        &self,
        joined: Result<(DateTime<Utc>, Result<RunOutcome, SchedulerError>), JoinError>,
    ) -> Result<(), SchedulerError> {
        match joined {
            Ok((slot, Ok(RunOutcome::Failed {
                reason,
                configuration: true,
            }))) => {
                error!(%slot, reason = %reason, "configuration failure, stopping scheduler");
                Err(SchedulerError::RunFailed { slot, reason })
            }
            Ok((slot, Ok(RunOutcome::Deferred { reason }))) => {
                warn!(%slot, reason = %reason, "run deferred after store failure");
                Ok(())
            }
            Ok((slot, Ok(outcome))) => {
                debug!(%slot, ?outcome, "run finished");
                Ok(())
            }
            Ok((slot, Err(e))) => {
                error!(%slot, error = %e, "run store failed, stopping scheduler");
                Err(e)
            }
            Err(e) => {
                error!(error = %e, "run task panicked");
                Ok(())
            }
        }
    }

    /// Spawn the scheduling loop in the background.
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(shutdown_rx));
        SchedulerHandle { shutdown_tx, join }
    }
}

/// Handle to a scheduler loop started with [`Scheduler::start`].
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<Result<(), SchedulerError>>,
}

impl SchedulerHandle {
    /// Stop admitting runs, cancel in-flight ones and wait for the loop.
    pub async fn stop(self) -> Result<(), SchedulerError> {
        let _ = self.shutdown_tx.send(true);
        Self::join(self.join).await
    }

    /// Wait for the loop to exit on its own.
    pub async fn wait(self) -> Result<(), SchedulerError> {
        Self::join(self.join).await
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    async fn join(join: JoinHandle<Result<(), SchedulerError>>) -> Result<(), SchedulerError> {
        match join.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Ok(()),
        }
    }
}
