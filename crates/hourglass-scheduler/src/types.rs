//! Scheduler types.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hourglass_objstore::{Artifact, KeyLayout, KeyPrecision, validate_bucket_name};

use crate::SchedulerError;

const NANOS_PER_SEC: i128 = 1_000_000_000;

/// Source of "now".
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The wall clock.
pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Wait between a failed attempt and the next one.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1, Duration::from_secs(300))
    }
}

/// A recurring extraction workflow.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    /// Workflow identity; runs are keyed by it.
    pub id: String,
    /// First slot instant.
    pub start: DateTime<Utc>,
    /// Distance between consecutive slots.
    pub interval: TimeDelta,
    /// Backfill every missed slot instead of only the newest one.
    pub catchup: bool,
    /// A slot may only start once its predecessor succeeded.
    pub depends_on_past: bool,
    /// Upper bound on simultaneously running runs.
    pub max_active_runs: usize,
    /// Retry policy of the extract task.
    pub retry: RetryPolicy,
    /// Destination container (bucket).
    pub container: String,
    /// How artifact keys are derived from slots.
    pub layout: KeyLayout,
}

impl WorkflowDefinition {
    /// Create a workflow with catchup enabled, no past dependency, up to 16
    /// active runs, a single extract attempt and `data/data_<slot>.json` keys.
    pub fn new(
        id: impl Into<String>,
        container: impl Into<String>,
        start: DateTime<Utc>,
        interval: TimeDelta,
    ) -> Self {
        Self {
            id: id.into(),
            start,
            interval,
            catchup: true,
            depends_on_past: false,
            max_active_runs: 16,
            retry: RetryPolicy::default(),
            container: container.into(),
            layout: KeyLayout::new(
                "data/data_",
                ".json",
                KeyPrecision::for_interval(interval),
            ),
        }
    }

    /// The hourly extraction deployment: no catchup, past-dependent, three
    /// active runs, one retry after five minutes, written to `okx`.
    pub fn hourly_extract(id: impl Into<String>, start: DateTime<Utc>) -> Self {
        Self::new(id, "okx", start, TimeDelta::hours(1))
            .with_catchup(false)
            .with_depends_on_past(true)
            .with_max_active_runs(3)
            .with_retry(RetryPolicy::new(2, Duration::from_secs(300)))
    }

    pub fn with_catchup(mut self, catchup: bool) -> Self {
        self.catchup = catchup;
        self
    }

    pub fn with_depends_on_past(mut self, depends_on_past: bool) -> Self {
        self.depends_on_past = depends_on_past;
        self
    }

    pub fn with_max_active_runs(mut self, max_active_runs: usize) -> Self {
        self.max_active_runs = max_active_runs;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_layout(mut self, layout: KeyLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Check the definition before any run references it.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.id.trim().is_empty() {
            return Err(SchedulerError::InvalidWorkflow(
                "workflow id is empty".to_string(),
            ));
        }
        if self.interval <= TimeDelta::zero() {
            return Err(SchedulerError::InvalidWorkflow(format!(
                "interval must be positive, got {}",
                self.interval
            )));
        }
        if self.max_active_runs == 0 {
            return Err(SchedulerError::InvalidWorkflow(
                "max_active_runs must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(SchedulerError::InvalidWorkflow(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        let required = KeyPrecision::for_interval(self.interval);
        if self.layout.precision < required {
            return Err(SchedulerError::InvalidWorkflow(format!(
                "key precision {:?} is coarser than the interval {} requires ({:?})",
                self.layout.precision, self.interval, required
            )));
        }
        validate_bucket_name(&self.container)
            .map_err(|e| SchedulerError::InvalidWorkflow(e.to_string()))?;
        Ok(())
    }

    /// Index of the newest slot at or before `t`, if `t` is not before start.
    pub fn slot_index_at(&self, t: DateTime<Utc>) -> Option<i64> {
        if t < self.start {
            return None;
        }
        let elapsed = nanos(t - self.start);
        i64::try_from(elapsed / nanos(self.interval)).ok()
    }

    /// Instant of slot `index`.
    pub fn slot_at(&self, index: i64) -> Option<DateTime<Utc>> {
        if index < 0 {
            return None;
        }
        let offset = delta_from_nanos(nanos(self.interval).checked_mul(index as i128)?)?;
        self.start.checked_add_signed(offset)
    }

    /// Newest slot due at `now`.
    pub fn latest_slot(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.slot_index_at(now).and_then(|k| self.slot_at(k))
    }

    /// Whether `t` lies exactly on the schedule.
    pub fn is_slot(&self, t: DateTime<Utc>) -> bool {
        self.slot_index_at(t)
            .and_then(|k| self.slot_at(k))
            .is_some_and(|slot| slot == t)
    }

    /// The slot immediately before `slot`, if any.
    pub fn predecessor(&self, slot: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let index = self.slot_index_at(slot)?;
        self.slot_at(index - 1)
    }
}

fn nanos(delta: TimeDelta) -> i128 {
    delta.num_seconds() as i128 * NANOS_PER_SEC + delta.subsec_nanos() as i128
}

fn delta_from_nanos(total: i128) -> Option<TimeDelta> {
    let secs = i64::try_from(total.div_euclid(NANOS_PER_SEC)).ok()?;
    let sub = total.rem_euclid(NANOS_PER_SEC) as i64;
    TimeDelta::try_seconds(secs)?.checked_add(&TimeDelta::nanoseconds(sub))
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Created, waiting for admission.
    #[default]
    Pending,
    /// Admitted and executing its task graph.
    Running,
    /// Artifact written and every task completed.
    Success,
    /// A task failed terminally.
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Allowed transitions. `Running -> Pending` re-queues an interrupted run,
    /// `Failed -> Pending` is an operator replay.
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => target == Self::Running,
            Self::Running => matches!(target, Self::Success | Self::Failed | Self::Pending),
            Self::Failed => target == Self::Pending,
            Self::Success => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Lifecycle of a single task attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
}

/// The tasks of the per-slot graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskId {
    Start,
    Extract,
    End,
}

impl TaskId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Extract => "extract",
            Self::End => "end",
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One try of a task within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAttempt {
    pub task: TaskId,
    /// Execution round the attempt belongs to (the run's `round` at the time).
    pub round: u32,
    /// 1-based attempt number within the round.
    pub attempt: u32,
    pub state: TaskState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub failure: Option<String>,
}

/// One execution of the task graph for one logical slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub workflow_id: String,
    pub slot: DateTime<Utc>,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// The object written on success.
    pub artifact: Option<Artifact>,
    /// Reason of the last failure.
    pub failure: Option<String>,
    /// How many times an operator replayed this run.
    pub clear_count: u32,
    /// Current execution round. Bumped on every replay and on every requeue
    /// of an interrupted run, so each execution gets the full retry budget.
    #[serde(default)]
    pub round: u32,
    /// Every attempt of every task, in order.
    #[serde(default)]
    pub attempts: Vec<TaskAttempt>,
}

impl Run {
    /// Create a pending run for a slot.
    pub fn new(workflow_id: impl Into<String>, slot: DateTime<Utc>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            slot,
            state: RunState::Pending,
            created_at,
            started_at: None,
            finished_at: None,
            artifact: None,
            failure: None,
            clear_count: 0,
            round: 0,
            attempts: Vec::new(),
        }
    }

    /// Attempts of `task` in the current round.
    pub fn attempts_for(&self, task: TaskId) -> impl Iterator<Item = &TaskAttempt> {
        let round = self.round;
        self.attempts
            .iter()
            .filter(move |a| a.task == task && a.round == round)
    }
}
