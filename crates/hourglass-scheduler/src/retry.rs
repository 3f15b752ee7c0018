//! Bounded retry of a single task.

use std::future::Future;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::store::RunStore;
use crate::types::system_clock;
use crate::{Clock, RetryPolicy, SchedulerError, TaskError, TaskId};

/// Why a task did not succeed.
#[derive(Debug, Error)]
pub enum TaskFailure {
    /// Every allowed attempt failed.
    #[error("{task} failed after {attempts} attempts: {last}")]
    Exhausted {
        task: TaskId,
        attempts: u32,
        last: TaskError,
    },

    /// A non-retryable failure ended the task immediately.
    #[error("{task} failed: {error}")]
    Fatal { task: TaskId, error: TaskError },

    /// The run was cancelled.
    #[error("{0} was cancelled")]
    Cancelled(TaskId),

    /// Attempt bookkeeping failed.
    #[error(transparent)]
    Store(#[from] SchedulerError),
}

/// Runs a task under a [`RetryPolicy`], recording each attempt.
pub struct RetryController<'a> {
    store: &'a dyn RunStore,
    workflow: &'a str,
    slot: DateTime<Utc>,
    cancel: &'a CancellationToken,
    clock: Clock,
}

impl<'a> RetryController<'a> {
    pub fn new(
        store: &'a dyn RunStore,
        workflow: &'a str,
        slot: DateTime<Utc>,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            store,
            workflow,
            slot,
            cancel,
            clock: system_clock(),
        }
    }

    /// Timestamp attempts with `clock` instead of the wall clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Execute `op` until it succeeds, fails fatally, or `policy` is spent.
    ///
    /// `op` receives the 1-based attempt number. The delay between attempts
    /// only suspends this run; cancellation cuts it short.
    pub async fn run<T, F, Fut>(
        &self,
        task: TaskId,
        policy: &RetryPolicy,
        mut op: F,
    ) -> Result<T, TaskFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        let max_attempts = policy.max_attempts.max(1);

        loop {
            if self.cancel.is_cancelled() {
                return Err(TaskFailure::Cancelled(task));
            }

            let attempt = self
                .store
                .begin_attempt(self.workflow, self.slot, task, (self.clock)())
                .await?
                .attempt;

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = op(attempt) => Some(result),
            };

            let Some(result) = result else {
                self.finish(task, attempt, Some("cancelled".to_string())).await?;
                return Err(TaskFailure::Cancelled(task));
            };

            match result {
                Ok(value) => {
                    self.finish(task, attempt, None).await?;
                    debug!(slot = %self.slot, %task, attempt, "task succeeded");
                    return Ok(value);
                }
                Err(err) => {
                    self.finish(task, attempt, Some(err.to_string())).await?;

                    if !err.is_retryable() {
                        error!(slot = %self.slot, %task, attempt, error = %err, "task failed, not retryable");
                        return Err(TaskFailure::Fatal { task, error: err });
                    }

                    if attempt >= max_attempts {
                        error!(slot = %self.slot, %task, attempt, error = %err, "task failed, retries exhausted");
                        return Err(TaskFailure::Exhausted {
                            task,
                            attempts: attempt,
                            last: err,
                        });
                    }

                    warn!(
                        slot = %self.slot,
                        %task,
                        attempt,
                        max_attempts,
                        delay_secs = policy.delay.as_secs_f64(),
                        error = %err,
                        "task failed, scheduled retry"
                    );

                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(TaskFailure::Cancelled(task)),
                        _ = tokio::time::sleep(policy.delay) => {}
                    }
                }
            }
        }
    }

    async fn finish(
        &self,
        task: TaskId,
        attempt: u32,
        failure: Option<String>,
    ) -> Result<(), SchedulerError> {
        self.store
            .finish_attempt(self.workflow, self.slot, task, attempt, failure, (self.clock)())
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use chrono::TimeZone;

    use crate::store::{AdmitPolicy, MemoryRunStore};
    use crate::TaskState;

    const WF: &str = "extract";

    fn slot() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 14, 5, 0, 0).unwrap()
    }

    async fn running_store() -> MemoryRunStore {
        let store = MemoryRunStore::new();
        store.create_run_if_absent(WF, slot(), slot()).await.unwrap();
        store
            .try_admit(WF, slot(), AdmitPolicy::default(), slot())
            .await
            .unwrap();
        store
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_task_runs_exactly_max_attempts() {
        let store = running_store().await;
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_secs(300));

        let controller = RetryController::new(&store, WF, slot(), &cancel);
        let result: Result<(), _> = controller
            .run(TaskId::Extract, &policy, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TaskError::Transient("connection refused".into())) }
            })
            .await;

        assert!(matches!(
            result,
            Err(TaskFailure::Exhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let run = store.get_run(WF, slot()).await.unwrap().unwrap();
        let attempts: Vec<_> = run.attempts_for(TaskId::Extract).collect();
        assert_eq!(attempts.len(), 3);
        assert!(attempts.iter().all(|a| a.state == TaskState::Failed));
        assert_eq!(
            attempts.iter().map(|a| a.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn success_stops_retrying() {
        let store = running_store().await;
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(5, Duration::from_secs(60));

        let controller = RetryController::new(&store, WF, slot(), &cancel);
        let value = controller
            .run(TaskId::Extract, &policy, |attempt| async move {
                if attempt < 2 {
                    Err(TaskError::Transient("503".into()))
                } else {
                    Ok(attempt)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
        let run = store.get_run(WF, slot()).await.unwrap().unwrap();
        let states: Vec<_> = run.attempts_for(TaskId::Extract).map(|a| a.state).collect();
        assert_eq!(states, vec![TaskState::Failed, TaskState::Success]);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_separates_attempts() {
        let store = running_store().await;
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(2, Duration::from_secs(300));
        let started = tokio::time::Instant::now();

        let controller = RetryController::new(&store, WF, slot(), &cancel);
        let _: Result<(), _> = controller
            .run(TaskId::Extract, &policy, |_| async {
                Err(TaskError::Transient("timeout".into()))
            })
            .await;

        assert!(started.elapsed() >= Duration::from_secs(300));
        assert!(started.elapsed() < Duration::from_secs(600));
    }

    #[tokio::test]
    async fn configuration_failure_is_not_retried() {
        let store = running_store().await;
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_secs(300));

        let controller = RetryController::new(&store, WF, slot(), &cancel);
        let result: Result<(), _> = controller
            .run(TaskId::Extract, &policy, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TaskError::Configuration("secret key is empty".into())) }
            })
            .await;

        assert!(matches!(result, Err(TaskFailure::Fatal { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let store = Arc::new(running_store().await);
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(3, Duration::from_secs(3600));

        let task = {
            let store = store.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let controller = RetryController::new(store.as_ref(), WF, slot(), &cancel);
                controller
                    .run(TaskId::Extract, &policy, |_| async {
                        Err::<(), _>(TaskError::Transient("down".into()))
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(TaskFailure::Cancelled(TaskId::Extract))));

        let run = store.get_run(WF, slot()).await.unwrap().unwrap();
        assert_eq!(run.attempts_for(TaskId::Extract).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn requeued_run_gets_a_full_budget_and_no_more() {
        let store = Arc::new(running_store().await);
        let policy = RetryPolicy::new(1, Duration::ZERO);

        // Cancelled while the first extract is in flight.
        let cancel = CancellationToken::new();
        let task = {
            let store = store.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let controller = RetryController::new(store.as_ref(), WF, slot(), &cancel);
                controller
                    .run(TaskId::Extract, &policy, |_| async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok::<(), TaskError>(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        assert!(matches!(task.await.unwrap(), Err(TaskFailure::Cancelled(_))));

        store.requeue_run(WF, slot()).await.unwrap();
        store
            .try_admit(WF, slot(), AdmitPolicy::default(), slot())
            .await
            .unwrap();

        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let controller = RetryController::new(store.as_ref(), WF, slot(), &cancel);
        let result: Result<(), _> = controller
            .run(TaskId::Extract, &policy, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TaskError::Transient("connection refused".into())) }
            })
            .await;

        assert!(matches!(
            result,
            Err(TaskFailure::Exhausted { attempts: 1, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let run = store.get_run(WF, slot()).await.unwrap().unwrap();
        assert_eq!(run.attempts_for(TaskId::Extract).count(), 1);
        assert!(run.attempts_for(TaskId::Extract).count() as u32 <= policy.max_attempts);
        assert_eq!(run.attempts.len(), 2);
    }

    #[tokio::test]
    async fn attempts_are_stamped_by_the_injected_clock() {
        let store = running_store().await;
        let cancel = CancellationToken::new();
        let at = slot() + chrono::TimeDelta::minutes(7);

        let controller =
            RetryController::new(&store, WF, slot(), &cancel).with_clock(Arc::new(move || at));
        controller
            .run(TaskId::Start, &RetryPolicy::once(), |_| async {
                Ok::<(), TaskError>(())
            })
            .await
            .unwrap();

        let run = store.get_run(WF, slot()).await.unwrap().unwrap();
        assert_eq!(run.attempts[0].started_at, at);
        assert_eq!(run.attempts[0].ended_at, Some(at));
    }
}
