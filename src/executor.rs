//! Runs one claimed job and records what happened.
//!
//! The executor owns the job from a successful claim until it writes the
//! terminal result, reschedules it, or discovers it no longer holds the claim.
//! Handler failures of any kind are turned into store transitions here and
//! never reach the poll loop.

use crate::{
    MillworkError, Result,
    clock::Clock,
    health::JobCounters,
    job::{Job, JobResult, add_duration},
    queue::QueueStore,
    registry::{FunctionDef, JobContext, JobError, Registry},
    retry::{RetryDecision, RetryPolicy},
    serializer::Serializer,
};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde_json::Value;
use std::{future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const ABORTED_ERROR: &str = "aborted";
const SHUTDOWN_ERROR: &str = "worker shut down before the job finished";
const STORE_BACKOFF_START: Duration = Duration::from_millis(100);
const STORE_BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Worker-wide defaults the executor falls back on.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub claim_timeout: Duration,
    pub claim_renew_interval: Duration,
    pub job_timeout: Duration,
    pub result_retention: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            claim_timeout: Duration::from_secs(60),
            claim_renew_interval: Duration::from_secs(20),
            job_timeout: Duration::from_secs(300),
            result_retention: Duration::from_secs(24 * 60 * 60),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// What the executor did with a job.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Complete,
    Retried { due_time: DateTime<Utc> },
    Failed { error: String },
    /// Forced shutdown put the job back without using up a try.
    Rescheduled,
    /// Another worker owns the job now; nothing was written.
    ClaimLost,
}

enum RunOutcome {
    Finished(std::result::Result<Value, JobError>),
    TimedOut(Duration),
    Aborted,
    Interrupted,
    ClaimLost,
}

#[derive(Clone)]
pub struct JobExecutor {
    store: Arc<dyn QueueStore>,
    registry: Arc<Registry>,
    serializer: Arc<dyn Serializer>,
    clock: Arc<dyn Clock>,
    worker_id: String,
    settings: ExecutorSettings,
    counters: Arc<JobCounters>,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn QueueStore>,
        registry: Arc<Registry>,
        serializer: Arc<dyn Serializer>,
        clock: Arc<dyn Clock>,
        worker_id: impl Into<String>,
        settings: ExecutorSettings,
        counters: Arc<JobCounters>,
    ) -> Self {
        Self {
            store,
            registry,
            serializer,
            clock,
            worker_id: worker_id.into(),
            settings,
            counters,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run `job`, which this worker has just claimed.
    ///
    /// `abort` fires when the job is aborted by id; `force` fires when the
    /// worker gives up waiting for in-flight jobs during shutdown.
    pub async fn execute(
        &self,
        job: Job,
        abort: CancellationToken,
        force: CancellationToken,
    ) -> ExecutionOutcome {
        let now = self.clock.now();
        let mut claim_deadline = add_duration(now, self.settings.claim_timeout);

        let abort_requested = match self.store.is_abort_requested(&job.id).await {
            Ok(requested) => requested,
            Err(e) => {
                warn!("Could not check abort marker for job {}: {}", job.id, e);
                false
            }
        };
        if abort.is_cancelled() || abort_requested {
            info!("Job {} was aborted before it started", job.id);
            return self
                .fail(&job, ABORTED_ERROR.to_string(), None, true, claim_deadline)
                .await;
        }

        if job.is_expired(now) {
            let error = MillworkError::Expired {
                job_id: job.id.to_string(),
            };
            info!("{}", error);
            return self
                .fail(&job, error.to_string(), None, true, claim_deadline)
                .await;
        }

        let Some(function) = self.registry.get(&job.function_name).cloned() else {
            let error = MillworkError::HandlerNotFound {
                function_name: job.function_name.clone(),
            };
            error!("Job {} cannot run: {}", job.id, error);
            return self
                .fail(&job, error.to_string(), None, true, claim_deadline)
                .await;
        };

        // Recovery only knows the job's own budget; the function cap is ours.
        let max_tries = function.effective_max_tries(job.max_tries);
        if job.try_count > max_tries {
            let error = format!("max tries ({}) exceeded", max_tries);
            warn!("Job {} not started: {}", job.id, error);
            return self
                .fail(&job, error, Some(&function), false, claim_deadline)
                .await;
        }

        let payload = match self.serializer.decode(&job.payload) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Job {} has an undecodable payload: {}", job.id, e);
                return self
                    .fail(&job, e.to_string(), Some(&function), true, claim_deadline)
                    .await;
            }
        };

        let cancellation = CancellationToken::new();
        let ctx = JobContext::new(
            job.id.clone(),
            job.function_name.clone(),
            payload.args,
            payload.kwargs,
            job.try_count,
            max_tries,
            job.enqueue_time,
            job.start_time.unwrap_or(now),
            self.worker_id.clone(),
            cancellation.clone(),
        );

        let timeout = job
            .timeout
            .or(function.timeout)
            .unwrap_or(self.settings.job_timeout);
        debug!(
            "Running job {} ({}) try {}/{} with timeout {:?}",
            job.id, job.function_name, job.try_count, job.max_tries, timeout
        );

        let outcome = self
            .run_handler(
                &job,
                &function,
                ctx,
                timeout,
                &abort,
                &force,
                &mut claim_deadline,
            )
            .await;
        cancellation.cancel();

        match outcome {
            RunOutcome::Finished(Ok(value)) => {
                self.complete(&job, &function, value, claim_deadline).await
            }
            RunOutcome::Finished(Err(JobError::Permanent { message })) => {
                warn!("Job {} failed permanently: {}", job.id, message);
                self.fail(&job, message, Some(&function), false, claim_deadline)
                    .await
            }
            RunOutcome::Finished(Err(JobError::Retry { defer, message })) => {
                self.retry_or_fail(&job, &function, message, defer, claim_deadline)
                    .await
            }
            RunOutcome::Finished(Err(JobError::Failed { message })) => {
                self.retry_or_fail(&job, &function, message, None, claim_deadline)
                    .await
            }
            RunOutcome::TimedOut(timeout) => {
                let error = MillworkError::Timeout { timeout };
                warn!("Job {} {}", job.id, error);
                self.retry_or_fail(&job, &function, error.to_string(), None, claim_deadline)
                    .await
            }
            RunOutcome::Aborted => {
                info!("Job {} aborted while running", job.id);
                self.fail(
                    &job,
                    ABORTED_ERROR.to_string(),
                    Some(&function),
                    false,
                    claim_deadline,
                )
                .await
            }
            RunOutcome::Interrupted => self.reschedule(&job, claim_deadline).await,
            RunOutcome::ClaimLost => {
                let error = MillworkError::ClaimLost {
                    job_id: job.id.to_string(),
                };
                warn!("{}; discarding the outcome", error);
                ExecutionOutcome::ClaimLost
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_handler(
        &self,
        job: &Job,
        function: &FunctionDef,
        ctx: JobContext,
        timeout: Duration,
        abort: &CancellationToken,
        force: &CancellationToken,
        claim_deadline: &mut DateTime<Utc>,
    ) -> RunOutcome {
        let handler = AssertUnwindSafe(function.call(ctx)).catch_unwind();
        tokio::pin!(handler);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let renew_every = self.settings.claim_renew_interval.max(Duration::from_millis(1));
        let mut renew = tokio::time::interval_at(Instant::now() + renew_every, renew_every);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = force.cancelled() => return RunOutcome::Interrupted,
                _ = abort.cancelled() => return RunOutcome::Aborted,
                result = &mut handler => {
                    return RunOutcome::Finished(result.unwrap_or_else(|_| {
                        error!("Handler for job {} panicked", job.id);
                        Err(JobError::failed("handler panicked"))
                    }));
                }
                _ = &mut deadline => return RunOutcome::TimedOut(timeout),
                _ = renew.tick() => {
                    let now = self.clock.now();
                    match self
                        .store
                        .renew_claim(&job.id, &self.worker_id, now, self.settings.claim_timeout)
                        .await
                    {
                        Ok(true) => {
                            *claim_deadline = add_duration(now, self.settings.claim_timeout);
                        }
                        Ok(false) => return RunOutcome::ClaimLost,
                        Err(e) => warn!("Failed to renew claim on job {}: {}", job.id, e),
                    }
                    if let Ok(true) = self.store.is_abort_requested(&job.id).await {
                        return RunOutcome::Aborted;
                    }
                }
            }
        }
    }

    async fn complete(
        &self,
        job: &Job,
        function: &FunctionDef,
        value: Value,
        claim_deadline: DateTime<Utc>,
    ) -> ExecutionOutcome {
        let encoded = match self.serializer.encode_result(&value) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("Job {} returned an unencodable result: {}", job.id, e);
                return self
                    .fail(job, e.to_string(), Some(function), false, claim_deadline)
                    .await;
            }
        };

        let result = JobResult::success(job, encoded, self.clock.now());
        let retention = self.retention(job, Some(function));
        let written = self
            .persist(job, claim_deadline, || {
                self.store
                    .finish(&job.id, &self.worker_id, &result, retention, false)
            })
            .await;

        match written {
            Some(true) => {
                self.counters.record_complete();
                debug!("Job {} completed", job.id);
                ExecutionOutcome::Complete
            }
            _ => self.lost(job),
        }
    }

    async fn retry_or_fail(
        &self,
        job: &Job,
        function: &FunctionDef,
        error: String,
        requested_delay: Option<Duration>,
        claim_deadline: DateTime<Utc>,
    ) -> ExecutionOutcome {
        let policy = match &function.retry_strategy {
            Some(strategy) => RetryPolicy::new(strategy.clone()),
            None => self.settings.retry_policy.clone(),
        };
        let now = self.clock.now();
        let max_tries = function.effective_max_tries(job.max_tries);

        match policy.decide(job.try_count, max_tries, now, requested_delay) {
            RetryDecision::Retry { due_time, delay } => {
                let written = self
                    .persist(job, claim_deadline, || {
                        self.store.retry(
                            &job.id,
                            &self.worker_id,
                            due_time,
                            now,
                            Some(error.as_str()),
                            false,
                        )
                    })
                    .await;
                match written {
                    Some(true) => {
                        self.counters.record_retried();
                        warn!(
                            "Job {} failed on try {}/{}, retrying in {:?}: {}",
                            job.id, job.try_count, max_tries, delay, error
                        );
                        ExecutionOutcome::Retried { due_time }
                    }
                    _ => self.lost(job),
                }
            }
            RetryDecision::Exhausted => {
                warn!(
                    "Job {} failed after {} tries: {}",
                    job.id, job.try_count, error
                );
                self.fail(job, error, Some(function), false, claim_deadline)
                    .await
            }
        }
    }

    async fn fail(
        &self,
        job: &Job,
        error: String,
        function: Option<&FunctionDef>,
        refund_try: bool,
        claim_deadline: DateTime<Utc>,
    ) -> ExecutionOutcome {
        let result = JobResult::failure(job, error.clone(), self.clock.now());
        let retention = self.retention(job, function);
        let written = self
            .persist(job, claim_deadline, || {
                self.store
                    .finish(&job.id, &self.worker_id, &result, retention, refund_try)
            })
            .await;

        match written {
            Some(true) => {
                self.counters.record_failed();
                ExecutionOutcome::Failed { error }
            }
            _ => self.lost(job),
        }
    }

    async fn reschedule(&self, job: &Job, claim_deadline: DateTime<Utc>) -> ExecutionOutcome {
        let now = self.clock.now();
        let written = self
            .persist(job, claim_deadline, || {
                self.store.retry(
                    &job.id,
                    &self.worker_id,
                    now,
                    now,
                    Some(SHUTDOWN_ERROR),
                    true,
                )
            })
            .await;

        match written {
            Some(true) => {
                info!("Job {} put back on the queue for shutdown", job.id);
                ExecutionOutcome::Rescheduled
            }
            _ => self.lost(job),
        }
    }

    fn lost(&self, job: &Job) -> ExecutionOutcome {
        warn!(
            "Worker {} no longer holds the claim on job {}",
            self.worker_id, job.id
        );
        ExecutionOutcome::ClaimLost
    }

    fn retention(&self, job: &Job, function: Option<&FunctionDef>) -> Duration {
        job.keep_result
            .or_else(|| function.and_then(|f| f.keep_result))
            .unwrap_or(self.settings.result_retention)
    }

    /// Apply a bookkeeping write, retrying store errors with backoff until it
    /// lands or the claim would have lapsed anyway. `None` means it never landed.
    async fn persist<F, Fut>(
        &self,
        job: &Job,
        claim_deadline: DateTime<Utc>,
        mut write: F,
    ) -> Option<bool>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let mut backoff = STORE_BACKOFF_START;
        loop {
            match write().await {
                Ok(applied) => return Some(applied),
                Err(e) if e.is_store_unavailable() && self.clock.now() < claim_deadline => {
                    warn!(
                        "Store write for job {} failed, retrying in {:?}: {}",
                        job.id, backoff, e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(STORE_BACKOFF_MAX);
                }
                Err(e) => {
                    error!("Giving up on store write for job {}: {}", job.id, e);
                    return None;
                }
            }
        }
    }
}
