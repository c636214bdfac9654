//! The worker process: poll loop, executor tasks and their peers.
//!
//! A [`Worker`] runs four kinds of task on one runtime:
//!
//! - the poll loop, which recovers expired claims, reads due ids and claims as
//!   many as the concurrency limiter allows;
//! - one executor task per claimed job, collected in a `JoinSet`;
//! - a notification listener that wakes the poll loop early and forwards
//!   abort requests to running jobs;
//! - the heartbeat reporter and, when recurring jobs are configured, the cron
//!   scheduler.
//!
//! # Examples
//!
//! ```rust,no_run
//! use millwork::{config::WorkerConfig, queue::MemoryStore, registry::Registry, worker::Worker};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> millwork::Result<()> {
//! let registry = Registry::new().register("send_email", |ctx| async move {
//!     let to: String = ctx.arg(0)?;
//!     Ok(json!({ "sent_to": to }))
//! });
//!
//! let worker = Worker::new(Arc::new(MemoryStore::new()), registry, WorkerConfig::default());
//! let shutdown = worker.shutdown_token();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     shutdown.cancel();
//! });
//! worker.run().await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    Result,
    clock::{self, Clock},
    config::{CronConfig, MillworkConfig, WorkerConfig},
    cron::{CronScheduler, RecurringJob},
    executor::{ExecutorSettings, JobExecutor},
    health::{HealthReporter, JobCounters},
    job::JobId,
    limiter::{ConcurrencyLimiter, JobSlot},
    queue::{self, JobQueue, Notification, QueueStore},
    registry::Registry,
    retry::RetryPolicy,
    serializer::Serializer,
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, Notify, broadcast::error::RecvError},
    task::{JoinError, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use crate::health::WorkerSummary;

const MAX_STORE_BACKOFF: Duration = Duration::from_secs(30);
/// How long force-cancelled jobs get to reschedule themselves before their
/// tasks are aborted.
const FORCED_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

type InFlight = Arc<Mutex<HashMap<JobId, CancellationToken>>>;

pub struct Worker {
    queue: JobQueue,
    registry: Arc<Registry>,
    config: WorkerConfig,
    cron_config: CronConfig,
    cron_jobs: Vec<RecurringJob>,
    worker_id: String,
    clock: Arc<dyn Clock>,
    limiter: ConcurrencyLimiter,
    counters: Arc<JobCounters>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(store: Arc<dyn QueueStore>, registry: Registry, config: WorkerConfig) -> Self {
        let worker_id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4().simple()));
        let queue = JobQueue::new(store)
            .with_default_max_tries(config.default_max_tries)
            .with_unique_policy(config.unique_policy);

        Self {
            queue,
            registry: Arc::new(registry),
            limiter: ConcurrencyLimiter::new(config.max_jobs),
            config,
            cron_config: CronConfig::default(),
            cron_jobs: Vec::new(),
            worker_id,
            clock: clock::system(),
            counters: Arc::new(JobCounters::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Connect to the configured store and build a worker from the full config.
    pub async fn from_config(config: &MillworkConfig, registry: Registry) -> Result<Self> {
        config.validate()?;
        let store = queue::connect(&config.store).await?;
        Ok(Self::new(store, registry, config.worker.clone()).with_cron_config(config.cron.clone()))
    }

    pub fn with_cron_jobs(mut self, jobs: Vec<RecurringJob>) -> Self {
        self.cron_jobs = jobs;
        self
    }

    pub fn with_cron_config(mut self, config: CronConfig) -> Self {
        self.cron_config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.queue = self.queue.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.queue = self.queue.with_serializer(serializer);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Client over the same store, clock and serializer as this worker.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn recurring_jobs(&self) -> &[RecurringJob] {
        &self.cron_jobs
    }

    /// Counters so far; the same numbers the heartbeat reports.
    pub fn summary(&self) -> WorkerSummary {
        self.counters.snapshot()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop claiming; in-flight jobs get the grace period to finish.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run until shut down, or until drained if `burst` is configured.
    pub async fn run(&self) -> Result<WorkerSummary> {
        if self.config.burst {
            return self.run_burst().await;
        }
        self.run_loop(false).await
    }

    /// Process due jobs until the queue is empty and nothing is running, or
    /// `max_burst_jobs` have been claimed. Recurring jobs are not scheduled.
    pub async fn run_burst(&self) -> Result<WorkerSummary> {
        self.run_loop(true).await
    }

    fn executor(&self) -> JobExecutor {
        let settings = ExecutorSettings {
            claim_timeout: self.config.claim_timeout,
            claim_renew_interval: self.config.renew_interval(),
            job_timeout: self.config.job_timeout,
            result_retention: self.config.result_retention,
            retry_policy: RetryPolicy::new(self.config.retry_strategy.clone()),
        };
        JobExecutor::new(
            self.queue.store().clone(),
            self.registry.clone(),
            self.queue.serializer().clone(),
            self.clock.clone(),
            self.worker_id.clone(),
            settings,
            self.counters.clone(),
        )
    }

    async fn run_loop(&self, burst: bool) -> Result<WorkerSummary> {
        info!(
            "Worker {} started: {} slots, functions [{}]{}",
            self.worker_id,
            self.limiter.capacity(),
            self.registry.names().join(", "),
            if burst { " in burst mode" } else { "" }
        );

        let executor = self.executor();
        let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));
        let wake = Arc::new(Notify::new());
        let force = CancellationToken::new();
        let background_stop = CancellationToken::new();
        let background = self.spawn_background(burst, &in_flight, &wake, &background_stop);

        let mut tasks = JoinSet::new();
        let mut backoff = self.config.poll_delay;

        while !self.shutdown.is_cancelled() {
            while let Some(joined) = tasks.try_join_next() {
                log_join(joined);
            }
            if burst && self.burst_limit_reached() {
                info!("Worker {} reached its burst job limit", self.worker_id);
                break;
            }

            let claimed = match self
                .poll_once(burst, &executor, &mut tasks, &in_flight, &force)
                .await
            {
                Ok(claimed) => {
                    backoff = self.config.poll_delay;
                    claimed
                }
                Err(e) => {
                    warn!(
                        "Worker {} poll failed, retrying in {:?}: {}",
                        self.worker_id, backoff, e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.shutdown.cancelled() => {}
                    }
                    backoff = (backoff * 2).min(MAX_STORE_BACKOFF);
                    continue;
                }
            };
            if claimed > 0 {
                continue;
            }

            if burst && tasks.is_empty() {
                match self.queue.queued_count().await {
                    Ok(0) => {
                        info!("Worker {} drained the queue", self.worker_id);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Worker {} could not read queue size: {}", self.worker_id, e),
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_delay) => {}
                _ = wake.notified() => debug!("Worker {} woken by notification", self.worker_id),
                _ = self.shutdown.cancelled() => {}
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_join(joined),
            }
        }

        self.drain(&mut tasks, &force, burst && !self.shutdown.is_cancelled())
            .await;

        background_stop.cancel();
        for handle in background {
            if let Err(e) = handle.await {
                warn!("Worker {} background task ended badly: {}", self.worker_id, e);
            }
        }

        let summary = self.counters.snapshot();
        info!(
            "Worker {} stopped: {} claimed, {} complete, {} failed, {} retried",
            self.worker_id, summary.claimed, summary.complete, summary.failed, summary.retried
        );
        Ok(summary)
    }

    /// One pass of the poll loop. Returns how many jobs were claimed.
    async fn poll_once(
        &self,
        burst: bool,
        executor: &JobExecutor,
        tasks: &mut JoinSet<()>,
        in_flight: &InFlight,
        force: &CancellationToken,
    ) -> Result<usize> {
        let store = self.queue.store();
        let recovered = store
            .recover_expired_claims(self.clock.now(), self.config.result_retention)
            .await?;
        if !recovered.is_empty() {
            warn!(
                "Recovered expired claims: {} requeued, {} failed",
                recovered.requeued.len(),
                recovered.failed.len()
            );
        }

        if self.shutdown.is_cancelled() || self.limiter.is_saturated() {
            return Ok(0);
        }

        let due = store
            .due_jobs(self.clock.now(), self.config.read_limit())
            .await?;
        let mut claimed = 0;
        for job_id in due {
            if self.shutdown.is_cancelled() || (burst && self.burst_limit_reached()) {
                break;
            }
            let Some(slot) = self.limiter.try_acquire() else {
                break;
            };

            let claim = store
                .claim(
                    &job_id,
                    &self.worker_id,
                    self.clock.now(),
                    self.config.claim_timeout,
                )
                .await?;
            let Some(job) = claim else {
                debug!("Job {} was claimed elsewhere", job_id);
                continue;
            };

            self.counters.record_claimed();
            claimed += 1;
            debug!("Worker {} claimed job {}", self.worker_id, job.id);

            let abort = CancellationToken::new();
            in_flight.lock().await.insert(job.id.clone(), abort.clone());
            tasks.spawn(run_job(
                executor.clone(),
                job,
                slot,
                abort,
                force.clone(),
                in_flight.clone(),
            ));
        }
        Ok(claimed)
    }

    fn burst_limit_reached(&self) -> bool {
        self.config
            .max_burst_jobs
            .is_some_and(|limit| self.counters.snapshot().claimed >= limit)
    }

    /// Wait for running jobs. Outside burst mode they get the grace period,
    /// then forced cancellation, then their tasks are aborted.
    async fn drain(&self, tasks: &mut JoinSet<()>, force: &CancellationToken, wait_forever: bool) {
        if tasks.is_empty() {
            return;
        }
        if wait_forever {
            while let Some(joined) = tasks.join_next().await {
                log_join(joined);
            }
            return;
        }

        info!(
            "Worker {} waiting up to {:?} for {} running jobs",
            self.worker_id,
            self.config.shutdown_grace_period,
            tasks.len()
        );
        if drain_within(tasks, self.config.shutdown_grace_period).await {
            return;
        }

        warn!(
            "Worker {} forcing {} jobs to stop",
            self.worker_id,
            tasks.len()
        );
        force.cancel();
        if drain_within(tasks, FORCED_DRAIN_TIMEOUT).await {
            return;
        }

        error!(
            "Worker {} aborting {} jobs that ignored cancellation",
            self.worker_id,
            tasks.len()
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    fn spawn_background(
        &self,
        burst: bool,
        in_flight: &InFlight,
        wake: &Arc<Notify>,
        stop: &CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        handles.push(tokio::spawn(listen(
            self.queue.store().clone(),
            in_flight.clone(),
            wake.clone(),
            stop.clone(),
        )));

        let reporter = HealthReporter::new(
            self.queue.store().clone(),
            self.clock.clone(),
            self.worker_id.clone(),
            self.config.health_check_interval,
            self.counters.clone(),
            self.limiter.clone(),
        );
        handles.push(tokio::spawn(reporter.run(stop.clone())));

        if !burst && !self.cron_jobs.is_empty() {
            let scheduler =
                CronScheduler::new(self.cron_jobs.clone(), self.cron_config.catch_up_window);
            handles.push(tokio::spawn(run_cron(
                scheduler,
                self.queue.clone(),
                self.cron_config.tick_interval,
                stop.clone(),
            )));
        }
        handles
    }
}

async fn run_job(
    executor: JobExecutor,
    job: crate::job::Job,
    slot: JobSlot,
    abort: CancellationToken,
    force: CancellationToken,
    in_flight: InFlight,
) {
    let job_id = job.id.clone();
    let outcome = executor.execute(job, abort, force).await;
    debug!("Job {} finished: {:?}", job_id, outcome);
    in_flight.lock().await.remove(&job_id);
    drop(slot);
}

async fn listen(
    store: Arc<dyn QueueStore>,
    in_flight: InFlight,
    wake: Arc<Notify>,
    stop: CancellationToken,
) {
    let mut notifications = store.subscribe();
    loop {
        let received = tokio::select! {
            received = notifications.recv() => received,
            _ = stop.cancelled() => break,
        };
        match received {
            Ok(Notification::Wake) => wake.notify_one(),
            Ok(Notification::Abort(job_id)) => {
                if let Some(token) = in_flight.lock().await.get(&job_id) {
                    info!("Abort requested for running job {}", job_id);
                    token.cancel();
                }
            }
            Err(RecvError::Lagged(missed)) => {
                debug!("Missed {} notifications", missed);
                wake.notify_one();
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn run_cron(
    mut scheduler: CronScheduler,
    queue: JobQueue,
    tick_interval: Duration,
    stop: CancellationToken,
) {
    info!(
        "Cron scheduler started with {} recurring jobs",
        scheduler.jobs().len()
    );
    loop {
        if let Err(e) = scheduler.tick(&queue).await {
            warn!("Cron tick failed: {}", e);
        }
        tokio::select! {
            _ = tokio::time::sleep(tick_interval) => {}
            _ = stop.cancelled() => break,
        }
    }
}

async fn drain_within(tasks: &mut JoinSet<()>, limit: Duration) -> bool {
    let drained = tokio::time::timeout(limit, async {
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
    })
    .await;
    drained.is_ok()
}

fn log_join(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("Job task panicked: {}", e);
        }
    }
}
