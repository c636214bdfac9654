//! Shared store interface and the producer-side queue client.
//!
//! Every piece of coordination state (job records, the due-time index, claim
//! locks, results, abort markers, heartbeats) lives behind the [`QueueStore`]
//! trait. Each trait method that touches more than one key is a single atomic
//! store operation, which is what lets any number of producers and workers
//! share one store without talking to each other.
//!
//! Two adapters ship with the crate: [`MemoryStore`] for tests and single
//! process use, and `RedisStore` (feature `redis`) where every multi-key
//! transition is one Lua script.

use crate::{
    Result,
    clock::{self, Clock},
    config::StoreConfig,
    health::Heartbeat,
    job::{EnqueueOptions, Job, JobId, JobPayload, JobResult, JobStatus, add_duration},
    serializer::{self, Serializer},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryStore;

#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// What to do when an enqueue carries a unique key already held by a pending job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UniquePolicy {
    /// Move the pending job to the new due time and payload.
    #[default]
    Replace,
    /// Leave the pending job alone and reject the new one.
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The job id already has a record, or the unique key is held and the
    /// policy is [`UniquePolicy::Reject`].
    Duplicate,
    /// The unique key belongs to a job that is currently running.
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(JobId),
    /// An existing pending job with the same unique key was updated in place.
    Replaced(JobId),
    Rejected(RejectReason),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            EnqueueOutcome::Enqueued(id) | EnqueueOutcome::Replaced(id) => Some(id),
            EnqueueOutcome::Rejected(_) => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, EnqueueOutcome::Rejected(_))
    }
}

/// Ownership of a claimed job. Expiry is what hands a crashed worker's job back
/// to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimLock {
    pub job_id: JobId,
    pub owner_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Messages fanned out to every worker on the store's pub/sub channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// New work may be due; skip the rest of the poll delay.
    Wake,
    /// Stop the job if it is running here.
    Abort(JobId),
}

impl Notification {
    const WAKE: &'static str = "wake";
    const ABORT_PREFIX: &'static str = "abort:";

    pub fn encode(&self) -> String {
        match self {
            Notification::Wake => Self::WAKE.to_string(),
            Notification::Abort(job_id) => format!("{}{}", Self::ABORT_PREFIX, job_id),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        if raw == Self::WAKE {
            return Some(Notification::Wake);
        }
        raw.strip_prefix(Self::ABORT_PREFIX)
            .filter(|id| !id.is_empty())
            .map(|id| Notification::Abort(JobId::from(id)))
    }
}

/// Jobs handled by one [`QueueStore::recover_expired_claims`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Put back into the due-time index.
    pub requeued: Vec<JobId>,
    /// Already on their final attempt; failed instead.
    pub failed: Vec<JobId>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

/// Open the store named by `config`: `memory://` for an in-process store,
/// otherwise a Redis URL.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn QueueStore>> {
    if config.is_memory() {
        return Ok(Arc::new(MemoryStore::new()));
    }

    #[cfg(feature = "redis")]
    {
        let store = RedisStore::from_config(config).await?;
        info!("Connected to store at {} (namespace {})", config.url, config.namespace);
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "redis"))]
    {
        Err(crate::MillworkError::Config(format!(
            "store url {} needs the `redis` feature",
            config.url
        )))
    }
}

pub(crate) const CLAIM_EXPIRED_ERROR: &str = "claim expired after final attempt";

/// Atomic operations over the shared store.
///
/// Implementations must make every method a single atomic step against the
/// store: no other caller may observe or interleave with a half-applied
/// transition.
#[async_trait]
pub trait QueueStore: Send + Sync + fmt::Debug {
    /// Insert a new job, resolving job id and unique key collisions.
    ///
    /// The record write, index insert and unique mapping happen together.
    async fn enqueue(&self, job: Job, policy: UniquePolicy) -> Result<EnqueueOutcome>;

    /// Up to `limit` ids with a due time at or before `now`, ordered by due
    /// time then id.
    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>>;

    /// Claim a due job for `worker_id`.
    ///
    /// Returns `None` if the job is no longer in the index or another worker
    /// holds an unexpired lock. On success the job has left the index, holds a
    /// lock until `now + claim_timeout`, is `InProgress` and has its try count
    /// incremented.
    async fn claim(
        &self,
        job_id: &JobId,
        worker_id: &str,
        now: DateTime<Utc>,
        claim_timeout: Duration,
    ) -> Result<Option<Job>>;

    /// Push the lock expiry to `now + claim_timeout`. `false` means the lock
    /// lapsed or belongs to someone else.
    async fn renew_claim(
        &self,
        job_id: &JobId,
        worker_id: &str,
        now: DateTime<Utc>,
        claim_timeout: Duration,
    ) -> Result<bool>;

    async fn claim_lock(&self, job_id: &JobId) -> Result<Option<ClaimLock>>;

    /// Record a terminal outcome: result stored for `retention`, record made
    /// terminal, lock and unique mapping released. A no-op returning `false`
    /// unless `worker_id` still holds the lock.
    async fn finish(
        &self,
        job_id: &JobId,
        worker_id: &str,
        result: &JobResult,
        retention: Duration,
        refund_try: bool,
    ) -> Result<bool>;

    /// Return a claimed job to the index at `due_time` and release its lock.
    /// A no-op returning `false` unless `worker_id` still holds the lock.
    async fn retry(
        &self,
        job_id: &JobId,
        worker_id: &str,
        due_time: DateTime<Utc>,
        now: DateTime<Utc>,
        error: Option<&str>,
        refund_try: bool,
    ) -> Result<bool>;

    /// Hand back every claimed job whose lock lapsed at or before `now`.
    ///
    /// Jobs with tries left go back into the index as `Queued`; the rest are
    /// failed, with their result kept for `retention` unless the job overrides it.
    async fn recover_expired_claims(
        &self,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Result<RecoveryReport>;

    async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>>;

    async fn get_result(&self, job_id: &JobId) -> Result<Option<JobResult>>;

    /// Every job in the due-time index, soonest first.
    async fn queued_jobs(&self) -> Result<Vec<Job>>;

    async fn queued_count(&self) -> Result<usize>;

    async fn results(&self) -> Result<Vec<JobResult>>;

    /// Set the abort marker for `job_id` for `ttl`. `false` if the job has no
    /// record or is already terminal.
    async fn request_abort(&self, job_id: &JobId, ttl: Duration) -> Result<bool>;

    async fn is_abort_requested(&self, job_id: &JobId) -> Result<bool>;

    async fn publish(&self, notification: Notification) -> Result<()>;

    /// Receive notifications published by any client of this store.
    fn subscribe(&self) -> broadcast::Receiver<Notification>;

    async fn write_heartbeat(&self, heartbeat: &Heartbeat, ttl: Duration) -> Result<()>;

    async fn get_heartbeat(&self, worker_id: &str) -> Result<Option<Heartbeat>>;

    async fn heartbeats(&self) -> Result<Vec<Heartbeat>>;
}

/// Producer and administrative client.
///
/// # Examples
///
/// ```rust
/// use millwork::queue::{JobQueue, MemoryStore};
/// use millwork::job::{EnqueueOptions, JobPayload};
/// use std::{sync::Arc, time::Duration};
///
/// # #[tokio::main]
/// # async fn main() -> millwork::Result<()> {
/// let queue = JobQueue::new(Arc::new(MemoryStore::new()));
/// let outcome = queue
///     .enqueue(
///         "send_email",
///         JobPayload::new().arg("alice@example.com"),
///         EnqueueOptions::new().defer_by(Duration::from_secs(30)),
///     )
///     .await?;
/// assert!(outcome.job_id().is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct JobQueue {
    store: Arc<dyn QueueStore>,
    serializer: Arc<dyn Serializer>,
    clock: Arc<dyn Clock>,
    default_max_tries: u32,
    unique_policy: UniquePolicy,
    abort_ttl: Duration,
}

impl JobQueue {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            serializer: serializer::default_serializer(),
            clock: clock::system(),
            default_max_tries: 5,
            unique_policy: UniquePolicy::default(),
            abort_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_default_max_tries(mut self, max_tries: u32) -> Self {
        self.default_max_tries = max_tries.max(1);
        self
    }

    pub fn with_unique_policy(mut self, policy: UniquePolicy) -> Self {
        self.unique_policy = policy;
        self
    }

    /// How long an abort marker outlives the request.
    pub fn with_abort_ttl(mut self, ttl: Duration) -> Self {
        self.abort_ttl = ttl;
        self
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn enqueue(
        &self,
        function_name: &str,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome> {
        let now = self.clock.now();
        let job = self.build_job(function_name, &payload, &options, now)?;
        let job_id = job.id.clone();

        let outcome = self.store.enqueue(job, self.unique_policy).await?;
        match &outcome {
            EnqueueOutcome::Enqueued(id) => {
                debug!("Enqueued job {} ({})", id, function_name);
            }
            EnqueueOutcome::Replaced(id) => {
                debug!("Replaced pending job {} ({}) by unique key", id, function_name);
            }
            EnqueueOutcome::Rejected(reason) => {
                debug!(
                    "Rejected job {} ({}): {:?}",
                    job_id, function_name, reason
                );
                return Ok(outcome);
            }
        }

        if let Err(e) = self.store.publish(Notification::Wake).await {
            warn!("Job {} enqueued but the wake notice failed: {}", job_id, e);
        }
        Ok(outcome)
    }

    fn build_job(
        &self,
        function_name: &str,
        payload: &JobPayload,
        options: &EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let encoded = self.serializer.encode(payload)?;
        let job_id = options.job_id.clone().unwrap_or_else(JobId::generate);
        let max_tries = options.max_tries.unwrap_or(self.default_max_tries);

        let mut job = Job::new(
            job_id,
            function_name,
            encoded,
            now,
            options.due_time(now),
            max_tries,
        );
        job.unique_key = options.unique_key.clone();
        job.timeout = options.timeout;
        job.keep_result = options.keep_result;
        job.expires_at = options.expires.map(|expires| add_duration(now, expires));
        Ok(job)
    }

    /// Ask whichever worker holds `job_id` to stop it, or prevent it from
    /// starting if it is still pending. `false` if the job is unknown or finished.
    pub async fn abort(&self, job_id: &JobId) -> Result<bool> {
        let requested = self.store.request_abort(job_id, self.abort_ttl).await?;
        if requested {
            info!("Abort requested for job {}", job_id);
            if let Err(e) = self.store.publish(Notification::Abort(job_id.clone())).await {
                warn!("Abort notice for job {} failed: {}", job_id, e);
            }
        }
        Ok(requested)
    }

    /// Current status from the record, falling back to a retained result.
    pub async fn status(&self, job_id: &JobId) -> Result<Option<JobStatus>> {
        if let Some(job) = self.store.get_job(job_id).await? {
            return Ok(Some(job.status));
        }
        Ok(self
            .store
            .get_result(job_id)
            .await?
            .map(|result| result.status()))
    }

    pub async fn job(&self, job_id: &JobId) -> Result<Option<Job>> {
        self.store.get_job(job_id).await
    }

    pub async fn result(&self, job_id: &JobId) -> Result<Option<JobResult>> {
        self.store.get_result(job_id).await
    }

    /// The decoded return value of a successfully completed job.
    pub async fn result_value(&self, job_id: &JobId) -> Result<Option<Value>> {
        match self.store.get_result(job_id).await? {
            Some(JobResult {
                result: Some(bytes),
                ..
            }) => Ok(Some(self.serializer.decode_result(&bytes)?)),
            _ => Ok(None),
        }
    }

    pub async fn queued_jobs(&self) -> Result<Vec<Job>> {
        self.store.queued_jobs().await
    }

    pub async fn queued_count(&self) -> Result<usize> {
        self.store.queued_count().await
    }

    pub async fn results(&self) -> Result<Vec<JobResult>> {
        self.store.results().await
    }

    pub async fn heartbeat(&self, worker_id: &str) -> Result<Option<Heartbeat>> {
        self.store.get_heartbeat(worker_id).await
    }

    pub async fn heartbeats(&self) -> Result<Vec<Heartbeat>> {
        self.store.heartbeats().await
    }
}
