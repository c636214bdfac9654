#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use millwork::{
    EnqueueOutcome, Heartbeat, Job, JobId, JobQueue, JobResult, MemoryStore, MillworkError,
    MockClock, Notification, QueueStore, Registry, RetryStrategy, UniquePolicy,
    config::WorkerConfig,
    queue::{ClaimLock, RecoveryReport},
};
use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::broadcast;

/// Store and queue sharing one mock clock.
pub fn mock_setup() -> (MockClock, Arc<MemoryStore>, JobQueue) {
    let clock = MockClock::new();
    let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let queue = JobQueue::new(store.clone()).with_clock(Arc::new(clock.clone()));
    (clock, store, queue)
}

pub fn memory_setup() -> (Arc<MemoryStore>, JobQueue) {
    let store = Arc::new(MemoryStore::new());
    let queue = JobQueue::new(store.clone());
    (store, queue)
}

/// Worker settings tuned for tests: short poll delay, quick retries.
pub fn fast_config() -> WorkerConfig {
    WorkerConfig {
        max_jobs: 4,
        poll_delay: Duration::from_millis(10),
        claim_timeout: Duration::from_secs(5),
        health_check_interval: Duration::from_millis(100),
        shutdown_grace_period: Duration::from_millis(200),
        retry_strategy: RetryStrategy::fixed(Duration::from_millis(5)),
        ..Default::default()
    }
}

pub fn empty_registry() -> Registry {
    Registry::new()
}

/// Poll `check` until it returns true or five seconds pass.
pub async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Store operations that [`FlakyStore`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Enqueue,
    DueJobs,
    Claim,
    Finish,
    Retry,
    Publish,
}

/// A [`MemoryStore`] whose chosen operations fail with `StoreUnavailable` a
/// set number of times before going through.
#[derive(Debug)]
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    pending_failures: Mutex<HashMap<StoreOp, u32>>,
    failed: Mutex<HashMap<StoreOp, u32>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            pending_failures: Mutex::new(HashMap::new()),
            failed: Mutex::new(HashMap::new()),
        }
    }

    pub fn fail_next(&self, op: StoreOp, times: u32) {
        *self.pending_failures.lock().unwrap().entry(op).or_default() += times;
    }

    /// How many calls to `op` were failed so far.
    pub fn failures(&self, op: StoreOp) -> u32 {
        self.failed.lock().unwrap().get(&op).copied().unwrap_or(0)
    }

    fn trip(&self, op: StoreOp) -> millwork::Result<()> {
        let mut pending = self.pending_failures.lock().unwrap();
        match pending.get_mut(&op) {
            Some(left) if *left > 0 => {
                *left -= 1;
                *self.failed.lock().unwrap().entry(op).or_default() += 1;
                Err(MillworkError::StoreUnavailable {
                    message: format!("{:?} refused", op),
                })
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl QueueStore for FlakyStore {
    async fn enqueue(&self, job: Job, policy: UniquePolicy) -> millwork::Result<EnqueueOutcome> {
        self.trip(StoreOp::Enqueue)?;
        self.inner.enqueue(job, policy).await
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> millwork::Result<Vec<JobId>> {
        self.trip(StoreOp::DueJobs)?;
        self.inner.due_jobs(now, limit).await
    }

    async fn claim(
        &self,
        job_id: &JobId,
        worker_id: &str,
        now: DateTime<Utc>,
        claim_timeout: Duration,
    ) -> millwork::Result<Option<Job>> {
        self.trip(StoreOp::Claim)?;
        self.inner.claim(job_id, worker_id, now, claim_timeout).await
    }

    async fn renew_claim(
        &self,
        job_id: &JobId,
        worker_id: &str,
        now: DateTime<Utc>,
        claim_timeout: Duration,
    ) -> millwork::Result<bool> {
        self.inner.renew_claim(job_id, worker_id, now, claim_timeout).await
    }

    async fn claim_lock(&self, job_id: &JobId) -> millwork::Result<Option<ClaimLock>> {
        self.inner.claim_lock(job_id).await
    }

    async fn finish(
        &self,
        job_id: &JobId,
        worker_id: &str,
        result: &JobResult,
        retention: Duration,
        refund_try: bool,
    ) -> millwork::Result<bool> {
        self.trip(StoreOp::Finish)?;
        self.inner
            .finish(job_id, worker_id, result, retention, refund_try)
            .await
    }

    async fn retry(
        &self,
        job_id: &JobId,
        worker_id: &str,
        due_time: DateTime<Utc>,
        now: DateTime<Utc>,
        error: Option<&str>,
        refund_try: bool,
    ) -> millwork::Result<bool> {
        self.trip(StoreOp::Retry)?;
        self.inner
            .retry(job_id, worker_id, due_time, now, error, refund_try)
            .await
    }

    async fn recover_expired_claims(
        &self,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> millwork::Result<RecoveryReport> {
        self.inner.recover_expired_claims(now, retention).await
    }

    async fn get_job(&self, job_id: &JobId) -> millwork::Result<Option<Job>> {
        self.inner.get_job(job_id).await
    }

    async fn get_result(&self, job_id: &JobId) -> millwork::Result<Option<JobResult>> {
        self.inner.get_result(job_id).await
    }

    async fn queued_jobs(&self) -> millwork::Result<Vec<Job>> {
        self.inner.queued_jobs().await
    }

    async fn queued_count(&self) -> millwork::Result<usize> {
        self.inner.queued_count().await
    }

    async fn results(&self) -> millwork::Result<Vec<JobResult>> {
        self.inner.results().await
    }

    async fn request_abort(&self, job_id: &JobId, ttl: Duration) -> millwork::Result<bool> {
        self.inner.request_abort(job_id, ttl).await
    }

    async fn is_abort_requested(&self, job_id: &JobId) -> millwork::Result<bool> {
        self.inner.is_abort_requested(job_id).await
    }

    async fn publish(&self, notification: Notification) -> millwork::Result<()> {
        self.trip(StoreOp::Publish)?;
        self.inner.publish(notification).await
    }

    fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.subscribe()
    }

    async fn write_heartbeat(&self, heartbeat: &Heartbeat, ttl: Duration) -> millwork::Result<()> {
        self.inner.write_heartbeat(heartbeat, ttl).await
    }

    async fn get_heartbeat(&self, worker_id: &str) -> millwork::Result<Option<Heartbeat>> {
        self.inner.get_heartbeat(worker_id).await
    }

    async fn heartbeats(&self) -> millwork::Result<Vec<Heartbeat>> {
        self.inner.heartbeats().await
    }
}
