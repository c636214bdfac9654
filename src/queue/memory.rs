//! In-process [`QueueStore`].
//!
//! All state sits behind one mutex, so every trait method is trivially atomic.
//! Expiring entries (claim locks, retained records and results, abort markers,
//! heartbeats) carry their deadline and are purged lazily against the store's
//! [`Clock`], which lets tests drive expiry with a `MockClock`.
//!
//! # Examples
//!
//! ```rust
//! use millwork::clock::MockClock;
//! use millwork::queue::{MemoryStore, QueueStore};
//! use std::sync::Arc;
//!
//! let clock = MockClock::new();
//! let store = MemoryStore::with_clock(Arc::new(clock.clone()));
//! let shared = store.clone(); // clones share the same state
//! # let _ = shared;
//! ```

use crate::{
    Result,
    clock::{self, Clock},
    health::Heartbeat,
    job::{Job, JobId, JobResult, JobStatus, add_duration, to_millis},
    queue::{
        CLAIM_EXPIRED_ERROR, ClaimLock, EnqueueOutcome, Notification, QueueStore, RecoveryReport,
        RejectReason, UniquePolicy,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Expiring<T> {
    value: T,
    expires_at: Option<DateTime<Utc>>,
}

impl<T> Expiring<T> {
    fn forever(value: T) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn until(value: T, expires_at: DateTime<Utc>) -> Self {
        Self {
            value,
            expires_at: Some(expires_at),
        }
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<JobId, Expiring<Job>>,
    /// Due-time index: (due time ms, id) for every deferred or queued job.
    index: BTreeSet<(i64, JobId)>,
    /// (lock expiry ms, id) for every claimed job.
    in_flight: BTreeSet<(i64, JobId)>,
    locks: HashMap<JobId, ClaimLock>,
    results: HashMap<JobId, Expiring<JobResult>>,
    unique: HashMap<String, JobId>,
    aborts: HashMap<JobId, DateTime<Utc>>,
    heartbeats: HashMap<String, Expiring<Heartbeat>>,
}

impl MemoryState {
    fn purge(&mut self, now: DateTime<Utc>) {
        self.jobs.retain(|_, job| job.is_live(now));
        self.results.retain(|_, result| result.is_live(now));
        self.aborts.retain(|_, expires_at| *expires_at > now);
        self.heartbeats.retain(|_, heartbeat| heartbeat.is_live(now));
        // Locks stay until recovery or release; their expiry is checked on use.
    }

    fn live_lock(&self, job_id: &JobId, now: DateTime<Utc>) -> Option<&ClaimLock> {
        self.locks.get(job_id).filter(|lock| lock.expires_at > now)
    }

    fn owns_lock(&self, job_id: &JobId, worker_id: &str, now: DateTime<Utc>) -> bool {
        self.live_lock(job_id, now)
            .is_some_and(|lock| lock.owner_id == worker_id)
    }

    fn release_lock(&mut self, job_id: &JobId) {
        if let Some(lock) = self.locks.remove(job_id) {
            self.in_flight
                .remove(&(to_millis(lock.expires_at), job_id.clone()));
        }
    }

    fn release_unique(&mut self, job: &Job) {
        if let Some(key) = &job.unique_key {
            if self.unique.get(key) == Some(&job.id) {
                self.unique.remove(key);
            }
        }
    }

    fn store_outcome(
        &mut self,
        job_id: &JobId,
        result: JobResult,
        now: DateTime<Utc>,
        retention: Duration,
    ) {
        self.aborts.remove(job_id);
        let Some(entry) = self.jobs.get_mut(job_id) else {
            return;
        };
        let job = &mut entry.value;
        job.status = result.status();
        job.finish_time = Some(result.finish_time);
        job.last_error = result.error.clone();
        let job = job.clone();
        self.release_unique(&job);

        if retention.is_zero() {
            self.jobs.remove(job_id);
            self.results.remove(job_id);
            return;
        }
        let expires_at = add_duration(now, retention);
        if let Some(entry) = self.jobs.get_mut(job_id) {
            entry.expires_at = Some(expires_at);
        }
        self.results
            .insert(job_id.clone(), Expiring::until(result, expires_at));
    }
}

/// A [`QueueStore`] held entirely in process memory.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<Notification>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(clock::system())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            clock,
            events,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Number of claimed jobs whose lock has not been released or recovered.
    pub async fn in_flight_count(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn enqueue(&self, job: Job, policy: UniquePolicy) -> Result<EnqueueOutcome> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.purge(now);

        if state.jobs.contains_key(&job.id) || state.results.contains_key(&job.id) {
            return Ok(EnqueueOutcome::Rejected(RejectReason::Duplicate));
        }

        if let Some(key) = &job.unique_key {
            let holder = state.unique.get(key).cloned();
            if let Some(existing_id) = holder {
                let existing_status = state.jobs.get(&existing_id).map(|e| e.value.status);
                match existing_status {
                    Some(JobStatus::InProgress) => {
                        return Ok(EnqueueOutcome::Rejected(RejectReason::AlreadyRunning));
                    }
                    Some(status) if status.is_pending() => {
                        if policy == UniquePolicy::Reject {
                            return Ok(EnqueueOutcome::Rejected(RejectReason::Duplicate));
                        }
                        let Some(entry) = state.jobs.get_mut(&existing_id) else {
                            return Ok(EnqueueOutcome::Rejected(RejectReason::Duplicate));
                        };
                        let old_score = entry.value.score();
                        entry.value.due_time = job.due_time;
                        entry.value.payload = job.payload;
                        entry.value.status = job.status;
                        let new_score = entry.value.score();
                        state.index.remove(&(old_score, existing_id.clone()));
                        state.index.insert((new_score, existing_id.clone()));
                        return Ok(EnqueueOutcome::Replaced(existing_id));
                    }
                    // Stale mapping to a finished or purged job.
                    _ => {}
                }
            }
            state.unique.insert(key.clone(), job.id.clone());
        }

        let job_id = job.id.clone();
        state.index.insert((job.score(), job_id.clone()));
        state.jobs.insert(job_id.clone(), Expiring::forever(job));
        Ok(EnqueueOutcome::Enqueued(job_id))
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>> {
        let now_ms = to_millis(now);
        let state = self.state.lock().await;
        Ok(state
            .index
            .iter()
            .take_while(|(score, _)| *score <= now_ms)
            .take(limit)
            .map(|(_, id)| id.clone())
            .collect())
    }

    async fn claim(
        &self,
        job_id: &JobId,
        worker_id: &str,
        now: DateTime<Utc>,
        claim_timeout: Duration,
    ) -> Result<Option<Job>> {
        let mut state = self.state.lock().await;
        state.purge(self.clock.now());

        if state.live_lock(job_id, now).is_some() {
            return Ok(None);
        }
        let Some(score) = state
            .jobs
            .get(job_id)
            .filter(|entry| entry.value.status.is_pending())
            .map(|entry| entry.value.score())
        else {
            return Ok(None);
        };
        if score > to_millis(now) || !state.index.remove(&(score, job_id.clone())) {
            return Ok(None);
        }

        // A lapsed lock nobody recovered yet is superseded by this claim.
        state.release_lock(job_id);

        let expires_at = add_duration(now, claim_timeout);
        state.locks.insert(
            job_id.clone(),
            ClaimLock {
                job_id: job_id.clone(),
                owner_id: worker_id.to_string(),
                expires_at,
            },
        );
        state
            .in_flight
            .insert((to_millis(expires_at), job_id.clone()));

        let Some(entry) = state.jobs.get_mut(job_id) else {
            return Ok(None);
        };
        let job = &mut entry.value;
        job.status = JobStatus::InProgress;
        job.try_count += 1;
        job.start_time = Some(now);
        job.worker_id = Some(worker_id.to_string());
        Ok(Some(job.clone()))
    }

    async fn renew_claim(
        &self,
        job_id: &JobId,
        worker_id: &str,
        now: DateTime<Utc>,
        claim_timeout: Duration,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        if !state.owns_lock(job_id, worker_id, now) {
            return Ok(false);
        }

        let expires_at = add_duration(now, claim_timeout);
        let Some(lock) = state.locks.get_mut(job_id) else {
            return Ok(false);
        };
        let previous = to_millis(lock.expires_at);
        lock.expires_at = expires_at;
        state.in_flight.remove(&(previous, job_id.clone()));
        state
            .in_flight
            .insert((to_millis(expires_at), job_id.clone()));
        Ok(true)
    }

    async fn claim_lock(&self, job_id: &JobId) -> Result<Option<ClaimLock>> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        Ok(state.live_lock(job_id, now).cloned())
    }

    async fn finish(
        &self,
        job_id: &JobId,
        worker_id: &str,
        result: &JobResult,
        retention: Duration,
        refund_try: bool,
    ) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.purge(now);
        if !state.owns_lock(job_id, worker_id, now) {
            return Ok(false);
        }

        state.release_lock(job_id);
        let mut result = result.clone();
        if refund_try {
            if let Some(entry) = state.jobs.get_mut(job_id) {
                entry.value.try_count = entry.value.try_count.saturating_sub(1);
                result.try_count = entry.value.try_count;
            }
        }
        state.store_outcome(job_id, result, now, retention);
        Ok(true)
    }

    async fn retry(
        &self,
        job_id: &JobId,
        worker_id: &str,
        due_time: DateTime<Utc>,
        now: DateTime<Utc>,
        error: Option<&str>,
        refund_try: bool,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        if !state.owns_lock(job_id, worker_id, self.clock.now()) {
            return Ok(false);
        }

        state.release_lock(job_id);
        let Some(entry) = state.jobs.get_mut(job_id) else {
            return Ok(false);
        };
        let job = &mut entry.value;
        job.due_time = due_time;
        job.status = JobStatus::pending_for(due_time, now);
        if let Some(error) = error {
            job.last_error = Some(error.to_string());
        }
        if refund_try {
            job.try_count = job.try_count.saturating_sub(1);
        }
        let score = job.score();
        state.index.insert((score, job_id.clone()));
        Ok(true)
    }

    async fn recover_expired_claims(
        &self,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Result<RecoveryReport> {
        let now_ms = to_millis(now);
        let mut state = self.state.lock().await;
        state.purge(self.clock.now());

        let lapsed: Vec<(i64, JobId)> = state
            .in_flight
            .iter()
            .take_while(|(score, _)| *score <= now_ms)
            .cloned()
            .collect();

        let mut report = RecoveryReport::default();
        for (score, job_id) in lapsed {
            if state.live_lock(&job_id, now).is_some() {
                continue;
            }
            state.in_flight.remove(&(score, job_id.clone()));
            state.locks.remove(&job_id);

            let Some(entry) = state.jobs.get_mut(&job_id) else {
                warn!("Dropping in-flight entry for missing job {}", job_id);
                continue;
            };
            let job = &mut entry.value;
            if job.status != JobStatus::InProgress {
                continue;
            }

            if job.has_tries_left() {
                job.status = JobStatus::Queued;
                job.due_time = now;
                let score = job.score();
                state.index.insert((score, job_id.clone()));
                debug!("Requeued job {} after its claim expired", job_id);
                report.requeued.push(job_id);
            } else {
                let result = JobResult::failure(job, CLAIM_EXPIRED_ERROR, now);
                let keep = job.keep_result.unwrap_or(retention);
                state.store_outcome(&job_id, result, now, keep);
                report.failed.push(job_id);
            }
        }
        Ok(report)
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.purge(now);
        Ok(state.jobs.get(job_id).map(|entry| entry.value.clone()))
    }

    async fn get_result(&self, job_id: &JobId) -> Result<Option<JobResult>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.purge(now);
        Ok(state.results.get(job_id).map(|entry| entry.value.clone()))
    }

    async fn queued_jobs(&self) -> Result<Vec<Job>> {
        let state = self.state.lock().await;
        Ok(state
            .index
            .iter()
            .filter_map(|(_, id)| state.jobs.get(id).map(|entry| entry.value.clone()))
            .collect())
    }

    async fn queued_count(&self) -> Result<usize> {
        Ok(self.state.lock().await.index.len())
    }

    async fn results(&self) -> Result<Vec<JobResult>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.purge(now);
        let mut results: Vec<JobResult> = state
            .results
            .values()
            .map(|entry| entry.value.clone())
            .collect();
        results.sort_by(|a, b| {
            a.finish_time
                .cmp(&b.finish_time)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        Ok(results)
    }

    async fn request_abort(&self, job_id: &JobId, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.purge(now);
        let active = state
            .jobs
            .get(job_id)
            .is_some_and(|entry| !entry.value.status.is_terminal());
        if active {
            state.aborts.insert(job_id.clone(), add_duration(now, ttl));
        }
        Ok(active)
    }

    async fn is_abort_requested(&self, job_id: &JobId) -> Result<bool> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        Ok(state
            .aborts
            .get(job_id)
            .is_some_and(|expires_at| *expires_at > now))
    }

    async fn publish(&self, notification: Notification) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.events.send(notification);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe()
    }

    async fn write_heartbeat(&self, heartbeat: &Heartbeat, ttl: Duration) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.heartbeats.insert(
            heartbeat.worker_id.clone(),
            Expiring::until(heartbeat.clone(), add_duration(now, ttl)),
        );
        Ok(())
    }

    async fn get_heartbeat(&self, worker_id: &str) -> Result<Option<Heartbeat>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.purge(now);
        Ok(state
            .heartbeats
            .get(worker_id)
            .map(|entry| entry.value.clone()))
    }

    async fn heartbeats(&self) -> Result<Vec<Heartbeat>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.purge(now);
        let mut heartbeats: Vec<Heartbeat> = state
            .heartbeats
            .values()
            .map(|entry| entry.value.clone())
            .collect();
        heartbeats.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(heartbeats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use chrono::Duration as ChronoDuration;

    const CLAIM: Duration = Duration::from_secs(30);
    const KEEP: Duration = Duration::from_secs(3600);

    fn setup() -> (MemoryStore, MockClock) {
        let clock = MockClock::new();
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    fn job(id: &str, now: DateTime<Utc>, max_tries: u32) -> Job {
        Job::new(JobId::from(id), "work", b"{}".to_vec(), now, now, max_tries)
    }

    #[tokio::test]
    async fn test_enqueue_indexes_job() {
        let (store, clock) = setup();
        let now = clock.now();
        let outcome = store
            .enqueue(job("a", now, 3), UniquePolicy::Replace)
            .await
            .unwrap();

        assert_eq!(outcome, EnqueueOutcome::Enqueued(JobId::from("a")));
        assert_eq!(store.queued_count().await.unwrap(), 1);
        assert_eq!(store.due_jobs(now, 10).await.unwrap(), vec![JobId::from("a")]);
    }

    #[tokio::test]
    async fn test_duplicate_job_id_rejected_until_retention_lapses() {
        let (store, clock) = setup();
        let now = clock.now();
        store
            .enqueue(job("a", now, 3), UniquePolicy::Replace)
            .await
            .unwrap();
        let again = store
            .enqueue(job("a", now, 3), UniquePolicy::Replace)
            .await
            .unwrap();
        assert_eq!(again, EnqueueOutcome::Rejected(RejectReason::Duplicate));

        let claimed = store
            .claim(&JobId::from("a"), "w1", now, CLAIM)
            .await
            .unwrap()
            .unwrap();
        let result = JobResult::success(&claimed, b"1".to_vec(), now);
        assert!(
            store
                .finish(&claimed.id, "w1", &result, KEEP, false)
                .await
                .unwrap()
        );

        let again = store
            .enqueue(job("a", now, 3), UniquePolicy::Replace)
            .await
            .unwrap();
        assert_eq!(again, EnqueueOutcome::Rejected(RejectReason::Duplicate));

        clock.advance(ChronoDuration::hours(2));
        let later = clock.now();
        let again = store
            .enqueue(job("a", later, 3), UniquePolicy::Replace)
            .await
            .unwrap();
        assert_eq!(again, EnqueueOutcome::Enqueued(JobId::from("a")));
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let (store, clock) = setup();
        let now = clock.now();
        store
            .enqueue(job("a", now, 3), UniquePolicy::Replace)
            .await
            .unwrap();

        let first = store.claim(&JobId::from("a"), "w1", now, CLAIM).await.unwrap();
        let second = store.claim(&JobId::from("a"), "w2", now, CLAIM).await.unwrap();

        let claimed = first.unwrap();
        assert!(second.is_none());
        assert_eq!(claimed.status, JobStatus::InProgress);
        assert_eq!(claimed.try_count, 1);
        assert_eq!(claimed.worker_id.as_deref(), Some("w1"));
        assert_eq!(store.queued_count().await.unwrap(), 0);

        let lock = store.claim_lock(&claimed.id).await.unwrap().unwrap();
        assert_eq!(lock.owner_id, "w1");
        assert_eq!(lock.expires_at, now + ChronoDuration::seconds(30));
    }

    #[tokio::test]
    async fn test_deferred_job_not_claimable_early() {
        let (store, clock) = setup();
        let now = clock.now();
        let mut deferred = job("later", now, 3);
        deferred.due_time = now + ChronoDuration::seconds(5);
        deferred.status = JobStatus::Deferred;
        store.enqueue(deferred, UniquePolicy::Replace).await.unwrap();

        assert!(store.due_jobs(now, 10).await.unwrap().is_empty());
        assert!(
            store
                .claim(&JobId::from("later"), "w1", now, CLAIM)
                .await
                .unwrap()
                .is_none()
        );

        let due = now + ChronoDuration::seconds(5);
        assert_eq!(store.due_jobs(due, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_renewal_and_ownership() {
        let (store, clock) = setup();
        let now = clock.now();
        store
            .enqueue(job("a", now, 3), UniquePolicy::Replace)
            .await
            .unwrap();
        let id = JobId::from("a");
        store.claim(&id, "w1", now, CLAIM).await.unwrap().unwrap();

        assert!(!store.renew_claim(&id, "w2", now, CLAIM).await.unwrap());

        clock.advance(ChronoDuration::seconds(20));
        assert!(store.renew_claim(&id, "w1", clock.now(), CLAIM).await.unwrap());

        // The renewed lock survives past the original expiry.
        clock.advance(ChronoDuration::seconds(20));
        let report = store
            .recover_expired_claims(clock.now(), KEEP)
            .await
            .unwrap();
        assert!(report.is_empty());

        clock.advance(ChronoDuration::seconds(20));
        assert!(!store.renew_claim(&id, "w1", clock.now(), CLAIM).await.unwrap());
    }

    #[tokio::test]
    async fn test_recovery_requeues_or_fails() {
        let (store, clock) = setup();
        let now = clock.now();
        store
            .enqueue(job("retryable", now, 2), UniquePolicy::Replace)
            .await
            .unwrap();
        store
            .enqueue(job("final", now, 1), UniquePolicy::Replace)
            .await
            .unwrap();
        store
            .claim(&JobId::from("retryable"), "dead", now, CLAIM)
            .await
            .unwrap();
        store
            .claim(&JobId::from("final"), "dead", now, CLAIM)
            .await
            .unwrap();

        let early = store.recover_expired_claims(now, KEEP).await.unwrap();
        assert!(early.is_empty());

        clock.advance(ChronoDuration::seconds(31));
        let report = store
            .recover_expired_claims(clock.now(), KEEP)
            .await
            .unwrap();
        assert_eq!(report.requeued, vec![JobId::from("retryable")]);
        assert_eq!(report.failed, vec![JobId::from("final")]);
        assert_eq!(store.in_flight_count().await, 0);

        let requeued = store.get_job(&JobId::from("retryable")).await.unwrap().unwrap();
        assert_eq!(requeued.status, JobStatus::Queued);
        assert_eq!(requeued.try_count, 1);

        let failed = store.get_result(&JobId::from("final")).await.unwrap().unwrap();
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some(CLAIM_EXPIRED_ERROR));

        // The dead worker's late write is ignored.
        let late = JobResult::success(&requeued, Vec::new(), clock.now());
        assert!(
            !store
                .finish(&requeued.id, "dead", &late, KEEP, false)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_unique_key_replace_and_reject() {
        let (store, clock) = setup();
        let now = clock.now();

        let mut first = job("first", now, 3);
        first.unique_key = Some("report".to_string());
        first.due_time = now + ChronoDuration::hours(1);
        first.status = JobStatus::Deferred;
        store.enqueue(first, UniquePolicy::Replace).await.unwrap();

        let mut second = job("second", now, 3);
        second.unique_key = Some("report".to_string());
        second.payload = b"new".to_vec();
        let outcome = store.enqueue(second.clone(), UniquePolicy::Replace).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::Replaced(JobId::from("first")));

        let replaced = store.get_job(&JobId::from("first")).await.unwrap().unwrap();
        assert_eq!(replaced.due_time, now);
        assert_eq!(replaced.status, JobStatus::Queued);
        assert_eq!(replaced.payload, b"new".to_vec());
        assert!(store.get_job(&JobId::from("second")).await.unwrap().is_none());
        assert_eq!(store.queued_count().await.unwrap(), 1);

        let outcome = store.enqueue(second.clone(), UniquePolicy::Reject).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::Rejected(RejectReason::Duplicate));

        store
            .claim(&JobId::from("first"), "w1", now, CLAIM)
            .await
            .unwrap()
            .unwrap();
        let outcome = store.enqueue(second, UniquePolicy::Replace).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::Rejected(RejectReason::AlreadyRunning));
    }

    #[tokio::test]
    async fn test_unique_key_released_on_finish() {
        let (store, clock) = setup();
        let now = clock.now();
        let mut first = job("first", now, 3);
        first.unique_key = Some("k".to_string());
        store.enqueue(first, UniquePolicy::Replace).await.unwrap();
        let claimed = store
            .claim(&JobId::from("first"), "w1", now, CLAIM)
            .await
            .unwrap()
            .unwrap();
        let result = JobResult::failure(&claimed, "boom", now);
        store
            .finish(&claimed.id, "w1", &result, KEEP, false)
            .await
            .unwrap();

        let mut second = job("second", now, 3);
        second.unique_key = Some("k".to_string());
        let outcome = store.enqueue(second, UniquePolicy::Replace).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::Enqueued(JobId::from("second")));
    }

    #[tokio::test]
    async fn test_retry_returns_job_to_index() {
        let (store, clock) = setup();
        let now = clock.now();
        store
            .enqueue(job("a", now, 3), UniquePolicy::Replace)
            .await
            .unwrap();
        let id = JobId::from("a");
        store.claim(&id, "w1", now, CLAIM).await.unwrap().unwrap();

        let due = now + ChronoDuration::seconds(10);
        assert!(
            store
                .retry(&id, "w1", due, now, Some("flaky"), false)
                .await
                .unwrap()
        );
        let retried = store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(retried.status, JobStatus::Deferred);
        assert_eq!(retried.try_count, 1);
        assert_eq!(retried.last_error.as_deref(), Some("flaky"));
        assert!(store.claim_lock(&id).await.unwrap().is_none());
        assert!(store.due_jobs(now, 10).await.unwrap().is_empty());
        assert_eq!(store.due_jobs(due, 10).await.unwrap(), vec![id.clone()]);

        store.claim(&id, "w1", due, CLAIM).await.unwrap().unwrap();
        assert!(store.retry(&id, "w1", due, due, None, true).await.unwrap());
        assert_eq!(store.get_job(&id).await.unwrap().unwrap().try_count, 1);
    }

    #[tokio::test]
    async fn test_zero_retention_drops_result() {
        let (store, clock) = setup();
        let now = clock.now();
        store
            .enqueue(job("a", now, 1), UniquePolicy::Replace)
            .await
            .unwrap();
        let claimed = store
            .claim(&JobId::from("a"), "w1", now, CLAIM)
            .await
            .unwrap()
            .unwrap();
        let result = JobResult::success(&claimed, Vec::new(), now);
        store
            .finish(&claimed.id, "w1", &result, Duration::ZERO, false)
            .await
            .unwrap();
        assert!(store.get_job(&claimed.id).await.unwrap().is_none());
        assert!(store.get_result(&claimed.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_heartbeats_expire() {
        let (store, clock) = setup();
        let heartbeat = Heartbeat::new("w1", clock.now());
        store
            .write_heartbeat(&heartbeat, Duration::from_secs(11))
            .await
            .unwrap();
        assert_eq!(store.heartbeats().await.unwrap().len(), 1);

        clock.advance(ChronoDuration::seconds(12));
        assert!(store.get_heartbeat("w1").await.unwrap().is_none());
    }
}
