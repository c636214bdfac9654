//! Redis-backed [`QueueStore`].
//!
//! Job records are hashes with millisecond timestamps so the Lua scripts can
//! compare and rewrite them in place. The due-time and in-flight indexes are
//! sorted sets scored in milliseconds. Locks, results, abort markers and
//! heartbeats are plain string keys with a `PX` expiry, so Redis handles
//! retention on its own.
//!
//! Every transition that touches more than one key runs as a single script.

use crate::{
    MillworkError, Result,
    clock::{self, Clock},
    config::StoreConfig,
    health::Heartbeat,
    job::{Job, JobId, JobResult, JobStatus, from_millis, to_millis},
    keys::KeySpace,
    queue::{
        CLAIM_EXPIRED_ERROR, ClaimLock, EnqueueOutcome, Notification, QueueStore, RecoveryReport,
        RejectReason, UniquePolicy,
    },
};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use redis::{AsyncCommands, Script, aio::MultiplexedConnection};
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const ENQUEUE_LUA: &str = include_str!("lua/enqueue.lua");
const CLAIM_LUA: &str = include_str!("lua/claim.lua");
const RENEW_LUA: &str = include_str!("lua/renew.lua");
const FINISH_LUA: &str = include_str!("lua/finish.lua");
const RETRY_LUA: &str = include_str!("lua/retry.lua");
const RECOVER_LUA: &str = include_str!("lua/recover.lua");
const ABORT_LUA: &str = include_str!("lua/abort.lua");

const EVENT_CAPACITY: usize = 1024;
const SCAN_COUNT: usize = 200;

#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    keys: KeySpace,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<Notification>,
    enqueue_script: Script,
    claim_script: Script,
    renew_script: Script,
    finish_script: Script,
    retry_script: Script,
    recover_script: Script,
    abort_script: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("namespace", &self.keys.namespace())
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to `url` and start forwarding the namespace's pub/sub channel
    /// to local subscribers.
    pub async fn connect(url: &str, namespace: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        let keys = KeySpace::new(namespace);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        spawn_listener(client, keys.events_channel(), events.clone()).await?;
        info!("Connected to Redis store (namespace {})", namespace);

        Ok(Self {
            conn,
            keys,
            clock: clock::system(),
            events,
            enqueue_script: Script::new(ENQUEUE_LUA),
            claim_script: Script::new(CLAIM_LUA),
            renew_script: Script::new(RENEW_LUA),
            finish_script: Script::new(FINISH_LUA),
            retry_script: Script::new(RETRY_LUA),
            recover_script: Script::new(RECOVER_LUA),
            abort_script: Script::new(ABORT_LUA),
        })
    }

    pub async fn from_config(config: &StoreConfig) -> Result<Self> {
        Self::connect(&config.url, &config.namespace).await
    }

    /// Clock used for lock expiry reporting.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut found = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            found.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(found)
    }

    async fn load_job(&self, job_id: &JobId) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn.hgetall(self.keys.job(job_id)).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        parse_job(raw, job_id).map(Some)
    }

    /// Write the result of a job failed by recovery and start its retention.
    async fn retain_recovered_failure(
        &self,
        job_id: &JobId,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Result<()> {
        let Some(job) = self.load_job(job_id).await? else {
            return Ok(());
        };
        let keep = job.keep_result.unwrap_or(retention);
        let mut conn = self.conn.clone();
        if keep.is_zero() {
            let _: () = conn.del(self.keys.job(job_id)).await?;
            return Ok(());
        }

        let result = JobResult::failure(&job, CLAIM_EXPIRED_ERROR, now);
        let encoded = serde_json::to_string(&result)?;
        let keep_ms = keep.as_millis() as u64;
        let _: () = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.keys.result(job_id))
            .arg(encoded)
            .arg("PX")
            .arg(keep_ms)
            .ignore()
            .cmd("PEXPIRE")
            .arg(self.keys.job(job_id))
            .arg(keep_ms)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

async fn spawn_listener(
    client: redis::Client,
    channel: String,
    events: broadcast::Sender<Notification>,
) -> Result<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(&channel).await?;

    tokio::spawn(async move {
        let mut messages = pubsub.into_on_message();
        while let Some(message) = messages.next().await {
            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Ignoring undecodable notification on {}: {}", channel, e);
                    continue;
                }
            };
            match Notification::parse(&payload) {
                Some(notification) => {
                    let _ = events.send(notification);
                }
                None => debug!("Ignoring unknown notification {:?}", payload),
            }
        }
        warn!("Notification subscription on {} ended", channel);
    });
    Ok(())
}

fn job_fields(job: &Job) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("id", job.id.to_string()),
        ("function_name", job.function_name.clone()),
        ("payload", STANDARD.encode(&job.payload)),
        ("enqueue_time", to_millis(job.enqueue_time).to_string()),
        ("due_time", to_millis(job.due_time).to_string()),
        ("try_count", job.try_count.to_string()),
        ("max_tries", job.max_tries.to_string()),
        ("status", job.status.as_str().to_string()),
    ];

    if let Some(value) = &job.unique_key {
        fields.push(("unique_key", value.clone()));
    }
    if let Some(value) = job.timeout {
        fields.push(("timeout_ms", value.as_millis().to_string()));
    }
    if let Some(value) = job.keep_result {
        fields.push(("keep_result_ms", value.as_millis().to_string()));
    }
    if let Some(value) = job.expires_at {
        fields.push(("expires_at", to_millis(value).to_string()));
    }
    if let Some(value) = job.start_time {
        fields.push(("start_time", to_millis(value).to_string()));
    }
    if let Some(value) = job.finish_time {
        fields.push(("finish_time", to_millis(value).to_string()));
    }
    if let Some(value) = &job.worker_id {
        fields.push(("worker_id", value.clone()));
    }
    if let Some(value) = &job.last_error {
        fields.push(("last_error", value.clone()));
    }
    fields
}

fn parse_millis(raw: &HashMap<String, String>, field: &str) -> Option<DateTime<Utc>> {
    raw.get(field)
        .and_then(|value| value.parse::<i64>().ok())
        .map(from_millis)
}

fn parse_duration(raw: &HashMap<String, String>, field: &str) -> Option<Duration> {
    raw.get(field)
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn parse_job(raw: HashMap<String, String>, fallback_id: &JobId) -> Result<Job> {
    let corrupt = |field: &str| MillworkError::Serialization {
        message: format!("job {} has a missing or invalid {}", fallback_id, field),
    };

    let status = raw
        .get("status")
        .and_then(|value| JobStatus::parse(value))
        .ok_or_else(|| corrupt("status"))?;
    let enqueue_time = parse_millis(&raw, "enqueue_time").ok_or_else(|| corrupt("enqueue_time"))?;
    let due_time = parse_millis(&raw, "due_time").ok_or_else(|| corrupt("due_time"))?;
    let payload = match raw.get("payload") {
        Some(encoded) => STANDARD.decode(encoded)?,
        None => Vec::new(),
    };

    Ok(Job {
        id: raw
            .get("id")
            .map(|id| JobId::from(id.as_str()))
            .unwrap_or_else(|| fallback_id.clone()),
        function_name: raw.get("function_name").cloned().unwrap_or_default(),
        payload,
        enqueue_time,
        due_time,
        try_count: raw
            .get("try_count")
            .and_then(|value| value.parse().ok())
            .unwrap_or(0),
        max_tries: raw
            .get("max_tries")
            .and_then(|value| value.parse().ok())
            .unwrap_or(1),
        status,
        unique_key: raw.get("unique_key").cloned(),
        timeout: parse_duration(&raw, "timeout_ms"),
        keep_result: parse_duration(&raw, "keep_result_ms"),
        expires_at: parse_millis(&raw, "expires_at"),
        start_time: parse_millis(&raw, "start_time"),
        finish_time: parse_millis(&raw, "finish_time"),
        worker_id: raw.get("worker_id").cloned(),
        last_error: raw.get("last_error").cloned(),
    })
}

fn flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn enqueue(&self, job: Job, policy: UniquePolicy) -> Result<EnqueueOutcome> {
        let mut conn = self.conn.clone();
        let unique_key = job
            .unique_key
            .as_deref()
            .map(|key| self.keys.unique(key))
            .unwrap_or_else(|| self.keys.unique(""));
        let policy = match policy {
            UniquePolicy::Replace => "replace",
            UniquePolicy::Reject => "reject",
        };

        let mut invocation = self.enqueue_script.key(self.keys.job(&job.id));
        invocation
            .key(self.keys.queue())
            .key(self.keys.result(&job.id))
            .key(unique_key)
            .arg(job.id.as_str())
            .arg(job.score())
            .arg(policy)
            .arg(self.keys.job_prefix())
            .arg(flag(job.unique_key.is_some()))
            .arg(job.status.as_str())
            .arg(STANDARD.encode(&job.payload));
        for (field, value) in job_fields(&job) {
            invocation.arg(field).arg(value);
        }

        let (code, id): (i64, String) = invocation.invoke_async(&mut conn).await?;
        Ok(match code {
            1 => EnqueueOutcome::Enqueued(JobId::from(id)),
            2 => EnqueueOutcome::Replaced(JobId::from(id)),
            -1 => EnqueueOutcome::Rejected(RejectReason::AlreadyRunning),
            _ => EnqueueOutcome::Rejected(RejectReason::Duplicate),
        })
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrangebyscore_limit(self.keys.queue(), "-inf", to_millis(now), 0, limit as isize)
            .await?;
        Ok(ids.into_iter().map(JobId::from).collect())
    }

    async fn claim(
        &self,
        job_id: &JobId,
        worker_id: &str,
        now: DateTime<Utc>,
        claim_timeout: Duration,
    ) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let claimed: Option<HashMap<String, String>> = self
            .claim_script
            .key(self.keys.job(job_id))
            .key(self.keys.queue())
            .key(self.keys.lock(job_id))
            .key(self.keys.in_flight())
            .arg(job_id.as_str())
            .arg(worker_id)
            .arg(to_millis(now))
            .arg(claim_timeout.as_millis().max(1) as u64)
            .invoke_async(&mut conn)
            .await?;

        match claimed {
            Some(raw) if !raw.is_empty() => parse_job(raw, job_id).map(Some),
            _ => Ok(None),
        }
    }

    async fn renew_claim(
        &self,
        job_id: &JobId,
        worker_id: &str,
        now: DateTime<Utc>,
        claim_timeout: Duration,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let renewed: i64 = self
            .renew_script
            .key(self.keys.lock(job_id))
            .key(self.keys.in_flight())
            .arg(worker_id)
            .arg(to_millis(now))
            .arg(claim_timeout.as_millis().max(1) as u64)
            .arg(job_id.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn claim_lock(&self, job_id: &JobId) -> Result<Option<ClaimLock>> {
        let mut conn = self.conn.clone();
        let key = self.keys.lock(job_id);
        let (owner, ttl_ms): (Option<String>, i64) = redis::pipe()
            .get(&key)
            .pttl(&key)
            .query_async(&mut conn)
            .await?;

        Ok(owner.filter(|_| ttl_ms > 0).map(|owner_id| ClaimLock {
            job_id: job_id.clone(),
            owner_id,
            expires_at: self.clock.now() + chrono::Duration::milliseconds(ttl_ms),
        }))
    }

    async fn finish(
        &self,
        job_id: &JobId,
        worker_id: &str,
        result: &JobResult,
        retention: Duration,
        refund_try: bool,
    ) -> Result<bool> {
        let mut result = result.clone();
        if refund_try {
            result.try_count = result.try_count.saturating_sub(1);
        }
        let encoded = serde_json::to_string(&result)?;
        let mut conn = self.conn.clone();
        let finished: i64 = self
            .finish_script
            .key(self.keys.job(job_id))
            .key(self.keys.lock(job_id))
            .key(self.keys.in_flight())
            .key(self.keys.result(job_id))
            .key(self.keys.abort(job_id))
            .arg(worker_id)
            .arg(job_id.as_str())
            .arg(result.status().as_str())
            .arg(to_millis(result.finish_time))
            .arg(encoded)
            .arg(retention.as_millis() as u64)
            .arg(flag(refund_try))
            .arg(result.error.as_deref().unwrap_or(""))
            .arg(self.keys.unique(""))
            .invoke_async(&mut conn)
            .await?;
        Ok(finished == 1)
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
        let mut conn = self.conn.clone();
        let retried: i64 = self
            .retry_script
            .key(self.keys.job(job_id))
            .key(self.keys.lock(job_id))
            .key(self.keys.in_flight())
            .key(self.keys.queue())
            .arg(worker_id)
            .arg(job_id.as_str())
            .arg(to_millis(due_time))
            .arg(JobStatus::pending_for(due_time, now).as_str())
            .arg(error.unwrap_or(""))
            .arg(flag(refund_try))
            .invoke_async(&mut conn)
            .await?;
        Ok(retried == 1)
    }

    async fn recover_expired_claims(
        &self,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Result<RecoveryReport> {
        let mut conn = self.conn.clone();
        let (requeued, failed): (Vec<String>, Vec<String>) = self
            .recover_script
            .key(self.keys.in_flight())
            .key(self.keys.queue())
            .arg(to_millis(now))
            .arg(self.keys.job_prefix())
            .arg(self.keys.lock_prefix())
            .arg(self.keys.unique(""))
            .arg(CLAIM_EXPIRED_ERROR)
            .invoke_async(&mut conn)
            .await?;

        let report = RecoveryReport {
            requeued: requeued.into_iter().map(JobId::from).collect(),
            failed: failed.into_iter().map(JobId::from).collect(),
        };
        for job_id in &report.failed {
            self.retain_recovered_failure(job_id, now, retention).await?;
        }
        Ok(report)
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>> {
        self.load_job(job_id).await
    }

    async fn get_result(&self, job_id: &JobId) -> Result<Option<JobResult>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.keys.result(job_id)).await?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(MillworkError::from))
            .transpose()
    }

    async fn queued_jobs(&self) -> Result<Vec<Job>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.zrange(self.keys.queue(), 0, -1).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hgetall(self.keys.job(&JobId::from(id.as_str())));
        }
        let maps: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        let mut jobs = Vec::with_capacity(maps.len());
        for (id, raw) in ids.iter().zip(maps) {
            if raw.is_empty() {
                continue;
            }
            match parse_job(raw, &JobId::from(id.as_str())) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("Skipping unreadable job {}: {}", id, e),
            }
        }
        Ok(jobs)
    }

    async fn queued_count(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let count: usize = conn.zcard(self.keys.queue()).await?;
        Ok(count)
    }

    async fn results(&self) -> Result<Vec<JobResult>> {
        let keys = self.scan_prefix(&self.keys.result_prefix()).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let raw: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut results: Vec<JobResult> = raw
            .into_iter()
            .flatten()
            .filter_map(|raw| serde_json::from_str(&raw).ok())
            .collect();
        results.sort_by(|a, b| {
            a.finish_time
                .cmp(&b.finish_time)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        Ok(results)
    }

    async fn request_abort(&self, job_id: &JobId, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let requested: i64 = self
            .abort_script
            .key(self.keys.job(job_id))
            .key(self.keys.abort(job_id))
            .arg(ttl.as_millis().max(1) as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(requested == 1)
    }

    async fn is_abort_requested(&self, job_id: &JobId) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(self.keys.abort(job_id)).await?;
        Ok(exists)
    }

    async fn publish(&self, notification: Notification) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .publish(self.keys.events_channel(), notification.encode())
            .await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe()
    }

    async fn write_heartbeat(&self, heartbeat: &Heartbeat, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let encoded = serde_json::to_string(heartbeat)?;
        let _: () = redis::cmd("SET")
            .arg(self.keys.heartbeat(&heartbeat.worker_id))
            .arg(encoded)
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_heartbeat(&self, worker_id: &str) -> Result<Option<Heartbeat>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.keys.heartbeat(worker_id)).await?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(MillworkError::from))
            .transpose()
    }

    async fn heartbeats(&self) -> Result<Vec<Heartbeat>> {
        let keys = self.scan_prefix(&self.keys.heartbeat_prefix()).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let raw: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut heartbeats: Vec<Heartbeat> = raw
            .into_iter()
            .flatten()
            .filter_map(|raw| serde_json::from_str(&raw).ok())
            .collect();
        heartbeats.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(heartbeats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_job_fields_parse_back() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
        let mut job = Job::new(JobId::from("r1"), "sync", vec![0, 255, 7], now, now, 4);
        job.unique_key = Some("sync:acct-9".to_string());
        job.timeout = Some(Duration::from_millis(2500));
        job.expires_at = Some(now + chrono::Duration::minutes(5));
        job.last_error = Some("boom".to_string());

        let raw: HashMap<String, String> = job_fields(&job)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(raw.get("due_time"), Some(&to_millis(now).to_string()));
        assert!(!raw.contains_key("start_time"));

        let parsed = parse_job(raw, &JobId::from("fallback")).unwrap();
        assert_eq!(parsed, job);
    }

    #[test]
    fn test_parse_job_rejects_corrupt_record() {
        let mut raw = HashMap::new();
        raw.insert("status".to_string(), "sleeping".to_string());
        let err = parse_job(raw, &JobId::from("x")).unwrap_err();
        assert!(matches!(err, MillworkError::Serialization { .. }));
    }
}
