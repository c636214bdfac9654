use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, time::Duration};
use uuid::Uuid;

/// Opaque job identifier.
///
/// Callers may supply their own id to get "enqueue at most once" semantics;
/// otherwise a random one is generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the due-time index for a future due time.
    Deferred,
    /// Due now and waiting in the due-time index for a worker.
    Queued,
    /// Claimed by a worker that holds the claim lock.
    InProgress,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Deferred => "deferred",
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "deferred" => Some(JobStatus::Deferred),
            "queued" => Some(JobStatus::Queued),
            "in_progress" => Some(JobStatus::InProgress),
            "complete" => Some(JobStatus::Complete),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Deferred and queued jobs are the ones held in the due-time index.
    pub fn is_pending(&self) -> bool {
        matches!(self, JobStatus::Deferred | JobStatus::Queued)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }

    /// Status a pending job has when due at `due_time` as seen at `now`.
    pub fn pending_for(due_time: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        if due_time > now {
            JobStatus::Deferred
        } else {
            JobStatus::Queued
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Positional and keyword arguments of a job, before serialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl JobPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }
}

/// The persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub function_name: String,
    /// Serialized [`JobPayload`]; opaque to the queue.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub enqueue_time: DateTime<Utc>,
    pub due_time: DateTime<Utc>,
    pub try_count: u32,
    pub max_tries: u32,
    pub status: JobStatus,
    pub unique_key: Option<String>,
    /// Per-job execution budget, overriding the function and worker defaults.
    pub timeout: Option<Duration>,
    /// Per-job result retention, overriding the worker default.
    pub keep_result: Option<Duration>,
    /// The job is dropped as failed if it has not started by this time.
    pub expires_at: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(
        id: JobId,
        function_name: impl Into<String>,
        payload: Vec<u8>,
        now: DateTime<Utc>,
        due_time: DateTime<Utc>,
        max_tries: u32,
    ) -> Self {
        Self {
            id,
            function_name: function_name.into(),
            payload,
            enqueue_time: now,
            due_time,
            try_count: 0,
            max_tries: max_tries.max(1),
            status: JobStatus::pending_for(due_time, now),
            unique_key: None,
            timeout: None,
            keep_result: None,
            expires_at: None,
            start_time: None,
            finish_time: None,
            worker_id: None,
            last_error: None,
        }
    }

    pub fn has_tries_left(&self) -> bool {
        self.try_count < self.max_tries
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Due-time index score.
    pub fn score(&self) -> i64 {
        to_millis(self.due_time)
    }
}

/// Outcome record written on every terminal transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub function_name: String,
    pub success: bool,
    /// Serialized return value of a successful job.
    #[serde(default, with = "option_base64_bytes")]
    pub result: Option<Vec<u8>>,
    pub error: Option<String>,
    pub try_count: u32,
    pub enqueue_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: DateTime<Utc>,
    pub worker_id: Option<String>,
}

impl JobResult {
    pub fn success(job: &Job, result: Vec<u8>, finish_time: DateTime<Utc>) -> Self {
        Self::from_job(job, true, Some(result), None, finish_time)
    }

    pub fn failure(job: &Job, error: impl Into<String>, finish_time: DateTime<Utc>) -> Self {
        Self::from_job(job, false, None, Some(error.into()), finish_time)
    }

    fn from_job(
        job: &Job,
        success: bool,
        result: Option<Vec<u8>>,
        error: Option<String>,
        finish_time: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job.id.clone(),
            function_name: job.function_name.clone(),
            success,
            result,
            error,
            try_count: job.try_count,
            enqueue_time: job.enqueue_time,
            start_time: job.start_time,
            finish_time,
            worker_id: job.worker_id.clone(),
        }
    }

    pub fn status(&self) -> JobStatus {
        if self.success {
            JobStatus::Complete
        } else {
            JobStatus::Failed
        }
    }
}

/// Options accepted by [`crate::queue::JobQueue::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub job_id: Option<JobId>,
    pub defer_until: Option<DateTime<Utc>>,
    pub defer_by: Option<Duration>,
    pub unique_key: Option<String>,
    pub max_tries: Option<u32>,
    pub timeout: Option<Duration>,
    pub keep_result: Option<Duration>,
    pub expires: Option<Duration>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job_id(mut self, job_id: impl Into<JobId>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn defer_until(mut self, due_time: DateTime<Utc>) -> Self {
        self.defer_until = Some(due_time);
        self
    }

    pub fn defer_by(mut self, delay: Duration) -> Self {
        self.defer_by = Some(delay);
        self
    }

    pub fn with_unique_key(mut self, unique_key: impl Into<String>) -> Self {
        self.unique_key = Some(unique_key.into());
        self
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = Some(max_tries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn keep_result(mut self, retention: Duration) -> Self {
        self.keep_result = Some(retention);
        self
    }

    /// Drop the job as failed if no worker has started it within `expires`.
    pub fn expires(mut self, expires: Duration) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Due time for a job enqueued at `now`; `defer_until` wins over `defer_by`.
    pub fn due_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(due_time) = self.defer_until {
            return due_time;
        }
        match self.defer_by {
            Some(delay) => add_duration(now, delay),
            None => now,
        }
    }
}

pub fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

pub fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `time + duration`, clamped to the latest representable instant.
pub fn add_duration(time: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| time.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `time - duration`, clamped to the earliest representable instant.
pub fn sub_duration(time: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| time.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(D::Error::custom)
    }
}

mod option_base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let s = Option::<String>::deserialize(deserializer)?;
        s.map(|s| STANDARD.decode(s).map_err(D::Error::custom))
            .transpose()
    }
}
