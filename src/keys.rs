//! Key layout shared by every store adapter.
//!
//! Each kind of record lives under its own segment of the queue namespace, so
//! job records, the due-time index, claim locks, results and heartbeats can
//! never collide, and two namespaces on one store are fully isolated.

use crate::job::JobId;

pub const DEFAULT_NAMESPACE: &str = "millwork";

const JOB_SEGMENT: &str = "job";
const QUEUE_SEGMENT: &str = "queue";
const IN_FLIGHT_SEGMENT: &str = "in-flight";
const LOCK_SEGMENT: &str = "lock";
const RESULT_SEGMENT: &str = "result";
const UNIQUE_SEGMENT: &str = "unique";
const ABORT_SEGMENT: &str = "abort";
const HEALTH_SEGMENT: &str = "health";
const EVENTS_SEGMENT: &str = "events";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, segment: &str, id: &str) -> String {
        format!("{}:{}:{}", self.namespace, segment, id)
    }

    fn prefix(&self, segment: &str) -> String {
        format!("{}:{}:", self.namespace, segment)
    }

    pub fn job(&self, job_id: &JobId) -> String {
        self.key(JOB_SEGMENT, job_id.as_str())
    }

    pub fn job_prefix(&self) -> String {
        self.prefix(JOB_SEGMENT)
    }

    /// Sorted set of pending job ids scored by due time in milliseconds.
    pub fn queue(&self) -> String {
        format!("{}:{}", self.namespace, QUEUE_SEGMENT)
    }

    /// Sorted set of claimed job ids scored by claim expiry in milliseconds.
    pub fn in_flight(&self) -> String {
        format!("{}:{}", self.namespace, IN_FLIGHT_SEGMENT)
    }

    pub fn lock(&self, job_id: &JobId) -> String {
        self.key(LOCK_SEGMENT, job_id.as_str())
    }

    pub fn lock_prefix(&self) -> String {
        self.prefix(LOCK_SEGMENT)
    }

    pub fn result(&self, job_id: &JobId) -> String {
        self.key(RESULT_SEGMENT, job_id.as_str())
    }

    pub fn result_prefix(&self) -> String {
        self.prefix(RESULT_SEGMENT)
    }

    pub fn unique(&self, unique_key: &str) -> String {
        self.key(UNIQUE_SEGMENT, unique_key)
    }

    pub fn abort(&self, job_id: &JobId) -> String {
        self.key(ABORT_SEGMENT, job_id.as_str())
    }

    pub fn heartbeat(&self, worker_id: &str) -> String {
        self.key(HEALTH_SEGMENT, worker_id)
    }

    pub fn heartbeat_prefix(&self) -> String {
        self.prefix(HEALTH_SEGMENT)
    }

    /// Pub/sub channel carrying wake and abort notifications.
    pub fn events_channel(&self) -> String {
        format!("{}:{}", self.namespace, EVENTS_SEGMENT)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}
