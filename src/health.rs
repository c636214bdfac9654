//! Worker liveness reporting.
//!
//! Each worker periodically overwrites a [`Heartbeat`] record with a TTL just
//! past the reporting interval, so a worker that stops reporting disappears
//! from [`crate::queue::JobQueue::heartbeats`] on its own.

use crate::{Result, clock::Clock, limiter::ConcurrencyLimiter, queue::QueueStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Slack added to the reporting interval when setting the heartbeat TTL.
pub const HEARTBEAT_TTL_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: String,
    pub last_seen: DateTime<Utc>,
    pub active_job_count: usize,
    pub jobs_complete: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    /// Length of the due-time index when the heartbeat was written.
    pub queued: usize,
}

impl Heartbeat {
    pub fn new(worker_id: impl Into<String>, last_seen: DateTime<Utc>) -> Self {
        Self {
            worker_id: worker_id.into(),
            last_seen,
            active_job_count: 0,
            jobs_complete: 0,
            jobs_failed: 0,
            jobs_retried: 0,
            queued: 0,
        }
    }
}

/// Running totals of what a worker has done since it started.
#[derive(Debug, Default)]
pub struct JobCounters {
    claimed: AtomicU64,
    complete: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

/// Point-in-time copy of [`JobCounters`]; also what a burst run returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub claimed: u64,
    pub complete: u64,
    pub failed: u64,
    pub retried: u64,
}

impl JobCounters {
    pub fn record_claimed(&self) -> u64 {
        self.claimed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_complete(&self) {
        self.complete.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerSummary {
        WorkerSummary {
            claimed: self.claimed.load(Ordering::Relaxed),
            complete: self.complete.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }
}

pub struct HealthReporter {
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    worker_id: String,
    interval: Duration,
    counters: Arc<JobCounters>,
    limiter: ConcurrencyLimiter,
}

impl HealthReporter {
    pub fn new(
        store: Arc<dyn QueueStore>,
        clock: Arc<dyn Clock>,
        worker_id: impl Into<String>,
        interval: Duration,
        counters: Arc<JobCounters>,
        limiter: ConcurrencyLimiter,
    ) -> Self {
        Self {
            store,
            clock,
            worker_id: worker_id.into(),
            interval,
            counters,
            limiter,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.interval + HEARTBEAT_TTL_SLACK
    }

    /// Build and write one heartbeat.
    pub async fn report_once(&self) -> Result<Heartbeat> {
        let queued = self.store.queued_count().await?;
        let summary = self.counters.snapshot();
        let heartbeat = Heartbeat {
            worker_id: self.worker_id.clone(),
            last_seen: self.clock.now(),
            active_job_count: self.limiter.active(),
            jobs_complete: summary.complete,
            jobs_failed: summary.failed,
            jobs_retried: summary.retried,
            queued,
        };
        self.store.write_heartbeat(&heartbeat, self.ttl()).await?;
        debug!(
            "Heartbeat from {}: {} active, {} queued",
            self.worker_id, heartbeat.active_job_count, queued
        );
        Ok(heartbeat)
    }

    /// Report every interval until `shutdown` fires. Store errors are logged
    /// and the next cycle tries again.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            if let Err(e) = self.report_once().await {
                warn!("Failed to write heartbeat for {}: {}", self.worker_id, e);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }
    }
}
