//! # Millwork
//!
//! A distributed job queue and worker engine. Producers and any number of
//! worker processes coordinate only through a shared key-value store; they
//! never talk to each other directly.
//!
//! ## Features
//!
//! - **Immediate, deferred and recurring jobs**: defer by a delay or until a
//!   time, or schedule with cron expressions and fixed intervals
//! - **Unique jobs**: caller-chosen job ids and unique keys, with pending
//!   duplicates replaced or rejected
//! - **Exclusive claims**: each due job runs on one worker at a time, guarded
//!   by a renewable claim lock
//! - **Crash recovery**: jobs claimed by a worker that died go back to the
//!   queue once the claim expires
//! - **Retries**: fixed, linear, exponential, Fibonacci or custom backoff,
//!   bounded by a per-job try budget
//! - **Timeouts, expiry and abort**: per-job or per-function timeouts, jobs
//!   that expire before they start, and abort by id
//! - **Health**: each worker publishes a heartbeat with its counters
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use millwork::{
//!     config::WorkerConfig, EnqueueOptions, JobPayload, JobQueue, MemoryStore, Registry, Worker,
//! };
//! use serde_json::json;
//! use std::{sync::Arc, time::Duration};
//!
//! #[tokio::main]
//! async fn main() -> millwork::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!
//!     let queue = JobQueue::new(store.clone());
//!     queue
//!         .enqueue(
//!             "resize_image",
//!             JobPayload::new().arg("cat.png").kwarg("width", 640),
//!             EnqueueOptions::new().defer_by(Duration::from_secs(5)),
//!         )
//!         .await?;
//!
//!     let registry = Registry::new().register("resize_image", |ctx| async move {
//!         let path: String = ctx.arg(0)?;
//!         let width: u32 = ctx.kwarg("width")?.unwrap_or(1024);
//!         Ok(json!({ "path": path, "width": width }))
//!     });
//!
//!     let worker = Worker::new(store, registry, WorkerConfig::default());
//!     worker.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Core Concepts
//!
//! ### Jobs
//!
//! A job is a function name plus a serialized [`JobPayload`] of positional and
//! keyword arguments. Its record moves through `deferred` or `queued`, then
//! `in_progress`, and ends `complete` or `failed`. Terminal records and results
//! are kept for a retention period, during which the job id cannot be reused.
//!
//! ### Stores
//!
//! [`QueueStore`] is the only thing workers share. Every transition that
//! touches more than one key is a single atomic store operation. The crate
//! ships [`MemoryStore`] and, with the `redis` feature, `RedisStore`.
//!
//! ### Workers
//!
//! A [`Worker`] polls the due-time index, claims what its concurrency limit
//! allows and runs each job on its own task, renewing the claim while the
//! handler runs.
//!
//! ## Feature Flags
//!
//! - `msgpack` - MessagePack payload serializer (default)
//! - `redis` - Redis store adapter

pub mod clock;
pub mod config;
pub mod cron;
pub mod error;
pub mod executor;
pub mod health;
pub mod job;
pub mod keys;
pub mod limiter;
pub mod logging;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod serializer;
pub mod worker;

pub use clock::{Clock, MockClock, SystemClock};
pub use config::MillworkConfig;
pub use self::cron::{CronError, CronSchedule, CronScheduler, RecurringJob, Schedule};
pub use error::MillworkError;
pub use executor::{ExecutionOutcome, JobExecutor};
pub use health::{Heartbeat, HealthReporter};
pub use job::{EnqueueOptions, Job, JobId, JobPayload, JobResult, JobStatus};
pub use limiter::ConcurrencyLimiter;
pub use queue::{
    EnqueueOutcome, JobQueue, MemoryStore, Notification, QueueStore, RejectReason, UniquePolicy,
};
pub use registry::{FunctionDef, JobContext, JobError, Registry};
pub use retry::{RetryPolicy, RetryStrategy};
pub use serializer::{JsonSerializer, Serializer};
pub use worker::{Worker, WorkerSummary};

#[cfg(feature = "redis")]
pub use queue::RedisStore;

#[cfg(feature = "msgpack")]
pub use serializer::MsgPackSerializer;

/// Convenient type alias for Results with [`MillworkError`] as the error type.
pub type Result<T> = std::result::Result<T, MillworkError>;
