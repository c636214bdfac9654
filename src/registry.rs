//! Handler registry: the functions a worker knows how to run.
//!
//! Handlers are async closures taking a [`JobContext`] and returning a JSON
//! value on success or a [`JobError`] describing how the failure should be
//! treated.
//!
//! ```rust
//! use millwork::registry::{FunctionDef, JobError, Registry};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! let registry = Registry::new()
//!     .register("send_email", |ctx| async move {
//!         let address: String = ctx.arg(0)?;
//!         if address.is_empty() {
//!             return Err(JobError::permanent("empty address"));
//!         }
//!         Ok(json!({ "sent_to": address }))
//!     })
//!     .register_function(
//!         FunctionDef::new("slow_report", |_ctx| async move { Ok(json!(null)) })
//!             .with_timeout(Duration::from_secs(600)),
//!     );
//!
//! assert!(registry.get("send_email").is_some());
//! ```

use crate::{MillworkError, job::JobId, retry::RetryStrategy};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::{collections::HashMap, fmt, future::Future, pin::Pin, sync::Arc, time::Duration};
use thiserror::Error;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::warn;

/// How a handler failed, and so what the executor does next.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JobError {
    /// Ordinary failure; retried per the retry policy while tries remain.
    #[error("{message}")]
    Failed { message: String },

    /// Explicit retry request, optionally after `defer` instead of the backoff delay.
    #[error("retry requested: {message}")]
    Retry {
        defer: Option<Duration>,
        message: String,
    },

    /// Failure that retrying cannot fix; the job fails immediately.
    #[error("{message}")]
    Permanent { message: String },
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        JobError::Failed {
            message: message.into(),
        }
    }

    pub fn retry(message: impl Into<String>) -> Self {
        JobError::Retry {
            defer: None,
            message: message.into(),
        }
    }

    pub fn retry_after(message: impl Into<String>, defer: Duration) -> Self {
        JobError::Retry {
            defer: Some(defer),
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        JobError::Permanent {
            message: message.into(),
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, JobError::Permanent { .. })
    }
}

impl From<MillworkError> for JobError {
    fn from(err: MillworkError) -> Self {
        JobError::failed(err.to_string())
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::permanent(format!("invalid value: {}", err))
    }
}

/// Everything a handler learns about the job it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub function_name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    /// 1 on the first attempt.
    pub try_count: u32,
    pub max_tries: u32,
    pub enqueue_time: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub worker_id: String,
    cancellation: CancellationToken,
}

impl JobContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: JobId,
        function_name: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        try_count: u32,
        max_tries: u32,
        enqueue_time: DateTime<Utc>,
        start_time: DateTime<Utc>,
        worker_id: impl Into<String>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            function_name: function_name.into(),
            args,
            kwargs,
            try_count,
            max_tries,
            enqueue_time,
            start_time,
            worker_id: worker_id.into(),
            cancellation,
        }
    }

    /// Decode positional argument `index`. Missing or mistyped arguments are
    /// permanent failures.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, JobError> {
        let value = self
            .args
            .get(index)
            .ok_or_else(|| JobError::permanent(format!("missing argument {}", index)))?;
        serde_json::from_value(value.clone()).map_err(|e| {
            JobError::permanent(format!("argument {} has the wrong type: {}", index, e))
        })
    }

    /// Decode keyword argument `name`, `None` if it was not passed.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, JobError> {
        self.kwargs
            .get(name)
            .map(|value| {
                serde_json::from_value(value.clone()).map_err(|e| {
                    JobError::permanent(format!("argument {} has the wrong type: {}", name, e))
                })
            })
            .transpose()
    }

    pub fn is_last_try(&self) -> bool {
        self.try_count >= self.max_tries
    }

    /// True once the job is being aborted, timed out or the worker is stopping.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when the job is cancelled; handlers can select on it to stop early.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancellation.cancelled()
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, JobError>> + Send>>;

pub type JobHandler = Arc<dyn Fn(JobContext) -> HandlerFuture + Send + Sync>;

/// A registered function and its per-function overrides.
#[derive(Clone)]
pub struct FunctionDef {
    pub name: String,
    handler: JobHandler,
    /// Execution budget; a per-job timeout still wins.
    pub timeout: Option<Duration>,
    /// Upper bound on attempts, applied on top of the job's own `max_tries`.
    pub max_tries: Option<u32>,
    pub retry_strategy: Option<RetryStrategy>,
    pub keep_result: Option<Duration>,
}

impl FunctionDef {
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            handler: Arc::new(move |ctx| Box::pin(handler(ctx))),
            timeout: None,
            max_tries: None,
            retry_strategy: None,
            keep_result: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = Some(max_tries.max(1));
        self
    }

    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }

    pub fn keep_result(mut self, retention: Duration) -> Self {
        self.keep_result = Some(retention);
        self
    }

    pub fn handler(&self) -> &JobHandler {
        &self.handler
    }

    pub fn call(&self, ctx: JobContext) -> HandlerFuture {
        (self.handler)(ctx)
    }

    /// Attempts allowed for a job recorded with `job_max_tries`.
    pub fn effective_max_tries(&self, job_max_tries: u32) -> u32 {
        match self.max_tries {
            Some(limit) => job_max_tries.min(limit),
            None => job_max_tries,
        }
    }
}

impl fmt::Debug for FunctionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDef")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("max_tries", &self.max_tries)
            .field("retry_strategy", &self.retry_strategy)
            .field("keep_result", &self.keep_result)
            .finish_non_exhaustive()
    }
}

/// Function name to [`FunctionDef`] lookup shared by every executor task.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    functions: HashMap<String, FunctionDef>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
    {
        self.register_function(FunctionDef::new(name, handler))
    }

    pub fn register_function(mut self, function: FunctionDef) -> Self {
        if self.functions.contains_key(&function.name) {
            warn!("Replacing existing handler for function {}", function.name);
        }
        self.functions.insert(function.name.clone(), function);
        self
    }

    pub fn get(&self, function_name: &str) -> Option<&FunctionDef> {
        self.functions.get(function_name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
