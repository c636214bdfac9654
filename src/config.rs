//! Configuration for millwork workers and queues.
//!
//! Everything can be loaded from TOML, where durations are written as
//! human-readable strings (`"500ms"`, `"30s"`, `"5m"`, `"1h"`, `"1d"`), or
//! from `MILLWORK_*` environment variables.

use crate::{MillworkError, Result, queue::UniquePolicy, retry::RetryStrategy};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// Parse a duration like `"250ms"`, `"30s"`, `"5m"`, `"1h"`, `"2d"` or a bare
/// number of seconds.
pub fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    let s = raw.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("Invalid duration format: {}", raw))?;
    let (num_str, suffix) = s.split_at(split);
    let num: u64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", raw))?;

    let secs = |factor: u64| {
        num.checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("Duration out of range: {}", raw))
    };
    match suffix.trim() {
        "ms" => Ok(Duration::from_millis(num)),
        "s" => secs(1),
        "m" => secs(60),
        "h" => secs(3600),
        "d" => secs(86400),
        other => Err(format!(
            "Invalid duration suffix: {}. Use ms, s, m, h, or d",
            other
        )),
    }
}

/// Render a duration in the largest unit that represents it exactly.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis % 1000 != 0 {
        return format!("{}ms", millis);
    }
    let secs = duration.as_secs();
    if secs == 0 {
        "0s".to_string()
    } else if secs % 86400 == 0 {
        format!("{}d", secs / 86400)
    } else if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Text(String),
    Seconds(u64),
}

impl RawDuration {
    fn into_duration(self) -> std::result::Result<Duration, String> {
        match self {
            RawDuration::Text(text) => parse_duration(&text),
            RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
        }
    }
}

/// `#[serde(with = "duration_format")]` for `std::time::Duration`.
pub mod duration_format {
    use super::{RawDuration, format_duration};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        RawDuration::deserialize(deserializer)?
            .into_duration()
            .map_err(D::Error::custom)
    }
}

/// `#[serde(with = "option_duration_format")]` for `Option<Duration>`.
pub mod option_duration_format {
    use super::{RawDuration, format_duration};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => serializer.serialize_some(&format_duration(*duration)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<RawDuration>::deserialize(deserializer)?
            .map(|raw| raw.into_duration().map_err(D::Error::custom))
            .transpose()
    }
}

/// Top-level configuration.
///
/// ```rust
/// use millwork::config::MillworkConfig;
/// use std::time::Duration;
///
/// let config = MillworkConfig::new()
///     .with_store_url("redis://cache:6379/2")
///     .with_max_jobs(25)
///     .with_job_timeout(Duration::from_secs(60));
/// assert_eq!(config.worker.max_jobs, 25);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MillworkConfig {
    pub store: StoreConfig,
    pub worker: WorkerConfig,
    pub cron: CronConfig,
    pub logging: LoggingConfig,
}

impl MillworkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store_url(mut self, url: &str) -> Self {
        self.store.url = url.to_string();
        self
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.store.namespace = namespace.to_string();
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.worker.max_jobs = max_jobs;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.worker.job_timeout = timeout;
        self
    }

    pub fn with_burst(mut self, burst: bool) -> Self {
        self.worker.burst = burst;
        self
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Defaults overridden by any `MILLWORK_*` variables that are set.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = env_var("MILLWORK_STORE_URL") {
            config.store.url = url;
        }
        if let Some(namespace) = env_var("MILLWORK_NAMESPACE") {
            config.store.namespace = namespace;
        }
        if let Some(worker_id) = env_var("MILLWORK_WORKER_ID") {
            config.worker.worker_id = Some(worker_id);
        }
        if let Some(max_jobs) = env_parse("MILLWORK_MAX_JOBS")? {
            config.worker.max_jobs = max_jobs;
        }
        if let Some(poll_delay) = env_duration("MILLWORK_POLL_DELAY")? {
            config.worker.poll_delay = poll_delay;
        }
        if let Some(timeout) = env_duration("MILLWORK_JOB_TIMEOUT")? {
            config.worker.job_timeout = timeout;
        }
        if let Some(timeout) = env_duration("MILLWORK_CLAIM_TIMEOUT")? {
            config.worker.claim_timeout = timeout;
        }
        if let Some(max_tries) = env_parse("MILLWORK_MAX_TRIES")? {
            config.worker.default_max_tries = max_tries;
        }
        if let Some(burst) = env_parse("MILLWORK_BURST")? {
            config.worker.burst = burst;
        }
        if let Some(window) = env_duration("MILLWORK_CRON_CATCH_UP")? {
            config.cron.catch_up_window = window;
        }
        if let Some(level) = env_var("MILLWORK_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(json) = env_parse("MILLWORK_LOG_JSON")? {
            config.logging.json_format = json;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let worker = &self.worker;
        if worker.max_jobs == 0 {
            return Err(MillworkError::Config("max_jobs must be at least 1".into()));
        }
        if worker.poll_delay.is_zero() {
            return Err(MillworkError::Config("poll_delay must be positive".into()));
        }
        if worker.claim_timeout.is_zero() {
            return Err(MillworkError::Config(
                "claim_timeout must be positive".into(),
            ));
        }
        if worker.renew_interval() >= worker.claim_timeout {
            return Err(MillworkError::Config(format!(
                "claim_renew_interval ({}) must be shorter than claim_timeout ({})",
                format_duration(worker.renew_interval()),
                format_duration(worker.claim_timeout)
            )));
        }
        if self.cron.tick_interval.is_zero() {
            return Err(MillworkError::Config(
                "cron tick_interval must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn development() -> Self {
        Self {
            store: StoreConfig {
                namespace: "millwork-dev".to_string(),
                ..Default::default()
            },
            worker: WorkerConfig {
                max_jobs: 2,
                poll_delay: Duration::from_millis(100),
                health_check_interval: Duration::from_secs(10),
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                include_location: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn production() -> Self {
        Self {
            worker: WorkerConfig {
                max_jobs: 50,
                shutdown_grace_period: Duration::from_secs(30),
                ..Default::default()
            },
            cron: CronConfig {
                catch_up_window: Duration::from_secs(5 * 60),
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json_format: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    env_var(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| MillworkError::Config(format!("{} has an invalid value: {}", name, raw)))
        })
        .transpose()
}

fn env_duration(name: &str) -> Result<Option<Duration>> {
    env_var(name)
        .map(|raw| {
            parse_duration(&raw).map_err(|e| MillworkError::Config(format!("{}: {}", name, e)))
        })
        .transpose()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `memory://` selects the in-process store; anything else is a Redis URL.
    pub url: String,
    /// Prefix for every key the queue writes.
    pub namespace: String,
}

impl StoreConfig {
    pub fn is_memory(&self) -> bool {
        self.url.starts_with("memory://")
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            namespace: crate::keys::DEFAULT_NAMESPACE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Stable identity for heartbeats and claim ownership; generated when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    /// Jobs run concurrently by one worker.
    pub max_jobs: usize,

    #[serde(with = "duration_format")]
    pub poll_delay: Duration,

    /// How long a claim lasts without renewal.
    #[serde(with = "duration_format")]
    pub claim_timeout: Duration,

    /// Defaults to a third of `claim_timeout`.
    #[serde(
        with = "option_duration_format",
        skip_serializing_if = "Option::is_none"
    )]
    pub claim_renew_interval: Option<Duration>,

    pub default_max_tries: u32,

    #[serde(with = "duration_format")]
    pub job_timeout: Duration,

    #[serde(with = "duration_format")]
    pub result_retention: Duration,

    /// Due ids read per poll. Defaults to `max_jobs * 5`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_read_limit: Option<usize>,

    #[serde(with = "duration_format")]
    pub health_check_interval: Duration,

    #[serde(with = "duration_format")]
    pub shutdown_grace_period: Duration,

    /// Exit once the queue is drained instead of polling forever.
    pub burst: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_burst_jobs: Option<u64>,

    pub retry_strategy: RetryStrategy,

    pub unique_policy: UniquePolicy,
}

impl WorkerConfig {
    pub fn renew_interval(&self) -> Duration {
        self.claim_renew_interval
            .unwrap_or(self.claim_timeout / 3)
            .max(Duration::from_millis(1))
    }

    pub fn read_limit(&self) -> usize {
        self.queue_read_limit
            .unwrap_or(self.max_jobs.saturating_mul(5))
            .max(1)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            max_jobs: 10,
            poll_delay: Duration::from_millis(500),
            claim_timeout: Duration::from_secs(60),
            claim_renew_interval: None,
            default_max_tries: 5,
            job_timeout: Duration::from_secs(300),
            result_retention: Duration::from_secs(86400),
            queue_read_limit: None,
            health_check_interval: Duration::from_secs(60),
            shutdown_grace_period: Duration::from_secs(10),
            burst: false,
            max_burst_jobs: None,
            retry_strategy: RetryStrategy::default(),
            unique_policy: UniquePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    /// How far back a starting scheduler looks for missed occurrences.
    #[serde(with = "duration_format")]
    pub catch_up_window: Duration,

    #[serde(with = "duration_format")]
    pub tick_interval: Duration,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            catch_up_window: Duration::ZERO,
            tick_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `millwork=debug,warn`. `RUST_LOG` wins
    /// when set.
    pub level: String,

    pub json_format: bool,

    /// Include file and line information.
    pub include_location: bool,

    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
            include_target: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = MillworkConfig::default();
        assert_eq!(config.store.namespace, "millwork");
        assert_eq!(config.worker.max_jobs, 10);
        assert_eq!(config.worker.poll_delay, Duration::from_millis(500));
        assert_eq!(config.worker.renew_interval(), Duration::from_secs(20));
        assert_eq!(config.worker.read_limit(), 50);
        assert_eq!(config.cron.catch_up_window, Duration::ZERO);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets() {
        let dev = MillworkConfig::development();
        assert_eq!(dev.worker.max_jobs, 2);
        assert_eq!(dev.logging.level, "debug");

        let prod = MillworkConfig::production();
        assert_eq!(prod.worker.max_jobs, 50);
        assert!(prod.logging.json_format);
        assert_eq!(prod.cron.catch_up_window, Duration::from_secs(300));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration("2d"), Ok(Duration::from_secs(172800)));
        assert_eq!(parse_duration(" 90 "), Ok(Duration::from_secs(90)));
        assert!(parse_duration("5w").is_err());
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
        assert_eq!(format_duration(Duration::from_secs(86400)), "1d");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: MillworkConfig = toml::from_str(
            r#"
            [store]
            url = "redis://queue:6379/1"

            [worker]
            max_jobs = 4
            poll_delay = "250ms"
            claim_timeout = 30
            unique_policy = "reject"

            [worker.retry_strategy]
            type = "fixed"
            delay = "15s"
            "#,
        )
        .unwrap();

        assert_eq!(config.store.url, "redis://queue:6379/1");
        assert_eq!(config.store.namespace, "millwork");
        assert_eq!(config.worker.max_jobs, 4);
        assert_eq!(config.worker.poll_delay, Duration::from_millis(250));
        assert_eq!(config.worker.claim_timeout, Duration::from_secs(30));
        assert_eq!(config.worker.renew_interval(), Duration::from_secs(10));
        assert_eq!(config.worker.unique_policy, UniquePolicy::Reject);
        assert_eq!(
            config.worker.retry_strategy,
            RetryStrategy::fixed(Duration::from_secs(15))
        );
        assert_eq!(config.worker.job_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("millwork.toml");

        let mut config = MillworkConfig::new()
            .with_store_url("redis://localhost:6380")
            .with_max_jobs(6);
        config.worker.claim_renew_interval = Some(Duration::from_secs(5));
        config.worker.max_burst_jobs = Some(100);
        config.save_to_file(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("poll_delay = \"500ms\""));
        assert!(content.contains("result_retention = \"1d\""));

        let loaded = MillworkConfig::from_file(&path).unwrap();
        assert_eq!(loaded.store.url, "redis://localhost:6380");
        assert_eq!(loaded.worker.max_jobs, 6);
        assert_eq!(loaded.worker.claim_renew_interval, Some(Duration::from_secs(5)));
        assert_eq!(loaded.worker.max_burst_jobs, Some(100));
        assert_eq!(loaded.worker.retry_strategy, RetryStrategy::default());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = MillworkConfig::default();
        config.worker.max_jobs = 0;
        assert!(matches!(config.validate(), Err(MillworkError::Config(_))));

        let mut config = MillworkConfig::default();
        config.worker.claim_renew_interval = Some(Duration::from_secs(90));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_config() {
        unsafe {
            std::env::set_var("MILLWORK_STORE_URL", "redis://env:6379");
            std::env::set_var("MILLWORK_MAX_JOBS", "12");
            std::env::set_var("MILLWORK_JOB_TIMEOUT", "15m");
            std::env::set_var("MILLWORK_BURST", "true");
        }

        let config = MillworkConfig::from_env().unwrap();
        assert_eq!(config.store.url, "redis://env:6379");
        assert_eq!(config.worker.max_jobs, 12);
        assert_eq!(config.worker.job_timeout, Duration::from_secs(900));
        assert!(config.worker.burst);

        unsafe {
            std::env::set_var("MILLWORK_MAX_JOBS", "lots");
        }
        assert!(MillworkConfig::from_env().is_err());

        unsafe {
            std::env::remove_var("MILLWORK_STORE_URL");
            std::env::remove_var("MILLWORK_MAX_JOBS");
            std::env::remove_var("MILLWORK_JOB_TIMEOUT");
            std::env::remove_var("MILLWORK_BURST");
        }
    }
}
