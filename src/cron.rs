//! Recurring jobs.
//!
//! A [`RecurringJob`] never lives in the store. The [`CronScheduler`] turns it
//! into ordinary deferred jobs whose ids are derived from the occurrence time,
//! so any number of scheduler instances racing on the same definition produce
//! one record per period: every enqueue after the first is rejected as a
//! duplicate.

use crate::{
    Result,
    job::{EnqueueOptions, JobId, JobPayload, from_millis, sub_duration, to_millis},
    queue::{EnqueueOutcome, JobQueue},
};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum CronError {
    #[error("Invalid cron expression: {0}")]
    InvalidExpression(String),
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),
    #[error("Interval must be at least one millisecond")]
    ZeroInterval,
    #[error("Cron parsing error: {0}")]
    ParseError(#[from] cron::error::Error),
}

/// A cron expression evaluated in a timezone.
///
/// Expressions use the six or seven field grammar of the `cron` crate, with a
/// leading seconds field: `"0 30 9 * * Mon-Fri"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronSchedule {
    pub expression: String,
    pub timezone: String,
    #[serde(skip)]
    schedule: Option<cron::Schedule>,
    #[serde(skip)]
    tz: Option<Tz>,
}

impl CronSchedule {
    pub fn new(expression: &str) -> std::result::Result<Self, CronError> {
        Self::with_timezone(expression, "UTC")
    }

    pub fn with_timezone(expression: &str, timezone: &str) -> std::result::Result<Self, CronError> {
        let mut schedule = CronSchedule {
            expression: expression.to_string(),
            timezone: timezone.to_string(),
            schedule: None,
            tz: None,
        };
        schedule.reinitialize()?;
        Ok(schedule)
    }

    /// First occurrence strictly after `after`.
    pub fn next_execution(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let schedule = self.schedule.as_ref()?;
        let tz = self.tz.as_ref()?;
        let next = schedule.after(&after.with_timezone(tz)).next()?;
        Some(next.with_timezone(&Utc))
    }

    pub fn validate(expression: &str) -> std::result::Result<(), CronError> {
        cron::Schedule::from_str(expression)
            .map_err(|e| CronError::InvalidExpression(format!("{}: {}", expression, e)))?;
        Ok(())
    }

    pub fn every_minute() -> std::result::Result<Self, CronError> {
        Self::new("0 * * * * *")
    }

    pub fn every_hour() -> std::result::Result<Self, CronError> {
        Self::new("0 0 * * * *")
    }

    pub fn every_day_at_midnight() -> std::result::Result<Self, CronError> {
        Self::new("0 0 0 * * *")
    }

    /// Rebuild the parsed schedule and timezone, e.g. after deserialization.
    pub fn reinitialize(&mut self) -> std::result::Result<(), CronError> {
        self.schedule = Some(cron::Schedule::from_str(&self.expression).map_err(|e| {
            CronError::InvalidExpression(format!("{}: {}", self.expression, e))
        })?);
        self.tz = Some(
            self.timezone
                .parse::<Tz>()
                .map_err(|_| CronError::InvalidTimezone(self.timezone.clone()))?,
        );
        Ok(())
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// When a recurring job fires.
#[derive(Debug, Clone)]
pub enum Schedule {
    Cron(CronSchedule),
    /// Fixed period measured from the Unix epoch, so every process agrees on
    /// where the boundaries fall.
    Interval(Duration),
}

impl Schedule {
    pub fn cron(expression: &str) -> std::result::Result<Self, CronError> {
        Ok(Schedule::Cron(CronSchedule::new(expression)?))
    }

    pub fn every(period: Duration) -> std::result::Result<Self, CronError> {
        if period.as_millis() == 0 {
            return Err(CronError::ZeroInterval);
        }
        Ok(Schedule::Interval(period))
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron(cron) => cron.next_execution(after),
            Schedule::Interval(period) => {
                let period = i64::try_from(period.as_millis()).ok()?.max(1);
                let next = (to_millis(after).div_euclid(period) + 1).checked_mul(period)?;
                Some(from_millis(next))
            }
        }
    }
}

impl From<CronSchedule> for Schedule {
    fn from(schedule: CronSchedule) -> Self {
        Schedule::Cron(schedule)
    }
}

#[derive(Debug, Clone)]
pub struct RecurringJob {
    pub name: String,
    pub function_name: String,
    pub schedule: Schedule,
    pub payload: JobPayload,
    pub max_tries: Option<u32>,
    pub timeout: Option<Duration>,
    pub keep_result: Option<Duration>,
    /// Also run once, immediately, on the scheduler's first tick.
    pub run_at_startup: bool,
}

impl RecurringJob {
    /// A definition named after its function.
    pub fn new(function_name: impl Into<String>, schedule: Schedule) -> Self {
        let function_name = function_name.into();
        Self {
            name: function_name.clone(),
            function_name,
            schedule,
            payload: JobPayload::new(),
            max_tries: None,
            timeout: None,
            keep_result: None,
            run_at_startup: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_payload(mut self, payload: JobPayload) -> Self {
        self.payload = payload;
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

    pub fn run_at_startup(mut self) -> Self {
        self.run_at_startup = true;
        self
    }

    /// Id shared by every scheduler that computes the occurrence at `run_at`.
    pub fn job_id_for(&self, run_at: DateTime<Utc>) -> JobId {
        JobId::from(format!("cron:{}:{}", self.name, to_millis(run_at)))
    }

    /// Keyed by definition name, which defaults to the function name, so two
    /// definitions of one function never collide.
    pub fn unique_key_for(&self, run_at: DateTime<Utc>) -> String {
        format!("{}:{}", self.name, to_millis(run_at))
    }

    fn options_for(&self, run_at: DateTime<Utc>) -> EnqueueOptions {
        let mut options = EnqueueOptions::new()
            .with_job_id(self.job_id_for(run_at))
            .with_unique_key(self.unique_key_for(run_at))
            .defer_until(run_at);
        if let Some(max_tries) = self.max_tries {
            options = options.with_max_tries(max_tries);
        }
        if let Some(timeout) = self.timeout {
            options = options.with_timeout(timeout);
        }
        if let Some(retention) = self.keep_result {
            options = options.keep_result(retention);
        }
        options
    }
}

/// One occurrence chosen by [`CronScheduler::plan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRun {
    pub name: String,
    pub run_at: DateTime<Utc>,
    pub job_id: JobId,
    pub unique_key: String,
}

/// Turns recurring definitions into deferred jobs.
#[derive(Debug)]
pub struct CronScheduler {
    jobs: Vec<RecurringJob>,
    catch_up_window: Duration,
    /// Last occurrence enqueued per definition.
    cursors: HashMap<String, DateTime<Utc>>,
    started: bool,
}

impl CronScheduler {
    pub fn new(jobs: Vec<RecurringJob>, catch_up_window: Duration) -> Self {
        Self {
            jobs,
            catch_up_window,
            cursors: HashMap::new(),
            started: false,
        }
    }

    pub fn jobs(&self) -> &[RecurringJob] {
        &self.jobs
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Advance every cursor to `now` and return the occurrences to enqueue:
    /// everything missed inside the catch-up window, plus the next upcoming
    /// occurrence, which is enqueued early as a deferred job.
    pub fn plan(&mut self, now: DateTime<Utc>) -> Vec<PlannedRun> {
        let floor = sub_duration(now, self.catch_up_window);
        let first_tick = !self.started;
        self.started = true;

        let mut planned = Vec::new();
        for job in &self.jobs {
            if first_tick && job.run_at_startup {
                planned.push(Self::planned(job, now));
            }

            let mut cursor = self
                .cursors
                .get(&job.name)
                .copied()
                .map_or(floor, |cursor| cursor.max(floor));
            while cursor <= now {
                let Some(next) = job.schedule.next_after(cursor) else {
                    warn!("Recurring job {} has no further occurrences", job.name);
                    break;
                };
                planned.push(Self::planned(job, next));
                cursor = next;
            }
            self.cursors.insert(job.name.clone(), cursor);
        }
        planned
    }

    fn planned(job: &RecurringJob, run_at: DateTime<Utc>) -> PlannedRun {
        PlannedRun {
            name: job.name.clone(),
            run_at,
            job_id: job.job_id_for(run_at),
            unique_key: job.unique_key_for(run_at),
        }
    }

    /// Plan against the queue's clock and enqueue the result. On a store error
    /// the cursors are rolled back so the next tick tries the same occurrences.
    pub async fn tick(&mut self, queue: &JobQueue) -> Result<Vec<EnqueueOutcome>> {
        let now = queue.clock().now();
        let saved_cursors = self.cursors.clone();
        let was_started = self.started;

        let mut outcomes = Vec::new();
        for run in self.plan(now) {
            let Some(job) = self.jobs.iter().find(|job| job.name == run.name) else {
                continue;
            };
            let enqueued = queue
                .enqueue(
                    &job.function_name,
                    job.payload.clone(),
                    job.options_for(run.run_at),
                )
                .await;
            match enqueued {
                Ok(outcome) => {
                    if outcome.is_rejected() {
                        debug!("Occurrence {} already scheduled", run.job_id);
                    } else {
                        info!("Scheduled {} for {}", run.job_id, run.run_at);
                    }
                    outcomes.push(outcome);
                }
                Err(e) => {
                    self.cursors = saved_cursors;
                    self.started = was_started;
                    return Err(e);
                }
            }
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::MockClock,
        job::JobStatus,
        queue::{MemoryStore, RejectReason},
    };
    use chrono::{TimeZone, Timelike};
    use std::sync::Arc;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_cron_schedule_with_timezone() {
        let schedule = CronSchedule::with_timezone("0 0 9 * * *", "America/New_York").unwrap();
        assert_eq!(schedule.timezone, "America/New_York");
        // 09:00 EST is 14:00 UTC in March before DST starts.
        let next = schedule.next_execution(at(12, 0, 0)).unwrap();
        assert_eq!(next, at(14, 0, 0));
    }

    #[test]
    fn test_invalid_schedules() {
        assert!(CronSchedule::new("invalid cron").is_err());
        assert!(CronSchedule::with_timezone("0 0 9 * * *", "Invalid/Timezone").is_err());
        assert!(CronSchedule::validate("0 */5 * * * *").is_ok());
        assert!(matches!(
            Schedule::every(Duration::ZERO),
            Err(CronError::ZeroInterval)
        ));
    }

    #[test]
    fn test_schedule_round_trips_through_json() {
        let schedule: CronSchedule = "0 0 9 * * 1-5".parse().unwrap();
        let json = serde_json::to_string(&schedule).unwrap();
        let mut restored: CronSchedule = serde_json::from_str(&json).unwrap();
        assert!(restored.next_execution(at(0, 0, 0)).is_none());
        restored.reinitialize().unwrap();
        assert_eq!(restored.next_execution(at(0, 0, 0)), Some(at(9, 0, 0)));
    }

    #[test]
    fn test_interval_is_epoch_aligned() {
        let schedule = Schedule::every(Duration::from_secs(15 * 60)).unwrap();
        assert_eq!(schedule.next_after(at(10, 7, 31)), Some(at(10, 15, 0)));
        assert_eq!(schedule.next_after(at(10, 15, 0)), Some(at(10, 30, 0)));
    }

    #[test]
    fn test_plan_enqueues_only_the_next_occurrence() {
        let job = RecurringJob::new("report", Schedule::cron("0 0 * * * *").unwrap());
        let mut scheduler = CronScheduler::new(vec![job], Duration::ZERO);

        let planned = scheduler.plan(at(10, 20, 0));
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].run_at, at(11, 0, 0));
        assert_eq!(
            planned[0].job_id.as_str(),
            format!("cron:report:{}", to_millis(at(11, 0, 0)))
        );

        assert!(scheduler.plan(at(10, 40, 0)).is_empty());

        let planned = scheduler.plan(at(11, 0, 0));
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].run_at, at(12, 0, 0));
    }

    #[test]
    fn test_plan_catches_up_within_window() {
        let job = RecurringJob::new("tick", Schedule::every(Duration::from_secs(600)).unwrap());
        let mut scheduler = CronScheduler::new(vec![job], Duration::from_secs(30 * 60));

        let runs: Vec<_> = scheduler
            .plan(at(10, 0, 0))
            .into_iter()
            .map(|run| run.run_at)
            .collect();
        assert_eq!(
            runs,
            vec![at(9, 40, 0), at(9, 50, 0), at(10, 0, 0), at(10, 10, 0)]
        );
    }

    #[test]
    fn test_plan_drops_occurrences_older_than_window() {
        let job = RecurringJob::new("tick", Schedule::every(Duration::from_secs(60)).unwrap());
        let mut scheduler = CronScheduler::new(vec![job], Duration::from_secs(120));
        scheduler.plan(at(10, 0, 0));

        // The process stalled for an hour.
        let runs: Vec<_> = scheduler
            .plan(at(11, 0, 30))
            .into_iter()
            .map(|run| run.run_at.minute())
            .collect();
        assert_eq!(runs, vec![59, 0, 1]);
    }

    #[test]
    fn test_run_at_startup_only_on_first_plan() {
        let job = RecurringJob::new("warmup", Schedule::cron("0 0 0 * * *").unwrap())
            .run_at_startup();
        let mut scheduler = CronScheduler::new(vec![job], Duration::ZERO);

        let planned = scheduler.plan(at(10, 0, 0));
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[0].run_at, at(10, 0, 0));

        assert!(scheduler.plan(at(10, 0, 1)).is_empty());
    }

    #[tokio::test]
    async fn test_two_schedulers_enqueue_one_job() {
        let clock = MockClock::starting_at(at(10, 59, 58));
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let queue = JobQueue::new(store).with_clock(Arc::new(clock.clone()));

        let definition = RecurringJob::new("cleanup", Schedule::cron("0 0 11 * * *").unwrap())
            .with_max_tries(2);
        let mut first = CronScheduler::new(vec![definition.clone()], Duration::ZERO);
        let mut second = CronScheduler::new(vec![definition.clone()], Duration::ZERO);

        let a = first.tick(&queue).await.unwrap();
        let b = second.tick(&queue).await.unwrap();
        assert!(matches!(a[0], EnqueueOutcome::Enqueued(_)));
        assert_eq!(b[0], EnqueueOutcome::Rejected(RejectReason::Duplicate));

        let job_id = definition.job_id_for(at(11, 0, 0));
        let job = queue.job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Deferred);
        assert_eq!(job.due_time, at(11, 0, 0));
        assert_eq!(job.max_tries, 2);
        assert_eq!(queue.queued_count().await.unwrap(), 1);
    }
}
