mod test_utils;

use chrono::Duration as ChronoDuration;
use millwork::{
    Clock, EnqueueOptions, EnqueueOutcome, JobId, JobPayload, JobQueue, JobStatus, QueueStore,
    RejectReason, Serializer, UniquePolicy, Worker, registry::Registry,
};
use serde_json::json;
use std::{sync::Arc, time::Duration};

#[tokio::test]
async fn test_unique_key_replaces_pending_job() {
    let (clock, store, queue) = test_utils::mock_setup();
    let now = clock.now();

    let first = queue
        .enqueue(
            "daily_report",
            JobPayload::new().arg("v1"),
            EnqueueOptions::new()
                .with_unique_key("daily-report")
                .defer_until(now + ChronoDuration::minutes(10)),
        )
        .await
        .unwrap();
    let EnqueueOutcome::Enqueued(job_id) = first else {
        panic!("expected a new job, got {:?}", first);
    };

    let later = now + ChronoDuration::minutes(30);
    let second = queue
        .enqueue(
            "daily_report",
            JobPayload::new().arg("v2"),
            EnqueueOptions::new()
                .with_unique_key("daily-report")
                .defer_until(later),
        )
        .await
        .unwrap();
    assert_eq!(second, EnqueueOutcome::Replaced(job_id.clone()));

    let queued = queue.queued_jobs().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].id, job_id);
    assert_eq!(queued[0].due_time, later);
    assert_eq!(queued[0].status, JobStatus::Deferred);

    let payload = queue.serializer().decode(&queued[0].payload).unwrap();
    assert_eq!(payload.args, vec![json!("v2")]);
    assert_eq!(store.in_flight_count().await, 0);
}

#[tokio::test]
async fn test_unique_key_reject_policy() {
    let (_clock, store, _queue) = test_utils::mock_setup();
    let queue = JobQueue::new(store).with_unique_policy(UniquePolicy::Reject);

    let options = || {
        EnqueueOptions::new()
            .with_unique_key("sync-account-7")
            .defer_by(Duration::from_secs(60))
    };
    assert!(!queue
        .enqueue("sync", JobPayload::new(), options())
        .await
        .unwrap()
        .is_rejected());
    assert_eq!(
        queue.enqueue("sync", JobPayload::new(), options()).await.unwrap(),
        EnqueueOutcome::Rejected(RejectReason::Duplicate)
    );
    assert_eq!(queue.queued_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_unique_key_held_by_running_job() {
    let (clock, store, queue) = test_utils::mock_setup();
    let outcome = queue
        .enqueue(
            "sync",
            JobPayload::new(),
            EnqueueOptions::new().with_unique_key("sync-account-7"),
        )
        .await
        .unwrap();
    let job_id = outcome.job_id().unwrap().clone();

    store
        .claim(&job_id, "worker-a", clock.now(), Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        queue
            .enqueue(
                "sync",
                JobPayload::new(),
                EnqueueOptions::new().with_unique_key("sync-account-7"),
            )
            .await
            .unwrap(),
        EnqueueOutcome::Rejected(RejectReason::AlreadyRunning)
    );
}

#[tokio::test]
async fn test_caller_job_id_is_rejected_while_retained() {
    let (clock, _store, queue) = test_utils::mock_setup();
    let options = || EnqueueOptions::new().with_job_id("invoice-1001");

    assert_eq!(
        queue.enqueue("bill", JobPayload::new(), options()).await.unwrap(),
        EnqueueOutcome::Enqueued(JobId::from("invoice-1001"))
    );
    assert_eq!(
        queue.enqueue("bill", JobPayload::new(), options()).await.unwrap(),
        EnqueueOutcome::Rejected(RejectReason::Duplicate)
    );

    clock.advance(ChronoDuration::days(30));
    assert!(queue
        .enqueue("bill", JobPayload::new(), options())
        .await
        .unwrap()
        .is_rejected());
}

#[tokio::test]
async fn test_status_lifecycle_through_worker() {
    let (_store, queue) = test_utils::memory_setup();
    let registry =
        Registry::new().register("double", |ctx| async move {
            let n: i64 = ctx.arg(0)?;
            Ok(json!(n * 2))
        });

    let job_id = queue
        .enqueue("double", JobPayload::new().arg(21), EnqueueOptions::new())
        .await
        .unwrap()
        .job_id()
        .unwrap()
        .clone();
    assert_eq!(queue.status(&job_id).await.unwrap(), Some(JobStatus::Queued));

    let worker = Worker::new(queue.store().clone(), registry, test_utils::fast_config());
    worker.run_burst().await.unwrap();

    assert_eq!(queue.status(&job_id).await.unwrap(), Some(JobStatus::Complete));
    assert_eq!(queue.result_value(&job_id).await.unwrap(), Some(json!(42)));
    let results = queue.results().await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].success);
    assert!(queue.status(&JobId::from("nope")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_abort_pending_job_does_not_use_a_try() {
    let (_store, queue) = test_utils::memory_setup();
    let registry = Registry::new().register("never", |_ctx| async move { Ok(json!("ran")) });

    let job_id = queue
        .enqueue("never", JobPayload::new(), EnqueueOptions::new())
        .await
        .unwrap()
        .job_id()
        .unwrap()
        .clone();
    assert!(queue.abort(&job_id).await.unwrap());

    let worker = Worker::new(queue.store().clone(), registry, test_utils::fast_config());
    let summary = worker.run_burst().await.unwrap();
    assert_eq!(summary.failed, 1);

    let result = queue.result(&job_id).await.unwrap().unwrap();
    assert_eq!(result.error.as_deref(), Some("aborted"));
    assert_eq!(result.try_count, 0);
    assert!(!queue.abort(&job_id).await.unwrap());
}

#[tokio::test]
async fn test_expired_job_is_never_run() {
    let (clock, store, queue) = test_utils::mock_setup();
    let registry = Registry::new().register("stale", |_ctx| async move { Ok(json!("ran")) });
    let job_id = queue
        .enqueue(
            "stale",
            JobPayload::new(),
            EnqueueOptions::new().expires(Duration::from_secs(60)),
        )
        .await
        .unwrap()
        .job_id()
        .unwrap()
        .clone();
    clock.advance(ChronoDuration::minutes(5));

    let worker = Worker::new(store, registry, test_utils::fast_config())
        .with_clock(Arc::new(clock.clone()));
    worker.run_burst().await.unwrap();

    let result = queue.result(&job_id).await.unwrap().unwrap();
    assert!(!result.success);
    assert!(result.error.unwrap().contains("expired"));
}

#[tokio::test]
async fn test_failed_notice_does_not_fail_committed_calls() {
    let (memory, _queue) = test_utils::memory_setup();
    let store = Arc::new(test_utils::FlakyStore::new(memory));
    let queue = JobQueue::new(store.clone());

    store.fail_next(test_utils::StoreOp::Publish, 2);
    let outcome = queue
        .enqueue(
            "bill",
            JobPayload::new(),
            EnqueueOptions::new().with_job_id("invoice-7"),
        )
        .await
        .unwrap();
    assert_eq!(outcome, EnqueueOutcome::Enqueued(JobId::from("invoice-7")));
    assert_eq!(queue.queued_count().await.unwrap(), 1);

    assert!(queue.abort(&JobId::from("invoice-7")).await.unwrap());
    assert!(queue
        .store()
        .is_abort_requested(&JobId::from("invoice-7"))
        .await
        .unwrap());
    assert_eq!(store.failures(test_utils::StoreOp::Publish), 2);
}
