//! Worker-pool behaviour: single-winner races, cancellation that spares
//! the worker, and follow-up enqueues.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use common::{insert_job_row, job_state, memory_pool, scheduler, wait_until};
use futures::future::BoxFuture;
use lancet::scheduler::{
    JobKind, Slot, TargetAction, TargetOutcome, TaskEvents, WorkerManager,
};
use serde_json::json;

struct CountingAction {
    invocations: Arc<AtomicU32>,
    delay: Duration,
    output: serde_json::Value,
}

impl TargetAction for CountingAction {
    fn run(
        &self,
        _job: lancet::scheduler::ClaimedJob,
    ) -> BoxFuture<'static, anyhow::Result<TargetOutcome>> {
        let invocations = Arc::clone(&self.invocations);
        let delay = self.delay;
        let output = self.output.clone();
        Box::pin(async move {
            invocations.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok(TargetOutcome::completed(output))
        })
    }
}

#[tokio::test]
async fn two_workers_one_job_exactly_one_execution() {
    let pool = memory_pool().await;
    let sched = scheduler(&pool).await;
    let events = Arc::new(TaskEvents::new());
    let workers = WorkerManager::new(sched.clone(), Arc::clone(&events));

    let invocations = Arc::new(AtomicU32::new(0));
    workers.register_action(
        JobKind::TargetQueue,
        Arc::new(CountingAction {
            invocations: Arc::clone(&invocations),
            delay: Duration::from_millis(50),
            output: json!({"status": "ok"}),
        }),
    );

    insert_job_row(&pool, "solo", Some("t1"), "target_queue", 25, "network_client", "queued", "2026-01-01T00:00:00Z").await;

    workers.start_slot(Slot::NetworkClient, 2).await;

    assert!(
        wait_until(Duration::from_secs(10), || {
            let pool = pool.clone();
            async move { job_state(&pool, "solo").await.as_deref() == Some("completed") }
        })
        .await
    );
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    workers.stop().await;
}

#[tokio::test]
async fn priority_order_processed_by_single_worker() {
    let pool = memory_pool().await;
    let sched = scheduler(&pool).await;
    let events = Arc::new(TaskEvents::new());
    let workers = WorkerManager::new(sched.clone(), Arc::clone(&events));

    let order: Arc<parking_lot::Mutex<Vec<String>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let order_ref = Arc::clone(&order);
    workers.register_action(
        JobKind::TargetQueue,
        Arc::new(move |job: lancet::scheduler::ClaimedJob| {
            let order = Arc::clone(&order_ref);
            Box::pin(async move {
                order.lock().push(job.job_id.clone());
                Ok(TargetOutcome::completed(json!({})))
            }) as BoxFuture<'static, anyhow::Result<TargetOutcome>>
        }) as Arc<dyn TargetAction>,
    );

    let at = "2026-01-01T00:00:00Z";
    insert_job_row(&pool, "p90", Some("t1"), "target_queue", 90, "network_client", "queued", at).await;
    insert_job_row(&pool, "p10", Some("t1"), "target_queue", 10, "network_client", "queued", at).await;
    insert_job_row(&pool, "p50", Some("t1"), "target_queue", 50, "network_client", "queued", at).await;

    workers.start_slot(Slot::NetworkClient, 1).await;

    assert!(
        wait_until(Duration::from_secs(10), || {
            let order = Arc::clone(&order);
            async move { order.lock().len() == 3 }
        })
        .await
    );
    assert_eq!(*order.lock(), vec!["p10", "p50", "p90"]);

    workers.stop().await;
}

#[tokio::test]
async fn cancellation_aborts_job_but_not_worker() {
    let pool = memory_pool().await;
    let sched = scheduler(&pool).await;
    let events = Arc::new(TaskEvents::new());
    let workers = WorkerManager::new(sched.clone(), Arc::clone(&events));

    let invocations = Arc::new(AtomicU32::new(0));
    workers.register_action(
        JobKind::TargetQueue,
        Arc::new(CountingAction {
            invocations: Arc::clone(&invocations),
            // long enough that the cancel always lands mid-flight
            delay: Duration::from_secs(30),
            output: json!({}),
        }),
    );

    insert_job_row(&pool, "c1", Some("t1"), "target_queue", 25, "network_client", "queued", "2026-01-01T00:00:00Z").await;
    insert_job_row(&pool, "c2", Some("t1"), "target_queue", 25, "network_client", "queued", "2026-01-01T00:00:01Z").await;

    workers.start_slot(Slot::NetworkClient, 1).await;
    let workers_before = workers.worker_count().await;

    // wait until the first job is actually in flight
    assert!(
        wait_until(Duration::from_secs(10), || {
            let workers = Arc::clone(&workers);
            async move { workers.running_job_count() == 1 }
        })
        .await
    );

    let cancelled = workers.cancel_task("t1").await.unwrap();
    assert!(!cancelled.is_empty());

    // the in-flight job lands in cancelled, never completed
    assert!(
        wait_until(Duration::from_secs(10), || {
            let pool = pool.clone();
            async move { job_state(&pool, "c1").await.as_deref() == Some("cancelled") }
        })
        .await
    );
    // the second job was still queued at cancel time
    assert_eq!(job_state(&pool, "c2").await.as_deref(), Some("cancelled"));

    // the worker survived and picks up new work for another task
    assert_eq!(workers.worker_count().await, workers_before);
    insert_job_row(&pool, "c3", Some("t2"), "target_queue", 25, "network_client", "queued", "2026-01-01T00:00:02Z").await;
    assert!(
        wait_until(Duration::from_secs(10), || {
            let pool = pool.clone();
            async move { job_state(&pool, "c3").await.as_deref() != Some("queued") }
        })
        .await
    );

    workers.stop().await;
}

#[tokio::test]
async fn idle_workers_report_queue_empty() {
    let pool = memory_pool().await;
    let sched = scheduler(&pool).await;
    let events = Arc::new(TaskEvents::new());
    let workers = WorkerManager::new(sched.clone(), Arc::clone(&events));

    workers.start_slot(Slot::NetworkClient, 1).await;
    assert!(workers.wait_for_queue_empty(Duration::from_secs(10)).await);
    workers.stop().await;
}

#[tokio::test]
async fn completion_signals_status_change_event() {
    let pool = memory_pool().await;
    let sched = scheduler(&pool).await;
    let events = Arc::new(TaskEvents::new());
    let workers = WorkerManager::new(sched.clone(), Arc::clone(&events));

    workers.register_action(
        JobKind::TargetQueue,
        Arc::new(CountingAction {
            invocations: Arc::new(AtomicU32::new(0)),
            delay: Duration::from_millis(10),
            output: json!({}),
        }),
    );

    insert_job_row(&pool, "e1", Some("t1"), "target_queue", 25, "network_client", "queued", "2026-01-01T00:00:00Z").await;

    let waiter = {
        let events = Arc::clone(&events);
        tokio::spawn(async move { events.wait_for_change("t1", Duration::from_secs(10)).await })
    };
    // give the waiter a moment to subscribe before work starts
    tokio::time::sleep(Duration::from_millis(50)).await;

    workers.start_slot(Slot::NetworkClient, 1).await;
    assert!(waiter.await.unwrap());

    workers.stop().await;
}

#[tokio::test]
async fn target_completion_enqueues_verify_and_citation_followups() {
    let pool = memory_pool().await;
    let sched = scheduler(&pool).await;
    let events = Arc::new(TaskEvents::new());
    let workers = WorkerManager::new(sched.clone(), Arc::clone(&events));

    let output = json!({
        "status": "ok",
        "papers": [
            {"doi": "10.1/x", "title": "Paper X", "abstract": "Findings about X."}
        ]
    });
    workers.register_action(
        JobKind::TargetQueue,
        Arc::new(CountingAction {
            invocations: Arc::new(AtomicU32::new(0)),
            delay: Duration::from_millis(10),
            output,
        }),
    );

    insert_job_row(&pool, "t_job", Some("t1"), "target_queue", 25, "network_client", "queued", "2026-01-01T00:00:00Z").await;

    workers.start_slot(Slot::NetworkClient, 1).await;

    assert!(
        wait_until(Duration::from_secs(10), || {
            let pool = pool.clone();
            async move { job_state(&pool, "t_job").await.as_deref() == Some("completed") }
        })
        .await
    );

    // verify_nli enqueued unconditionally, citation_graph because the
    // completion carried a paper with an abstract
    assert!(
        wait_until(Duration::from_secs(5), || {
            let pool = pool.clone();
            async move {
                use sqlx::Row;
                let row = sqlx::query(
                    "SELECT \
                     SUM(CASE WHEN kind = 'verify_nli' THEN 1 ELSE 0 END) AS v, \
                     SUM(CASE WHEN kind = 'citation_graph' THEN 1 ELSE 0 END) AS c \
                     FROM jobs",
                )
                .fetch_one(&pool)
                .await
                .unwrap();
                row.get::<Option<i64>, _>("v").unwrap_or(0) == 1
                    && row.get::<Option<i64>, _>("c").unwrap_or(0) == 1
            }
        })
        .await
    );

    workers.stop().await;
}
