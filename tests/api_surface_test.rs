//! End-to-end surface: submit → execute → long-poll → status, plus the
//! awaiting-auth resolution path.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{insert_job_row, job_state, memory_pool, settings, wait_until};
use futures::future::BoxFuture;
use lancet::api::{Lancet, Target, TargetKind};
use lancet::scheduler::{TargetAction, TargetOutcome};
use serde_json::json;

async fn core_with_trivial_target_action() -> Lancet {
    let pool = memory_pool().await;
    let lancet = Lancet::with_pool(settings(), pool).await.expect("core");
    lancet.register_target_action(Arc::new(|job: lancet::scheduler::ClaimedJob| {
        Box::pin(async move {
            let value = job
                .input
                .pointer("/target/value")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Ok(TargetOutcome::completed(json!({
                "status": "ok",
                "target": value,
            })))
        }) as BoxFuture<'static, anyhow::Result<TargetOutcome>>
    }) as Arc<dyn TargetAction>);
    lancet
}

#[tokio::test]
async fn submit_target_runs_to_completion_and_notifies() {
    let lancet = Arc::new(core_with_trivial_target_action().await);
    lancet.start().await;

    // subscribe the long poll before any work can finish
    let waiter = {
        let lancet = Arc::clone(&lancet);
        tokio::spawn(async move { lancet.wait_for_change("task1", 10.0).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let submitted = lancet
        .submit_target(
            "task1",
            Target {
                kind: TargetKind::Query,
                value: "rust async scheduling".to_string(),
            },
            json!({}),
        )
        .await
        .unwrap();
    assert!(submitted.accepted);
    assert!(submitted.eta.is_some());

    // the long poll sees the completion
    assert!(waiter.await.unwrap());

    let job_id = submitted.job_id.clone();
    let pool = lancet.pool().clone();
    assert!(
        wait_until(Duration::from_secs(10), || {
            let pool = pool.clone();
            let job_id = job_id.clone();
            async move { job_state(&pool, &job_id).await.as_deref() == Some("completed") }
        })
        .await
    );

    let status = lancet.get_status("task1").await.unwrap();
    assert!(status.recent_jobs.iter().any(|job| job.job_id == job_id));
    assert!(status.budget.is_some());

    lancet.shutdown().await;
}

#[tokio::test]
async fn cancel_task_reports_cancelled_jobs() {
    let pool = memory_pool().await;
    let lancet = Lancet::with_pool(settings(), pool.clone()).await.unwrap();
    // no workers started: submitted jobs stay queued

    let submitted = lancet
        .submit_target(
            "taskc",
            Target {
                kind: TargetKind::Url,
                value: "https://example.com/x".to_string(),
            },
            json!({}),
        )
        .await
        .unwrap();
    assert!(submitted.accepted);

    let cancelled = lancet.cancel_task("taskc", "immediate").await.unwrap();
    assert_eq!(cancelled, vec![submitted.job_id.clone()]);
    assert_eq!(job_state(&pool, &submitted.job_id).await.as_deref(), Some("cancelled"));

    // unsupported modes are refused
    assert!(lancet.cancel_task("taskc", "graceful").await.is_err());
}

#[tokio::test]
async fn resolve_auth_requeues_owning_job() {
    let pool = memory_pool().await;
    let lancet = Lancet::with_pool(settings(), pool.clone()).await.unwrap();

    insert_job_row(&pool, "jauth", Some("taska"), "target_queue", 25, "network_client", "awaiting_auth", "2026-01-01T00:00:00Z").await;
    let queue_id = lancet
        .auth_queue()
        .enqueue(
            "taska",
            Some("jauth"),
            "https://example.com/login",
            "example.com",
            lancet::ChallengeKind::Turnstile,
            "medium",
        )
        .await
        .unwrap();

    let status = lancet.get_status("taska").await.unwrap();
    assert_eq!(status.awaiting_auth.len(), 1);
    assert_eq!(status.awaiting_auth[0].auth_type, "turnstile");
    assert_eq!(status.awaiting_auth[0].estimated_effort, "medium");

    assert!(lancet.resolve_auth(&queue_id, "success").await.unwrap());
    assert_eq!(job_state(&pool, "jauth").await.as_deref(), Some("queued"));

    // a second resolve is a no-op
    assert!(!lancet.resolve_auth(&queue_id, "success").await.unwrap());
}

#[tokio::test]
async fn failed_auth_resolution_fails_the_job() {
    let pool = memory_pool().await;
    let lancet = Lancet::with_pool(settings(), pool.clone()).await.unwrap();

    insert_job_row(&pool, "jfail", Some("taskf"), "target_queue", 25, "network_client", "awaiting_auth", "2026-01-01T00:00:00Z").await;
    let queue_id = lancet
        .auth_queue()
        .enqueue(
            "taskf",
            Some("jfail"),
            "https://example.com/x",
            "example.com",
            lancet::ChallengeKind::Recaptcha,
            "high",
        )
        .await
        .unwrap();

    assert!(lancet.resolve_auth(&queue_id, "abandoned").await.unwrap());
    assert_eq!(job_state(&pool, "jfail").await.as_deref(), Some("failed"));
}
