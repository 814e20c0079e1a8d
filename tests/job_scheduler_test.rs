//! Scheduler semantics: startup reset, CAS claims, conditional terminal
//! writes, exclusivity, and submit-time budget rejection.

mod common;

use std::sync::Arc;

use common::{insert_job_row, job_state, memory_pool, scheduler};
use lancet::config::Settings;
use lancet::scheduler::{BudgetManager, JobKind, JobScheduler, JobState, Slot};
use serde_json::json;

#[tokio::test]
async fn startup_reset_flips_only_live_states() {
    let pool = memory_pool().await;
    let sched = scheduler(&pool).await;

    insert_job_row(&pool, "j_queued", None, "fetch", 20, "network_client", "queued", "2026-01-01T00:00:00Z").await;
    insert_job_row(&pool, "j_running", None, "fetch", 20, "network_client", "running", "2026-01-01T00:00:01Z").await;
    insert_job_row(&pool, "j_done", None, "fetch", 20, "network_client", "completed", "2026-01-01T00:00:02Z").await;
    insert_job_row(&pool, "j_cancelled", None, "fetch", 20, "network_client", "cancelled", "2026-01-01T00:00:03Z").await;

    let reset = sched.startup_reset().await.unwrap();
    assert_eq!(reset, 2);

    assert_eq!(job_state(&pool, "j_queued").await.as_deref(), Some("failed"));
    assert_eq!(job_state(&pool, "j_running").await.as_deref(), Some("failed"));
    assert_eq!(job_state(&pool, "j_done").await.as_deref(), Some("completed"));
    assert_eq!(job_state(&pool, "j_cancelled").await.as_deref(), Some("cancelled"));

    let row = sched.status("j_queued").await.unwrap().unwrap();
    assert_eq!(row.error_message.as_deref(), Some("server_restart_reset"));
    assert!(row.finished_at.is_some());

    // idempotence: a second call touches nothing
    assert_eq!(sched.startup_reset().await.unwrap(), 0);
}

#[tokio::test]
async fn claim_follows_priority_then_fifo() {
    let pool = memory_pool().await;
    let sched = scheduler(&pool).await;

    // identical queued_at, priorities 90 / 10 / 50
    let at = "2026-01-01T00:00:00Z";
    insert_job_row(&pool, "j90", None, "target_queue", 90, "network_client", "queued", at).await;
    insert_job_row(&pool, "j10", None, "target_queue", 10, "network_client", "queued", at).await;
    insert_job_row(&pool, "j50", None, "target_queue", 50, "network_client", "queued", at).await;

    let mut order = Vec::new();
    while let Some(job) = sched.claim_next(Slot::NetworkClient).await.unwrap() {
        order.push(job.job_id.clone());
        sched.finalize(&job.job_id, JobState::Completed, None, None).await.unwrap();
    }
    assert_eq!(order, vec!["j10", "j50", "j90"]);
}

#[tokio::test]
async fn fifo_breaks_ties_within_priority() {
    let pool = memory_pool().await;
    let sched = scheduler(&pool).await;

    insert_job_row(&pool, "late", None, "fetch", 20, "network_client", "queued", "2026-01-01T00:00:05Z").await;
    insert_job_row(&pool, "early", None, "fetch", 20, "network_client", "queued", "2026-01-01T00:00:01Z").await;

    let first = sched.claim_next(Slot::NetworkClient).await.unwrap().unwrap();
    assert_eq!(first.job_id, "early");
}

#[tokio::test]
async fn terminal_states_refuse_further_writes() {
    let pool = memory_pool().await;
    let sched = scheduler(&pool).await;

    insert_job_row(&pool, "j1", None, "fetch", 20, "network_client", "queued", "2026-01-01T00:00:00Z").await;
    let claimed = sched.claim_next(Slot::NetworkClient).await.unwrap().unwrap();
    assert_eq!(claimed.job_id, "j1");

    assert!(sched.finalize("j1", JobState::Cancelled, None, None).await.unwrap());
    // the losing completion is rejected by rowcount
    assert!(!sched.finalize("j1", JobState::Completed, Some(&json!({"x": 1})), None).await.unwrap());
    assert_eq!(job_state(&pool, "j1").await.as_deref(), Some("cancelled"));

    // cancel succeeds only from queued
    assert!(!sched.cancel("j1").await.unwrap());
}

#[tokio::test]
async fn started_at_set_exactly_on_claim() {
    let pool = memory_pool().await;
    let sched = scheduler(&pool).await;

    let outcome = sched
        .submit(JobKind::Fetch, json!({"url": "https://example.com"}), None, None, None)
        .await
        .unwrap();
    assert!(outcome.accepted);

    let row = sched.status(&outcome.job_id).await.unwrap().unwrap();
    assert!(row.started_at.is_none());

    sched.claim_next(Slot::NetworkClient).await.unwrap().unwrap();
    let row = sched.status(&outcome.job_id).await.unwrap().unwrap();
    assert!(row.started_at.is_some());
    assert!(row.finished_at.is_none());
}

#[tokio::test]
async fn exclusivity_blocks_gpu_while_browser_runs() {
    let pool = memory_pool().await;
    let sched = scheduler(&pool).await;

    insert_job_row(&pool, "b1", None, "target_queue", 25, "browser_headful", "running", "2026-01-01T00:00:00Z").await;

    // submit-time rejection
    let outcome = sched
        .submit(JobKind::Embed, json!({"texts": []}), None, None, None)
        .await
        .unwrap();
    assert!(!outcome.accepted);
    assert_eq!(outcome.reason.as_deref(), Some("exclusive_slot_busy"));

    // claim-time gate: a queued gpu row stays unclaimed
    insert_job_row(&pool, "g1", None, "embed", 40, "gpu", "queued", "2026-01-01T00:00:01Z").await;
    assert!(sched.claim_next(Slot::Gpu).await.unwrap().is_none());

    // once the browser job terminates, the gpu claim goes through
    sqlx::query("UPDATE jobs SET state = 'completed' WHERE id = 'b1'")
        .execute(&pool)
        .await
        .unwrap();
    assert!(sched.claim_next(Slot::Gpu).await.unwrap().is_some());
}

#[tokio::test]
async fn slot_limit_bounds_concurrent_claims() {
    let pool = memory_pool().await;
    let sched = scheduler(&pool).await;

    for i in 0..3 {
        insert_job_row(
            &pool,
            &format!("g{i}"),
            None,
            "embed",
            40,
            "gpu",
            "queued",
            "2026-01-01T00:00:00Z",
        )
        .await;
    }

    // gpu limit is 1: second claim is refused while the first runs
    assert!(sched.claim_next(Slot::Gpu).await.unwrap().is_some());
    assert!(sched.claim_next(Slot::Gpu).await.unwrap().is_none());
}

#[tokio::test]
async fn budget_rejects_at_submit_without_leaving_rows() {
    let pool = memory_pool().await;
    let mut custom = Settings::default();
    custom.budget.max_pages_per_task = 0;
    let budget = Arc::new(BudgetManager::new(Arc::new(custom)));
    budget.create_budget("t1").await;
    let sched = JobScheduler::new(pool.clone(), budget);

    let outcome = sched
        .submit(JobKind::Fetch, json!({"url": "https://example.com"}), None, Some("t1"), None)
        .await
        .unwrap();
    assert!(!outcome.accepted);
    assert_eq!(outcome.reason.as_deref(), Some("budget_page_limit"));

    // fail-soft: no half-queued row exists
    assert!(sched.status(&outcome.job_id).await.unwrap().is_none());
}

#[tokio::test]
async fn cancel_queued_for_task_is_scoped() {
    let pool = memory_pool().await;
    let sched = scheduler(&pool).await;

    insert_job_row(&pool, "a1", Some("t1"), "fetch", 20, "network_client", "queued", "2026-01-01T00:00:00Z").await;
    insert_job_row(&pool, "a2", Some("t1"), "fetch", 20, "network_client", "queued", "2026-01-01T00:00:01Z").await;
    insert_job_row(&pool, "b1", Some("t2"), "fetch", 20, "network_client", "queued", "2026-01-01T00:00:02Z").await;

    let cancelled = sched.cancel_queued_for_task("t1").await.unwrap();
    assert_eq!(cancelled.len(), 2);
    assert_eq!(job_state(&pool, "b1").await.as_deref(), Some("queued"));
}
