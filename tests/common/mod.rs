//! Shared helpers for integration tests.
//!
//! Each test binary compiles this module independently, so not every
//! helper is used everywhere.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use lancet::config::Settings;
use lancet::scheduler::{BudgetManager, JobScheduler};
use sqlx::SqlitePool;

pub async fn memory_pool() -> SqlitePool {
    lancet::storage::db::open_memory_pool()
        .await
        .expect("in-memory pool")
}

pub fn settings() -> Arc<Settings> {
    Arc::new(Settings::default())
}

pub async fn scheduler(pool: &SqlitePool) -> JobScheduler {
    let budget = Arc::new(BudgetManager::new(settings()));
    JobScheduler::new(pool.clone(), budget)
}

/// Poll `check` every 25 ms until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// State of one job row.
pub async fn job_state(pool: &SqlitePool, job_id: &str) -> Option<String> {
    use sqlx::Row;
    sqlx::query("SELECT state FROM jobs WHERE id = ?")
        .bind(job_id)
        .fetch_optional(pool)
        .await
        .expect("state query")
        .map(|row| row.get("state"))
}

/// Insert a raw job row, bypassing submit-time checks.
pub async fn insert_job_row(
    pool: &SqlitePool,
    id: &str,
    task_id: Option<&str>,
    kind: &str,
    priority: i64,
    slot: &str,
    state: &str,
    queued_at: &str,
) {
    sqlx::query(
        r#"
        INSERT INTO jobs (id, task_id, kind, priority, slot, state, input_json, queued_at)
        VALUES (?, ?, ?, ?, ?, ?, '{}', ?)
        "#,
    )
    .bind(id)
    .bind(task_id)
    .bind(kind)
    .bind(priority)
    .bind(slot)
    .bind(state)
    .bind(queued_at)
    .execute(pool)
    .await
    .expect("insert job row");
}
