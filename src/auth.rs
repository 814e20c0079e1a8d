//! Human-intervention queue for challenge pages.
//!
//! When the browser path hits a CAPTCHA it can queue the challenge and keep
//! the page open for a person to resolve; the owning job parks in
//! `awaiting_auth`. `resolve_auth` settles the queue entry and moves the
//! job — back to `queued` on success so a worker retries it with the now-
//! authenticated profile, to `failed` otherwise.

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::error::FetchReason;
use crate::fetch::challenge::ChallengeKind;

/// One pending intervention.
#[derive(Debug, Clone)]
pub struct AuthQueueEntry {
    pub id: String,
    pub task_id: String,
    pub job_id: Option<String>,
    pub url: String,
    pub domain: String,
    pub auth_type: String,
    pub estimated_effort: String,
    pub priority: String,
    pub status: String,
}

/// Durable intervention queue over the `auth_queue` table.
#[derive(Debug, Clone)]
pub struct InterventionQueue {
    pool: SqlitePool,
}

impl InterventionQueue {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Queue a challenge for human resolution. Returns the queue id.
    pub async fn enqueue(
        &self,
        task_id: &str,
        job_id: Option<&str>,
        url: &str,
        domain: &str,
        kind: ChallengeKind,
        priority: &str,
    ) -> anyhow::Result<String> {
        let queue_id = format!("auth_{}", Uuid::new_v4().simple());
        sqlx::query(
            r#"
            INSERT INTO auth_queue
            (id, task_id, job_id, url, domain, auth_type, estimated_effort,
             priority, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(&queue_id)
        .bind(task_id)
        .bind(job_id)
        .bind(url)
        .bind(domain)
        .bind(kind.as_str())
        .bind(kind.estimated_effort().as_str())
        .bind(priority)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        info!(
            queue_id,
            task_id,
            domain,
            auth_type = kind.as_str(),
            effort = kind.estimated_effort().as_str(),
            "authentication queued"
        );
        Ok(queue_id)
    }

    /// Pending entries for a task.
    pub async fn pending_for_task(&self, task_id: &str) -> anyhow::Result<Vec<AuthQueueEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, job_id, url, domain, auth_type,
                   estimated_effort, priority, status
            FROM auth_queue
            WHERE task_id = ? AND status = 'pending'
            ORDER BY created_at ASC
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_entry).collect())
    }

    /// Whether a domain has a successfully resolved intervention, meaning
    /// the live profile now carries its authenticated cookies.
    pub async fn has_resolved_session_for_domain(&self, domain: &str) -> anyhow::Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM auth_queue WHERE domain = ? AND status = 'resolved' AND outcome = 'success'",
        )
        .bind(domain)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") > 0)
    }

    /// Settle a queue entry. On success the owning job returns to `queued`
    /// (the worker retries against the authenticated profile); otherwise it
    /// fails with `auth_required`. Returns the owning task id when the
    /// entry existed and was pending.
    pub async fn resolve(&self, queue_id: &str, outcome: &str) -> anyhow::Result<Option<String>> {
        let now = Utc::now().to_rfc3339();
        let row = sqlx::query(
            "SELECT job_id, task_id FROM auth_queue WHERE id = ? AND status = 'pending'",
        )
        .bind(queue_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let job_id: Option<String> = row.get("job_id");
        let task_id: String = row.get("task_id");

        sqlx::query(
            "UPDATE auth_queue SET status = 'resolved', outcome = ?, resolved_at = ? WHERE id = ?",
        )
        .bind(outcome)
        .bind(&now)
        .bind(queue_id)
        .execute(&self.pool)
        .await?;

        if let Some(job_id) = job_id {
            if outcome == "success" {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'queued', started_at = NULL, finished_at = NULL,
                        error_message = NULL
                    WHERE id = ? AND state = 'awaiting_auth'
                    "#,
                )
                .bind(&job_id)
                .execute(&self.pool)
                .await?;
            } else {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'failed', finished_at = ?, error_message = ?
                    WHERE id = ? AND state = 'awaiting_auth'
                    "#,
                )
                .bind(&now)
                .bind(FetchReason::AuthRequired.as_str())
                .bind(&job_id)
                .execute(&self.pool)
                .await?;
            }
        }

        info!(queue_id, outcome, "intervention resolved");
        Ok(Some(task_id))
    }
}

fn row_to_entry(row: sqlx::sqlite::SqliteRow) -> AuthQueueEntry {
    AuthQueueEntry {
        id: row.get("id"),
        task_id: row.get("task_id"),
        job_id: row.get("job_id"),
        url: row.get("url"),
        domain: row.get("domain"),
        auth_type: row.get("auth_type"),
        estimated_effort: row.get("estimated_effort"),
        priority: row.get("priority"),
        status: row.get("status"),
    }
}
