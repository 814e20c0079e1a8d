//! DB-durable job scheduler with slot/priority dispatch.
//!
//! The jobs table is the single source of truth; no in-memory queue
//! shadows it. Workers claim with a conditional update
//! (`WHERE state = 'queued'`) and finalise with another
//! (`WHERE state = 'running'`) — those two predicates are the core's
//! race-safety device, and no in-process lock substitutes for them.
//! Kind→slot, kind→priority, slot limits and the exclusivity groups are
//! static tables: a new kind extends the enum and its tables together.

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::FetchReason;
use crate::scheduler::budget::{BudgetExceededReason, BudgetManager};

/// Job kinds, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Serp,
    Fetch,
    TargetQueue,
    Extract,
    Nli,
    Embed,
    VerifyNli,
    CitationGraph,
    Llm,
}

impl JobKind {
    pub const ALL: &'static [Self] = &[
        Self::Serp,
        Self::Fetch,
        Self::TargetQueue,
        Self::Extract,
        Self::Nli,
        Self::Embed,
        Self::VerifyNli,
        Self::CitationGraph,
        Self::Llm,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Serp => "serp",
            Self::Fetch => "fetch",
            Self::TargetQueue => "target_queue",
            Self::Extract => "extract",
            Self::Nli => "nli",
            Self::Embed => "embed",
            Self::VerifyNli => "verify_nli",
            Self::CitationGraph => "citation_graph",
            Self::Llm => "llm",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.as_str() == s)
    }
}

/// Bounded-concurrency resource classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Gpu,
    BrowserHeadful,
    NetworkClient,
    CpuNlp,
}

impl Slot {
    pub const ALL: &'static [Self] = &[
        Self::Gpu,
        Self::BrowserHeadful,
        Self::NetworkClient,
        Self::CpuNlp,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gpu => "gpu",
            Self::BrowserHeadful => "browser_headful",
            Self::NetworkClient => "network_client",
            Self::CpuNlp => "cpu_nlp",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|slot| slot.as_str() == s)
    }
}

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    AwaitingAuth,
}

impl JobState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::AwaitingAuth => "awaiting_auth",
        }
    }
}

/// Kind → slot table.
#[must_use]
pub const fn kind_slot(kind: JobKind) -> Slot {
    match kind {
        JobKind::Serp | JobKind::Fetch | JobKind::TargetQueue => Slot::NetworkClient,
        JobKind::Extract | JobKind::Nli | JobKind::VerifyNli | JobKind::CitationGraph => {
            Slot::CpuNlp
        }
        JobKind::Embed | JobKind::Llm => Slot::Gpu,
    }
}

/// Kind → default priority table (lower = more urgent).
#[must_use]
pub const fn kind_priority(kind: JobKind) -> i64 {
    match kind {
        JobKind::Serp => 10,
        JobKind::Fetch => 20,
        JobKind::TargetQueue => 25,
        JobKind::Extract => 30,
        JobKind::Nli => 35,
        JobKind::Embed => 40,
        JobKind::VerifyNli => 45,
        JobKind::CitationGraph => 50,
        JobKind::Llm => 60,
    }
}

/// Slot concurrency limits.
#[must_use]
pub const fn slot_limit(slot: Slot) -> u32 {
    match slot {
        Slot::Gpu => 1,
        Slot::BrowserHeadful => 1,
        Slot::NetworkClient => 4,
        Slot::CpuNlp => 8,
    }
}

/// Mutually exclusive slot groups: hardware contention between on-GPU
/// models and the attached browser on the same host.
pub const EXCLUSIVE_GROUPS: &[&[Slot]] = &[&[Slot::Gpu, Slot::BrowserHeadful]];

/// Outcome of `submit`: either the queued job's coordinates or a fail-soft
/// rejection reason.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub accepted: bool,
    pub job_id: String,
    pub slot: Option<Slot>,
    pub priority: Option<i64>,
    pub eta: Option<String>,
    pub reason: Option<String>,
}

/// A full job row.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub task_id: Option<String>,
    pub kind: String,
    pub priority: i64,
    pub slot: String,
    pub state: String,
    pub input_json: Option<String>,
    pub output_json: Option<String>,
    pub error_message: Option<String>,
    pub queued_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub cause_id: Option<String>,
}

/// What a worker receives after winning a claim.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job_id: String,
    pub task_id: Option<String>,
    pub kind: JobKind,
    pub input: serde_json::Value,
    pub cause_id: Option<String>,
}

/// The scheduler facade over the jobs table.
#[derive(Clone)]
pub struct JobScheduler {
    pool: SqlitePool,
    budget: std::sync::Arc<BudgetManager>,
}

impl JobScheduler {
    #[must_use]
    pub fn new(pool: SqlitePool, budget: std::sync::Arc<BudgetManager>) -> Self {
        Self { pool, budget }
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Reset orphans from a previous process: every `queued` or `running`
    /// row is forced to `failed` with reason `server_restart_reset`.
    /// Terminal rows are untouched; the call is idempotent. Must run once
    /// at process start before any worker begins.
    pub async fn startup_reset(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'failed', error_message = ?, finished_at = ?
            WHERE state IN ('queued', 'running')
            "#,
        )
        .bind(FetchReason::ServerRestartReset.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        let reset = result.rows_affected();
        if reset > 0 {
            info!(reset, "startup reset forced stale jobs to failed");
        }
        Ok(reset)
    }

    /// Submit a job. Pre-admission checks (budget, exclusivity) reject
    /// fail-soft — no half-queued row is ever left behind.
    pub async fn submit(
        &self,
        kind: JobKind,
        input: serde_json::Value,
        priority: Option<i64>,
        task_id: Option<&str>,
        cause_id: Option<&str>,
    ) -> Result<SubmitOutcome, sqlx::Error> {
        let slot = kind_slot(kind);
        let priority = priority.unwrap_or_else(|| kind_priority(kind));
        let job_id = Uuid::new_v4().to_string();

        if let Some(task_id) = task_id {
            if let Some(reason) = self.budget_rejection(task_id, kind).await {
                warn!(job_id, task_id, kind = kind.as_str(), reason, "job rejected by budget");
                return Ok(SubmitOutcome {
                    accepted: false,
                    job_id,
                    slot: None,
                    priority: None,
                    eta: None,
                    reason: Some(reason),
                });
            }
        }

        if !self.exclusivity_allows(slot).await? {
            return Ok(SubmitOutcome {
                accepted: false,
                job_id,
                slot: None,
                priority: None,
                eta: None,
                reason: Some(FetchReason::ExclusiveSlotBusy.as_str().to_string()),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO jobs (id, task_id, kind, priority, slot, state, input_json, queued_at, cause_id)
            VALUES (?, ?, ?, ?, ?, 'queued', ?, ?, ?)
            "#,
        )
        .bind(&job_id)
        .bind(task_id)
        .bind(kind.as_str())
        .bind(priority)
        .bind(slot.as_str())
        .bind(input.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(cause_id)
        .execute(&self.pool)
        .await?;

        let eta = self.estimate_eta(slot).await?;
        info!(
            job_id,
            kind = kind.as_str(),
            slot = slot.as_str(),
            priority,
            "job submitted"
        );

        Ok(SubmitOutcome {
            accepted: true,
            job_id,
            slot: Some(slot),
            priority: Some(priority),
            eta: Some(eta),
            reason: None,
        })
    }

    async fn budget_rejection(&self, task_id: &str, kind: JobKind) -> Option<String> {
        let (can_continue, reason) = self.budget.check_and_update(task_id, false, 0.0).await;
        if !can_continue {
            let reason = reason.map_or("budget_exceeded", BudgetExceededReason::as_str);
            return Some(format!("budget_{reason}"));
        }
        if kind == JobKind::Fetch && !self.budget.can_fetch_page(task_id).await {
            return Some(FetchReason::BudgetPageLimit.as_str().to_string());
        }
        if kind == JobKind::Llm && !self.budget.can_run_llm(task_id).await {
            return Some(FetchReason::BudgetLlmRatio.as_str().to_string());
        }
        None
    }

    /// Exclusivity gate: if any job runs in another slot of the same group,
    /// this slot may not start one.
    pub async fn exclusivity_allows(&self, slot: Slot) -> Result<bool, sqlx::Error> {
        for group in EXCLUSIVE_GROUPS {
            if !group.contains(&slot) {
                continue;
            }
            for other in group.iter().filter(|other| **other != slot) {
                let running = self.running_count(*other).await?;
                if running > 0 {
                    debug!(
                        slot = slot.as_str(),
                        busy = other.as_str(),
                        "exclusive slot busy"
                    );
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Count of `running` rows in a slot.
    pub async fn running_count(&self, slot: Slot) -> Result<u32, sqlx::Error> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM jobs WHERE slot = ? AND state = 'running'")
            .bind(slot.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u32)
    }

    async fn queued_count(&self, slot: Slot) -> Result<u32, sqlx::Error> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM jobs WHERE slot = ? AND state = 'queued'")
            .bind(slot.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u32)
    }

    /// Rough start estimate: 30 s per job waiting ahead of a free slot.
    async fn estimate_eta(&self, slot: Slot) -> Result<String, sqlx::Error> {
        let queued = self.queued_count(slot).await?;
        let running = self.running_count(slot).await?;
        let limit = slot_limit(slot);
        let waiting = queued.saturating_sub(limit.saturating_sub(running));
        let eta_secs = waiting * 30;
        Ok(if eta_secs < 60 {
            format!("{eta_secs}s")
        } else {
            format!("{}m", eta_secs / 60)
        })
    }

    /// Claim the next queued job for a slot.
    ///
    /// Selection is priority ASC then queued_at ASC (FIFO within a
    /// priority); the claim itself is the conditional update — whichever
    /// worker's update reports one affected row owns the job. Exclusivity
    /// and the slot limit are verified before claiming.
    pub async fn claim_next(&self, slot: Slot) -> Result<Option<ClaimedJob>, sqlx::Error> {
        if !self.exclusivity_allows(slot).await? {
            return Ok(None);
        }
        if self.running_count(slot).await? >= slot_limit(slot) {
            return Ok(None);
        }

        let candidate = sqlx::query(
            r#"
            SELECT id, task_id, kind, input_json, cause_id
            FROM jobs
            WHERE slot = ? AND state = 'queued'
            ORDER BY priority ASC, queued_at ASC
            LIMIT 1
            "#,
        )
        .bind(slot.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = candidate else {
            return Ok(None);
        };
        let job_id: String = row.get("id");

        // CAS: only the worker whose update flips queued -> running wins.
        let claimed = sqlx::query(
            "UPDATE jobs SET state = 'running', started_at = ? WHERE id = ? AND state = 'queued'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(&job_id)
        .execute(&self.pool)
        .await?;

        if claimed.rows_affected() != 1 {
            debug!(job_id, "job claimed by another worker");
            return Ok(None);
        }

        let kind_str: String = row.get("kind");
        let Some(kind) = JobKind::parse(&kind_str) else {
            // A row with an unknown kind cannot be executed; fail it so the
            // queue does not wedge.
            self.finalize(&job_id, JobState::Failed, None, Some(&format!("unknown job kind: {kind_str}")))
                .await?;
            return Ok(None);
        };
        let input_json: Option<String> = row.get("input_json");
        let input = input_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_else(|| serde_json::json!({}));

        Ok(Some(ClaimedJob {
            job_id,
            task_id: row.get("task_id"),
            kind,
            input,
            cause_id: row.get("cause_id"),
        }))
    }

    /// Write a terminal state under the `WHERE state = 'running'` predicate.
    /// Returns whether the write landed — zero rows means a concurrent
    /// cancel won and the result must be discarded.
    pub async fn finalize(
        &self,
        job_id: &str,
        state: JobState,
        output: Option<&serde_json::Value>,
        error_message: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        debug_assert!(matches!(
            state,
            JobState::Completed | JobState::Failed | JobState::Cancelled | JobState::AwaitingAuth
        ));

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?, finished_at = ?, output_json = ?, error_message = ?
            WHERE id = ? AND state = 'running'
            "#,
        )
        .bind(state.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(output.map(serde_json::Value::to_string))
        .bind(error_message.map(|msg| truncate_error(msg)))
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Cancel a job. Queued jobs flip directly; running jobs are the worker
    /// manager's business (it aborts the action and writes `cancelled`
    /// under the running predicate). Succeeds only from `queued`/`running`.
    pub async fn cancel(&self, job_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'cancelled', finished_at = ?
            WHERE id = ? AND state = 'queued'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            info!(job_id, "job cancelled");
            return Ok(true);
        }
        Ok(false)
    }

    /// Cancel every queued job of a task. Returns the flipped job ids.
    pub async fn cancel_queued_for_task(&self, task_id: &str) -> Result<Vec<String>, sqlx::Error> {
        let rows = sqlx::query("SELECT id FROM jobs WHERE task_id = ? AND state = 'queued'")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;

        let mut cancelled = Vec::new();
        for row in rows {
            let job_id: String = row.get("id");
            if self.cancel(&job_id).await? {
                cancelled.push(job_id);
            }
        }
        Ok(cancelled)
    }

    /// Fetch a job row.
    pub async fn status(&self, job_id: &str) -> Result<Option<JobRow>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row_to_job(&row)))
    }

    /// Recent jobs of a task, newest first.
    pub async fn recent_jobs(&self, task_id: &str, limit: u32) -> Result<Vec<JobRow>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE task_id = ? ORDER BY queued_at DESC LIMIT ?",
        )
        .bind(task_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_job).collect())
    }

    /// Queue depth and running count for a task.
    pub async fn task_queue_stats(&self, task_id: &str) -> Result<(u32, u32), sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT
                SUM(CASE WHEN state = 'queued' THEN 1 ELSE 0 END) AS depth,
                SUM(CASE WHEN state = 'running' THEN 1 ELSE 0 END) AS running
            FROM jobs WHERE task_id = ?
            "#,
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await?;
        let depth: Option<i64> = row.get("depth");
        let running: Option<i64> = row.get("running");
        Ok((depth.unwrap_or(0) as u32, running.unwrap_or(0) as u32))
    }

    /// Record budget consumption after an action finished, before
    /// finalisation: fetches count pages, LLM jobs count wall time.
    pub async fn record_budget_consumption(
        &self,
        task_id: Option<&str>,
        kind: JobKind,
        job_duration_secs: f64,
    ) {
        let Some(task_id) = task_id else { return };
        match kind {
            JobKind::Fetch => {
                self.budget.check_and_update(task_id, true, 0.0).await;
            }
            JobKind::Llm => {
                self.budget
                    .check_and_update(task_id, false, job_duration_secs)
                    .await;
            }
            _ => {}
        }
    }

    #[must_use]
    pub fn budget(&self) -> &std::sync::Arc<BudgetManager> {
        &self.budget
    }
}

fn truncate_error(msg: &str) -> String {
    msg.chars().take(1000).collect()
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> JobRow {
    JobRow {
        id: row.get("id"),
        task_id: row.get("task_id"),
        kind: row.get("kind"),
        priority: row.get("priority"),
        slot: row.get("slot"),
        state: row.get("state"),
        input_json: row.get("input_json"),
        output_json: row.get("output_json"),
        error_message: row.get("error_message"),
        queued_at: row.get("queued_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        cause_id: row.get("cause_id"),
    }
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler").finish_non_exhaustive()
    }
}
