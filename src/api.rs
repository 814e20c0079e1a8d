//! Orchestrator-facing surface.
//!
//! `Lancet` owns the pool, scheduler, workers, budgets, fetchers and
//! policy managers, and exposes the tool contract as plain async methods —
//! the wire transport (MCP, RPC) is the embedder's concern. Construction
//! wires the built-in actions: `fetch` runs the HTTP pipeline,
//! `verify_nli` the cross-verifier, `citation_graph` the graph persister.
//! The target-execution action (`target_queue`) is injected by the
//! embedder, whose search scrapers and extraction live outside this core.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use tracing::info;

use crate::auth::{AuthQueueEntry, InterventionQueue};
use crate::config::Settings;
use crate::fetch::http::{HttpFetchOptions, HttpFetcher};
use crate::fetch::rate_limiter::DomainRateLimiter;
use crate::fetch::session::SessionTransferManager;
use crate::lifecycle::LifecycleManager;
use crate::ml::MlClient;
use crate::net::dns_policy::DnsPolicyManager;
use crate::net::ipv6::Ipv6ConnectionManager;
use crate::scheduler::budget::{BudgetManager, BudgetSnapshot};
use crate::scheduler::events::TaskEvents;
use crate::scheduler::jobs::{JobKind, JobRow, JobScheduler, SubmitOutcome};
use crate::scheduler::worker::{TargetAction, TargetOutcome, WorkerManager};
use crate::storage::db;
use crate::verify::citation_graph::process_citation_graph;
use crate::verify::cross_verification::verify_claims_nli;

/// What a submitted target is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Query,
    Url,
    Doi,
}

/// A research target: a query string, a URL, or a DOI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub kind: TargetKind,
    pub value: String,
}

/// Result of `submit_target`.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitTargetResult {
    pub accepted: bool,
    pub job_id: String,
    pub queue_depth: u32,
    pub eta: Option<String>,
    pub reason: Option<String>,
}

/// Result of `get_status`.
#[derive(Debug, Serialize)]
pub struct TaskStatus {
    pub queue_depth: u32,
    pub running: u32,
    pub recent_jobs: Vec<JobSummary>,
    pub awaiting_auth: Vec<AuthSummary>,
    pub budget: Option<BudgetSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub kind: String,
    pub state: String,
    pub queued_at: String,
    pub finished_at: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AuthSummary {
    pub queue_id: String,
    pub url: String,
    pub auth_type: String,
    pub estimated_effort: String,
}

/// The assembled core.
pub struct Lancet {
    settings: Arc<Settings>,
    pool: SqlitePool,
    budget: Arc<BudgetManager>,
    scheduler: JobScheduler,
    events: Arc<TaskEvents>,
    workers: Arc<WorkerManager>,
    sessions: Arc<SessionTransferManager>,
    rate_limiter: Arc<DomainRateLimiter>,
    dns_policy: Arc<DnsPolicyManager>,
    ipv6: Arc<Ipv6ConnectionManager>,
    lifecycle: Arc<LifecycleManager>,
    auth_queue: InterventionQueue,
    ml: Arc<MlClient>,
    http_fetcher: Arc<HttpFetcher>,
}

impl Lancet {
    /// Open storage, reset stale jobs, and wire the subsystems. Workers do
    /// not run until [`Lancet::start`].
    pub async fn new(settings: Settings) -> anyhow::Result<Self> {
        let settings = Arc::new(settings);
        let pool = db::open_pool(&settings.storage.database_path).await?;
        Self::with_pool(settings, pool).await
    }

    /// Same wiring over an existing pool (tests use `:memory:`).
    pub async fn with_pool(settings: Arc<Settings>, pool: SqlitePool) -> anyhow::Result<Self> {
        let budget = Arc::new(BudgetManager::new(Arc::clone(&settings)));
        let scheduler = JobScheduler::new(pool.clone(), Arc::clone(&budget));

        // Stale queued/running rows from a previous process must be failed
        // before any worker can claim them.
        scheduler.startup_reset().await?;

        let events = Arc::new(TaskEvents::new());
        let workers = WorkerManager::new(scheduler.clone(), Arc::clone(&events));

        let rate_limiter = Arc::new(DomainRateLimiter::new(Arc::clone(&settings)));
        let sessions = Arc::new(SessionTransferManager::new(Arc::clone(&settings)));
        let dns_policy = Arc::new(DnsPolicyManager::new(Arc::clone(&settings)));
        let ipv6 = Arc::new(Ipv6ConnectionManager::new(Arc::clone(&settings)));
        let _ = ipv6.load_domain_stats(&pool).await;

        let lifecycle = Arc::new(LifecycleManager::new());
        let auth_queue = InterventionQueue::new(pool.clone());
        let ml = Arc::new(MlClient::new(Arc::clone(&settings))?);
        let http_fetcher = Arc::new(HttpFetcher::new(
            Arc::clone(&settings),
            Arc::clone(&rate_limiter),
            Arc::clone(&sessions),
            Arc::clone(&dns_policy),
        )?);

        let lancet = Self {
            settings,
            pool,
            budget,
            scheduler,
            events,
            workers,
            sessions,
            rate_limiter,
            dns_policy,
            ipv6,
            lifecycle,
            auth_queue,
            ml,
            http_fetcher,
        };
        lancet.register_builtin_actions();
        Ok(lancet)
    }

    fn register_builtin_actions(&self) {
        // fetch: single-URL HTTP pipeline
        let fetcher = Arc::clone(&self.http_fetcher);
        self.workers.register_action(
            JobKind::Fetch,
            Arc::new(move |job: crate::scheduler::jobs::ClaimedJob| {
                let fetcher = Arc::clone(&fetcher);
                Box::pin(async move {
                    let url = job
                        .input
                        .get("url")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| anyhow::anyhow!("fetch job missing url"))?
                        .to_string();
                    let options = HttpFetchOptions {
                        referer: job
                            .input
                            .get("referer")
                            .and_then(|v| v.as_str())
                            .map(str::to_string),
                        use_tor: job
                            .input
                            .get("use_tor")
                            .and_then(serde_json::Value::as_bool)
                            .unwrap_or(false),
                        resolve_dns_through_proxy: None,
                        cached_etag: job
                            .input
                            .get("cached_etag")
                            .and_then(|v| v.as_str())
                            .map(str::to_string),
                        cached_last_modified: job
                            .input
                            .get("cached_last_modified")
                            .and_then(|v| v.as_str())
                            .map(str::to_string),
                        extra_headers: Vec::new(),
                    };
                    let result = fetcher.fetch(&url, &options).await;
                    Ok(TargetOutcome::completed(serde_json::to_value(result)?))
                }) as futures::future::BoxFuture<'static, anyhow::Result<TargetOutcome>>
            }) as Arc<dyn TargetAction>,
        );

        // verify_nli: cross-source verification
        let pool = self.pool.clone();
        let ml = Arc::clone(&self.ml);
        let settings = Arc::clone(&self.settings);
        self.workers.register_action(
            JobKind::VerifyNli,
            Arc::new(move |job: crate::scheduler::jobs::ClaimedJob| {
                let pool = pool.clone();
                let ml = Arc::clone(&ml);
                let settings = Arc::clone(&settings);
                Box::pin(async move {
                    let task_id = job
                        .task_id
                        .clone()
                        .or_else(|| {
                            job.input
                                .get("task_id")
                                .and_then(|v| v.as_str())
                                .map(str::to_string)
                        })
                        .ok_or_else(|| anyhow::anyhow!("verify_nli job missing task_id"))?;
                    let claim_ids: Option<Vec<String>> = job
                        .input
                        .get("claim_ids")
                        .and_then(|v| serde_json::from_value(v.clone()).ok());
                    let summary =
                        verify_claims_nli(&pool, &ml, &settings, &task_id, claim_ids.as_deref())
                            .await?;
                    Ok(TargetOutcome::completed(serde_json::to_value(summary)?))
                }) as futures::future::BoxFuture<'static, anyhow::Result<TargetOutcome>>
            }) as Arc<dyn TargetAction>,
        );

        // citation_graph: paper + cites-edge persistence
        let pool = self.pool.clone();
        self.workers.register_action(
            JobKind::CitationGraph,
            Arc::new(move |job: crate::scheduler::jobs::ClaimedJob| {
                let pool = pool.clone();
                Box::pin(async move {
                    let summary = process_citation_graph(&pool, &job.input).await?;
                    Ok(TargetOutcome::completed(serde_json::to_value(summary)?))
                }) as futures::future::BoxFuture<'static, anyhow::Result<TargetOutcome>>
            }) as Arc<dyn TargetAction>,
        );
    }

    /// Bind the embedder's target-execution action (searches, multi-page
    /// ingest). Claimed `target_queue` jobs fail until one is registered.
    pub fn register_target_action(&self, action: Arc<dyn TargetAction>) {
        self.workers.register_action(JobKind::TargetQueue, action);
    }

    /// Start the worker pool.
    pub async fn start(&self) {
        self.workers.start().await;
        info!("lancet core started");
    }

    /// Stop workers and release every tracked resource.
    pub async fn shutdown(&self) {
        self.workers.stop().await;
        self.lifecycle.release_all().await;
        info!("lancet core stopped");
    }

    /// Submit a research target. Creates the task's budget on first use.
    pub async fn submit_target(
        &self,
        task_id: &str,
        target: Target,
        options: serde_json::Value,
    ) -> anyhow::Result<SubmitTargetResult> {
        self.budget.create_budget(task_id).await;

        let input = json!({
            "target": target,
            "options": options,
        });
        let outcome: SubmitOutcome = self
            .scheduler
            .submit(JobKind::TargetQueue, input, None, Some(task_id), None)
            .await?;

        let (queue_depth, _) = self.scheduler.task_queue_stats(task_id).await?;
        Ok(SubmitTargetResult {
            accepted: outcome.accepted,
            job_id: outcome.job_id,
            queue_depth,
            eta: outcome.eta,
            reason: outcome.reason,
        })
    }

    /// Cancel a task (only `immediate` mode exists): abort in-flight
    /// actions, flip queued rows, release task resources, stop the budget.
    pub async fn cancel_task(&self, task_id: &str, mode: &str) -> anyhow::Result<Vec<String>> {
        anyhow::ensure!(mode == "immediate", "unsupported cancellation mode: {mode}");
        let cancelled = self.workers.cancel_task(task_id).await?;
        self.lifecycle.release_task_resources(task_id).await;
        self.budget.stop_budget(task_id, None).await;
        Ok(cancelled)
    }

    /// Task status snapshot for the orchestrator.
    pub async fn get_status(&self, task_id: &str) -> anyhow::Result<TaskStatus> {
        let (queue_depth, running) = self.scheduler.task_queue_stats(task_id).await?;
        let recent: Vec<JobRow> = self.scheduler.recent_jobs(task_id, 20).await?;
        let awaiting: Vec<AuthQueueEntry> = self.auth_queue.pending_for_task(task_id).await?;

        Ok(TaskStatus {
            queue_depth,
            running,
            recent_jobs: recent
                .into_iter()
                .map(|job| JobSummary {
                    job_id: job.id,
                    kind: job.kind,
                    state: job.state,
                    queued_at: job.queued_at,
                    finished_at: job.finished_at,
                    error: job.error_message,
                })
                .collect(),
            awaiting_auth: awaiting
                .into_iter()
                .map(|entry| AuthSummary {
                    queue_id: entry.id,
                    url: entry.url,
                    auth_type: entry.auth_type,
                    estimated_effort: entry.estimated_effort,
                })
                .collect(),
            budget: self.budget.snapshot(task_id).await,
        })
    }

    /// Long-poll for a task status change.
    pub async fn wait_for_change(&self, task_id: &str, timeout_s: f64) -> bool {
        self.events
            .wait_for_change(task_id, Duration::from_secs_f64(timeout_s.max(0.0)))
            .await
    }

    /// Settle a queued intervention.
    pub async fn resolve_auth(&self, queue_id: &str, outcome: &str) -> anyhow::Result<bool> {
        match self.auth_queue.resolve(queue_id, outcome).await? {
            Some(task_id) => {
                self.events.notify(&task_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // Component accessors for embedders composing their own actions.

    /// Browser-path fetcher bound to a worker's debug port
    /// (`debug_port_base + worker_id`), sharing this core's rate limiter,
    /// session store, intervention queue and lifecycle registry.
    #[must_use]
    pub fn browser_fetcher(&self, worker_id: usize) -> crate::fetch::browser::BrowserFetcher {
        crate::fetch::browser::BrowserFetcher::new(
            worker_id,
            Arc::clone(&self.settings),
            Arc::clone(&self.rate_limiter),
            Arc::clone(&self.sessions),
            self.auth_queue.clone(),
            Arc::clone(&self.lifecycle),
        )
    }

    #[must_use]
    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn workers(&self) -> &Arc<WorkerManager> {
        &self.workers
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionTransferManager> {
        &self.sessions
    }

    #[must_use]
    pub fn dns_policy(&self) -> &Arc<DnsPolicyManager> {
        &self.dns_policy
    }

    #[must_use]
    pub fn ipv6(&self) -> &Arc<Ipv6ConnectionManager> {
        &self.ipv6
    }

    #[must_use]
    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    #[must_use]
    pub fn http_fetcher(&self) -> &Arc<HttpFetcher> {
        &self.http_fetcher
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<DomainRateLimiter> {
        &self.rate_limiter
    }

    #[must_use]
    pub fn auth_queue(&self) -> &InterventionQueue {
        &self.auth_queue
    }

    #[must_use]
    pub fn ml(&self) -> &Arc<MlClient> {
        &self.ml
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[must_use]
    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }
}

impl std::fmt::Debug for Lancet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lancet").finish_non_exhaustive()
    }
}
