//! Queue worker pool.
//!
//! Each slot gets as many workers as its concurrency limit. A worker loops:
//! claim (CAS) → run the kind's action as a child task → finalise under the
//! `WHERE state = 'running'` predicate → signal the task's status channel.
//! Cancellation aborts the child task, never the worker: the worker
//! observes the abort, writes `cancelled` conditionally, and moves on to
//! the next job. A completion that races a cancel loses by rowcount and its
//! result is discarded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::json;
use sqlx::Row;
use tokio::sync::{Mutex, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::error::FetchReason;
use crate::scheduler::events::TaskEvents;
use crate::scheduler::jobs::{ClaimedJob, JobKind, JobScheduler, JobState, Slot, slot_limit};

/// Poll interval when a slot's queue is empty.
const EMPTY_QUEUE_POLL: Duration = Duration::from_secs(1);

/// Backoff after a non-fatal worker-loop error.
const ERROR_RECOVERY_DELAY: Duration = Duration::from_secs(5);

/// How long cancellation waits for aborted actions to settle.
const CANCEL_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result an action hands back to its worker.
#[derive(Debug, Clone)]
pub struct TargetOutcome {
    pub output: serde_json::Value,
    /// True when the action queued a challenge and the page is held open;
    /// the job parks in `awaiting_auth` instead of completing.
    pub auth_queued: bool,
}

impl TargetOutcome {
    #[must_use]
    pub fn completed(output: serde_json::Value) -> Self {
        Self {
            output,
            auth_queued: false,
        }
    }
}

/// A long-lived action bound to a job kind. Implementations run inside a
/// child task so the worker can abort them without dying itself.
pub trait TargetAction: Send + Sync + 'static {
    fn run(&self, job: ClaimedJob) -> BoxFuture<'static, anyhow::Result<TargetOutcome>>;
}

impl<F> TargetAction for F
where
    F: Fn(ClaimedJob) -> BoxFuture<'static, anyhow::Result<TargetOutcome>> + Send + Sync + 'static,
{
    fn run(&self, job: ClaimedJob) -> BoxFuture<'static, anyhow::Result<TargetOutcome>> {
        self(job)
    }
}

struct RunningJob {
    task_id: Option<String>,
    abort: AbortHandle,
}

/// Worker pool + running-job registry.
pub struct WorkerManager {
    scheduler: JobScheduler,
    events: Arc<TaskEvents>,
    actions: parking_lot::RwLock<HashMap<JobKind, Arc<dyn TargetAction>>>,
    running_jobs: DashMap<String, RunningJob>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: std::sync::atomic::AtomicBool,
    /// Bumped whenever a worker finds its queue empty; batch observers
    /// await this to know the backlog has drained.
    queue_empty: watch::Sender<u64>,
}

impl WorkerManager {
    #[must_use]
    pub fn new(scheduler: JobScheduler, events: Arc<TaskEvents>) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            events,
            actions: parking_lot::RwLock::new(HashMap::new()),
            running_jobs: DashMap::new(),
            workers: Mutex::new(Vec::new()),
            started: std::sync::atomic::AtomicBool::new(false),
            queue_empty: watch::channel(0u64).0,
        })
    }

    /// Bind an action to a job kind. Claimed jobs of unbound kinds fail.
    pub fn register_action(&self, kind: JobKind, action: Arc<dyn TargetAction>) {
        self.actions.write().insert(kind, action);
    }

    /// Spawn `slot_limit` workers per slot. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let mut workers = self.workers.lock().await;
        for slot in Slot::ALL {
            for worker_id in 0..slot_limit(*slot) {
                let manager = Arc::clone(self);
                let slot = *slot;
                workers.push(tokio::spawn(async move {
                    manager.worker_loop(slot, worker_id as usize).await;
                }));
            }
        }
        info!(worker_count = workers.len(), "queue workers started");
    }

    /// Spawn `count` workers for a single slot (test-scale pools).
    pub async fn start_slot(self: &Arc<Self>, slot: Slot, count: usize) {
        self.started.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut workers = self.workers.lock().await;
        for worker_id in 0..count {
            let manager = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                manager.worker_loop(slot, worker_id).await;
            }));
        }
    }

    /// Stop every worker. Only process shutdown takes this path.
    pub async fn stop(&self) {
        self.started.store(false, std::sync::atomic::Ordering::SeqCst);
        let mut workers = self.workers.lock().await;
        for worker in workers.iter() {
            worker.abort();
        }
        for worker in workers.drain(..) {
            let _ = worker.await;
        }
        self.running_jobs.clear();
        info!("queue workers stopped");
    }

    #[must_use]
    pub fn running_job_count(&self) -> usize {
        self.running_jobs.len()
    }

    #[must_use]
    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Wait until some worker reports an empty queue, up to `timeout`.
    pub async fn wait_for_queue_empty(&self, timeout: Duration) -> bool {
        let mut receiver = self.queue_empty.subscribe();
        let _ = receiver.borrow_and_update();
        tokio::time::timeout(timeout, receiver.changed())
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }

    /// Cancel a task's in-flight actions (mode=immediate) without killing
    /// any worker, then flip its still-queued jobs. Returns all affected
    /// job ids.
    pub async fn cancel_task(&self, task_id: &str) -> Result<Vec<String>, sqlx::Error> {
        let mut cancelled: Vec<String> = Vec::new();

        // Queued rows flip first so no worker freed by the aborts below can
        // claim one of them mid-cancellation.
        cancelled.extend(self.scheduler.cancel_queued_for_task(task_id).await?);

        // Abort in-flight actions; their workers observe the abort and
        // write `cancelled` under the running predicate.
        let running: Vec<String> = self
            .running_jobs
            .iter()
            .filter(|entry| entry.value().task_id.as_deref() == Some(task_id))
            .map(|entry| entry.key().clone())
            .collect();
        for job_id in &running {
            if let Some(entry) = self.running_jobs.get(job_id) {
                entry.value().abort.abort();
                info!(job_id, task_id, "cancelled running job");
            }
        }
        cancelled.extend(running.iter().cloned());

        // Bounded wait for the aborted actions to settle.
        if !running.is_empty() {
            let deadline = Instant::now() + CANCEL_SETTLE_TIMEOUT;
            while Instant::now() < deadline {
                let pending = running
                    .iter()
                    .any(|job_id| self.running_jobs.contains_key(job_id));
                if !pending {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            if running.iter().any(|job_id| self.running_jobs.contains_key(job_id)) {
                warn!(task_id, "timeout waiting for job cancellations to settle");
            }
        }

        self.events.notify(task_id);
        Ok(cancelled)
    }

    async fn worker_loop(self: Arc<Self>, slot: Slot, worker_id: usize) {
        info!(slot = slot.as_str(), worker_id, "queue worker started");

        loop {
            if !self.started.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }

            let claimed = match self.scheduler.claim_next(slot).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    if self.scheduler.pool().is_closed() {
                        // Unrecoverable: the pool is gone. The worker exits;
                        // the process must re-run startup reset.
                        error!(slot = slot.as_str(), worker_id, error = %e, "database gone, worker exiting");
                        break;
                    }
                    error!(slot = slot.as_str(), worker_id, error = %e, "worker claim error");
                    tokio::time::sleep(ERROR_RECOVERY_DELAY).await;
                    continue;
                }
            };

            let Some(job) = claimed else {
                self.queue_empty.send_modify(|version| *version += 1);
                tokio::time::sleep(EMPTY_QUEUE_POLL).await;
                continue;
            };

            self.execute_job(job, worker_id).await;
        }

        info!(slot = slot.as_str(), worker_id, "queue worker stopped");
    }

    async fn execute_job(&self, job: ClaimedJob, worker_id: usize) {
        let job_id = job.job_id.clone();
        let task_id = job.task_id.clone();
        let kind = job.kind;
        let job_start = Instant::now();

        info!(
            job_id,
            kind = kind.as_str(),
            task_id = task_id.as_deref().unwrap_or(""),
            worker_id,
            "job started"
        );

        let action = self.actions.read().get(&kind).cloned();
        let Some(action) = action else {
            let _ = self
                .scheduler
                .finalize(
                    &job_id,
                    JobState::Failed,
                    None,
                    Some(&format!("no action registered for kind {}", kind.as_str())),
                )
                .await;
            self.notify(task_id.as_deref());
            return;
        };

        // The action runs as a child task so cancellation can abort it
        // without touching the worker.
        let child: JoinHandle<anyhow::Result<TargetOutcome>> = tokio::spawn(action.run(job));
        self.running_jobs.insert(
            job_id.clone(),
            RunningJob {
                task_id: task_id.clone(),
                abort: child.abort_handle(),
            },
        );

        let outcome = child.await;
        self.running_jobs.remove(&job_id);

        match outcome {
            Ok(Ok(outcome)) => {
                self.scheduler
                    .record_budget_consumption(
                        task_id.as_deref(),
                        kind,
                        job_start.elapsed().as_secs_f64(),
                    )
                    .await;

                if outcome.auth_queued {
                    let landed = self
                        .scheduler
                        .finalize(&job_id, JobState::AwaitingAuth, Some(&outcome.output), None)
                        .await
                        .unwrap_or(false);
                    if landed {
                        info!(job_id, "job awaiting auth (challenge queued)");
                    }
                } else {
                    let landed = self
                        .scheduler
                        .finalize(&job_id, JobState::Completed, Some(&outcome.output), None)
                        .await
                        .unwrap_or(false);
                    if landed {
                        info!(job_id, kind = kind.as_str(), "job completed");
                        if kind == JobKind::TargetQueue {
                            self.enqueue_followups(&job_id, task_id.as_deref(), &outcome.output)
                                .await;
                        }
                    } else {
                        // A concurrent cancel won; the result is discarded.
                        info!(job_id, "job completion skipped (already cancelled)");
                    }
                }
            }
            Ok(Err(e)) => {
                let reason = crate::error::non_empty_reason("ActionError", &format!("{e:#}"));
                let _ = self
                    .scheduler
                    .finalize(&job_id, JobState::Failed, None, Some(&reason))
                    .await;
                error!(job_id, kind = kind.as_str(), error = %reason, "job failed");
            }
            Err(join_error) if join_error.is_cancelled() => {
                let _ = self
                    .scheduler
                    .finalize(
                        &job_id,
                        JobState::Cancelled,
                        None,
                        Some(FetchReason::Cancelled.as_str()),
                    )
                    .await;
                info!(job_id, "job cancelled");
            }
            Err(join_error) => {
                let reason = format!("action panicked: {join_error}");
                let _ = self
                    .scheduler
                    .finalize(&job_id, JobState::Failed, None, Some(&reason))
                    .await;
                error!(job_id, error = %reason, "job action panicked");
            }
        }

        self.notify(task_id.as_deref());
    }

    fn notify(&self, task_id: Option<&str>) {
        if let Some(task_id) = task_id {
            self.events.notify(task_id);
        }
    }

    /// Follow-ups after a successful target execution: verification is
    /// enqueued unconditionally (the verifier no-ops on empty input); a
    /// citation-graph job only when the completion emitted papers with
    /// abstracts and no prior citation-graph job references this search.
    async fn enqueue_followups(
        &self,
        search_id: &str,
        task_id: Option<&str>,
        output: &serde_json::Value,
    ) {
        let Some(task_id) = task_id else { return };

        match self
            .scheduler
            .submit(
                JobKind::VerifyNli,
                json!({ "task_id": task_id }),
                None,
                Some(task_id),
                Some(search_id),
            )
            .await
        {
            Ok(outcome) => debug!(
                task_id,
                job_id = outcome.job_id,
                accepted = outcome.accepted,
                "verify_nli follow-up enqueued"
            ),
            Err(e) => warn!(task_id, error = %e, "verify_nli follow-up enqueue failed"),
        }

        let papers = output.get("papers").and_then(|v| v.as_array());
        let has_abstracts = papers.is_some_and(|papers| {
            papers.iter().any(|paper| {
                paper
                    .get("abstract")
                    .and_then(|a| a.as_str())
                    .is_some_and(|a| !a.trim().is_empty())
            })
        });
        if !has_abstracts {
            return;
        }

        match self.citation_graph_exists(search_id).await {
            Ok(true) => {
                debug!(search_id, "citation graph job already exists");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(search_id, error = %e, "citation graph dedup check failed");
                return;
            }
        }

        let input = json!({
            "task_id": task_id,
            "search_id": search_id,
            "papers": papers,
        });
        match self
            .scheduler
            .submit(JobKind::CitationGraph, input, None, Some(task_id), Some(search_id))
            .await
        {
            Ok(outcome) => info!(
                task_id,
                search_id,
                job_id = outcome.job_id,
                "citation graph follow-up enqueued"
            ),
            Err(e) => warn!(task_id, error = %e, "citation graph enqueue failed"),
        }
    }

    async fn citation_graph_exists(&self, search_id: &str) -> Result<bool, sqlx::Error> {
        let pattern = format!("%\"search_id\":\"{search_id}\"%");
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM jobs WHERE kind = 'citation_graph' AND input_json LIKE ?",
        )
        .bind(pattern)
        .fetch_one(self.scheduler.pool())
        .await?;
        Ok(row.get::<i64, _>("n") > 0)
    }
}

impl std::fmt::Debug for WorkerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerManager")
            .field("running_jobs", &self.running_jobs.len())
            .finish_non_exhaustive()
    }
}
