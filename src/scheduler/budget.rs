//! Per-task budget control.
//!
//! Three independent limits bound a task: pages fetched, wall time, and the
//! fraction of wall time spent in LLM jobs. The exceeded reasons are
//! mutually exclusive per task — the first limit hit deactivates the budget
//! and every later admission fails fast with that reason. Deactivation is
//! monotonic; a stopped budget never reactivates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Settings;

/// Why a budget rejected or stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetExceededReason {
    PageLimit,
    TimeLimit,
    LlmRatio,
}

impl BudgetExceededReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PageLimit => "page_limit",
            Self::TimeLimit => "time_limit",
            Self::LlmRatio => "llm_ratio",
        }
    }
}

/// Budget state for one task.
#[derive(Debug)]
pub struct TaskBudget {
    pub task_id: String,
    pub pages_fetched: u32,
    pub max_pages: u32,
    pub start_time: Instant,
    pub max_time_secs: f64,
    pub llm_time_secs: f64,
    pub max_llm_ratio: f64,
    pub llm_ratio_warmup_secs: f64,
    pub is_active: bool,
    pub exceeded_reason: Option<BudgetExceededReason>,
}

/// Serializable view for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetSnapshot {
    pub task_id: String,
    pub pages_fetched: u32,
    pub max_pages: u32,
    pub elapsed_secs: f64,
    pub max_time_secs: f64,
    pub llm_time_secs: f64,
    pub current_llm_ratio: f64,
    pub max_llm_ratio: f64,
    pub remaining_pages: u32,
    pub remaining_time_secs: f64,
    pub available_llm_time_secs: f64,
    pub is_active: bool,
    pub exceeded_reason: Option<&'static str>,
}

impl TaskBudget {
    fn new(task_id: String, settings: &Settings) -> Self {
        Self {
            task_id,
            pages_fetched: 0,
            max_pages: settings.budget.max_pages_per_task,
            start_time: Instant::now(),
            max_time_secs: settings.budget.max_time_secs,
            llm_time_secs: 0.0,
            max_llm_ratio: settings.budget.max_llm_ratio,
            llm_ratio_warmup_secs: settings.budget.llm_ratio_warmup_secs,
            is_active: true,
            exceeded_reason: None,
        }
    }

    #[must_use]
    pub fn elapsed_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    #[must_use]
    pub fn remaining_pages(&self) -> u32 {
        self.max_pages.saturating_sub(self.pages_fetched)
    }

    #[must_use]
    pub fn remaining_time_secs(&self) -> f64 {
        (self.max_time_secs - self.elapsed_secs()).max(0.0)
    }

    #[must_use]
    pub fn current_llm_ratio(&self) -> f64 {
        let elapsed = self.elapsed_secs();
        if elapsed <= 0.0 { 0.0 } else { self.llm_time_secs / elapsed }
    }

    #[must_use]
    pub fn available_llm_time_secs(&self) -> f64 {
        (self.max_llm_ratio * self.elapsed_secs() - self.llm_time_secs).max(0.0)
    }

    /// Page admission. `max_pages = 0` forbids all fetches.
    #[must_use]
    pub fn can_fetch_page(&self) -> bool {
        self.is_active && self.pages_fetched < self.max_pages
    }

    /// General continuation check against page and time limits.
    #[must_use]
    pub fn can_continue(&self) -> (bool, Option<BudgetExceededReason>) {
        if !self.is_active {
            return (false, self.exceeded_reason);
        }
        if self.pages_fetched >= self.max_pages {
            return (false, Some(BudgetExceededReason::PageLimit));
        }
        if self.elapsed_secs() >= self.max_time_secs {
            return (false, Some(BudgetExceededReason::TimeLimit));
        }
        (true, None)
    }

    /// LLM admission via projected ratio `(llm + est) / (elapsed + est)`.
    /// Suppressed during the warm-up window so short tasks can bootstrap.
    #[must_use]
    pub fn can_run_llm(&self, estimated_secs: f64) -> bool {
        if !self.is_active {
            return false;
        }
        let projected_llm = self.llm_time_secs + estimated_secs;
        let projected_elapsed = self.elapsed_secs() + estimated_secs;
        if projected_elapsed < self.llm_ratio_warmup_secs {
            return true;
        }
        projected_llm / projected_elapsed <= self.max_llm_ratio
    }

    fn record_page_fetch(&mut self) {
        self.pages_fetched += 1;
        debug!(
            task_id = %self.task_id,
            pages_fetched = self.pages_fetched,
            max_pages = self.max_pages,
            "page fetch recorded"
        );
    }

    fn record_llm_time(&mut self, seconds: f64) {
        self.llm_time_secs += seconds;
        debug!(
            task_id = %self.task_id,
            llm_time = self.llm_time_secs,
            current_ratio = self.current_llm_ratio(),
            "LLM time recorded"
        );
    }

    fn stop(&mut self, reason: Option<BudgetExceededReason>) {
        self.is_active = false;
        self.exceeded_reason = reason;
        info!(
            task_id = %self.task_id,
            reason = reason.map_or("completed", BudgetExceededReason::as_str),
            pages_fetched = self.pages_fetched,
            elapsed_secs = self.elapsed_secs(),
            llm_ratio = self.current_llm_ratio(),
            "task budget stopped"
        );
    }

    #[must_use]
    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            task_id: self.task_id.clone(),
            pages_fetched: self.pages_fetched,
            max_pages: self.max_pages,
            elapsed_secs: self.elapsed_secs(),
            max_time_secs: self.max_time_secs,
            llm_time_secs: self.llm_time_secs,
            current_llm_ratio: self.current_llm_ratio(),
            max_llm_ratio: self.max_llm_ratio,
            remaining_pages: self.remaining_pages(),
            remaining_time_secs: self.remaining_time_secs(),
            available_llm_time_secs: self.available_llm_time_secs(),
            is_active: self.is_active,
            exceeded_reason: self.exceeded_reason.map(BudgetExceededReason::as_str),
        }
    }
}

/// Budget registry for all live tasks.
pub struct BudgetManager {
    settings: Arc<Settings>,
    budgets: Mutex<HashMap<String, TaskBudget>>,
}

impl BudgetManager {
    #[must_use]
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            budgets: Mutex::new(HashMap::new()),
        }
    }

    /// Create a budget for a task; an existing budget is kept as-is.
    pub async fn create_budget(&self, task_id: &str) {
        let mut budgets = self.budgets.lock().await;
        if budgets.contains_key(task_id) {
            warn!(task_id, "budget already exists for task");
            return;
        }
        let budget = TaskBudget::new(task_id.to_string(), &self.settings);
        info!(
            task_id,
            max_pages = budget.max_pages,
            max_time_secs = budget.max_time_secs,
            "budget created"
        );
        budgets.insert(task_id.to_string(), budget);
    }

    /// Check the budget and optionally record consumption. Tasks without a
    /// budget are unlimited.
    pub async fn check_and_update(
        &self,
        task_id: &str,
        record_page: bool,
        llm_time_secs: f64,
    ) -> (bool, Option<BudgetExceededReason>) {
        let mut budgets = self.budgets.lock().await;
        let Some(budget) = budgets.get_mut(task_id) else {
            return (true, None);
        };

        if record_page {
            budget.record_page_fetch();
        }
        if llm_time_secs > 0.0 {
            budget.record_llm_time(llm_time_secs);
        }

        let (can_continue, reason) = budget.can_continue();
        if !can_continue && budget.is_active {
            budget.stop(reason);
        }
        (can_continue, reason)
    }

    pub async fn can_fetch_page(&self, task_id: &str) -> bool {
        let budgets = self.budgets.lock().await;
        budgets.get(task_id).is_none_or(TaskBudget::can_fetch_page)
    }

    pub async fn can_run_llm(&self, task_id: &str) -> bool {
        let estimate = self.settings.budget.llm_estimate_secs;
        let budgets = self.budgets.lock().await;
        budgets
            .get(task_id)
            .is_none_or(|budget| budget.can_run_llm(estimate))
    }

    /// Stop a budget (with or without an exceeded reason).
    pub async fn stop_budget(&self, task_id: &str, reason: Option<BudgetExceededReason>) {
        let mut budgets = self.budgets.lock().await;
        if let Some(budget) = budgets.get_mut(task_id) {
            if budget.is_active {
                budget.stop(reason);
            }
        }
    }

    pub async fn remove_budget(&self, task_id: &str) {
        let mut budgets = self.budgets.lock().await;
        if budgets.remove(task_id).is_some() {
            debug!(task_id, "budget removed");
        }
    }

    pub async fn snapshot(&self, task_id: &str) -> Option<BudgetSnapshot> {
        let budgets = self.budgets.lock().await;
        budgets.get(task_id).map(TaskBudget::snapshot)
    }
}

impl std::fmt::Debug for BudgetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Arc<Settings> {
        Arc::new(Settings::default())
    }

    #[tokio::test]
    async fn zero_page_budget_forbids_all_fetches() {
        let mut custom = Settings::default();
        custom.budget.max_pages_per_task = 0;
        let manager = BudgetManager::new(Arc::new(custom));
        manager.create_budget("t1").await;
        assert!(!manager.can_fetch_page("t1").await);
    }

    #[tokio::test]
    async fn page_limit_deactivates_monotonically() {
        let mut custom = Settings::default();
        custom.budget.max_pages_per_task = 2;
        let manager = BudgetManager::new(Arc::new(custom));
        manager.create_budget("t1").await;

        assert!(manager.check_and_update("t1", true, 0.0).await.0);
        let (ok, reason) = manager.check_and_update("t1", true, 0.0).await;
        assert!(!ok);
        assert_eq!(reason, Some(BudgetExceededReason::PageLimit));

        // further checks fail fast with the same reason, no reactivation
        let (ok, reason) = manager.check_and_update("t1", false, 0.0).await;
        assert!(!ok);
        assert_eq!(reason, Some(BudgetExceededReason::PageLimit));
        assert!(!manager.can_fetch_page("t1").await);
    }

    #[tokio::test]
    async fn llm_ratio_suppressed_during_warmup() {
        let manager = BudgetManager::new(settings());
        manager.create_budget("t1").await;
        // ratio would be ~1.0 but elapsed + estimate < warm-up window
        manager.check_and_update("t1", false, 10.0).await;
        assert!(manager.can_run_llm("t1").await);
    }

    #[tokio::test]
    async fn llm_ratio_enforced_after_warmup() {
        let mut custom = Settings::default();
        custom.budget.llm_ratio_warmup_secs = 0.0;
        custom.budget.llm_estimate_secs = 5.0;
        let manager = BudgetManager::new(Arc::new(custom));
        manager.create_budget("t1").await;
        // llm time dwarfs elapsed, projected ratio ≈ 1.0 > 0.30
        manager.check_and_update("t1", false, 100.0).await;
        assert!(!manager.can_run_llm("t1").await);
    }

    #[tokio::test]
    async fn unknown_task_is_unlimited() {
        let manager = BudgetManager::new(settings());
        assert!(manager.can_fetch_page("nope").await);
        assert!(manager.can_run_llm("nope").await);
        assert!(manager.check_and_update("nope", true, 1.0).await.0);
    }
}
