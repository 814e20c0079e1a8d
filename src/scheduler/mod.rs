//! Job scheduling: slot/priority dispatch over a DB-durable queue, per-task
//! budgets, worker pool with cooperative cancellation, and per-task change
//! notification.

pub mod budget;
pub mod events;
pub mod jobs;
pub mod worker;

pub use budget::{BudgetExceededReason, BudgetManager, BudgetSnapshot, TaskBudget};
pub use events::TaskEvents;
pub use jobs::{
    ClaimedJob, JobKind, JobRow, JobScheduler, JobState, Slot, SubmitOutcome, kind_priority,
    kind_slot, slot_limit,
};
pub use worker::{TargetAction, TargetOutcome, WorkerManager};
