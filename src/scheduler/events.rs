//! Per-task status-change notification.
//!
//! The sole supported long-poll mechanism: every terminal-ish job
//! transition bumps the task's watch channel, and `wait_for_change` awaits
//! the next bump with a timeout. Watch channels (rather than `Notify`)
//! avoid the missed-wakeup race between a check and the subsequent wait.

use dashmap::DashMap;
use tokio::sync::watch;

/// Registry of per-task `status_changed` channels.
#[derive(Debug, Default)]
pub struct TaskEvents {
    channels: DashMap<String, watch::Sender<u64>>,
}

impl TaskEvents {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    fn sender(&self, task_id: &str) -> watch::Sender<u64> {
        self.channels
            .entry(task_id.to_string())
            .or_insert_with(|| watch::channel(0u64).0)
            .clone()
    }

    /// Signal a status change for a task.
    pub fn notify(&self, task_id: &str) {
        let sender = self.sender(task_id);
        sender.send_modify(|version| *version += 1);
    }

    /// Wait until the task's status changes or the timeout elapses.
    /// Returns whether a change was observed.
    pub async fn wait_for_change(&self, task_id: &str, timeout: std::time::Duration) -> bool {
        let mut receiver = self.sender(task_id).subscribe();
        // mark the current version seen; only a subsequent notify counts
        let _ = receiver.borrow_and_update();
        tokio::time::timeout(timeout, receiver.changed())
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }

    /// Drop a completed task's channel.
    pub fn remove(&self, task_id: &str) {
        self.channels.remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn notify_wakes_waiter() {
        let events = Arc::new(TaskEvents::new());
        let waiter = Arc::clone(&events);
        let handle = tokio::spawn(async move {
            waiter.wait_for_change("t1", Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        events.notify("t1");
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn timeout_returns_false() {
        let events = TaskEvents::new();
        assert!(!events.wait_for_change("t1", Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn notify_before_wait_is_not_seen() {
        let events = TaskEvents::new();
        events.notify("t1");
        // the wait starts after the notify, so only a new change counts
        assert!(!events.wait_for_change("t1", Duration::from_millis(50)).await);
    }
}
