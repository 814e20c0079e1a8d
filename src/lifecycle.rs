//! Task-scoped resource lifecycle management.
//!
//! Browsers, contexts, driver handles, HTTP sessions and model sessions are
//! registered under the task that opened them; when the task terminates,
//! everything it owns is released in reverse registration order. Releases
//! are idempotent and swallow per-resource errors — teardown must always
//! run to completion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Kinds of managed resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Browser,
    BrowserContext,
    /// The CDP driver handle (browser connection + event task).
    Driver,
    HttpSession,
    ModelSession,
    ProxyController,
}

impl ResourceKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Browser => "browser",
            Self::BrowserContext => "browser_context",
            Self::Driver => "driver",
            Self::HttpSession => "http_session",
            Self::ModelSession => "model_session",
            Self::ProxyController => "proxy_controller",
        }
    }
}

/// Release closure invoked exactly once per resource.
pub type Releaser = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), String>> + Send>;

struct TrackedResource {
    kind: ResourceKind,
    task_id: Option<String>,
    created_at: Instant,
    last_used_at: Instant,
    /// Taken on release; `None` means already released (idempotence).
    releaser: Option<Releaser>,
    /// Registration sequence, for reverse-order teardown.
    seq: u64,
}

/// Central registry with guaranteed teardown.
pub struct LifecycleManager {
    resources: Mutex<HashMap<String, TrackedResource>>,
    next_seq: std::sync::atomic::AtomicU64,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            resources: Mutex::new(HashMap::new()),
            next_seq: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Register a resource. The releaser runs when the resource or its task
    /// is cleaned up.
    pub async fn register(
        self: &Arc<Self>,
        resource_id: impl Into<String>,
        kind: ResourceKind,
        task_id: Option<String>,
        releaser: Releaser,
    ) {
        let resource_id = resource_id.into();
        let seq = self
            .next_seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let now = Instant::now();
        let mut resources = self.resources.lock().await;
        debug!(
            resource_id,
            kind = kind.as_str(),
            task_id = task_id.as_deref().unwrap_or(""),
            "registered resource"
        );
        resources.insert(
            resource_id,
            TrackedResource {
                kind,
                task_id,
                created_at: now,
                last_used_at: now,
                releaser: Some(releaser),
                seq,
            },
        );
    }

    /// Refresh a resource's last-used stamp.
    pub async fn touch(&self, resource_id: &str) {
        let mut resources = self.resources.lock().await;
        if let Some(resource) = resources.get_mut(resource_id) {
            resource.last_used_at = Instant::now();
        }
    }

    /// Remove a resource from tracking without running its releaser.
    pub async fn unregister(&self, resource_id: &str) {
        let mut resources = self.resources.lock().await;
        if resources.remove(resource_id).is_some() {
            debug!(resource_id, "unregistered resource");
        }
    }

    /// Release one resource. Idempotent: releasing an unknown or
    /// already-released id reports `false` and does nothing.
    pub async fn release(&self, resource_id: &str) -> bool {
        let (kind, releaser) = {
            let mut resources = self.resources.lock().await;
            match resources.get_mut(resource_id) {
                Some(resource) => (resource.kind, resource.releaser.take()),
                None => return false,
            }
        };

        let released = match releaser {
            Some(releaser) => match releaser().await {
                Ok(()) => true,
                Err(e) => {
                    // Teardown must keep going; a failed close is logged,
                    // never raised.
                    warn!(resource_id, kind = kind.as_str(), error = %e, "resource release failed");
                    true
                }
            },
            None => false,
        };

        self.resources.lock().await.remove(resource_id);
        released
    }

    /// Release every resource owned by a task, newest registration first.
    /// Returns per-resource success.
    pub async fn release_task_resources(&self, task_id: &str) -> HashMap<String, bool> {
        let mut owned: Vec<(String, u64)> = {
            let resources = self.resources.lock().await;
            resources
                .iter()
                .filter(|(_, r)| r.task_id.as_deref() == Some(task_id))
                .map(|(id, r)| (id.clone(), r.seq))
                .collect()
        };
        if owned.is_empty() {
            return HashMap::new();
        }
        // reverse registration order
        owned.sort_by(|a, b| b.1.cmp(&a.1));

        info!(task_id, count = owned.len(), "releasing task resources");
        let mut results = HashMap::new();
        for (resource_id, _) in owned {
            let ok = self.release(&resource_id).await;
            results.insert(resource_id, ok);
        }
        results
    }

    /// Release everything, newest first. Used at process shutdown.
    pub async fn release_all(&self) -> HashMap<String, bool> {
        let mut all: Vec<(String, u64)> = {
            let resources = self.resources.lock().await;
            resources.iter().map(|(id, r)| (id.clone(), r.seq)).collect()
        };
        all.sort_by(|a, b| b.1.cmp(&a.1));

        let mut results = HashMap::new();
        for (resource_id, _) in all {
            let ok = self.release(&resource_id).await;
            results.insert(resource_id, ok);
        }
        results
    }

    /// Release resources that are too old or idle. Returns released ids.
    pub async fn release_stale(
        &self,
        max_age: std::time::Duration,
        max_idle: std::time::Duration,
    ) -> Vec<String> {
        let stale: Vec<String> = {
            let resources = self.resources.lock().await;
            resources
                .iter()
                .filter(|(_, r)| {
                    r.created_at.elapsed() > max_age || r.last_used_at.elapsed() > max_idle
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        for resource_id in &stale {
            self.release(resource_id).await;
        }
        stale
    }

    /// Count tracked resources, optionally filtered.
    pub async fn count(&self, kind: Option<ResourceKind>, task_id: Option<&str>) -> usize {
        let resources = self.resources.lock().await;
        resources
            .values()
            .filter(|r| kind.is_none_or(|k| r.kind == k))
            .filter(|r| task_id.is_none_or(|t| r.task_id.as_deref() == Some(t)))
            .count()
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager").finish_non_exhaustive()
    }
}
