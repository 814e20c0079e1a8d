//! Lifecycle registry: ordered, idempotent, error-swallowing teardown.

use std::sync::Arc;
use std::time::Duration;

use lancet::lifecycle::{LifecycleManager, Releaser, ResourceKind};
use parking_lot::Mutex;

fn recording_releaser(log: Arc<Mutex<Vec<String>>>, name: &str) -> Releaser {
    let name = name.to_string();
    Box::new(move || {
        Box::pin(async move {
            log.lock().push(name);
            Ok(())
        })
    })
}

fn failing_releaser(log: Arc<Mutex<Vec<String>>>, name: &str) -> Releaser {
    let name = name.to_string();
    Box::new(move || {
        Box::pin(async move {
            log.lock().push(name);
            Err("close failed".to_string())
        })
    })
}

#[tokio::test]
async fn task_teardown_runs_in_reverse_registration_order() {
    let manager = Arc::new(LifecycleManager::new());
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    manager
        .register("driver", ResourceKind::Driver, Some("t1".to_string()), recording_releaser(Arc::clone(&log), "driver"))
        .await;
    manager
        .register("browser", ResourceKind::Browser, Some("t1".to_string()), recording_releaser(Arc::clone(&log), "browser"))
        .await;
    manager
        .register("context", ResourceKind::BrowserContext, Some("t1".to_string()), recording_releaser(Arc::clone(&log), "context"))
        .await;
    // a different task's resource stays untouched
    manager
        .register("other", ResourceKind::HttpSession, Some("t2".to_string()), recording_releaser(Arc::clone(&log), "other"))
        .await;

    let results = manager.release_task_resources("t1").await;
    assert_eq!(results.len(), 3);
    assert!(results.values().all(|ok| *ok));

    assert_eq!(*log.lock(), vec!["context", "browser", "driver"]);
    assert_eq!(manager.count(None, Some("t2")).await, 1);
}

#[tokio::test]
async fn release_is_idempotent() {
    let manager = Arc::new(LifecycleManager::new());
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    manager
        .register("r1", ResourceKind::ModelSession, None, recording_releaser(Arc::clone(&log), "r1"))
        .await;

    assert!(manager.release("r1").await);
    assert!(!manager.release("r1").await);
    assert!(!manager.release("unknown").await);
    assert_eq!(log.lock().len(), 1);
}

#[tokio::test]
async fn failing_releasers_do_not_stop_teardown() {
    let manager = Arc::new(LifecycleManager::new());
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    manager
        .register("good1", ResourceKind::Browser, Some("t1".to_string()), recording_releaser(Arc::clone(&log), "good1"))
        .await;
    manager
        .register("bad", ResourceKind::ProxyController, Some("t1".to_string()), failing_releaser(Arc::clone(&log), "bad"))
        .await;
    manager
        .register("good2", ResourceKind::HttpSession, Some("t1".to_string()), recording_releaser(Arc::clone(&log), "good2"))
        .await;

    let results = manager.release_task_resources("t1").await;
    assert_eq!(results.len(), 3);
    // every releaser ran despite the failure in the middle of the order
    assert_eq!(*log.lock(), vec!["good2", "bad", "good1"]);
    assert_eq!(manager.count(None, None).await, 0);
}

#[tokio::test]
async fn stale_sweep_releases_idle_resources() {
    let manager = Arc::new(LifecycleManager::new());
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    manager
        .register("idle", ResourceKind::HttpSession, None, recording_releaser(Arc::clone(&log), "idle"))
        .await;

    tokio::time::sleep(Duration::from_millis(30)).await;
    let released = manager
        .release_stale(Duration::from_secs(3600), Duration::from_millis(10))
        .await;
    assert_eq!(released, vec!["idle".to_string()]);
    assert_eq!(manager.count(None, None).await, 0);
}
