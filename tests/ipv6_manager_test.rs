//! IPv6 learning: auto-disable, fallback accounting, and persistence.

mod common;

use common::{memory_pool, settings};
use lancet::net::ipv6::{AddressFamily, ConnectionOutcome, Ipv6ConnectionManager};

fn failed_v6_outcome(host: &str) -> ConnectionOutcome {
    ConnectionOutcome {
        hostname: host.to_string(),
        success: false,
        family_used: Some(AddressFamily::Ipv6),
        switched: false,
        switch_success: false,
        latency_ms: 12.0,
        error: Some("connection refused".to_string()),
    }
}

#[tokio::test]
async fn repeated_ipv6_failures_auto_disable_domain() {
    let manager = Ipv6ConnectionManager::new(settings());
    let domain = "flaky.example.com";

    // default min_samples = 5, learning_threshold = 0.3; the EMA starts at
    // 0.5 and decays toward 0 over consecutive failures
    for _ in 0..12 {
        manager.record_connection_result(domain, &failed_v6_outcome(domain));
    }

    let stats = manager.domain_stats(domain);
    assert!(!stats.ipv6_enabled);
    assert!(stats.ipv6_success_rate < 0.3);

    // subsequent preference queries return IPv4 for that domain
    assert_eq!(
        stats.preferred_family(lancet::net::ipv6::Ipv6Preference::Ipv6First, 5),
        AddressFamily::Ipv4
    );

    // manual re-enable works
    manager.set_ipv6_enabled_for_domain(domain, true);
    assert!(manager.domain_stats(domain).ipv6_enabled);
}

#[tokio::test]
async fn fallback_connect_records_switch_success() {
    let manager = Ipv6ConnectionManager::new(settings());

    // localhost resolves to both families on most hosts; if not, skip
    let (v6, v4) = manager.resolve_addresses("localhost").await;
    if v6.is_empty() || v4.is_empty() {
        return;
    }

    let outcome = manager
        .try_connect_with_fallback("localhost", "localhost", |_addr, family| async move {
            // primary (IPv6) fails, fallback (IPv4) succeeds
            match family {
                AddressFamily::Ipv6 => Err("refused".to_string()),
                AddressFamily::Ipv4 => Ok(()),
            }
        })
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.family_used, Some(AddressFamily::Ipv4));
    assert!(outcome.switched);
    assert!(outcome.switch_success);

    let metrics = manager.metrics();
    assert_eq!(metrics.total_switches, 1);
    assert_eq!(metrics.total_switch_successes, 1);
}

#[tokio::test]
async fn all_fail_records_unsuccessful_switch() {
    let manager = Ipv6ConnectionManager::new(settings());

    let (v6, v4) = manager.resolve_addresses("localhost").await;
    if v6.is_empty() || v4.is_empty() {
        return;
    }

    let outcome = manager
        .try_connect_with_fallback("localhost", "localhost", |_addr, _family| async move {
            Err::<(), _>("refused".to_string())
        })
        .await;

    assert!(!outcome.success);
    assert!(outcome.switched);
    assert!(!outcome.switch_success);
    assert!(outcome.error.is_some());
}

#[tokio::test]
async fn domain_stats_persist_and_reload() {
    let pool = memory_pool().await;
    let manager = Ipv6ConnectionManager::new(settings());
    let domain = "persist.example.org";

    for _ in 0..8 {
        manager.record_connection_result(domain, &failed_v6_outcome(domain));
    }
    manager.save_domain_stats(&pool, domain).await.unwrap();

    // a fresh manager loads the learned state back
    let restored = Ipv6ConnectionManager::new(settings());
    let loaded = restored.load_domain_stats(&pool).await.unwrap();
    assert_eq!(loaded, 1);

    let stats = restored.domain_stats(domain);
    assert!(!stats.ipv6_enabled);
    assert_eq!(stats.ipv6_attempts, 8);

    // upsert path: save again after more samples
    restored.record_connection_result(domain, &failed_v6_outcome(domain));
    restored.save_domain_stats(&pool, domain).await.unwrap();
    let again = Ipv6ConnectionManager::new(settings());
    again.load_domain_stats(&pool).await.unwrap();
    assert_eq!(again.domain_stats(domain).ipv6_attempts, 9);
}
