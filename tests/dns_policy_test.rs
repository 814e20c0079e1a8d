//! DNS policy: proxy-form selection and Tor leak refusal.

mod common;

use common::settings;
use lancet::config::Settings;
use lancet::net::dns_policy::{DnsLeakType, DnsPolicyManager, DnsRoute};
use std::sync::Arc;

#[test]
fn proxy_url_forms() {
    let manager = DnsPolicyManager::new(settings());

    // no Tor, no proxy
    assert_eq!(manager.socks_proxy_url(false, None), None);

    // Tor with DNS-through-proxy: the leak-safe socks5h form
    let url = manager.socks_proxy_url(true, None).unwrap();
    assert!(url.starts_with("socks5h://"));
    assert!(url.ends_with(":9050"));

    // explicit unsafe override only
    let unsafe_url = manager.socks_proxy_url(true, Some(false)).unwrap();
    assert!(unsafe_url.starts_with("socks5://"));
    assert!(!unsafe_url.starts_with("socks5h://"));
}

#[test]
fn disabled_tor_yields_no_proxy() {
    let mut custom = Settings::default();
    custom.tor.enabled = false;
    let manager = DnsPolicyManager::new(Arc::new(custom));
    assert_eq!(manager.socks_proxy_url(true, None), None);
}

#[tokio::test]
async fn tor_route_refuses_local_resolution_and_counts_leak() {
    let manager = DnsPolicyManager::new(settings());

    let result = manager
        .resolve_hostname("example.com", DnsRoute::Tor, true)
        .await;
    assert!(result.addresses.is_empty());
    assert!(!result.success());
    assert_eq!(result.leak_detected, DnsLeakType::LocalResolutionDuringTor);

    let metrics = manager.metrics();
    assert_eq!(metrics.leaks_detected, 1);
    assert_eq!(metrics.tor_resolutions, 1);
}

#[tokio::test]
async fn direct_localhost_resolution_caches() {
    let manager = DnsPolicyManager::new(settings());

    let first = manager
        .resolve_hostname("localhost", DnsRoute::Direct, true)
        .await;
    if !first.success() {
        // no resolver in the sandbox; nothing further to assert
        return;
    }
    assert!(!first.from_cache);

    let second = manager
        .resolve_hostname("localhost", DnsRoute::Direct, true)
        .await;
    assert!(second.from_cache);
    assert_eq!(second.addresses, first.addresses);

    assert!(manager.clear_cache() >= 1);
}

#[test]
fn leak_detection_classifier() {
    let manager = DnsPolicyManager::new(settings());
    assert_eq!(
        manager.detect_dns_leak(true, true),
        DnsLeakType::LocalResolutionDuringTor
    );
    assert_eq!(manager.detect_dns_leak(true, false), DnsLeakType::None);
    assert_eq!(manager.detect_dns_leak(false, true), DnsLeakType::None);
}

#[test]
fn route_selection_follows_config() {
    let manager = DnsPolicyManager::new(settings());
    assert_eq!(manager.route_for(true), DnsRoute::Tor);
    assert_eq!(manager.route_for(false), DnsRoute::Direct);
}
