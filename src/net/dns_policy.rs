//! DNS routing policy with Tor leak prevention.
//!
//! When a request routes through Tor, hostname resolution MUST happen at the
//! SOCKS proxy (`socks5h://`); a local `getaddrinfo` for that hostname would
//! reveal the operator's resolver. The manager therefore refuses to resolve
//! Tor-routed hostnames locally — it returns an empty address list and
//! counts the attempt as a detected leak. Direct-route results are cached
//! with a TTL clamped to the configured bounds.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::Settings;

/// How a hostname gets resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DnsRoute {
    /// OS resolver.
    Direct,
    /// Resolution delegated to the Tor SOCKS proxy.
    Tor,
}

impl DnsRoute {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Tor => "tor",
        }
    }
}

/// Leak classifications recorded by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsLeakType {
    None,
    LocalResolutionDuringTor,
}

/// One cached direct-route resolution.
#[derive(Debug, Clone)]
struct DnsCacheEntry {
    addresses: Vec<String>,
    resolved_at: Instant,
    ttl: Duration,
}

impl DnsCacheEntry {
    fn is_expired(&self) -> bool {
        self.resolved_at.elapsed() > self.ttl
    }
}

/// Outcome of one resolution request.
#[derive(Debug, Clone)]
pub struct DnsResolutionResult {
    pub hostname: String,
    pub addresses: Vec<String>,
    pub route: DnsRoute,
    pub from_cache: bool,
    pub leak_detected: DnsLeakType,
}

impl DnsResolutionResult {
    #[must_use]
    pub fn success(&self) -> bool {
        !self.addresses.is_empty()
    }
}

#[derive(Debug, Default)]
struct DnsMetrics {
    total_resolutions: u64,
    cache_hits: u64,
    cache_misses: u64,
    tor_resolutions: u64,
    direct_resolutions: u64,
    leaks_detected: u64,
    resolution_errors: u64,
    // last 100 samples for the rolling average
    resolution_times_ms: Vec<f64>,
}

impl DnsMetrics {
    fn record(&mut self, route: DnsRoute, from_cache: bool, time_ms: f64, leak: bool, error: bool) {
        self.total_resolutions += 1;
        if from_cache {
            self.cache_hits += 1;
        } else {
            self.cache_misses += 1;
        }
        match route {
            DnsRoute::Tor => self.tor_resolutions += 1,
            DnsRoute::Direct => self.direct_resolutions += 1,
        }
        if leak {
            self.leaks_detected += 1;
        }
        if error {
            self.resolution_errors += 1;
        }
        self.resolution_times_ms.push(time_ms);
        if self.resolution_times_ms.len() > 100 {
            self.resolution_times_ms.remove(0);
        }
    }
}

/// Read-only snapshot of resolver metrics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DnsMetricsSnapshot {
    pub total_resolutions: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub tor_resolutions: u64,
    pub direct_resolutions: u64,
    pub leaks_detected: u64,
    pub resolution_errors: u64,
    pub avg_resolution_time_ms: f64,
}

/// DNS policy manager: proxy-form selection, cached direct resolution, and
/// leak accounting.
pub struct DnsPolicyManager {
    settings: Arc<Settings>,
    cache: DashMap<(String, DnsRoute), DnsCacheEntry>,
    metrics: Mutex<DnsMetrics>,
}

impl DnsPolicyManager {
    #[must_use]
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            cache: DashMap::new(),
            metrics: Mutex::new(DnsMetrics::default()),
        }
    }

    /// Select the SOCKS proxy URL form for a request.
    ///
    /// `socks5h://` delegates hostname resolution to the proxy — the only
    /// safe form over Tor. `socks5://` resolves locally and leaks; it is
    /// produced only when the caller passes an explicit
    /// `resolve_dns_through_proxy = Some(false)` override.
    #[must_use]
    pub fn socks_proxy_url(
        &self,
        use_tor: bool,
        resolve_dns_through_proxy: Option<bool>,
    ) -> Option<String> {
        if !use_tor || !self.settings.tor.enabled {
            return None;
        }

        let resolve_through =
            resolve_dns_through_proxy.unwrap_or(self.settings.dns.resolve_through_tor);
        let scheme = if resolve_through { "socks5h" } else { "socks5" };
        let url = format!(
            "{scheme}://{}:{}",
            self.settings.tor.socks_host, self.settings.tor.socks_port
        );
        debug!(scheme, resolve_through, "selected SOCKS proxy form");
        Some(url)
    }

    /// Resolve a hostname under the given route.
    ///
    /// Tor-routed hostnames are never resolved locally: the result carries an
    /// empty address list and `leak_detected`, and the proxy layer performs
    /// the actual resolution.
    pub async fn resolve_hostname(
        &self,
        hostname: &str,
        route: DnsRoute,
        use_cache: bool,
    ) -> DnsResolutionResult {
        let start = Instant::now();
        let key = (hostname.to_lowercase(), route);

        if use_cache {
            if let Some(entry) = self.cache.get(&key) {
                if !entry.is_expired() {
                    let addresses = entry.addresses.clone();
                    drop(entry);
                    self.metrics.lock().record(
                        route,
                        true,
                        start.elapsed().as_secs_f64() * 1000.0,
                        false,
                        false,
                    );
                    return DnsResolutionResult {
                        hostname: hostname.to_string(),
                        addresses,
                        route,
                        from_cache: true,
                        leak_detected: DnsLeakType::None,
                    };
                }
            }
        }

        if route == DnsRoute::Tor {
            if self.settings.dns.leak_detection_enabled {
                warn!(hostname, "local DNS resolution attempted for Tor route");
            }
            self.metrics.lock().record(route, false, 0.0, true, false);
            return DnsResolutionResult {
                hostname: hostname.to_string(),
                addresses: Vec::new(),
                route,
                from_cache: false,
                leak_detected: DnsLeakType::LocalResolutionDuringTor,
            };
        }

        let mut addresses = Vec::new();
        let mut error = false;
        match tokio::net::lookup_host((hostname, 0u16)).await {
            Ok(addrs) => {
                let mut seen = std::collections::HashSet::new();
                for addr in addrs {
                    let ip = match addr {
                        SocketAddr::V4(v4) => v4.ip().to_string(),
                        SocketAddr::V6(v6) => v6.ip().to_string(),
                    };
                    if seen.insert(ip.clone()) {
                        addresses.push(ip);
                    }
                }
            }
            Err(e) => {
                debug!(hostname, error = %e, "DNS resolution failed");
                error = true;
            }
        }

        if !addresses.is_empty() && self.settings.dns.respect_cache_ttl {
            let ttl = self
                .settings
                .dns
                .default_ttl_secs
                .clamp(
                    self.settings.dns.min_cache_ttl_secs,
                    self.settings.dns.max_cache_ttl_secs,
                );
            self.cache.insert(
                key,
                DnsCacheEntry {
                    addresses: addresses.clone(),
                    resolved_at: Instant::now(),
                    ttl: Duration::from_secs(ttl),
                },
            );
        }

        self.metrics.lock().record(
            route,
            false,
            start.elapsed().as_secs_f64() * 1000.0,
            false,
            error,
        );

        DnsResolutionResult {
            hostname: hostname.to_string(),
            addresses,
            route,
            from_cache: false,
            leak_detected: DnsLeakType::None,
        }
    }

    /// Classify a request for leak accounting after the fact.
    #[must_use]
    pub fn detect_dns_leak(&self, use_tor: bool, local_resolution_attempted: bool) -> DnsLeakType {
        if !self.settings.dns.leak_detection_enabled {
            return DnsLeakType::None;
        }
        if use_tor && local_resolution_attempted {
            return DnsLeakType::LocalResolutionDuringTor;
        }
        DnsLeakType::None
    }

    /// Remove expired cache entries. Returns how many were pruned.
    pub fn prune_expired_cache(&self) -> usize {
        let expired: Vec<(String, DnsRoute)> = self
            .cache
            .iter()
            .filter(|entry| entry.value().is_expired())
            .map(|entry| entry.key().clone())
            .collect();
        for key in &expired {
            self.cache.remove(key);
        }
        expired.len()
    }

    /// Drop the whole cache. Returns how many entries were held.
    pub fn clear_cache(&self) -> usize {
        let count = self.cache.len();
        self.cache.clear();
        count
    }

    #[must_use]
    pub fn metrics(&self) -> DnsMetricsSnapshot {
        let m = self.metrics.lock();
        let avg = if m.resolution_times_ms.is_empty() {
            0.0
        } else {
            m.resolution_times_ms.iter().sum::<f64>() / m.resolution_times_ms.len() as f64
        };
        DnsMetricsSnapshot {
            total_resolutions: m.total_resolutions,
            cache_hits: m.cache_hits,
            cache_misses: m.cache_misses,
            tor_resolutions: m.tor_resolutions,
            direct_resolutions: m.direct_resolutions,
            leaks_detected: m.leaks_detected,
            resolution_errors: m.resolution_errors,
            avg_resolution_time_ms: avg,
        }
    }

    /// Route selection: Tor requests resolve through the proxy unless
    /// configuration says otherwise.
    #[must_use]
    pub fn route_for(&self, use_tor: bool) -> DnsRoute {
        if use_tor && self.settings.dns.resolve_through_tor {
            DnsRoute::Tor
        } else {
            DnsRoute::Direct
        }
    }
}

impl std::fmt::Debug for DnsPolicyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsPolicyManager")
            .field("cached_entries", &self.cache.len())
            .field("route_names", &[DnsRoute::Direct.as_str(), DnsRoute::Tor.as_str()])
            .finish()
    }
}
