//! IPv6/IPv4 connection management with per-domain learning.
//!
//! Happy-Eyeballs-style strategy: resolve both families, interleave
//! addresses starting with the preferred family, attempt each with a
//! bounded timeout, and learn per-domain success rates (EMA, α = 0.1). A
//! domain whose IPv6 EMA falls below the learning threshold after enough
//! samples has IPv6 disabled until re-enabled manually. Stats persist to the
//! `domains` table so learned preferences survive restarts.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::config::Settings;

/// EMA smoothing factor for per-domain success rates.
const EMA_ALPHA: f64 = 0.1;

/// Margin one family's EMA must exceed the other's by to win in AUTO mode.
const AUTO_PREFERENCE_MARGIN: f64 = 0.10;

/// IP address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ipv4 => "ipv4",
            Self::Ipv6 => "ipv6",
        }
    }
}

/// Family preference strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ipv6Preference {
    Ipv6First,
    Ipv4First,
    #[default]
    Auto,
}

impl Ipv6Preference {
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "ipv4_first" => Self::Ipv4First,
            "auto" => Self::Auto,
            _ => Self::Ipv6First,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ipv6First => "ipv6_first",
            Self::Ipv4First => "ipv4_first",
            Self::Auto => "auto",
        }
    }
}

/// A resolved address tagged with its family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub address: String,
    pub family: AddressFamily,
}

/// Outcome of one connect-with-fallback call.
#[derive(Debug, Clone)]
pub struct ConnectionOutcome {
    pub hostname: String,
    pub success: bool,
    pub family_used: Option<AddressFamily>,
    pub switched: bool,
    pub switch_success: bool,
    pub latency_ms: f64,
    pub error: Option<String>,
}

/// Per-domain learned statistics.
#[derive(Debug, Clone)]
pub struct DomainIpv6Stats {
    pub domain: String,
    pub ipv6_enabled: bool,
    pub ipv6_success_rate: f64,
    pub ipv4_success_rate: f64,
    pub preference: Ipv6Preference,
    pub ipv6_attempts: u32,
    pub ipv6_successes: u32,
    pub ipv4_attempts: u32,
    pub ipv4_successes: u32,
    pub switch_count: u32,
    pub switch_success_count: u32,
    pub last_ipv6_success_at: Option<f64>,
    pub last_ipv6_failure_at: Option<f64>,
    pub last_ipv4_success_at: Option<f64>,
    pub last_ipv4_failure_at: Option<f64>,
}

impl DomainIpv6Stats {
    #[must_use]
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ipv6_enabled: true,
            ipv6_success_rate: 0.5,
            ipv4_success_rate: 0.5,
            preference: Ipv6Preference::Auto,
            ipv6_attempts: 0,
            ipv6_successes: 0,
            ipv4_attempts: 0,
            ipv4_successes: 0,
            switch_count: 0,
            switch_success_count: 0,
            last_ipv6_success_at: None,
            last_ipv6_failure_at: None,
            last_ipv4_success_at: None,
            last_ipv4_failure_at: None,
        }
    }

    /// Preferred family given this domain's stats and the global setting.
    #[must_use]
    pub fn preferred_family(
        &self,
        global: Ipv6Preference,
        min_samples: u32,
    ) -> AddressFamily {
        if !self.ipv6_enabled {
            return AddressFamily::Ipv4;
        }
        match self.preference {
            Ipv6Preference::Ipv6First => return AddressFamily::Ipv6,
            Ipv6Preference::Ipv4First => return AddressFamily::Ipv4,
            Ipv6Preference::Auto => {}
        }

        // AUTO: learned rates only after enough samples per family
        if self.ipv6_attempts < min_samples && self.ipv4_attempts < min_samples {
            return match global {
                Ipv6Preference::Ipv4First => AddressFamily::Ipv4,
                _ => AddressFamily::Ipv6,
            };
        }
        if self.ipv6_success_rate > self.ipv4_success_rate + AUTO_PREFERENCE_MARGIN {
            AddressFamily::Ipv6
        } else if self.ipv4_success_rate > self.ipv6_success_rate + AUTO_PREFERENCE_MARGIN {
            AddressFamily::Ipv4
        } else {
            // ties prefer IPv6
            AddressFamily::Ipv6
        }
    }

    fn record_attempt(&mut self, family: AddressFamily, success: bool) {
        let now = chrono::Utc::now().timestamp() as f64;
        let value = if success { 1.0 } else { 0.0 };
        match family {
            AddressFamily::Ipv6 => {
                self.ipv6_attempts += 1;
                if success {
                    self.ipv6_successes += 1;
                    self.last_ipv6_success_at = Some(now);
                } else {
                    self.last_ipv6_failure_at = Some(now);
                }
                self.ipv6_success_rate =
                    EMA_ALPHA * value + (1.0 - EMA_ALPHA) * self.ipv6_success_rate;
            }
            AddressFamily::Ipv4 => {
                self.ipv4_attempts += 1;
                if success {
                    self.ipv4_successes += 1;
                    self.last_ipv4_success_at = Some(now);
                } else {
                    self.last_ipv4_failure_at = Some(now);
                }
                self.ipv4_success_rate =
                    EMA_ALPHA * value + (1.0 - EMA_ALPHA) * self.ipv4_success_rate;
            }
        }
    }

    fn record_switch(&mut self, success: bool) {
        self.switch_count += 1;
        if success {
            self.switch_success_count += 1;
        }
    }
}

#[derive(Debug, Default)]
struct Ipv6Metrics {
    total_ipv6_attempts: u64,
    total_ipv6_successes: u64,
    total_ipv4_attempts: u64,
    total_ipv4_successes: u64,
    total_switches: u64,
    total_switch_successes: u64,
    latencies_ms: Vec<f64>,
}

/// Global metrics snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Ipv6MetricsSnapshot {
    pub total_ipv6_attempts: u64,
    pub total_ipv6_successes: u64,
    pub total_ipv4_attempts: u64,
    pub total_ipv4_successes: u64,
    pub total_switches: u64,
    pub total_switch_successes: u64,
    pub ipv6_success_rate: f64,
    pub switch_success_rate: f64,
    pub avg_latency_ms: f64,
}

/// Connection manager implementing resolution, interleave, fallback, and
/// learning.
pub struct Ipv6ConnectionManager {
    settings: Arc<Settings>,
    domain_stats: DashMap<String, DomainIpv6Stats>,
    metrics: Mutex<Ipv6Metrics>,
}

impl Ipv6ConnectionManager {
    #[must_use]
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            domain_stats: DashMap::new(),
            metrics: Mutex::new(Ipv6Metrics::default()),
        }
    }

    fn global_preference(&self) -> Ipv6Preference {
        Ipv6Preference::parse(&self.settings.ipv6.preference)
    }

    #[must_use]
    pub fn is_ipv6_enabled(&self) -> bool {
        self.settings.ipv6.enabled
    }

    /// Get a copy of the learned stats for a domain, creating defaults for
    /// unseen domains.
    #[must_use]
    pub fn domain_stats(&self, domain: &str) -> DomainIpv6Stats {
        self.domain_stats
            .entry(domain.to_string())
            .or_insert_with(|| DomainIpv6Stats::new(domain))
            .clone()
    }

    /// Resolve a hostname into ordered IPv6 and IPv4 address lists.
    pub async fn resolve_addresses(
        &self,
        hostname: &str,
    ) -> (Vec<ResolvedAddress>, Vec<ResolvedAddress>) {
        let mut v6 = Vec::new();
        let mut v4 = Vec::new();
        match tokio::net::lookup_host((hostname, 0u16)).await {
            Ok(addrs) => {
                let mut seen = std::collections::HashSet::new();
                for addr in addrs {
                    match addr {
                        SocketAddr::V6(a) => {
                            let ip = a.ip().to_string();
                            if seen.insert(ip.clone()) {
                                v6.push(ResolvedAddress {
                                    address: ip,
                                    family: AddressFamily::Ipv6,
                                });
                            }
                        }
                        SocketAddr::V4(a) => {
                            let ip = a.ip().to_string();
                            if seen.insert(ip.clone()) {
                                v4.push(ResolvedAddress {
                                    address: ip,
                                    family: AddressFamily::Ipv4,
                                });
                            }
                        }
                    }
                }
            }
            Err(e) => {
                debug!(hostname, error = %e, "dual-stack resolution failed");
            }
        }
        (v6, v4)
    }

    /// Interleave two family lists per Happy-Eyeballs:
    /// `primary[0], secondary[0], primary[1], secondary[1], …`.
    #[must_use]
    pub fn interleave(
        preferred: AddressFamily,
        v6: Vec<ResolvedAddress>,
        v4: Vec<ResolvedAddress>,
    ) -> Vec<ResolvedAddress> {
        let (primary, secondary) = match preferred {
            AddressFamily::Ipv6 => (v6, v4),
            AddressFamily::Ipv4 => (v4, v6),
        };
        let mut result = Vec::with_capacity(primary.len() + secondary.len());
        let max_len = primary.len().max(secondary.len());
        for i in 0..max_len {
            if let Some(a) = primary.get(i) {
                result.push(a.clone());
            }
            if let Some(a) = secondary.get(i) {
                result.push(a.clone());
            }
        }
        result
    }

    /// Addresses for a hostname, ordered by learned preference.
    pub async fn preferred_addresses(
        &self,
        hostname: &str,
        domain: Option<&str>,
    ) -> Vec<ResolvedAddress> {
        let (v6, v4) = self.resolve_addresses(hostname).await;
        if v6.is_empty() && v4.is_empty() {
            return Vec::new();
        }
        let preferred = match domain {
            Some(d) => self
                .domain_stats(d)
                .preferred_family(self.global_preference(), self.settings.ipv6.min_samples),
            None => match self.global_preference() {
                Ipv6Preference::Ipv4First => AddressFamily::Ipv4,
                _ => AddressFamily::Ipv6,
            },
        };
        Self::interleave(preferred, v6, v4)
    }

    /// Try to connect with automatic family fallback.
    ///
    /// `connect` is attempted per address with the configured per-attempt
    /// timeout; the first success wins. Switch accounting records whether
    /// leaving the primary family was required and whether it paid off.
    pub async fn try_connect_with_fallback<F, Fut>(
        &self,
        hostname: &str,
        domain: &str,
        connect: F,
    ) -> ConnectionOutcome
    where
        F: Fn(String, AddressFamily) -> Fut,
        Fut: std::future::Future<Output = Result<(), String>>,
    {
        let timeout = Duration::from_secs_f64(self.settings.ipv6.fallback_timeout_secs);
        let addresses = self.preferred_addresses(hostname, Some(domain)).await;

        if addresses.is_empty() {
            return ConnectionOutcome {
                hostname: hostname.to_string(),
                success: false,
                family_used: None,
                switched: false,
                switch_success: false,
                latency_ms: 0.0,
                error: Some("no addresses resolved".to_string()),
            };
        }

        let primary_family = addresses[0].family;
        let start = Instant::now();
        let mut last_error: Option<String> = None;
        let mut switched = false;

        for addr in &addresses {
            if addr.family != primary_family {
                switched = true;
            }
            match tokio::time::timeout(timeout, connect(addr.address.clone(), addr.family)).await {
                Ok(Ok(())) => {
                    let outcome = ConnectionOutcome {
                        hostname: hostname.to_string(),
                        success: true,
                        family_used: Some(addr.family),
                        switched,
                        switch_success: switched,
                        latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                        error: None,
                    };
                    self.record_connection_result(domain, &outcome);
                    return outcome;
                }
                Ok(Err(e)) => last_error = Some(e),
                Err(_) => {
                    last_error = Some(format!("timeout ({:.1}s)", timeout.as_secs_f64()));
                }
            }
        }

        let outcome = ConnectionOutcome {
            hostname: hostname.to_string(),
            success: false,
            family_used: Some(primary_family),
            switched,
            switch_success: false,
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
            error: last_error,
        };
        self.record_connection_result(domain, &outcome);
        outcome
    }

    /// Fold a connection outcome into per-domain and global stats, and
    /// auto-disable IPv6 for domains that keep failing.
    pub fn record_connection_result(&self, domain: &str, outcome: &ConnectionOutcome) {
        let threshold = self.settings.ipv6.learning_threshold;
        let min_samples = self.settings.ipv6.min_samples;

        let mut entry = self
            .domain_stats
            .entry(domain.to_string())
            .or_insert_with(|| DomainIpv6Stats::new(domain));

        if let Some(family) = outcome.family_used {
            entry.record_attempt(family, outcome.success);
        }
        if outcome.switched {
            entry.record_switch(outcome.switch_success);
        }

        if entry.ipv6_attempts >= min_samples
            && entry.ipv6_success_rate < threshold
            && entry.ipv6_enabled
        {
            entry.ipv6_enabled = false;
            info!(
                domain,
                ipv6_success_rate = entry.ipv6_success_rate,
                threshold,
                "disabling IPv6 for domain after repeated failures"
            );
        }
        drop(entry);

        let mut m = self.metrics.lock();
        match outcome.family_used {
            Some(AddressFamily::Ipv6) => {
                m.total_ipv6_attempts += 1;
                if outcome.success {
                    m.total_ipv6_successes += 1;
                }
            }
            Some(AddressFamily::Ipv4) => {
                m.total_ipv4_attempts += 1;
                if outcome.success {
                    m.total_ipv4_successes += 1;
                }
            }
            None => {}
        }
        if outcome.switched {
            m.total_switches += 1;
            if outcome.switch_success {
                m.total_switch_successes += 1;
            }
        }
        m.latencies_ms.push(outcome.latency_ms);
        if m.latencies_ms.len() > 100 {
            m.latencies_ms.remove(0);
        }
    }

    /// Re-enable (or disable) IPv6 for a domain manually.
    pub fn set_ipv6_enabled_for_domain(&self, domain: &str, enabled: bool) {
        let mut entry = self
            .domain_stats
            .entry(domain.to_string())
            .or_insert_with(|| DomainIpv6Stats::new(domain));
        entry.ipv6_enabled = enabled;
        info!(domain, enabled, "set domain IPv6 enabled");
    }

    pub fn set_domain_preference(&self, domain: &str, preference: Ipv6Preference) {
        let mut entry = self
            .domain_stats
            .entry(domain.to_string())
            .or_insert_with(|| DomainIpv6Stats::new(domain));
        entry.preference = preference;
    }

    #[must_use]
    pub fn metrics(&self) -> Ipv6MetricsSnapshot {
        let m = self.metrics.lock();
        let v6_rate = if m.total_ipv6_attempts == 0 {
            0.0
        } else {
            m.total_ipv6_successes as f64 / m.total_ipv6_attempts as f64
        };
        let switch_rate = if m.total_switches == 0 {
            0.0
        } else {
            m.total_switch_successes as f64 / m.total_switches as f64
        };
        let avg_latency = if m.latencies_ms.is_empty() {
            0.0
        } else {
            m.latencies_ms.iter().sum::<f64>() / m.latencies_ms.len() as f64
        };
        Ipv6MetricsSnapshot {
            total_ipv6_attempts: m.total_ipv6_attempts,
            total_ipv6_successes: m.total_ipv6_successes,
            total_ipv4_attempts: m.total_ipv4_attempts,
            total_ipv4_successes: m.total_ipv4_successes,
            total_switches: m.total_switches,
            total_switch_successes: m.total_switch_successes,
            ipv6_success_rate: v6_rate,
            switch_success_rate: switch_rate,
            avg_latency_ms: avg_latency,
        }
    }

    /// Load learned domain stats from the `domains` table.
    pub async fn load_domain_stats(&self, pool: &SqlitePool) -> anyhow::Result<usize> {
        let rows = sqlx::query(
            r#"
            SELECT domain, ipv6_enabled, ipv6_success_rate, ipv4_success_rate,
                   ipv6_preference, ipv6_attempts, ipv6_successes,
                   ipv4_attempts, ipv4_successes, switch_count, switch_success_count,
                   last_ipv6_success_at, last_ipv6_failure_at,
                   last_ipv4_success_at, last_ipv4_failure_at
            FROM domains
            "#,
        )
        .fetch_all(pool)
        .await?;

        let count = rows.len();
        for row in rows {
            let domain: String = row.get("domain");
            let stats = DomainIpv6Stats {
                domain: domain.clone(),
                ipv6_enabled: row.get::<i64, _>("ipv6_enabled") != 0,
                ipv6_success_rate: row.get("ipv6_success_rate"),
                ipv4_success_rate: row.get("ipv4_success_rate"),
                preference: Ipv6Preference::parse(&row.get::<String, _>("ipv6_preference")),
                ipv6_attempts: row.get::<i64, _>("ipv6_attempts") as u32,
                ipv6_successes: row.get::<i64, _>("ipv6_successes") as u32,
                ipv4_attempts: row.get::<i64, _>("ipv4_attempts") as u32,
                ipv4_successes: row.get::<i64, _>("ipv4_successes") as u32,
                switch_count: row.get::<i64, _>("switch_count") as u32,
                switch_success_count: row.get::<i64, _>("switch_success_count") as u32,
                last_ipv6_success_at: row.get("last_ipv6_success_at"),
                last_ipv6_failure_at: row.get("last_ipv6_failure_at"),
                last_ipv4_success_at: row.get("last_ipv4_success_at"),
                last_ipv4_failure_at: row.get("last_ipv4_failure_at"),
            };
            self.domain_stats.insert(domain, stats);
        }
        Ok(count)
    }

    /// Persist one domain's learned stats (upsert).
    pub async fn save_domain_stats(&self, pool: &SqlitePool, domain: &str) -> anyhow::Result<()> {
        let stats = self.domain_stats(domain);
        let result = sqlx::query(
            r#"
            INSERT INTO domains (
                domain, ipv6_enabled, ipv6_success_rate, ipv4_success_rate,
                ipv6_preference, ipv6_attempts, ipv6_successes,
                ipv4_attempts, ipv4_successes, switch_count, switch_success_count,
                last_ipv6_success_at, last_ipv6_failure_at,
                last_ipv4_success_at, last_ipv4_failure_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(domain) DO UPDATE SET
                ipv6_enabled = excluded.ipv6_enabled,
                ipv6_success_rate = excluded.ipv6_success_rate,
                ipv4_success_rate = excluded.ipv4_success_rate,
                ipv6_preference = excluded.ipv6_preference,
                ipv6_attempts = excluded.ipv6_attempts,
                ipv6_successes = excluded.ipv6_successes,
                ipv4_attempts = excluded.ipv4_attempts,
                ipv4_successes = excluded.ipv4_successes,
                switch_count = excluded.switch_count,
                switch_success_count = excluded.switch_success_count,
                last_ipv6_success_at = excluded.last_ipv6_success_at,
                last_ipv6_failure_at = excluded.last_ipv6_failure_at,
                last_ipv4_success_at = excluded.last_ipv4_success_at,
                last_ipv4_failure_at = excluded.last_ipv4_failure_at
            "#,
        )
        .bind(&stats.domain)
        .bind(i64::from(stats.ipv6_enabled))
        .bind(stats.ipv6_success_rate)
        .bind(stats.ipv4_success_rate)
        .bind(stats.preference.as_str())
        .bind(i64::from(stats.ipv6_attempts))
        .bind(i64::from(stats.ipv6_successes))
        .bind(i64::from(stats.ipv4_attempts))
        .bind(i64::from(stats.ipv4_successes))
        .bind(i64::from(stats.switch_count))
        .bind(i64::from(stats.switch_success_count))
        .bind(stats.last_ipv6_success_at)
        .bind(stats.last_ipv6_failure_at)
        .bind(stats.last_ipv4_success_at)
        .bind(stats.last_ipv4_failure_at)
        .execute(pool)
        .await;

        if let Err(e) = result {
            warn!(domain, error = %e, "failed to persist domain IPv6 stats");
            return Err(e.into());
        }
        Ok(())
    }
}

impl std::fmt::Debug for Ipv6ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ipv6ConnectionManager")
            .field("tracked_domains", &self.domain_stats.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str, family: AddressFamily) -> ResolvedAddress {
        ResolvedAddress {
            address: s.to_string(),
            family,
        }
    }

    #[test]
    fn interleave_alternates_families() {
        let v6 = vec![addr("::1", AddressFamily::Ipv6), addr("::2", AddressFamily::Ipv6)];
        let v4 = vec![addr("1.1.1.1", AddressFamily::Ipv4)];
        let out = Ipv6ConnectionManager::interleave(AddressFamily::Ipv6, v6, v4);
        let order: Vec<&str> = out.iter().map(|a| a.address.as_str()).collect();
        assert_eq!(order, vec!["::1", "1.1.1.1", "::2"]);
    }

    #[test]
    fn disabled_domain_prefers_ipv4() {
        let mut stats = DomainIpv6Stats::new("example.com");
        stats.ipv6_enabled = false;
        assert_eq!(
            stats.preferred_family(Ipv6Preference::Ipv6First, 5),
            AddressFamily::Ipv4
        );
    }

    #[test]
    fn auto_uses_global_default_before_min_samples() {
        let stats = DomainIpv6Stats::new("example.com");
        assert_eq!(
            stats.preferred_family(Ipv6Preference::Auto, 5),
            AddressFamily::Ipv6
        );
        assert_eq!(
            stats.preferred_family(Ipv6Preference::Ipv4First, 5),
            AddressFamily::Ipv4
        );
    }

    #[test]
    fn auto_prefers_family_with_better_ema() {
        let mut stats = DomainIpv6Stats::new("example.com");
        stats.ipv6_attempts = 10;
        stats.ipv4_attempts = 10;
        stats.ipv6_success_rate = 0.2;
        stats.ipv4_success_rate = 0.9;
        assert_eq!(
            stats.preferred_family(Ipv6Preference::Auto, 5),
            AddressFamily::Ipv4
        );

        // within the margin ties prefer IPv6
        stats.ipv6_success_rate = 0.85;
        assert_eq!(
            stats.preferred_family(Ipv6Preference::Auto, 5),
            AddressFamily::Ipv6
        );
    }
}
