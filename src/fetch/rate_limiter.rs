//! Per-domain request spacing with jitter.
//!
//! Unlike a token bucket that denies, this gate *waits*: fetch jobs already
//! hold a slot, so the polite thing is to sleep until the domain's minimum
//! interval (plus a uniform jitter) has elapsed since the previous request.
//! Instance-based so tests run isolated.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Mutex;

use crate::config::Settings;
use crate::utils::registrable_domain;

/// Per-domain minimum-interval gate.
pub struct DomainRateLimiter {
    settings: Arc<Settings>,
    /// Last-request instant per registrable domain, behind an async mutex so
    /// concurrent fetchers to the same domain serialise their waits.
    domains: DashMap<String, Arc<Mutex<Option<Instant>>>>,
}

impl DomainRateLimiter {
    #[must_use]
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            domains: DashMap::new(),
        }
    }

    /// Wait until a request to `url`'s domain is allowed, then stamp the
    /// domain. Unparseable URLs pass through without a wait.
    pub async fn acquire(&self, url: &str) {
        let Some(domain) = registrable_domain(url) else {
            return;
        };

        let slot = self
            .domains
            .entry(domain)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();

        let mut last = slot.lock().await;

        let min_interval = self.settings.crawler.min_request_interval_secs;
        let jitter = {
            let mut rng = rand::rng();
            rng.random_range(
                self.settings.crawler.delay_min_secs..=self.settings.crawler.delay_max_secs,
            )
        };

        if let Some(prev) = *last {
            let elapsed = prev.elapsed().as_secs_f64();
            let wait = (min_interval + jitter - elapsed).max(0.0);
            if wait > 0.0 {
                tokio::time::sleep(std::time::Duration::from_secs_f64(wait)).await;
            }
        }

        *last = Some(Instant::now());
    }

    /// Number of domains with recorded traffic.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.domains.len()
    }
}
