//! Configuration types for all Lancet subsystems.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level settings tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub tor: TorSettings,
    pub dns: DnsSettings,
    pub ipv6: Ipv6Settings,
    pub crawler: CrawlerSettings,
    pub browser: BrowserSettings,
    pub session: SessionSettings,
    pub budget: BudgetSettings,
    pub verification: VerificationSettings,
    pub ml: MlSettings,
    pub storage: StorageSettings,
}

impl Settings {
    /// Parse settings from a JSON document, filling gaps with defaults.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Tor routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TorSettings {
    pub enabled: bool,
    pub socks_host: String,
    pub socks_port: u16,
}

impl Default for TorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            socks_host: "127.0.0.1".to_string(),
            socks_port: 9050,
        }
    }
}

/// DNS policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSettings {
    /// Resolve hostnames at the SOCKS proxy when routing through Tor
    /// (`socks5h://`). Disabling this is a documented leak risk and only
    /// honoured through an explicit per-call override.
    pub resolve_through_tor: bool,
    pub leak_detection_enabled: bool,
    pub respect_cache_ttl: bool,
    /// Default TTL assumed for direct-route results (seconds).
    pub default_ttl_secs: u64,
    pub min_cache_ttl_secs: u64,
    pub max_cache_ttl_secs: u64,
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            resolve_through_tor: true,
            leak_detection_enabled: true,
            respect_cache_ttl: true,
            default_ttl_secs: 300,
            min_cache_ttl_secs: 60,
            max_cache_ttl_secs: 3600,
        }
    }
}

/// Global IPv6 preference names accepted in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Ipv6Settings {
    pub enabled: bool,
    /// `ipv6_first`, `ipv4_first`, or `auto`.
    pub preference: String,
    /// Per-attempt connect timeout for Happy-Eyeballs attempts (seconds).
    pub fallback_timeout_secs: f64,
    /// EMA below which a domain's IPv6 is auto-disabled.
    pub learning_threshold: f64,
    /// Minimum attempts per family before learned preferences apply.
    pub min_samples: u32,
}

impl Default for Ipv6Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            preference: "ipv6_first".to_string(),
            fallback_timeout_secs: 5.0,
            learning_threshold: 0.3,
            min_samples: 5,
        }
    }
}

/// Fetch pipeline configuration shared by the HTTP and browser paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerSettings {
    pub request_timeout_secs: u64,
    pub page_load_timeout_secs: u64,
    /// Minimum spacing between requests to one registrable domain (seconds).
    pub min_request_interval_secs: f64,
    /// Uniform jitter bounds added on top of the minimum interval.
    pub delay_min_secs: f64,
    pub delay_max_secs: f64,
    pub accept_language: String,
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            page_load_timeout_secs: 30,
            min_request_interval_secs: 1.0,
            delay_min_secs: 0.2,
            delay_max_secs: 0.8,
            accept_language: "ja,en-US;q=0.9,en;q=0.8".to_string(),
        }
    }
}

/// Attached-browser configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub chrome_host: String,
    /// Worker `n` attaches to `debug_port_base + n`.
    pub debug_port_base: u16,
    /// Project script invoked (under a process-wide lock) when no browser is
    /// reachable: `<script> start-worker <n>`.
    pub autostart_script: PathBuf,
    pub autostart_timeout_secs: u64,
    pub attach_timeout_secs: u64,
    pub attach_poll_timeout_secs: u64,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub take_screenshots: bool,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            chrome_host: "127.0.0.1".to_string(),
            debug_port_base: 9222,
            autostart_script: PathBuf::from("scripts/chrome.sh"),
            autostart_timeout_secs: 30,
            attach_timeout_secs: 6,
            attach_poll_timeout_secs: 15,
            viewport_width: 1280,
            viewport_height: 900,
            take_screenshots: true,
        }
    }
}

/// Captured-session storage bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub max_sessions: usize,
    pub ttl_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            ttl_secs: 1800,
        }
    }
}

/// Per-task budget limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSettings {
    pub max_pages_per_task: u32,
    pub max_time_secs: f64,
    pub max_llm_ratio: f64,
    /// The LLM-ratio check is suppressed until this much wall time has
    /// elapsed, so short tasks can bootstrap.
    pub llm_ratio_warmup_secs: f64,
    /// Assumed duration of one LLM job for admission projection (seconds).
    pub llm_estimate_secs: f64,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            max_pages_per_task: 120,
            max_time_secs: 1200.0,
            max_llm_ratio: 0.30,
            llm_ratio_warmup_secs: 30.0,
            llm_estimate_secs: 5.0,
        }
    }
}

/// Cross-verification thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationSettings {
    pub top_k: usize,
    pub min_similarity: f64,
    pub max_domains: usize,
    pub max_pairs_per_claim: usize,
    pub min_nli_confidence: f64,
    pub save_neutral: bool,
    pub embedding_model: String,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            top_k: 30,
            min_similarity: 0.55,
            max_domains: 6,
            max_pairs_per_claim: 20,
            min_nli_confidence: 0.6,
            save_neutral: true,
            embedding_model: "multilingual-e5-small".to_string(),
        }
    }
}

/// ML inference service client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MlSettings {
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_secs: f64,
}

impl Default for MlSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8900/ml".to_string(),
            timeout_secs: 60,
            max_retries: 3,
            retry_delay_secs: 1.0,
        }
    }
}

/// On-disk storage roots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// SQLite database path; `:memory:` for tests.
    pub database_path: String,
    /// Root for the content-addressed page store and archives.
    pub content_dir: PathBuf,
    /// Profile directory holding the fingerprint baseline.
    pub profile_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: "lancet.sqlite".to_string(),
            content_dir: PathBuf::from("data/content"),
            profile_dir: PathBuf::from("data/profile"),
        }
    }
}
