//! HTTP-client fetch path with conditional requests and session transfer.
//!
//! One request per call, redirects followed. Header assembly order matters:
//! URL-specific cached validators are set first and take precedence over
//! anything session transfer would contribute; session transfer is asked to
//! suppress its conditionals in that case. The challenge detector gates the
//! body — this path never tries to solve a challenge, it reports it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{FetchReason, non_empty_reason};
use crate::fetch::archive::write_archive;
use crate::fetch::challenge::is_challenge_page;
use crate::fetch::rate_limiter::DomainRateLimiter;
use crate::fetch::result::{FetchMethod, FetchResult};
use crate::fetch::session::SessionTransferManager;
use crate::net::dns_policy::DnsPolicyManager;
use crate::net::sec_fetch::{NavigationContext, generate_sec_fetch_headers};
use crate::storage::content::ContentStore;

const ACCEPT_HEADER: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const ACCEPT_ENCODING_HEADER: &str = "gzip, deflate, br";
const CHROME_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Options for a single HTTP fetch.
#[derive(Debug, Clone, Default)]
pub struct HttpFetchOptions {
    pub referer: Option<String>,
    pub use_tor: bool,
    /// Explicit unsafe override: resolve DNS locally even over Tor
    /// (`socks5://` form). `None` follows configuration.
    pub resolve_dns_through_proxy: Option<bool>,
    pub cached_etag: Option<String>,
    pub cached_last_modified: Option<String>,
    pub extra_headers: Vec<(String, String)>,
}

/// HTTP fetch path.
pub struct HttpFetcher {
    settings: Arc<Settings>,
    rate_limiter: Arc<DomainRateLimiter>,
    sessions: Arc<SessionTransferManager>,
    dns_policy: Arc<DnsPolicyManager>,
    content_store: ContentStore,
    direct_client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(
        settings: Arc<Settings>,
        rate_limiter: Arc<DomainRateLimiter>,
        sessions: Arc<SessionTransferManager>,
        dns_policy: Arc<DnsPolicyManager>,
    ) -> anyhow::Result<Self> {
        let direct_client = Self::build_client(&settings, None)?;
        let content_store = ContentStore::new(settings.storage.content_dir.clone());
        Ok(Self {
            settings,
            rate_limiter,
            sessions,
            dns_policy,
            content_store,
            direct_client,
        })
    }

    fn build_client(settings: &Settings, proxy_url: Option<&str>) -> anyhow::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .user_agent(CHROME_USER_AGENT)
            .timeout(Duration::from_secs(settings.crawler.request_timeout_secs))
            .gzip(true);
        if let Some(url) = proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(url)?);
        }
        Ok(builder.build()?)
    }

    /// Fetch one URL.
    pub async fn fetch(&self, url: &str, options: &HttpFetchOptions) -> FetchResult {
        self.rate_limiter.acquire(url).await;

        // Base headers + navigation-context Sec-Fetch triple
        let mut headers: Vec<(String, String)> = vec![
            ("Accept".to_string(), ACCEPT_HEADER.to_string()),
            (
                "Accept-Language".to_string(),
                self.settings.crawler.accept_language.clone(),
            ),
            ("Accept-Encoding".to_string(), ACCEPT_ENCODING_HEADER.to_string()),
        ];
        let nav = NavigationContext::document(url, options.referer.clone());
        for (name, value) in generate_sec_fetch_headers(&nav).to_pairs() {
            headers.push((name.to_string(), value));
        }
        if let Some(referer) = &options.referer {
            headers.push(("Referer".to_string(), referer.clone()));
        }

        // URL-specific validators first; they outrank session-level ones
        let has_url_conditionals =
            options.cached_etag.is_some() || options.cached_last_modified.is_some();
        if let Some(etag) = &options.cached_etag {
            headers.push(("If-None-Match".to_string(), etag.clone()));
        }
        if let Some(lm) = &options.cached_last_modified {
            headers.push(("If-Modified-Since".to_string(), lm.clone()));
        }

        // Session transfer contributes only non-conflicting headers
        let transfer = self.sessions.transfer_headers(url, !has_url_conditionals);
        if transfer.ok {
            debug!(
                url = %truncate(url),
                session_id = transfer.session_id.as_deref().unwrap_or(""),
                header_count = transfer.headers.len(),
                "applying session transfer headers"
            );
            // conditionals were suppressed above when URL-specific values
            // exist, so replacement here cannot violate the precedence rule
            for (name, value) in transfer.headers {
                replace_header(&mut headers, name, value);
            }
        }

        for (name, value) in &options.extra_headers {
            replace_header(&mut headers, name.clone(), value.clone());
        }

        // Proxy selection per DNS policy; socks5h keeps resolution at the
        // proxy, the only leak-safe form over Tor
        let proxy_url = self
            .dns_policy
            .socks_proxy_url(options.use_tor, options.resolve_dns_through_proxy);
        let client = match &proxy_url {
            None => self.direct_client.clone(),
            Some(proxy) => match Self::build_client(&self.settings, Some(proxy)) {
                Ok(client) => client,
                Err(e) => {
                    return FetchResult::failure(
                        url,
                        FetchMethod::HttpClient,
                        non_empty_reason("ProxyError", &e.to_string()),
                    );
                }
            },
        };

        let mut request = client.get(url);
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %truncate(url), error = %e, "HTTP fetch error");
                return FetchResult::failure(
                    url,
                    FetchMethod::HttpClient,
                    non_empty_reason("reqwest::Error", &e.to_string()),
                );
            }
        };

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let resp_headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let header = |name: &str| {
            resp_headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        };
        let resp_etag = header("etag");
        let resp_last_modified = header("last-modified");

        // 304: cached copy still valid, no body to process
        if status == 304 {
            info!(url = %truncate(url), "HTTP 304 Not Modified, using cached content");
            let mut result = FetchResult::success(url, FetchMethod::HttpClient, 304);
            result.final_url = final_url;
            result.from_cache = true;
            result.etag = resp_etag.or_else(|| options.cached_etag.clone());
            result.last_modified = resp_last_modified.or_else(|| options.cached_last_modified.clone());
            return result;
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                return FetchResult::failure(
                    url,
                    FetchMethod::HttpClient,
                    non_empty_reason("reqwest::Error", &e.to_string()),
                );
            }
        };

        let body_text = String::from_utf8_lossy(&body);
        let header_map: HashMap<String, String> = resp_headers
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.clone()))
            .collect();
        if is_challenge_page(&body_text, &header_map) {
            info!(url = %truncate(url), "challenge detected on HTTP path");
            let mut result = FetchResult::failure(
                url,
                FetchMethod::HttpClient,
                FetchReason::ChallengeDetected.as_str(),
            );
            result.status = Some(status);
            return result;
        }

        // Persist body + archive record bundle
        let (content_hash, html_path) = match self.content_store.put(&body, "html").await {
            Ok((hash, path)) => (hash, path),
            Err(e) => {
                return FetchResult::failure(
                    url,
                    FetchMethod::HttpClient,
                    non_empty_reason("StoreError", &format!("{e:#}")),
                );
            }
        };
        let archive_dir = self.content_store.root().join("archive");
        let archive_path =
            match write_archive(&archive_dir, url, status, &headers, &resp_headers, &body) {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!(url = %truncate(url), error = %format!("{e:#}"), "archive write failed");
                    None
                }
            };

        info!(
            url = %truncate(url),
            status,
            content_length = body.len(),
            has_etag = resp_etag.is_some(),
            "HTTP fetch success"
        );

        let mut result = FetchResult::success(url, FetchMethod::HttpClient, status);
        result.final_url = final_url;
        result.content_hash = Some(content_hash);
        result.html_path = Some(html_path.to_string_lossy().into_owned());
        result.archive_path = archive_path.map(|p| p.to_string_lossy().into_owned());
        result.etag = resp_etag;
        result.last_modified = resp_last_modified;
        result
    }

    /// Synthesised request headers for a URL without sending anything.
    /// Exposed for revisit planning and tests of the precedence rule.
    #[must_use]
    pub fn plan_headers(&self, url: &str, options: &HttpFetchOptions) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = Vec::new();
        let has_url_conditionals =
            options.cached_etag.is_some() || options.cached_last_modified.is_some();
        if let Some(etag) = &options.cached_etag {
            headers.push(("If-None-Match".to_string(), etag.clone()));
        }
        if let Some(lm) = &options.cached_last_modified {
            headers.push(("If-Modified-Since".to_string(), lm.clone()));
        }
        let transfer = self.sessions.transfer_headers(url, !has_url_conditionals);
        if transfer.ok {
            for (name, value) in transfer.headers {
                replace_header(&mut headers, name, value);
            }
        }
        headers
    }
}

/// Set a header, replacing any earlier value of the same name.
fn replace_header(headers: &mut Vec<(String, String)>, name: String, value: String) {
    if let Some(slot) = headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&name)) {
        slot.1 = value;
    } else {
        headers.push((name, value));
    }
}

fn truncate(url: &str) -> &str {
    if url.len() <= 80 {
        url
    } else {
        // fall back to the whole URL if byte 80 is not a char boundary
        url.get(..80).unwrap_or(url)
    }
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher").finish_non_exhaustive()
    }
}
