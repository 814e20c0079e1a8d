//! Attached-browser fetch path.
//!
//! Navigation happens in a real Chrome reached over its debugging protocol;
//! headless mode is forbidden — fingerprint consistency comes from the real
//! profile, not from a headless browser dressed up as one. Each worker owns
//! a distinct debug port (`base + worker_id`) and reuses the attached
//! profile's default context so cookies persist across fetches. If nothing
//! is listening, a project script is invoked under a process-wide lock and
//! the attach is retried with bounded polling; on persistent failure the
//! fetch fails — there is no software-emulation fallback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, EventResponseReceived, Headers, ResourceType, SetExtraHttpHeadersParams,
};
use chromiumoxide::page::Page;
use futures::StreamExt;
use once_cell::sync::Lazy;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::auth::InterventionQueue;
use crate::config::Settings;
use crate::error::{FetchReason, non_empty_reason};
use crate::fetch::archive::write_archive;
use crate::fetch::challenge::{detect_challenge_kind, is_challenge_page};
use crate::fetch::human::HumanBehavior;
use crate::fetch::profile_audit::{AuditStatus, ProfileAuditor};
use crate::fetch::rate_limiter::DomainRateLimiter;
use crate::fetch::result::{FetchMethod, FetchResult};
use crate::fetch::session::{CapturedCookie, SessionTransferManager};
use crate::lifecycle::{LifecycleManager, Releaser, ResourceKind};
use crate::storage::content::ContentStore;
use crate::utils::registrable_domain;

/// Serialises browser auto-start across every worker and component in the
/// process; without it two workers racing an unreachable browser would both
/// launch one.
static AUTOSTART_LOCK: Lazy<tokio::sync::Mutex<()>> = Lazy::new(|| tokio::sync::Mutex::new(()));

/// Options for one browser fetch.
#[derive(Debug, Clone)]
pub struct BrowserFetchOptions {
    pub referer: Option<String>,
    pub task_id: Option<String>,
    /// Job id parked in `awaiting_auth` when a challenge gets queued.
    pub job_id: Option<String>,
    pub allow_intervention: bool,
    pub queue_auth: bool,
    pub auth_priority: String,
    pub simulate_human: bool,
    pub take_screenshot: bool,
}

impl Default for BrowserFetchOptions {
    fn default() -> Self {
        Self {
            referer: None,
            task_id: None,
            job_id: None,
            allow_intervention: true,
            queue_auth: true,
            auth_priority: "medium".to_string(),
            simulate_human: true,
            take_screenshot: true,
        }
    }
}

struct AttachedBrowser {
    browser: Browser,
    handler: JoinHandle<()>,
}

impl Drop for AttachedBrowser {
    fn drop(&mut self) {
        // The event drain task must not outlive the connection.
        self.handler.abort();
    }
}

/// Browser-path fetcher bound to one worker's debug port.
pub struct BrowserFetcher {
    worker_id: usize,
    settings: Arc<Settings>,
    rate_limiter: Arc<DomainRateLimiter>,
    sessions: Arc<SessionTransferManager>,
    auth_queue: InterventionQueue,
    lifecycle: Arc<LifecycleManager>,
    auditor: ProfileAuditor,
    content_store: ContentStore,
    human: HumanBehavior,
    attached: tokio::sync::Mutex<Option<Arc<AttachedBrowser>>>,
    /// Whether the current attachment has been audited this task.
    audited_task: tokio::sync::Mutex<Option<String>>,
}

impl BrowserFetcher {
    #[must_use]
    pub fn new(
        worker_id: usize,
        settings: Arc<Settings>,
        rate_limiter: Arc<DomainRateLimiter>,
        sessions: Arc<SessionTransferManager>,
        auth_queue: InterventionQueue,
        lifecycle: Arc<LifecycleManager>,
    ) -> Self {
        let auditor = ProfileAuditor::new(settings.storage.profile_dir.clone());
        let content_store = ContentStore::new(settings.storage.content_dir.clone());
        Self {
            worker_id,
            settings,
            rate_limiter,
            sessions,
            auth_queue,
            lifecycle,
            auditor,
            content_store,
            human: HumanBehavior,
            attached: tokio::sync::Mutex::new(None),
            audited_task: tokio::sync::Mutex::new(None),
        }
    }

    fn debug_port(&self) -> u16 {
        self.settings.browser.debug_port_base + self.worker_id as u16
    }

    fn cdp_url(&self) -> String {
        format!("http://{}:{}", self.settings.browser.chrome_host, self.debug_port())
    }

    async fn cdp_available(&self) -> bool {
        let url = format!("{}/json/version", self.cdp_url());
        matches!(
            timeout(Duration::from_secs(2), reqwest::get(&url)).await,
            Ok(Ok(response)) if response.status().is_success()
        )
    }

    /// Run the project auto-start script for this worker under the
    /// process-wide lock.
    async fn auto_start_browser(&self) -> bool {
        let script = &self.settings.browser.autostart_script;
        if !script.exists() {
            warn!(script = %script.display(), "browser auto-start script not found");
            return false;
        }

        let _guard = AUTOSTART_LOCK.lock().await;

        // Another component may have started it while we waited on the lock.
        if self.cdp_available().await {
            info!(worker_id = self.worker_id, port = self.debug_port(), "browser already available");
            return true;
        }

        info!(
            worker_id = self.worker_id,
            port = self.debug_port(),
            script = %script.display(),
            "auto-starting browser for worker"
        );
        let child = tokio::process::Command::new(script)
            .arg("start-worker")
            .arg(self.worker_id.to_string())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!(error = %e, "browser auto-start spawn failed");
                return false;
            }
        };

        let wait = timeout(
            Duration::from_secs(self.settings.browser.autostart_timeout_secs),
            child.wait(),
        )
        .await;
        match wait {
            Ok(Ok(status)) if status.success() => true,
            Ok(Ok(status)) => {
                warn!(code = status.code().unwrap_or(-1), "browser auto-start script failed");
                false
            }
            Ok(Err(e)) => {
                warn!(error = %e, "browser auto-start wait failed");
                false
            }
            Err(_) => {
                warn!(worker_id = self.worker_id, "browser auto-start timed out");
                let _ = child.kill().await;
                false
            }
        }
    }

    async fn attach_once(&self, attach_timeout: Duration) -> anyhow::Result<AttachedBrowser> {
        let (browser, mut handler) = timeout(attach_timeout, Browser::connect(self.cdp_url()))
            .await
            .map_err(|_| anyhow::anyhow!("CDP connection timeout"))??;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = ?e, "browser event handler error");
                }
            }
        });

        Ok(AttachedBrowser {
            browser,
            handler: handler_task,
        })
    }

    /// Ensure a live attachment, auto-starting the browser if needed.
    async fn ensure_browser(&self, task_id: Option<&str>) -> Result<Arc<AttachedBrowser>, String> {
        let mut attached = self.attached.lock().await;

        // A stale connection (browser closed by the user, crash) is detected
        // by a version probe and discarded for reconnection.
        if let Some(current) = attached.as_ref() {
            if current.browser.version().await.is_ok() {
                return Ok(Arc::clone(current));
            }
            info!(worker_id = self.worker_id, "browser connection stale, reattaching");
            *attached = None;
        }

        let attach_timeout = Duration::from_secs(self.settings.browser.attach_timeout_secs);
        let first_attempt = self.attach_once(attach_timeout).await;

        let new_attachment = match first_attempt {
            Ok(attachment) => attachment,
            Err(first_error) => {
                info!(
                    worker_id = self.worker_id,
                    error = %first_error,
                    "CDP attach failed, attempting auto-start"
                );
                if !self.auto_start_browser().await {
                    return Err(format!("CDP connection failed: {first_error}"));
                }

                // Poll the attach until the post-start budget runs out.
                let deadline = tokio::time::Instant::now()
                    + Duration::from_secs(self.settings.browser.attach_poll_timeout_secs);
                loop {
                    match self.attach_once(Duration::from_secs(3)).await {
                        Ok(attachment) => break attachment,
                        Err(e) if tokio::time::Instant::now() < deadline => {
                            debug!(error = %e, "CDP attach retry");
                            tokio::time::sleep(Duration::from_millis(500)).await;
                        }
                        Err(e) => {
                            return Err(format!("CDP connection failed after auto-start: {e}"));
                        }
                    }
                }
            }
        };

        let attachment = Arc::new(new_attachment);
        *attached = Some(Arc::clone(&attachment));

        if let Some(task_id) = task_id {
            let slot = Arc::clone(&attachment);
            let releaser: Releaser = Box::new(move || {
                Box::pin(async move {
                    // Dropping the Arc aborts the handler; the attached
                    // browser itself belongs to the user's profile and is
                    // left running.
                    drop(slot);
                    Ok(())
                })
            });
            self.lifecycle
                .register(
                    format!("driver_w{}_{}", self.worker_id, task_id),
                    ResourceKind::Driver,
                    Some(task_id.to_string()),
                    releaser,
                )
                .await;
        }

        Ok(attachment)
    }

    /// Audit the profile once per task, never blocking the fetch.
    async fn audit_profile(&self, attachment: &AttachedBrowser, task_id: &str) {
        let mut audited = self.audited_task.lock().await;
        if audited.as_deref() == Some(task_id) {
            return;
        }
        *audited = Some(task_id.to_string());
        drop(audited);

        match attachment.browser.new_page("about:blank").await {
            Ok(page) => {
                let result = self.auditor.audit(&page).await;
                match result.status {
                    AuditStatus::Drift => warn!(
                        task_id,
                        drifted = ?result.drifted,
                        repairs = ?result.repairs,
                        "profile drift detected and repaired"
                    ),
                    AuditStatus::Fail => {
                        warn!(task_id, error = ?result.error, "profile health audit failed");
                    }
                    AuditStatus::Healthy => {}
                }
                let _ = page.close().await;
            }
            Err(e) => warn!(task_id, error = %e, "profile audit page open failed"),
        }
    }

    /// Fetch one URL through the attached browser.
    pub async fn fetch(&self, url: &str, options: &BrowserFetchOptions) -> FetchResult {
        self.rate_limiter.acquire(url).await;

        let domain = registrable_domain(url).unwrap_or_default();

        let attachment = match self.ensure_browser(options.task_id.as_deref()).await {
            Ok(attachment) => attachment,
            Err(reason) => {
                let mut result = FetchResult::failure(
                    url,
                    FetchMethod::BrowserHeadful,
                    FetchReason::CdpUnreachable.as_str(),
                );
                result.reason = Some(format!("{}: {reason}", FetchReason::CdpUnreachable.as_str()));
                return result;
            }
        };

        if let Some(task_id) = options.task_id.as_deref() {
            self.audit_profile(&attachment, task_id).await;
        }

        let page = match attachment.browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                return FetchResult::failure(
                    url,
                    FetchMethod::BrowserHeadful,
                    non_empty_reason("CdpError", &e.to_string()),
                );
            }
        };

        let mut keep_page_open = false;
        let result = self.fetch_on_page(&page, url, &domain, options, &mut keep_page_open).await;

        if keep_page_open {
            debug!(url = %truncate(url), "page kept open for challenge resolution");
        } else {
            let _ = page.close().await;
        }

        result
    }

    async fn fetch_on_page(
        &self,
        page: &Page,
        url: &str,
        domain: &str,
        options: &BrowserFetchOptions,
        keep_page_open: &mut bool,
    ) -> FetchResult {
        // Inject cookies from a stored session for this domain (resolved
        // interventions leave their cookies in the transfer store).
        if let Some(session) = self.sessions.session_for_domain(domain) {
            let params: Vec<CookieParam> = session
                .cookies
                .iter()
                .filter_map(|c| cookie_to_param(c, domain))
                .collect();
            if !params.is_empty() {
                if let Err(e) = page.set_cookies(params).await {
                    warn!(domain, error = %e, "failed to apply stored cookies");
                } else {
                    info!(domain, count = session.cookies.len(), "applied stored session cookies");
                }
            }
        }

        if let Some(referer) = &options.referer {
            let headers = Headers::new(serde_json::json!({ "Referer": referer }));
            if let Err(e) = page.execute(SetExtraHttpHeadersParams::new(headers)).await {
                debug!(error = %e, "failed to set referer header");
            }
        }

        // Main-document response metadata arrives as a CDP network event.
        let mut response_events = match page.event_listener::<EventResponseReceived>().await {
            Ok(events) => Some(events),
            Err(e) => {
                debug!(error = %e, "response event listener unavailable");
                None
            }
        };

        if options.simulate_human {
            let dwell = HumanBehavior::random_delay(0.5, 1.5);
            tokio::time::sleep(Duration::from_secs_f64(dwell)).await;
        }

        let navigation = timeout(
            Duration::from_secs(self.settings.crawler.page_load_timeout_secs),
            async {
                page.goto(url).await?;
                page.wait_for_navigation().await?;
                Ok::<_, chromiumoxide::error::CdpError>(())
            },
        )
        .await;
        match navigation {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return FetchResult::failure(
                    url,
                    FetchMethod::BrowserHeadful,
                    non_empty_reason("CdpError", &e.to_string()),
                );
            }
            Err(_) => {
                return FetchResult::failure(
                    url,
                    FetchMethod::BrowserHeadful,
                    format!("{}: page load timeout", FetchReason::NetworkError.as_str()),
                );
            }
        }

        // Post-load dwell with human variation
        let dwell = if options.simulate_human {
            HumanBehavior::random_delay(1.0, 2.5)
        } else {
            1.0
        };
        tokio::time::sleep(Duration::from_secs_f64(dwell)).await;

        let (status, resp_headers) = match response_events.as_mut() {
            Some(events) => main_document_response(events, url).await,
            None => (None, Vec::new()),
        };

        let content = match page.content().await {
            Ok(content) => content,
            Err(e) => {
                return FetchResult::failure(
                    url,
                    FetchMethod::BrowserHeadful,
                    non_empty_reason("CdpError", &e.to_string()),
                );
            }
        };
        let content_bytes = content.as_bytes();

        // Challenge handling: queue for a human and hold the page, or fail.
        let header_map: HashMap<String, String> = resp_headers
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.clone()))
            .collect();
        if is_challenge_page(&content, &header_map) {
            let kind = detect_challenge_kind(&content);
            info!(url = %truncate(url), kind = kind.as_str(), "browser challenge detected");

            if options.allow_intervention && options.queue_auth {
                if let Some(task_id) = options.task_id.as_deref() {
                    match self
                        .auth_queue
                        .enqueue(
                            task_id,
                            options.job_id.as_deref(),
                            url,
                            domain,
                            kind,
                            &options.auth_priority,
                        )
                        .await
                    {
                        Ok(queue_id) => {
                            *keep_page_open = true;
                            let mut result = FetchResult::failure(
                                url,
                                FetchMethod::BrowserHeadful,
                                FetchReason::AuthRequired.as_str(),
                            );
                            result.status = status;
                            result.auth_queued = true;
                            result.queue_id = Some(queue_id);
                            result.auth_type = Some(kind.as_str().to_string());
                            result.estimated_effort =
                                Some(kind.estimated_effort().as_str().to_string());
                            return result;
                        }
                        Err(e) => {
                            warn!(error = %format!("{e:#}"), "failed to queue intervention");
                        }
                    }
                }
            }

            let mut result = FetchResult::failure(
                url,
                FetchMethod::BrowserHeadful,
                FetchReason::ChallengeDetected.as_str(),
            );
            result.status = status;
            result.auth_type = Some(kind.as_str().to_string());
            result.estimated_effort = Some(kind.estimated_effort().as_str().to_string());
            return result;
        }

        if options.simulate_human {
            self.human.simulate_reading(page).await;
            self.human.move_mouse_to_interactive_element(page).await;
        }

        // Persist body, archive, optional screenshot
        let (content_hash, html_path) = match self.content_store.put(content_bytes, "html").await {
            Ok(pair) => pair,
            Err(e) => {
                return FetchResult::failure(
                    url,
                    FetchMethod::BrowserHeadful,
                    non_empty_reason("StoreError", &format!("{e:#}")),
                );
            }
        };
        let final_url = page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| url.to_string());
        let status_code = status.unwrap_or(200);

        let archive_dir = self.content_store.root().join("archive");
        let archive_path = write_archive(
            &archive_dir,
            url,
            status_code,
            &[],
            &resp_headers,
            content_bytes,
        )
        .map_err(|e| warn!(error = %format!("{e:#}"), "archive write failed"))
        .ok();

        let screenshot_path = if options.take_screenshot && self.settings.browser.take_screenshots {
            self.save_screenshot(page, &content_hash).await
        } else {
            None
        };

        // Capture the session for HTTP revisits
        let cookies = page
            .get_cookies()
            .await
            .map(|cookies| cookies.iter().map(cookie_from_cdp).collect::<Vec<_>>())
            .unwrap_or_default();
        let user_agent: Option<String> = page
            .evaluate("navigator.userAgent")
            .await
            .ok()
            .and_then(|v| v.into_value().ok());
        if let Some(session_id) = self.sessions.capture(
            &final_url,
            cookies,
            user_agent,
            Some(self.settings.crawler.accept_language.clone()),
            &resp_headers,
        ) {
            debug!(url = %truncate(url), session_id, "captured browser session");
        }

        let header = |name: &str| {
            resp_headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        };

        info!(
            url = %truncate(url),
            status = status_code,
            content_length = content_bytes.len(),
            "browser fetch success"
        );

        let mut result = FetchResult::success(url, FetchMethod::BrowserHeadful, status_code);
        result.final_url = final_url;
        result.content_hash = Some(content_hash);
        result.html_path = Some(html_path.to_string_lossy().into_owned());
        result.archive_path = archive_path.map(|p| p.to_string_lossy().into_owned());
        result.screenshot_path = screenshot_path;
        result.etag = header("etag");
        result.last_modified = header("last-modified");
        result
    }

    async fn save_screenshot(&self, page: &Page, content_hash: &str) -> Option<String> {
        use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
        use chromiumoxide::page::ScreenshotParams;

        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(false)
            .build();
        match page.screenshot(params).await {
            Ok(bytes) => {
                let dir = self.content_store.root().join("screenshots");
                if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                    warn!(error = %e, "screenshot dir create failed");
                    return None;
                }
                let path = dir.join(format!("{content_hash}.png"));
                match tokio::fs::write(&path, bytes).await {
                    Ok(()) => Some(path.to_string_lossy().into_owned()),
                    Err(e) => {
                        warn!(error = %e, "screenshot write failed");
                        None
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, "screenshot capture failed");
                None
            }
        }
    }
}

/// Pull the main-document response (status + headers) out of the network
/// event stream, matching on URL the way the cache validator does.
async fn main_document_response(
    events: &mut chromiumoxide::listeners::EventStream<EventResponseReceived>,
    url: &str,
) -> (Option<u16>, Vec<(String, String)>) {
    let matched = timeout(Duration::from_secs(2), async {
        while let Some(event) = events.next().await {
            if event.r#type != ResourceType::Document {
                continue;
            }
            let response = &event.response;
            if urls_roughly_equal(response.url.as_str(), url) {
                let status = u16::try_from(response.status).ok();
                let headers = response
                    .headers
                    .inner()
                    .as_object()
                    .map(|obj| {
                        obj.iter()
                            .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                            .collect()
                    })
                    .unwrap_or_default();
                return (status, headers);
            }
        }
        (None, Vec::new())
    })
    .await;

    matched.unwrap_or((None, Vec::new()))
}

fn urls_roughly_equal(a: &str, b: &str) -> bool {
    let strip = |u: &str| {
        u.split('#')
            .next()
            .unwrap_or(u)
            .trim_end_matches('/')
            .to_string()
    };
    strip(a) == strip(b)
}

fn cookie_to_param(cookie: &CapturedCookie, fallback_domain: &str) -> Option<CookieParam> {
    let domain = if cookie.domain.is_empty() {
        fallback_domain.to_string()
    } else {
        cookie.domain.clone()
    };
    let mut builder = CookieParam::builder()
        .name(cookie.name.clone())
        .value(cookie.value.clone())
        .domain(domain)
        .path(cookie.path.clone())
        .secure(cookie.secure)
        .http_only(cookie.http_only);
    if let Some(expires) = cookie.expires {
        builder = builder.expires(chromiumoxide::cdp::browser_protocol::network::TimeSinceEpoch::new(expires));
    }
    builder.build().ok()
}

fn cookie_from_cdp(cookie: &chromiumoxide::cdp::browser_protocol::network::Cookie) -> CapturedCookie {
    CapturedCookie {
        name: cookie.name.clone(),
        value: cookie.value.clone(),
        domain: cookie.domain.clone(),
        path: cookie.path.clone(),
        http_only: cookie.http_only,
        secure: cookie.secure,
        same_site: cookie.same_site.as_ref().map(|s| format!("{s:?}")),
        expires: Some(cookie.expires),
    }
}

fn truncate(url: &str) -> &str {
    if url.len() <= 80 {
        url
    } else {
        url.get(..80).unwrap_or(url)
    }
}

impl std::fmt::Debug for BrowserFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserFetcher")
            .field("worker_id", &self.worker_id)
            .field("debug_port", &self.debug_port())
            .finish_non_exhaustive()
    }
}
