//! Browser → HTTP-client session transfer.
//!
//! After a successful browser navigation, the context's cookies, UA,
//! Accept-Language and the response's validators are captured under the
//! page's registrable domain. The HTTP fetcher can then revisit the same
//! site cheaply by asking for transfer headers. The hard rule: a session is
//! valid only for URLs whose registrable domain equals the session's —
//! synthesis refuses cross-site requests and never leaks cookies to
//! lookalike hosts (`example.com.evil.com`).

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::FetchReason;
use crate::net::sec_fetch::{NavigationContext, generate_sec_fetch_headers};
use crate::utils::{is_same_origin, registrable_domain};

/// One captured cookie with the flags needed to replay it faithfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub same_site: Option<String>,
    #[serde(default)]
    pub expires: Option<f64>,
}

/// A captured browser session keyed by registrable domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedSession {
    pub session_id: String,
    pub registrable_domain: String,
    pub cookies: Vec<CapturedCookie>,
    pub user_agent: Option<String>,
    pub accept_language: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CapturedSession {
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Render cookies as a single `Cookie` header value.
    #[must_use]
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Header set synthesised for an HTTP revisit, or the refusal reason.
#[derive(Debug, Clone)]
pub struct TransferHeaders {
    pub ok: bool,
    pub reason: Option<FetchReason>,
    pub session_id: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl TransferHeaders {
    fn refused(reason: FetchReason) -> Self {
        Self {
            ok: false,
            reason: Some(reason),
            session_id: None,
            headers: Vec::new(),
        }
    }
}

/// Bounded, domain-keyed session store with synthesis.
pub struct SessionTransferManager {
    settings: Arc<Settings>,
    sessions: RwLock<Vec<CapturedSession>>,
}

impl SessionTransferManager {
    #[must_use]
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            sessions: RwLock::new(Vec::new()),
        }
    }

    /// Store a captured session. Evicts the oldest session (by
    /// `created_at`) once `max_sessions` is reached, and prunes expired
    /// entries on the way.
    pub fn capture(
        &self,
        url: &str,
        cookies: Vec<CapturedCookie>,
        user_agent: Option<String>,
        accept_language: Option<String>,
        response_headers: &[(String, String)],
    ) -> Option<String> {
        let domain = registrable_domain(url)?;

        let header = |name: &str| {
            response_headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        };

        let now = Utc::now();
        let session = CapturedSession {
            session_id: Uuid::new_v4().to_string(),
            registrable_domain: domain.clone(),
            cookies,
            user_agent,
            accept_language,
            etag: header("etag"),
            last_modified: header("last-modified"),
            last_url: Some(url.to_string()),
            created_at: now,
            expires_at: now + Duration::seconds(self.settings.session.ttl_secs as i64),
        };
        let session_id = session.session_id.clone();

        let mut sessions = self.sessions.write();
        sessions.retain(|s| !s.is_expired());
        while sessions.len() >= self.settings.session.max_sessions {
            // oldest created_at goes first
            if let Some((idx, _)) = sessions
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| s.created_at)
            {
                sessions.remove(idx);
            } else {
                break;
            }
        }
        sessions.push(session);

        debug!(domain, session_id, "captured browser session");
        Some(session_id)
    }

    /// Most recent unexpired session for a registrable domain.
    #[must_use]
    pub fn session_for_domain(&self, domain: &str) -> Option<CapturedSession> {
        self.sessions
            .read()
            .iter()
            .filter(|s| s.registrable_domain == domain && !s.is_expired())
            .max_by_key(|s| s.created_at)
            .cloned()
    }

    /// Synthesise transfer headers for a candidate URL.
    ///
    /// `include_conditional` is false when the caller already holds
    /// URL-specific validators — per the precedence rule, those beat any
    /// session-level ETag/Last-Modified.
    #[must_use]
    pub fn transfer_headers(&self, url: &str, include_conditional: bool) -> TransferHeaders {
        let Some(target_domain) = registrable_domain(url) else {
            return TransferHeaders::refused(FetchReason::DomainMismatch);
        };

        let Some(session) = self.session_for_domain(&target_domain) else {
            return TransferHeaders::refused(FetchReason::DomainMismatch);
        };

        // session_for_domain already filtered, but a session can expire
        // between lookup and use
        if session.is_expired() {
            return TransferHeaders::refused(FetchReason::SessionTtlExpired);
        }

        let mut headers: Vec<(String, String)> = Vec::new();

        if let Some(cookie) = session.cookie_header() {
            headers.push(("Cookie".to_string(), cookie));
        }
        if let Some(ua) = &session.user_agent {
            headers.push(("User-Agent".to_string(), ua.clone()));
        }
        if let Some(lang) = &session.accept_language {
            headers.push(("Accept-Language".to_string(), lang.clone()));
        }
        if include_conditional {
            if let Some(etag) = &session.etag {
                headers.push(("If-None-Match".to_string(), etag.clone()));
            }
            if let Some(lm) = &session.last_modified {
                headers.push(("If-Modified-Since".to_string(), lm.clone()));
            }
        }

        // Referer only when the stored last URL shares the target's origin;
        // a fresh Sec-Fetch triple is computed with whatever referer we emit.
        let referer = session
            .last_url
            .as_ref()
            .filter(|last| is_same_origin(last, url))
            .cloned();
        if let Some(ref r) = referer {
            headers.push(("Referer".to_string(), r.clone()));
        }
        let sec_fetch = generate_sec_fetch_headers(&NavigationContext::document(url, referer));
        for (name, value) in sec_fetch.to_pairs() {
            headers.push((name.to_string(), value));
        }

        TransferHeaders {
            ok: true,
            reason: None,
            session_id: Some(session.session_id),
            headers,
        }
    }

    /// Remove every session of a registrable domain. Returns how many were
    /// dropped.
    pub fn invalidate_domain(&self, domain: &str) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|s| s.registrable_domain != domain);
        let removed = before - sessions.len();
        if removed > 0 {
            info!(domain, removed, "invalidated sessions for domain");
        }
        removed
    }

    /// Drop expired sessions. Returns how many were pruned.
    pub fn prune_expired(&self) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|s| !s.is_expired());
        before - sessions.len()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionTransferManager {
        SessionTransferManager::new(Arc::new(Settings::default()))
    }

    fn cookie(name: &str, value: &str) -> CapturedCookie {
        CapturedCookie {
            name: name.to_string(),
            value: value.to_string(),
            domain: ".example.com".to_string(),
            path: "/".to_string(),
            http_only: true,
            secure: true,
            same_site: Some("Lax".to_string()),
            expires: None,
        }
    }

    #[test]
    fn cross_site_synthesis_is_refused() {
        let mgr = manager();
        mgr.capture(
            "https://example.com/page",
            vec![cookie("sid", "secret")],
            Some("UA".to_string()),
            None,
            &[],
        );

        let result = mgr.transfer_headers("https://malicious.com/steal", true);
        assert!(!result.ok);
        assert_eq!(result.reason, Some(FetchReason::DomainMismatch));
        assert!(result.headers.is_empty());
    }

    #[test]
    fn lookalike_domain_gets_no_cookies() {
        let mgr = manager();
        mgr.capture(
            "https://example.com/page",
            vec![cookie("sid", "secret")],
            None,
            None,
            &[],
        );
        let result = mgr.transfer_headers("https://example.com.evil.com/x", true);
        assert!(!result.ok);
        assert!(!result.headers.iter().any(|(k, _)| k == "Cookie"));
    }

    #[test]
    fn same_domain_synthesis_includes_cookies_and_sec_fetch() {
        let mgr = manager();
        mgr.capture(
            "https://example.com/landing",
            vec![cookie("sid", "abc"), cookie("pref", "dark")],
            Some("Mozilla/5.0".to_string()),
            Some("en-US".to_string()),
            &[("ETag".to_string(), "\"v2\"".to_string())],
        );

        let result = mgr.transfer_headers("https://example.com/other", true);
        assert!(result.ok);
        let get = |name: &str| {
            result
                .headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(get("Cookie").as_deref(), Some("sid=abc; pref=dark"));
        assert_eq!(get("User-Agent").as_deref(), Some("Mozilla/5.0"));
        assert_eq!(get("If-None-Match").as_deref(), Some("\"v2\""));
        // same-origin last_url becomes the referer
        assert_eq!(get("Referer").as_deref(), Some("https://example.com/landing"));
        assert_eq!(get("Sec-Fetch-Site").as_deref(), Some("same-origin"));
    }

    #[test]
    fn conditional_headers_suppressed_on_request() {
        let mgr = manager();
        mgr.capture(
            "https://example.com/landing",
            vec![],
            None,
            None,
            &[("ETag".to_string(), "\"v2\"".to_string())],
        );
        let result = mgr.transfer_headers("https://example.com/x", false);
        assert!(result.ok);
        assert!(!result.headers.iter().any(|(k, _)| k == "If-None-Match"));
    }

    #[test]
    fn serde_round_trip_is_identity() {
        let now = Utc::now();
        let session = CapturedSession {
            session_id: "s1".to_string(),
            registrable_domain: "example.co.jp".to_string(),
            cookies: vec![cookie("a", "1")],
            user_agent: Some("UA".to_string()),
            accept_language: None,
            etag: Some("\"e\"".to_string()),
            last_modified: Some("Wed, 21 Oct 2015 07:28:00 GMT".to_string()),
            last_url: Some("https://example.co.jp/".to_string()),
            created_at: now,
            expires_at: now + Duration::seconds(60),
        };
        let json = serde_json::to_string(&session).unwrap();
        let back: CapturedSession = serde_json::from_str(&json).unwrap();
        assert_eq!(session, back);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut settings = Settings::default();
        settings.session.max_sessions = 2;
        let mgr = SessionTransferManager::new(Arc::new(settings));

        mgr.capture("https://one.com/", vec![], None, None, &[]);
        mgr.capture("https://two.com/", vec![], None, None, &[]);
        mgr.capture("https://three.com/", vec![], None, None, &[]);

        assert_eq!(mgr.session_count(), 2);
        // the first capture is the oldest and should be gone
        assert!(mgr.session_for_domain("one.com").is_none());
        assert!(mgr.session_for_domain("three.com").is_some());
    }

    #[test]
    fn domain_invalidation_is_scoped() {
        let mgr = manager();
        mgr.capture("https://a.example.com/", vec![], None, None, &[]);
        mgr.capture("https://b.example.com/", vec![], None, None, &[]);
        mgr.capture("https://other.org/", vec![], None, None, &[]);

        assert_eq!(mgr.invalidate_domain("example.com"), 2);
        assert!(mgr.session_for_domain("other.org").is_some());
    }
}
