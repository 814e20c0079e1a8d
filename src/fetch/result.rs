//! Fetch result shape shared by the HTTP and browser paths.

use serde::{Deserialize, Serialize};

/// Which path produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMethod {
    HttpClient,
    BrowserHeadful,
}

/// Result of a fetch operation, carrying cache, auth-queue and connection
/// detail alongside the payload locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResult {
    pub ok: bool,
    pub url: String,
    /// URL after redirects; equals `url` when no redirect occurred.
    pub final_url: String,
    pub status: Option<u16>,
    pub method: FetchMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub html_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,

    pub from_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,

    // Authentication queue detail (set when a challenge was queued)
    pub auth_queued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_effort: Option<String>,

    // Dual-stack connection detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_family: Option<String>,
    pub ip_switched: bool,
}

impl FetchResult {
    /// A failed result with a reason, everything else empty.
    #[must_use]
    pub fn failure(url: impl Into<String>, method: FetchMethod, reason: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            ok: false,
            final_url: url.clone(),
            url,
            status: None,
            method,
            reason: Some(reason.into()),
            html_path: None,
            archive_path: None,
            screenshot_path: None,
            content_hash: None,
            from_cache: false,
            etag: None,
            last_modified: None,
            auth_queued: false,
            queue_id: None,
            auth_type: None,
            estimated_effort: None,
            ip_family: None,
            ip_switched: false,
        }
    }

    /// A bare success scaffold the fetchers fill in.
    #[must_use]
    pub fn success(url: impl Into<String>, method: FetchMethod, status: u16) -> Self {
        let url = url.into();
        Self {
            ok: true,
            final_url: url.clone(),
            url,
            status: Some(status),
            method,
            reason: None,
            html_path: None,
            archive_path: None,
            screenshot_path: None,
            content_hash: None,
            from_cache: false,
            etag: None,
            last_modified: None,
            auth_queued: false,
            queue_id: None,
            auth_type: None,
            estimated_effort: None,
            ip_family: None,
            ip_switched: false,
        }
    }
}
