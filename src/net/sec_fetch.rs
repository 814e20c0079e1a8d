//! Navigation-context-aware Sec-Fetch-* header generation.
//!
//! The header triple must match what a real browser would send for the same
//! navigation, or the request stands out. Values are the exact lowercase
//! wire strings; `Sec-Fetch-User: ?1` is emitted only for user-initiated
//! navigations.

use crate::utils::domain::{is_same_origin, registrable_domain};

/// Sec-Fetch-Site: relationship between the request initiator and target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecFetchSite {
    /// User-initiated load (address bar, bookmark) — no referer.
    None,
    /// Same scheme + host + port.
    SameOrigin,
    /// Same registrable domain, different origin.
    SameSite,
    /// Different registrable domain.
    CrossSite,
}

impl SecFetchSite {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::SameOrigin => "same-origin",
            Self::SameSite => "same-site",
            Self::CrossSite => "cross-site",
        }
    }
}

/// Sec-Fetch-Mode: the request mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecFetchMode {
    Navigate,
    Cors,
    NoCors,
    SameOrigin,
    Websocket,
}

impl SecFetchMode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Navigate => "navigate",
            Self::Cors => "cors",
            Self::NoCors => "no-cors",
            Self::SameOrigin => "same-origin",
            Self::Websocket => "websocket",
        }
    }
}

/// Sec-Fetch-Dest: the request destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecFetchDest {
    Document,
    Iframe,
    Embed,
    Object,
    Image,
    Script,
    Style,
    Font,
    Audio,
    Video,
    Worker,
    Manifest,
    Empty,
}

impl SecFetchDest {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Iframe => "iframe",
            Self::Embed => "embed",
            Self::Object => "object",
            Self::Image => "image",
            Self::Script => "script",
            Self::Style => "style",
            Self::Font => "font",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Worker => "worker",
            Self::Manifest => "manifest",
            Self::Empty => "empty",
        }
    }

    /// Document-class destinations use `navigate`; everything else is a
    /// subresource fetch (`no-cors`).
    #[must_use]
    pub const fn default_mode(&self) -> SecFetchMode {
        match self {
            Self::Document | Self::Iframe => SecFetchMode::Navigate,
            _ => SecFetchMode::NoCors,
        }
    }
}

/// Context describing one navigation, from which the header triple is
/// derived.
#[derive(Debug, Clone)]
pub struct NavigationContext {
    pub target_url: String,
    pub referer_url: Option<String>,
    pub is_user_initiated: bool,
    pub destination: SecFetchDest,
}

impl NavigationContext {
    /// A user-initiated document navigation, optionally with a referer.
    #[must_use]
    pub fn document(target_url: impl Into<String>, referer_url: Option<String>) -> Self {
        Self {
            target_url: target_url.into(),
            referer_url,
            is_user_initiated: true,
            destination: SecFetchDest::Document,
        }
    }
}

/// The computed Sec-Fetch-* triple (plus the `?1` user flag).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecFetchHeaders {
    pub site: SecFetchSite,
    pub mode: SecFetchMode,
    pub dest: SecFetchDest,
    pub user: bool,
}

impl SecFetchHeaders {
    /// Render as `(name, value)` pairs ready for a request builder.
    #[must_use]
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("Sec-Fetch-Site", self.site.as_str().to_string()),
            ("Sec-Fetch-Mode", self.mode.as_str().to_string()),
            ("Sec-Fetch-Dest", self.dest.as_str().to_string()),
        ];
        if self.user && self.mode == SecFetchMode::Navigate {
            headers.push(("Sec-Fetch-User", "?1".to_string()));
        }
        headers
    }
}

/// Compute the Sec-Fetch header set for a navigation context.
#[must_use]
pub fn generate_sec_fetch_headers(ctx: &NavigationContext) -> SecFetchHeaders {
    let site = match &ctx.referer_url {
        None => SecFetchSite::None,
        Some(referer) => {
            if is_same_origin(&ctx.target_url, referer) {
                SecFetchSite::SameOrigin
            } else {
                let target_rd = registrable_domain(&ctx.target_url);
                let referer_rd = registrable_domain(referer);
                match (target_rd, referer_rd) {
                    (Some(a), Some(b)) if a == b => SecFetchSite::SameSite,
                    _ => SecFetchSite::CrossSite,
                }
            }
        }
    };

    SecFetchHeaders {
        site,
        mode: ctx.destination.default_mode(),
        dest: ctx.destination,
        user: ctx.is_user_initiated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_load_is_none() {
        let headers = generate_sec_fetch_headers(&NavigationContext::document(
            "https://example.com/article",
            None,
        ));
        assert_eq!(headers.site, SecFetchSite::None);
        assert_eq!(headers.mode, SecFetchMode::Navigate);
        assert_eq!(headers.dest, SecFetchDest::Document);
        assert!(headers.to_pairs().iter().any(|(k, v)| *k == "Sec-Fetch-User" && v == "?1"));
    }

    #[test]
    fn serp_to_article_is_cross_site() {
        let headers = generate_sec_fetch_headers(&NavigationContext::document(
            "https://example.com/article",
            Some("https://duckduckgo.com/?q=test".to_string()),
        ));
        assert_eq!(headers.site, SecFetchSite::CrossSite);
        assert_eq!(headers.mode, SecFetchMode::Navigate);
        assert!(headers.user);
    }

    #[test]
    fn subdomain_hop_is_same_site() {
        let headers = generate_sec_fetch_headers(&NavigationContext::document(
            "https://a.example.co.uk/page",
            Some("https://b.example.co.uk/index".to_string()),
        ));
        assert_eq!(headers.site, SecFetchSite::SameSite);
    }

    #[test]
    fn same_origin_beats_same_site() {
        let headers = generate_sec_fetch_headers(&NavigationContext::document(
            "https://example.com/a",
            Some("https://example.com/b".to_string()),
        ));
        assert_eq!(headers.site, SecFetchSite::SameOrigin);
    }

    #[test]
    fn subresource_is_no_cors_without_user_flag() {
        let ctx = NavigationContext {
            target_url: "https://cdn.example.com/img.png".to_string(),
            referer_url: Some("https://example.com/".to_string()),
            is_user_initiated: false,
            destination: SecFetchDest::Image,
        };
        let headers = generate_sec_fetch_headers(&ctx);
        assert_eq!(headers.mode, SecFetchMode::NoCors);
        assert!(!headers.to_pairs().iter().any(|(k, _)| *k == "Sec-Fetch-User"));
    }
}
