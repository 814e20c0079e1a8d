//! Registrable-domain extraction and origin comparison.
//!
//! Cookie scoping, session transfer, rate limiting and Sec-Fetch-Site
//! computation all key on the registrable domain (public suffix + one
//! label). A flat eTLD list would mis-split `example.co.jp`, so a table of
//! common multi-part suffixes is consulted before falling back to the last
//! two labels.

use url::Url;

/// Multi-part public suffixes that would otherwise be split incorrectly by
/// the naive "last two labels" rule. Not exhaustive — covers the suffixes
/// that show up in research crawling traffic.
const MULTI_PART_SUFFIXES: &[&str] = &[
    "co.jp", "ne.jp", "or.jp", "ac.jp", "go.jp", "ad.jp", "ed.jp", "lg.jp",
    "co.uk", "org.uk", "ac.uk", "gov.uk", "me.uk", "net.uk", "sch.uk",
    "com.au", "net.au", "org.au", "edu.au", "gov.au",
    "co.nz", "net.nz", "org.nz", "ac.nz", "govt.nz",
    "com.br", "net.br", "org.br",
    "co.kr", "or.kr", "ac.kr", "go.kr",
    "com.cn", "net.cn", "org.cn", "edu.cn", "gov.cn",
    "co.in", "net.in", "org.in", "ac.in", "gov.in",
    "com.tw", "org.tw", "edu.tw",
    "com.sg", "edu.sg", "gov.sg",
    "co.za", "org.za", "ac.za",
    "com.mx", "org.mx", "edu.mx",
    "com.ar", "com.tr", "com.hk", "com.my", "co.th", "co.id",
];

/// Extract the lowercased host from a URL string. Accepts bare hosts.
#[must_use]
pub fn extract_host(url: &str) -> Option<String> {
    if let Ok(parsed) = Url::parse(url) {
        return parsed.host_str().map(str::to_lowercase);
    }
    // Bare host or host:port without scheme
    let candidate = url.split(['/', '?', '#']).next().unwrap_or(url);
    let host = candidate.split(':').next().unwrap_or(candidate);
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

/// Compute the registrable domain (public suffix + one label) for a URL or
/// bare host.
///
/// `https://a.b.example.co.jp/x` → `example.co.jp`;
/// `https://sub.example.com` → `example.com`. IP literals and single-label
/// hosts are returned as-is.
#[must_use]
pub fn registrable_domain(url_or_host: &str) -> Option<String> {
    let host = extract_host(url_or_host)?;

    // IP literals have no registrable domain beyond themselves.
    if host.parse::<std::net::IpAddr>().is_ok() {
        return Some(host);
    }

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        return Some(host);
    }

    // Try the longest matching multi-part suffix first.
    for suffix in MULTI_PART_SUFFIXES {
        if host == *suffix {
            return Some(host);
        }
        if let Some(prefix) = host.strip_suffix(&format!(".{suffix}")) {
            let label = prefix.rsplit('.').next().unwrap_or(prefix);
            return Some(format!("{label}.{suffix}"));
        }
    }

    Some(labels[labels.len() - 2..].join("."))
}

/// True when the two URLs share scheme, host, and port.
#[must_use]
pub fn is_same_origin(a: &str, b: &str) -> bool {
    match (Url::parse(a), Url::parse(b)) {
        (Ok(a), Ok(b)) => {
            a.scheme() == b.scheme()
                && a.host_str().map(str::to_lowercase) == b.host_str().map(str::to_lowercase)
                && a.port_or_known_default() == b.port_or_known_default()
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_domains() {
        assert_eq!(
            registrable_domain("https://example.com/path"),
            Some("example.com".to_string())
        );
        assert_eq!(
            registrable_domain("https://sub.example.com"),
            Some("example.com".to_string())
        );
        assert_eq!(
            registrable_domain("example.com"),
            Some("example.com".to_string())
        );
    }

    #[test]
    fn multi_part_suffixes() {
        assert_eq!(
            registrable_domain("https://news.example.co.jp"),
            Some("example.co.jp".to_string())
        );
        assert_eq!(
            registrable_domain("https://a.b.example.co.uk/x?y=1"),
            Some("example.co.uk".to_string())
        );
    }

    #[test]
    fn lookalike_is_not_same_domain() {
        // example.com.evil.com must never collapse to example.com
        assert_eq!(
            registrable_domain("https://example.com.evil.com"),
            Some("evil.com".to_string())
        );
    }

    #[test]
    fn ip_literals() {
        assert_eq!(
            registrable_domain("http://127.0.0.1:8080/x"),
            Some("127.0.0.1".to_string())
        );
    }

    #[test]
    fn same_origin() {
        assert!(is_same_origin("https://example.com/a", "https://example.com/b"));
        assert!(!is_same_origin("https://example.com", "http://example.com"));
        assert!(!is_same_origin("https://example.com", "https://example.com:8443"));
        assert!(!is_same_origin("https://a.example.com", "https://b.example.com"));
    }
}
