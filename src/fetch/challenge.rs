//! Challenge and CAPTCHA page classification.
//!
//! Pattern lists are deliberately specific: cookie-consent banners that
//! mention CAPTCHA vendors, articles about bot detection, and third-party
//! script URLs must not trip the detector. Only markers of an ACTIVE
//! challenge count. Kinds and their patterns live in static tables; a new
//! challenge family is added by extending the enum and its tables together.

use std::collections::HashMap;

/// Challenge families this core recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeKind {
    Turnstile,
    Hcaptcha,
    Recaptcha,
    /// Generic sitekey widget whose vendor could not be identified.
    Captcha,
    Cloudflare,
    JsChallenge,
    Login,
}

impl ChallengeKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Turnstile => "turnstile",
            Self::Hcaptcha => "hcaptcha",
            Self::Recaptcha => "recaptcha",
            Self::Captcha => "captcha",
            Self::Cloudflare => "cloudflare",
            Self::JsChallenge => "js_challenge",
            Self::Login => "login",
        }
    }

    /// Estimated human effort to clear this challenge.
    #[must_use]
    pub const fn estimated_effort(self) -> AuthEffort {
        match self {
            // basic Cloudflare interstitials often auto-resolve
            Self::JsChallenge | Self::Cloudflare => AuthEffort::Low,
            // usually a single checkbox
            Self::Turnstile => AuthEffort::Medium,
            Self::Captcha | Self::Recaptcha | Self::Hcaptcha | Self::Login => AuthEffort::High,
        }
    }
}

/// Human-effort estimate attached to queued interventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEffort {
    Low,
    Medium,
    High,
}

impl AuthEffort {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Markers of an active Cloudflare browser-verification page.
const CLOUDFLARE_CHALLENGE_MARKERS: &[&str] = &[
    "cf-browser-verification",
    "_cf_chl_opt",
    "checking your browser before accessing",
    "please wait while we verify your browser",
    "ray id:</strong>",
];

/// Markers of an active CAPTCHA widget (not a mere reference).
const ACTIVE_CAPTCHA_MARKERS: &[&str] = &[
    "src=\"https://hcaptcha.com",
    "src=\"https://www.hcaptcha.com",
    "data-sitekey=",
    "class=\"h-captcha\"",
    "class=\"g-recaptcha\"",
    "id=\"captcha-container\"",
    "grecaptcha.execute",
    "hcaptcha.execute",
];

/// Cloudflare Turnstile markers.
const TURNSTILE_MARKERS: &[&str] = &[
    "class=\"cf-turnstile\"",
    "challenges.cloudflare.com/turnstile",
];

/// Classify whether a response body is a challenge page.
///
/// `headers` should be lowercased-key response headers; only `server` and
/// `cf-ray` are consulted, for the small-page Cloudflare heuristic.
#[must_use]
pub fn is_challenge_page(content: &str, headers: &HashMap<String, String>) -> bool {
    let body = content.to_lowercase();

    if CLOUDFLARE_CHALLENGE_MARKERS.iter().any(|m| body.contains(m)) {
        return true;
    }

    // "Just a moment" is the Cloudflare challenge page title, but only in
    // combination with a Cloudflare marker
    if body.contains("just a moment") && (body.contains("cloudflare") || body.contains("_cf_")) {
        return true;
    }

    if ACTIVE_CAPTCHA_MARKERS.iter().any(|m| body.contains(m)) {
        return true;
    }

    if TURNSTILE_MARKERS.iter().any(|m| body.contains(m)) {
        return true;
    }

    // Tiny Cloudflare-served pages with a ray header and almost no structure
    // are challenge interstitials even without the text markers.
    let server = headers.get("server").map(|s| s.to_lowercase()).unwrap_or_default();
    if server.contains("cloudflare")
        && headers.contains_key("cf-ray")
        && content.len() < 5000
        && body.contains("<body")
        && body.matches("<div").count() < 10
    {
        return true;
    }

    false
}

/// Identify the challenge family. Call only after [`is_challenge_page`]
/// returned true; an unidentified challenge defaults to `Cloudflare`.
#[must_use]
pub fn detect_challenge_kind(content: &str) -> ChallengeKind {
    let body = content.to_lowercase();

    if TURNSTILE_MARKERS.iter().any(|m| body.contains(m)) {
        return ChallengeKind::Turnstile;
    }
    if body.contains("src=\"https://hcaptcha.com") || body.contains("class=\"h-captcha\"") {
        return ChallengeKind::Hcaptcha;
    }
    if body.contains("class=\"g-recaptcha\"") || body.contains("grecaptcha.execute") {
        return ChallengeKind::Recaptcha;
    }
    if body.contains("data-sitekey=") {
        if body.contains("hcaptcha") {
            return ChallengeKind::Hcaptcha;
        }
        if body.contains("recaptcha") {
            return ChallengeKind::Recaptcha;
        }
        return ChallengeKind::Captcha;
    }
    if CLOUDFLARE_CHALLENGE_MARKERS[..3].iter().any(|m| body.contains(m)) {
        return ChallengeKind::Cloudflare;
    }
    if body.contains("just a moment") && body.contains("cloudflare") {
        return ChallengeKind::JsChallenge;
    }

    ChallengeKind::Cloudflare
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_headers() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn ordinary_page_is_not_a_challenge() {
        let html = r#"<html><body><h1>CAPTCHA history</h1>
            <p>This article explains how Cloudflare and reCAPTCHA work.</p>
            <div>cookie consent: we use hcaptcha on our login page</div>
            </body></html>"#;
        assert!(!is_challenge_page(html, &no_headers()));
    }

    #[test]
    fn cloudflare_interstitial_detected() {
        let html = r#"<html><head><title>Just a moment...</title></head>
            <body><div id="cf-browser-verification">Checking your browser before accessing</div>
            </body></html>"#;
        assert!(is_challenge_page(html, &no_headers()));
        assert_eq!(detect_challenge_kind(html), ChallengeKind::Cloudflare);
    }

    #[test]
    fn turnstile_widget_detected() {
        let html = r#"<div class="cf-turnstile" data-sitekey="0x4AAA"></div>"#;
        assert!(is_challenge_page(html, &no_headers()));
        assert_eq!(detect_challenge_kind(html), ChallengeKind::Turnstile);
        assert_eq!(
            detect_challenge_kind(html).estimated_effort(),
            AuthEffort::Medium
        );
    }

    #[test]
    fn hcaptcha_widget_detected() {
        let html = r#"<iframe src="https://hcaptcha.com/challenge"></iframe>"#;
        assert!(is_challenge_page(html, &no_headers()));
        assert_eq!(detect_challenge_kind(html), ChallengeKind::Hcaptcha);
        assert_eq!(detect_challenge_kind(html).estimated_effort(), AuthEffort::High);
    }

    #[test]
    fn recaptcha_container_detected() {
        let html = r#"<div class="g-recaptcha" data-sitekey="abc"></div>"#;
        assert!(is_challenge_page(html, &no_headers()));
        assert_eq!(detect_challenge_kind(html), ChallengeKind::Recaptcha);
    }

    #[test]
    fn generic_sitekey_falls_back_to_captcha() {
        let html = r#"<div data-sitekey="xyz"></div>"#;
        assert!(is_challenge_page(html, &no_headers()));
        assert_eq!(detect_challenge_kind(html), ChallengeKind::Captcha);
    }

    #[test]
    fn small_cloudflare_page_heuristic() {
        let mut headers = HashMap::new();
        headers.insert("server".to_string(), "cloudflare".to_string());
        headers.insert("cf-ray".to_string(), "8a1b2c3d4e5f".to_string());
        let html = "<html><body><div>wait</div></body></html>";
        assert!(is_challenge_page(html, &headers));

        // same body without the cf-ray header is not a challenge
        headers.remove("cf-ray");
        assert!(!is_challenge_page(html, &headers));
    }
}
