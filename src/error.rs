//! Error taxonomy for fetch, scheduling, and policy failures.
//!
//! Reasons that end up in job rows and fetch results are a closed set of
//! strings; new failure modes are added by extending the enum and its
//! string table together rather than by free-form messages.

use std::fmt;

/// Top-level error type for Lancet operations.
#[derive(Debug, thiserror::Error)]
pub enum LancetError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("browser error: {0}")]
    Browser(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for LancetError {
    fn from(err: anyhow::Error) -> Self {
        // {:#} preserves the full context chain
        Self::Other(format!("{err:#}"))
    }
}

/// Convenience alias for Result with [`LancetError`].
pub type LancetResult<T> = Result<T, LancetError>;

/// Closed set of machine-readable failure reasons surfaced through job rows
/// and fetch results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchReason {
    BudgetPageLimit,
    BudgetTimeLimit,
    BudgetLlmRatio,
    ExclusiveSlotBusy,
    ChallengeDetected,
    AuthRequired,
    CdpUnreachable,
    DnsLeak,
    DomainMismatch,
    SessionTtlExpired,
    NetworkError,
    Cancelled,
    ServerRestartReset,
    ChallengeBypassTimeout,
}

impl FetchReason {
    /// Wire string for this reason.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::BudgetPageLimit => "budget_page_limit",
            Self::BudgetTimeLimit => "budget_time_limit",
            Self::BudgetLlmRatio => "budget_llm_ratio",
            Self::ExclusiveSlotBusy => "exclusive_slot_busy",
            Self::ChallengeDetected => "challenge_detected",
            Self::AuthRequired => "auth_required",
            Self::CdpUnreachable => "cdp_unreachable",
            Self::DnsLeak => "dns_leak",
            Self::DomainMismatch => "domain_mismatch",
            Self::SessionTtlExpired => "session_ttl_expired",
            Self::NetworkError => "network_error",
            Self::Cancelled => "cancelled",
            Self::ServerRestartReset => "server_restart_reset",
            Self::ChallengeBypassTimeout => "challenge_bypass_timeout",
        }
    }
}

impl fmt::Display for FetchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render an error for persistence, embedding the concrete type name and
/// guaranteeing a non-empty message.
///
/// A bare error with an empty `Display` is rewritten to
/// `"<TypeName>: (no message)"` so job rows never carry an empty reason.
#[must_use]
pub fn error_reason<E: std::error::Error>(err: &E) -> String {
    let type_name = std::any::type_name::<E>()
        .rsplit("::")
        .next()
        .unwrap_or("Error");
    let msg = err.to_string();
    if msg.trim().is_empty() {
        format!("{type_name}: (no message)")
    } else {
        format!("{type_name}: {msg}")
    }
}

/// Same guarantee as [`error_reason`] for pre-rendered messages.
#[must_use]
pub fn non_empty_reason(type_name: &str, msg: &str) -> String {
    if msg.trim().is_empty() {
        format!("{type_name}: (no message)")
    } else {
        msg.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Silent;

    impl fmt::Display for Silent {
        fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
            Ok(())
        }
    }

    impl std::error::Error for Silent {}

    #[test]
    fn empty_message_is_rewritten() {
        assert_eq!(error_reason(&Silent), "Silent: (no message)");
    }

    #[test]
    fn message_is_preserved() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(error_reason(&err), "Error: boom");
    }

    #[test]
    fn reason_strings_are_stable() {
        assert_eq!(FetchReason::ChallengeDetected.as_str(), "challenge_detected");
        assert_eq!(FetchReason::ServerRestartReset.as_str(), "server_restart_reset");
        assert_eq!(FetchReason::DomainMismatch.as_str(), "domain_mismatch");
    }
}
