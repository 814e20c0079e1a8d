//! Runtime configuration for the Lancet core.
//!
//! Everything is `Default`-complete: a bare `Settings::default()` is a
//! working local configuration. Fields are grouped per subsystem so the
//! subsystems can hold an `Arc<Settings>` and read only their own section.

mod types;

pub use types::{
    BrowserSettings, BudgetSettings, CrawlerSettings, DnsSettings, Ipv6Settings, MlSettings,
    SessionSettings, Settings, StorageSettings, TorSettings, VerificationSettings,
};
