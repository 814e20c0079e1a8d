//! Lancet — research-grade crawling and evidence-gathering core.
//!
//! Four tightly coupled subsystems do the heavy lifting:
//!
//! - **Scheduling** (`scheduler`): a slot-based, priority-driven job
//!   dispatcher whose single source of truth is the jobs table; conditional
//!   SQL updates are the race-safety device, with per-task budgets and
//!   cooperative cancellation layered on top.
//! - **Fetch pipeline** (`fetch`): dual-path retrieval — attached real
//!   browser with human-behaviour simulation and challenge queueing, HTTP
//!   client with captured-session re-use and conditional (304) revisits.
//! - **Network policy** (`net`): Tor-safe DNS routing (`socks5h`
//!   selection + leak accounting), IPv6 Happy-Eyeballs with per-domain
//!   learning, and navigation-correct Sec-Fetch headers.
//! - **Verification** (`verify`): vector recall + NLI over claim/fragment
//!   pairs with origin-domain exclusion and idempotent edge writes.
//!
//! [`Lancet`] wires them together and exposes the orchestrator surface.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod fetch;
pub mod lifecycle;
pub mod ml;
pub mod net;
pub mod scheduler;
pub mod storage;
pub mod utils;
pub mod verify;

pub use api::{Lancet, SubmitTargetResult, Target, TargetKind, TaskStatus};
pub use auth::InterventionQueue;
pub use config::Settings;
pub use error::{FetchReason, LancetError, LancetResult, error_reason};
pub use fetch::{
    BrowserFetcher, CapturedSession, ChallengeKind, DomainRateLimiter, FetchMethod, FetchResult,
    HttpFetcher, HumanBehavior, SessionTransferManager, detect_challenge_kind, is_challenge_page,
};
pub use lifecycle::{LifecycleManager, ResourceKind};
pub use ml::{MlClient, MlClientError, NliPair, NliVerdict};
pub use net::{
    DnsPolicyManager, DnsRoute, Ipv6ConnectionManager, NavigationContext, SecFetchDest,
    SecFetchHeaders, generate_sec_fetch_headers,
};
pub use scheduler::{
    BudgetExceededReason, BudgetManager, JobKind, JobScheduler, JobState, Slot, TargetAction,
    TargetOutcome, TaskEvents, WorkerManager,
};
pub use storage::{ContentStore, persist_embedding, vector_search};
pub use utils::registrable_domain;
pub use verify::{process_citation_graph, verify_claims_nli};
