//! Cross-source verification of claims and citation-graph persistence.

pub mod citation_graph;
pub mod cross_verification;

pub use citation_graph::process_citation_graph;
pub use cross_verification::{VerificationSummary, verify_claims_nli};
