//! Shared URL and domain helpers.

pub mod domain;

pub use domain::{extract_host, is_same_origin, registrable_domain};
