//! Network policy core: DNS routing, IPv6 Happy-Eyeballs learning, and
//! navigation-context Sec-Fetch headers.

pub mod dns_policy;
pub mod ipv6;
pub mod sec_fetch;

pub use dns_policy::{DnsLeakType, DnsMetricsSnapshot, DnsPolicyManager, DnsRoute};
pub use ipv6::{AddressFamily, DomainIpv6Stats, Ipv6ConnectionManager, Ipv6Preference};
pub use sec_fetch::{
    NavigationContext, SecFetchDest, SecFetchHeaders, SecFetchMode, SecFetchSite,
    generate_sec_fetch_headers,
};
