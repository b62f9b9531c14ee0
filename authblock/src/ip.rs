//! Effective client IP resolution
//!
//! Only the directly connecting peer is checked against the trusted proxies.
//! When it is trusted, the left-most `X-Forwarded-For` entry is taken as the
//! client address without validating the remaining hops.

use std::collections::HashSet;

/// Header carrying the proxied client address
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Derive the effective client IP
///
/// Returns the first entry of `forwarded_for` when the header is non-empty and
/// `remote_addr` is a trusted proxy, otherwise `remote_addr` unchanged.
pub fn resolve_effective_ip(
    remote_addr: &str,
    forwarded_for: Option<&str>,
    trusted_proxies: &HashSet<String>,
) -> String {
    match forwarded_for {
        Some(header) if !header.is_empty() && trusted_proxies.contains(remote_addr) => {
            first_forwarded(header).to_string()
        }
        _ => remote_addr.to_string(),
    }
}

/// Text before the first comma, trimmed
fn first_forwarded(header: &str) -> &str {
    header.split(',').next().unwrap_or(header).trim()
}
