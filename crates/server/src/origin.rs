//! Origin screening for browser connections.
//!
//! The check runs during the HTTP upgrade, before any session state is
//! created, so a disallowed page never reaches the handshake.

use std::net::IpAddr;

use url::Url;

/// How declared browser origins are validated against the request host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginPolicy {
    /// The service lives under a shared parent domain: an origin is
    /// accepted when it shares the host's registrable base domain, so any
    /// sibling subdomain may embed the client.
    SharedDomain,
    /// The service runs on a dedicated hostname: only an origin with
    /// exactly that hostname is accepted.
    CustomDomain,
}

/// Decides whether a declared `Origin` header may open a session against
/// the given `Host` header. Conservative: any parse failure rejects.
pub fn is_origin_allowed(policy: OriginPolicy, origin: &str, host: &str) -> bool {
    let origin_host = match Url::parse(origin) {
        Ok(url) => match url.host_str() {
            Some(h) => unbracket(h).to_ascii_lowercase(),
            None => return false,
        },
        Err(_) => return false,
    };
    let server_host = unbracket(host_without_port(host)).to_ascii_lowercase();
    if server_host.is_empty() {
        return false;
    }

    match policy {
        OriginPolicy::CustomDomain => origin_host == server_host,
        OriginPolicy::SharedDomain => base_domain(&origin_host) == base_domain(&server_host),
    }
}

/// Strips the port from a `Host` header value, handling bracketed IPv6.
fn host_without_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(idx) => &host[..=idx],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((h, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => h,
        _ => host,
    }
}

fn unbracket(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// Last two DNS labels, the registrable part for common hierarchies.
/// IP addresses and single-label hosts compare whole.
fn base_domain(host: &str) -> &str {
    if host.parse::<IpAddr>().is_ok() {
        return host;
    }
    match host.match_indices('.').rev().nth(1) {
        Some((idx, _)) => &host[idx + 1..],
        None => host,
    }
}
