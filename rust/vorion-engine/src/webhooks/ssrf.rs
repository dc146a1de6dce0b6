//! SSRF guard and DNS pinning for webhook endpoints
//!
//! Registration validates the URL shape, host, port, and every resolved
//! address, then pins the resolved IP on the subscription. Deliveries
//! re-resolve before each attempt and refuse on mismatch (DNS-rebinding
//! defense) unless the tenant explicitly allows DNS changes.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use url::Url;

use crate::error::{EngineError, EngineResult};

/// Hostnames never accepted as webhook targets
const BLOCKED_HOSTS: [&str; 6] = [
    "metadata.google.internal",
    "metadata.goog",
    "kubernetes.default",
    "kubernetes.default.svc",
    "instance-data",
    "169.254.169.254",
];

/// Domain suffixes never accepted
const BLOCKED_SUFFIXES: [&str; 7] = [
    ".internal",
    ".local",
    ".svc",
    ".cluster.local",
    ".localhost",
    ".corp",
    ".lan",
];

/// Ports of common internal services, never accepted
const BLOCKED_PORTS: [u16; 9] = [22, 23, 25, 3306, 5432, 6379, 27017, 9200, 11211];

/// A validated endpoint with its pinned address
#[derive(Debug, Clone)]
pub struct ValidatedEndpoint {
    pub url: Url,
    pub host: String,
    pub port: u16,
    pub pinned_ip: IpAddr,
}

fn validation_error(reason: &str) -> EngineError {
    EngineError::Validation(format!("webhook url rejected: {}", reason))
}

fn is_loopback_host(host: &str) -> bool {
    host == "localhost" || host == "127.0.0.1" || host == "::1"
}

/// Whether an address falls in a private or reserved range
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private_v4(&mapped);
            }
            v6.is_loopback()
                || v6.is_unspecified()
                // Unique-local fc00::/7
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // Link-local fe80::/10
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

fn is_private_v4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || octets[0] == 0
        // Carrier-grade NAT 100.64.0.0/10
        || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
        // Benchmarking 198.18.0.0/15
        || (octets[0] == 198 && (octets[1] & 0xfe) == 18)
}

/// Validate URL shape, scheme, host, and port. Loopback targets pass only
/// outside production.
pub fn validate_url(raw: &str, production: bool) -> EngineResult<Url> {
    let url = Url::parse(raw).map_err(|e| validation_error(&format!("invalid url: {}", e)))?;

    let host = url
        .host_str()
        .ok_or_else(|| validation_error("missing host"))?
        .to_ascii_lowercase();
    let loopback = is_loopback_host(&host);

    match url.scheme() {
        "https" => {}
        "http" if !production && loopback => {}
        "http" => return Err(validation_error("plain http is only allowed for localhost in development")),
        other => return Err(validation_error(&format!("unsupported scheme {}", other))),
    }

    if loopback && production {
        return Err(validation_error("localhost targets are not allowed in production"));
    }

    if BLOCKED_HOSTS.contains(&host.as_str()) {
        return Err(validation_error(&format!("host {} is block-listed", host)));
    }
    if let Some(suffix) = BLOCKED_SUFFIXES.iter().find(|s| host.ends_with(**s)) {
        return Err(validation_error(&format!(
            "host suffix {} is block-listed",
            suffix
        )));
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_ip(&ip) && !(ip.is_loopback() && !production) {
            return Err(validation_error("address is in a private range"));
        }
    }

    let port = url
        .port_or_known_default()
        .ok_or_else(|| validation_error("cannot determine port"))?;
    if BLOCKED_PORTS.contains(&port) {
        return Err(validation_error(&format!("port {} is reserved", port)));
    }

    Ok(url)
}

/// Resolve a host to its addresses
pub async fn resolve_host(host: &str, port: u16) -> EngineResult<Vec<IpAddr>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }
    let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| validation_error(&format!("dns resolution failed for {}: {}", host, e)))?
        .map(|a: SocketAddr| a.ip())
        .collect();
    if addrs.is_empty() {
        return Err(validation_error(&format!("host {} did not resolve", host)));
    }
    Ok(addrs)
}

/// Full registration check: validate the URL, resolve DNS, re-validate every
/// address, and pin the first acceptable one.
pub async fn validate_and_pin(raw: &str, production: bool) -> EngineResult<ValidatedEndpoint> {
    let url = validate_url(raw, production)?;
    let host = url
        .host_str()
        .ok_or_else(|| validation_error("missing host"))?
        .to_ascii_lowercase();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| validation_error("cannot determine port"))?;

    let addrs = resolve_host(&host, port).await?;
    for ip in &addrs {
        if is_private_ip(ip) && !(ip.is_loopback() && !production) {
            return Err(validation_error(&format!(
                "host {} resolves into a private range ({})",
                host, ip
            )));
        }
    }

    Ok(ValidatedEndpoint {
        host,
        port,
        pinned_ip: addrs[0],
        url,
    })
}

/// Re-resolve before a delivery attempt and require the pin to hold
pub async fn verify_pin(
    host: &str,
    port: u16,
    pinned_ip: &IpAddr,
    allow_dns_change: bool,
) -> EngineResult<()> {
    if allow_dns_change {
        return Ok(());
    }
    let addrs = resolve_host(host, port).await?;
    if !addrs.contains(pinned_ip) {
        return Err(EngineError::Validation(format!(
            "dns for {} no longer resolves to pinned address {} (got {:?})",
            host, pinned_ip, addrs
        )));
    }
    Ok(())
}
