/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Address policy for outbound connections: private-range blocking, hidden-service
//! detection, bounded DNS, and the candidate order handed to the HTTP connector.

use crate::error::RequestError;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

pub fn is_private_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private_v4(v4);
            }
            is_private_v6(v6)
        }
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        || o[0] == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (o[0] == 100 && (o[1] & 0xc0) == 64)
        // 240.0.0.0/4 reserved
        || o[0] >= 240
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    let s0 = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        || (s0 & 0xfe00) == 0xfc00
        || (s0 & 0xffc0) == 0xfe80
}

pub fn is_hidden_service_host(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    host.ends_with(".onion") || host.ends_with(".i2p")
}

/// Rejects any candidate in a private range unless the policy allows it.
pub fn check_addresses(host: &str, addrs: &[SocketAddr], allow_private: bool) -> Result<(), RequestError> {
    if allow_private {
        return Ok(());
    }
    if let Some(bad) = addrs.iter().find(|a| is_private_address(a.ip())) {
        return Err(RequestError::HostValidation(format!(
            "{host} resolves to private address {}",
            bad.ip()
        )));
    }
    Ok(())
}

/// Resolves every A/AAAA candidate for `host` within `timeout`, de-duplicated in answer order.
pub async fn resolve_host(host: &str, port: u16, timeout: Duration) -> Result<Vec<SocketAddr>, RequestError> {
    let lookup = tokio::net::lookup_host((host, port));
    let addrs = tokio::time::timeout(timeout, lookup)
        .await
        .map_err(|_| RequestError::Timeout(format!("dns lookup {host}")))?
        .map_err(|e| RequestError::Connect(format!("dns lookup {host}: {e}")))?;
    let mut out: Vec<SocketAddr> = Vec::new();
    for a in addrs {
        if !out.contains(&a) {
            out.push(a);
        }
    }
    if out.is_empty() {
        return Err(RequestError::Connect(format!("no addresses for {host}")));
    }
    Ok(out)
}

pub async fn guarded_lookup(host: &str, port: u16, timeout: Duration, allow_private: bool) -> Result<Vec<SocketAddr>, RequestError> {
    if is_hidden_service_host(host) {
        return Err(RequestError::HostValidation(format!("hidden service host {host}")));
    }
    let addrs = match host.parse::<IpAddr>() {
        Ok(ip) => vec![SocketAddr::new(ip, port)],
        Err(_) => resolve_host(host, port, timeout).await?,
    };
    check_addresses(host, &addrs, allow_private)?;
    Ok(addrs)
}

/// Alternates address families, starting with the first answer's, for the client's
/// happy-eyeballs connector.
pub fn connect_order(addrs: &[SocketAddr]) -> Vec<SocketAddr> {
    let Some(first) = addrs.first() else {
        return Vec::new();
    };
    let (mut preferred, mut fallback): (Vec<SocketAddr>, Vec<SocketAddr>) =
        addrs.iter().partition(|a| a.is_ipv6() == first.is_ipv6());
    preferred.reverse();
    fallback.reverse();
    let mut out = Vec::with_capacity(addrs.len());
    loop {
        match (preferred.pop(), fallback.pop()) {
            (None, None) => break,
            (a, b) => out.extend(a.into_iter().chain(b)),
        }
    }
    out
}

/// DNS resolver for the HTTP client so redirect targets pass the same policy.
#[derive(Clone, Debug)]
pub struct GuardedResolver {
    allow_private: bool,
    timeout: Duration,
}

impl GuardedResolver {
    pub fn new(allow_private: bool, timeout: Duration) -> Self {
        Self { allow_private, timeout }
    }
}

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let this = self.clone();
        Box::pin(async move {
            let addrs = guarded_lookup(name.as_str(), 0, this.timeout, this.allow_private).await?;
            let iter: Addrs = Box::new(addrs.into_iter());
            Ok(iter)
        })
    }
}
