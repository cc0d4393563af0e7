//! Finds NAS hosts on a local /24 by probing their web API port.

use futures::{stream, StreamExt};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::{BackupError, Result};

/// Default File Station HTTP port.
pub const DEFAULT_PORT: u16 = 5000;

/// Parses `192.168.1` (or `192.168.1.0`) into its three leading octets.
pub fn parse_prefix(prefix: &str) -> Result<[u8; 3]> {
    let mut parts: Vec<&str> = prefix.trim().trim_end_matches('.').split('.').collect();
    if parts.len() == 4 && parts[3] == "0" {
        parts.pop();
    }
    let octets: Vec<u8> = parts.iter().filter_map(|p| p.parse().ok()).collect();
    match octets.as_slice() {
        [a, b, c] if parts.len() == 3 => Ok([*a, *b, *c]),
        _ => Err(BackupError::Config(format!("not a /24 prefix: {prefix}"))),
    }
}

/// Hosts in `prefix.1..=prefix.254` accepting TCP on `port`, in address order.
pub async fn sweep(prefix: [u8; 3], port: u16, connect_timeout: Duration, concurrency: usize) -> Vec<IpAddr> {
    let [a, b, c] = prefix;
    let mut found: Vec<IpAddr> = stream::iter(1..=254u8)
        .map(|d| {
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port);
            async move {
                match tokio::time::timeout(connect_timeout, tokio::net::TcpStream::connect(addr)).await {
                    Ok(Ok(_)) => Some(addr.ip()),
                    _ => None,
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .filter_map(|hit| async move { hit })
        .collect()
        .await;
    found.sort();
    tracing::debug!("Sweep of {a}.{b}.{c}.0/24:{port} found {} hosts", found.len());
    found
}
