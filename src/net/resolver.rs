//! Resolves seed `host:port` pairs to concrete socket addresses.
//!
//! A literal IPv4/IPv6 host resolves synchronously with no DNS round trip;
//! anything else goes through the async resolver on the cluster's runtime.

use std::net::{IpAddr, SocketAddr};
use tracing::debug;

use crate::error::{ClientError, Result};

/// Resolves a single `(host, port)` seed to zero or more addresses.
pub async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let lookup = format!("{host}:{port}");
    debug!(host, port, "resolving seed via DNS");
    let addrs = tokio::net::lookup_host(&lookup)
        .await
        .map_err(ClientError::from)?
        .collect::<Vec<_>>();

    if addrs.is_empty() {
        return Err(ClientError::InvalidParameter(format!(
            "host '{host}' did not resolve to any address"
        )));
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_ipv4_resolves_synchronously_without_lookup() {
        let addrs = resolve("10.0.0.1", 3000).await.unwrap();
        assert_eq!(addrs, vec!["10.0.0.1:3000".parse().unwrap()]);
    }

    #[tokio::test]
    async fn literal_ipv6_resolves() {
        let addrs = resolve("::1", 3000).await.unwrap();
        assert_eq!(addrs, vec!["[::1]:3000".parse().unwrap()]);
    }
}
