//! Common types and functions shared across the client and server modules.

use crate::error::{Error, Result};
use rustls::pki_types::ServerName;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Buffer size for reading data from TCP sockets.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Resolves a host and port to the first usable socket address.
///
/// IP literals short-circuit; hostnames go through hickory-resolver. At most
/// two names are resolved per dial attempt (tunnel and origin), so a resolver
/// is built per call rather than cached.
pub async fn resolve_host(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let resolver = hickory_resolver::Resolver::builder_tokio()
        .map_err(|e| Error::Config(format!("failed to create DNS resolver: {}", e)))?
        .build();

    let lookup = resolver
        .lookup_ip(host)
        .await
        .map_err(|e| Error::Config(format!("failed to resolve '{}': {}", host, e)))?;

    lookup
        .iter()
        .next()
        .map(|ip| SocketAddr::new(ip, port))
        .ok_or_else(|| Error::Config(format!("no addresses found for '{}'", host)))
}

/// Converts a host string into a rustls ServerName.
///
/// The name carries no trust decision (the peer is pinned by certificate
/// equality) but rustls still requires one for the handshake.
pub fn resolve_server_name(host: &str) -> Result<ServerName<'static>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }

    ServerName::try_from(host.to_owned())
        .map_err(|e| Error::Config(format!("invalid tunnel host '{}': {}", host, e)))
}

/// Renders a duration compactly for configuration log lines.
///
/// Sub-second values render as milliseconds, everything else as `1h30m10s`
/// with zero components omitted.
pub fn format_duration(d: Duration) -> String {
    if d < Duration::from_secs(1) {
        return format!("{}ms", d.as_millis());
    }

    let total = d.as_secs();
    let hours = total / 3600;
    let mins = (total % 3600) / 60;
    let secs = total % 60;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if mins > 0 {
        out.push_str(&format!("{mins}m"));
    }
    if secs > 0 || out.is_empty() {
        out.push_str(&format!("{secs}s"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration_seconds() {
        assert_eq!(format_duration(Duration::from_secs(10)), "10s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
    }

    #[test]
    fn test_format_duration_sub_second() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::ZERO), "0ms");
    }

    #[test]
    fn test_format_duration_omits_zero_components() {
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h");
        assert_eq!(
            format_duration(Duration::from_secs(3600 + 1800 + 10)),
            "1h30m10s"
        );
        assert_eq!(format_duration(Duration::from_secs(3605)), "1h5s");
    }

    #[test]
    fn test_resolve_server_name_ip() {
        let name = resolve_server_name("127.0.0.1").unwrap();
        assert!(matches!(name, ServerName::IpAddress(_)));
    }

    #[test]
    fn test_resolve_server_name_hostname() {
        let name = resolve_server_name("tunnel.example.com").unwrap();
        assert!(matches!(name, ServerName::DnsName(_)));
    }

    #[test]
    fn test_resolve_server_name_invalid() {
        assert!(resolve_server_name("bad host").is_err());
    }

    #[tokio::test]
    async fn test_resolve_host_ip_literal() {
        let addr = resolve_host("127.0.0.1", 8080).await.unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_host_ipv6_literal() {
        let addr = resolve_host("::1", 8080).await.unwrap();
        assert_eq!(addr, "[::1]:8080".parse().unwrap());
    }
}
