//! CLI definitions for h2tunnel.

use clap::{builder::PossibleValuesParser, Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Default tunnel port on both endpoints.
pub const DEFAULT_TUNNEL_PORT: u16 = 15900;

/// Default idle/handshake timeout in seconds. The keepalive PING interval is
/// half of this.
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default reconnect delay for the client in seconds.
pub const DEFAULT_RESTART_TIMEOUT_SECS: u64 = 1;

/// Parse a duration from a human-readable string.
fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Remote port-forwarding tunnel over mutual TLS and HTTP/2.
#[derive(Debug, Parser)]
#[command(name = "h2tunnel")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level (debug|info|warn|error)
    #[arg(long, global = true, default_value = "info", value_parser = PossibleValuesParser::new(["debug", "info", "warn", "error"]))]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the public tunnel server
    Server(ServerArgs),

    /// Start the origin-side tunnel client
    Client(ClientArgs),

    /// Show version information
    Version,
}

/// Arguments for the server subcommand.
#[derive(Debug, Parser)]
pub struct ServerArgs {
    /// TLS certificate file path (endpoint identity and pinned peer trust anchor)
    #[arg(long)]
    pub crt: PathBuf,

    /// TLS private key file path
    #[arg(long)]
    pub key: PathBuf,

    /// Address to listen on for the tunnel TLS connection
    #[arg(long, default_value = "::0")]
    pub tunnel_listen_ip: IpAddr,

    /// Port to listen on for the tunnel TLS connection
    #[arg(long, default_value_t = DEFAULT_TUNNEL_PORT)]
    pub tunnel_listen_port: u16,

    /// Address to listen on for public proxy traffic
    #[arg(long, default_value = "::0")]
    pub proxy_listen_ip: IpAddr,

    /// Port to listen on for public proxy traffic
    #[arg(long)]
    pub proxy_listen_port: u16,

    /// Idle/handshake timeout (keepalive PING interval is half of this)
    #[arg(long, value_parser = parse_duration, default_value = "10s")]
    pub timeout: Duration,
}

impl ServerArgs {
    /// Returns the tunnel listener socket address.
    pub fn tunnel_addr(&self) -> SocketAddr {
        SocketAddr::new(self.tunnel_listen_ip, self.tunnel_listen_port)
    }

    /// Returns the proxy listener socket address.
    pub fn proxy_addr(&self) -> SocketAddr {
        SocketAddr::new(self.proxy_listen_ip, self.proxy_listen_port)
    }
}

/// Arguments for the client subcommand.
#[derive(Debug, Parser)]
pub struct ClientArgs {
    /// TLS certificate file path (endpoint identity and pinned peer trust anchor)
    #[arg(long)]
    pub crt: PathBuf,

    /// TLS private key file path
    #[arg(long)]
    pub key: PathBuf,

    /// Tunnel server host
    #[arg(long)]
    pub tunnel_host: String,

    /// Tunnel server port
    #[arg(long, default_value_t = DEFAULT_TUNNEL_PORT)]
    pub tunnel_port: u16,

    /// Origin service host (dialed for every forwarded stream)
    #[arg(long, default_value = "localhost")]
    pub origin_host: String,

    /// Origin service port
    #[arg(long)]
    pub origin_port: u16,

    /// Idle/handshake timeout (keepalive PING interval is half of this)
    #[arg(long, value_parser = parse_duration, default_value = "10s")]
    pub timeout: Duration,

    /// Delay before redialing a lost tunnel
    #[arg(long, value_parser = parse_duration, default_value = "1s")]
    pub restart_timeout: Duration,
}

/// Build information for version command.
pub struct BuildInfo {
    pub version: &'static str,
    pub commit: &'static str,
    pub built: &'static str,
}

impl BuildInfo {
    /// Returns build information from environment variables or defaults.
    pub fn get() -> Self {
        Self {
            version: option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"),
            commit: option_env!("H2TUNNEL_COMMIT").unwrap_or("unknown"),
            built: option_env!("H2TUNNEL_BUILD_DATE").unwrap_or("unknown"),
        }
    }

    /// Format version output.
    pub fn format(&self) -> String {
        format!(
            "h2tunnel version {}\n  commit: {}\n  built:  {}",
            self.version, self.commit, self.built
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_server_minimal() {
        let cli = Cli::try_parse_from([
            "h2tunnel",
            "server",
            "--crt",
            "h2tunnel.crt",
            "--key",
            "h2tunnel.key",
            "--proxy-listen-port",
            "8080",
        ])
        .unwrap();

        assert_eq!(cli.log_level, "info");
        match cli.command {
            Command::Server(args) => {
                assert_eq!(args.crt, PathBuf::from("h2tunnel.crt"));
                assert_eq!(args.key, PathBuf::from("h2tunnel.key"));
                assert_eq!(args.tunnel_listen_ip, "::0".parse::<IpAddr>().unwrap());
                assert_eq!(args.tunnel_listen_port, DEFAULT_TUNNEL_PORT);
                assert_eq!(args.proxy_listen_ip, "::0".parse::<IpAddr>().unwrap());
                assert_eq!(args.proxy_listen_port, 8080);
                assert_eq!(args.timeout, Duration::from_secs(10));
            }
            _ => panic!("Expected Server command"),
        }
    }

    #[test]
    fn test_parse_server_full() {
        let cli = Cli::try_parse_from([
            "h2tunnel",
            "--log-level",
            "debug",
            "server",
            "--crt",
            "/path/to/cert.pem",
            "--key",
            "/path/to/key.pem",
            "--tunnel-listen-ip",
            "127.0.0.1",
            "--tunnel-listen-port",
            "16000",
            "--proxy-listen-ip",
            "0.0.0.0",
            "--proxy-listen-port",
            "443",
            "--timeout",
            "30s",
        ])
        .unwrap();

        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Command::Server(args) => {
                assert_eq!(args.tunnel_addr(), "127.0.0.1:16000".parse().unwrap());
                assert_eq!(args.proxy_addr(), "0.0.0.0:443".parse().unwrap());
                assert_eq!(args.timeout, Duration::from_secs(30));
            }
            _ => panic!("Expected Server command"),
        }
    }

    #[test]
    fn test_parse_client_minimal() {
        let cli = Cli::try_parse_from([
            "h2tunnel",
            "client",
            "--crt",
            "h2tunnel.crt",
            "--key",
            "h2tunnel.key",
            "--tunnel-host",
            "tunnel.example.com",
            "--origin-port",
            "8080",
        ])
        .unwrap();

        match cli.command {
            Command::Client(args) => {
                assert_eq!(args.tunnel_host, "tunnel.example.com");
                assert_eq!(args.tunnel_port, DEFAULT_TUNNEL_PORT);
                assert_eq!(args.origin_host, "localhost");
                assert_eq!(args.origin_port, 8080);
                assert_eq!(args.timeout, Duration::from_secs(10));
                assert_eq!(args.restart_timeout, Duration::from_secs(1));
            }
            _ => panic!("Expected Client command"),
        }
    }

    #[test]
    fn test_parse_client_full() {
        let cli = Cli::try_parse_from([
            "h2tunnel",
            "client",
            "--crt",
            "h2tunnel.crt",
            "--key",
            "h2tunnel.key",
            "--tunnel-host",
            "tunnel.example.com",
            "--tunnel-port",
            "16000",
            "--origin-host",
            "127.0.0.1",
            "--origin-port",
            "22",
            "--timeout",
            "20s",
            "--restart-timeout",
            "5s",
        ])
        .unwrap();

        match cli.command {
            Command::Client(args) => {
                assert_eq!(args.tunnel_port, 16000);
                assert_eq!(args.origin_host, "127.0.0.1");
                assert_eq!(args.origin_port, 22);
                assert_eq!(args.timeout, Duration::from_secs(20));
                assert_eq!(args.restart_timeout, Duration::from_secs(5));
            }
            _ => panic!("Expected Client command"),
        }
    }

    #[test]
    fn test_parse_version() {
        let cli = Cli::try_parse_from(["h2tunnel", "version"]).unwrap();
        assert!(matches!(cli.command, Command::Version));
    }

    #[test]
    fn test_server_missing_required() {
        let result = Cli::try_parse_from([
            "h2tunnel",
            "server",
            "--crt",
            "h2tunnel.crt",
            "--key",
            "h2tunnel.key",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_client_missing_required() {
        let result = Cli::try_parse_from([
            "h2tunnel",
            "client",
            "--crt",
            "h2tunnel.crt",
            "--key",
            "h2tunnel.key",
            "--origin-port",
            "8080",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_flag_missing_value_is_an_error() {
        let result = Cli::try_parse_from([
            "h2tunnel",
            "server",
            "--crt",
            "h2tunnel.crt",
            "--key",
            "h2tunnel.key",
            "--proxy-listen-port",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_duration_parsing() {
        let cli = Cli::try_parse_from([
            "h2tunnel",
            "client",
            "--crt",
            "h2tunnel.crt",
            "--key",
            "h2tunnel.key",
            "--tunnel-host",
            "localhost",
            "--origin-port",
            "8080",
            "--timeout",
            "1m30s",
            "--restart-timeout",
            "500ms",
        ])
        .unwrap();

        match cli.command {
            Command::Client(args) => {
                assert_eq!(args.timeout, Duration::from_secs(90));
                assert_eq!(args.restart_timeout, Duration::from_millis(500));
            }
            _ => panic!("Expected Client command"),
        }
    }

    #[test]
    fn test_build_info_format() {
        let info = BuildInfo {
            version: "1.0.0",
            commit: "abc1234",
            built: "2025-01-01T00:00:00Z",
        };
        let output = info.format();
        assert!(output.contains("h2tunnel version 1.0.0"));
        assert!(output.contains("commit: abc1234"));
        assert!(output.contains("built:  2025-01-01T00:00:00Z"));
    }
}
