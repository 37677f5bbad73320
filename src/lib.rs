//! h2tunnel - Remote port-forwarding tunnel over mutual TLS and HTTP/2.
//!
//! A single long-lived, mutually-authenticated TLS connection from a client
//! behind NAT to a public server carries many concurrent TCP byte-streams as
//! multiplexed HTTP/2 streams. Inbound connections at the server's public
//! proxy port surface as loopback dials on the client's side, with TCP's
//! FIN/RST distinction and half-close semantics preserved end to end.

pub mod bridge;
pub mod cli;
pub mod client;
pub mod common;
pub mod error;
pub mod server;
pub mod supervisor;
pub mod tls;

pub use cli::{BuildInfo, Cli, ClientArgs, Command, ServerArgs, DEFAULT_TUNNEL_PORT};
pub use client::TunnelClient;
pub use common::{format_duration, resolve_host, resolve_server_name, READ_BUFFER_SIZE};
pub use error::{Error, ExitCode, Result};
pub use server::TunnelServer;
pub use supervisor::{EndpointState, Supervisor};
pub use tls::{
    build_client_config, build_server_config, compute_fingerprint, load_cert_key, CertKeyPair,
    TlsError, TlsResult,
};
