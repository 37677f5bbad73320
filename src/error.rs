//! Error types for h2tunnel.

use thiserror::Error;

/// Exit codes for the server and client subcommands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Normal exit
    Success = 0,
    /// Listen failed
    ListenFailed = 10,
    /// Tunnel connection failed
    TunnelConnectFailed = 11,
    /// Certificate loading or validation failed
    InvalidCertificate = 12,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

/// Main error type for h2tunnel.
///
/// Stream- and session-level failures are never surfaced through this type;
/// they are contained to their stream or session and observable only as state
/// transitions and log lines.
#[derive(Debug, Error)]
pub enum Error {
    #[error("listen failed: {0}")]
    ListenFailed(String),

    #[error("tunnel connection failed: {0}")]
    TunnelConnectFailed(String),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns the exit code for this error.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Error::ListenFailed(_) => ExitCode::ListenFailed,
            Error::TunnelConnectFailed(_) => ExitCode::TunnelConnectFailed,
            Error::InvalidCertificate(_) => ExitCode::InvalidCertificate,
            Error::Io(_) => ExitCode::ListenFailed,
            Error::Config(_) => ExitCode::ListenFailed,
        }
    }
}

/// Result type alias for h2tunnel operations.
pub type Result<T> = std::result::Result<T, Error>;
