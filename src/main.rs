//! h2tunnel - Remote port-forwarding tunnel over mutual TLS and HTTP/2.

use clap::Parser;
use h2tunnel::{BuildInfo, Cli, ClientArgs, Command, ServerArgs, TunnelClient, TunnelServer};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Initialize the crypto provider
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        tracing::warn!(
            "failed to install default crypto provider (may already be installed): {:?}",
            e
        );
    }

    match cli.command {
        Command::Server(args) => {
            let runtime = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
            if let Err(e) = runtime.block_on(run_server(args)) {
                tracing::error!(error = %e, "server error");
                std::process::exit(i32::from(e.exit_code()));
            }
        }
        Command::Client(args) => {
            let runtime = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
            if let Err(e) = runtime.block_on(run_client(args)) {
                tracing::error!(error = %e, "client error");
                std::process::exit(i32::from(e.exit_code()));
            }
        }
        Command::Version => {
            println!("{}", BuildInfo::get().format());
        }
    }
}

async fn run_server(args: ServerArgs) -> h2tunnel::Result<()> {
    let server = TunnelServer::new(args);
    server.start().await?;
    shutdown_signal().await;
    server.stop().await;
    Ok(())
}

async fn run_client(args: ClientArgs) -> h2tunnel::Result<()> {
    let client = TunnelClient::new(args);
    client.start().await?;
    shutdown_signal().await;
    client.stop().await;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
