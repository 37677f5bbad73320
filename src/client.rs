//! Tunnel client for h2tunnel.
//!
//! The client owns the origin side: it dials the tunnel server with mutual
//! TLS, runs the HTTP/2 *server* role over it, and dials the loopback origin
//! service once per accepted stream. A lost tunnel is redialed after
//! `restart_timeout` for as long as the endpoint is not aborted.

use bytes::Bytes;
use h2::server::SendResponse;
use h2::{Ping, PingPong, Reason, RecvStream};
use http::{Method, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bridge::run_bridge;
use crate::cli::ClientArgs;
use crate::common::{format_duration, resolve_host, resolve_server_name};
use crate::error::{Error, Result};
use crate::supervisor::{EndpointState, Supervisor};
use crate::tls::{build_client_config, load_cert_key};

/// The origin-side tunnel endpoint.
pub struct TunnelClient {
    args: Arc<ClientArgs>,
    sup: Arc<Supervisor>,
}

impl TunnelClient {
    pub fn new(args: ClientArgs) -> Self {
        Self {
            args: Arc::new(args),
            sup: Arc::new(Supervisor::new("client")),
        }
    }

    /// Returns the endpoint supervisor.
    pub fn supervisor(&self) -> Arc<Supervisor> {
        Arc::clone(&self.sup)
    }

    /// Returns the current endpoint state.
    pub fn state(&self) -> EndpointState {
        self.sup.state()
    }

    /// Waits until the endpoint reaches the given state.
    pub async fn wait_until(&self, state: EndpointState) {
        self.sup.wait_until(state).await
    }

    /// Starts the dial/serve/redial loop. Returns an error only for startup
    /// failures (bad certificate, invalid tunnel host); connection failures
    /// after a successful return feed the reconnect path instead.
    pub async fn start(&self) -> Result<()> {
        if self.sup.state() != EndpointState::Stopped {
            return Err(Error::Config("endpoint already started".to_string()));
        }
        let cert_key = load_cert_key(&self.args.crt, &self.args.key)
            .map_err(|e| Error::InvalidCertificate(e.to_string()))?;
        let tls_config =
            build_client_config(&cert_key).map_err(|e| Error::InvalidCertificate(e.to_string()))?;
        let connector = TlsConnector::from(Arc::new(tls_config));

        // Fail fast on a host rustls cannot name at all.
        resolve_server_name(&self.args.tunnel_host)?;

        tracing::debug!(
            fingerprint = %cert_key.fingerprint,
            timeout = %format_duration(self.args.timeout),
            restart_timeout = %format_duration(self.args.restart_timeout),
            "client configuration loaded"
        );

        let (shutdown, tasks) = self.sup.begin();
        tasks.spawn(run_client_loop(
            Arc::clone(&self.sup),
            Arc::clone(&self.args),
            connector,
            shutdown,
            tasks.clone(),
        ));
        Ok(())
    }

    /// Stops the endpoint and waits for every resource to drain. Idempotent.
    /// While stopped, no reconnect is scheduled.
    pub async fn stop(&self) {
        self.sup.stop().await;
    }
}

async fn run_client_loop(
    sup: Arc<Supervisor>,
    args: Arc<ClientArgs>,
    connector: TlsConnector,
    shutdown: CancellationToken,
    tasks: TaskTracker,
) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        sup.set_state(EndpointState::Connecting);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = run_tunnel_once(&sup, &args, &connector, &shutdown, &tasks) => {
                if let Err(error) = result {
                    tracing::info!("tunnel error {error}");
                }
            }
        }
        if shutdown.is_cancelled() {
            break;
        }
        sup.set_state(EndpointState::Disconnected);
        tracing::info!("restarting");
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(args.restart_timeout) => {}
        }
    }
}

/// Dials the tunnel once and serves the session until it ends.
async fn run_tunnel_once(
    sup: &Arc<Supervisor>,
    args: &ClientArgs,
    connector: &TlsConnector,
    shutdown: &CancellationToken,
    tasks: &TaskTracker,
) -> Result<()> {
    let tunnel_addr = resolve_host(&args.tunnel_host, args.tunnel_port).await?;
    let server_name = resolve_server_name(&args.tunnel_host)?;

    let tcp = tokio::time::timeout(args.timeout, TcpStream::connect(tunnel_addr))
        .await
        .map_err(|_| Error::TunnelConnectFailed(format!("connect to {tunnel_addr} timed out")))?
        .map_err(|e| Error::TunnelConnectFailed(e.to_string()))?;
    let local = tcp.local_addr().map_err(Error::Io)?;

    let tls = tokio::time::timeout(args.timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| Error::TunnelConnectFailed("TLS handshake timed out".to_string()))?
        .map_err(|e| Error::TunnelConnectFailed(e.to_string()))?;

    // Completion of the server-role handshake means the peer's preface and
    // SETTINGS have arrived.
    let mut connection = tokio::time::timeout(args.timeout, h2::server::handshake(tls))
        .await
        .map_err(|_| Error::TunnelConnectFailed("HTTP/2 handshake timed out".to_string()))?
        .map_err(|e| Error::TunnelConnectFailed(e.to_string()))?;

    let session_cancel = shutdown.child_token();
    if let Some(ping_pong) = connection.ping_pong() {
        tasks.spawn(keepalive_loop(
            ping_pong,
            args.timeout,
            session_cancel.clone(),
        ));
    }

    let origin = resolve_host(&args.origin_host, args.origin_port).await?;
    sup.set_state(EndpointState::Connected);
    tracing::info!("connected to {tunnel_addr} from {local}");

    loop {
        tokio::select! {
            _ = session_cancel.cancelled() => break,
            accepted = connection.accept() => match accepted {
                Some(Ok((request, respond))) => {
                    let id = sup.next_stream_id();
                    tasks.spawn(serve_stream(
                        Arc::clone(sup),
                        id,
                        request,
                        respond,
                        origin,
                        session_cancel.clone(),
                    ));
                }
                Some(Err(error)) => {
                    session_cancel.cancel();
                    return Err(Error::TunnelConnectFailed(error.to_string()));
                }
                None => break,
            }
        }
    }
    session_cancel.cancel();
    Ok(())
}

/// Keepalive PING at half the idle timeout, re-armed only after its ack.
/// A missing ack within the idle timeout destroys the session; the reconnect
/// loop takes it from there.
async fn keepalive_loop(mut ping_pong: PingPong, idle_timeout: Duration, cancel: CancellationToken) {
    let interval = idle_timeout / 2;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        match tokio::time::timeout(idle_timeout, ping_pong.ping(Ping::opaque())).await {
            Ok(Ok(_pong)) => {}
            _ => {
                cancel.cancel();
                return;
            }
        }
    }
}

/// Serves one accepted HTTP/2 stream: dial the origin, answer 200, bridge.
async fn serve_stream(
    sup: Arc<Supervisor>,
    id: u64,
    request: http::Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    origin: SocketAddr,
    cancel: CancellationToken,
) {
    let (parts, recv) = request.into_parts();
    if parts.method != Method::POST {
        tracing::info!("stream{id} error unexpected method {}", parts.method);
        respond.send_reset(Reason::REFUSED_STREAM);
        return;
    }

    let tcp = tokio::select! {
        _ = cancel.cancelled() => {
            respond.send_reset(Reason::CANCEL);
            return;
        }
        result = TcpStream::connect(origin) => match result {
            Ok(tcp) => tcp,
            Err(error) => {
                tracing::info!("stream{id} error {error}");
                respond.send_reset(Reason::CANCEL);
                return;
            }
        }
    };
    tracing::info!("stream{id} forwarding to {origin}");

    let response = Response::builder()
        .status(StatusCode::OK)
        .body(())
        .expect("carrier response is statically valid");
    let send = match respond.send_response(response, false) {
        Ok(send) => send,
        Err(error) => {
            tracing::info!("stream{id} error {error}");
            return;
        }
    };

    run_bridge(sup, id, tcp, send, recv, cancel).await;
}
