//! Tunnel server for h2tunnel.
//!
//! The server owns the public side: it accepts the mutual-TLS tunnel from the
//! client, runs the HTTP/2 *client* role over it, and accepts public proxy
//! connections, opening one POST-carried HTTP/2 stream per proxy connection.
//! A newly authenticated tunnel preempts any prior one (latest wins).

use bytes::Bytes;
use h2::client::SendRequest;
use h2::{Ping, PingPong};
use http::{Method, Request};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bridge::{reset_and_destroy, run_bridge};
use crate::cli::ServerArgs;
use crate::common::format_duration;
use crate::error::{Error, Result};
use crate::supervisor::{EndpointState, Supervisor};
use crate::tls::{build_server_config, load_cert_key};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// The at-most-one live tunnel session.
struct ActiveTunnel {
    id: u64,
    send_request: SendRequest<Bytes>,
    cancel: CancellationToken,
    closed: watch::Receiver<bool>,
}

type ActiveSlot = Arc<Mutex<Option<ActiveTunnel>>>;

/// The public tunnel endpoint.
pub struct TunnelServer {
    args: ServerArgs,
    sup: Arc<Supervisor>,
    tunnel_addr: StdMutex<Option<SocketAddr>>,
    proxy_addr: StdMutex<Option<SocketAddr>>,
}

impl TunnelServer {
    pub fn new(args: ServerArgs) -> Self {
        Self {
            args,
            sup: Arc::new(Supervisor::new("server")),
            tunnel_addr: StdMutex::new(None),
            proxy_addr: StdMutex::new(None),
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

    /// The bound tunnel listener address, available after `start`.
    pub fn tunnel_addr(&self) -> Option<SocketAddr> {
        *self.tunnel_addr.lock().unwrap()
    }

    /// The bound proxy listener address, available after `start`.
    pub fn proxy_addr(&self) -> Option<SocketAddr> {
        *self.proxy_addr.lock().unwrap()
    }

    /// Binds both listeners and starts accepting. Returns an error for
    /// startup failures (bad certificate, address in use); everything after
    /// a successful return is observable only through state and logs.
    pub async fn start(&self) -> Result<()> {
        if self.sup.state() != EndpointState::Stopped {
            return Err(Error::Config("endpoint already started".to_string()));
        }
        let cert_key = load_cert_key(&self.args.crt, &self.args.key)
            .map_err(|e| Error::InvalidCertificate(e.to_string()))?;
        let tls_config =
            build_server_config(&cert_key).map_err(|e| Error::InvalidCertificate(e.to_string()))?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let tunnel_listener = TcpListener::bind(self.args.tunnel_addr())
            .await
            .map_err(|e| Error::ListenFailed(format!("tunnel {}: {}", self.args.tunnel_addr(), e)))?;
        let proxy_listener = TcpListener::bind(self.args.proxy_addr())
            .await
            .map_err(|e| Error::ListenFailed(format!("proxy {}: {}", self.args.proxy_addr(), e)))?;

        *self.tunnel_addr.lock().unwrap() = tunnel_listener.local_addr().ok();
        *self.proxy_addr.lock().unwrap() = proxy_listener.local_addr().ok();

        tracing::debug!(
            fingerprint = %cert_key.fingerprint,
            timeout = %format_duration(self.args.timeout),
            "server configuration loaded"
        );

        let (shutdown, tasks) = self.sup.begin();
        let active: ActiveSlot = Arc::new(Mutex::new(None));

        tasks.spawn(tunnel_accept_loop(
            Arc::clone(&self.sup),
            self.args.timeout,
            acceptor,
            tunnel_listener,
            Arc::clone(&active),
            shutdown.clone(),
            tasks.clone(),
        ));
        tasks.spawn(proxy_accept_loop(
            Arc::clone(&self.sup),
            proxy_listener,
            active,
            shutdown,
            tasks.clone(),
        ));

        self.sup.set_state(EndpointState::Listening);
        Ok(())
    }

    /// Stops the endpoint and waits for every resource to drain. Idempotent.
    pub async fn stop(&self) {
        self.sup.stop().await;
    }
}

async fn tunnel_accept_loop(
    sup: Arc<Supervisor>,
    timeout: Duration,
    acceptor: TlsAcceptor,
    listener: TcpListener,
    active: ActiveSlot,
    shutdown: CancellationToken,
    tasks: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((tcp, remote)) => {
                    tasks.spawn(handle_tunnel(
                        Arc::clone(&sup),
                        timeout,
                        acceptor.clone(),
                        tcp,
                        remote,
                        Arc::clone(&active),
                        shutdown.clone(),
                        tasks.clone(),
                    ));
                }
                Err(error) => {
                    tracing::warn!("tunnel error {error}");
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_tunnel(
    sup: Arc<Supervisor>,
    timeout: Duration,
    acceptor: TlsAcceptor,
    tcp: TcpStream,
    remote: SocketAddr,
    active: ActiveSlot,
    shutdown: CancellationToken,
    tasks: TaskTracker,
) {
    let local = match tcp.local_addr() {
        Ok(addr) => addr,
        Err(_) => return,
    };

    // Handshake and authentication failures drop this connection only; the
    // listener keeps accepting.
    let tls = match tokio::time::timeout(timeout, acceptor.accept(tcp)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(error)) => {
            tracing::warn!("tunnel error {error} (peer {remote})");
            return;
        }
        Err(_) => {
            tracing::warn!("tunnel error handshake timed out (peer {remote})");
            return;
        }
    };

    // Latest wins: destroy any prior tunnel and await its close before
    // installing the new pair.
    let prior = { active.lock().await.take() };
    if let Some(old) = prior {
        old.cancel.cancel();
        let mut closed = old.closed.clone();
        let _ = closed.wait_for(|done| *done).await;
    }

    let (send_request, mut connection) =
        match tokio::time::timeout(timeout, h2::client::handshake(tls)).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(error)) => {
                tracing::warn!("tunnel error {error} (peer {remote})");
                return;
            }
            Err(_) => {
                tracing::warn!("tunnel error HTTP/2 handshake timed out (peer {remote})");
                return;
            }
        };
    let ping_pong = connection.ping_pong();
    tokio::pin!(connection);

    // The session is usable once the send handle reports ready, i.e. the
    // peer's SETTINGS have been exchanged.
    let send_request = tokio::select! {
        ready = send_request.ready() => match ready {
            Ok(send_request) => send_request,
            Err(error) => {
                tracing::warn!("tunnel error {error} (peer {remote})");
                return;
            }
        },
        result = &mut connection => {
            if let Err(error) = result {
                tracing::warn!("tunnel error {error} (peer {remote})");
            }
            return;
        },
        _ = shutdown.cancelled() => return,
    };

    let session_id = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    let session_cancel = shutdown.child_token();
    let (closed_tx, closed_rx) = watch::channel(false);
    {
        let mut slot = active.lock().await;
        if shutdown.is_cancelled() {
            let _ = closed_tx.send(true);
            return;
        }
        // A tunnel that finished handshaking while we did loses to us.
        if let Some(old) = slot.replace(ActiveTunnel {
            id: session_id,
            send_request,
            cancel: session_cancel.clone(),
            closed: closed_rx,
        }) {
            old.cancel.cancel();
        }
    }

    if let Some(ping_pong) = ping_pong {
        tasks.spawn(keepalive_loop(ping_pong, timeout / 2, session_cancel.clone()));
    }

    sup.set_state(EndpointState::Connected);
    tracing::info!("connected to {local} from {remote}");

    let result = tokio::select! {
        result = &mut connection => result,
        _ = session_cancel.cancelled() => Ok(()),
    };

    // Tear down the session: streams first, then the slot, then observers.
    session_cancel.cancel();
    {
        let mut slot = active.lock().await;
        if slot.as_ref().is_some_and(|session| session.id == session_id) {
            slot.take();
        }
    }
    if let Err(error) = result {
        tracing::info!("tunnel error {error}");
    }
    if !shutdown.is_cancelled() {
        sup.set_state(EndpointState::Disconnected);
        sup.set_state(EndpointState::Listening);
    }
    let _ = closed_tx.send(true);
}

/// Keepalive PING at half the idle timeout. Each PING re-arms only after its
/// ack. Errors are ignored; a broken tunnel is detected by the transport.
async fn keepalive_loop(mut ping_pong: PingPong, interval: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = ping_pong.ping(Ping::opaque()) => {
                if result.is_err() {
                    return;
                }
            }
        }
    }
}

async fn proxy_accept_loop(
    sup: Arc<Supervisor>,
    listener: TcpListener,
    active: ActiveSlot,
    shutdown: CancellationToken,
    tasks: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((tcp, peer)) => {
                    let session = {
                        active.lock().await.as_ref().map(|session| {
                            (session.send_request.clone(), session.cancel.clone())
                        })
                    };
                    match session {
                        None => reject(tcp, peer),
                        Some((send_request, session_cancel)) => {
                            let id = sup.next_stream_id();
                            tasks.spawn(serve_proxy_conn(
                                Arc::clone(&sup),
                                id,
                                tcp,
                                peer,
                                send_request,
                                session_cancel,
                            ));
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!("proxy error {error}");
                }
            }
        }
    }
}

/// Destroys a proxy connection that cannot be bridged (RST, not FIN).
fn reject(tcp: TcpStream, peer: SocketAddr) {
    tracing::info!("rejecting connection from {peer}");
    reset_and_destroy(&tcp);
}

/// The HTTP/2 stream carrier: a POST with no path, authority, or body
/// semantics.
fn carrier_request() -> Request<()> {
    Request::builder()
        .method(Method::POST)
        .uri("http://h2tunnel/")
        .body(())
        .expect("carrier request is statically valid")
}

async fn serve_proxy_conn(
    sup: Arc<Supervisor>,
    id: u64,
    tcp: TcpStream,
    peer: SocketAddr,
    send_request: SendRequest<Bytes>,
    cancel: CancellationToken,
) {
    let mut send_request = tokio::select! {
        _ = cancel.cancelled() => {
            reject(tcp, peer);
            return;
        }
        ready = send_request.ready() => match ready {
            Ok(send_request) => send_request,
            Err(_) => {
                // The session died under us; same outcome as no session at all.
                reject(tcp, peer);
                return;
            }
        }
    };

    let (response, send) = match send_request.send_request(carrier_request(), false) {
        Ok(pair) => pair,
        Err(_) => {
            reject(tcp, peer);
            return;
        }
    };
    tracing::info!("stream{id} forwarded from {peer}");

    // The client answers 200 once the origin dial succeeds, or resets the
    // stream when it does not.
    let recv = tokio::select! {
        _ = cancel.cancelled() => {
            reset_and_destroy(&tcp);
            return;
        }
        result = response => match result {
            Ok(response) => response.into_body(),
            Err(error) => {
                tracing::info!("stream{id} error {error}");
                reset_and_destroy(&tcp);
                return;
            }
        }
    };

    run_bridge(sup, id, tcp, send, recv, cancel).await;
}
