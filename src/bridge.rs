//! Per-stream bridging between a TCP socket and an HTTP/2 stream.
//!
//! One bridge owns one `(tcp, h2)` pair for the pair's shared lifetime and
//! preserves TCP close semantics across the tunnel:
//!
//! - clean end of stream (TCP FIN / HTTP/2 END_STREAM) half-closes the far
//!   side; the opposite direction keeps copying until its own end,
//! - an error (TCP RST / HTTP/2 RST_STREAM) forcibly terminates whichever
//!   side is still alive,
//! - backpressure is left to the transports: HTTP/2 sends wait for window
//!   capacity, TCP sends block on the kernel buffer, and the bridge holds no
//!   buffer beyond a single read.

use bytes::Bytes;
use h2::{Reason, RecvStream, SendStream};
use std::future::poll_fn;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::common::READ_BUFFER_SIZE;
use crate::supervisor::Supervisor;

/// How a single copy direction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirEnd {
    /// Clean end of stream; the far side was half-closed, not destroyed.
    Eof,
    /// The side being read from failed.
    SourceError,
    /// The side being written to failed mid-copy.
    SinkError,
}

impl DirEnd {
    fn failed(&self) -> bool {
        *self != DirEnd::Eof
    }
}

/// Destroys a TCP socket with RST instead of FIN.
pub fn reset_and_destroy(tcp: &TcpStream) {
    let _ = tcp.set_linger(Some(Duration::from_secs(0)));
}

/// Runs a bridge until both directions have ended or one side has failed,
/// then applies the terminal actions of the state table and deregisters the
/// pair.
pub async fn run_bridge(
    sup: Arc<Supervisor>,
    id: u64,
    mut tcp: TcpStream,
    mut send: SendStream<Bytes>,
    mut recv: RecvStream,
    cancel: CancellationToken,
) {
    if !sup.track_stream(id) {
        // Arrived after abort: destroy both sides immediately.
        reset_and_destroy(&tcp);
        send.send_reset(Reason::CANCEL);
        return;
    }

    let mut cancelled = false;
    // Set by whichever direction sees the TCP socket fail. Our own
    // send_reset echoes back as a reset on the h2 receive half, and that
    // echo must not be logged as peer traffic.
    let tcp_errored = AtomicBool::new(false);
    let (tcp_to_h2, h2_to_tcp) = {
        let (mut rd, mut wr) = tcp.split();
        let mut inbound = pin!(copy_tcp_to_h2(id, &mut rd, &mut send, &tcp_errored));
        let mut outbound = pin!(copy_h2_to_tcp(id, &mut recv, &mut wr, &tcp_errored));
        let mut inbound_end: Option<DirEnd> = None;
        let mut outbound_end: Option<DirEnd> = None;
        loop {
            tokio::select! {
                end = &mut inbound, if inbound_end.is_none() => inbound_end = Some(end),
                end = &mut outbound, if outbound_end.is_none() => outbound_end = Some(end),
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
            }
            if inbound_end.is_some_and(|end| end.failed())
                || outbound_end.is_some_and(|end| end.failed())
            {
                break;
            }
            if inbound_end.is_some() && outbound_end.is_some() {
                break;
            }
        }
        (inbound_end, outbound_end)
    };

    let tcp_failed = matches!(tcp_to_h2, Some(DirEnd::SourceError))
        || matches!(h2_to_tcp, Some(DirEnd::SinkError));
    let h2_failed = matches!(tcp_to_h2, Some(DirEnd::SinkError))
        || matches!(h2_to_tcp, Some(DirEnd::SourceError));

    if cancelled || (h2_failed && !tcp_failed) {
        reset_and_destroy(&tcp);
    }
    if cancelled || (tcp_failed && !h2_failed) {
        // The reading direction resets inline on a TCP read error; cover the
        // remaining paths (TCP write failure, cancellation).
        if !matches!(tcp_to_h2, Some(DirEnd::SourceError)) {
            send.send_reset(Reason::CANCEL);
            tracing::info!("stream{id} send RST");
        }
    }
    drop(tcp);

    sup.untrack_stream(id);
    tracing::info!("stream{id} closed");
}

/// Copies TCP payload into HTTP/2 DATA frames ("send" direction).
async fn copy_tcp_to_h2(
    id: u64,
    rd: &mut ReadHalf<'_>,
    send: &mut SendStream<Bytes>,
    tcp_errored: &AtomicBool,
) -> DirEnd {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match rd.read(&mut buf).await {
            Ok(0) => {
                // TCP FIN maps to END_STREAM.
                match send.send_data(Bytes::new(), true) {
                    Ok(()) => {
                        tracing::info!("stream{id} send FIN");
                        return DirEnd::Eof;
                    }
                    Err(_) => return DirEnd::SinkError,
                }
            }
            Ok(n) => {
                tracing::info!("stream{id} send {n}");
                if send_all(send, Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    return DirEnd::SinkError;
                }
            }
            Err(error) => {
                // TCP RST maps to RST_STREAM.
                tcp_errored.store(true, Ordering::Relaxed);
                tracing::info!("stream{id} error {error}");
                send.send_reset(Reason::CANCEL);
                tracing::info!("stream{id} send RST");
                return DirEnd::SourceError;
            }
        }
    }
}

/// Sends a chunk as DATA, waiting for flow-control window as needed.
async fn send_all(send: &mut SendStream<Bytes>, mut chunk: Bytes) -> Result<(), h2::Error> {
    while !chunk.is_empty() {
        send.reserve_capacity(chunk.len());
        match poll_fn(|cx| send.poll_capacity(cx)).await {
            Some(Ok(0)) => continue,
            Some(Ok(granted)) => {
                let n = granted.min(chunk.len());
                send.send_data(chunk.split_to(n), false)?;
            }
            Some(Err(error)) => return Err(error),
            // The stream went away while waiting for window.
            None => return Err(h2::Error::from(Reason::CANCEL)),
        }
    }
    Ok(())
}

/// Copies HTTP/2 DATA frames into the TCP socket ("recv" direction).
async fn copy_h2_to_tcp(
    id: u64,
    recv: &mut RecvStream,
    wr: &mut WriteHalf<'_>,
    tcp_errored: &AtomicBool,
) -> DirEnd {
    while let Some(data) = recv.data().await {
        match data {
            Ok(chunk) => {
                let n = chunk.len();
                if wr.write_all(&chunk).await.is_err() {
                    tcp_errored.store(true, Ordering::Relaxed);
                    return DirEnd::SinkError;
                }
                if n > 0 {
                    tracing::info!("stream{id} recv {n}");
                }
                let _ = recv.flow_control().release_capacity(n);
            }
            Err(error) => {
                if error.is_reset() {
                    // A reset the peer sent is logged; the echo of our own
                    // reset after a TCP failure is not.
                    if !tcp_errored.load(Ordering::Relaxed) {
                        tracing::info!("stream{id} recv RST");
                    }
                } else {
                    tracing::info!("stream{id} error {error}");
                }
                return DirEnd::SourceError;
            }
        }
    }
    // END_STREAM maps to FIN: half-close the write direction only. The read
    // direction keeps copying until its own end.
    tracing::info!("stream{id} recv FIN");
    let _ = wr.shutdown().await;
    DirEnd::Eof
}
