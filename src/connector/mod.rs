//! Target connector
//!
//! Opens outbound sockets on behalf of tunnel streams and relays bytes
//! in both directions. All state mutation is reported back to the owning
//! session through [`TargetEvent`] messages; the connector never touches
//! the stream table itself.
//!
//! Cancellation: the session holds the `data` sender and the `pause`
//! sender for each stream. Dropping them (removing the table entry) ends
//! the relay tasks on their next await, releasing the remote socket.

use crate::protocol::{CloseReason, StreamKind};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

/// Read buffer size for TCP relays
const TCP_READ_BUF: usize = 16384;

/// Maximum UDP datagram size relayed
const UDP_READ_BUF: usize = 65535;

/// Per-stream channel depth between session and target writer
const DATA_CHANNEL_DEPTH: usize = 64;

/// Event reported from a target relay into the owning session
#[derive(Debug)]
pub enum TargetEvent {
    /// Dial succeeded; the stream is live
    Opened { stream_id: u32 },
    /// The remote peer sent bytes
    Data { stream_id: u32, data: Bytes },
    /// The target writer consumed this many queued outbound bytes;
    /// drives window replenishment toward the peer
    Consumed { stream_id: u32, len: usize },
    /// The target side is done (dial failure, EOF, or IO error)
    Closed { stream_id: u32, reason: CloseReason },
}

/// Session-held handles for one stream's relay tasks
pub struct StreamHandles {
    /// Outbound bytes toward the target
    pub data_tx: mpsc::Sender<Bytes>,
    /// Backpressure: `true` pauses reads from the remote socket.
    /// Dropping the sender cancels the relay.
    pub pause_tx: watch::Sender<bool>,
}

/// Spawn the dial-and-relay task for a new stream.
///
/// Failures are reported as [`TargetEvent::Closed`] with a mapped reason
/// code; this function itself never fails.
pub fn spawn_stream(
    stream_id: u32,
    kind: StreamKind,
    addr: String,
    dial_timeout: Duration,
    event_tx: mpsc::Sender<TargetEvent>,
) -> StreamHandles {
    let (data_tx, data_rx) = mpsc::channel(DATA_CHANNEL_DEPTH);
    let (pause_tx, pause_rx) = watch::channel(false);

    tokio::spawn(async move {
        match kind {
            StreamKind::Tcp => {
                run_tcp(stream_id, addr, dial_timeout, data_rx, pause_rx, event_tx).await
            }
            StreamKind::Udp => {
                run_udp(stream_id, addr, dial_timeout, data_rx, pause_rx, event_tx).await
            }
        }
    });

    StreamHandles { data_tx, pause_tx }
}

async fn run_tcp(
    stream_id: u32,
    addr: String,
    dial_timeout: Duration,
    mut data_rx: mpsc::Receiver<Bytes>,
    mut pause_rx: watch::Receiver<bool>,
    event_tx: mpsc::Sender<TargetEvent>,
) {
    let socket = match tokio::time::timeout(dial_timeout, TcpStream::connect(&addr)).await {
        Err(_) => {
            debug!(stream_id, %addr, "dial timed out");
            let _ = event_tx
                .send(TargetEvent::Closed {
                    stream_id,
                    reason: CloseReason::DialTimeout,
                })
                .await;
            return;
        }
        Ok(Err(e)) => {
            debug!(stream_id, %addr, error = %e, "dial failed");
            let _ = event_tx
                .send(TargetEvent::Closed {
                    stream_id,
                    reason: CloseReason::from_dial_error(&e),
                })
                .await;
            return;
        }
        Ok(Ok(s)) => s,
    };

    socket.set_nodelay(true).ok();
    trace!(stream_id, %addr, "tcp target connected");

    if event_tx
        .send(TargetEvent::Opened { stream_id })
        .await
        .is_err()
    {
        return;
    }

    let (mut target_read, mut target_write) = socket.into_split();

    // Writer: drain the session's outbound queue into the socket.
    // Ends when the session drops the data sender.
    let writer_events = event_tx.clone();
    let writer = tokio::spawn(async move {
        while let Some(data) = data_rx.recv().await {
            let len = data.len();
            if target_write.write_all(&data).await.is_err() {
                break;
            }
            if writer_events
                .send(TargetEvent::Consumed { stream_id, len })
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = target_write.shutdown().await;
    });

    // Reader: relay remote bytes up, honoring the pause signal.
    let mut buf = vec![0u8; TCP_READ_BUF];
    let reason = loop {
        // Wait out a pause before issuing the next read
        while *pause_rx.borrow() {
            if pause_rx.changed().await.is_err() {
                // Session dropped the stream; the writer keeps draining
                // queued bytes on its own before shutting the socket down
                return;
            }
        }

        let n = tokio::select! {
            res = target_read.read(&mut buf) => match res {
                Ok(0) => break CloseReason::Voluntary,
                Ok(n) => n,
                Err(e) => {
                    trace!(stream_id, error = %e, "target read error");
                    break CloseReason::NetworkError;
                }
            },
            res = pause_rx.changed() => {
                if res.is_err() {
                    return;
                }
                continue;
            }
        };

        let data = Bytes::copy_from_slice(&buf[..n]);
        if event_tx
            .send(TargetEvent::Data { stream_id, data })
            .await
            .is_err()
        {
            return;
        }
    };

    let _ = event_tx
        .send(TargetEvent::Closed { stream_id, reason })
        .await;
    // Writer keeps draining queued client bytes until the session
    // removes the entry.
    let _ = writer.await;
}

async fn run_udp(
    stream_id: u32,
    addr: String,
    dial_timeout: Duration,
    mut data_rx: mpsc::Receiver<Bytes>,
    mut pause_rx: watch::Receiver<bool>,
    event_tx: mpsc::Sender<TargetEvent>,
) {
    let socket = match associate_udp(&addr, dial_timeout).await {
        Ok(s) => s,
        Err(reason) => {
            debug!(stream_id, %addr, ?reason, "udp associate failed");
            let _ = event_tx
                .send(TargetEvent::Closed { stream_id, reason })
                .await;
            return;
        }
    };

    trace!(stream_id, %addr, "udp target associated");

    if event_tx
        .send(TargetEvent::Opened { stream_id })
        .await
        .is_err()
    {
        return;
    }

    let socket = Arc::new(socket);

    // Writer: each DATA payload becomes one datagram. Ends when the
    // session drops the data sender.
    let send_socket = Arc::clone(&socket);
    let writer_events = event_tx.clone();
    tokio::spawn(async move {
        while let Some(data) = data_rx.recv().await {
            let len = data.len();
            if send_socket.send(&data).await.is_err() {
                break;
            }
            if writer_events
                .send(TargetEvent::Consumed { stream_id, len })
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let mut buf = vec![0u8; UDP_READ_BUF];
    let reason = loop {
        while *pause_rx.borrow() {
            if pause_rx.changed().await.is_err() {
                return;
            }
        }

        let n = tokio::select! {
            res = socket.recv(&mut buf) => match res {
                Ok(n) => n,
                Err(e) => {
                    trace!(stream_id, error = %e, "udp recv error");
                    break CloseReason::NetworkError;
                }
            },
            res = pause_rx.changed() => {
                if res.is_err() {
                    return;
                }
                continue;
            }
        };

        let data = Bytes::copy_from_slice(&buf[..n]);
        if event_tx
            .send(TargetEvent::Data { stream_id, data })
            .await
            .is_err()
        {
            return;
        }
    };

    let _ = event_tx
        .send(TargetEvent::Closed { stream_id, reason })
        .await;
}

/// Resolve and connect a UDP socket, binding to the matching address family
async fn associate_udp(addr: &str, dial_timeout: Duration) -> Result<UdpSocket, CloseReason> {
    let resolved = tokio::time::timeout(dial_timeout, tokio::net::lookup_host(addr))
        .await
        .map_err(|_| CloseReason::DialTimeout)?
        .map_err(|e| CloseReason::from_dial_error(&e))?
        .next()
        .ok_or(CloseReason::HostUnreachable)?;

    let bind_addr = if resolved.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| CloseReason::from_dial_error(&e))?;
    socket
        .connect(resolved)
        .await
        .map_err(|e| CloseReason::from_dial_error(&e))?;
    Ok(socket)
}
