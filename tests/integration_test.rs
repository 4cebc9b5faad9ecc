//! Integration tests for wispgate
//!
//! Drives a tunnel session over an in-memory duplex transport, acting
//! as the browser-side client: frames are encoded/decoded with the
//! public codec and targets are real loopback TCP/UDP servers.

use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use wispgate::protocol::{CloseReason, PacketType, StreamKind, CONTROL_STREAM_ID};
use wispgate::transport::{StreamReader, StreamTransport, StreamWriter, TransportReader, TransportWriter};
use wispgate::tunnel::{ConnectPayload, Frame, FrameCodec, SessionConfig, TunnelError, TunnelSession};

/// Client half of an in-memory tunnel
struct TestClient {
    reader: StreamReader<DuplexStream>,
    writer: StreamWriter<DuplexStream>,
    codec: FrameCodec,
}

impl TestClient {
    async fn send(&mut self, frame: &Frame) {
        self.writer.send(&frame.encode()).await.unwrap();
    }

    /// Next frame from the session, or `None` on transport EOF
    async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.codec.next_frame().unwrap() {
                return Some(frame);
            }
            match self.reader.recv().await.unwrap() {
                Some(chunk) => self.codec.push(&chunk),
                None => return None,
            }
        }
    }

    /// Wait for a frame addressed to `stream_id`, ignoring others
    async fn next_frame_for(&mut self, stream_id: u32) -> Option<Frame> {
        loop {
            let frame = self.next_frame().await?;
            if frame.stream_id == stream_id {
                return Some(frame);
            }
        }
    }
}

fn test_config() -> SessionConfig {
    SessionConfig {
        stream_window: 4096,
        dial_timeout: Duration::from_secs(5),
        ..SessionConfig::default()
    }
}

/// Spawn a session over a duplex pipe; returns the client half after
/// consuming the initial control-stream window advertisement.
async fn start_session(config: SessionConfig) -> (TestClient, JoinHandle<Result<(), TunnelError>>) {
    let window = config.stream_window;
    let (client_side, server_side) = tokio::io::duplex(1 << 16);
    let (reader, writer) = StreamTransport::new(server_side).split();
    let session = TunnelSession::new(reader, writer, config);
    let handle = tokio::spawn(session.run());

    let (creader, cwriter) = StreamTransport::new(client_side).split();
    let mut client = TestClient {
        reader: creader,
        writer: cwriter,
        codec: FrameCodec::new(wispgate::MAX_PAYLOAD_SIZE),
    };

    let hello = client.next_frame().await.expect("handshake frame");
    assert_eq!(hello.packet_type, PacketType::Continue);
    assert_eq!(hello.stream_id, CONTROL_STREAM_ID);
    assert_eq!(hello.continue_credit().unwrap(), window);

    (client, handle)
}

/// Loopback TCP server echoing everything it reads
async fn spawn_echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Loopback TCP server that collects all bytes until EOF, then reports
async fn spawn_sink_server() -> (std::net::SocketAddr, tokio::sync::oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut collected = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
            }
        }
        let _ = tx.send(collected);
    });
    (addr, rx)
}

/// Loopback TCP server that accepts one connection and never reads it
async fn spawn_stalling_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        // Hold the socket open without ever reading from it
        let _socket = socket;
        std::future::pending::<()>().await
    });
    addr
}

fn tcp_connect(stream_id: u32, addr: std::net::SocketAddr) -> Frame {
    Frame::connect(
        stream_id,
        &ConnectPayload {
            kind: StreamKind::Tcp,
            host: addr.ip().to_string(),
            port: addr.port(),
        },
    )
}

/// CONNECT -> dial -> DATA relayed -> response DATA -> CLOSE -> entry gone
#[tokio::test]
async fn test_full_tcp_scenario() {
    let addr = spawn_echo_server().await;
    let (mut client, _session) = start_session(test_config()).await;

    client.send(&tcp_connect(1, addr)).await;

    // Dial success arrives as the stream's initial credit grant
    let open = client.next_frame_for(1).await.unwrap();
    assert_eq!(open.packet_type, PacketType::Continue);
    assert_eq!(open.continue_credit().unwrap(), 4096);

    client
        .send(&Frame::data(1, Bytes::from_static(b"GET / HTTP/1.0\r\n\r\n")))
        .await;

    let reply = client.next_frame_for(1).await.unwrap();
    assert_eq!(reply.packet_type, PacketType::Data);
    assert_eq!(&reply.payload[..], b"GET / HTTP/1.0\r\n\r\n");

    client.send(&Frame::close(1, CloseReason::Voluntary)).await;

    // The id is free again: reusing it after close must succeed
    client.send(&tcp_connect(1, addr)).await;
    let reopen = client.next_frame_for(1).await.unwrap();
    assert_eq!(reopen.packet_type, PacketType::Continue);
}

/// Closing twice equals closing once; unknown ids are a no-op
#[tokio::test]
async fn test_close_idempotence() {
    let addr = spawn_echo_server().await;
    let (mut client, _session) = start_session(test_config()).await;

    client.send(&tcp_connect(1, addr)).await;
    client.next_frame_for(1).await.unwrap();

    client.send(&Frame::close(1, CloseReason::Voluntary)).await;
    client.send(&Frame::close(1, CloseReason::Voluntary)).await;
    client.send(&Frame::close(99, CloseReason::Voluntary)).await;

    // Connection must still be healthy
    client.send(&tcp_connect(2, addr)).await;
    let open = client.next_frame_for(2).await.unwrap();
    assert_eq!(open.packet_type, PacketType::Continue);
}

/// Two interleaved streams keep per-stream byte order at their targets
#[tokio::test]
async fn test_interleaved_streams_preserve_order() {
    let (addr_a, rx_a) = spawn_sink_server().await;
    let (addr_b, rx_b) = spawn_sink_server().await;
    let (mut client, _session) = start_session(test_config()).await;

    client.send(&tcp_connect(1, addr_a)).await;
    client.send(&tcp_connect(2, addr_b)).await;
    client.next_frame_for(1).await.unwrap();
    client.next_frame_for(2).await.unwrap();

    for i in 0..10u8 {
        client
            .send(&Frame::data(1, Bytes::from(vec![b'a', i])))
            .await;
        client
            .send(&Frame::data(2, Bytes::from(vec![b'b', i])))
            .await;
    }

    client.send(&Frame::close(1, CloseReason::Voluntary)).await;
    client.send(&Frame::close(2, CloseReason::Voluntary)).await;

    let collected_a = rx_a.await.unwrap();
    let collected_b = rx_b.await.unwrap();

    let expected_a: Vec<u8> = (0..10u8).flat_map(|i| [b'a', i]).collect();
    let expected_b: Vec<u8> = (0..10u8).flat_map(|i| [b'b', i]).collect();
    assert_eq!(collected_a, expected_a);
    assert_eq!(collected_b, expected_b);
}

/// Overrunning the granted window kills only the offending stream
#[tokio::test]
async fn test_window_overrun_is_stream_scoped() {
    let addr = spawn_echo_server().await;
    let (mut client, _session) = start_session(test_config()).await;

    client.send(&tcp_connect(1, addr)).await;
    client.send(&tcp_connect(2, addr)).await;
    client.next_frame_for(1).await.unwrap();
    client.next_frame_for(2).await.unwrap();

    // Window is 4096; a single 5000-byte DATA overruns it
    client
        .send(&Frame::data(1, Bytes::from(vec![0u8; 5000])))
        .await;

    let closed = client.next_frame_for(1).await.unwrap();
    assert_eq!(closed.packet_type, PacketType::Close);
    assert_eq!(closed.close_reason(), CloseReason::Throttled);

    // Sibling stream is untouched
    client
        .send(&Frame::data(2, Bytes::from_static(b"still alive")))
        .await;
    let echo = client.next_frame_for(2).await.unwrap();
    assert_eq!(echo.packet_type, PacketType::Data);
    assert_eq!(&echo.payload[..], b"still alive");
}

/// A CONNECT reusing a live id is a protocol violation: the whole
/// connection is torn down, never silently overwritten
#[tokio::test]
async fn test_duplicate_connect_tears_down_connection() {
    let addr = spawn_echo_server().await;
    let (mut client, session) = start_session(test_config()).await;

    client.send(&tcp_connect(1, addr)).await;
    client.next_frame_for(1).await.unwrap();

    client.send(&tcp_connect(1, addr)).await;

    // Transport closes on our side
    loop {
        match client.next_frame().await {
            Some(_) => continue,
            None => break,
        }
    }

    let result = session.await.unwrap();
    assert!(matches!(result, Err(TunnelError::DuplicateStream(1))));
}

/// CONNECT on the reserved control stream id is fatal
#[tokio::test]
async fn test_connect_on_control_stream_is_fatal() {
    let addr = spawn_echo_server().await;
    let (mut client, session) = start_session(test_config()).await;

    client.send(&tcp_connect(0, addr)).await;

    while client.next_frame().await.is_some() {}
    let result = session.await.unwrap();
    assert!(matches!(result, Err(TunnelError::ReservedStreamId)));
}

/// An oversized declared payload closes the connection and every
/// stream on it, healthy ones included
#[tokio::test]
async fn test_malformed_frame_closes_everything() {
    let addr = spawn_echo_server().await;
    let (mut client, session) = start_session(test_config()).await;

    client.send(&tcp_connect(1, addr)).await;
    client.next_frame_for(1).await.unwrap();

    // Declared length implies a payload far beyond the ceiling
    let mut garbage = bytes::BytesMut::new();
    use bytes::BufMut;
    garbage.put_u32_le(u32::MAX);
    garbage.put_u8(PacketType::Data as u8);
    garbage.put_u32_le(1);
    client.writer.send(&garbage).await.unwrap();

    while client.next_frame().await.is_some() {}
    let result = session.await.unwrap();
    assert!(matches!(result, Err(TunnelError::PayloadTooLarge(..))));
}

/// Dial failures surface as CLOSE with the mapped reason code
#[tokio::test]
async fn test_dial_failure_reports_reason() {
    // Bind then drop to get a refusing port
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (mut client, _session) = start_session(test_config()).await;

    client.send(&tcp_connect(1, addr)).await;

    let closed = client.next_frame_for(1).await.unwrap();
    assert_eq!(closed.packet_type, PacketType::Close);
    assert_eq!(closed.close_reason(), CloseReason::ConnectionRefused);
}

/// Remote EOF surfaces as CLOSE with a voluntary reason after the
/// response has fully drained
#[tokio::test]
async fn test_remote_eof_closes_stream() {
    // One-shot server: single echo, then closes
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 64];
        let n = socket.read(&mut buf).await.unwrap();
        socket.write_all(&buf[..n]).await.unwrap();
    });

    let (mut client, _session) = start_session(test_config()).await;

    client.send(&tcp_connect(1, addr)).await;
    client.next_frame_for(1).await.unwrap();
    client.send(&Frame::data(1, Bytes::from_static(b"bye"))).await;

    let reply = client.next_frame_for(1).await.unwrap();
    assert_eq!(reply.packet_type, PacketType::Data);
    assert_eq!(&reply.payload[..], b"bye");

    let closed = client.next_frame_for(1).await.unwrap();
    assert_eq!(closed.packet_type, PacketType::Close);
    assert_eq!(closed.close_reason(), CloseReason::Voluntary);
}

/// UDP streams relay datagrams and skip the half-close phase
#[tokio::test]
async fn test_udp_stream_roundtrip() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        let (n, peer) = server.recv_from(&mut buf).await.unwrap();
        server.send_to(&buf[..n], peer).await.unwrap();
    });

    let (mut client, _session) = start_session(test_config()).await;

    client
        .send(&Frame::connect(
            1,
            &ConnectPayload {
                kind: StreamKind::Udp,
                host: addr.ip().to_string(),
                port: addr.port(),
            },
        ))
        .await;

    let open = client.next_frame_for(1).await.unwrap();
    assert_eq!(open.packet_type, PacketType::Continue);

    client
        .send(&Frame::data(1, Bytes::from_static(b"query")))
        .await;

    let reply = client.next_frame_for(1).await.unwrap();
    assert_eq!(reply.packet_type, PacketType::Data);
    assert_eq!(&reply.payload[..], b"query");
}

/// UDP CONNECTs are refused when disabled by policy
#[tokio::test]
async fn test_udp_refused_when_disabled() {
    let config = SessionConfig {
        allow_udp: false,
        ..test_config()
    };
    let (mut client, _session) = start_session(config).await;

    client
        .send(&Frame::connect(
            1,
            &ConnectPayload {
                kind: StreamKind::Udp,
                host: "127.0.0.1".to_string(),
                port: 53,
            },
        ))
        .await;

    let closed = client.next_frame_for(1).await.unwrap();
    assert_eq!(closed.packet_type, PacketType::Close);
    assert_eq!(closed.close_reason(), CloseReason::Blocked);
}

/// The stream-count cap refuses new streams with a throttle close
#[tokio::test]
async fn test_stream_limit_refuses_connect() {
    let addr = spawn_echo_server().await;
    let config = SessionConfig {
        max_streams: 2,
        ..test_config()
    };
    let (mut client, _session) = start_session(config).await;

    client.send(&tcp_connect(1, addr)).await;
    client.send(&tcp_connect(2, addr)).await;
    client.send(&tcp_connect(3, addr)).await;

    let refused = client.next_frame_for(3).await.unwrap();
    assert_eq!(refused.packet_type, PacketType::Close);
    assert_eq!(refused.close_reason(), CloseReason::Throttled);
}

/// A stream whose target stops reading must not freeze the session:
/// sibling streams keep relaying while the stalled stream simply stops
/// receiving window credit
#[tokio::test]
async fn test_stalled_target_does_not_block_siblings() {
    let stall_addr = spawn_stalling_server().await;
    let echo_addr = spawn_echo_server().await;
    let (mut client, _session) = start_session(test_config()).await;

    client.send(&tcp_connect(1, stall_addr)).await;
    client.send(&tcp_connect(2, echo_addr)).await;

    // Both dials resolve concurrently; the grants arrive in either order
    let mut credit: u32 = 0;
    for _ in 0..2 {
        let frame = client.next_frame().await.unwrap();
        assert_eq!(frame.packet_type, PacketType::Continue);
        if frame.stream_id == 1 {
            credit = frame.continue_credit().unwrap();
        }
    }

    for _ in 0..40 {
        // Pump the stalled stream as hard as its granted window allows
        while credit >= 512 {
            client.send(&Frame::data(1, Bytes::from(vec![0u8; 512]))).await;
            credit -= 512;
        }

        // The sibling echo must keep completing promptly throughout
        client.send(&Frame::data(2, Bytes::from_static(b"ping"))).await;
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), client.next_frame())
                .await
                .expect("session stopped delivering frames")
                .unwrap();
            match (frame.stream_id, frame.packet_type) {
                (1, PacketType::Continue) => credit += frame.continue_credit().unwrap(),
                (1, PacketType::Close) => credit = 0,
                (2, PacketType::Data) => {
                    assert_eq!(&frame.payload[..], b"ping");
                    break;
                }
                _ => {}
            }
        }
    }
}

/// On target EOF the full buffered response reaches the client before
/// the CLOSE, however little window was granted up front
#[tokio::test]
async fn test_buffered_tail_flushes_before_close() {
    let payload: Vec<u8> = (0..4096u32).map(|i| i as u8).collect();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let server_payload = payload.clone();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(&server_payload).await.unwrap();
        drop(socket);
        let _ = done_tx.send(());
    });

    let config = SessionConfig {
        stream_window: 1024,
        ..test_config()
    };
    let (mut client, _session) = start_session(config).await;

    client.send(&tcp_connect(1, addr)).await;
    let open = client.next_frame_for(1).await.unwrap();
    assert_eq!(open.packet_type, PacketType::Continue);

    // Let the whole response and its EOF reach the session while most
    // of it still exceeds the 1024-byte window
    done_rx.await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.send(&Frame::continue_grant(1, 8192)).await;

    let mut collected = Vec::new();
    loop {
        let frame = client.next_frame_for(1).await.unwrap();
        match frame.packet_type {
            PacketType::Data => collected.extend_from_slice(&frame.payload),
            PacketType::Continue => continue,
            PacketType::Close => {
                assert_eq!(frame.close_reason(), CloseReason::Voluntary);
                break;
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }
    assert_eq!(collected, payload);
}

/// A target flooding far past the granted window and buffer cap gets
/// its stream closed with a throttle reason
#[tokio::test]
async fn test_outbound_hard_cap_closes_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(&[7u8; 1024]).await.unwrap();
        std::future::pending::<()>().await
    });

    let config = SessionConfig {
        stream_window: 16,
        max_buffered: 16,
        ..test_config()
    };
    let (mut client, _session) = start_session(config).await;

    client.send(&tcp_connect(1, addr)).await;
    let open = client.next_frame_for(1).await.unwrap();
    assert_eq!(open.packet_type, PacketType::Continue);

    // A few window-covered bytes may arrive first; the flood must end
    // in a throttle close
    loop {
        let frame = client.next_frame_for(1).await.unwrap();
        match frame.packet_type {
            PacketType::Data => continue,
            PacketType::Close => {
                assert_eq!(frame.close_reason(), CloseReason::Throttled);
                break;
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

/// Client DATA arriving after the target's EOF still drains into the
/// target's write half
#[tokio::test]
async fn test_late_data_drains_after_target_eof() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        // EOF our read direction, then keep collecting what we write
        socket.write_all(b"done").await.unwrap();
        socket.shutdown().await.unwrap();
        let mut collected = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
            }
        }
        let _ = done_tx.send(collected);
    });

    let (mut client, _session) = start_session(test_config()).await;

    client.send(&tcp_connect(1, addr)).await;
    client.next_frame_for(1).await.unwrap();

    let reply = client.next_frame_for(1).await.unwrap();
    assert_eq!(reply.packet_type, PacketType::Data);
    assert_eq!(&reply.payload[..], b"done");

    let closed = client.next_frame_for(1).await.unwrap();
    assert_eq!(closed.packet_type, PacketType::Close);
    assert_eq!(closed.close_reason(), CloseReason::Voluntary);

    // The half-closed entry still relays our tail to the target
    client.send(&Frame::data(1, Bytes::from_static(b"late bytes"))).await;
    client.send(&Frame::close(1, CloseReason::Voluntary)).await;

    assert_eq!(done_rx.await.unwrap(), b"late bytes");
}

/// Gateway accepts the configured upgrade path and rejects others
#[tokio::test]
async fn test_gateway_upgrade_path_check() {
    use futures_util::StreamExt;
    use wispgate::config::Config;
    use wispgate::gateway::GatewayServer;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = GatewayServer::new(Config::default());
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    // Wrong path is rejected
    let err = tokio_tungstenite::connect_async(format!("ws://{}/other/", addr)).await;
    assert!(err.is_err());

    // Configured path upgrades and the handshake frame arrives
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/wisp/", addr))
        .await
        .expect("upgrade on configured path");

    let msg = ws.next().await.unwrap().unwrap();
    let mut codec = FrameCodec::new(wispgate::MAX_PAYLOAD_SIZE);
    codec.push(&msg.into_data());
    let hello = codec.next_frame().unwrap().unwrap();
    assert_eq!(hello.packet_type, PacketType::Continue);
    assert_eq!(hello.stream_id, CONTROL_STREAM_ID);
}
