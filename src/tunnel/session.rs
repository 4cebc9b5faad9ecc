//! Per-connection tunnel session
//!
//! One `TunnelSession` owns one physical transport and is the single
//! authority over that connection's stream table. Inbound transport
//! chunks arrive from a dedicated reader task over a channel; target
//! relay tasks report through a second channel; the session `select!`s
//! over both and is the only place the table, the flow-control counters,
//! and the transport writer are touched.

use super::frame::{ConnectPayload, Frame, FrameCodec};
use super::stream::TunnelStream;
use super::TunnelError;
use crate::connector::{self, StreamHandles, TargetEvent};
use crate::protocol::{CloseReason, PacketType, CONTROL_STREAM_ID};
use crate::transport::{TransportError, TransportReader, TransportWriter};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Grace period for a half-closed stream awaiting the peer's CLOSE
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Channel depth for reader chunks and target events
const CHANNEL_DEPTH: usize = 256;

/// Tunable limits for one session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum concurrent streams on this connection
    pub max_streams: usize,
    /// Initial per-stream flow-control window (bytes)
    pub stream_window: u32,
    /// Cap on buffered-but-unsent outbound bytes per stream
    pub max_buffered: usize,
    /// Frame payload ceiling enforced by the codec
    pub max_payload: usize,
    /// Outbound dial timeout
    pub dial_timeout: Duration,
    /// Whether UDP streams are permitted
    pub allow_udp: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_streams: super::DEFAULT_MAX_STREAMS,
            stream_window: super::DEFAULT_STREAM_WINDOW,
            max_buffered: super::DEFAULT_MAX_BUFFERED,
            max_payload: crate::MAX_PAYLOAD_SIZE,
            dial_timeout: Duration::from_secs(10),
            allow_udp: true,
        }
    }
}

/// Message from the transport reader task
enum ReaderMessage {
    Chunk(Bytes),
    Error(TransportError),
    Closed,
}

/// Stream table entry: state machine plus relay-task handles
struct StreamEntry {
    stream: TunnelStream,
    handles: StreamHandles,
    /// Outbound DATA parked while awaiting send-window
    pending_out: VecDeque<Bytes>,
    /// Close reason held back until `pending_out` has drained; the
    /// CLOSE frame must be the last frame of a stream
    pending_close: Option<CloseReason>,
    /// Set once the target side finished and we await the peer's CLOSE
    draining_since: Option<Instant>,
}

/// Connection manager for one tunnel transport
pub struct TunnelSession<W> {
    id: Uuid,
    config: SessionConfig,
    writer: W,
    streams: HashMap<u32, StreamEntry>,
    codec: FrameCodec,
    reader_rx: mpsc::Receiver<ReaderMessage>,
    event_tx: mpsc::Sender<TargetEvent>,
    event_rx: mpsc::Receiver<TargetEvent>,
    alive: bool,
}

impl<W: TransportWriter> TunnelSession<W> {
    /// Create a session over split transport halves.
    ///
    /// The reader half moves into a dedicated task immediately; the
    /// session owns the writer.
    pub fn new<R>(reader: R, writer: W, config: SessionConfig) -> Self
    where
        R: TransportReader + 'static,
    {
        let (reader_tx, reader_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_DEPTH);

        tokio::spawn(run_reader(reader, reader_tx));

        Self {
            id: Uuid::new_v4(),
            codec: FrameCodec::new(config.max_payload),
            config,
            writer,
            streams: HashMap::new(),
            reader_rx,
            event_tx,
            event_rx,
            alive: true,
        }
    }

    /// Session id, for log correlation
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Number of live streams in the table
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Drive the session until the transport closes or a fatal error.
    ///
    /// Every owned stream is forcibly closed on exit, whatever the path.
    pub async fn run(mut self) -> Result<(), TunnelError> {
        // Advertise the initial per-stream window on the control stream;
        // this is the connection-level handshake browsers expect.
        let handshake = Frame::continue_grant(CONTROL_STREAM_ID, self.config.stream_window);
        let result = match self.send_frame(&handshake).await {
            Ok(()) => self.event_loop().await,
            Err(e) => Err(e),
        };

        if let Err(ref e) = result {
            warn!(session = %self.id, error = %e, "session terminated");
        } else {
            debug!(session = %self.id, "session closed");
        }

        self.shutdown().await;
        result
    }

    async fn event_loop(&mut self) -> Result<(), TunnelError> {
        let mut drain_sweep = tokio::time::interval(Duration::from_secs(1));
        drain_sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                msg = self.reader_rx.recv() => {
                    match msg {
                        Some(ReaderMessage::Chunk(chunk)) => self.handle_chunk(chunk).await?,
                        Some(ReaderMessage::Error(e)) => return Err(e.into()),
                        Some(ReaderMessage::Closed) | None => return Ok(()),
                    }
                }
                Some(ev) = self.event_rx.recv() => {
                    self.handle_target_event(ev).await?;
                }
                _ = drain_sweep.tick() => {
                    self.sweep_draining().await?;
                }
            }
        }
    }

    /// Feed transport bytes to the codec and dispatch completed frames
    async fn handle_chunk(&mut self, chunk: Bytes) -> Result<(), TunnelError> {
        self.codec.push(&chunk);
        while let Some(frame) = self.codec.next_frame()? {
            self.handle_frame(frame).await?;
        }
        Ok(())
    }

    /// Dispatch one inbound frame.
    ///
    /// Protocol violations return `Err` and tear the connection down;
    /// stream-scoped failures are handled locally.
    async fn handle_frame(&mut self, frame: Frame) -> Result<(), TunnelError> {
        trace!(
            session = %self.id,
            packet_type = ?frame.packet_type,
            stream_id = frame.stream_id,
            len = frame.payload.len(),
            "frame received"
        );

        match frame.packet_type {
            PacketType::Connect => self.handle_connect(frame).await,
            PacketType::Data => self.handle_data(frame).await,
            PacketType::Continue => self.handle_continue(frame).await,
            PacketType::Close => self.handle_close(frame).await,
        }
    }

    async fn handle_connect(&mut self, frame: Frame) -> Result<(), TunnelError> {
        let stream_id = frame.stream_id;

        if stream_id == CONTROL_STREAM_ID {
            return Err(TunnelError::ReservedStreamId);
        }
        // Never silently overwrite: reusing a live id would leak one
        // stream's bytes into another.
        if self.streams.contains_key(&stream_id) {
            return Err(TunnelError::DuplicateStream(stream_id));
        }

        let target = ConnectPayload::parse(&frame.payload)?;

        if matches!(target.kind, crate::protocol::StreamKind::Udp) && !self.config.allow_udp {
            debug!(session = %self.id, stream_id, "udp disabled, refusing stream");
            self.send_frame(&Frame::close(stream_id, CloseReason::Blocked))
                .await?;
            return Ok(());
        }

        if self.streams.len() >= self.config.max_streams {
            debug!(session = %self.id, stream_id, "stream limit reached");
            self.send_frame(&Frame::close(stream_id, CloseReason::Throttled))
                .await?;
            return Ok(());
        }

        debug!(
            session = %self.id,
            stream_id,
            kind = ?target.kind,
            target = %target.address(),
            "opening stream"
        );

        let handles = connector::spawn_stream(
            stream_id,
            target.kind,
            target.address(),
            self.config.dial_timeout,
            self.event_tx.clone(),
        );

        self.streams.insert(
            stream_id,
            StreamEntry {
                stream: TunnelStream::new(
                    stream_id,
                    target.kind,
                    target.address(),
                    self.config.stream_window,
                ),
                handles,
                pending_out: VecDeque::new(),
                pending_close: None,
                draining_since: None,
            },
        );

        Ok(())
    }

    async fn handle_data(&mut self, frame: Frame) -> Result<(), TunnelError> {
        let stream_id = frame.stream_id;
        let len = frame.payload.len() as u32;

        let Some(entry) = self.streams.get_mut(&stream_id) else {
            // A close may race an in-flight DATA; not an error
            trace!(session = %self.id, stream_id, "data for unknown stream");
            return Ok(());
        };

        if !entry.stream.accepts_data() {
            trace!(session = %self.id, stream_id, "data for draining stream");
            return Ok(());
        }

        // Window overrun is a stream-scoped failure: terminate this
        // stream, leave its siblings alone.
        if entry.stream.consume_recv_window(len).is_err() {
            warn!(session = %self.id, stream_id, "flow control violated by peer");
            self.close_stream(stream_id, CloseReason::Throttled).await?;
            return Ok(());
        }

        // Forward toward the target without waiting: the session task
        // must never block on one stream's relay. Window credit is only
        // granted back once the target writer reports consumption, so a
        // compliant peer cannot fill the queue.
        match entry.handles.data_tx.try_send(frame.payload) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session = %self.id, stream_id, "relay queue full");
                self.close_stream(stream_id, CloseReason::Throttled).await?;
            }
            // A closed channel means the relay already ended; its
            // Closed event is on the way.
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(session = %self.id, stream_id, "relay gone, dropping data");
            }
        }

        Ok(())
    }

    async fn handle_continue(&mut self, frame: Frame) -> Result<(), TunnelError> {
        let stream_id = frame.stream_id;
        if stream_id == CONTROL_STREAM_ID {
            // Connection-level advertisements from the peer carry no
            // meaning for the server side
            return Ok(());
        }

        let credit = frame.continue_credit()?;

        let Some(entry) = self.streams.get_mut(&stream_id) else {
            trace!(session = %self.id, stream_id, "credit for unknown stream");
            return Ok(());
        };
        entry.stream.add_send_window(credit);

        self.flush_pending(stream_id).await
    }

    async fn handle_close(&mut self, frame: Frame) -> Result<(), TunnelError> {
        let stream_id = frame.stream_id;

        // Idempotent: the peer may race a close against our own
        let Some(mut entry) = self.streams.remove(&stream_id) else {
            trace!(session = %self.id, stream_id, "close for unknown stream");
            return Ok(());
        };

        debug!(
            session = %self.id,
            stream_id,
            reason = ?frame.close_reason(),
            "stream closed by peer"
        );

        entry.stream.on_close();
        // Dropping the entry drops the relay handles, which cancels the
        // dial or relay tasks and releases the remote socket.
        Ok(())
    }

    /// Handle an event reported by a target relay task
    async fn handle_target_event(&mut self, event: TargetEvent) -> Result<(), TunnelError> {
        match event {
            TargetEvent::Opened { stream_id } => {
                let Some(entry) = self.streams.get_mut(&stream_id) else {
                    // Closed while the dial was in flight
                    return Ok(());
                };
                entry.stream.on_dial_success();
                debug!(session = %self.id, stream_id, "stream open");
                // The initial credit grant doubles as the dial-success
                // signal toward the client.
                self.send_frame(&Frame::continue_grant(
                    stream_id,
                    self.config.stream_window,
                ))
                .await
            }
            TargetEvent::Data { stream_id, data } => self.handle_target_data(stream_id, data).await,
            TargetEvent::Consumed { stream_id, len } => {
                let Some(entry) = self.streams.get_mut(&stream_id) else {
                    return Ok(());
                };
                if let Some(credit) = entry.stream.on_delivered(len as u32) {
                    self.send_frame(&Frame::continue_grant(stream_id, credit))
                        .await?;
                }
                Ok(())
            }
            TargetEvent::Closed { stream_id, reason } => {
                self.handle_target_closed(stream_id, reason).await
            }
        }
    }

    /// Remote peer sent bytes: emit DATA within the granted window, or
    /// buffer and apply backpressure.
    async fn handle_target_data(&mut self, stream_id: u32, data: Bytes) -> Result<(), TunnelError> {
        let len = data.len();

        let Some(entry) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };

        if entry.pending_out.is_empty() && entry.stream.send_window() as usize >= len {
            entry.stream.consume_send_window(len as u32);
            self.send_frame(&Frame::data(stream_id, data)).await?;
            return Ok(());
        }

        // Hard cap: the pause signal is advisory for chunks already in
        // flight, so a bounded overshoot window exists above high water.
        if entry.stream.buffered() + len > self.config.max_buffered * 2 {
            warn!(session = %self.id, stream_id, "outbound buffer cap exceeded");
            self.close_stream(stream_id, CloseReason::Throttled).await?;
            return Ok(());
        }

        entry.pending_out.push_back(data);
        entry.stream.add_buffered(len);

        if entry.stream.buffered() >= self.config.max_buffered {
            trace!(session = %self.id, stream_id, "pausing target reads");
            let _ = entry.handles.pause_tx.send(true);
        }

        Ok(())
    }

    /// The target side finished: transition, then report to the peer
    /// once every buffered outbound byte has gone out.
    async fn handle_target_closed(
        &mut self,
        stream_id: u32,
        reason: CloseReason,
    ) -> Result<(), TunnelError> {
        let Some(entry) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };

        debug!(session = %self.id, stream_id, ?reason, "target closed");
        entry.stream.on_half_close();
        // The CLOSE must trail the buffered response tail, or a clean
        // EOF would present a truncated stream as voluntarily closed.
        // flush_pending emits it once the queue is empty; the drain
        // sweep reaps the entry if the peer never grants enough window.
        entry.pending_close = Some(reason);
        entry.draining_since = Some(Instant::now());

        self.flush_pending(stream_id).await
    }

    /// Send queued outbound DATA up to the current send-window; once
    /// the queue empties, emit any close the target left pending.
    async fn flush_pending(&mut self, stream_id: u32) -> Result<(), TunnelError> {
        loop {
            let Some(entry) = self.streams.get_mut(&stream_id) else {
                return Ok(());
            };

            let fits = entry
                .pending_out
                .front()
                .is_some_and(|front| (entry.stream.send_window() as usize) >= front.len());
            if !fits {
                break;
            }
            let Some(data) = entry.pending_out.pop_front() else {
                break;
            };
            entry.stream.consume_send_window(data.len() as u32);
            entry.stream.sub_buffered(data.len());
            self.send_frame(&Frame::data(stream_id, data)).await?;
        }

        // Resume target reads once the queue has drained below half
        if let Some(entry) = self.streams.get_mut(&stream_id) {
            if entry.stream.buffered() < self.config.max_buffered / 2 {
                let _ = entry.handles.pause_tx.send(false);
            }
        }

        let (deferred_close, fully_closed) = match self.streams.get_mut(&stream_id) {
            Some(entry) if entry.pending_out.is_empty() => {
                (entry.pending_close.take(), entry.stream.is_closed())
            }
            _ => (None, false),
        };
        if let Some(reason) = deferred_close {
            self.send_frame(&Frame::close(stream_id, reason)).await?;
            if fully_closed {
                // Dial failures and UDP streams finish immediately
                self.streams.remove(&stream_id);
            }
            // TCP half-close keeps the entry: late client DATA still
            // drains into the target writer, until the peer's CLOSE or
            // the drain timeout.
        }

        Ok(())
    }

    /// Stream-scoped teardown: CLOSE to the peer, entry removed,
    /// relays cancelled. Siblings unaffected.
    async fn close_stream(&mut self, stream_id: u32, reason: CloseReason) -> Result<(), TunnelError> {
        if let Some(mut entry) = self.streams.remove(&stream_id) {
            entry.stream.on_close();
            self.send_frame(&Frame::close(stream_id, reason)).await?;
        }
        Ok(())
    }

    /// Reap half-closed streams whose peer never sent a CLOSE, emitting
    /// any close still pending on window that never came
    async fn sweep_draining(&mut self) -> Result<(), TunnelError> {
        let now = Instant::now();
        let expired: Vec<u32> = self
            .streams
            .iter()
            .filter(|(_, entry)| {
                entry
                    .draining_since
                    .is_some_and(|since| now.duration_since(since) >= STREAM_DRAIN_TIMEOUT)
            })
            .map(|(stream_id, _)| *stream_id)
            .collect();

        for stream_id in expired {
            trace!(session = %self.id, stream_id, "reaping drained stream");
            if let Some(mut entry) = self.streams.remove(&stream_id) {
                entry.stream.on_close();
                if let Some(reason) = entry.pending_close.take() {
                    self.send_frame(&Frame::close(stream_id, reason)).await?;
                }
            }
        }

        Ok(())
    }

    async fn send_frame(&mut self, frame: &Frame) -> Result<(), TunnelError> {
        self.writer.send(&frame.encode()).await?;
        Ok(())
    }

    /// Close every stream and release the transport. Idempotent.
    async fn shutdown(&mut self) {
        if !self.alive {
            return;
        }
        self.alive = false;

        for (stream_id, mut entry) in self.streams.drain() {
            trace!(session = %self.id, stream_id, "closing stream on shutdown");
            entry.stream.on_close();
            // Dropping the entry cancels its relay tasks
        }

        let _ = self.writer.close().await;
    }
}

/// Pump the transport reader into the session's channel.
///
/// Runs as its own task so a blocked session never stalls transport-level
/// keepalive handling.
async fn run_reader<R: TransportReader>(mut reader: R, tx: mpsc::Sender<ReaderMessage>) {
    loop {
        match reader.recv().await {
            Ok(Some(chunk)) => {
                if tx.send(ReaderMessage::Chunk(chunk)).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                let _ = tx.send(ReaderMessage::Closed).await;
                break;
            }
            Err(e) => {
                let _ = tx.send(ReaderMessage::Error(e)).await;
                break;
            }
        }
    }
}
