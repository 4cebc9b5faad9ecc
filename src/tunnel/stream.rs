//! Per-stream state machine and flow-control accounting

use super::TunnelError;
use crate::protocol::StreamKind;

/// Lifecycle of a logical stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// CONNECT received, dial in flight
    Pending,
    /// Bidirectional relay active
    Open,
    /// One direction has closed, the other is draining
    Closing,
    /// Terminal; the table entry is removed
    Closed,
}

/// State for one logical stream multiplexed over the tunnel.
///
/// Owned by the session; all mutation happens on the session task.
pub struct TunnelStream {
    /// Stream ID (unique among live streams of one connection)
    id: u32,
    /// Protocol kind
    kind: StreamKind,
    /// Target address ("host:port")
    target: String,
    /// Current state
    state: StreamState,
    /// Credits remaining for outbound DATA (granted by the client)
    send_window: u32,
    /// Credits remaining for inbound DATA (granted by us)
    recv_window: u32,
    /// Initial recv window; consumption-backed grants restore toward it
    initial_window: u32,
    /// Bytes the target writer has consumed but we have not granted back
    delivered_pending: u32,
    /// Outbound bytes buffered while awaiting send-window
    buffered: usize,
}

impl TunnelStream {
    /// Create a new stream awaiting its dial result
    pub fn new(id: u32, kind: StreamKind, target: String, initial_window: u32) -> Self {
        Self {
            id,
            kind,
            target,
            state: StreamState::Pending,
            // Both directions start with the initial window; CONTINUE
            // frames replenish it
            send_window: initial_window,
            recv_window: initial_window,
            initial_window,
            delivered_pending: 0,
            buffered: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn send_window(&self) -> u32 {
        self.send_window
    }

    pub fn recv_window(&self) -> u32 {
        self.recv_window
    }

    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Dial resolved successfully
    pub fn on_dial_success(&mut self) {
        if self.state == StreamState::Pending {
            self.state = StreamState::Open;
        }
    }

    /// A CLOSE frame or remote EOF was observed.
    ///
    /// UDP has no teardown handshake, so UDP streams go straight to
    /// Closed; TCP streams pass through Closing while the other
    /// direction drains.
    pub fn on_half_close(&mut self) {
        self.state = match (self.kind, self.state) {
            (StreamKind::Udp, _) => StreamState::Closed,
            (_, StreamState::Pending) => StreamState::Closed,
            (_, StreamState::Open) => StreamState::Closing,
            (_, StreamState::Closing) => StreamState::Closed,
            (_, StreamState::Closed) => StreamState::Closed,
        };
    }

    /// Force the terminal state (teardown, dial failure)
    pub fn on_close(&mut self) {
        self.state = StreamState::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// Whether inbound DATA is acceptable in the current state.
    ///
    /// Closing is included: that state means the target's read side hit
    /// EOF, while its write side still accepts the peer's tail.
    pub fn accepts_data(&self) -> bool {
        matches!(
            self.state,
            StreamState::Pending | StreamState::Open | StreamState::Closing
        )
    }

    /// Account for inbound DATA against the window we granted.
    ///
    /// Exceeding the grant is a flow-control violation scoped to this
    /// stream.
    pub fn consume_recv_window(&mut self, amount: u32) -> Result<(), TunnelError> {
        if amount > self.recv_window {
            return Err(TunnelError::FlowControl(self.id));
        }
        self.recv_window -= amount;
        Ok(())
    }

    /// Record bytes the target writer actually consumed.
    ///
    /// Credit is only granted back against consumption, so a stalled
    /// target stops replenishing the peer's window instead of letting it
    /// send unboundedly. Grants are batched: `Some(credit)` once at
    /// least half the initial window has been consumed since the last
    /// grant.
    pub fn on_delivered(&mut self, amount: u32) -> Option<u32> {
        self.delivered_pending = self.delivered_pending.saturating_add(amount);
        if self.delivered_pending < self.initial_window / 2 {
            return None;
        }
        let grant = self
            .delivered_pending
            .min(self.initial_window.saturating_sub(self.recv_window));
        self.delivered_pending = 0;
        if grant == 0 {
            return None;
        }
        self.recv_window += grant;
        Some(grant)
    }

    /// Client granted us more send-window
    pub fn add_send_window(&mut self, credit: u32) {
        self.send_window = self.send_window.saturating_add(credit);
    }

    /// Consume send-window for an outbound DATA frame
    pub fn consume_send_window(&mut self, amount: u32) {
        self.send_window = self.send_window.saturating_sub(amount);
    }

    /// Track bytes parked in the outbound queue
    pub fn add_buffered(&mut self, amount: usize) {
        self.buffered += amount;
    }

    pub fn sub_buffered(&mut self, amount: usize) {
        self.buffered = self.buffered.saturating_sub(amount);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_stream() -> TunnelStream {
        TunnelStream::new(1, StreamKind::Tcp, "example.com:80".to_string(), 1024)
    }

    #[test]
    fn test_tcp_lifecycle() {
        let mut s = tcp_stream();
        assert_eq!(s.state(), StreamState::Pending);

        s.on_dial_success();
        assert_eq!(s.state(), StreamState::Open);

        s.on_half_close();
        assert_eq!(s.state(), StreamState::Closing);

        s.on_half_close();
        assert_eq!(s.state(), StreamState::Closed);

        // No transition out of Closed
        s.on_dial_success();
        assert_eq!(s.state(), StreamState::Closed);
    }

    #[test]
    fn test_udp_skips_half_close() {
        let mut s = TunnelStream::new(2, StreamKind::Udp, "1.1.1.1:53".to_string(), 1024);
        s.on_dial_success();
        assert_eq!(s.state(), StreamState::Open);

        s.on_half_close();
        assert_eq!(s.state(), StreamState::Closed);
    }

    #[test]
    fn test_dial_failure_from_pending() {
        let mut s = tcp_stream();
        s.on_half_close();
        assert_eq!(s.state(), StreamState::Closed);
    }

    #[test]
    fn test_recv_window_violation() {
        let mut s = tcp_stream();
        s.consume_recv_window(1000).unwrap();
        assert!(matches!(
            s.consume_recv_window(100),
            Err(TunnelError::FlowControl(1))
        ));
    }

    #[test]
    fn test_delivery_replenishes_window() {
        let mut s = tcp_stream();
        s.consume_recv_window(600).unwrap();

        // Nothing granted back until consumption reaches half the window
        assert!(s.on_delivered(100).is_none());
        assert_eq!(s.recv_window(), 424);

        assert_eq!(s.on_delivered(500), Some(600));
        assert_eq!(s.recv_window(), 1024);
    }

    #[test]
    fn test_no_grant_without_delivery() {
        let mut s = tcp_stream();
        s.consume_recv_window(1024).unwrap();
        // Window exhausted but nothing consumed: the peer stays blocked
        assert!(s.on_delivered(0).is_none());
        assert_eq!(s.recv_window(), 0);
    }

    #[test]
    fn test_closing_still_accepts_data() {
        let mut s = tcp_stream();
        s.on_dial_success();
        s.on_half_close();
        assert_eq!(s.state(), StreamState::Closing);
        assert!(s.accepts_data());

        s.on_close();
        assert!(!s.accepts_data());
    }

    #[test]
    fn test_send_window_accounting() {
        let mut s = tcp_stream();
        assert_eq!(s.send_window(), 1024);

        s.consume_send_window(1024);
        s.add_send_window(500);
        s.consume_send_window(200);
        assert_eq!(s.send_window(), 300);
    }
}
