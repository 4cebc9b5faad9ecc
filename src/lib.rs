//! # Wispgate
//!
//! A tunnel gateway that lets browser-based proxy clients open arbitrary
//! outbound TCP/UDP connections through a single upstream WebSocket,
//! multiplexing many logical streams over one physical socket with a
//! compact framed protocol (Wisp-compatible).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Gateway Front End                    │
//! │      (TCP accept, WebSocket upgrade, path check)     │
//! ├─────────────────────────────────────────────────────┤
//! │                 Tunnel Session                       │
//! │   (stream table, frame demux/mux, flow control)      │
//! ├─────────────────────────────────────────────────────┤
//! │                 Target Connector                     │
//! │     (outbound TCP/UDP dials, bidirectional relay)    │
//! ├─────────────────────────────────────────────────────┤
//! │                 Transport Layer                      │
//! │          (WebSocket, raw byte streams)               │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod connector;
pub mod gateway;
pub mod protocol;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum frame payload size accepted from a peer (64 KB)
pub const MAX_PAYLOAD_SIZE: usize = 65536;

/// Default listen port for the gateway
pub const DEFAULT_PORT: u16 = 8080;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),
}
