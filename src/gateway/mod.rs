//! Gateway front end
//!
//! Accepts TCP connections, performs the WebSocket upgrade for requests
//! on the configured path (anything else is rejected and the socket
//! closed), and hands each upgraded transport to a tunnel session.
//!
//! Static-asset serving and request classification for proxied content
//! live in external collaborators; this gateway only owns the tunnel
//! upgrade endpoint.

use crate::config::Config;
use crate::transport::WsTransport;
use crate::tunnel::{SessionConfig, TunnelSession};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::{debug, error, info, warn};

/// The tunnel gateway server
pub struct GatewayServer {
    config: Config,
}

impl GatewayServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_streams: self.config.server.max_streams,
            stream_window: self.config.flow.stream_window,
            max_buffered: self.config.flow.max_buffered,
            max_payload: self.config.flow.max_payload,
            dial_timeout: self.config.server.dial_timeout(),
            allow_udp: self.config.server.allow_udp,
        }
    }

    /// Bind the configured address and run the accept loop until the
    /// listener fails or the task is cancelled (ctrl-c handling belongs
    /// to the caller).
    pub async fn run(&self) -> crate::Result<()> {
        let listener = TcpListener::bind(&self.config.server.listen).await?;
        info!("Listening on {}", self.config.server.listen);
        info!("Tunnel upgrade path: {}", self.config.server.upgrade_path);
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener
    pub async fn serve(&self, listener: TcpListener) -> crate::Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.server.max_connections));

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Accept error: {}", e);
                    continue;
                }
            };

            let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                warn!("Connection limit reached, dropping {}", peer_addr);
                continue;
            };

            debug!("New connection from {}", peer_addr);

            let upgrade_path = self.config.server.upgrade_path.clone();
            let session_config = self.session_config();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = handle_connection(stream, upgrade_path, session_config).await {
                    debug!("Connection from {} ended: {}", peer_addr, e);
                }
            });
        }
    }
}

/// Upgrade one connection and drive its tunnel session to completion
async fn handle_connection(
    stream: TcpStream,
    upgrade_path: String,
    session_config: SessionConfig,
) -> crate::Result<()> {
    // Control frames and small DATA frames should not sit in Nagle
    stream.set_nodelay(true)?;

    let path_check = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path().ends_with(upgrade_path.as_str()) {
            Ok(resp)
        } else {
            debug!("Rejecting upgrade for path {}", req.uri().path());
            let mut resp = ErrorResponse::new(Some("not found".to_string()));
            *resp.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::NOT_FOUND;
            Err(resp)
        }
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, path_check)
        .await
        .map_err(crate::transport::TransportError::from)?;

    let (reader, writer) = WsTransport::new(ws).split();
    let session = TunnelSession::new(reader, writer, session_config);

    info!(session = %session.id(), "tunnel established");
    session.run().await?;

    Ok(())
}
