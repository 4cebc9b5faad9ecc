//! WebSocket transport
//!
//! Binary messages carry the tunnel's frame byte stream. Chunking is
//! preserved but meaningless to the codec: a frame may span messages
//! and a message may hold several frames.

use super::{TransportError, TransportReader, TransportWriter};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Transport over an accepted WebSocket connection
pub struct WsTransport<S> {
    inner: WebSocketStream<S>,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self { inner }
    }

    /// Split into independently owned read/write halves
    pub fn split(self) -> (WsReader<S>, WsWriter<S>) {
        let (sink, stream) = self.inner.split();
        (WsReader { inner: stream }, WsWriter { inner: sink })
    }
}

/// Read half of a [`WsTransport`]
pub struct WsReader<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> TransportReader for WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                // Text frames are tolerated; clients should send binary
                Some(Ok(Message::Text(text))) => return Ok(Some(Bytes::from(text.into_bytes()))),
                // Keepalives are handled by tungstenite; skip
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}

/// Write half of a [`WsTransport`]
pub struct WsWriter<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> TransportWriter for WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.inner.send(Message::Binary(data.to_vec())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await.ok();
        Ok(())
    }
}
