//! Byte-stream transport over any `AsyncRead + AsyncWrite`

use super::{TransportError, TransportReader, TransportWriter};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Transport over a plain byte stream (TCP socket, in-memory duplex)
pub struct StreamTransport<S> {
    inner: S,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    /// Split into independently owned read/write halves
    pub fn split(self) -> (StreamReader<S>, StreamWriter<S>) {
        let (read, write) = tokio::io::split(self.inner);
        (
            StreamReader {
                inner: read,
                buf: vec![0u8; 16384],
            },
            StreamWriter { inner: write },
        )
    }
}

/// Read half of a [`StreamTransport`]
pub struct StreamReader<S> {
    inner: ReadHalf<S>,
    buf: Vec<u8>,
}

#[async_trait]
impl<S> TransportReader for StreamReader<S>
where
    S: AsyncRead + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        let n = self.inner.read(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(&self.buf[..n])))
    }
}

/// Write half of a [`StreamTransport`]
pub struct StreamWriter<S> {
    inner: WriteHalf<S>,
}

#[async_trait]
impl<S> TransportWriter for StreamWriter<S>
where
    S: AsyncWrite + Send + 'static,
{
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.inner.write_all(data).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.shutdown().await.ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplex_roundtrip() {
        let (a, b) = tokio::io::duplex(1024);
        let (mut ar, mut aw) = StreamTransport::new(a).split();
        let (mut br, mut bw) = StreamTransport::new(b).split();

        aw.send(b"ping").await.unwrap();
        let got = br.recv().await.unwrap().unwrap();
        assert_eq!(&got[..], b"ping");

        bw.send(b"pong").await.unwrap();
        let got = ar.recv().await.unwrap().unwrap();
        assert_eq!(&got[..], b"pong");

        aw.close().await.unwrap();
        drop(aw);
        assert!(br.recv().await.unwrap().is_none());
    }
}
