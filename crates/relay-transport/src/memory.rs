//! In-process transport backed by `tokio::io::duplex`.
//!
//! Tests and local runs use this to stand in for the remote service: the
//! factory side is handed to the connector, the listener side acts as the
//! service and sees every `ConnectRequest` verbatim.
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::{BoxedStream, ConnectRequest, TransportFactory};

const PIPE_CAPACITY: usize = 256 * 1024;
const ACCEPT_QUEUE_DEPTH: usize = 64;

/// One accepted in-process connection: the request and the service-side pipe.
pub struct MemoryConnect {
    pub request: ConnectRequest,
    pub stream: DuplexStream,
}

pub struct MemoryTransport {
    accept_tx: mpsc::Sender<MemoryConnect>,
}

pub struct MemoryListener {
    accept_rx: mpsc::Receiver<MemoryConnect>,
}

impl MemoryTransport {
    pub fn new() -> (Arc<Self>, MemoryListener) {
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE_DEPTH);
        (Arc::new(Self { accept_tx }), MemoryListener { accept_rx })
    }
}

#[async_trait]
impl TransportFactory for MemoryTransport {
    async fn connect(&self, request: ConnectRequest) -> Result<BoxedStream> {
        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        self.accept_tx
            .send(MemoryConnect {
                request,
                stream: far,
            })
            .await
            .map_err(|_| anyhow!("memory listener closed"))?;
        Ok(Box::new(near))
    }
}

impl MemoryListener {
    /// Next incoming connection, or `None` once every factory handle dropped.
    pub async fn accept(&mut self) -> Option<MemoryConnect> {
        self.accept_rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransferFormat;
    use anyhow::Context;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn request(id: &str) -> ConnectRequest {
        ConnectRequest {
            endpoint: "memory://service".to_string(),
            transfer_format: TransferFormat::Binary,
            connection_id: id.to_string(),
            target: None,
            headers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn connect_hands_request_to_listener() -> Result<()> {
        let (transport, mut listener) = MemoryTransport::new();
        let mut near = transport.connect(request("sc-1")).await?;
        let accepted = listener.accept().await.context("accept")?;
        assert_eq!(accepted.request.connection_id, "sc-1");

        let mut far = accepted.stream;
        near.write_all(b"ping").await?;
        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"ping");

        far.write_all(b"pong").await?;
        near.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"pong");
        Ok(())
    }

    #[tokio::test]
    async fn connect_fails_after_listener_drop() -> Result<()> {
        let (transport, listener) = MemoryTransport::new();
        drop(listener);
        assert!(transport.connect(request("sc-2")).await.is_err());
        Ok(())
    }
}
