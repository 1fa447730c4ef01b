// Transport boundary for service connections.
//
// The core only ever sees a duplex byte stream: it writes framed control
// messages and reads framed control messages. How those bytes move (QUIC,
// in-process pipes) is the factory's business.
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

pub mod memory;
pub mod quic;

pub use quic::{QuicTransport, TransportConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferFormat {
    #[default]
    Binary,
    Text,
}

/// Everything a factory needs to establish one service connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Server-side base URL of the target endpoint.
    pub endpoint: String,
    pub transfer_format: TransferFormat,
    /// Locally minted id for the new service connection.
    pub connection_id: String,
    /// Sticky service instance to reconnect to, when known.
    pub target: Option<String>,
    /// Auth and diagnostic headers; transports attach them however their
    /// protocol allows.
    pub headers: Vec<(String, String)>,
}

/// Duplex byte stream carrying one multiplexed service connection.
pub trait ServiceStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ServiceStream for T {}

pub type BoxedStream = Box<dyn ServiceStream>;

/// Factory producing connected service streams.
///
/// Implementations own dialing, TLS, and disposal; dropping the returned
/// stream releases the underlying transport resources.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<BoxedStream>;
}
