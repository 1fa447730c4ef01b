//! QUIC transport for service connections.
//!
//! Each service connection maps to one bidirectional QUIC stream on a
//! dedicated connection. A small length-prefixed preamble carries the
//! `ConnectRequest` so the remote side learns the connection id, sticky
//! target, and auth headers before any framed traffic flows.
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use quinn::{ClientConfig, Endpoint};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::Url;

use crate::{BoxedStream, ConnectRequest, TransportFactory};

/// Transport-level configuration defaults.
///
/// ```
/// use relay_transport::TransportConfig;
///
/// let config = TransportConfig::default();
/// assert!(config.max_streams > 0);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_streams: u16,
    pub keep_alive_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        // Keep defaults large enough for most dev/test workloads.
        Self {
            max_streams: 1024,
            keep_alive_interval_ms: 15_000,
        }
    }
}

impl TransportConfig {
    fn quinn_transport_config(&self) -> quinn::TransportConfig {
        let mut config = quinn::TransportConfig::default();
        let streams = quinn::VarInt::from_u32(self.max_streams as u32);
        config.max_concurrent_bidi_streams(streams);
        config.keep_alive_interval(Some(std::time::Duration::from_millis(
            self.keep_alive_interval_ms,
        )));
        config
    }
}

/// QUIC-backed transport factory.
#[derive(Debug)]
pub struct QuicTransport {
    endpoint: Endpoint,
}

impl QuicTransport {
    pub fn bind(
        addr: SocketAddr,
        mut client_config: ClientConfig,
        transport: TransportConfig,
    ) -> Result<Self> {
        let quinn_transport = transport.quinn_transport_config();
        client_config.transport_config(Arc::new(quinn_transport));
        let mut endpoint = Endpoint::client(addr).context("bind QUIC client")?;
        endpoint.set_default_client_config(client_config);
        Ok(Self { endpoint })
    }
}

#[async_trait]
impl TransportFactory for QuicTransport {
    async fn connect(&self, request: ConnectRequest) -> Result<BoxedStream> {
        let (addr, server_name) = resolve_endpoint(&request.endpoint).await?;
        let connecting = self
            .endpoint
            .connect(addr, &server_name)
            .context("initiate QUIC connection")?;
        let connection = connecting.await.context("establish QUIC connection")?;
        let (mut send, recv) = connection.open_bi().await.context("open bidi stream")?;
        write_preamble(&mut send, &request).await?;
        tracing::debug!(
            connection_id = %request.connection_id,
            endpoint = %request.endpoint,
            "quic service stream opened"
        );
        Ok(Box::new(tokio::io::join(recv, send)))
    }
}

async fn resolve_endpoint(endpoint: &str) -> Result<(SocketAddr, String)> {
    let url = Url::parse(endpoint).with_context(|| format!("parse endpoint url: {endpoint}"))?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("endpoint url missing host: {endpoint}"))?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("endpoint url missing port: {endpoint}"))?;
    let addr = tokio::net::lookup_host((host.as_str(), port))
        .await
        .with_context(|| format!("resolve endpoint host: {host}"))?
        .next()
        .ok_or_else(|| anyhow!("no address for endpoint host: {host}"))?;
    Ok((addr, host))
}

/// Write the length-prefixed connect preamble onto a fresh stream.
pub async fn write_preamble<W>(send: &mut W, request: &ConnectRequest) -> Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    let body = serde_json::to_vec(request).context("encode connect preamble")?;
    let length = u32::try_from(body.len()).context("preamble length")?;
    send.write_all(&length.to_be_bytes())
        .await
        .context("write preamble length")?;
    send.write_all(&body).await.context("write preamble body")?;
    Ok(())
}

/// Read the connect preamble the peer wrote; the accept-side counterpart of
/// [`write_preamble`].
pub async fn read_preamble<R>(recv: &mut R) -> Result<ConnectRequest>
where
    R: AsyncRead + Send + Unpin,
{
    let mut length_bytes = [0u8; 4];
    recv.read_exact(&mut length_bytes)
        .await
        .context("read preamble length")?;
    let length = u32::from_be_bytes(length_bytes) as usize;
    // The preamble is tiny; anything large is a framing bug or a bad peer.
    if length > 64 * 1024 {
        return Err(anyhow!("connect preamble too large: {length} bytes"));
    }
    let mut body = vec![0u8; length];
    recv.read_exact(&mut body).await.context("read preamble body")?;
    serde_json::from_slice(&body).context("decode connect preamble")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransferFormat;
    use anyhow::Context;
    use quinn::ServerConfig;
    use rcgen::generate_simple_self_signed;
    use rustls::RootCertStore;
    use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};

    fn make_server_config() -> Result<(ServerConfig, CertificateDer<'static>)> {
        let cert = generate_simple_self_signed(vec!["localhost".into()])
            .context("generate self-signed cert")?;
        let cert_der = CertificateDer::from(cert.serialize_der()?);
        let key_der = PrivatePkcs8KeyDer::from(cert.get_key_pair().serialize_der());
        let server_config = ServerConfig::with_single_cert(vec![cert_der.clone()], key_der.into())
            .context("build server config")?;
        Ok((server_config, cert_der))
    }

    fn make_client_config(cert: CertificateDer<'static>) -> Result<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots.add(cert).context("add root cert")?;
        Ok(ClientConfig::with_root_certificates(Arc::new(roots))?)
    }

    #[tokio::test]
    async fn preamble_round_trip() -> Result<()> {
        let request = ConnectRequest {
            endpoint: "https://localhost:4433".to_string(),
            transfer_format: TransferFormat::Binary,
            connection_id: "sc-9".to_string(),
            target: None,
            headers: vec![("authorization".to_string(), "Bearer x".to_string())],
        };
        let (mut near, mut far) = tokio::io::duplex(4096);
        write_preamble(&mut near, &request).await?;
        let decoded = read_preamble(&mut far).await?;
        assert_eq!(decoded.connection_id, "sc-9");
        assert_eq!(decoded.headers.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn quic_connect_smoke() -> Result<()> {
        let (server_config, cert) = make_server_config()?;
        let server = Endpoint::server(server_config, "127.0.0.1:0".parse()?)?;
        let addr = server.local_addr()?;

        let server_task = tokio::spawn(async move {
            let connection = server
                .accept()
                .await
                .context("no incoming connection")?
                .await?;
            let (mut send, mut recv) = connection.accept_bi().await?;
            let request = read_preamble(&mut recv).await?;
            let mut buf = [0u8; 5];
            recv.read_exact(&mut buf).await.context("read body")?;
            send.write_all(&buf).await?;
            send.finish()?;
            let _ = send.stopped().await;
            Result::<ConnectRequest>::Ok(request)
        });

        let transport = QuicTransport::bind(
            "0.0.0.0:0".parse()?,
            make_client_config(cert)?,
            TransportConfig::default(),
        )?;
        let mut stream = transport
            .connect(ConnectRequest {
                endpoint: format!("https://localhost:{}", addr.port()),
                transfer_format: TransferFormat::Binary,
                connection_id: "sc-1".to_string(),
                target: Some("instance-b".to_string()),
                headers: Vec::new(),
            })
            .await?;
        stream.write_all(b"hello").await?;
        let mut echoed = [0u8; 5];
        stream.read_exact(&mut echoed).await?;
        assert_eq!(&echoed, b"hello");

        let request = server_task.await.context("server task join")??;
        assert_eq!(request.connection_id, "sc-1");
        assert_eq!(request.target.as_deref(), Some("instance-b"));
        Ok(())
    }
}
