// End-to-end tests: the connector core driven by a scripted fake service
// over the in-process memory transport.
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use relay_common::GracefulShutdownMode;
use relay_common::ids::ServerId;
use relay_connector::client::{ClientConnectionContext, ConnectionDelegate};
use relay_connector::config::ConnectorConfig;
use relay_connector::connection::ConnectionStatus;
use relay_connector::container::ServiceConnectionContainer;
use relay_connector::endpoint::{AccessKey, EndpointKind, HubServiceEndpoint, ServiceEndpoint};
use relay_connector::invocation::InvocationRouter;
use relay_connector::registry::ClientConnectionRegistry;
use relay_connector::router::MultiEndpointRouter;
use relay_transport::memory::{MemoryListener, MemoryTransport};
use relay_transport::{ConnectRequest, TransportFactory};
use relay_wire::{AckStatus, Frame, FrameHeader, ServiceMessage, hub};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

// ---- framing helpers (service side of the wire) ----

async fn read_message(stream: &mut DuplexStream) -> Result<Option<ServiceMessage>> {
    let mut header_bytes = [0u8; FrameHeader::LEN];
    match stream.read_exact(&mut header_bytes).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err).context("read header"),
    }
    let header = FrameHeader::decode(Bytes::copy_from_slice(&header_bytes))?;
    let mut payload = vec![0u8; header.length as usize];
    stream.read_exact(&mut payload).await.context("read payload")?;
    Ok(Some(ServiceMessage::decode(Frame {
        header,
        payload: Bytes::from(payload),
    })?))
}

async fn write_message(stream: &mut DuplexStream, message: &ServiceMessage) -> Result<()> {
    let bytes = message.encode().context("encode")?.encode();
    stream.write_all(&bytes).await.context("write")?;
    Ok(())
}

/// Next message that is not a keepalive/status ping.
async fn read_non_ping(stream: &mut DuplexStream) -> Result<Option<ServiceMessage>> {
    loop {
        match read_message(stream).await? {
            Some(ServiceMessage::Ping { .. }) => continue,
            other => return Ok(other),
        }
    }
}

async fn accept_and_handshake(
    listener: &mut MemoryListener,
) -> Result<(ConnectRequest, DuplexStream)> {
    let accepted = listener.accept().await.context("accept")?;
    let mut stream = accepted.stream;
    let handshake = read_message(&mut stream).await?.context("handshake")?;
    match handshake {
        ServiceMessage::HandshakeRequest { version, .. } => assert_eq!(version, 1),
        other => panic!("expected handshake, got {other:?}"),
    }
    write_message(
        &mut stream,
        &ServiceMessage::HandshakeResponse {
            error_message: None,
        },
    )
    .await?;
    Ok((accepted.request, stream))
}

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---- scripted application delegates ----

/// Writes the client handshake response, then collects everything the
/// service relays until EOF.
struct CollectDelegate {
    received: Arc<Mutex<Vec<u8>>>,
    finished: CancellationToken,
}

#[async_trait]
impl ConnectionDelegate for CollectDelegate {
    async fn on_connected(&self, connection: Arc<ClientConnectionContext>) -> Result<()> {
        let mut stream = connection
            .take_application_stream()
            .context("application stream")?;
        stream
            .write_all(&hub::encode_handshake_response(None))
            .await?;
        let mut data = Vec::new();
        stream.read_to_end(&mut data).await?;
        self.received.lock().unwrap().extend_from_slice(&data);
        self.finished.cancel();
        Ok(())
    }
}

/// Writes the handshake plus one invocation frame, then completes without
/// waiting for input (application-finishes-first path).
struct OneShotDelegate;

#[async_trait]
impl ConnectionDelegate for OneShotDelegate {
    async fn on_connected(&self, connection: Arc<ClientConnectionContext>) -> Result<()> {
        let mut stream = connection
            .take_application_stream()
            .context("application stream")?;
        stream
            .write_all(&hub::encode_handshake_response(None))
            .await?;
        stream.write_all(&hub::encode_frame(&[1, 0x11])).await?;
        Ok(())
    }
}

/// Reads until the migration close completes its input, then keeps writing:
/// pending output must still drain to the service.
struct MigrateDelegate {
    finished: CancellationToken,
}

#[async_trait]
impl ConnectionDelegate for MigrateDelegate {
    async fn on_connected(&self, connection: Arc<ClientConnectionContext>) -> Result<()> {
        let mut stream = connection
            .take_application_stream()
            .context("application stream")?;
        stream
            .write_all(&hub::encode_handshake_response(None))
            .await?;
        let mut data = Vec::new();
        stream.read_to_end(&mut data).await?;
        // Input completed (migration); output still drains.
        stream.write_all(&hub::encode_frame(&[1, 0x55])).await?;
        self.finished.cancel();
        Ok(())
    }
}

// ---- fixture plumbing ----

fn test_config(connection_count: usize) -> Arc<ConnectorConfig> {
    Arc::new(ConnectorConfig {
        connection_count,
        connect_retry_limit: 2,
        reconnect_backoff_ms: 50,
        reconnect_backoff_max_ms: 200,
        ack_timeout_ms: 500,
        app_complete_timeout_ms: 1_000,
        ..ConnectorConfig::default()
    })
}

fn test_endpoint(name: &str, kind: EndpointKind) -> Arc<ServiceEndpoint> {
    ServiceEndpoint::new(
        &format!("https://{name}.service.test"),
        kind,
        name,
        AccessKey::new("secret"),
    )
    .expect("endpoint")
}

fn test_container(
    transport: Arc<dyn TransportFactory>,
    delegate: Arc<dyn ConnectionDelegate>,
    connection_count: usize,
) -> (Arc<ServiceConnectionContainer>, Arc<ClientConnectionRegistry>) {
    let registry = ClientConnectionRegistry::new();
    let container = ServiceConnectionContainer::new(
        HubServiceEndpoint::new(test_endpoint("east", EndpointKind::Primary), "chat", 0),
        ServerId::new(),
        test_config(connection_count),
        transport,
        delegate,
        Arc::clone(&registry),
        InvocationRouter::new(),
    );
    (container, registry)
}

// ---- tests ----

#[tokio::test]
async fn container_scales_to_target_and_disposes_clean() -> Result<()> {
    init_tracing();
    let (transport, mut listener) = MemoryTransport::new();
    let delegate = Arc::new(OneShotDelegate);
    let (container, _registry) = test_container(transport, delegate, 2);
    container.start();

    // The fake service accepts both connections and keeps them open.
    let mut held = Vec::new();
    for _ in 0..2 {
        let (_, stream) = accept_and_handshake(&mut listener).await?;
        held.push(stream);
    }

    container.ready().await;
    wait_until(|| container.connected_count() == 2, "2 connected").await;

    container.dispose().await;
    let statuses = container.connection_statuses();
    assert_eq!(statuses.len(), 2);
    assert!(
        statuses
            .iter()
            .all(|status| *status == ConnectionStatus::Closed),
        "statuses were {statuses:?}"
    );
    Ok(())
}

#[tokio::test]
async fn partial_fragments_flush_in_order() -> Result<()> {
    init_tracing();
    let (transport, mut listener) = MemoryTransport::new();
    let received = Arc::new(Mutex::new(Vec::new()));
    let finished = CancellationToken::new();
    let delegate = Arc::new(CollectDelegate {
        received: Arc::clone(&received),
        finished: finished.clone(),
    });
    let (container, registry) = test_container(transport, delegate, 1);
    container.start();

    let (_, mut stream) = accept_and_handshake(&mut listener).await?;
    write_message(
        &mut stream,
        &ServiceMessage::OpenConnection {
            connection_id: "c1".to_string(),
            headers: Vec::new(),
            query: None,
        },
    )
    .await?;
    wait_until(|| registry.contains("c1"), "client registered").await;

    // The application's handshake response comes back as connection data.
    let first = read_non_ping(&mut stream).await?.context("handshake data")?;
    match first {
        ServiceMessage::ConnectionData { connection_id, payload, .. } => {
            assert_eq!(connection_id, "c1");
            assert!(payload.ends_with(&[hub::HANDSHAKE_TERMINATOR]));
        }
        other => panic!("expected connection data, got {other:?}"),
    }

    // Two partial fragments followed by the final one; the application must
    // observe exactly p1 ++ p2 ++ p3.
    for (payload, partial) in [(&b"p1"[..], true), (&b"p2"[..], true), (&b"p3"[..], false)] {
        write_message(
            &mut stream,
            &ServiceMessage::ConnectionData {
                connection_id: "c1".to_string(),
                payload: Bytes::copy_from_slice(payload),
                is_partial: partial,
            },
        )
        .await?;
    }

    write_message(
        &mut stream,
        &ServiceMessage::CloseConnection {
            connection_id: "c1".to_string(),
            error_message: None,
            migration_target: None,
        },
    )
    .await?;

    finished.cancelled().await;
    assert_eq!(received.lock().unwrap().as_slice(), b"p1p2p3");
    wait_until(|| registry.is_empty(), "registry drained").await;
    container.dispose().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_close_is_idempotent_and_id_is_reusable() -> Result<()> {
    init_tracing();
    let (transport, mut listener) = MemoryTransport::new();
    // A delegate that stays alive until its input completes, so the client
    // is still registered when the close messages arrive.
    let delegate = Arc::new(CollectDelegate {
        received: Arc::new(Mutex::new(Vec::new())),
        finished: CancellationToken::new(),
    });
    let (container, registry) = test_container(transport, delegate, 1);
    container.start();

    let (_, mut stream) = accept_and_handshake(&mut listener).await?;
    write_message(
        &mut stream,
        &ServiceMessage::OpenConnection {
            connection_id: "c1".to_string(),
            headers: Vec::new(),
            query: None,
        },
    )
    .await?;
    wait_until(|| registry.contains("c1"), "client registered").await;

    // Racing service-close and app-close paths both resolve to one removal.
    for _ in 0..2 {
        write_message(
            &mut stream,
            &ServiceMessage::CloseConnection {
                connection_id: "c1".to_string(),
                error_message: None,
                migration_target: None,
            },
        )
        .await?;
    }
    wait_until(|| registry.is_empty(), "registry drained").await;

    // The id can be opened again afterwards.
    write_message(
        &mut stream,
        &ServiceMessage::OpenConnection {
            connection_id: "c1".to_string(),
            headers: Vec::new(),
            query: None,
        },
    )
    .await?;
    wait_until(|| registry.contains("c1"), "client re-registered").await;
    container.dispose().await;
    Ok(())
}

#[tokio::test]
async fn app_completion_reports_close_to_the_service() -> Result<()> {
    init_tracing();
    let (transport, mut listener) = MemoryTransport::new();
    let delegate = Arc::new(OneShotDelegate);
    let (container, registry) = test_container(transport, delegate, 1);
    container.start();

    let (_, mut stream) = accept_and_handshake(&mut listener).await?;
    write_message(
        &mut stream,
        &ServiceMessage::OpenConnection {
            connection_id: "c1".to_string(),
            headers: Vec::new(),
            query: None,
        },
    )
    .await?;

    // Handshake data, one frame, then the close report.
    let mut saw_close = false;
    let mut frames = 0;
    while !saw_close {
        match tokio::time::timeout(Duration::from_secs(5), read_non_ping(&mut stream))
            .await
            .context("timed out")??
        {
            Some(ServiceMessage::ConnectionData { connection_id, .. }) => {
                assert_eq!(connection_id, "c1");
                frames += 1;
            }
            Some(ServiceMessage::CloseConnection {
                connection_id,
                migration_target,
                ..
            }) => {
                assert_eq!(connection_id, "c1");
                assert!(migration_target.is_none());
                saw_close = true;
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
    assert!(frames >= 2, "handshake and invocation frames expected");
    wait_until(|| registry.is_empty(), "registry drained").await;
    container.dispose().await;
    Ok(())
}

#[tokio::test]
async fn migration_preserves_delivery_without_close_report() -> Result<()> {
    init_tracing();
    let (transport, mut listener) = MemoryTransport::new();
    let finished = CancellationToken::new();
    let delegate = Arc::new(MigrateDelegate {
        finished: finished.clone(),
    });
    let (container, registry) = test_container(transport, delegate, 1);
    container.start();

    let (_, mut stream) = accept_and_handshake(&mut listener).await?;
    write_message(
        &mut stream,
        &ServiceMessage::OpenConnection {
            connection_id: "c1".to_string(),
            headers: Vec::new(),
            query: None,
        },
    )
    .await?;

    // Consume the relayed client handshake first.
    let handshake = read_non_ping(&mut stream).await?.context("handshake data")?;
    assert!(matches!(handshake, ServiceMessage::ConnectionData { .. }));

    write_message(
        &mut stream,
        &ServiceMessage::CloseConnection {
            connection_id: "c1".to_string(),
            error_message: None,
            migration_target: Some("server-b".to_string()),
        },
    )
    .await?;

    // The application saw EOF and wrote one more frame; it must still be
    // delivered, and no close report may follow for a migrated client.
    let drained = read_non_ping(&mut stream).await?.context("drained frame")?;
    match drained {
        ServiceMessage::ConnectionData { connection_id, payload, .. } => {
            assert_eq!(connection_id, "c1");
            assert_eq!(payload.as_ref(), hub::encode_frame(&[1, 0x55]).as_ref());
        }
        other => panic!("expected drained data, got {other:?}"),
    }

    finished.cancelled().await;
    wait_until(|| registry.is_empty(), "registry drained").await;
    let unexpected =
        tokio::time::timeout(Duration::from_millis(300), read_non_ping(&mut stream)).await;
    assert!(
        unexpected.is_err(),
        "no close report expected after migration, got {unexpected:?}"
    );
    container.dispose().await;
    Ok(())
}

#[tokio::test]
async fn group_ack_fans_out_once_per_endpoint() -> Result<()> {
    init_tracing();
    let (transport, mut listener) = MemoryTransport::new();
    let router = MultiEndpointRouter::new(
        "chat",
        ServerId::new(),
        vec![
            test_endpoint("east", EndpointKind::Primary),
            test_endpoint("west", EndpointKind::Secondary),
        ],
        test_config(1),
        transport,
        Arc::new(OneShotDelegate),
    )
    .expect("router");
    router.start();

    // One connection per endpoint; the fake service answers group joins.
    let joins = Arc::new(Mutex::new(Vec::<String>::new()));
    for _ in 0..2 {
        let (request, mut stream) = accept_and_handshake(&mut listener).await?;
        let joins = Arc::clone(&joins);
        tokio::spawn(async move {
            while let Ok(Some(message)) = read_non_ping(&mut stream).await {
                if let ServiceMessage::UserJoinGroup { user_id, group, ack_id } = message {
                    assert_eq!(user_id, "u1");
                    assert_eq!(group, "g1");
                    joins.lock().unwrap().push(request.endpoint.clone());
                    let _ = write_message(
                        &mut stream,
                        &ServiceMessage::Ack {
                            ack_id: ack_id.expect("ack id"),
                            status: AckStatus::Ok,
                            message: None,
                        },
                    )
                    .await;
                }
            }
        });
    }
    router.ready().await;

    router.add_user_to_group("u1", "g1").await?;

    let observed = {
        let mut joins = joins.lock().unwrap().clone();
        joins.sort();
        joins
    };
    assert_eq!(observed.len(), 2, "exactly one join per endpoint");
    assert!(observed[0].contains("east.service.test"));
    assert!(observed[1].contains("west.service.test"));

    router.dispose().await;
    Ok(())
}

#[tokio::test]
async fn group_ack_timeout_fails_the_aggregate() -> Result<()> {
    init_tracing();
    let (transport, mut listener) = MemoryTransport::new();
    let router = MultiEndpointRouter::new(
        "chat",
        ServerId::new(),
        vec![test_endpoint("east", EndpointKind::Primary)],
        test_config(1),
        transport,
        Arc::new(OneShotDelegate),
    )
    .expect("router");
    router.start();

    // The fake service reads the join but never acks it.
    let (_, mut stream) = accept_and_handshake(&mut listener).await?;
    tokio::spawn(async move { while read_message(&mut stream).await.is_ok_and(|m| m.is_some()) {} });
    router.ready().await;

    let err = router
        .add_user_to_group("u1", "g1")
        .await
        .expect_err("no ack");
    assert!(matches!(
        err,
        relay_connector::ConnectorError::AckTimeout { .. }
    ));
    router.dispose().await;
    Ok(())
}

#[tokio::test]
async fn offline_sends_fin_and_respects_ack() -> Result<()> {
    init_tracing();
    let (transport, mut listener) = MemoryTransport::new();
    let delegate = Arc::new(OneShotDelegate);
    let (container, _registry) = test_container(transport, delegate, 1);
    container.start();

    let (_, mut stream) = accept_and_handshake(&mut listener).await?;
    container.ready().await;

    let offline = tokio::spawn({
        let container = Arc::clone(&container);
        async move { container.offline(GracefulShutdownMode::Off).await }
    });

    // The fin arrives; ack it so offline() can proceed without the timeout.
    loop {
        match tokio::time::timeout(Duration::from_secs(5), read_non_ping(&mut stream))
            .await
            .context("timed out")??
        {
            Some(ServiceMessage::Fin { mode }) => {
                assert_eq!(mode, GracefulShutdownMode::Off);
                write_message(&mut stream, &ServiceMessage::FinAck).await?;
                break;
            }
            Some(other) => panic!("unexpected message before fin: {other:?}"),
            None => panic!("stream ended before fin"),
        }
    }

    offline.await.context("offline join")?;
    container.dispose().await;
    assert!(
        container
            .connection_statuses()
            .iter()
            .all(|status| *status == ConnectionStatus::Closed)
    );
    Ok(())
}
