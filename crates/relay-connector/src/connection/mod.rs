//! One multiplexed service connection: lifecycle, receive loop, dispatch.
//!
//! # Purpose
//! Establishes and pumps one logical transport session to one endpoint for
//! one hub. Client traffic arriving here is registered into the shared
//! client registry and bridged to the hosted application; application
//! output flows back through this connection's single-writer task.
//!
//! # Design notes
//! All mutation of the partial-payload buffer map happens on the receive
//! loop's own task and completes before any suspension point, so the map
//! needs no lock. Moving any of that mutation across an `.await` would
//! reintroduce a data race.
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use relay_common::GracefulShutdownMode;
use relay_common::ids::ServerId;
use relay_transport::{BoxedStream, ConnectRequest, TransferFormat, TransportFactory};
use relay_wire::{ServiceMessage, ping};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::io::WriteHalf;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

mod bridge;
mod frame_io;

use crate::ack::AckTracker;
use crate::client::{ClientConnectionContext, ConnectionDelegate};
use crate::config::{ConnectorConfig, FRAME_SCRATCH_CAPACITY, OUTGOING_QUEUE_DEPTH};
use crate::endpoint::ServiceEndpoint;
use crate::error::ConnectorError;
use crate::invocation::InvocationRouter;
use crate::registry::ClientConnectionRegistry;

pub(crate) const PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Inited,
    Connecting,
    Connected,
    /// The session ended and will not be resumed by this instance; the
    /// container replaces it unless shutdown was requested.
    Disconnected,
    /// Terminal: shutdown was requested.
    Closed,
}

/// Shared dependencies every connection of one (hub, endpoint) pool uses.
#[derive(Clone)]
pub(crate) struct ConnectionEnv {
    pub(crate) server_id: ServerId,
    pub(crate) hub: String,
    pub(crate) endpoint: Arc<ServiceEndpoint>,
    pub(crate) config: Arc<ConnectorConfig>,
    pub(crate) transport: Arc<dyn TransportFactory>,
    pub(crate) delegate: Arc<dyn ConnectionDelegate>,
    pub(crate) registry: Arc<ClientConnectionRegistry>,
    pub(crate) acks: Arc<AckTracker>,
    pub(crate) invocations: Arc<InvocationRouter>,
    pub(crate) known_servers: Arc<Mutex<HashSet<String>>>,
}

pub struct ServiceConnection {
    connection_id: String,
    // Pool-unique index minted by the owning container's counter.
    index: usize,
    env: ConnectionEnv,
    status_tx: watch::Sender<ConnectionStatus>,
    // Present only while a session is live; swapped out on teardown so
    // senders observe "not active" instead of writing into a dead pipe.
    outgoing: Mutex<Option<mpsc::Sender<ServiceMessage>>>,
    // Clients bridged through this connection (subset of the registry).
    clients: DashMap<String, Arc<ClientConnectionContext>>,
    fin_ack: watch::Sender<bool>,
    shutdown: CancellationToken,
}

impl ServiceConnection {
    pub(crate) fn new(env: ConnectionEnv, index: usize) -> Arc<Self> {
        Arc::new(Self {
            connection_id: Uuid::new_v4().to_string(),
            index,
            env,
            status_tx: watch::channel(ConnectionStatus::Inited).0,
            outgoing: Mutex::new(None),
            clients: DashMap::new(),
            fin_ack: watch::channel(false).0,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn server_id(&self) -> ServerId {
        self.env.server_id
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn current_status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.current_status() == ConnectionStatus::Connected
    }

    /// Clients currently bridged through this connection.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub(crate) fn config(&self) -> &ConnectorConfig {
        &self.env.config
    }

    /// Request shutdown; the session exits and the status becomes terminal.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            tracing::debug!(
                connection_id = %self.connection_id,
                ?previous,
                ?status,
                "service connection status changed"
            );
        }
    }

    /// Enqueue a control message on the single-writer task.
    ///
    /// Fails with `ServiceConnectionNotActive` when no session is live; the
    /// caller's pump must stop forwarding on that error.
    pub(crate) async fn send_message(
        &self,
        message: ServiceMessage,
    ) -> Result<(), ConnectorError> {
        let sender = self.outgoing.lock().clone();
        let Some(sender) = sender else {
            return Err(ConnectorError::ServiceConnectionNotActive);
        };
        sender
            .send(message)
            .await
            .map_err(|_| ConnectorError::ServiceConnectionNotActive)
    }

    /// Graceful offline: send fin, await the service's ack (bounded), then
    /// run the per-mode client teardown and stop the session.
    pub(crate) async fn offline(&self, mode: GracefulShutdownMode) {
        match self.send_message(ServiceMessage::Fin { mode }).await {
            Ok(()) => {
                let mut fin_rx = self.fin_ack.subscribe();
                let acked = tokio::time::timeout(
                    self.env.config.offline_timeout(),
                    fin_rx.wait_for(|acked| *acked),
                )
                .await;
                if acked.is_err() {
                    tracing::warn!(
                        connection_id = %self.connection_id,
                        "fin ack timed out; proceeding with offline"
                    );
                }
            }
            Err(err) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    error = %err,
                    "fin not sent; proceeding with offline"
                );
            }
        }

        match mode {
            GracefulShutdownMode::Off => {
                let contexts = self.client_snapshot();
                for context in contexts {
                    self.perform_disconnect(&context, false).await;
                }
            }
            GracefulShutdownMode::WaitForClientsClose => {
                let deadline =
                    tokio::time::Instant::now() + self.env.config.offline_timeout();
                while !self.clients.is_empty() && tokio::time::Instant::now() < deadline {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
                if !self.clients.is_empty() {
                    tracing::warn!(
                        connection_id = %self.connection_id,
                        remaining = self.clients.len(),
                        "clients still connected at offline timeout"
                    );
                }
            }
            GracefulShutdownMode::MigrateClients => {
                let contexts = self.client_snapshot();
                for context in contexts {
                    context.mark_migrated();
                    context.complete_incoming().await;
                }
            }
        }
        self.shutdown.cancel();
    }

    fn client_snapshot(&self) -> Vec<Arc<ClientConnectionContext>> {
        self.clients
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Tear down one client connection. Idempotent: racing service-close and
    /// application-close paths both land here and only the first acts.
    pub(crate) async fn perform_disconnect(
        &self,
        context: &Arc<ClientConnectionContext>,
        report_close: bool,
    ) {
        if !context.begin_finalize() {
            return;
        }
        let connection_id = context.connection_id().to_string();
        self.env.registry.remove(&connection_id);
        self.clients.remove(&connection_id);
        self.env.invocations.cleanup_by_connection(&connection_id);
        context.abort();
        context.complete_incoming().await;
        let waited = tokio::time::timeout(
            self.env.config.app_complete_timeout(),
            context.wait_completed(),
        )
        .await;
        if waited.is_err() {
            tracing::warn!(connection_id = %connection_id, "long running application task");
        }
        if report_close && !context.is_migrated() {
            let close = ServiceMessage::CloseConnection {
                connection_id: connection_id.clone(),
                error_message: None,
                migration_target: None,
            };
            if let Err(err) = self.send_message(close).await {
                tracing::debug!(
                    connection_id = %connection_id,
                    error = %err,
                    "close report dropped"
                );
            }
        }
        tracing::debug!(connection_id = %connection_id, "client connection removed");
    }

    async fn connect_once(&self, target: Option<&str>) -> anyhow::Result<BoxedStream> {
        let audience = self.env.endpoint.server_endpoint(&self.env.hub);
        let token = self
            .env
            .endpoint
            .access_key()
            .sign(&audience, self.env.config.token_lifetime())
            .map_err(anyhow::Error::from)?;
        let request = ConnectRequest {
            endpoint: audience,
            transfer_format: TransferFormat::Binary,
            connection_id: self.connection_id.clone(),
            target: target.map(str::to_string),
            headers: vec![
                ("authorization".to_string(), format!("Bearer {token}")),
                ("x-server-id".to_string(), self.env.server_id.to_string()),
            ],
        };
        let mut stream = self
            .env
            .transport
            .connect(request)
            .await
            .map_err(|err| anyhow::anyhow!("connect transport: {err}"))?;

        frame_io::write_message(
            &mut stream,
            &ServiceMessage::HandshakeRequest {
                version: PROTOCOL_VERSION,
                target: target.map(str::to_string),
            },
        )
        .await
        .map_err(|err| anyhow::anyhow!("send handshake: {err}"))?;

        let mut scratch = BytesMut::with_capacity(FRAME_SCRATCH_CAPACITY);
        let response = tokio::time::timeout(
            self.env.config.service_timeout(),
            frame_io::read_message(&mut stream, &mut scratch, self.env.config.max_frame_bytes),
        )
        .await
        .map_err(|_| anyhow::anyhow!("handshake timed out"))??;
        match response {
            Some(ServiceMessage::HandshakeResponse {
                error_message: None,
            }) => Ok(stream),
            Some(ServiceMessage::HandshakeResponse {
                error_message: Some(message),
            }) => Err(anyhow::anyhow!("handshake rejected: {message}")),
            Some(other) => Err(anyhow::anyhow!("unexpected handshake reply: {other:?}")),
            None => Err(anyhow::anyhow!("connection closed during handshake")),
        }
    }

    /// Route an inbound service→client payload, buffering partials.
    ///
    /// Buffer-map mutation stays ahead of every `.await`: partial fragments
    /// are pushed and we return; for a final fragment the pending list is
    /// removed from the map before the first pipe write.
    async fn on_client_message(
        &self,
        connection_id: String,
        payload: Bytes,
        is_partial: bool,
        buffers: &mut HashMap<String, Vec<Bytes>>,
    ) {
        if is_partial {
            buffers.entry(connection_id).or_default().push(payload);
            return;
        }
        let pending = buffers.remove(&connection_id);
        let Some(context) = self.env.registry.get(&connection_id) else {
            // The client may have disconnected already; not fatal.
            tracing::debug!(connection_id, "data for unknown client dropped");
            return;
        };
        if let Some(pending) = pending {
            for piece in pending {
                if let Err(err) = context.write_to_application(&piece).await {
                    tracing::warn!(connection_id, error = %err, "client pipe write failed");
                    return;
                }
            }
        }
        if let Err(err) = context.write_to_application(&payload).await {
            tracing::warn!(connection_id, error = %err, "client pipe write failed");
        }
    }

    async fn on_client_disconnected(
        &self,
        connection_id: String,
        error_message: Option<String>,
        migration_target: Option<String>,
        buffers: &mut HashMap<String, Vec<Bytes>>,
    ) {
        // Buffered partials must never survive into a reused id.
        buffers.remove(&connection_id);
        let Some(context) = self
            .clients
            .get(&connection_id)
            .map(|entry| Arc::clone(entry.value()))
        else {
            tracing::debug!(connection_id, "close for unknown client dropped");
            return;
        };
        if let Some(target) = migration_target {
            tracing::info!(connection_id, target, "client migrating to another server");
            // Input stops here; pending output still drains to the new
            // target, and the transport is not told to close.
            context.mark_migrated();
            context.complete_incoming().await;
            return;
        }
        if let Some(message) = error_message {
            tracing::debug!(connection_id, message, "client closed with error");
        }
        self.perform_disconnect(&context, false).await;
    }

    async fn handle_ping(&self, messages: &[String]) {
        match ping::classify(messages) {
            ping::PingKind::Empty => {
                // Keepalive echo.
                let _ = self
                    .send_message(ServiceMessage::Ping {
                        messages: Vec::new(),
                    })
                    .await;
            }
            ping::PingKind::GetServers => {
                let mut servers: Vec<String> = {
                    let known = self.env.known_servers.lock();
                    known.iter().cloned().collect()
                };
                servers.push(self.env.server_id.to_string());
                servers.sort();
                servers.dedup();
                let _ = self.send_message(ping::servers_ping(&servers)).await;
            }
            ping::PingKind::Servers(ids) => {
                let own = self.env.server_id.to_string();
                let mut known = self.env.known_servers.lock();
                known.extend(ids.into_iter().filter(|id| *id != own));
            }
            ping::PingKind::Offline(instance_id) => {
                tracing::info!(instance_id, "service instance offline");
                self.env.invocations.cleanup_by_instance(&instance_id);
            }
            ping::PingKind::Status { .. } => {
                // Server-side counters are reported, not consumed, here.
            }
            ping::PingKind::Unknown => {
                tracing::debug!("unrecognized ping payload dropped");
            }
        }
    }
}

impl std::fmt::Debug for ServiceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConnection")
            .field("connection_id", &self.connection_id)
            .field("status", &self.current_status())
            .field("clients", &self.clients.len())
            .finish_non_exhaustive()
    }
}

/// Run one connection to completion: establish with bounded backoff, pump
/// the session, clean up, and leave a terminal status for the container.
pub(crate) async fn run_connection(connection: Arc<ServiceConnection>, target: Option<String>) {
    connection.set_status(ConnectionStatus::Connecting);
    let mut attempt = 0usize;
    let stream = loop {
        if connection.shutdown.is_cancelled() {
            connection.set_status(ConnectionStatus::Closed);
            return;
        }
        attempt += 1;
        match connection.connect_once(target.as_deref()).await {
            Ok(stream) => break stream,
            Err(err) => {
                if attempt >= connection.env.config.connect_retry_limit {
                    tracing::warn!(
                        connection_id = %connection.connection_id,
                        endpoint = %connection.env.endpoint.base_url(),
                        error = %err,
                        "service connection failed to connect; giving up"
                    );
                    connection.set_status(ConnectionStatus::Disconnected);
                    return;
                }
                let backoff = connection.env.config.reconnect_backoff(attempt);
                tracing::warn!(
                    connection_id = %connection.connection_id,
                    error = %err,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "service connection connect failed; retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = connection.shutdown.cancelled() => {
                        connection.set_status(ConnectionStatus::Closed);
                        return;
                    }
                }
            }
        }
    };
    connection.set_status(ConnectionStatus::Connected);
    tracing::info!(
        connection_id = %connection.connection_id,
        index = connection.index,
        endpoint = %connection.env.endpoint.base_url(),
        hub = %connection.env.hub,
        "service connection established"
    );

    run_session(&connection, stream).await;

    // Transport gone: every surviving client is torn down; the application
    // side is always awaited so disconnect hooks run exactly once.
    let contexts = connection.client_snapshot();
    for context in contexts {
        connection.perform_disconnect(&context, false).await;
    }

    if connection.shutdown.is_cancelled() {
        connection.set_status(ConnectionStatus::Closed);
    } else {
        connection.set_status(ConnectionStatus::Disconnected);
    }
}

async fn run_session(connection: &Arc<ServiceConnection>, stream: BoxedStream) {
    let (mut reader, writer) = tokio::io::split(stream);
    let (out_tx, out_rx) = mpsc::channel(OUTGOING_QUEUE_DEPTH);
    *connection.outgoing.lock() = Some(out_tx.clone());
    let writer_task = tokio::spawn(run_writer(writer, out_rx));
    let keepalive_task = tokio::spawn(run_keepalive(Arc::clone(connection), out_tx));

    // Owned by this task alone; mutated only between suspension points.
    let mut buffers: HashMap<String, Vec<Bytes>> = HashMap::new();
    let mut scratch = BytesMut::with_capacity(FRAME_SCRATCH_CAPACITY);
    let service_timeout = connection.env.config.service_timeout();
    let max_frame_bytes = connection.env.config.max_frame_bytes;
    let mut deadline = tokio::time::Instant::now() + service_timeout;

    loop {
        tokio::select! {
            _ = connection.shutdown.cancelled() => {
                tracing::debug!(connection_id = %connection.connection_id, "shutdown requested");
                break;
            }
            result = frame_io::read_message(&mut reader, &mut scratch, max_frame_bytes) => {
                match result {
                    Ok(Some(message)) => {
                        deadline = tokio::time::Instant::now() + service_timeout;
                        if let Err(err) = dispatch(connection, message, &mut buffers).await {
                            tracing::warn!(
                                connection_id = %connection.connection_id,
                                error = %err,
                                "dispatch failed; faulting connection"
                            );
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::info!(
                            connection_id = %connection.connection_id,
                            "service connection closed by peer"
                        );
                        break;
                    }
                    Err(err) => {
                        // Malformed frames fault the connection, never a
                        // silent drop.
                        tracing::warn!(
                            connection_id = %connection.connection_id,
                            error = %err,
                            "malformed frame; faulting connection"
                        );
                        break;
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!(
                    connection_id = %connection.connection_id,
                    "service timeout: nothing received; faulting connection"
                );
                break;
            }
        }
    }

    // Cleared before any await on the teardown path so a reused id can
    // never observe stale partial data.
    buffers.clear();
    *connection.outgoing.lock() = None;
    keepalive_task.abort();
    writer_task.abort();
}

/// Single exhaustive dispatch over the closed control-message union.
async fn dispatch(
    connection: &Arc<ServiceConnection>,
    message: ServiceMessage,
    buffers: &mut HashMap<String, Vec<Bytes>>,
) -> anyhow::Result<()> {
    match message {
        ServiceMessage::Ping { messages } => {
            connection.handle_ping(&messages).await;
            Ok(())
        }
        ServiceMessage::OpenConnection {
            connection_id,
            headers,
            query: _,
        } => {
            on_client_connected(connection, connection_id, headers).await;
            Ok(())
        }
        ServiceMessage::CloseConnection {
            connection_id,
            error_message,
            migration_target,
        } => {
            connection
                .on_client_disconnected(connection_id, error_message, migration_target, buffers)
                .await;
            Ok(())
        }
        ServiceMessage::ConnectionData {
            connection_id,
            payload,
            is_partial,
        } => {
            connection
                .on_client_message(connection_id, payload, is_partial, buffers)
                .await;
            Ok(())
        }
        ServiceMessage::ClientInvocation {
            invocation_id,
            connection_id,
            caller_server_id,
        } => {
            connection
                .env
                .invocations
                .add_routing(invocation_id, connection_id, caller_server_id);
            Ok(())
        }
        ServiceMessage::ServiceMapping {
            invocation_id,
            connection_id: _,
            instance_id,
        } => {
            connection
                .env
                .invocations
                .update_mapping(&invocation_id, instance_id);
            Ok(())
        }
        ServiceMessage::ClientCompletion {
            invocation_id,
            connection_id: _,
            caller_server_id: _,
            payload,
        } => {
            if !connection
                .env
                .invocations
                .try_complete(&invocation_id, Ok(payload))
            {
                tracing::debug!(invocation_id, "completion for unknown invocation dropped");
            }
            Ok(())
        }
        ServiceMessage::ErrorCompletion {
            invocation_id,
            connection_id: _,
            caller_server_id: _,
            error,
        } => {
            if !connection
                .env
                .invocations
                .try_complete(&invocation_id, Err(error))
            {
                tracing::debug!(invocation_id, "error completion for unknown invocation dropped");
            }
            Ok(())
        }
        ServiceMessage::ConnectionReconnect { instance_id } => {
            tracing::info!(instance_id, "forced reconnect: dropping instance state");
            connection.env.invocations.cleanup_by_instance(&instance_id);
            Ok(())
        }
        ServiceMessage::Ack {
            ack_id,
            status,
            message,
        } => {
            if !connection.env.acks.complete(ack_id, status, message) {
                tracing::debug!(ack_id, "ack for unknown operation dropped");
            }
            Ok(())
        }
        ServiceMessage::FinAck => {
            let _ = connection.fin_ack.send_replace(true);
            Ok(())
        }
        other @ (ServiceMessage::HandshakeRequest { .. }
        | ServiceMessage::HandshakeResponse { .. }
        | ServiceMessage::JoinGroup { .. }
        | ServiceMessage::LeaveGroup { .. }
        | ServiceMessage::UserJoinGroup { .. }
        | ServiceMessage::UserLeaveGroup { .. }
        | ServiceMessage::UserLeaveAllGroups { .. }
        | ServiceMessage::Broadcast { .. }
        | ServiceMessage::UserData { .. }
        | ServiceMessage::GroupBroadcast { .. }
        | ServiceMessage::Fin { .. }) => {
            // Known kinds that must never arrive server-bound mid-session.
            anyhow::bail!("unexpected server-bound message: {other:?}")
        }
    }
}

async fn on_client_connected(
    connection: &Arc<ServiceConnection>,
    connection_id: String,
    headers: Vec<(String, String)>,
) {
    let instance_id = headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("x-service-instance"))
        .map(|(_, value)| value.clone());
    let context = ClientConnectionContext::new(connection_id.clone(), instance_id);
    if let Err(err) = connection.env.registry.insert(Arc::clone(&context)) {
        tracing::warn!(connection_id, error = %err, "duplicate open dropped");
        return;
    }
    connection
        .clients
        .insert(connection_id.clone(), Arc::clone(&context));
    tracing::debug!(connection_id, "client connection opened");

    // The hosted application runs as its own task; its completion drives
    // shutdown ordering through the lifetime token.
    let delegate = Arc::clone(&connection.env.delegate);
    let app_context = Arc::clone(&context);
    tokio::spawn(async move {
        if let Err(err) = delegate.on_connected(Arc::clone(&app_context)).await {
            tracing::warn!(
                connection_id = %app_context.connection_id(),
                error = %err,
                "application task failed"
            );
        }
        app_context.complete_lifetime();
    });

    tokio::spawn(bridge::run_client_bridge(Arc::clone(connection), context));
}

async fn run_writer(
    mut writer: WriteHalf<BoxedStream>,
    mut out_rx: mpsc::Receiver<ServiceMessage>,
) {
    while let Some(message) = out_rx.recv().await {
        match frame_io::write_message(&mut writer, &message).await {
            Ok(()) => {}
            Err(frame_io::WriteError::Encode(err)) => {
                // One bad message never takes the connection down.
                tracing::warn!(error = %err, "message encode failed; dropped");
                metrics::counter!("relay_messages_dropped_total").increment(1);
            }
            Err(frame_io::WriteError::Io(err)) => {
                tracing::warn!(error = %err, "service connection write failed");
                break;
            }
        }
    }
}

async fn run_keepalive(connection: Arc<ServiceConnection>, out_tx: mpsc::Sender<ServiceMessage>) {
    let mut interval = tokio::time::interval(connection.env.config.keep_alive_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let bridged = connection.clients.len();
        let total = connection.env.registry.len();
        if out_tx.send(ping::status_ping(bridged, total)).await.is_err() {
            break;
        }
    }
}
