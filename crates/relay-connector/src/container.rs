//! Pool manager owning N service connections for one (hub, endpoint).
use futures::future::join_all;
use parking_lot::Mutex;
use relay_common::GracefulShutdownMode;
use relay_common::ids::ServerId;
use relay_transport::TransportFactory;
use relay_wire::{ServiceMessage, ping};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ack::AckTracker;
use crate::client::ConnectionDelegate;
use crate::config::ConnectorConfig;
use crate::connection::{ConnectionEnv, ConnectionStatus, ServiceConnection, run_connection};
use crate::endpoint::HubServiceEndpoint;
use crate::error::{ConnectorError, Result};
use crate::invocation::InvocationRouter;
use crate::registry::ClientConnectionRegistry;

/// Container lifecycle is monotonic; transitions never regress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContainerStatus {
    Inited,
    Connected,
    Offline,
    Disposed,
}

pub struct ServiceConnectionContainer {
    hub_endpoint: Arc<HubServiceEndpoint>,
    env: ConnectionEnv,
    acks: Arc<AckTracker>,
    // Fixed slots; a dead connection is replaced in place.
    connections: Mutex<Vec<Option<Arc<ServiceConnection>>>>,
    // Explicit counter owned here, not a process-wide static.
    connection_index: AtomicUsize,
    write_rr: AtomicUsize,
    status_tx: watch::Sender<ContainerStatus>,
    ready_tx: watch::Sender<bool>,
    shutdown: CancellationToken,
    known_servers: Arc<Mutex<HashSet<String>>>,
    // Reference-counted "get servers" ping timer.
    ping_refs: Mutex<usize>,
    ping_stop_warnings: AtomicUsize,
    ping_task: Mutex<Option<JoinHandle<()>>>,
    slot_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceConnectionContainer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hub_endpoint: Arc<HubServiceEndpoint>,
        server_id: ServerId,
        config: Arc<ConnectorConfig>,
        transport: Arc<dyn TransportFactory>,
        delegate: Arc<dyn ConnectionDelegate>,
        registry: Arc<ClientConnectionRegistry>,
        invocations: Arc<InvocationRouter>,
    ) -> Arc<Self> {
        let acks = AckTracker::new(config.ack_timeout());
        let known_servers = Arc::new(Mutex::new(HashSet::new()));
        let connection_count = config.connection_count;
        let env = ConnectionEnv {
            server_id,
            hub: hub_endpoint.hub().to_string(),
            endpoint: Arc::clone(hub_endpoint.endpoint()),
            config,
            transport,
            delegate,
            registry,
            acks: Arc::clone(&acks),
            invocations,
            known_servers: Arc::clone(&known_servers),
        };
        Arc::new(Self {
            hub_endpoint,
            env,
            acks,
            connections: Mutex::new((0..connection_count).map(|_| None).collect()),
            connection_index: AtomicUsize::new(0),
            write_rr: AtomicUsize::new(0),
            status_tx: watch::channel(ContainerStatus::Inited).0,
            ready_tx: watch::channel(false).0,
            shutdown: CancellationToken::new(),
            known_servers,
            ping_refs: Mutex::new(0),
            ping_stop_warnings: AtomicUsize::new(0),
            ping_task: Mutex::new(None),
            slot_tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn hub_endpoint(&self) -> &Arc<HubServiceEndpoint> {
        &self.hub_endpoint
    }

    pub fn status(&self) -> ContainerStatus {
        *self.status_tx.borrow()
    }

    pub fn status_watch(&self) -> watch::Receiver<ContainerStatus> {
        self.status_tx.subscribe()
    }

    /// Launch every configured connection concurrently.
    pub fn start(self: &Arc<Self>) {
        let count = self.connections.lock().len();
        let mut tasks = self.slot_tasks.lock();
        for slot in 0..count {
            tasks.push(tokio::spawn(run_slot(Arc::clone(self), slot)));
        }
        metrics::gauge!("relay_service_connections").set(count as f64);
    }

    /// Resolves when the first connection reaches `Connected`; from then on
    /// the container can accept client opens.
    pub async fn ready(&self) {
        let mut rx = self.ready_tx.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    fn new_connection(&self) -> Arc<ServiceConnection> {
        let index = self.connection_index.fetch_add(1, Ordering::Relaxed);
        ServiceConnection::new(self.env.clone(), index)
    }

    fn mark_connected(&self) {
        let _ = self.ready_tx.send_replace(true);
        self.advance_status(ContainerStatus::Connected);
        self.hub_endpoint.endpoint().set_online(true);
    }

    // Shutdown has been requested once the container left the serving
    // states; from then on a dead connection is never replaced.
    fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled() || self.status() >= ContainerStatus::Offline
    }

    fn advance_status(&self, next: ContainerStatus) {
        self.status_tx.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
    }

    fn connected_connections(&self) -> Vec<Arc<ServiceConnection>> {
        self.connections
            .lock()
            .iter()
            .flatten()
            .filter(|connection| connection.is_connected())
            .map(Arc::clone)
            .collect()
    }

    fn live_connections(&self) -> Vec<Arc<ServiceConnection>> {
        self.connections
            .lock()
            .iter()
            .flatten()
            .map(Arc::clone)
            .collect()
    }

    pub fn connection_statuses(&self) -> Vec<ConnectionStatus> {
        self.connections
            .lock()
            .iter()
            .flatten()
            .map(|connection| connection.current_status())
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.connected_connections().len()
    }

    pub fn known_servers(&self) -> Vec<String> {
        self.known_servers.lock().iter().cloned().collect()
    }

    /// Write one message through any connected service connection.
    pub async fn write(&self, message: ServiceMessage) -> Result<()> {
        let candidates = self.connected_connections();
        if candidates.is_empty() {
            return Err(ConnectorError::ServiceConnectionNotActive);
        }
        let start = self.write_rr.fetch_add(1, Ordering::Relaxed);
        for offset in 0..candidates.len() {
            let connection = &candidates[(start + offset) % candidates.len()];
            match connection.send_message(message.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::debug!(
                        connection_id = %connection.connection_id(),
                        error = %err,
                        "write candidate rejected; trying next"
                    );
                }
            }
        }
        Err(ConnectorError::ServiceConnectionNotActive)
    }

    /// Write an ack-carrying message and await the matching ack (bounded).
    pub async fn write_with_ack(
        &self,
        build: impl FnOnce(u64) -> ServiceMessage,
    ) -> Result<()> {
        let (ack_id, rx) = self.acks.register();
        if let Err(err) = self.write(build(ack_id)).await {
            // The entry would never resolve; drop it now instead of waiting
            // out the timeout.
            self.acks.discard(ack_id);
            return Err(err);
        }
        self.acks.wait(ack_id, rx).await
    }

    pub async fn add_user_to_group(&self, user_id: &str, group: &str) -> Result<()> {
        self.write_with_ack(|ack_id| ServiceMessage::UserJoinGroup {
            user_id: user_id.to_string(),
            group: group.to_string(),
            ack_id: Some(ack_id),
        })
        .await
    }

    pub async fn remove_user_from_group(&self, user_id: &str, group: &str) -> Result<()> {
        self.write_with_ack(|ack_id| ServiceMessage::UserLeaveGroup {
            user_id: user_id.to_string(),
            group: group.to_string(),
            ack_id: Some(ack_id),
        })
        .await
    }

    pub async fn remove_user_from_all_groups(&self, user_id: &str) -> Result<()> {
        self.write_with_ack(|ack_id| ServiceMessage::UserLeaveAllGroups {
            user_id: user_id.to_string(),
            ack_id: Some(ack_id),
        })
        .await
    }

    pub async fn join_group(&self, connection_id: &str, group: &str) -> Result<()> {
        self.write(ServiceMessage::JoinGroup {
            connection_id: connection_id.to_string(),
            group: group.to_string(),
        })
        .await
    }

    pub async fn leave_group(&self, connection_id: &str, group: &str) -> Result<()> {
        self.write(ServiceMessage::LeaveGroup {
            connection_id: connection_id.to_string(),
            group: group.to_string(),
        })
        .await
    }

    /// Reference-counted start of the shared "get servers" ping timer.
    pub fn start_get_servers_ping(self: &Arc<Self>) {
        let mut refs = self.ping_refs.lock();
        *refs += 1;
        if *refs == 1 {
            let task = tokio::spawn(run_servers_ping(Arc::clone(self)));
            *self.ping_task.lock() = Some(task);
        }
    }

    /// Stop the timer when the last reference is released.
    ///
    /// Stopping when not started logs a warning but never throws: racing
    /// scale operations make a stray stop a real, benign occurrence.
    pub fn stop_get_servers_ping(&self) {
        let mut refs = self.ping_refs.lock();
        if *refs == 0 {
            self.ping_stop_warnings.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                hub = %self.env.hub,
                endpoint = %self.env.endpoint.name(),
                "servers ping timer already stopped"
            );
            return;
        }
        *refs -= 1;
        if *refs == 0
            && let Some(task) = self.ping_task.lock().take()
        {
            task.abort();
        }
    }

    pub fn ping_stop_warnings(&self) -> usize {
        self.ping_stop_warnings.load(Ordering::Relaxed)
    }

    /// Fan the "going offline" signal out to every connection, then wait for
    /// each one's offline acknowledgement (or its timeout).
    pub async fn offline(&self, mode: GracefulShutdownMode) {
        self.advance_status(ContainerStatus::Offline);
        self.hub_endpoint.endpoint().set_online(false);
        let connections = self.live_connections();
        join_all(
            connections
                .iter()
                .map(|connection| connection.offline(mode)),
        )
        .await;
    }

    /// Stop everything: no replacements, terminal statuses preserved.
    pub async fn dispose(&self) {
        self.shutdown.cancel();
        for connection in self.live_connections() {
            connection.stop();
        }
        if let Some(task) = self.ping_task.lock().take() {
            task.abort();
        }
        let tasks: Vec<JoinHandle<()>> = self.slot_tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), task).await;
        }
        self.acks.fail_all("container disposed");
        self.advance_status(ContainerStatus::Disposed);
        metrics::gauge!("relay_service_connections").set(0.0);
    }
}

impl std::fmt::Debug for ServiceConnectionContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConnectionContainer")
            .field("hub", &self.env.hub)
            .field("endpoint", &self.env.endpoint.name())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Supervise one connection slot: run a connection to completion and replace
/// it unless shutdown was requested. The replacement connection carries its
/// own connect backoff, so a dead endpoint does not hot-loop here.
async fn run_slot(container: Arc<ServiceConnectionContainer>, slot: usize) {
    loop {
        if container.is_shutting_down() {
            break;
        }
        let connection = container.new_connection();
        container.connections.lock()[slot] = Some(Arc::clone(&connection));
        if container.is_shutting_down() {
            // A teardown raced the slot; never leave a connection running
            // that dispose() could not see.
            connection.stop();
        }

        let mut status_rx = connection.status();
        let watcher = {
            let container = Arc::clone(&container);
            tokio::spawn(async move {
                if status_rx
                    .wait_for(|status| *status == ConnectionStatus::Connected)
                    .await
                    .is_ok()
                {
                    container.mark_connected();
                }
            })
        };

        run_connection(Arc::clone(&connection), None).await;
        // Detach the status listener exactly once, terminal status stays.
        watcher.abort();

        if container.is_shutting_down() {
            break;
        }
        tracing::warn!(
            slot,
            hub = %container.env.hub,
            endpoint = %container.env.endpoint.name(),
            "service connection dropped; replacing"
        );
    }
}

async fn run_servers_ping(container: Arc<ServiceConnectionContainer>) {
    let mut interval = tokio::time::interval(container.env.config.servers_ping_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        for connection in container.connected_connections() {
            if let Err(err) = connection.send_message(ping::get_servers_ping()).await {
                tracing::debug!(
                    connection_id = %connection.connection_id(),
                    error = %err,
                    "servers ping dropped"
                );
            }
        }
    }
}
