//! Fan-out writer across multiple endpoint containers.
//!
//! Broadcast-style sends are fire-and-forget per endpoint so one unhealthy
//! endpoint cannot fail a broadcast to healthy ones; ack-carrying group
//! operations wait on every endpoint before reporting, with no
//! short-circuit, so ack bookkeeping is never left dangling.
use arc_swap::ArcSwap;
use futures::future::join_all;
use relay_common::GracefulShutdownMode;
use relay_common::ids::ServerId;
use relay_transport::TransportFactory;
use relay_wire::ServiceMessage;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::client::ConnectionDelegate;
use crate::config::ConnectorConfig;
use crate::container::ServiceConnectionContainer;
use crate::endpoint::{EndpointKind, HubServiceEndpoint, ServiceEndpoint};
use crate::error::{ConnectorError, Result};
use crate::invocation::InvocationRouter;
use crate::registry::ClientConnectionRegistry;

pub struct EndpointEntry {
    pub hub_endpoint: Arc<HubServiceEndpoint>,
    pub container: Arc<ServiceConnectionContainer>,
}

pub struct MultiEndpointRouter {
    hub: String,
    server_id: ServerId,
    config: Arc<ConnectorConfig>,
    transport: Arc<dyn TransportFactory>,
    delegate: Arc<dyn ConnectionDelegate>,
    registry: Arc<ClientConnectionRegistry>,
    invocations: Arc<InvocationRouter>,
    // Lock-free snapshot for the send hot path; swapped on scale changes.
    entries: ArcSwap<Vec<Arc<EndpointEntry>>>,
    next_index: AtomicUsize,
}

impl std::fmt::Debug for MultiEndpointRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiEndpointRouter")
            .field("hub", &self.hub)
            .field("server_id", &self.server_id)
            .finish_non_exhaustive()
    }
}

impl MultiEndpointRouter {
    pub fn new(
        hub: impl Into<String>,
        server_id: ServerId,
        endpoints: Vec<Arc<ServiceEndpoint>>,
        config: Arc<ConnectorConfig>,
        transport: Arc<dyn TransportFactory>,
        delegate: Arc<dyn ConnectionDelegate>,
    ) -> Result<Arc<Self>> {
        // The only error class allowed to stop startup: bad configuration.
        if !endpoints
            .iter()
            .any(|endpoint| endpoint.kind() == EndpointKind::Primary)
        {
            return Err(ConnectorError::MissingPrimaryEndpoint);
        }
        if config.connection_count == 0 {
            return Err(ConnectorError::Config(
                "connection_count must be positive".to_string(),
            ));
        }
        let router = Arc::new(Self {
            hub: hub.into(),
            server_id,
            config,
            transport,
            delegate,
            registry: ClientConnectionRegistry::new(),
            invocations: InvocationRouter::new(),
            entries: ArcSwap::from_pointee(Vec::new()),
            next_index: AtomicUsize::new(0),
        });
        for endpoint in endpoints {
            router.push_entry(endpoint);
        }
        Ok(router)
    }

    pub fn hub(&self) -> &str {
        &self.hub
    }

    pub fn registry(&self) -> &Arc<ClientConnectionRegistry> {
        &self.registry
    }

    pub fn invocations(&self) -> &Arc<InvocationRouter> {
        &self.invocations
    }

    pub fn endpoints(&self) -> Vec<Arc<HubServiceEndpoint>> {
        self.entries
            .load()
            .iter()
            .map(|entry| Arc::clone(&entry.hub_endpoint))
            .collect()
    }

    fn push_entry(&self, endpoint: Arc<ServiceEndpoint>) -> Arc<EndpointEntry> {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let hub_endpoint = HubServiceEndpoint::new(endpoint, self.hub.clone(), index);
        let container = ServiceConnectionContainer::new(
            Arc::clone(&hub_endpoint),
            self.server_id,
            Arc::clone(&self.config),
            Arc::clone(&self.transport),
            Arc::clone(&self.delegate),
            Arc::clone(&self.registry),
            Arc::clone(&self.invocations),
        );
        let entry = Arc::new(EndpointEntry {
            hub_endpoint,
            container,
        });
        self.entries.rcu(|entries| {
            let mut next = Vec::with_capacity(entries.len() + 1);
            next.extend(entries.iter().cloned());
            next.push(Arc::clone(&entry));
            next
        });
        entry
    }

    fn spawn_scale_watch(entry: &Arc<EndpointEntry>) {
        let container = Arc::clone(&entry.container);
        let scale = entry.hub_endpoint.scale().clone();
        tokio::spawn(async move {
            container.ready().await;
            scale.complete();
        });
    }

    /// Start every configured endpoint's container.
    pub fn start(&self) {
        for entry in self.entries.load().iter() {
            entry.container.start();
            Self::spawn_scale_watch(entry);
        }
    }

    /// Resolves once every endpoint's container has a connected connection.
    pub async fn ready(&self) {
        let entries = self.entries.load_full();
        join_all(entries.iter().map(|entry| entry.container.ready())).await;
    }

    /// Stage a new endpoint into the set. The returned handle's scale future
    /// completes once its connections are ready; callers await it before
    /// routing new traffic there.
    pub fn add_endpoint(&self, endpoint: Arc<ServiceEndpoint>) -> Arc<HubServiceEndpoint> {
        let entry = self.push_entry(endpoint);
        entry.container.start();
        Self::spawn_scale_watch(&entry);
        tracing::info!(
            hub = %self.hub,
            endpoint = %entry.hub_endpoint.endpoint().name(),
            "endpoint added; scale pending"
        );
        Arc::clone(&entry.hub_endpoint)
    }

    /// Take an endpoint offline (per `mode`), dispose it, and drop it from
    /// the set.
    pub async fn remove_endpoint(&self, name: &str, mode: GracefulShutdownMode) {
        let removed: Option<Arc<EndpointEntry>> = {
            let mut found = None;
            self.entries.rcu(|entries| {
                let mut next = Vec::with_capacity(entries.len());
                for entry in entries.iter() {
                    if entry.hub_endpoint.endpoint().name() == name && found.is_none() {
                        found = Some(Arc::clone(entry));
                    } else {
                        next.push(Arc::clone(entry));
                    }
                }
                next
            });
            found
        };
        match removed {
            Some(entry) => {
                entry.container.offline(mode).await;
                entry.container.dispose().await;
                tracing::info!(hub = %self.hub, endpoint = name, "endpoint removed");
            }
            None => {
                tracing::warn!(hub = %self.hub, endpoint = name, "remove for unknown endpoint");
            }
        }
    }

    fn online_entries(&self) -> Vec<Arc<EndpointEntry>> {
        self.entries
            .load()
            .iter()
            .filter(|entry| entry.hub_endpoint.endpoint().online())
            .cloned()
            .collect()
    }

    fn entries_named(&self, names: &[&str]) -> Vec<Arc<EndpointEntry>> {
        self.entries
            .load()
            .iter()
            .filter(|entry| names.contains(&entry.hub_endpoint.endpoint().name()))
            .cloned()
            .collect()
    }

    /// Fire-and-forget fan-out to every online endpoint. Per-endpoint
    /// failures are logged, never surfaced.
    pub async fn broadcast(&self, message: ServiceMessage) {
        self.write_entries(self.online_entries(), message).await;
    }

    /// Fan-out restricted to an explicitly supplied endpoint subset.
    pub async fn broadcast_to(&self, names: &[&str], message: ServiceMessage) {
        self.write_entries(self.entries_named(names), message).await;
    }

    async fn write_entries(&self, entries: Vec<Arc<EndpointEntry>>, message: ServiceMessage) {
        for entry in entries {
            if let Err(err) = entry.container.write(message.clone()).await {
                tracing::warn!(
                    hub = %self.hub,
                    endpoint = %entry.hub_endpoint.endpoint().name(),
                    error = %err,
                    "broadcast write failed"
                );
            }
        }
    }

    pub async fn send_to_user(&self, user_id: &str, payload: bytes::Bytes) {
        self.broadcast(ServiceMessage::UserData {
            user_id: user_id.to_string(),
            payload,
        })
        .await;
    }

    pub async fn send_to_group(&self, group: &str, payload: bytes::Bytes) {
        self.broadcast(ServiceMessage::GroupBroadcast {
            group: group.to_string(),
            payload,
            excluded: Vec::new(),
        })
        .await;
    }

    pub async fn add_user_to_group(&self, user_id: &str, group: &str) -> Result<()> {
        let entries = self.online_entries();
        let results = join_all(
            entries
                .iter()
                .map(|entry| entry.container.add_user_to_group(user_id, group)),
        )
        .await;
        aggregate(results)
    }

    pub async fn remove_user_from_group(&self, user_id: &str, group: &str) -> Result<()> {
        let entries = self.online_entries();
        let results = join_all(
            entries
                .iter()
                .map(|entry| entry.container.remove_user_from_group(user_id, group)),
        )
        .await;
        aggregate(results)
    }

    pub async fn remove_user_from_all_groups(&self, user_id: &str) -> Result<()> {
        let entries = self.online_entries();
        let results = join_all(
            entries
                .iter()
                .map(|entry| entry.container.remove_user_from_all_groups(user_id)),
        )
        .await;
        aggregate(results)
    }

    pub async fn offline(&self, mode: GracefulShutdownMode) {
        let entries = self.entries.load_full();
        join_all(entries.iter().map(|entry| entry.container.offline(mode))).await;
    }

    pub async fn dispose(&self) {
        let entries = self.entries.load_full();
        for entry in entries.iter() {
            entry.container.dispose().await;
        }
    }
}

// All endpoint futures have already resolved (join_all is the barrier);
// surface the first failure, if any.
fn aggregate(results: Vec<Result<()>>) -> Result<()> {
    results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
}
