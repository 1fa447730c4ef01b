// Process-wide registry of locally terminated client connections.
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

use crate::client::ClientConnectionContext;
use crate::error::{ConnectorError, Result};

/// Connection-id → context map shared by every service connection of a
/// hub-server instance.
///
/// Invariant: an id maps to at most one context at any time. Insert detects
/// duplicates; removal is idempotent and returns the context exactly once.
#[derive(Default)]
pub struct ClientConnectionRegistry {
    connections: DashMap<String, Arc<ClientConnectionContext>>,
}

impl ClientConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, context: Arc<ClientConnectionContext>) -> Result<()> {
        let id = context.connection_id().to_string();
        match self.connections.entry(id) {
            Entry::Occupied(entry) => Err(ConnectorError::DuplicateConnection(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(context);
                metrics::gauge!("relay_client_connections").set(self.connections.len() as f64);
                Ok(())
            }
        }
    }

    pub fn remove(&self, connection_id: &str) -> Option<Arc<ClientConnectionContext>> {
        let removed = self
            .connections
            .remove(connection_id)
            .map(|(_, context)| context);
        if removed.is_some() {
            metrics::gauge!("relay_client_connections").set(self.connections.len() as f64);
        }
        removed
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<ClientConnectionContext>> {
        self.connections
            .get(connection_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
