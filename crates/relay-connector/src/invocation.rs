// Routing table for in-flight client invocations.
//
// Two producers feed this table: `ClientInvocation` control messages (a
// remote caller server expects a result from a client we host) and local
// callers registering their own expectation. Entries die on completion,
// error, connection cleanup, or caller-instance cleanup — whichever comes
// first.
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;

pub type InvocationResult = std::result::Result<Bytes, String>;

struct PendingInvocation {
    connection_id: String,
    caller_server_id: String,
    // Service instance currently mapped to this invocation, when known.
    instance_id: Option<String>,
    // Present only for locally registered invocations.
    result: Option<oneshot::Sender<InvocationResult>>,
}

#[derive(Default)]
pub struct InvocationRouter {
    pending: DashMap<String, PendingInvocation>,
}

impl InvocationRouter {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    /// Record that a remote caller server expects a result from one of our
    /// clients.
    pub fn add_routing(
        &self,
        invocation_id: impl Into<String>,
        connection_id: impl Into<String>,
        caller_server_id: impl Into<String>,
    ) {
        self.pending.insert(
            invocation_id.into(),
            PendingInvocation {
                connection_id: connection_id.into(),
                caller_server_id: caller_server_id.into(),
                instance_id: None,
                result: None,
            },
        );
    }

    /// Register a locally initiated invocation and return the result future.
    pub fn add_local_invocation(
        &self,
        invocation_id: impl Into<String>,
        connection_id: impl Into<String>,
        caller_server_id: impl Into<String>,
    ) -> oneshot::Receiver<InvocationResult> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            invocation_id.into(),
            PendingInvocation {
                connection_id: connection_id.into(),
                caller_server_id: caller_server_id.into(),
                instance_id: None,
                result: Some(tx),
            },
        );
        rx
    }

    /// Service-side routing update for an in-flight invocation.
    pub fn update_mapping(&self, invocation_id: &str, instance_id: impl Into<String>) {
        if let Some(mut entry) = self.pending.get_mut(invocation_id) {
            entry.instance_id = Some(instance_id.into());
        } else {
            tracing::debug!(invocation_id, "mapping for unknown invocation dropped");
        }
    }

    /// Resolve an invocation from a completion or error message. Returns
    /// false for unknown ids (already cleaned up or completed).
    pub fn try_complete(&self, invocation_id: &str, result: InvocationResult) -> bool {
        match self.pending.remove(invocation_id) {
            Some((_, entry)) => {
                if let Some(tx) = entry.result {
                    let _ = tx.send(result);
                }
                true
            }
            None => false,
        }
    }

    /// Drop every entry tied to a disconnecting client connection.
    pub fn cleanup_by_connection(&self, connection_id: &str) {
        self.fail_matching("connection closed", |entry| {
            entry.connection_id == connection_id
        });
    }

    /// Drop every entry whose caller instance went offline.
    pub fn cleanup_by_instance(&self, instance_id: &str) {
        self.fail_matching("service instance offline", |entry| {
            entry.caller_server_id == instance_id
                || entry.instance_id.as_deref() == Some(instance_id)
        });
    }

    fn fail_matching(&self, reason: &str, matches: impl Fn(&PendingInvocation) -> bool) {
        // Collect first: removing while a caller inserts concurrently is
        // fine, but we must not hold shard locks across the sends.
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| matches(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();
        for invocation_id in ids {
            if let Some((_, entry)) = self.pending.remove(&invocation_id) {
                if let Some(tx) = entry.result {
                    let _ = tx.send(Err(reason.to_string()));
                }
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
