// Correlation of group/user management operations with service acks.
use dashmap::DashMap;
use relay_wire::AckStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::{ConnectorError, Result};

/// Pending-ack table with bounded-lifetime entries.
///
/// Every ack-carrying operation registers a fresh correlation id and waits
/// on its receiver; the matching `Ack` message resolves it, a timeout fails
/// it, and `fail_all` sweeps the table when the owning container is torn
/// down (no entry outlives its owner's cleanup).
pub struct AckTracker {
    next_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<(AckStatus, Option<String>)>>,
    timeout: Duration,
}

impl AckTracker {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(0),
            pending: DashMap::new(),
            timeout,
        })
    }

    /// Mint a correlation id and register its pending entry.
    pub fn register(&self) -> (u64, oneshot::Receiver<(AckStatus, Option<String>)>) {
        let ack_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(ack_id, tx);
        (ack_id, rx)
    }

    /// Resolve a pending entry from a received ack. Unknown ids are stale
    /// (already timed out or cleaned up) and are reported to the caller.
    pub fn complete(&self, ack_id: u64, status: AckStatus, message: Option<String>) -> bool {
        match self.pending.remove(&ack_id) {
            Some((_, tx)) => tx.send((status, message)).is_ok(),
            None => false,
        }
    }

    /// Await the ack for a registered id, bounded by the tracker timeout.
    pub async fn wait(
        &self,
        ack_id: u64,
        rx: oneshot::Receiver<(AckStatus, Option<String>)>,
    ) -> Result<()> {
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok((AckStatus::Ok, _))) => Ok(()),
            Ok(Ok((status, message))) => Err(ConnectorError::AckFailed {
                ack_id,
                message: message.unwrap_or_else(|| format!("service reported {status:?}")),
            }),
            Ok(Err(_)) => Err(ConnectorError::AckFailed {
                ack_id,
                message: "connection closed".to_string(),
            }),
            Err(_) => {
                // Expired entries are removed here so the table stays bounded.
                self.pending.remove(&ack_id);
                metrics::counter!("relay_acks_timeout_total").increment(1);
                Err(ConnectorError::AckTimeout {
                    ack_id,
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Drop a registered entry whose operation was never sent.
    pub fn discard(&self, ack_id: u64) {
        self.pending.remove(&ack_id);
    }

    /// Fail every pending entry; called on owner teardown.
    pub fn fail_all(&self, reason: &str) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for ack_id in ids {
            if let Some((_, tx)) = self.pending.remove(&ack_id) {
                let _ = tx.send((AckStatus::NotFound, Some(reason.to_string())));
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ack_resolves_wait() {
        let tracker = AckTracker::new(Duration::from_secs(5));
        let (ack_id, rx) = tracker.register();
        assert!(tracker.complete(ack_id, AckStatus::Ok, None));
        tracker.wait(ack_id, rx).await.expect("resolved");
        assert_eq!(tracker.pending_len(), 0);
    }

    #[tokio::test]
    async fn failed_ack_carries_service_message() {
        let tracker = AckTracker::new(Duration::from_secs(5));
        let (ack_id, rx) = tracker.register();
        tracker.complete(ack_id, AckStatus::NotFound, Some("unknown user".to_string()));
        let err = tracker.wait(ack_id, rx).await.expect_err("failed");
        assert!(matches!(
            err,
            ConnectorError::AckFailed { message, .. } if message == "unknown user"
        ));
    }

    #[tokio::test]
    async fn timeout_fails_and_removes_entry() {
        let tracker = AckTracker::new(Duration::from_millis(20));
        let (ack_id, rx) = tracker.register();
        let err = tracker.wait(ack_id, rx).await.expect_err("timeout");
        assert!(matches!(err, ConnectorError::AckTimeout { .. }));
        assert_eq!(tracker.pending_len(), 0);
        // A late ack for the expired id is reported stale.
        assert!(!tracker.complete(ack_id, AckStatus::Ok, None));
    }

    #[tokio::test]
    async fn fail_all_resolves_every_waiter() {
        let tracker = AckTracker::new(Duration::from_secs(5));
        let (a, rx_a) = tracker.register();
        let (b, rx_b) = tracker.register();
        assert_ne!(a, b);
        tracker.fail_all("container disposed");
        assert!(tracker.wait(a, rx_a).await.is_err());
        assert!(tracker.wait(b, rx_b).await.is_err());
        assert_eq!(tracker.pending_len(), 0);
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let tracker = AckTracker::new(Duration::from_secs(5));
        let (first, _rx_a) = tracker.register();
        let (second, _rx_b) = tracker.register();
        assert!(second > first);
    }
}
