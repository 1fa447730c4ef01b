// Locally terminated client connections and the hosted-application seam.
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

const CLIENT_PIPE_CAPACITY: usize = 256 * 1024;

/// The hosted application pipeline, invoked once per client connection.
///
/// `on_connected` owns the application side of the pipe for the connection's
/// lifetime; its completion participates in shutdown sequencing.
#[async_trait]
pub trait ConnectionDelegate: Send + Sync {
    async fn on_connected(&self, connection: Arc<ClientConnectionContext>) -> anyhow::Result<()>;
}

/// A client connection bridged to exactly one service connection at a time.
///
/// The duplex pipe has two ends: the application side, taken once by the
/// hosted dispatcher, and the service side, split between the receive loop
/// (which writes inbound payloads) and the bridge pump (which reads
/// outbound data).
pub struct ClientConnectionContext {
    connection_id: String,
    instance_id: Option<String>,
    migrated: AtomicBool,
    finalized: AtomicBool,
    application: Mutex<Option<DuplexStream>>,
    service_read: Mutex<Option<ReadHalf<DuplexStream>>>,
    service_write: tokio::sync::Mutex<Option<WriteHalf<DuplexStream>>>,
    // Cancelled when the hosted application's task has fully completed.
    lifetime: CancellationToken,
    // Cancelled to stop the outgoing pump promptly (hub-triggered abort or
    // service-initiated disconnect).
    abort: CancellationToken,
}

impl ClientConnectionContext {
    pub fn new(connection_id: impl Into<String>, instance_id: Option<String>) -> Arc<Self> {
        let (application, service) = tokio::io::duplex(CLIENT_PIPE_CAPACITY);
        let (service_read, service_write) = tokio::io::split(service);
        Arc::new(Self {
            connection_id: connection_id.into(),
            instance_id,
            migrated: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            application: Mutex::new(Some(application)),
            service_read: Mutex::new(Some(service_read)),
            service_write: tokio::sync::Mutex::new(Some(service_write)),
            lifetime: CancellationToken::new(),
            abort: CancellationToken::new(),
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    /// The application side of the pipe; yields once, to the dispatcher.
    pub fn take_application_stream(&self) -> Option<DuplexStream> {
        self.application.lock().take()
    }

    pub(crate) fn take_service_read(&self) -> Option<ReadHalf<DuplexStream>> {
        self.service_read.lock().take()
    }

    /// Relay an inbound service payload to the application.
    pub(crate) async fn write_to_application(&self, payload: &Bytes) -> std::io::Result<()> {
        let mut guard = self.service_write.lock().await;
        match guard.as_mut() {
            Some(write) => write.write_all(payload).await,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "client input already completed",
            )),
        }
    }

    /// Complete the inbound side: the application observes EOF, no further
    /// service data is relayed. Idempotent.
    pub(crate) async fn complete_incoming(&self) {
        let write = self.service_write.lock().await.take();
        if let Some(mut write) = write {
            let _ = write.shutdown().await;
        }
    }

    /// Marks this connection as handed to another server: the transport is
    /// not aborted and no close is reported back to the service.
    pub(crate) fn mark_migrated(&self) {
        self.migrated.store(true, Ordering::Release);
    }

    pub fn is_migrated(&self) -> bool {
        self.migrated.load(Ordering::Acquire)
    }

    // First caller wins; later disconnect paths become no-ops.
    pub(crate) fn begin_finalize(&self) -> bool {
        !self.finalized.swap(true, Ordering::AcqRel)
    }

    /// Stop the outgoing pump promptly. Observable from the bridge task.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    pub(crate) fn aborted(&self) -> &CancellationToken {
        &self.abort
    }

    pub(crate) fn complete_lifetime(&self) {
        self.lifetime.cancel();
    }

    pub(crate) fn lifetime(&self) -> &CancellationToken {
        &self.lifetime
    }

    /// Resolves once the hosted application's task has fully completed.
    pub async fn wait_completed(&self) {
        self.lifetime.cancelled().await;
    }
}

impl std::fmt::Debug for ClientConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnectionContext")
            .field("connection_id", &self.connection_id)
            .field("migrated", &self.is_migrated())
            .finish_non_exhaustive()
    }
}
