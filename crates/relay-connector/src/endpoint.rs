// Endpoint identity, credentials, and hub-scoped endpoint handles.
use jsonwebtoken::{EncodingKey, Header};
use relay_common::ids::EndpointId;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use url::Url;

use crate::error::{ConnectorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Primary,
    Secondary,
}

/// Shared-secret credential for one endpoint.
///
/// The core only ever asks for current signing material; token shape and
/// rotation live here.
#[derive(Clone)]
pub struct AccessKey {
    secret: String,
}

#[derive(Debug, Serialize)]
struct TokenClaims {
    aud: String,
    iat: u64,
    exp: u64,
}

impl AccessKey {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Issue a short-lived bearer token for the given audience URL.
    pub fn sign(&self, audience: &str, lifetime: Duration) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|err| ConnectorError::Config(format!("system clock: {err}")))?
            .as_secs();
        let claims = TokenClaims {
            aud: audience.to_string(),
            iat: now,
            exp: now + lifetime.as_secs().max(1),
        };
        jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|err| ConnectorError::Config(format!("sign access token: {err}")))
    }
}

impl std::fmt::Debug for AccessKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret.
        f.debug_struct("AccessKey").finish_non_exhaustive()
    }
}

/// One backend service endpoint: identity, credential, derived URLs, and
/// mutable health flags.
///
/// Identity (URL, kind, name) is fixed at construction; only `online` and
/// `is_active` change afterwards, driven by health signals.
pub struct ServiceEndpoint {
    id: EndpointId,
    name: String,
    kind: EndpointKind,
    base_url: String,
    access_key: AccessKey,
    online: AtomicBool,
    is_active: AtomicBool,
}

impl ServiceEndpoint {
    pub fn new(
        base_url: &str,
        kind: EndpointKind,
        name: impl Into<String>,
        access_key: AccessKey,
    ) -> Result<Arc<Self>> {
        let url = Url::parse(base_url)
            .map_err(|err| ConnectorError::Config(format!("endpoint url {base_url}: {err}")))?;
        if url.host_str().is_none() {
            return Err(ConnectorError::Config(format!(
                "endpoint url missing host: {base_url}"
            )));
        }
        // Normalize away any trailing slash so identity comparisons hold.
        let normalized = url.as_str().trim_end_matches('/').to_string();
        Ok(Arc::new(Self {
            id: EndpointId::new(),
            name: name.into(),
            kind,
            base_url: normalized,
            access_key,
            online: AtomicBool::new(false),
            is_active: AtomicBool::new(true),
        }))
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL clients connect to for a hub.
    pub fn client_endpoint(&self, hub: &str) -> String {
        format!("{}/client/?hub={hub}", self.base_url)
    }

    /// URL app servers connect to for a hub.
    pub fn server_endpoint(&self, hub: &str) -> String {
        format!("{}/server/?hub={hub}", self.base_url)
    }

    pub fn access_key(&self) -> &AccessKey {
        &self.access_key
    }

    pub fn online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.is_active.store(active, Ordering::Release);
    }
}

impl std::fmt::Debug for ServiceEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceEndpoint")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("online", &self.online())
            .finish_non_exhaustive()
    }
}

/// Readiness handle completed once a freshly added endpoint's connections
/// reach ready state. Callers staging an endpoint change await this before
/// routing new traffic there.
#[derive(Debug, Clone)]
pub struct ScaleReady {
    tx: Arc<watch::Sender<bool>>,
}

impl ScaleReady {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::channel(false).0),
        }
    }

    pub fn complete(&self) {
        let _ = self.tx.send_replace(true);
    }

    pub fn is_complete(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // wait_for returns early if already complete.
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

impl Default for ScaleReady {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared endpoint scoped to one hub, with a stable per-router index.
#[derive(Debug)]
pub struct HubServiceEndpoint {
    endpoint: Arc<ServiceEndpoint>,
    hub: String,
    index: usize,
    scale: ScaleReady,
}

impl HubServiceEndpoint {
    pub fn new(endpoint: Arc<ServiceEndpoint>, hub: impl Into<String>, index: usize) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            hub: hub.into(),
            index,
            scale: ScaleReady::new(),
        })
    }

    pub fn endpoint(&self) -> &Arc<ServiceEndpoint> {
        &self.endpoint
    }

    pub fn hub(&self) -> &str {
        &self.hub
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn scale(&self) -> &ScaleReady {
        &self.scale
    }
}
