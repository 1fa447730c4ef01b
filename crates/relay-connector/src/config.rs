// Connector defaults and configuration overrides.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

pub(crate) const OUTGOING_QUEUE_DEPTH: usize = 1024;
pub(crate) const FRAME_SCRATCH_CAPACITY: usize = 64 * 1024;
pub(crate) const BRIDGE_READ_CAPACITY: usize = 8 * 1024;

pub(crate) const DEFAULT_CONNECTION_COUNT: usize = 5;
pub(crate) const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 30_000;
pub(crate) const DEFAULT_ACK_TIMEOUT_MS: u64 = 30_000;
pub(crate) const DEFAULT_OFFLINE_TIMEOUT_MS: u64 = 30_000;
pub(crate) const DEFAULT_APP_COMPLETE_TIMEOUT_MS: u64 = 5_000;
pub(crate) const DEFAULT_KEEP_ALIVE_INTERVAL_MS: u64 = 5_000;
pub(crate) const DEFAULT_SERVICE_TIMEOUT_MS: u64 = 30_000;
pub(crate) const DEFAULT_SERVERS_PING_INTERVAL_MS: u64 = 5_000;
pub(crate) const DEFAULT_CONNECT_RETRY_LIMIT: usize = 10;
pub(crate) const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 1_000;
pub(crate) const DEFAULT_RECONNECT_BACKOFF_MAX_MS: u64 = 60_000;
pub(crate) const DEFAULT_TOKEN_LIFETIME_MS: u64 = 3_600_000;

/// Hard safety cap for any single control frame.
///
/// The receive loop allocates a buffer sized by the frame header's length
/// field; without a cap a bad peer can advertise an enormous length and
/// trigger OOM. Override with `RELAY_MAX_FRAME_BYTES`.
pub(crate) const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Service connections per (hub, endpoint) pair.
    pub connection_count: usize,
    /// Drain budget for a client whose application completed first.
    pub close_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub offline_timeout_ms: u64,
    /// Bounded wait for the hosted application's lifetime task.
    pub app_complete_timeout_ms: u64,
    pub keep_alive_interval_ms: u64,
    /// Fault the connection when nothing was received for this long.
    pub service_timeout_ms: u64,
    pub servers_ping_interval_ms: u64,
    pub connect_retry_limit: usize,
    pub reconnect_backoff_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    pub token_lifetime_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connection_count: DEFAULT_CONNECTION_COUNT,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            offline_timeout_ms: DEFAULT_OFFLINE_TIMEOUT_MS,
            app_complete_timeout_ms: DEFAULT_APP_COMPLETE_TIMEOUT_MS,
            keep_alive_interval_ms: DEFAULT_KEEP_ALIVE_INTERVAL_MS,
            service_timeout_ms: DEFAULT_SERVICE_TIMEOUT_MS,
            servers_ping_interval_ms: DEFAULT_SERVERS_PING_INTERVAL_MS,
            connect_retry_limit: DEFAULT_CONNECT_RETRY_LIMIT,
            reconnect_backoff_ms: DEFAULT_RECONNECT_BACKOFF_MS,
            reconnect_backoff_max_ms: DEFAULT_RECONNECT_BACKOFF_MAX_MS,
            token_lifetime_ms: DEFAULT_TOKEN_LIFETIME_MS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ConnectorConfigOverride {
    connection_count: Option<usize>,
    close_timeout_ms: Option<u64>,
    ack_timeout_ms: Option<u64>,
    offline_timeout_ms: Option<u64>,
    app_complete_timeout_ms: Option<u64>,
    keep_alive_interval_ms: Option<u64>,
    service_timeout_ms: Option<u64>,
    servers_ping_interval_ms: Option<u64>,
    connect_retry_limit: Option<usize>,
    reconnect_backoff_ms: Option<u64>,
    reconnect_backoff_max_ms: Option<u64>,
    token_lifetime_ms: Option<u64>,
    max_frame_bytes: Option<usize>,
}

impl ConnectorConfig {
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("RELAY_CONNECTOR_CONFIG").ok());
        let contents = match override_path.as_deref() {
            Some(path) => match fs::read_to_string(path) {
                Ok(contents) => Some(contents),
                Err(err) => {
                    return Err(err).with_context(|| format!("read connector config: {path}"));
                }
            },
            None => None,
        };
        if let Some(contents) = contents {
            let override_cfg: ConnectorConfigOverride =
                serde_yaml::from_str(&contents).context("parse connector config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = read_usize_env("RELAY_CONNECTION_COUNT") {
            config.connection_count = value;
        }
        if let Some(value) = read_u64_env("RELAY_CLOSE_TIMEOUT_MS") {
            config.close_timeout_ms = value;
        }
        if let Some(value) = read_u64_env("RELAY_ACK_TIMEOUT_MS") {
            config.ack_timeout_ms = value;
        }
        if let Some(value) = read_u64_env("RELAY_OFFLINE_TIMEOUT_MS") {
            config.offline_timeout_ms = value;
        }
        if let Some(value) = read_u64_env("RELAY_APP_COMPLETE_TIMEOUT_MS") {
            config.app_complete_timeout_ms = value;
        }
        if let Some(value) = read_u64_env("RELAY_KEEP_ALIVE_INTERVAL_MS") {
            config.keep_alive_interval_ms = value;
        }
        if let Some(value) = read_u64_env("RELAY_SERVICE_TIMEOUT_MS") {
            config.service_timeout_ms = value;
        }
        if let Some(value) = read_u64_env("RELAY_SERVERS_PING_INTERVAL_MS") {
            config.servers_ping_interval_ms = value;
        }
        if let Some(value) = read_usize_env("RELAY_CONNECT_RETRY_LIMIT") {
            config.connect_retry_limit = value;
        }
        if let Some(value) = read_u64_env("RELAY_RECONNECT_BACKOFF_MS") {
            config.reconnect_backoff_ms = value;
        }
        if let Some(value) = read_u64_env("RELAY_RECONNECT_BACKOFF_MAX_MS") {
            config.reconnect_backoff_max_ms = value;
        }
        if let Some(value) = read_u64_env("RELAY_TOKEN_LIFETIME_MS") {
            config.token_lifetime_ms = value;
        }
        if let Some(value) = read_usize_env("RELAY_MAX_FRAME_BYTES") {
            config.max_frame_bytes = value;
        }
        config
    }

    pub(crate) fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub(crate) fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub(crate) fn offline_timeout(&self) -> Duration {
        Duration::from_millis(self.offline_timeout_ms)
    }

    pub(crate) fn app_complete_timeout(&self) -> Duration {
        Duration::from_millis(self.app_complete_timeout_ms)
    }

    pub(crate) fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub(crate) fn service_timeout(&self) -> Duration {
        Duration::from_millis(self.service_timeout_ms)
    }

    pub(crate) fn servers_ping_interval(&self) -> Duration {
        Duration::from_millis(self.servers_ping_interval_ms)
    }

    pub(crate) fn token_lifetime(&self) -> Duration {
        Duration::from_millis(self.token_lifetime_ms)
    }

    // Exponential backoff with a deterministic per-attempt stagger so
    // replaced connections do not reconnect in lockstep.
    pub(crate) fn reconnect_backoff(&self, attempt: usize) -> Duration {
        let shift = attempt.min(16) as u32;
        let base = self
            .reconnect_backoff_ms
            .saturating_mul(1u64 << shift.saturating_sub(1));
        let capped = base.min(self.reconnect_backoff_max_ms);
        let jitter = (attempt as u64).wrapping_mul(137) % 500;
        Duration::from_millis(capped + jitter)
    }
}

impl ConnectorConfigOverride {
    fn apply(&self, config: &mut ConnectorConfig) {
        if let Some(value) = self.connection_count
            && value > 0
        {
            config.connection_count = value;
        }
        if let Some(value) = self.close_timeout_ms
            && value > 0
        {
            config.close_timeout_ms = value;
        }
        if let Some(value) = self.ack_timeout_ms
            && value > 0
        {
            config.ack_timeout_ms = value;
        }
        if let Some(value) = self.offline_timeout_ms
            && value > 0
        {
            config.offline_timeout_ms = value;
        }
        if let Some(value) = self.app_complete_timeout_ms
            && value > 0
        {
            config.app_complete_timeout_ms = value;
        }
        if let Some(value) = self.keep_alive_interval_ms
            && value > 0
        {
            config.keep_alive_interval_ms = value;
        }
        if let Some(value) = self.service_timeout_ms
            && value > 0
        {
            config.service_timeout_ms = value;
        }
        if let Some(value) = self.servers_ping_interval_ms
            && value > 0
        {
            config.servers_ping_interval_ms = value;
        }
        if let Some(value) = self.connect_retry_limit
            && value > 0
        {
            config.connect_retry_limit = value;
        }
        if let Some(value) = self.reconnect_backoff_ms
            && value > 0
        {
            config.reconnect_backoff_ms = value;
        }
        if let Some(value) = self.reconnect_backoff_max_ms
            && value > 0
        {
            config.reconnect_backoff_max_ms = value;
        }
        if let Some(value) = self.token_lifetime_ms
            && value > 0
        {
            config.token_lifetime_ms = value;
        }
        if let Some(value) = self.max_frame_bytes
            && value > 0
        {
            config.max_frame_bytes = value;
        }
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}
