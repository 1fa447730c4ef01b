// Error taxonomy for the connector core.
//
// Errors local to one client or one connection stay contained; only
// configuration problems are allowed to fail startup.

pub type Result<T> = std::result::Result<T, ConnectorError>;

#[derive(thiserror::Error, Debug)]
pub enum ConnectorError {
    /// The multiplexed service connection is gone; in-flight forwarding for
    /// the affected client must stop. The connection itself recovers
    /// independently.
    #[error("service connection not active")]
    ServiceConnectionNotActive,
    #[error("ack {ack_id} timed out after {timeout_ms} ms")]
    AckTimeout { ack_id: u64, timeout_ms: u64 },
    #[error("ack {ack_id} failed: {message}")]
    AckFailed { ack_id: u64, message: String },
    #[error("duplicate client connection: {0}")]
    DuplicateConnection(String),
    #[error("no primary endpoint configured")]
    MissingPrimaryEndpoint,
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Wire(#[from] relay_wire::Error),
    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_timeout_message_names_id_and_timeout() {
        let err = ConnectorError::AckTimeout {
            ack_id: 7,
            timeout_ms: 30_000,
        };
        assert_eq!(err.to_string(), "ack 7 timed out after 30000 ms");
    }

    #[test]
    fn wire_errors_convert() {
        let err: ConnectorError = relay_wire::Error::InvalidMagic.into();
        assert!(matches!(err, ConnectorError::Wire(_)));
    }
}
