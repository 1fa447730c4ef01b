// Wire format for the service control protocol: framed, JSON-encoded
// control messages exchanged between an app server and the service.
use base64::Engine;
use bytes::{Buf, Bytes, BytesMut};
use relay_common::GracefulShutdownMode;
use serde::{Deserialize, Serialize};

pub mod hub;

pub const MAGIC: u32 = 0x524C5931;
pub const VERSION: u16 = 1;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("frame too large")]
    FrameTooLarge,
    #[error("incomplete frame")]
    Incomplete,
    #[error("failed to serialize message")]
    Serialize(serde_json::Error),
    #[error("failed to deserialize message")]
    Deserialize(serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: u16,
    pub length: u32,
}

impl FrameHeader {
    pub const LEN: usize = 12;

    // Create a header with the current protocol constants.
    pub fn new(flags: u16, length: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            flags,
            length,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        // Always encode in network byte order for portability.
        buf.extend_from_slice(&self.magic.to_be_bytes());
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.length.to_be_bytes());
    }

    pub fn encode_into(&self, out: &mut [u8; Self::LEN]) {
        out[0..4].copy_from_slice(&self.magic.to_be_bytes());
        out[4..6].copy_from_slice(&self.version.to_be_bytes());
        out[6..8].copy_from_slice(&self.flags.to_be_bytes());
        out[8..12].copy_from_slice(&self.length.to_be_bytes());
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        // Validate header before we trust the length.
        if buf.remaining() < Self::LEN {
            return Err(Error::Incomplete);
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = buf.get_u16();
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let flags = buf.get_u16();
        let length = buf.get_u32();
        Ok(Self {
            magic,
            version,
            flags,
            length,
        })
    }
}

/// Frame containing a header and payload.
///
/// ```
/// use bytes::Bytes;
/// use relay_wire::Frame;
///
/// let frame = Frame::new(0, Bytes::from_static(b"hello")).expect("frame");
/// let encoded = frame.encode();
/// let decoded = Frame::decode(encoded).expect("decode");
/// assert_eq!(decoded.payload, Bytes::from_static(b"hello"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(flags: u16, payload: Bytes) -> Result<Self> {
        // Keep length within the on-wire u32 size.
        if payload.len() > u32::MAX as usize {
            return Err(Error::FrameTooLarge);
        }
        Ok(Self {
            header: FrameHeader::new(flags, payload.len() as u32),
            payload,
        })
    }

    pub fn encode(&self) -> Bytes {
        // Pre-allocate the exact size to avoid reallocation.
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(input: Bytes) -> Result<Self> {
        // Split header and payload based on the declared length.
        if input.len() < FrameHeader::LEN {
            return Err(Error::Incomplete);
        }
        let header = FrameHeader::decode(input.slice(0..FrameHeader::LEN))?;
        let length = header.length as usize;
        if input.len() < FrameHeader::LEN + length {
            return Err(Error::Incomplete);
        }
        let payload = input.slice(FrameHeader::LEN..FrameHeader::LEN + length);
        Ok(Self { header, payload })
    }
}

/// Outcome carried by an `Ack` message correlating to an earlier operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Ok,
    NotFound,
    Timeout,
}

/// V1 control messages exchanged on a service connection.
///
/// This is a closed union: the receive loop dispatches with an exhaustive
/// `match`, so adding a kind here forces every dispatcher to handle it.
///
/// ```
/// use relay_wire::ServiceMessage;
///
/// let message = ServiceMessage::OpenConnection {
///     connection_id: "c1".to_string(),
///     headers: Vec::new(),
///     query: None,
/// };
/// let frame = message.encode().expect("encode");
/// let decoded = ServiceMessage::decode(frame).expect("decode");
/// assert_eq!(message, decoded);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceMessage {
    // First message on a new service connection; target pins a service instance.
    HandshakeRequest {
        version: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    // Handshake outcome; a non-empty error message rejects the connection.
    HandshakeResponse {
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    // Liveness and side-channel signalling; payload is flattened key/value pairs.
    Ping {
        messages: Vec<String>,
    },
    // A client connected to the service and is assigned to this server.
    OpenConnection {
        connection_id: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        headers: Vec<(String, String)>,
        #[serde(skip_serializing_if = "Option::is_none")]
        query: Option<String>,
    },
    // A client disconnected, or should be handed to another server.
    CloseConnection {
        connection_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        migration_target: Option<String>,
    },
    // Data relayed between a client and the hosted application.
    ConnectionData {
        connection_id: String,
        #[serde(with = "base64_bytes")]
        payload: Bytes,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_partial: bool,
    },
    // A caller server started a client invocation and expects a result.
    ClientInvocation {
        invocation_id: String,
        connection_id: String,
        caller_server_id: String,
    },
    // Service-side routing update for an in-flight invocation.
    ServiceMapping {
        invocation_id: String,
        connection_id: String,
        instance_id: String,
    },
    // Successful result of a client invocation.
    ClientCompletion {
        invocation_id: String,
        connection_id: String,
        caller_server_id: String,
        #[serde(with = "base64_bytes")]
        payload: Bytes,
    },
    // Failed result of a client invocation.
    ErrorCompletion {
        invocation_id: String,
        connection_id: String,
        caller_server_id: String,
        error: String,
    },
    // A service instance went away; drop cached state tied to it.
    ConnectionReconnect {
        instance_id: String,
    },
    // Connection-scoped group management (no ack).
    JoinGroup {
        connection_id: String,
        group: String,
    },
    LeaveGroup {
        connection_id: String,
        group: String,
    },
    // User-scoped group management; ack_id requests an Ack reply.
    UserJoinGroup {
        user_id: String,
        group: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        ack_id: Option<u64>,
    },
    UserLeaveGroup {
        user_id: String,
        group: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        ack_id: Option<u64>,
    },
    UserLeaveAllGroups {
        user_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        ack_id: Option<u64>,
    },
    // Acknowledgement for a previously sent ack-carrying operation.
    Ack {
        ack_id: u64,
        status: AckStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    // Fan-out data messages written through the multi-endpoint router.
    Broadcast {
        #[serde(with = "base64_bytes")]
        payload: Bytes,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        excluded: Vec<String>,
    },
    UserData {
        user_id: String,
        #[serde(with = "base64_bytes")]
        payload: Bytes,
    },
    GroupBroadcast {
        group: String,
        #[serde(with = "base64_bytes")]
        payload: Bytes,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        excluded: Vec<String>,
    },
    // Server is going offline; the service answers with FinAck.
    Fin {
        mode: GracefulShutdownMode,
    },
    FinAck,
}

impl ServiceMessage {
    pub fn encode(&self) -> Result<Frame> {
        // JSON-encode into a framed payload.
        let payload = serde_json::to_vec(self).map_err(Error::Serialize)?;
        Frame::new(0, Bytes::from(payload))
    }

    pub fn decode(frame: Frame) -> Result<Self> {
        serde_json::from_slice(&frame.payload).map_err(Error::Deserialize)
    }
}

pub mod ping {
    //! Conventions for the small key/value ping payloads.
    //!
    //! Status pings report `bridged:total` client counters. Servers pings
    //! either request the server list (empty value) or carry a `;`-joined
    //! list of server ids. Offline pings name a service instance whose
    //! cached state must be dropped.
    use super::ServiceMessage;

    pub const STATUS_KEY: &str = "status";
    pub const SERVERS_KEY: &str = "servers";
    pub const OFFLINE_KEY: &str = "offline";

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum PingKind {
        // Counters: clients currently bridged, total local clients.
        Status { bridged: usize, total: usize },
        GetServers,
        Servers(Vec<String>),
        Offline(String),
        Empty,
        Unknown,
    }

    pub fn status_ping(bridged: usize, total: usize) -> ServiceMessage {
        ServiceMessage::Ping {
            messages: vec![STATUS_KEY.to_string(), format!("{bridged}:{total}")],
        }
    }

    pub fn get_servers_ping() -> ServiceMessage {
        ServiceMessage::Ping {
            messages: vec![SERVERS_KEY.to_string(), String::new()],
        }
    }

    pub fn servers_ping(server_ids: &[String]) -> ServiceMessage {
        ServiceMessage::Ping {
            messages: vec![SERVERS_KEY.to_string(), server_ids.join(";")],
        }
    }

    pub fn offline_ping(instance_id: &str) -> ServiceMessage {
        ServiceMessage::Ping {
            messages: vec![OFFLINE_KEY.to_string(), instance_id.to_string()],
        }
    }

    pub fn classify(messages: &[String]) -> PingKind {
        // A plain keepalive carries no key/value pairs.
        if messages.is_empty() {
            return PingKind::Empty;
        }
        if messages.len() < 2 {
            return PingKind::Unknown;
        }
        let (key, value) = (messages[0].as_str(), messages[1].as_str());
        match key {
            STATUS_KEY => {
                let mut parts = value.splitn(2, ':');
                let bridged = parts.next().and_then(|part| part.parse().ok());
                let total = parts.next().and_then(|part| part.parse().ok());
                match (bridged, total) {
                    (Some(bridged), Some(total)) => PingKind::Status { bridged, total },
                    _ => PingKind::Unknown,
                }
            }
            SERVERS_KEY if value.is_empty() => PingKind::GetServers,
            SERVERS_KEY => PingKind::Servers(
                value
                    .split(';')
                    .filter(|part| !part.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            OFFLINE_KEY => PingKind::Offline(value.to_string()),
            _ => PingKind::Unknown,
        }
    }
}

mod base64_bytes {
    use super::*;
    use serde::de::Error;

    // Encode Bytes as base64 string for JSON payloads.
    pub fn serialize<S>(value: &Bytes, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let encoded = base64::engine::general_purpose::STANDARD.encode(value);
        serializer.serialize_str(&encoded)
    }

    // Decode base64 string into Bytes.
    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Bytes, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(D::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}
