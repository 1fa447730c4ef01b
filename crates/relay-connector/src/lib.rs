//! Server-side runtime of the relay service connector.
//!
//! Multiplexes app-server connections to a managed real-time messaging
//! service: a container owns a pool of service connections per
//! (hub, endpoint); each connection independently establishes, handshakes,
//! and pumps control messages; client traffic is registered into the shared
//! registry and bridged to the hosted application's duplex pipe; group and
//! user operations fan out across endpoints through the router and resolve
//! against tracked acks.

pub mod ack;
pub mod client;
pub mod config;
pub mod connection;
pub mod container;
pub mod endpoint;
pub mod error;
pub mod invocation;
pub mod registry;
pub mod router;

pub use ack::AckTracker;
pub use client::{ClientConnectionContext, ConnectionDelegate};
pub use config::ConnectorConfig;
pub use connection::{ConnectionStatus, ServiceConnection};
pub use container::{ContainerStatus, ServiceConnectionContainer};
pub use endpoint::{
    AccessKey, EndpointKind, HubServiceEndpoint, ScaleReady, ServiceEndpoint,
};
pub use error::{ConnectorError, Result};
pub use invocation::InvocationRouter;
pub use registry::ClientConnectionRegistry;
pub use router::MultiEndpointRouter;
