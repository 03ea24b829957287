//! Transport link between a Spark node and its dispatcher.
//!
//! Provides the transport seam ([`Connector`] / [`Transport`]), the
//! WebSocket and in-memory transports, the bounded outbound queue,
//! exponential-backoff reconnection, and the [`Link`] handle that ties
//! them together behind a single persistent logical connection.

pub mod client;
pub mod endpoint;
pub mod link;
pub mod memory;
pub mod outbound;
pub mod reconnect;
pub mod transport;

pub use client::WsConnector;
pub use endpoint::Endpoint;
pub use link::{Link, LinkConfig, LinkEvent};
pub use memory::{MemoryConnector, MemoryListener, MemoryPeer};
pub use transport::{connect_with_timeout, ConnectError, Connector, LinkError, Transport};
