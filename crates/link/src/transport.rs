//! Transport seam used by the [`Link`](crate::Link).
//!
//! A [`Connector`] dials an [`Endpoint`] and yields a boxed [`Transport`]
//! carrying text frames. The WebSocket implementation lives in
//! [`client`](crate::client); [`memory`](crate::memory) provides an
//! in-process pair for tests.

use std::time::Duration;

use async_trait::async_trait;

use crate::endpoint::Endpoint;

/// One established, message-oriented connection.
#[async_trait]
pub trait Transport: Send {
    /// Write one frame.
    async fn send(&mut self, frame: String) -> Result<(), LinkError>;

    /// Read the next frame. `None` means the peer closed the connection.
    ///
    /// Must be cancel-safe: dropping the future may not lose a frame.
    async fn recv(&mut self) -> Option<Result<String, LinkError>>;

    /// Release the connection. Must tolerate an already-closed peer.
    async fn close(&mut self);
}

/// Factory for [`Transport`]s.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>, ConnectError>;
}

/// Dial `endpoint`, giving up after `timeout`.
pub async fn connect_with_timeout(
    connector: &dyn Connector,
    endpoint: &Endpoint,
    timeout: Duration,
) -> Result<Box<dyn Transport>, ConnectError> {
    tokio::time::timeout(timeout, connector.connect(endpoint))
        .await
        .map_err(|_| ConnectError::Timeout(timeout))?
}

/// Errors establishing a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The endpoint could not be parsed or uses an unsupported scheme.
    #[error("Invalid dispatcher address: {0}")]
    AddressInvalid(String),

    /// The peer refused or the network failed.
    #[error("Connection refused: {0}")]
    Refused(String),

    /// The connect attempt did not finish in time.
    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors on the send/receive path.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// No session is active.
    #[error("Not connected to the dispatcher")]
    NotConnected,

    /// The outbound queue is full of frames that may not be dropped.
    #[error("Outbound queue is full")]
    QueueFull,

    /// A critical frame could not be queued before its deadline.
    #[error("Timed out waiting for outbound queue space")]
    DeliveryTimeout,

    /// The connection was closed.
    #[error("Connection closed")]
    Closed,

    /// A protocol-level failure on an established connection.
    #[error("Transport error: {0}")]
    Transport(String),
}
