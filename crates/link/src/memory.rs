//! In-process transport.
//!
//! [`MemoryConnector::pair`] returns a connector and a [`MemoryListener`].
//! Every successful `connect` hands a [`MemoryPeer`] to the listener,
//! which plays the dispatcher side of the conversation. Used to drive
//! the link and the engine without sockets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::endpoint::Endpoint;
use crate::transport::{ConnectError, Connector, LinkError, Transport};

/// Client half: dials the paired listener.
#[derive(Clone)]
pub struct MemoryConnector {
    incoming: mpsc::UnboundedSender<MemoryPeer>,
    refusing: Arc<AtomicBool>,
}

/// Server half: receives one [`MemoryPeer`] per connection.
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<MemoryPeer>,
    refusing: Arc<AtomicBool>,
}

/// Dispatcher end of one in-memory connection.
///
/// Dropping it closes the connection from the node's point of view.
pub struct MemoryPeer {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
    stalled: watch::Sender<bool>,
}

/// Node end of one in-memory connection.
struct MemoryTransport {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
    stalled: watch::Receiver<bool>,
}

impl MemoryConnector {
    pub fn pair() -> (MemoryConnector, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        let refusing = Arc::new(AtomicBool::new(false));
        (
            MemoryConnector {
                incoming: tx,
                refusing: Arc::clone(&refusing),
            },
            MemoryListener {
                incoming: rx,
                refusing,
            },
        )
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>, ConnectError> {
        if self.refusing.load(Ordering::Acquire) {
            return Err(ConnectError::Refused(format!("{endpoint} is refusing")));
        }

        let (to_peer, from_node) = mpsc::unbounded_channel();
        let (to_node, from_peer) = mpsc::unbounded_channel();
        let (stall_tx, stall_rx) = watch::channel(false);

        self.incoming
            .send(MemoryPeer {
                tx: to_node,
                rx: from_node,
                stalled: stall_tx,
            })
            .map_err(|_| ConnectError::Refused(format!("{endpoint} has no listener")))?;

        Ok(Box::new(MemoryTransport {
            tx: Some(to_peer),
            rx: from_peer,
            stalled: stall_rx,
        }))
    }
}

impl MemoryListener {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.incoming.recv().await
    }

    /// Make subsequent connect attempts fail with [`ConnectError::Refused`].
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::Release);
    }
}

impl MemoryPeer {
    /// Send a frame to the node.
    pub fn send(&self, frame: impl Into<String>) -> Result<(), LinkError> {
        self.tx.send(frame.into()).map_err(|_| LinkError::Closed)
    }

    /// Next frame from the node; `None` once the node closed the connection.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// While stalled, node writes block as on a socket whose peer stopped
    /// reading. Dropping a stalled peer fails the blocked write.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.send_replace(stalled);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, frame: String) -> Result<(), LinkError> {
        if self.stalled.wait_for(|stalled| !*stalled).await.is_err() {
            return Err(LinkError::Closed);
        }
        match &self.tx {
            Some(tx) => tx.send(frame).map_err(|_| LinkError::Closed),
            None => Err(LinkError::Closed),
        }
    }

    async fn recv(&mut self) -> Option<Result<String, LinkError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}
