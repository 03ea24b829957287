//! Persistent logical connection to the dispatcher.
//!
//! [`Link::start`] spawns a background task that connects, pumps frames
//! in both directions, and reconnects with backoff whenever the session
//! drops. The owner observes the connection through [`LinkEvent`]s and
//! writes through the bounded [`OutboundQueue`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::endpoint::Endpoint;
use crate::outbound::{OutboundQueue, Priority, DEFAULT_OUTBOUND_CAPACITY};
use crate::reconnect::{jittered, next_delay, reconnect_loop, ReconnectConfig};
use crate::transport::{Connector, LinkError, Transport};

/// Buffered link events awaiting the owner.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long [`Link::close`] waits for the background task to exit.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed to write out queued frames when the link closes.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Bound on a single connect attempt.
    pub connect_timeout: Duration,
    /// Maximum number of queued outbound frames.
    pub outbound_capacity: usize,
    pub reconnect: ReconnectConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// What the link reports to its owner, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A new session is up. Nothing is written on it until the owner
    /// calls [`Link::send_handshake`].
    Connected,
    /// One inbound frame.
    Frame(String),
    /// The session ended. The link is already trying to reconnect.
    Disconnected { reason: String },
}

/// Controls for the current session.
struct Session {
    /// Ends this session only.
    cancel: CancellationToken,
    /// Cancelled once the handshake is queued; the writer waits for it.
    handshake: CancellationToken,
}

/// State shared between the [`Link`] handle and its background task.
struct Shared {
    queue: OutboundQueue,
    connected: AtomicBool,
    /// Set by the owner once the session passed its handshake.
    confirmed: AtomicBool,
    session: Mutex<Option<Session>>,
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the current session has been opened with a handshake.
    fn is_open(&self) -> bool {
        self.session()
            .as_ref()
            .is_some_and(|s| s.handshake.is_cancelled() && !s.cancel.is_cancelled())
    }
}

/// Handle to the dispatcher connection.
pub struct Link {
    shared: Arc<Shared>,
    events: mpsc::Receiver<LinkEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    endpoint: Endpoint,
}

impl Link {
    /// Spawn the connection task. Must be called inside a Tokio runtime.
    pub fn start(connector: Arc<dyn Connector>, endpoint: Endpoint, config: LinkConfig) -> Self {
        let (event_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            queue: OutboundQueue::new(config.outbound_capacity),
            connected: AtomicBool::new(false),
            confirmed: AtomicBool::new(false),
            session: Mutex::new(None),
        });
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_link_loop(
            connector,
            endpoint.clone(),
            config,
            Arc::clone(&shared),
            event_tx,
            cancel.clone(),
        ));

        Self {
            shared,
            events,
            cancel,
            task: Some(task),
            endpoint,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Next link event. `None` once the link is closed.
    pub async fn recv(&mut self) -> Option<LinkEvent> {
        self.events.recv().await
    }

    /// Next already-buffered event, without waiting.
    pub fn try_recv(&mut self) -> Option<LinkEvent> {
        self.events.try_recv().ok()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Queue a droppable frame (e.g. a heartbeat) without waiting.
    ///
    /// Fails with [`LinkError::NotConnected`] until the current session
    /// has had its handshake.
    pub fn send(&self, frame: String) -> Result<(), LinkError> {
        self.ensure_open()?;
        self.shared
            .queue
            .push(frame, Priority::Droppable)
            .map_err(|_| LinkError::QueueFull)
    }

    /// Queue a frame that must not be dropped.
    ///
    /// Waits up to `timeout` for queue space. `Ok` means the frame is
    /// queued, not that the dispatcher has read it. Like [`Link::send`],
    /// refused until the current session has had its handshake.
    pub async fn deliver(&self, frame: String, timeout: Duration) -> Result<(), LinkError> {
        self.ensure_open()?;
        self.shared
            .queue
            .push_critical(frame, timeout)
            .await
            .map_err(|_| LinkError::DeliveryTimeout)
    }

    /// Queue the session handshake and let the session start writing.
    ///
    /// The handshake is the first frame of the session; critical frames
    /// carried over from earlier sessions follow it.
    pub fn send_handshake(&self, frame: String) -> Result<(), LinkError> {
        let current = self.shared.session();
        let Some(session) = current.as_ref().filter(|s| !s.cancel.is_cancelled()) else {
            return Err(LinkError::NotConnected);
        };
        self.shared.queue.push_front(frame);
        session.handshake.cancel();
        Ok(())
    }

    /// Mark the current session as registered; the next outage starts
    /// backing off from the initial delay again.
    pub fn confirm(&self) {
        self.shared.confirmed.store(true, Ordering::Release);
    }

    /// Drop the current session. The link reconnects on its own.
    pub fn reset(&self) {
        if let Some(session) = self.shared.session().as_ref() {
            session.cancel.cancel();
        }
    }

    /// Stop reconnecting and release the connection. Idempotent.
    ///
    /// Frames still queued are written out first, within a short bound.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, task).await.is_err() {
                tracing::warn!(endpoint = %self.endpoint, "Link task did not stop in time");
            }
            tracing::info!(endpoint = %self.endpoint, "Link closed");
        }
    }

    fn ensure_open(&self) -> Result<(), LinkError> {
        if self.shared.is_open() {
            Ok(())
        } else {
            Err(LinkError::NotConnected)
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Connect -> run session -> reconnect, until cancelled.
async fn run_link_loop(
    connector: Arc<dyn Connector>,
    endpoint: Endpoint,
    config: LinkConfig,
    shared: Arc<Shared>,
    events: mpsc::Sender<LinkEvent>,
    cancel: CancellationToken,
) {
    let mut delay = config.reconnect.initial_delay;

    loop {
        let Some(transport) = reconnect_loop(
            connector.as_ref(),
            &endpoint,
            config.connect_timeout,
            &config.reconnect,
            &mut delay,
            &cancel,
        )
        .await
        else {
            break;
        };

        let session_id = uuid::Uuid::new_v4();
        let session_cancel = cancel.child_token();
        let handshake = CancellationToken::new();
        *shared.session() = Some(Session {
            cancel: session_cancel.clone(),
            handshake: handshake.clone(),
        });
        shared.confirmed.store(false, Ordering::Release);
        shared.connected.store(true, Ordering::Release);
        tracing::info!(endpoint = %endpoint, session_id = %session_id, "Link connected");

        if events.send(LinkEvent::Connected).await.is_err() {
            break;
        }

        let reason = run_session(
            transport,
            &shared.queue,
            &events,
            SessionTokens {
                cancel: &session_cancel,
                handshake: &handshake,
                closing: &cancel,
            },
        )
        .await;

        shared.connected.store(false, Ordering::Release);
        *shared.session() = None;
        let dropped = shared.queue.retain_critical();

        if cancel.is_cancelled() {
            break;
        }

        tracing::warn!(
            endpoint = %endpoint,
            session_id = %session_id,
            reason = %reason,
            dropped_frames = dropped,
            "Link disconnected",
        );
        if events
            .send(LinkEvent::Disconnected { reason })
            .await
            .is_err()
        {
            break;
        }

        if shared.confirmed.load(Ordering::Acquire) {
            delay = config.reconnect.initial_delay;
        } else {
            // The session never registered; back off before dialing again.
            let pause = jittered(delay);
            delay = next_delay(delay, &config.reconnect);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    shared.connected.store(false, Ordering::Release);
    tracing::debug!(endpoint = %endpoint, "Link task exited");
}

struct SessionTokens<'a> {
    /// Ends this session only.
    cancel: &'a CancellationToken,
    /// Opens the writer once the handshake is queued.
    handshake: &'a CancellationToken,
    /// Link-wide; makes the session flush the queue before it closes.
    closing: &'a CancellationToken,
}

/// Pump frames until the session ends. Returns the reason it ended.
///
/// Nothing is written before the handshake. A critical frame whose write
/// fails or is cut short goes back to the front of the queue.
async fn run_session(
    mut transport: Box<dyn Transport>,
    queue: &OutboundQueue,
    events: &mpsc::Sender<LinkEvent>,
    tokens: SessionTokens<'_>,
) -> String {
    let SessionTokens {
        cancel,
        handshake,
        closing,
    } = tokens;
    let mut open = false;

    let reason = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if closing.is_cancelled() && handshake.is_cancelled() {
                    flush(transport.as_mut(), queue).await;
                }
                break "session closed locally".to_string();
            }
            _ = handshake.cancelled(), if !open => {
                open = true;
            }
            entry = queue.pop(), if open => {
                let written = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err("session closed locally".to_string()),
                    sent = transport.send(entry.frame.clone()) => {
                        sent.map_err(|e| format!("send failed: {e}"))
                    }
                };
                if let Err(reason) = written {
                    if queue.requeue(entry) {
                        tracing::debug!("Critical frame kept for the next session");
                    }
                    if closing.is_cancelled() {
                        flush(transport.as_mut(), queue).await;
                    }
                    break reason;
                }
            }
            inbound = transport.recv() => match inbound {
                Some(Ok(frame)) => {
                    tokio::select! {
                        sent = events.send(LinkEvent::Frame(frame)) => {
                            if sent.is_err() {
                                break "link owner went away".to_string();
                            }
                        }
                        _ = cancel.cancelled() => break "session closed locally".to_string(),
                    }
                }
                Some(Err(e)) => break format!("receive failed: {e}"),
                None => break "closed by peer".to_string(),
            },
        }
    };

    transport.close().await;
    reason
}

/// Write out whatever is still queued.
async fn flush(transport: &mut dyn Transport, queue: &OutboundQueue) {
    let mut written = 0usize;
    let drain = async {
        while let Some(entry) = queue.try_pop() {
            if let Err(e) = transport.send(entry.frame).await {
                tracing::debug!(error = %e, "Flush stopped");
                break;
            }
            written += 1;
        }
    };
    if tokio::time::timeout(FLUSH_TIMEOUT, drain).await.is_err() {
        tracing::warn!(remaining = queue.len(), "Timed out flushing outbound frames");
    }
    if written > 0 {
        tracing::debug!(written, "Flushed outbound frames before close");
    }
}
