//! Protocol engine: the node side of the dispatcher conversation.
//!
//! [`Engine::run`] is a single `select!` loop over link events, worker
//! reports, the heartbeat and handshake timers, and the shutdown token.
//! All registration state and every slot change happen inside that loop,
//! so the pool needs no locking.
//!
//! ```text
//! Disconnected --Connected--> Connecting --Welcome--> Registered
//!      ^                          |                       |
//!      +-- handshake timeout -----+      link lost / N missed acks
//!                                                         v
//!                       Connecting <--Connected------ Degraded
//! ```
//!
//! `Shutdown` (directive or cancellation) is terminal: the pool drains,
//! pending results are delivered, and the link is closed.

use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use spark_core::config::{Capacity, Config};
use spark_core::identity::Identity;
use spark_core::job::{JobHandle, JobResult};
use spark_core::protocol::{self, Message, RejectReason};
use spark_core::types::{JobId, SlotId};
use spark_link::{Link, LinkError, LinkEvent};

use crate::heartbeat::HeartbeatTracker;
use crate::pool::{Pool, PoolError};
use crate::worker::WorkerEvent;

/// Time the dispatcher has to answer `Hello`.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time a job reply or result may wait for outbound queue space.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Unanswered heartbeats before the session is considered lost.
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;

// ---------------------------------------------------------------------------
// Configuration and state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub identity: Identity,
    pub capacity: Capacity,
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
    pub handshake_timeout: Duration,
    pub delivery_timeout: Duration,
    pub drain_timeout: Duration,
}

impl EngineConfig {
    pub fn from_config(config: &Config, identity: Identity) -> Self {
        Self {
            identity,
            capacity: config.capacity,
            heartbeat_interval: config.heartbeat_interval,
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
            drain_timeout: config.drain_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No session.
    Disconnected,
    /// Session up, `Hello` sent, waiting for `Welcome`.
    Connecting,
    /// Registered with the dispatcher; jobs are accepted.
    Registered,
    /// A registered session was lost; reconnecting.
    Degraded,
    Shutdown,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Disconnected => "disconnected",
            EngineState::Connecting => "connecting",
            EngineState::Registered => "registered",
            EngineState::Degraded => "degraded",
            EngineState::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// What happened to the jobs that were around when the engine stopped.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Results that became terminal while draining.
    pub drained: Vec<JobResult>,
    /// Results handed to the link during shutdown.
    pub delivered: Vec<JobResult>,
    /// Results that could not be handed to the link.
    pub undelivered: Vec<JobResult>,
}

enum Flow {
    Continue,
    Shutdown,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    config: EngineConfig,
    link: Link,
    pool: Pool,
    cancel: CancellationToken,
    state: watch::Sender<EngineState>,
    heartbeat: HeartbeatTracker,
    handshake_deadline: Option<Instant>,
    next_heartbeat: Option<Instant>,
}

impl Engine {
    pub fn new(config: EngineConfig, link: Link, pool: Pool, cancel: CancellationToken) -> Self {
        let (state, _) = watch::channel(EngineState::Disconnected);
        let heartbeat = HeartbeatTracker::new(config.max_missed_heartbeats);
        Self {
            config,
            link,
            pool,
            cancel,
            state,
            heartbeat,
            handshake_deadline: None,
            next_heartbeat: None,
        }
    }

    /// Subscribe to state changes.
    pub fn state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// Run until a `Shutdown` directive or cancellation, then drain.
    pub async fn run(mut self) -> ShutdownReport {
        tracing::info!(
            endpoint = %self.link.endpoint(),
            max_jobs = self.config.capacity.max_jobs(),
            "Engine started",
        );

        loop {
            let handshake = self.handshake_deadline;
            let heartbeat = self.next_heartbeat;

            let flow = tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Shutdown requested");
                    Flow::Shutdown
                }
                event = self.link.recv() => match event {
                    Some(event) => self.on_link_event(event).await,
                    None => {
                        tracing::warn!("Link closed unexpectedly");
                        Flow::Shutdown
                    }
                },
                event = self.pool.next_event() => {
                    self.on_worker_event(event).await;
                    Flow::Continue
                }
                _ = expires(heartbeat) => {
                    self.on_heartbeat_due();
                    Flow::Continue
                }
                _ = expires(handshake) => {
                    self.on_handshake_timeout();
                    Flow::Continue
                }
            };

            if let Flow::Shutdown = flow {
                break;
            }
        }

        self.shutdown().await
    }

    fn current(&self) -> EngineState {
        *self.state.borrow()
    }

    fn set_state(&mut self, next: EngineState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::info!(from = %previous, to = %next, "Engine state changed");
        }
    }

    // -- link ---------------------------------------------------------------

    async fn on_link_event(&mut self, event: LinkEvent) -> Flow {
        match event {
            LinkEvent::Connected => {
                self.on_connected();
                Flow::Continue
            }
            LinkEvent::Frame(frame) => self.on_frame(&frame).await,
            LinkEvent::Disconnected { reason } => {
                self.on_disconnected(&reason);
                Flow::Continue
            }
        }
    }

    fn on_connected(&mut self) {
        self.set_state(EngineState::Connecting);
        self.next_heartbeat = None;

        let hello = Message::Hello {
            identity: self.config.identity.clone(),
            capacity: self.config.capacity,
        };
        let Some(frame) = encode(&hello) else {
            return;
        };
        if let Err(e) = self.link.send_handshake(frame) {
            // The session is already gone; a Disconnected event follows.
            tracing::warn!(error = %e, "Could not queue Hello");
        }
        self.handshake_deadline = Some(Instant::now() + self.config.handshake_timeout);
    }

    fn on_disconnected(&mut self, reason: &str) {
        self.handshake_deadline = None;
        self.next_heartbeat = None;

        match self.current() {
            EngineState::Registered => {
                tracing::warn!(reason, "Lost dispatcher session");
                self.set_state(EngineState::Degraded);
            }
            EngineState::Connecting => {
                tracing::warn!(reason, "Session ended before registration");
                self.set_state(EngineState::Disconnected);
            }
            _ => tracing::debug!(reason, "Link disconnected"),
        }
    }

    async fn on_frame(&mut self, frame: &str) -> Flow {
        let message = match protocol::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring undecodable frame");
                return Flow::Continue;
            }
        };

        match message {
            Message::Welcome => self.on_welcome().await,
            Message::HeartbeatAck => self.heartbeat.on_ack(),
            Message::JobAssign { job_id, payload } => {
                if self.current() == EngineState::Registered {
                    self.on_job_assign(job_id, payload).await;
                } else {
                    tracing::warn!(job_id = %job_id, state = %self.current(), "Job assigned before registration, ignoring");
                }
            }
            Message::Shutdown => {
                tracing::info!("Dispatcher requested shutdown");
                return Flow::Shutdown;
            }
            other => {
                tracing::warn!(kind = other.kind(), "Ignoring unexpected message from dispatcher");
            }
        }
        Flow::Continue
    }

    async fn on_welcome(&mut self) {
        if self.current() != EngineState::Connecting {
            tracing::warn!(state = %self.current(), "Ignoring unexpected Welcome");
            return;
        }

        self.handshake_deadline = None;
        self.link.confirm();
        self.heartbeat.reset();
        self.set_state(EngineState::Registered);
        tracing::info!(
            machine_name = %self.config.identity.machine_name,
            free_slots = self.pool.free_count(),
            "Registered with dispatcher",
        );

        self.send_heartbeat();
        self.flush_pending().await;
    }

    async fn on_job_assign(&mut self, job_id: JobId, payload: Vec<u8>) {
        if let Some(slot_id) = self.pool.slot_of(&job_id) {
            tracing::info!(job_id = %job_id, slot_id, "Duplicate assignment, acknowledging again");
            self.reply(Message::JobAccepted { job_id }).await;
            return;
        }

        let job = JobHandle::new(job_id.clone(), payload);
        let reply = match self.pool.try_assign(job) {
            Ok(slot_id) => {
                tracing::info!(job_id = %job_id, slot_id, "Job accepted");
                Message::JobAccepted { job_id }
            }
            Err(PoolError::Duplicate(_)) => Message::JobAccepted { job_id },
            Err(PoolError::Full) => {
                tracing::warn!(job_id = %job_id, "No free slot, rejecting job");
                Message::JobRejected {
                    job_id,
                    reason: RejectReason::Overcapacity,
                }
            }
            Err(PoolError::Draining) => {
                tracing::info!(job_id = %job_id, "Draining, rejecting job");
                Message::JobRejected {
                    job_id,
                    reason: RejectReason::Draining,
                }
            }
        };
        self.reply(reply).await;
    }

    /// Send a job reply that must not be dropped.
    async fn reply(&self, message: Message) {
        let Some(frame) = encode(&message) else {
            return;
        };
        if let Err(e) = self.link.deliver(frame, self.config.delivery_timeout).await {
            tracing::warn!(kind = message.kind(), error = %e, "Reply not sent");
        }
    }

    // -- workers ------------------------------------------------------------

    async fn on_worker_event(&mut self, event: WorkerEvent) {
        let Some((slot_id, result)) = self.pool.on_worker_terminal(event) else {
            return;
        };

        match &result.outcome {
            protocol::JobOutcome::Success { output } => {
                tracing::info!(job_id = %result.job_id, slot_id, output_bytes = output.len(), "Job completed");
            }
            protocol::JobOutcome::Failure { reason } => {
                tracing::warn!(job_id = %result.job_id, slot_id, reason = %reason, "Job failed");
            }
        }

        if self.current() == EngineState::Registered {
            self.deliver_result(slot_id, &result).await;
        } else {
            tracing::info!(job_id = %result.job_id, "Not registered, result kept pending");
        }
    }

    /// Queue a `JobDone` and free the slot once it is queued.
    ///
    /// Returns whether the result left the pool.
    async fn deliver_result(&mut self, slot_id: SlotId, result: &JobResult) -> bool {
        let done = Message::JobDone {
            job_id: result.job_id.clone(),
            outcome: result.outcome.clone(),
        };
        let Some(frame) = encode(&done) else {
            return false;
        };

        match self.link.deliver(frame, self.config.delivery_timeout).await {
            Ok(()) => {
                self.pool.confirm_delivered(slot_id);
                true
            }
            Err(LinkError::DeliveryTimeout) => {
                tracing::warn!(job_id = %result.job_id, slot_id, "Result delivery timed out, will retry");
                self.pool.mark_delivery_timeout(slot_id);
                false
            }
            Err(e) => {
                tracing::info!(job_id = %result.job_id, error = %e, "Result kept pending");
                false
            }
        }
    }

    /// Deliver every pending result, stopping at the first failure.
    async fn flush_pending(&mut self) {
        for (slot_id, result) in self.pool.pending_results() {
            if !self.deliver_result(slot_id, &result).await {
                break;
            }
        }
    }

    // -- timers -------------------------------------------------------------

    fn on_heartbeat_due(&mut self) {
        if self.current() != EngineState::Registered {
            self.next_heartbeat = None;
            return;
        }

        if self.heartbeat.is_lost() {
            tracing::warn!(
                missed = self.heartbeat.outstanding(),
                "Dispatcher stopped acknowledging heartbeats",
            );
            self.next_heartbeat = None;
            self.heartbeat.reset();
            self.set_state(EngineState::Degraded);
            self.link.reset();
            return;
        }

        self.send_heartbeat();
    }

    fn send_heartbeat(&mut self) {
        let heartbeat = Message::Heartbeat {
            identity: self.config.identity.clone(),
            free_slots: u32::try_from(self.pool.free_count()).unwrap_or(u32::MAX),
        };
        if let Some(frame) = encode(&heartbeat) {
            if let Err(e) = self.link.send(frame) {
                tracing::debug!(error = %e, "Heartbeat dropped");
            }
        }
        // A heartbeat that never left counts as unanswered too.
        self.heartbeat.on_sent();
        self.next_heartbeat = Some(Instant::now() + self.config.heartbeat_interval);
    }

    fn on_handshake_timeout(&mut self) {
        self.handshake_deadline = None;
        if self.current() != EngineState::Connecting {
            return;
        }
        tracing::warn!(
            timeout_secs = self.config.handshake_timeout.as_secs(),
            "Dispatcher did not answer Hello, dropping session",
        );
        self.set_state(EngineState::Disconnected);
        self.link.reset();
    }

    // -- shutdown -----------------------------------------------------------

    async fn shutdown(mut self) -> ShutdownReport {
        self.handshake_deadline = None;
        self.next_heartbeat = None;

        let drained = self.pool.drain(self.config.drain_timeout).await;
        self.answer_buffered().await;

        let mut report = ShutdownReport {
            drained: drained.into_iter().map(|(_, result)| result).collect(),
            ..Default::default()
        };

        let registered = self.current() == EngineState::Registered;
        for (slot_id, result) in self.pool.pending_results() {
            if registered && self.deliver_result(slot_id, &result).await {
                report.delivered.push(result);
            } else {
                tracing::warn!(
                    job_id = %result.job_id,
                    outcome = ?result.outcome,
                    "Result could not be delivered before shutdown",
                );
                report.undelivered.push(result);
            }
        }

        self.set_state(EngineState::Shutdown);
        self.link.close().await;

        tracing::info!(
            drained = report.drained.len(),
            delivered = report.delivered.len(),
            undelivered = report.undelivered.len(),
            "Engine stopped",
        );
        report
    }

    /// Handle link events that queued up while the pool was draining.
    async fn answer_buffered(&mut self) {
        while let Some(event) = self.link.try_recv() {
            match event {
                LinkEvent::Frame(frame) => match protocol::decode(&frame) {
                    Ok(Message::JobAssign { job_id, .. }) => {
                        if self.current() == EngineState::Registered {
                            self.on_job_assign(job_id, Vec::new()).await;
                        }
                    }
                    Ok(Message::HeartbeatAck) => self.heartbeat.on_ack(),
                    Ok(other) => {
                        tracing::debug!(kind = other.kind(), "Ignoring message during shutdown");
                    }
                    Err(e) => tracing::warn!(error = %e, "Ignoring undecodable frame"),
                },
                LinkEvent::Disconnected { reason } => self.on_disconnected(&reason),
                LinkEvent::Connected => {
                    // A fresh session that never registered; nothing to deliver on it.
                    self.set_state(EngineState::Disconnected);
                }
            }
        }
    }
}

fn encode(message: &Message) -> Option<String> {
    match protocol::encode(message) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::error!(kind = message.kind(), error = %e, "Failed to encode message");
            None
        }
    }
}

/// Completes at `deadline`; never completes when there is none.
async fn expires(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
