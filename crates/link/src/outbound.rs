//! Bounded outbound frame queue.
//!
//! Frames are either [`Priority::Droppable`] (liveness traffic that a
//! later frame supersedes) or [`Priority::Critical`] (job replies and
//! results). When the queue is full the oldest droppable frame is
//! evicted; critical frames are never evicted and instead make the
//! producer wait for space. A [`Priority::Handshake`] frame opens one
//! session and is discarded with it.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Default number of frames held while the writer catches up.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Droppable,
    Critical,
    Handshake,
}

/// The queue holds only critical frames and cannot take another one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

/// A queued frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub frame: String,
    pub priority: Priority,
}

pub struct OutboundQueue {
    entries: Mutex<VecDeque<Outbound>>,
    capacity: usize,
    /// Signalled when a frame is pushed.
    ready: Notify,
    /// Signalled when a frame is popped.
    space: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            ready: Notify::new(),
            space: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Append a frame without waiting.
    pub fn push(&self, frame: String, priority: Priority) -> Result<(), QueueFull> {
        self.try_push(Outbound { frame, priority }).map_err(|_| QueueFull)
    }

    /// Append a critical frame, waiting up to `timeout` for space.
    pub async fn push_critical(&self, frame: String, timeout: Duration) -> Result<(), QueueFull> {
        let deadline = Instant::now() + timeout;
        let mut entry = Outbound {
            frame,
            priority: Priority::Critical,
        };
        loop {
            let space = self.space.notified();
            match self.try_push(entry) {
                Ok(()) => return Ok(()),
                Err(rejected) => entry = rejected,
            }
            if tokio::time::timeout_at(deadline, space).await.is_err() {
                return Err(QueueFull);
            }
        }
    }

    /// Put a frame ahead of everything else (session handshake).
    ///
    /// Evicts the oldest droppable frame when full; if none exists the
    /// queue briefly holds one frame more than its capacity.
    pub fn push_front(&self, frame: String) {
        {
            let mut entries = self.lock();
            if entries.len() >= self.capacity {
                evict_droppable(&mut entries);
            }
            entries.push_front(Outbound {
                frame,
                priority: Priority::Handshake,
            });
        }
        self.ready.notify_one();
    }

    /// Wait for and remove the next frame. Cancel-safe.
    pub async fn pop(&self) -> Outbound {
        loop {
            let next = self.lock().pop_front();
            if let Some(entry) = next {
                self.space.notify_one();
                return entry;
            }
            self.ready.notified().await;
        }
    }

    /// Remove the next frame if one is queued.
    pub fn try_pop(&self) -> Option<Outbound> {
        let entry = self.lock().pop_front()?;
        self.space.notify_one();
        Some(entry)
    }

    /// Put back a popped frame that was never written.
    ///
    /// Critical frames return to the front, even past capacity; anything
    /// else is discarded. Returns whether the frame was kept.
    pub fn requeue(&self, entry: Outbound) -> bool {
        if entry.priority != Priority::Critical {
            return false;
        }
        self.lock().push_front(entry);
        self.ready.notify_one();
        true
    }

    /// Discard everything but critical frames, returning how many were
    /// dropped.
    ///
    /// Called when a session ends: stale heartbeats and the old handshake
    /// are useless on the next connection, but job results still have to
    /// go out.
    pub fn retain_critical(&self) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| e.priority == Priority::Critical);
        let dropped = before - entries.len();
        if dropped > 0 {
            self.space.notify_one();
        }
        dropped
    }

    fn try_push(&self, entry: Outbound) -> Result<(), Outbound> {
        {
            let mut entries = self.lock();
            if entries.len() >= self.capacity && !evict_droppable(&mut entries) {
                return Err(entry);
            }
            entries.push_back(entry);
        }
        self.ready.notify_one();
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Outbound>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn evict_droppable(entries: &mut VecDeque<Outbound>) -> bool {
    match entries.iter().position(|e| e.priority == Priority::Droppable) {
        Some(idx) => {
            entries.remove(idx);
            tracing::debug!("Outbound queue full, dropped oldest droppable frame");
            true
        }
        None => false,
    }
}
