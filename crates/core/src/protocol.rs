//! Dispatcher wire protocol.
//!
//! Every frame is a single JSON object tagged by its `"type"` field, e.g.
//! `{"type":"job_accepted","job_id":"build-42"}`. Binary fields (job
//! payloads, job output) are carried as standard base64 strings.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::Capacity;
use crate::error::ProtocolError;
use crate::identity::Identity;
use crate::types::JobId;

/// All messages exchanged with the dispatcher, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Node -> dispatcher: registration request, first frame of a session.
    Hello {
        identity: Identity,
        capacity: Capacity,
    },

    /// Dispatcher -> node: registration accepted.
    Welcome,

    /// Node -> dispatcher: liveness and free capacity.
    Heartbeat { identity: Identity, free_slots: u32 },

    /// Dispatcher -> node: heartbeat received.
    HeartbeatAck,

    /// Dispatcher -> node: run this job.
    JobAssign {
        job_id: JobId,
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
    },

    /// Node -> dispatcher: the job owns a slot.
    JobAccepted { job_id: JobId },

    /// Node -> dispatcher: the job was not taken.
    JobRejected { job_id: JobId, reason: RejectReason },

    /// Node -> dispatcher: terminal outcome of an accepted job.
    JobDone { job_id: JobId, outcome: JobOutcome },

    /// Dispatcher -> node: drain and disconnect.
    Shutdown,
}

impl Message {
    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::Welcome => "welcome",
            Message::Heartbeat { .. } => "heartbeat",
            Message::HeartbeatAck => "heartbeat_ack",
            Message::JobAssign { .. } => "job_assign",
            Message::JobAccepted { .. } => "job_accepted",
            Message::JobRejected { .. } => "job_rejected",
            Message::JobDone { .. } => "job_done",
            Message::Shutdown => "shutdown",
        }
    }
}

/// Why a `JobAssign` was turned down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Every slot is busy.
    Overcapacity,
    /// The node is shutting down and takes no new work.
    Draining,
}

/// Terminal outcome of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Success {
        #[serde(with = "base64_bytes")]
        output: Vec<u8>,
    },
    Failure {
        reason: FailureReason,
    },
}

impl JobOutcome {
    pub fn success(output: impl Into<Vec<u8>>) -> Self {
        JobOutcome::Success {
            output: output.into(),
        }
    }

    pub fn failure(reason: FailureReason) -> Self {
        JobOutcome::Failure { reason }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success { .. })
    }
}

/// Why a job ended without success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The job ran and reported an error.
    Error { message: String },
    /// The worker died (panic, abort, killed by a signal).
    WorkerCrashed,
    /// The result could not be queued for delivery in time.
    DeliveryTimeout,
    /// The job was still running when the shutdown drain expired.
    ShutdownTimeout,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Error { message } => write!(f, "error: {message}"),
            FailureReason::WorkerCrashed => f.write_str("worker crashed"),
            FailureReason::DeliveryTimeout => f.write_str("delivery timeout"),
            FailureReason::ShutdownTimeout => f.write_str("shutdown timeout"),
        }
    }
}

/// Serialize a message into a single text frame.
pub fn encode(message: &Message) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

/// Parse a text frame.
///
/// Returns `Err` for malformed JSON or unknown `type` values. Callers
/// should log and skip the frame.
pub fn decode(frame: &str) -> Result<Message, ProtocolError> {
    Ok(serde_json::from_str(frame)?)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}
