use chrono::Utc;

use crate::protocol::JobOutcome;
use crate::types::{JobId, Timestamp};

/// A job accepted from the dispatcher, ready to be executed.
///
/// The payload is opaque to the node; only the executor interprets it.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub job_id: JobId,
    pub payload: Vec<u8>,
    pub assigned_at: Timestamp,
}

impl JobHandle {
    pub fn new(job_id: JobId, payload: Vec<u8>) -> Self {
        Self {
            job_id,
            payload,
            assigned_at: Utc::now(),
        }
    }
}

/// Terminal result of a job, produced exactly once per [`JobHandle`].
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub job_id: JobId,
    pub outcome: JobOutcome,
}
