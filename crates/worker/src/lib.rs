//! Spark node agent: worker pool and dispatcher protocol engine.
//!
//! - [`engine`] -- the registration/heartbeat/job protocol state machine.
//! - [`pool`] -- fixed-capacity slots and their lifecycle.
//! - [`worker`] -- supervised execution of a single job.
//! - [`executor`] -- the executor seam and the runner-process executor.
//! - [`heartbeat`] -- unanswered heartbeat accounting.
//! - [`shutdown`] -- SIGTERM/SIGINT handling.

pub mod engine;
pub mod executor;
pub mod heartbeat;
pub mod pool;
pub mod shutdown;
pub mod worker;
