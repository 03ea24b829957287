//! Shared building blocks for the Spark node agent.
//!
//! - [`config`] -- validated node configuration and capacity clamping.
//! - [`identity`] -- machine ID / machine name resolution.
//! - [`protocol`] -- dispatcher wire messages and the frame codec.
//! - [`job`] -- job handles and results passed between pool and engine.

pub mod config;
pub mod error;
pub mod identity;
pub mod job;
pub mod protocol;
pub mod types;
