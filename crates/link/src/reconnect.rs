//! Exponential-backoff reconnection to the dispatcher.
//!
//! When the link has no session it calls [`reconnect_loop`] to keep
//! dialing with growing, fully-jittered delays until a connection is
//! established or the [`CancellationToken`] is triggered.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::endpoint::Endpoint;
use crate::transport::{connect_with_timeout, Connector, Transport};

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay ceiling for the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Full jitter: a uniformly random pause in `[0, delay]`.
pub fn jittered(delay: Duration) -> Duration {
    let ceiling = delay.as_millis() as u64;
    Duration::from_millis(rand::rng().random_range(0..=ceiling))
}

/// Dial `endpoint` until it answers.
///
/// `delay` carries the backoff state across calls so that a dispatcher
/// which accepts and immediately drops connections is not hammered.
/// Returns `None` if `cancel` is triggered first.
pub async fn reconnect_loop(
    connector: &dyn Connector,
    endpoint: &Endpoint,
    connect_timeout: Duration,
    config: &ReconnectConfig,
    delay: &mut Duration,
    cancel: &CancellationToken,
) -> Option<Box<dyn Transport>> {
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        tracing::debug!(endpoint = %endpoint, attempt, "Connecting to dispatcher");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(endpoint = %endpoint, "Reconnect cancelled");
                return None;
            }
            result = connect_with_timeout(connector, endpoint, connect_timeout) => {
                match result {
                    Ok(transport) => {
                        if attempt > 1 {
                            tracing::info!(endpoint = %endpoint, attempt, "Reconnected to dispatcher");
                        }
                        return Some(transport);
                    }
                    Err(e) => {
                        tracing::warn!(
                            endpoint = %endpoint,
                            error = %e,
                            "Connect attempt {attempt} failed",
                        );
                    }
                }
            }
        }

        let pause = jittered(*delay);
        tracing::info!(
            endpoint = %endpoint,
            attempt,
            delay_ms = pause.as_millis() as u64,
            "Waiting before next connect attempt",
        );

        // Wait before the next attempt, respecting cancellation.
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(pause) => {}
        }

        *delay = next_delay(*delay, config);
    }
}
