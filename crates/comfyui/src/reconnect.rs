//! Backoff policy for re-establishing the event socket.
//!
//! [`reconnect_loop`] waits, dials, and on failure waits longer, until a
//! connection is made, the attempt budget runs out, or the caller's
//! token is cancelled. Each attempt is published as
//! [`ConnectionState::Reconnecting`].

use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClient, ComfyUIConnection};
use crate::events::ConnectionState;

/// Exponential backoff settings.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Wait before the first attempt.
    pub initial_delay: Duration,
    /// Ceiling for any single wait.
    pub max_delay: Duration,
    /// Growth factor applied after each failed attempt.
    pub multiplier: f64,
    /// Attempts before giving up; `None` never gives up.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: Some(10),
        }
    }
}

impl ReconnectConfig {
    /// The wait that follows `current`, capped at `max_delay`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        Duration::try_from_secs_f64(current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether `made` attempts use up the budget.
    pub fn is_exhausted(&self, made: u32) -> bool {
        self.max_attempts.is_some_and(|max| made >= max)
    }
}

/// Why [`reconnect_loop`] stopped without a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReconnectError {
    #[error("reconnect cancelled")]
    Cancelled,

    #[error("gave up after {attempts} reconnect attempts")]
    Exhausted { attempts: u32 },
}

/// Dial `client` until it connects, backing off between attempts.
pub async fn reconnect_loop(
    client: &ComfyUIClient,
    config: &ReconnectConfig,
    state: &watch::Sender<ConnectionState>,
    cancel: &CancellationToken,
) -> Result<ComfyUIConnection, ReconnectError> {
    let client_id = client.client_id();
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    while !config.is_exhausted(attempt) {
        attempt += 1;
        state.send_replace(ConnectionState::Reconnecting { attempt });
        tracing::info!(
            client_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Waiting to reconnect",
        );

        let dialed = tokio::select! {
            _ = cancel.cancelled() => None,
            result = async {
                tokio::time::sleep(delay).await;
                client.connect().await
            } => Some(result),
        };

        match dialed {
            None => {
                tracing::info!(client_id, "Reconnect cancelled");
                return Err(ReconnectError::Cancelled);
            }
            Some(Ok(conn)) => {
                tracing::info!(client_id, attempt, "Event socket re-established");
                return Ok(conn);
            }
            Some(Err(e)) => {
                tracing::warn!(client_id, attempt, error = %e, "Reconnect attempt failed");
            }
        }

        delay = config.next_delay(delay);
    }

    tracing::error!(client_id, attempts = attempt, "Giving up on the event socket");
    Err(ReconnectError::Exhausted { attempts: attempt })
}
