//! Persistent, auto-reconnecting event channel.
//!
//! [`EventChannel`] owns the single WebSocket session this process keeps
//! with the backend. A background task runs connect -> process ->
//! reconnect until shutdown, feeding every prompt-scoped message into
//! the shared [`JobRouter`]. Connection health is published on a
//! [`watch`] channel so in-flight jobs can fail fast when reconnection
//! gives up.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClient, ComfyUIConnection};
use crate::events::ConnectionState;
use crate::processor::process_messages;
use crate::reconnect::{reconnect_loop, ReconnectConfig, ReconnectError};
use crate::router::JobRouter;

/// How long [`EventChannel::shutdown`] waits for the task to exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The process-wide event socket and its router.
///
/// Created once by the owning service and shared behind an `Arc`.
pub struct EventChannel {
    client: Arc<ComfyUIClient>,
    router: Arc<JobRouter>,
    reconnect: ReconnectConfig,
    connect_timeout: Duration,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

/// Errors from [`EventChannel::ensure_connected`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// No settled state was reached in time.
    #[error("Timed out after {0:?} waiting for the event channel")]
    Timeout(Duration),

    /// Reconnection gave up.
    #[error("Event channel failed: reconnect attempts exhausted")]
    Failed,

    /// The channel was shut down.
    #[error("Event channel is shut down")]
    Closed,
}

impl EventChannel {
    pub fn new(client: ComfyUIClient, reconnect: ReconnectConfig, connect_timeout: Duration) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            client: Arc::new(client),
            router: Arc::new(JobRouter::new()),
            reconnect,
            connect_timeout,
            state_tx: Arc::new(state_tx),
            task: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Session id the backend addresses this channel's events to.
    pub fn session_id(&self) -> &str {
        self.client.client_id()
    }

    pub fn router(&self) -> &Arc<JobRouter> {
        &self.router
    }

    /// Current connection health.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch connection health changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Make sure the socket is open, starting the connection task if
    /// none is running.
    ///
    /// Idempotent: concurrent callers share one task and all wait for
    /// the same `Connected` (or `Failed`) state. A channel that reached
    /// `Failed` is restarted by the next call.
    pub async fn ensure_connected(&self) -> Result<(), ChannelError> {
        {
            let mut task = self.task.lock().await;
            if self.cancel.is_cancelled() {
                return Err(ChannelError::Closed);
            }

            let running = task.as_ref().is_some_and(|handle| !handle.is_finished());
            if !running {
                self.state_tx.send_replace(ConnectionState::Connecting);
                tracing::info!(
                    client_id = self.client.client_id(),
                    ws_url = self.client.ws_url(),
                    "Starting event channel",
                );
                *task = Some(tokio::spawn(run_connection_loop(
                    Arc::clone(&self.client),
                    Arc::clone(&self.router),
                    self.reconnect.clone(),
                    Arc::clone(&self.state_tx),
                    self.cancel.clone(),
                )));
            }
        }

        let mut rx = self.state_tx.subscribe();
        let settled = tokio::time::timeout(self.connect_timeout, async {
            rx.wait_for(|state| state.is_settled())
                .await
                .map(|state| *state)
        })
        .await;

        match settled {
            Ok(Ok(ConnectionState::Connected)) => Ok(()),
            Ok(Ok(_)) => Err(ChannelError::Failed),
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => Err(ChannelError::Timeout(self.connect_timeout)),
        }
    }

    /// Stop the connection task and close the socket.
    pub async fn shutdown(&self) {
        tracing::info!(client_id = self.client.client_id(), "Shutting down event channel");
        self.cancel.cancel();

        if let Some(handle) = self.task.lock().await.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                tracing::warn!("Event channel task did not exit in time");
            }
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }
}

/// Core connection loop: connect -> process messages -> reconnect.
///
/// Runs until cancelled or until reconnection gives up, in which case
/// the state is left at [`ConnectionState::Failed`].
async fn run_connection_loop(
    client: Arc<ComfyUIClient>,
    router: Arc<JobRouter>,
    config: ReconnectConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    cancel: CancellationToken,
) {
    let client_id = client.client_id().to_string();
    let mut pending: Option<ComfyUIConnection> = None;

    loop {
        let conn = match pending.take() {
            Some(conn) => conn,
            None => {
                let first = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = client.connect() => result,
                };
                match first {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(
                            client_id = %client_id,
                            error = %e,
                            "Connection failed, entering reconnect loop",
                        );
                        match reconnect_loop(&client, &config, &state, &cancel).await {
                            Ok(conn) => conn,
                            Err(ReconnectError::Cancelled) => break,
                            Err(ReconnectError::Exhausted { .. }) => {
                                state.send_replace(ConnectionState::Failed);
                                return;
                            }
                        }
                    }
                }
            }
        };

        state.send_replace(ConnectionState::Connected);

        // Process messages until the connection drops.
        let mut ws_stream = conn.ws_stream;
        let cancelled = tokio::select! {
            _ = cancel.cancelled() => true,
            end = process_messages(&mut ws_stream, &router) => {
                tracing::info!(client_id = %client_id, ?end, "Event stream ended");
                false
            }
        };

        if cancelled {
            let _ = ws_stream.close(None).await;
            break;
        }

        tracing::info!(client_id = %client_id, "Connection lost, entering reconnect loop");
        match reconnect_loop(&client, &config, &state, &cancel).await {
            Ok(conn) => pending = Some(conn),
            Err(ReconnectError::Cancelled) => break,
            Err(ReconnectError::Exhausted { .. }) => {
                state.send_replace(ConnectionState::Failed);
                return;
            }
        }
    }

    state.send_replace(ConnectionState::Disconnected);
    tracing::info!(client_id = %client_id, "Event channel task exited");
}
