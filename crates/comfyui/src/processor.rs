//! WebSocket message processing loop.
//!
//! Reads raw frames from a ComfyUI WebSocket connection, parses them
//! into typed [`ServerMessage`] variants, and dispatches the
//! prompt-scoped ones to the [`JobRouter`] as [`JobEvent`]s.

use futures::StreamExt;
use tokio_tungstenite::tungstenite::Message;

use crate::client::WsStream;
use crate::events::{ExecutionFailure, JobEvent};
use crate::messages::ServerMessage;
use crate::router::JobRouter;

/// Why [`process_messages`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The server sent a close frame.
    Closed,
    /// A receive error tore the connection down.
    Error,
    /// The stream ended without a close frame.
    Exhausted,
}

/// Process WebSocket messages from a ComfyUI connection.
///
/// Loops until the WebSocket closes, encounters a fatal receive error,
/// or the stream is exhausted. Binary frames carry preview images and
/// are ignored.
pub async fn process_messages(ws_stream: &mut WsStream, router: &JobRouter) -> StreamEnd {
    while let Some(msg_result) = ws_stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                handle_text_message(&text, router);
            }
            Ok(Message::Binary(_)) => {
                tracing::trace!("Ignoring binary message (preview image)");
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                // Handled automatically by tungstenite.
            }
            Ok(Message::Close(frame)) => {
                tracing::info!(?frame, "ComfyUI WebSocket closed");
                return StreamEnd::Closed;
            }
            Ok(Message::Frame(_)) => {}
            Err(e) => {
                tracing::error!(error = %e, "WebSocket receive error");
                return StreamEnd::Error;
            }
        }
    }
    StreamEnd::Exhausted
}

/// Parse one text frame and route it.
///
/// Unparseable frames and unknown message types are logged and dropped;
/// they never end the stream.
pub fn handle_text_message(text: &str, router: &JobRouter) {
    let msg = match ServerMessage::parse(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(
                error = %e,
                raw_message = %text,
                "Failed to parse ComfyUI message",
            );
            return;
        }
    };

    let Some((prompt_id, event)) = to_job_event(msg) else {
        return;
    };

    if event.is_terminal() {
        tracing::debug!(prompt_id = %prompt_id, ?event, "Routing terminal event");
    }
    router.dispatch(&prompt_id, event);
}

/// Map a parsed message to the prompt it belongs to and its event.
///
/// Messages without a prompt scope return `None`.
fn to_job_event(msg: ServerMessage) -> Option<(String, JobEvent)> {
    match msg {
        ServerMessage::Status(data) => {
            tracing::debug!(
                queue_remaining = data.status.exec_info.queue_remaining,
                "ComfyUI queue status",
            );
            None
        }
        ServerMessage::ExecutionStart(data) => {
            tracing::info!(prompt_id = %data.prompt_id, "Execution started");
            Some((data.prompt_id, JobEvent::Started))
        }
        ServerMessage::ExecutionCached(data) => {
            tracing::debug!(
                prompt_id = %data.prompt_id,
                cached = data.nodes.len(),
                "Execution used cache",
            );
            Some((data.prompt_id, JobEvent::Cached { nodes: data.nodes }))
        }
        ServerMessage::Executing(data) => match data.node {
            Some(node) => {
                tracing::debug!(prompt_id = %data.prompt_id, node = %node, "Executing node");
                Some((data.prompt_id, JobEvent::Executing { node }))
            }
            None => {
                // node == None means execution is complete for this prompt.
                tracing::info!(
                    prompt_id = %data.prompt_id,
                    "Execution completed (all nodes done)",
                );
                Some((data.prompt_id, JobEvent::Completed))
            }
        },
        ServerMessage::Progress(data) => {
            let percent = if data.max > 0 {
                ((data.value as f64 / data.max as f64) * 100.0) as i16
            } else {
                0
            };
            tracing::debug!(
                prompt_id = ?data.prompt_id,
                value = data.value,
                max = data.max,
                percent,
                "Generation progress",
            );
            // Older servers omit the prompt id; such progress is log-only.
            let prompt_id = data.prompt_id?;
            Some((
                prompt_id,
                JobEvent::Progress {
                    value: data.value,
                    max: data.max,
                },
            ))
        }
        ServerMessage::Executed(data) => {
            let images = data.images();
            tracing::debug!(
                prompt_id = %data.prompt_id,
                node = %data.node,
                images = images.len(),
                "Node executed with output",
            );
            Some((
                data.prompt_id,
                JobEvent::Executed {
                    node: data.node,
                    images,
                },
            ))
        }
        ServerMessage::ExecutionError(data) => {
            tracing::error!(
                prompt_id = %data.prompt_id,
                node_id = ?data.node_id,
                error_type = ?data.exception_type,
                error_message = %data.exception_message,
                "Execution error",
            );
            Some((
                data.prompt_id,
                JobEvent::Failed(ExecutionFailure {
                    message: data.exception_message,
                    node_id: data.node_id,
                    exception_type: data.exception_type,
                }),
            ))
        }
        ServerMessage::ExecutionInterrupted(data) => {
            tracing::warn!(
                prompt_id = %data.prompt_id,
                node_id = ?data.node_id,
                "Execution interrupted",
            );
            Some((
                data.prompt_id,
                JobEvent::Failed(ExecutionFailure {
                    message: "Execution interrupted".to_string(),
                    node_id: data.node_id,
                    exception_type: None,
                }),
            ))
        }
        ServerMessage::ExecutionSuccess(data) => {
            tracing::debug!(prompt_id = %data.prompt_id, "Execution reported success");
            None
        }
    }
}
