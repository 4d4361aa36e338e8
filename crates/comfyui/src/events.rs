//! Events emitted by the ComfyUI bridge.
//!
//! [`JobEvent`]s are the prompt-scoped view of raw WebSocket messages,
//! delivered to whoever registered for that prompt id.
//! [`ConnectionState`] is the observable health of the event socket.

use crate::messages::ImageRef;

/// A prompt-scoped event, already stripped of its `prompt_id`.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// The backend began executing the prompt.
    Started,

    /// Some nodes were served from cache.
    Cached { nodes: Vec<String> },

    /// A node began executing.
    Executing { node: String },

    /// Step progress inside the executing node.
    Progress { value: i32, max: i32 },

    /// A node finished and reported its outputs.
    Executed { node: String, images: Vec<ImageRef> },

    /// Every node finished (`executing` with a null node).
    Completed,

    /// Execution failed or was interrupted.
    Failed(ExecutionFailure),
}

impl JobEvent {
    /// Whether this event ends the prompt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

/// Failure details reported by the backend, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionFailure {
    pub message: String,
    pub node_id: Option<String>,
    pub exception_type: Option<String>,
}

/// Health of the persistent event socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection task is running.
    Disconnected,

    /// The first connection attempt is in flight.
    Connecting,

    /// The socket is open and events are flowing.
    Connected,

    /// The socket dropped; waiting before reconnect attempt `attempt`.
    Reconnecting { attempt: u32 },

    /// Reconnection gave up after its attempt limit.
    Failed,
}

impl ConnectionState {
    /// `Connected` or `Failed`: a waiter has its answer.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Connected | Self::Failed)
    }
}
