//! Client for a ComfyUI-style graph execution backend.
//!
//! Provides the HTTP API wrappers (asset upload, prompt submission,
//! artifact retrieval, cancellation), typed WebSocket message parsing,
//! a persistent auto-reconnecting [`channel::EventChannel`], per-prompt
//! event routing, and the [`correlator::CompletionCorrelator`] that turns
//! a prompt's event stream into its downloaded output images.

pub mod api;
pub mod channel;
pub mod client;
pub mod correlator;
pub mod events;
pub mod messages;
pub mod processor;
pub mod reconnect;
pub mod router;
