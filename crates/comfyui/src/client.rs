//! WebSocket client for connecting to a ComfyUI instance.
//!
//! [`ComfyUIClient`] holds the socket URL and the session id this
//! process uses for every connection. Call [`ComfyUIClient::connect`] to
//! establish a live [`ComfyUIConnection`].

use tokio_tungstenite::{connect_async, MaybeTlsStream};

/// The raw socket type produced by [`ComfyUIClient::connect`].
pub type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Configuration handle for the event socket of one ComfyUI instance.
///
/// The session id is fixed for the lifetime of the client: the backend
/// addresses a prompt's events to the `client_id` it was submitted with,
/// so reconnects must present the same id.
pub struct ComfyUIClient {
    ws_url: String,
    client_id: String,
}

/// A live WebSocket connection to a ComfyUI instance.
pub struct ComfyUIConnection {
    /// Session id sent during the WebSocket handshake.
    pub client_id: String,
    /// The raw WebSocket stream for reading/writing frames.
    pub ws_stream: WsStream,
}

impl ComfyUIClient {
    /// Create a client with a fresh random session id.
    ///
    /// * `ws_url` - WebSocket base URL, e.g. `ws://host:8188`.
    pub fn new(ws_url: String) -> Self {
        Self::with_client_id(ws_url, uuid::Uuid::new_v4().to_string())
    }

    /// Create a client with a caller-chosen session id.
    pub fn with_client_id(ws_url: String, client_id: String) -> Self {
        Self { ws_url, client_id }
    }

    /// WebSocket base URL (e.g. `ws://host:8188`).
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Session id presented on every connection.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Connect to the ComfyUI WebSocket endpoint.
    ///
    /// The session id is appended as the `clientId` query parameter so
    /// that ComfyUI can address prompt events back to this client.
    pub async fn connect(&self) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let url = format!("{}/ws?clientId={}", self.ws_url, self.client_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(
            client_id = %self.client_id,
            "Connected to ComfyUI at {}",
            self.ws_url,
        );

        Ok(ComfyUIConnection {
            client_id: self.client_id.clone(),
            ws_stream,
        })
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// The socket could not be (re)established.
    #[error("Connection error: {0}")]
    Connection(String),
}
