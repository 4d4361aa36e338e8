//! HTTP side of the backend: asset upload, prompt submission, artifact
//! download and queue deletion.

use std::path::{Path, PathBuf};

use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use crate::messages::ImageRef;

/// HTTP client for a single ComfyUI instance.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Body of a successful `/prompt` call.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
}

/// Raw `/upload/image` response; both fields are required in practice
/// but checked explicitly so a partial body is reported clearly.
#[derive(Debug, Deserialize)]
struct UploadResponse {
    name: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    subfolder: String,
}

/// An asset stored on the server by [`ComfyUIApi::upload_image`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedAsset {
    /// Server-assigned file name, to be written into the graph.
    pub name: String,
    /// Storage area the asset landed in (normally `input`).
    pub kind: String,
    pub subfolder: String,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        status: u16,
        body: String,
    },

    /// A 2xx response without the fields the caller needs.
    #[error("Unexpected ComfyUI response: {0}")]
    UnexpectedResponse(String),

    /// The local file to upload does not exist.
    #[error("Asset not found: {}", .0.display())]
    AssetNotFound(PathBuf),

    /// The local file exists but could not be read.
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
        }
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self { client, api_url }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Upload a local image so a graph can reference it.
    ///
    /// Reads the whole file, then sends a `POST /upload/image` multipart
    /// request with the bytes under `image` (file name `desired_name`) and
    /// `overwrite=true`. No retry happens here.
    pub async fn upload_image(
        &self,
        local_path: &Path,
        desired_name: &str,
    ) -> Result<UploadedAsset, ComfyUIApiError> {
        let bytes = match tokio::fs::read(local_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ComfyUIApiError::AssetNotFound(local_path.to_path_buf()));
            }
            Err(source) => {
                return Err(ComfyUIApiError::Io {
                    path: local_path.to_path_buf(),
                    source,
                });
            }
        };

        tracing::debug!(
            path = %local_path.display(),
            name = desired_name,
            size = bytes.len(),
            "Uploading asset",
        );

        let part = Part::bytes(bytes)
            .file_name(desired_name.to_string())
            .mime_str(content_type_for(desired_name))?;
        let form = Form::new()
            .part("image", part)
            .text("overwrite", "true");

        let response = self
            .client
            .post(format!("{}/upload/image", self.api_url))
            .multipart(form)
            .send()
            .await?;

        let body: UploadResponse = Self::read_json(response).await?;
        match (body.name, body.kind) {
            (Some(name), Some(kind)) => Ok(UploadedAsset {
                name,
                kind,
                subfolder: body.subfolder,
            }),
            _ => Err(ComfyUIApiError::UnexpectedResponse(
                "upload response is missing 'name' or 'type'".to_string(),
            )),
        }
    }

    /// Queue a canonical graph under `client_id`.
    ///
    /// `POST /prompt` with body `{"prompt": .., "client_id": ..}`. The
    /// backend validates the graph synchronously; a rejection comes back
    /// as [`ComfyUIApiError::ApiError`] with the server's explanation.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::read_json(response).await
    }

    /// Download an artifact produced by a prompt.
    ///
    /// Sends `GET /view?filename=..&subfolder=..&type=..` and returns the
    /// raw bytes.
    pub async fn view(&self, image: &ImageRef) -> Result<Vec<u8>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.kind.as_str()),
            ])
            .send()
            .await?;

        let response = Self::expect_2xx(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Drop `prompt_id` from the backend queue (`POST /queue` with
    /// `{"delete": [id]}`). Has no effect on a prompt already running.
    pub async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({
            "delete": [prompt_id],
        });

        let response = self
            .client
            .post(format!("{}/queue", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::expect_2xx(response).await.map(drop)
    }

    /// Turn a non-2xx response into [`ComfyUIApiError::ApiError`],
    /// keeping the body text for diagnostics.
    async fn expect_2xx(response: reqwest::Response) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|e| format!("<body unavailable: {e}>"));
        Err(ComfyUIApiError::ApiError {
            status: status.as_u16(),
            body,
        })
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        Ok(Self::expect_2xx(response).await?.json::<T>().await?)
    }
}

/// MIME type sent with an uploaded file, from its extension.
pub fn content_type_for(file_name: &str) -> &'static str {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "application/octet-stream",
    }
}
