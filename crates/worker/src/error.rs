use std::path::PathBuf;
use std::time::Duration;

use tryon_comfyui::api::ComfyUIApiError;
use tryon_comfyui::channel::ChannelError;
use tryon_comfyui::correlator::CompletionError;
use tryon_core::error::GraphError;

/// Why a job was rejected.
///
/// Every variant is local to one job: the queue keeps advancing after
/// any of them except [`JobError::QueueClosed`].
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The template is not a valid graph, or lacks a required asset node.
    #[error(transparent)]
    MalformedGraph(#[from] GraphError),

    /// A local input file (asset or template) does not exist.
    #[error("Asset not found: {}", .0.display())]
    AssetNotFound(PathBuf),

    /// The backend rejected an asset upload.
    #[error("Upload of '{title}' failed: {source}")]
    Upload {
        title: String,
        #[source]
        source: ComfyUIApiError,
    },

    /// The backend rejected the prompt. `request_body` is the exact JSON
    /// that was posted.
    #[error("Submission failed: {source}")]
    Submission {
        #[source]
        source: ComfyUIApiError,
        request_body: String,
    },

    /// The backend reported the prompt failed.
    #[error("Execution failed: {message}")]
    Execution {
        message: String,
        node_id: Option<String>,
        exception_type: Option<String>,
    },

    /// An output artifact could not be fetched or stored.
    #[error("Output retrieval failed: {0}")]
    Download(#[source] CompletionError),

    /// No terminal event arrived in time.
    #[error("Job timed out after {0:?}")]
    Timeout(Duration),

    /// The event channel is unavailable.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The queue shut down before the job finished.
    #[error("Request queue is closed")]
    QueueClosed,

    /// A local file could not be read or written.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<CompletionError> for JobError {
    fn from(err: CompletionError) -> Self {
        match err {
            CompletionError::Execution {
                message,
                node_id,
                exception_type,
            } => Self::Execution {
                message,
                node_id,
                exception_type,
            },
            CompletionError::ChannelClosed => {
                Self::Connection("event route closed before completion".to_string())
            }
            other => Self::Download(other),
        }
    }
}

impl From<ChannelError> for JobError {
    fn from(err: ChannelError) -> Self {
        Self::Connection(err.to_string())
    }
}

impl JobError {
    /// Map an upload failure, keeping missing files distinct.
    pub(crate) fn upload(title: &str, err: ComfyUIApiError) -> Self {
        match err {
            ComfyUIApiError::AssetNotFound(path) => Self::AssetNotFound(path),
            ComfyUIApiError::Io { path, source } => Self::Io { path, source },
            source => Self::Upload {
                title: title.to_string(),
                source,
            },
        }
    }

    /// Failure before the prompt reached the backend.
    pub fn is_preparation_failure(&self) -> bool {
        matches!(
            self,
            Self::MalformedGraph(_)
                | Self::AssetNotFound(_)
                | Self::Upload { .. }
                | Self::Submission { .. }
                | Self::Connection(_)
                | Self::Io { .. }
        )
    }
}
