//! Turns one prompt's event stream into its output images.
//!
//! [`CompletionCorrelator::await_completion`] consumes a
//! [`JobSubscription`] until the prompt completes or fails. Every image
//! reported by an `executed` event is downloaded through `/view` and
//! persisted under the output directory, in the order reported.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::events::{ExecutionFailure, JobEvent};
use crate::messages::ImageRef;
use crate::router::JobSubscription;

/// One artifact produced by a prompt, downloaded and stored locally.
#[derive(Debug, Clone)]
pub struct OutputImage {
    /// Node that reported the image.
    pub node: String,
    /// Server-side location of the artifact.
    pub source: ImageRef,
    /// Where the bytes were written.
    pub path: PathBuf,
    pub data: Vec<u8>,
}

/// Errors while waiting for a prompt to finish.
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    /// The backend reported an execution error or interruption.
    #[error("Execution failed: {message}")]
    Execution {
        message: String,
        node_id: Option<String>,
        exception_type: Option<String>,
    },

    /// An artifact could not be fetched.
    #[error("Failed to download '{filename}': {source}")]
    Download {
        filename: String,
        #[source]
        source: ComfyUIApiError,
    },

    /// An artifact could not be written locally.
    #[error("Failed to write {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The route closed before a terminal event arrived.
    #[error("Event route closed before completion")]
    ChannelClosed,
}

impl From<ExecutionFailure> for CompletionError {
    fn from(failure: ExecutionFailure) -> Self {
        Self::Execution {
            message: failure.message,
            node_id: failure.node_id,
            exception_type: failure.exception_type,
        }
    }
}

/// Waits on prompt events and collects the images they announce.
pub struct CompletionCorrelator {
    api: Arc<ComfyUIApi>,
    output_dir: PathBuf,
}

impl CompletionCorrelator {
    pub fn new(api: Arc<ComfyUIApi>, output_dir: PathBuf) -> Self {
        Self { api, output_dir }
    }

    /// Consume events for one prompt until it finishes.
    ///
    /// `on_event` sees every event before it is acted on. Images are
    /// downloaded as their `executed` event arrives; the accumulated
    /// list is returned on completion and may be empty.
    pub async fn await_completion<F>(
        &self,
        subscription: &mut JobSubscription,
        mut on_event: F,
    ) -> Result<Vec<OutputImage>, CompletionError>
    where
        F: FnMut(&JobEvent),
    {
        let prompt_id = subscription.prompt_id().to_string();
        let mut images = Vec::new();

        while let Some(event) = subscription.recv().await {
            on_event(&event);
            match event {
                JobEvent::Executed {
                    node,
                    images: refs,
                } => {
                    for image in refs {
                        images.push(self.fetch(&node, image).await?);
                    }
                }
                JobEvent::Completed => {
                    if images.is_empty() {
                        tracing::warn!(prompt_id = %prompt_id, "Prompt completed without images");
                    } else {
                        tracing::info!(
                            prompt_id = %prompt_id,
                            count = images.len(),
                            "Prompt outputs collected",
                        );
                    }
                    return Ok(images);
                }
                JobEvent::Failed(failure) => {
                    tracing::warn!(
                        prompt_id = %prompt_id,
                        error = %failure.message,
                        node_id = ?failure.node_id,
                        "Prompt failed",
                    );
                    return Err(failure.into());
                }
                JobEvent::Started
                | JobEvent::Cached { .. }
                | JobEvent::Executing { .. }
                | JobEvent::Progress { .. } => {}
            }
        }

        Err(CompletionError::ChannelClosed)
    }

    async fn fetch(&self, node: &str, image: ImageRef) -> Result<OutputImage, CompletionError> {
        let data = self
            .api
            .view(&image)
            .await
            .map_err(|source| CompletionError::Download {
                filename: image.filename.clone(),
                source,
            })?;

        let path = self.output_dir.join(local_file_name(&image.filename));
        persist(&path, &data).await?;

        tracing::debug!(
            node,
            filename = %image.filename,
            path = %path.display(),
            size = data.len(),
            "Saved output image",
        );

        Ok(OutputImage {
            node: node.to_string(),
            source: image,
            path,
            data,
        })
    }
}

/// Final path component of a server-reported name, so a hostile
/// `filename` cannot escape the output directory.
fn local_file_name(filename: &str) -> String {
    Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("output.bin")
        .to_string()
}

async fn persist(path: &Path, data: &[u8]) -> Result<(), CompletionError> {
    let to_err = |source| CompletionError::Persist {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(to_err)?;
    }
    tokio::fs::write(path, data).await.map_err(to_err)
}
