//! The long-lived service value.
//!
//! [`Service::start`] builds the backend clients, the event channel and
//! the request queue once. Collaborators (a message consumer, an HTTP
//! handler) receive the returned `Arc<Service>`.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;

use tryon_comfyui::api::ComfyUIApi;
use tryon_comfyui::channel::EventChannel;
use tryon_comfyui::client::ComfyUIClient;
use tryon_comfyui::events::ConnectionState;

use crate::config::WorkerConfig;
use crate::error::JobError;
use crate::job::{JobOutput, JobRequest};
use crate::queue::{PendingJob, RequestQueue};
use crate::runner::JobRunner;

pub struct Service {
    config: WorkerConfig,
    channel: Arc<EventChannel>,
    queue: RequestQueue,
}

impl Service {
    /// Build the service and start connecting in the background.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start(config: WorkerConfig) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "HTTP client setup failed; using defaults without a timeout");
                reqwest::Client::new()
            });
        let api = Arc::new(ComfyUIApi::with_client(http, config.api_url.clone()));
        let channel = Arc::new(EventChannel::new(
            ComfyUIClient::new(config.ws_url.clone()),
            config.reconnect.clone(),
            config.connect_timeout,
        ));
        let runner = Arc::new(JobRunner::new(&config, api, Arc::clone(&channel)));
        let queue = RequestQueue::start(runner, config.failure_delay);

        tracing::info!(
            api_url = %config.api_url,
            ws_url = %config.ws_url,
            session_id = channel.session_id(),
            "Service started",
        );

        let eager = Arc::clone(&channel);
        tokio::spawn(async move {
            if let Err(e) = eager.ensure_connected().await {
                tracing::warn!(error = %e, "Initial connection failed; will retry per job");
            }
        });

        Arc::new(Self {
            config,
            channel,
            queue,
        })
    }

    pub fn session_id(&self) -> &str {
        self.channel.session_id()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.channel.state()
    }

    /// Watch the event channel's health.
    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.channel.subscribe_state()
    }

    pub fn enqueue(&self, request: JobRequest) -> Result<PendingJob, JobError> {
        self.queue.enqueue(request)
    }

    /// Enqueue and wait for the result.
    pub async fn run(&self, request: JobRequest) -> Result<JobOutput, JobError> {
        self.enqueue(request)?.wait().await
    }

    /// Delete every file in the output directory. Returns how many
    /// were removed; a missing directory counts as empty.
    pub async fn cleanup_outputs(&self) -> Result<usize, JobError> {
        remove_files_in(&self.config.output_dir).await
    }

    /// Stop the queue, then the event channel.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down service");
        self.queue.shutdown().await;
        self.channel.shutdown().await;
    }
}

async fn remove_files_in(dir: &Path) -> Result<usize, JobError> {
    let io_err = |source| JobError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(io_err(e)),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        let path = entry.path();
        let is_file = entry.file_type().await.map_err(io_err)?.is_file();
        if !is_file {
            continue;
        }
        tokio::fs::remove_file(&path)
            .await
            .map_err(|source| JobError::Io { path, source })?;
        removed += 1;
    }

    tracing::info!(dir = %dir.display(), removed, "Cleaned output directory");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cleanup_removes_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.png"), b"a").unwrap();
        std::fs::write(dir.path().join("b.png"), b"b").unwrap();
        std::fs::create_dir(dir.path().join("keep")).unwrap();

        assert_eq!(remove_files_in(dir.path()).await.unwrap(), 2);
        assert!(dir.path().join("keep").exists());
        assert!(!dir.path().join("a.png").exists());
    }

    #[tokio::test]
    async fn cleanup_of_missing_dir_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(remove_files_in(&dir.path().join("nope")).await.unwrap(), 0);
    }
}
