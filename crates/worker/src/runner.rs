//! Runs one queue entry from template to downloaded outputs.
//!
//! The pipeline is: make sure the event channel is up, check the local
//! files, normalize the template, upload and bind each asset, submit,
//! then wait for the prompt's terminal event under the job timeout.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tryon_comfyui::api::ComfyUIApi;
use tryon_comfyui::channel::EventChannel;
use tryon_comfyui::correlator::{CompletionCorrelator, CompletionError, OutputImage};
use tryon_comfyui::events::{ConnectionState, JobEvent};
use tryon_comfyui::router::JobSubscription;
use tryon_core::graph::{CanonicalGraph, GraphNormalizer};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::JobError;
use crate::job::{ExecutionJob, JobOutput, JobState};

/// Longest a timed-out job waits on its backend cancel before rejecting.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Executes jobs against one backend. Holds no per-job state.
pub struct JobRunner {
    api: Arc<ComfyUIApi>,
    channel: Arc<EventChannel>,
    correlator: CompletionCorrelator,
    normalizer: GraphNormalizer,
    workflow_path: PathBuf,
    asset_node_kind: String,
    job_timeout: Duration,
    prompt_dump_dir: Option<PathBuf>,
}

/// How waiting on a submitted prompt ended.
enum WaitOutcome {
    Finished(Result<Vec<OutputImage>, CompletionError>),
    TimedOut,
    ConnectionFailed,
}

impl JobRunner {
    pub fn new(config: &WorkerConfig, api: Arc<ComfyUIApi>, channel: Arc<EventChannel>) -> Self {
        Self {
            correlator: CompletionCorrelator::new(Arc::clone(&api), config.output_dir.clone()),
            api,
            channel,
            normalizer: GraphNormalizer::new(config.pass_through_kinds.iter().cloned()),
            workflow_path: config.workflow_path.clone(),
            asset_node_kind: config.asset_node_kind.clone(),
            job_timeout: config.job_timeout,
            prompt_dump_dir: config.prompt_dump_dir.clone(),
        }
    }

    /// Run `job` to a terminal state.
    ///
    /// On return the job is `Completed`, `Failed` or `TimedOut`, and no
    /// route for its prompt remains registered.
    pub async fn run(&self, job: &mut ExecutionJob) -> Result<JobOutput, JobError> {
        tracing::info!(
            local_id = %job.local_id,
            assets = job.request.assets.len(),
            "Processing job",
        );

        let result = self.execute(job).await;
        if result.is_err() && !job.state.is_terminal() {
            job.advance(JobState::Failed);
        }

        match &result {
            Ok(output) => tracing::info!(
                local_id = %job.local_id,
                prompt_id = %output.prompt_id,
                images = output.images.len(),
                "Job completed",
            ),
            Err(e) => tracing::warn!(
                local_id = %job.local_id,
                prompt_id = ?job.server_job_id,
                state = ?job.state,
                error = %e,
                "Job failed",
            ),
        }
        result
    }

    async fn execute(&self, job: &mut ExecutionJob) -> Result<JobOutput, JobError> {
        self.channel.ensure_connected().await?;

        for asset in &job.request.assets {
            ensure_file_exists(&asset.path).await?;
        }

        let template_path = job
            .request
            .workflow_path
            .clone()
            .unwrap_or_else(|| self.workflow_path.clone());
        let template = read_template(&template_path).await?;
        let mut graph = self.normalizer.normalize_bytes(&template)?;

        // Fail on a missing asset node before uploading anything.
        for asset in &job.request.assets {
            if graph.find_titled(&self.asset_node_kind, &asset.title).is_none() {
                return Err(tryon_core::error::GraphError::AssetNodeMissing {
                    kind: self.asset_node_kind.clone(),
                    title: asset.title.clone(),
                }
                .into());
            }
        }

        self.upload_assets(job, &mut graph).await?;

        let prompt = graph.to_value();
        self.dump_prompt(job.local_id, &prompt).await;

        let session_id = self.channel.session_id();
        let response = self
            .api
            .submit_workflow(&prompt, session_id)
            .await
            .map_err(|source| JobError::Submission {
                source,
                request_body: serde_json::json!({
                    "prompt": &prompt,
                    "client_id": session_id,
                })
                .to_string(),
            })?;

        // Events that beat this registration sit in the router backlog.
        let mut subscription = self.channel.router().register(&response.prompt_id);
        job.mark_submitted(&response.prompt_id);
        tracing::info!(
            local_id = %job.local_id,
            prompt_id = %response.prompt_id,
            queue_number = response.number,
            "Workflow submitted",
        );

        let images = self.await_terminal(job, &mut subscription).await?;
        Ok(JobOutput {
            local_id: job.local_id,
            prompt_id: response.prompt_id,
            images,
            metadata: job.request.metadata.clone(),
        })
    }

    async fn upload_assets(
        &self,
        job: &ExecutionJob,
        graph: &mut CanonicalGraph,
    ) -> Result<(), JobError> {
        for asset in &job.request.assets {
            let desired = asset.upload_name(chrono::Utc::now().timestamp_millis());
            let uploaded = self
                .api
                .upload_image(&asset.path, &desired)
                .await
                .map_err(|e| JobError::upload(&asset.title, e))?;

            let node = graph.bind_asset(&self.asset_node_kind, &asset.title, &uploaded.name)?;
            tracing::info!(
                local_id = %job.local_id,
                title = %asset.title,
                node = %node,
                server_name = %uploaded.name,
                "Asset uploaded",
            );
        }
        Ok(())
    }

    /// Wait for the prompt to finish, time out, or lose its channel.
    async fn await_terminal(
        &self,
        job: &mut ExecutionJob,
        subscription: &mut JobSubscription,
    ) -> Result<Vec<OutputImage>, JobError> {
        let prompt_id = subscription.prompt_id().to_string();
        let mut state_rx = self.channel.subscribe_state();

        let connection_failed = async {
            let failed = state_rx
                .wait_for(|state| *state == ConnectionState::Failed)
                .await
                .is_ok();
            if !failed {
                // Channel dropped: nothing more to watch.
                std::future::pending::<()>().await;
            }
        };

        let completion = self.correlator.await_completion(subscription, |event| {
            let starts = matches!(
                event,
                JobEvent::Started | JobEvent::Cached { .. } | JobEvent::Executing { .. }
            );
            if starts && job.state == JobState::Submitted {
                job.advance(JobState::Running);
            }
            if let JobEvent::Progress { value, max } = event {
                tracing::debug!(local_id = %job.local_id, value, max, "Job progress");
            }
        });

        let outcome = tokio::select! {
            result = tokio::time::timeout(self.job_timeout, completion) => match result {
                Ok(result) => WaitOutcome::Finished(result),
                Err(_) => WaitOutcome::TimedOut,
            },
            _ = connection_failed => WaitOutcome::ConnectionFailed,
        };

        match outcome {
            WaitOutcome::Finished(Ok(images)) => {
                job.advance(JobState::Completed);
                Ok(images)
            }
            WaitOutcome::Finished(Err(e)) => {
                job.advance(JobState::Failed);
                Err(e.into())
            }
            WaitOutcome::TimedOut => {
                job.advance(JobState::TimedOut);
                tracing::warn!(
                    local_id = %job.local_id,
                    prompt_id = %prompt_id,
                    timeout_secs = self.job_timeout.as_secs(),
                    "Job timed out, cancelling on backend",
                );
                self.cancel_on_backend(&prompt_id).await;
                Err(JobError::Timeout(self.job_timeout))
            }
            WaitOutcome::ConnectionFailed => {
                job.advance(JobState::Failed);
                Err(JobError::Connection(
                    "event channel failed while waiting for completion".to_string(),
                ))
            }
        }
    }

    /// Best-effort `/queue` delete, bounded by [`CANCEL_GRACE`].
    async fn cancel_on_backend(&self, prompt_id: &str) {
        match tokio::time::timeout(CANCEL_GRACE, self.api.cancel_execution(prompt_id)).await {
            Ok(Ok(())) => tracing::debug!(prompt_id, "Timed-out prompt removed from backend queue"),
            Ok(Err(e)) => {
                tracing::warn!(prompt_id, error = %e, "Failed to cancel timed-out prompt");
            }
            Err(_) => tracing::warn!(
                prompt_id,
                grace_ms = CANCEL_GRACE.as_millis() as u64,
                "Backend did not answer the cancel request in time",
            ),
        }
    }

    /// Write the submitted graph to the dump directory, if configured.
    async fn dump_prompt(&self, local_id: Uuid, prompt: &serde_json::Value) {
        let Some(dir) = &self.prompt_dump_dir else {
            return;
        };
        let path = dir.join(format!("{local_id}.json"));
        let bytes = match serde_json::to_vec_pretty(prompt) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize prompt dump");
                return;
            }
        };

        let written = match tokio::fs::create_dir_all(dir).await {
            Ok(()) => tokio::fs::write(&path, bytes).await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => tracing::debug!(path = %path.display(), "Prompt dumped"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to write prompt dump"),
        }
    }
}

async fn ensure_file_exists(path: &Path) -> Result<(), JobError> {
    match tokio::fs::try_exists(path).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(JobError::AssetNotFound(path.to_path_buf())),
        Err(source) => Err(JobError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn read_template(path: &Path) -> Result<Vec<u8>, JobError> {
    tokio::fs::read(path).await.map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            JobError::AssetNotFound(path.to_path_buf())
        } else {
            JobError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}
