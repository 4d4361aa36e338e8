//! Job model: what a caller asks for, what the queue tracks, and what a
//! successful job returns.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tryon_comfyui::correlator::OutputImage;
use tryon_core::types::Timestamp;
use uuid::Uuid;

/// Title of the asset node that receives the person photo.
pub const PRIMARY_ASSET_TITLE: &str = "Load Human Image";
/// Title of the asset node that receives the garment photo.
pub const SECONDARY_ASSET_TITLE: &str = "Load Garment Image";

/// A local file to upload and bind to the asset node titled `title`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedAsset {
    pub title: String,
    pub path: PathBuf,
    /// Uploaded as `<upload_prefix>_<unix millis>.<ext>`.
    pub upload_prefix: String,
}

impl NamedAsset {
    pub fn new(
        title: impl Into<String>,
        path: impl Into<PathBuf>,
        upload_prefix: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            path: path.into(),
            upload_prefix: upload_prefix.into(),
        }
    }

    /// Server-side name to request for an upload made at `millis`.
    pub fn upload_name(&self, millis: i64) -> String {
        match self.path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{}_{millis}.{ext}", self.upload_prefix),
            None => format!("{}_{millis}", self.upload_prefix),
        }
    }
}

/// One unit of work handed to the queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    pub assets: Vec<NamedAsset>,
    /// Overrides the configured template for this job.
    #[serde(default)]
    pub workflow_path: Option<PathBuf>,
    /// Opaque caller data handed back untouched with the output.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl JobRequest {
    /// A try-on request: the person photo plus an optional garment.
    pub fn try_on(primary: impl Into<PathBuf>, secondary: Option<PathBuf>) -> Self {
        let mut assets = vec![NamedAsset::new(PRIMARY_ASSET_TITLE, primary, "human")];
        if let Some(path) = secondary {
            assets.push(NamedAsset::new(SECONDARY_ASSET_TITLE, path, "garment"));
        }
        Self {
            assets,
            ..Default::default()
        }
    }

    pub fn with_workflow(mut self, path: impl Into<PathBuf>) -> Self {
        self.workflow_path = Some(path.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Lifecycle of an [`ExecutionJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Submitted,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    /// Whether `self -> next` is a legal step.
    ///
    /// A job may fail from any live state (preparation failures happen
    /// while `Queued`), but only a submitted job can run, complete or
    /// time out.
    pub fn can_transition_to(self, next: Self) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Submitted)
                | (Submitted, Running)
                | (Submitted | Running, Completed | TimedOut)
                | (Queued | Submitted | Running, Failed)
        )
    }
}

/// Queue-side record of one job.
#[derive(Debug, Clone)]
pub struct ExecutionJob {
    pub local_id: Uuid,
    pub request: JobRequest,
    pub enqueued_at: Timestamp,
    pub submitted_at: Option<Timestamp>,
    /// Backend-assigned prompt id, set on submission.
    pub server_job_id: Option<String>,
    pub state: JobState,
}

impl ExecutionJob {
    pub fn new(request: JobRequest) -> Self {
        Self {
            local_id: Uuid::new_v4(),
            request,
            enqueued_at: chrono::Utc::now(),
            submitted_at: None,
            server_job_id: None,
            state: JobState::Queued,
        }
    }

    /// Move to `next`, ignoring (and logging) illegal steps.
    ///
    /// Returns whether the state changed.
    pub fn advance(&mut self, next: JobState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::warn!(
                local_id = %self.local_id,
                from = ?self.state,
                to = ?next,
                "Ignoring invalid job state transition",
            );
            return false;
        }
        tracing::debug!(local_id = %self.local_id, from = ?self.state, to = ?next, "Job state change");
        self.state = next;
        true
    }

    /// Record the backend's prompt id and enter `Submitted`.
    pub fn mark_submitted(&mut self, prompt_id: &str) -> bool {
        if !self.advance(JobState::Submitted) {
            return false;
        }
        self.server_job_id = Some(prompt_id.to_string());
        self.submitted_at = Some(chrono::Utc::now());
        true
    }
}

/// What a completed job resolves to.
#[derive(Debug, Clone)]
pub struct JobOutput {
    pub local_id: Uuid,
    pub prompt_id: String,
    /// Every image the prompt produced, in the order reported.
    pub images: Vec<OutputImage>,
    /// The request's `metadata`, unchanged.
    pub metadata: serde_json::Value,
}

impl JobOutput {
    /// The first image, for callers that expect a single result.
    pub fn primary_image(&self) -> Option<&OutputImage> {
        self.images.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_names_keep_extension() {
        let asset = NamedAsset::new(PRIMARY_ASSET_TITLE, "/photos/me.JPG", "human");
        assert_eq!(asset.upload_name(1700000000123), "human_1700000000123.JPG");

        let bare = NamedAsset::new(PRIMARY_ASSET_TITLE, "/photos/me", "human");
        assert_eq!(bare.upload_name(5), "human_5");
    }

    #[test]
    fn try_on_request_roles() {
        let solo = JobRequest::try_on("/a.png", None);
        assert_eq!(solo.assets.len(), 1);
        assert_eq!(solo.assets[0].title, PRIMARY_ASSET_TITLE);

        let pair = JobRequest::try_on("/a.png", Some("/b.jpg".into()));
        assert_eq!(pair.assets[1].title, SECONDARY_ASSET_TITLE);
        assert_eq!(pair.assets[1].upload_prefix, "garment");
    }

    #[test]
    fn happy_path_transitions() {
        let mut job = ExecutionJob::new(JobRequest::default());
        assert_eq!(job.state, JobState::Queued);

        assert!(job.mark_submitted("p1"));
        assert_eq!(job.server_job_id.as_deref(), Some("p1"));
        assert!(job.submitted_at.is_some());

        assert!(job.advance(JobState::Running));
        assert!(job.advance(JobState::Completed));
        assert!(job.state.is_terminal());
    }

    #[test]
    fn illegal_transitions_are_ignored() {
        let mut job = ExecutionJob::new(JobRequest::default());
        assert!(!job.advance(JobState::Running));
        assert!(!job.advance(JobState::TimedOut));
        assert_eq!(job.state, JobState::Queued);

        assert!(job.advance(JobState::Failed));
        assert!(!job.advance(JobState::Submitted));
        assert!(!job.mark_submitted("late"));
        assert!(job.server_job_id.is_none());
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [JobState::Completed, JobState::Failed, JobState::TimedOut] {
            for next in [
                JobState::Queued,
                JobState::Submitted,
                JobState::Running,
                JobState::Completed,
                JobState::Failed,
                JobState::TimedOut,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }
}
