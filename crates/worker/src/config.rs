use std::path::PathBuf;
use std::time::Duration;

use tryon_comfyui::reconnect::ReconnectConfig;
use tryon_core::graph::normalize::DEFAULT_PASS_THROUGH_KIND;

/// Worker configuration loaded from environment variables.
///
/// All fields have defaults suitable for a backend on localhost.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// HTTP base of the backend (default: `http://127.0.0.1:8188`).
    pub api_url: String,
    /// Event socket base; derived from `api_url` unless set.
    pub ws_url: String,
    /// Graph template, re-read for every job.
    pub workflow_path: PathBuf,
    /// Where downloaded artifacts are written.
    pub output_dir: PathBuf,
    /// Window for a submitted job to reach a terminal event.
    pub job_timeout: Duration,
    /// Pause before advancing after a job fails before submission.
    pub failure_delay: Duration,
    /// How long to wait for the event channel to connect.
    pub connect_timeout: Duration,
    /// Whole-request limit for every backend HTTP call.
    pub http_timeout: Duration,
    pub reconnect: ReconnectConfig,
    /// Node kinds elided during normalization.
    pub pass_through_kinds: Vec<String>,
    /// Node kind that loads an uploaded asset.
    pub asset_node_kind: String,
    /// When set, each submitted graph is also written here.
    pub prompt_dump_dir: Option<PathBuf>,
}

/// A variable was set but could not be parsed.
#[derive(Debug, thiserror::Error)]
#[error("{var} must be {expected}, got '{value}'")]
pub struct ConfigError {
    pub var: &'static str,
    pub expected: &'static str,
    pub value: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let api_url = "http://127.0.0.1:8188".to_string();
        Self {
            ws_url: derive_ws_url(&api_url),
            api_url,
            workflow_path: PathBuf::from("./workflow.json"),
            output_dir: PathBuf::from("./temp_images"),
            job_timeout: Duration::from_secs(300),
            failure_delay: Duration::from_millis(1000),
            connect_timeout: Duration::from_secs(30),
            http_timeout: Duration::from_secs(60),
            reconnect: ReconnectConfig::default(),
            pass_through_kinds: vec![DEFAULT_PASS_THROUGH_KIND.to_string()],
            asset_node_kind: "LoadImage".to_string(),
            prompt_dump_dir: None,
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default                  |
    /// |------------------------------|--------------------------|
    /// | `COMFYUI_API_URL`            | `http://127.0.0.1:8188`  |
    /// | `COMFYUI_WS_URL`             | API URL with `ws` scheme |
    /// | `WORKFLOW_PATH`              | `./workflow.json`        |
    /// | `OUTPUT_DIR`                 | `./temp_images`          |
    /// | `JOB_TIMEOUT_SECS`           | `300`                    |
    /// | `FAILURE_DELAY_MS`           | `1000`                   |
    /// | `CONNECT_TIMEOUT_SECS`       | `30`                     |
    /// | `HTTP_TIMEOUT_SECS`          | `60`                     |
    /// | `RECONNECT_INITIAL_DELAY_MS` | `1000`                   |
    /// | `RECONNECT_MAX_DELAY_MS`     | `30000`                  |
    /// | `RECONNECT_MAX_ATTEMPTS`     | `10` (`0` = unlimited)   |
    /// | `PASS_THROUGH_KINDS`         | `Reroute`                |
    /// | `ASSET_NODE_KIND`            | `LoadImage`              |
    /// | `PROMPT_DUMP_DIR`            | unset                    |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_url = var("COMFYUI_API_URL")
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_url);
        let ws_url = var("COMFYUI_WS_URL")
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or_else(|| derive_ws_url(&api_url));

        let max_attempts = match var("RECONNECT_MAX_ATTEMPTS") {
            Some(raw) => match parse_u64("RECONNECT_MAX_ATTEMPTS", &raw)? {
                0 => None,
                n => Some(u32::try_from(n).unwrap_or(u32::MAX)),
            },
            None => defaults.reconnect.max_attempts,
        };

        let reconnect = ReconnectConfig {
            initial_delay: millis_or(&var, "RECONNECT_INITIAL_DELAY_MS", defaults.reconnect.initial_delay)?,
            max_delay: millis_or(&var, "RECONNECT_MAX_DELAY_MS", defaults.reconnect.max_delay)?,
            max_attempts,
            ..defaults.reconnect
        };

        let pass_through_kinds = match var("PASS_THROUGH_KINDS") {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => defaults.pass_through_kinds,
        };

        Ok(Self {
            api_url,
            ws_url,
            workflow_path: var("WORKFLOW_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.workflow_path),
            output_dir: var("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            job_timeout: secs_or(&var, "JOB_TIMEOUT_SECS", defaults.job_timeout)?,
            failure_delay: millis_or(&var, "FAILURE_DELAY_MS", defaults.failure_delay)?,
            connect_timeout: secs_or(&var, "CONNECT_TIMEOUT_SECS", defaults.connect_timeout)?,
            http_timeout: secs_or(&var, "HTTP_TIMEOUT_SECS", defaults.http_timeout)?,
            reconnect,
            pass_through_kinds,
            asset_node_kind: var("ASSET_NODE_KIND").unwrap_or(defaults.asset_node_kind),
            prompt_dump_dir: var("PROMPT_DUMP_DIR").map(PathBuf::from),
        })
    }
}

/// `http://host` -> `ws://host`, `https://host` -> `wss://host`.
pub fn derive_ws_url(api_url: &str) -> String {
    if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        api_url.to_string()
    }
}

fn parse_u64(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError {
        var,
        expected: "a non-negative integer",
        value: raw.to_string(),
    })
}

fn secs_or(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match var(key) {
        Some(raw) => Ok(Duration::from_secs(parse_u64(key, &raw)?)),
        None => Ok(default),
    }
}

fn millis_or(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match var(key) {
        Some(raw) => Ok(Duration::from_millis(parse_u64(key, &raw)?)),
        None => Ok(default),
    }
}
