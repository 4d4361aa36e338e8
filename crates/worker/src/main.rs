//! `tryon-worker` -- run one try-on job from the command line.
//!
//! ```text
//! tryon-worker <primary-image> [secondary-image]
//! ```
//!
//! Configuration comes from the environment (and `.env`); see
//! [`WorkerConfig::from_env`] for the variables.

use std::path::PathBuf;
use std::process::ExitCode;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tryon_worker::config::WorkerConfig;
use tryon_worker::job::JobRequest;
use tryon_worker::service::Service;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tryon_worker=info,tryon_comfyui=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args_os().skip(1).map(PathBuf::from);
    let Some(primary) = args.next() else {
        tracing::error!("usage: tryon-worker <primary-image> [secondary-image]");
        return ExitCode::from(2);
    };
    let secondary = args.next();

    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::from(2);
        }
    };

    let service = Service::start(config);
    let result = service.run(JobRequest::try_on(primary, secondary)).await;
    let connection = service.connection_state();
    service.shutdown().await;

    match result {
        Ok(output) => {
            for image in &output.images {
                tracing::info!(
                    prompt_id = %output.prompt_id,
                    node = %image.node,
                    path = %image.path.display(),
                    "Output saved",
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, ?connection, "Job failed");
            ExitCode::FAILURE
        }
    }
}
