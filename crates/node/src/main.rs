use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scribe_core::config::OrchestratorConfig;
use scribe_gpu::NvidiaSmiDriver;
use scribe_orchestrator::TranscriptionSystem;

mod api;
mod engine;
mod ws;

use engine::{FfprobeMetadata, WhisperCliEngine};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = OrchestratorConfig::from_env()?;
    std::fs::create_dir_all(&config.upload_dir)?;
    std::fs::create_dir_all(&config.output_dir)?;

    let model_dir = std::env::var("MODEL_BASE_PATH")
        .map(Into::into)
        .unwrap_or_else(|_| config.output_dir.join("models"));
    let scratch_dir = std::env::temp_dir().join("scribe-whisper");
    let engine = Arc::new(WhisperCliEngine::new(model_dir, scratch_dir));

    let system = TranscriptionSystem::init(
        config,
        engine,
        Arc::new(FfprobeMetadata),
        Box::new(NvidiaSmiDriver),
    );

    let app = Router::new()
        .route("/api/tasks", post(api::submit_task))
        .route("/api/tasks/:id", get(api::task_status))
        .route("/api/tasks/:id/cancel", post(api::cancel_task))
        .route("/api/queue", get(api::list_queue))
        .route("/api/gpus", get(api::gpu_status))
        .route("/api/scheduler", get(api::scheduler_status))
        .route("/api/scheduler/kick", post(api::kick_scheduler))
        .route(
            "/api/concurrency",
            get(api::get_concurrency).post(api::set_concurrency),
        )
        .route("/api/outputs", get(api::list_outputs))
        .route("/ws/events", get(ws::events))
        .layer(CorsLayer::permissive())
        .with_state(Arc::clone(&system));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(5552);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "scribe-node listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    system.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}
