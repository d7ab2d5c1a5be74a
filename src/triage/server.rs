use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, extract::DefaultBodyLimit};
use tower_http::cors::CorsLayer;

use super::api::{self, AppState, SharedState};
use super::db::{DbHandle, TriageDb};
use super::llm::ChatClient;
use super::report::LlmReportGenerator;
use super::sandbox::{ContainerRuntime, DockerRuntime, SandboxExecutor};
use super::suggest::LlmSuggester;
use crate::config::TriageConfig;

/// Upper bound on a job-creation upload.
const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

/// Build the full application router with API and WebSocket routes.
pub fn build_router(state: SharedState, cors_permissive: bool) -> Router {
    let mut app = api::api_router()
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state);
    if cors_permissive {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Start the triage server and its queue workers.
pub async fn start_server(config: TriageConfig) -> Result<()> {
    std::fs::create_dir_all(&config.runs_dir)
        .with_context(|| format!("Failed to create runs directory {}", config.runs_dir.display()))?;
    let db = TriageDb::new(&config.db_path).context("Failed to initialize triage database")?;

    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerRuntime::connect().context("Failed to connect to the container runtime")?);
    let executor = Arc::new(SandboxExecutor::new(config.sandbox.clone(), runtime));
    let client = ChatClient::new(config.llm.clone());
    if !client.enabled() {
        tracing::warn!("No LLM API key configured; reports fall back to evidence summaries");
    }

    let (state, workers) = AppState::start(
        DbHandle::new(db),
        executor,
        Arc::new(LlmReportGenerator::new(client.clone())),
        Arc::new(LlmSuggester::new(client)),
        config.runs_dir.clone(),
        config.queue.clone(),
    )?;
    tracing::info!(workers = workers.len(), "Task queue started");

    let app = build_router(state, config.cors_permissive);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "CTF triage server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
