use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Multipart, Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::advisor::HistoryAdvisor;
use super::artifacts;
use super::broadcast::{ProgressBroadcaster, StatusUpdate};
use super::db::DbHandle;
use super::models::{DEFAULT_FLAG_FORMAT, FlagCandidate, Job, JobStatus, SessionStatus};
use super::orchestrator::{INPUT_DIR, PipelineOrchestrator, job_dir};
use super::playbook::PlaybookCatalog;
use super::queue::{QueueConfig, TaskQueue};
use super::report::{REPORT_FILE, ReportGenerator};
use super::sandbox::{ExecutionOutcome, SandboxExecutor, ScriptRequest, sanitize_file_name, sanitize_packages};
use super::suggest::{RuleBasedSuggester, SuggestRequest, Suggester, detect_category, suggest_with_fallback};
use super::ws;
use crate::errors::TriageError;

const MAX_TITLE_CHARS: usize = 200;
const MAX_DESCRIPTION_CHARS: usize = 10_000;
const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;
const DEFAULT_SESSION_LIMIT: i64 = 20;
const DEFAULT_SIMILAR_LIMIT: usize = 5;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub queue: TaskQueue,
    pub executor: Arc<SandboxExecutor>,
    pub broadcaster: Arc<ProgressBroadcaster>,
    pub advisor: HistoryAdvisor,
    pub suggester: Arc<dyn Suggester>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire the pipeline together and spawn the queue workers.
    pub fn start(
        db: DbHandle,
        executor: Arc<SandboxExecutor>,
        reports: Arc<dyn ReportGenerator>,
        suggester: Arc<dyn Suggester>,
        runs_dir: PathBuf,
        queue: QueueConfig,
    ) -> Result<(SharedState, Vec<JoinHandle<()>>)> {
        let broadcaster = Arc::new(ProgressBroadcaster::default());
        let catalog = PlaybookCatalog::builtin().context("Failed to load playbook catalog")?;
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            db.clone(),
            executor.clone(),
            catalog,
            broadcaster.clone(),
            reports,
            runs_dir,
        ));
        let (queue, workers) = TaskQueue::start(orchestrator.clone(), queue);
        let state = Arc::new(AppState {
            db: db.clone(),
            orchestrator,
            queue,
            executor,
            broadcaster,
            advisor: HistoryAdvisor::new(db),
            suggester,
        });
        Ok((state, workers))
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Deserialize)]
pub struct TerminalRequest {
    pub tool: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    pub session_id: Option<String>,
}

#[derive(Deserialize)]
pub struct ToolsQuery {
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Deserialize)]
pub struct DetectCategoryRequest {
    pub files: Vec<String>,
    #[serde(default)]
    pub file_outputs: HashMap<String, String>,
    #[serde(default)]
    pub strings_outputs: HashMap<String, String>,
}

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub job_id: String,
    #[serde(default = "default_session_name")]
    pub name: String,
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

fn default_session_name() -> String {
    "Analysis Session".to_string()
}

fn default_strategy() -> String {
    "auto".to_string()
}

#[derive(Deserialize)]
pub struct UpdateSessionRequest {
    pub detected_category: Option<String>,
    pub notes: Option<String>,
}

#[derive(Deserialize)]
pub struct EndSessionRequest {
    #[serde(default = "default_end_status")]
    pub status: String,
    pub summary: Option<String>,
}

fn default_end_status() -> String {
    "completed".to_string()
}

#[derive(Deserialize)]
pub struct RecordToolRequest {
    pub tool: String,
    pub context: Option<String>,
}

#[derive(Deserialize)]
pub struct SaveToHistoryRequest {
    pub file_types: Vec<String>,
    pub successful_tools: Vec<String>,
    pub tool_sequence: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Deserialize)]
pub struct RecommendRequest {
    pub category: String,
    #[serde(default)]
    pub file_types: Vec<String>,
}

#[derive(Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

// ── Response payload types ────────────────────────────────────────────

#[derive(Serialize)]
pub struct JobList {
    pub jobs: Vec<Job>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Serialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: Job,
    pub flag_candidates: Vec<FlagCandidate>,
}

#[derive(Serialize)]
pub struct ScriptResponse {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub outcome: ExecutionOutcome,
    pub duration_ms: u64,
    pub packages: Vec<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<TriageError>() {
            Some(e @ (TriageError::JobNotFound { .. } | TriageError::SessionNotFound { .. })) => {
                ApiError::NotFound(e.to_string())
            }
            Some(
                e @ (TriageError::InvalidTransition { .. }
                | TriageError::NoWorkingDirectory { .. }
                | TriageError::BadRequest(_)),
            ) => ApiError::BadRequest(e.to_string()),
            _ => {
                tracing::error!(error = %format!("{:#}", err), "Request failed");
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<TriageError> for ApiError {
    fn from(err: TriageError) -> Self {
        anyhow::Error::from(err).into()
    }
}

fn bad_request(err: impl std::fmt::Display) -> ApiError {
    ApiError::BadRequest(err.to_string())
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/health", get(health_check))
        .route("/health/ready", get(readiness_check))
        .route("/api/health/ready", get(readiness_check))
        .route("/api/jobs", get(list_jobs).post(create_job))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/run", post(run_job))
        .route("/api/jobs/{id}/commands", get(list_commands))
        .route("/api/jobs/{id}/flags", get(list_flags))
        .route("/api/jobs/{id}/flags/{flag_id}/verify", post(verify_flag))
        .route("/api/jobs/{id}/report", get(get_report))
        .route("/api/jobs/{id}/files", get(list_workspace_files))
        .route("/api/jobs/{id}/artifacts", get(list_job_artifacts))
        .route("/api/jobs/{id}/download/report", get(download_report))
        .route("/api/jobs/{id}/download/bundle", get(download_bundle))
        .route("/api/jobs/{id}/terminal", post(run_terminal))
        .route("/api/jobs/{id}/sessions", get(list_sessions))
        .route("/api/sandbox/tools", get(sandbox_tools))
        .route("/api/sandbox/run-script", post(run_script))
        .route("/api/sandbox/python-packages", get(python_packages))
        .route("/api/ai/analyze", post(analyze))
        .route("/api/ai/detect-category", post(detect))
        .route("/api/history/sessions", post(create_session))
        .route(
            "/api/history/sessions/{id}",
            get(get_session_detail).patch(update_session),
        )
        .route("/api/history/sessions/{id}/end", post(end_session))
        .route("/api/history/sessions/{id}/insight", post(add_insight))
        .route("/api/history/sessions/{id}/effective-tool", post(record_tool))
        .route("/api/history/sessions/{id}/save-global", post(save_to_history))
        .route("/api/history/recommend-tools", post(recommend_tools))
        .route("/api/history/similar-solves", post(similar_solves))
        .route("/ws", get(ws::global_ws_handler))
        .route("/ws/jobs", get(ws::global_ws_handler))
        .route("/ws/jobs/{id}", get(ws::job_ws_handler))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "OK"
}

/// Ready once the database answers; the body says which part is not.
async fn readiness_check(State(state): State<SharedState>) -> impl IntoResponse {
    let database = match state.db.call(|db| db.ping()).await {
        Ok(()) => "connected".to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            format!("error: {}", e)
        }
    };
    let status = if database == "connected" { "ready" } else { "not_ready" };
    Json(serde_json::json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "database": database,
    }))
}

#[derive(Default)]
struct JobForm {
    title: String,
    description: String,
    flag_format: Option<String>,
    files: Vec<(String, Vec<u8>)>,
}

/// Stored name of an upload, in the same character set sandbox arguments
/// are filtered to, so playbook steps name the file that is on disk.
fn upload_name(raw: &str) -> Option<String> {
    sanitize_file_name(raw)
}

async fn read_job_form(mut multipart: Multipart) -> Result<JobForm, ApiError> {
    let mut form = JobForm::default();
    while let Some(field) = multipart.next_field().await.map_err(bad_request)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "title" => form.title = field.text().await.map_err(bad_request)?,
            "description" => form.description = field.text().await.map_err(bad_request)?,
            "flag_format" => {
                let value = field.text().await.map_err(bad_request)?;
                if !value.trim().is_empty() {
                    form.flag_format = Some(value.trim().to_string());
                }
            }
            "files" | "file" => {
                let file_name = field
                    .file_name()
                    .and_then(upload_name)
                    .ok_or_else(|| ApiError::BadRequest("Uploaded file has no usable name".into()))?;
                let bytes = field.bytes().await.map_err(bad_request)?;
                form.files.push((file_name, bytes.to_vec()));
            }
            _ => {}
        }
    }
    Ok(form)
}

fn validate_job_form(form: &JobForm) -> Result<(), ApiError> {
    let title = form.title.trim();
    if title.is_empty() {
        return Err(ApiError::BadRequest("Title is required".into()));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(ApiError::BadRequest(format!(
            "Title exceeds {} characters",
            MAX_TITLE_CHARS
        )));
    }
    if form.description.chars().count() > MAX_DESCRIPTION_CHARS {
        return Err(ApiError::BadRequest(format!(
            "Description exceeds {} characters",
            MAX_DESCRIPTION_CHARS
        )));
    }
    if form.files.is_empty() {
        return Err(ApiError::BadRequest("At least one file is required".into()));
    }
    if let Some(pattern) = &form.flag_format {
        regex::Regex::new(pattern)
            .map_err(|e| ApiError::BadRequest(format!("Invalid flag format: {}", e)))?;
    }
    Ok(())
}

async fn create_job(
    State(state): State<SharedState>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let form = read_job_form(multipart).await?;
    validate_job_form(&form)?;

    let title = form.title.trim().to_string();
    let description = form.description;
    let flag_format = form
        .flag_format
        .unwrap_or_else(|| DEFAULT_FLAG_FORMAT.to_string());
    let job = state
        .db
        .call(move |db| db.create_job(&title, &description, &flag_format))
        .await?;

    let input = job_dir(state.orchestrator.runs_dir(), &job.id).join(INPUT_DIR);
    tokio::fs::create_dir_all(&input)
        .await
        .with_context(|| format!("Failed to create {}", input.display()))?;
    let mut names = Vec::with_capacity(form.files.len());
    for (name, bytes) in form.files {
        let path = input.join(&name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to save {}", path.display()))?;
        names.push(name);
    }

    let id = job.id.clone();
    let job = state
        .db
        .call(move |db| {
            db.set_input_files(&id, &names)?;
            db.get_job(&id)?
                .ok_or_else(|| TriageError::JobNotFound { id: id.clone() }.into())
        })
        .await?;
    tracing::info!(job_id = %job.id, files = job.input_files.len(), "Job created");
    Ok((StatusCode::CREATED, Json(job)))
}

async fn list_jobs(
    State(state): State<SharedState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(JobStatus::from_str)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0).max(0);
    let (jobs, total) = state
        .db
        .call(move |db| db.list_jobs(status, limit, offset))
        .await?;
    Ok(Json(JobList {
        jobs,
        total,
        limit,
        offset,
    }))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .db
        .call(move |db| {
            let Some(job) = db.get_job(&id)? else {
                return Ok(None);
            };
            let flag_candidates = db.list_candidates(&id)?;
            Ok(Some(JobDetail {
                job,
                flag_candidates,
            }))
        })
        .await?;
    detail
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Job not found".into()))
}

async fn run_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.db.call(move |db| db.request_run(&id)).await?;
    state.broadcaster.publish_status(
        &job.id,
        StatusUpdate::new(JobStatus::Queued, 0, "Job queued for execution"),
    );
    state.queue.enqueue(&job.id).await?;
    tracing::info!(job_id = %job.id, "Job queued");
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "message": "Job queued for execution",
            "status": JobStatus::Queued,
        })),
    ))
}

async fn list_commands(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let commands = state.db.call(move |db| db.list_commands(&id)).await?;
    Ok(Json(serde_json::json!({ "commands": commands })))
}

async fn list_flags(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let candidates = state.db.call(move |db| db.list_candidates(&id)).await?;
    Ok(Json(serde_json::json!({ "flag_candidates": candidates })))
}

async fn verify_flag(
    State(state): State<SharedState>,
    Path((id, flag_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let verified = state
        .db
        .call(move |db| db.verify_candidate(&id, &flag_id))
        .await?;
    verified
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Flag candidate not found".into()))
}

async fn get_report(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let path = job_dir(state.orchestrator.runs_dir(), &id).join(REPORT_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => Ok((
            [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
            text,
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ApiError::NotFound("Report not generated yet".into()))
        }
        Err(e) => Err(anyhow::Error::new(e)
            .context(format!("Failed to read {}", path.display()))
            .into()),
    }
}

async fn require_job(state: &SharedState, id: &str) -> Result<(), ApiError> {
    let id = id.to_string();
    let exists = state.db.call(move |db| Ok(db.get_job(&id)?.is_some())).await?;
    if exists {
        Ok(())
    } else {
        Err(ApiError::NotFound("Job not found".into()))
    }
}

async fn list_workspace_files(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_job(&state, &id).await?;
    let dir = job_dir(state.orchestrator.runs_dir(), &id);
    let files = tokio::task::spawn_blocking(move || artifacts::workspace_files(&dir))
        .await
        .context("File listing task panicked")??;
    Ok(Json(serde_json::json!({ "files": files })))
}

async fn list_job_artifacts(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_job(&state, &id).await?;
    let dir = job_dir(state.orchestrator.runs_dir(), &id);
    let artifacts = tokio::task::spawn_blocking(move || artifacts::list_artifacts(&dir))
        .await
        .context("Artifact listing task panicked")??;
    Ok(Json(serde_json::json!({ "artifacts": artifacts })))
}

async fn download_report(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let path = job_dir(state.orchestrator.runs_dir(), &id).join(REPORT_FILE);
    let text = match tokio::fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::NotFound("Report not found".into()));
        }
        Err(e) => {
            return Err(anyhow::Error::new(e)
                .context(format!("Failed to read {}", path.display()))
                .into());
        }
    };
    let disposition = format!("attachment; filename=\"writeup_{}.md\"", id);
    Ok((
        [
            (header::CONTENT_TYPE, "text/markdown; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        text,
    ))
}

async fn download_bundle(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let dir = job_dir(state.orchestrator.runs_dir(), &id);
    if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
        return Err(ApiError::NotFound("Job artifacts not found".into()));
    }
    let bytes = tokio::task::spawn_blocking(move || artifacts::bundle(&dir))
        .await
        .context("Bundle task panicked")??;
    tracing::info!(job_id = %id, bytes = bytes.len(), "Bundle built");
    let disposition = format!("attachment; filename=\"job_{}_bundle.tar.gz\"", id);
    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}

async fn run_terminal(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<TerminalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state
        .orchestrator
        .run_terminal(&id, &req.tool, &req.arguments, req.session_id)
        .await?;
    Ok(Json(result))
}

async fn sandbox_tools(
    State(state): State<SharedState>,
    Query(query): Query<ToolsQuery>,
) -> impl IntoResponse {
    Json(state.executor.tool_availability(query.refresh).await)
}

async fn run_script(
    State(state): State<SharedState>,
    Json(req): Json<ScriptRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.script.trim().is_empty() {
        return Err(ApiError::BadRequest("Script is empty".into()));
    }
    let result = state.executor.run_script(&req, None).await;
    Ok(Json(ScriptResponse {
        exit_code: result.exit_code,
        stdout: result.stdout,
        stderr: result.stderr,
        outcome: result.outcome,
        duration_ms: result.duration_ms,
        packages: sanitize_packages(&req.packages),
    }))
}

async fn python_packages(State(state): State<SharedState>) -> impl IntoResponse {
    let packages = match state.executor.python_packages().await {
        Ok(packages) => packages,
        Err(e) => {
            tracing::warn!(error = %e, "Could not list sandbox Python packages");
            Vec::new()
        }
    };
    Json(serde_json::json!({
        "packages": packages,
        "can_install_more": true,
        "venv_supported": true,
    }))
}

async fn analyze(
    State(state): State<SharedState>,
    Json(req): Json<SuggestRequest>,
) -> impl IntoResponse {
    Json(suggest_with_fallback(state.suggester.as_ref(), &RuleBasedSuggester, &req).await)
}

async fn detect(Json(req): Json<DetectCategoryRequest>) -> impl IntoResponse {
    let (category, confidence) = detect_category(&req.files, &req.file_outputs, &req.strings_outputs);
    Json(serde_json::json!({ "category": category, "confidence": confidence }))
}

// ── Sessions and history ──────────────────────────────────────────────

async fn create_session(
    State(state): State<SharedState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .db
        .call(move |db| db.create_session(&req.job_id, &req.name, &req.strategy))
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn list_sessions(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_SESSION_LIMIT).clamp(1, MAX_PAGE_SIZE);
    let sessions = state.db.call(move |db| db.list_sessions(&id, limit)).await?;
    let total = sessions.len();
    Ok(Json(serde_json::json!({ "sessions": sessions, "total": total })))
}

async fn get_session_detail(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state.db.call(move |db| db.session_detail(&id)).await?;
    detail
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Session not found".into()))
}

async fn update_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .db
        .call(move |db| {
            db.update_session(&id, req.detected_category.as_deref(), req.notes.as_deref())
        })
        .await?;
    Ok(Json(session))
}

async fn end_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<EndSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let status = SessionStatus::from_str(&req.status).map_err(ApiError::BadRequest)?;
    let session = state
        .db
        .call(move |db| db.end_session(&id, status, req.summary.as_deref()))
        .await?;
    Ok(Json(session))
}

async fn add_insight(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(insight): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.db.call(move |db| db.add_ai_insight(&id, insight)).await?;
    Ok(Json(session))
}

async fn record_tool(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<RecordToolRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .db
        .call(move |db| db.record_effective_tool(&id, &req.tool, req.context.as_deref()))
        .await?;
    Ok(Json(session))
}

async fn save_to_history(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<SaveToHistoryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .db
        .call(move |db| {
            db.save_to_global_history(
                &id,
                &req.file_types,
                &req.successful_tools,
                &req.tool_sequence,
                &req.keywords,
            )
        })
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn recommend_tools(
    State(state): State<SharedState>,
    Json(req): Json<RecommendRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let recommendations = state
        .advisor
        .recommend(&req.category, &req.file_types)
        .await?;
    Ok(Json(recommendations))
}

async fn similar_solves(
    State(state): State<SharedState>,
    Query(query): Query<LimitQuery>,
    Json(req): Json<RecommendRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query
        .limit
        .map(|l| l.clamp(1, MAX_PAGE_SIZE) as usize)
        .unwrap_or(DEFAULT_SIMILAR_LIMIT);
    let solves = state
        .advisor
        .similar_solves(&req.category, &req.file_types, limit)
        .await?;
    Ok(Json(solves))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::triage::db::TriageDb;
    use crate::triage::llm::{ChatClient, LlmConfig};
    use crate::triage::orchestrator::tests::DisabledReport;
    use crate::triage::sandbox::SandboxConfig;
    use crate::triage::sandbox::mock::MockRuntime;
    use crate::triage::suggest::LlmSuggester;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const BOUNDARY: &str = "triageboundary";

    pub(crate) struct TestApp {
        pub state: SharedState,
        pub runtime: Arc<MockRuntime>,
        pub runs: tempfile::TempDir,
    }

    impl TestApp {
        pub fn router(&self) -> Router {
            api_router().with_state(self.state.clone())
        }
    }

    pub(crate) fn test_app(runtime: MockRuntime) -> TestApp {
        let db = DbHandle::new(TriageDb::new_in_memory().unwrap());
        let runtime = Arc::new(runtime);
        let executor = Arc::new(SandboxExecutor::new(SandboxConfig::default(), runtime.clone()));
        let suggester = Arc::new(LlmSuggester::new(ChatClient::new(LlmConfig::default())));
        let runs = tempfile::tempdir().unwrap();
        let queue = QueueConfig {
            retry_delay_secs: 0,
            ..QueueConfig::default()
        };
        let (state, _workers) = AppState::start(
            db,
            executor,
            Arc::new(DisabledReport),
            suggester,
            runs.path().to_path_buf(),
            queue,
        )
        .unwrap();
        TestApp {
            state,
            runtime,
            runs,
        }
    }

    pub(crate) fn multipart_request(fields: &[(&str, &str)], files: &[(&str, &str)]) -> Request<Body> {
        let mut body: Vec<u8> = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        for (file_name, content) in files {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(content.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/api/jobs")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create(app: &TestApp, files: &[(&str, &str)]) -> serde_json::Value {
        let req = multipart_request(&[("title", "Warmup"), ("description", "find it")], files);
        let resp = app.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        body_json(resp).await
    }

    async fn wait_for_terminal(app: &TestApp, id: &str) -> Job {
        for _ in 0..200 {
            let job = app.state.db.lock_sync().unwrap().get_job(id).unwrap().unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        panic!("job {} never finished", id);
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app(MockRuntime::with_stdout(""));
        let resp = app.router().oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"OK");
    }

    #[tokio::test]
    async fn test_create_job_saves_uploads() {
        let app = test_app(MockRuntime::with_stdout(""));
        let job = create(&app, &[("capture.pcap", "pcapdata"), ("../notes.txt", "hi")]).await;
        assert_eq!(job["status"], "pending");
        assert_eq!(job["flag_format"], DEFAULT_FLAG_FORMAT);
        assert_eq!(job["input_files"], serde_json::json!(["capture.pcap", "notes.txt"]));

        let input = job_dir(app.runs.path(), job["id"].as_str().unwrap()).join(INPUT_DIR);
        assert_eq!(std::fs::read(input.join("capture.pcap")).unwrap(), b"pcapdata");
        assert!(input.join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_create_job_requires_files_and_title() {
        let app = test_app(MockRuntime::with_stdout(""));
        let resp = app
            .router()
            .oneshot(multipart_request(&[("title", "t")], &[]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "At least one file is required");

        let resp = app
            .router()
            .oneshot(multipart_request(&[("title", "  ")], &[("a.txt", "x")]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_job_rejects_invalid_flag_format() {
        let app = test_app(MockRuntime::with_stdout(""));
        let req = multipart_request(
            &[("title", "t"), ("flag_format", "flag{[unclosed")],
            &[("a.txt", "x")],
        );
        let resp = app.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert!(body["error"].as_str().unwrap().starts_with("Invalid flag format"));
    }

    #[tokio::test]
    async fn test_list_jobs_filters_and_rejects_bad_status() {
        let app = test_app(MockRuntime::with_stdout(""));
        create(&app, &[("a.txt", "x")]).await;
        create(&app, &[("b.txt", "x")]).await;

        let resp = app.router().oneshot(get("/api/jobs?limit=1")).await.unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["total"], 2);
        assert_eq!(body["jobs"].as_array().unwrap().len(), 1);

        let resp = app.router().oneshot(get("/api/jobs?status=running")).await.unwrap();
        assert_eq!(body_json(resp).await["total"], 0);

        let resp = app.router().oneshot(get("/api/jobs?status=bogus")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_job_not_found() {
        let app = test_app(MockRuntime::with_stdout(""));
        let resp = app.router().oneshot(get("/api/jobs/nope")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["error"], "Job not found");
    }

    #[tokio::test]
    async fn test_run_job_executes_pipeline() {
        let app = test_app(MockRuntime::with_stdout("Some text\nCTF{this_is_a_flag}\nMore text"));
        let job = create(&app, &[("capture.pcapng", "data")]).await;
        let id = job["id"].as_str().unwrap().to_string();

        let resp = app
            .router()
            .oneshot(json_request("POST", &format!("/api/jobs/{}/run", id), serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(resp).await["status"], "queued");

        let done = wait_for_terminal(&app, &id).await;
        assert_eq!(done.status, JobStatus::Completed);

        let resp = app.router().oneshot(get(&format!("/api/jobs/{}", id))).await.unwrap();
        let detail = body_json(resp).await;
        let flags = detail["flag_candidates"].as_array().unwrap();
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0]["value"], "CTF{this_is_a_flag}");

        let resp = app
            .router()
            .oneshot(get(&format!("/api/jobs/{}/commands", id)))
            .await
            .unwrap();
        let commands = body_json(resp).await;
        assert_eq!(commands["commands"][0]["tool"], "file");

        let resp = app
            .router()
            .oneshot(get(&format!("/api/jobs/{}/report", id)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_run_rejected_while_not_runnable() {
        let app = test_app(MockRuntime::with_stdout(""));
        let job = create(&app, &[("a.txt", "x")]).await;
        let id = job["id"].as_str().unwrap().to_string();
        app.state
            .db
            .lock_sync()
            .unwrap()
            .update_status(&id, JobStatus::Queued, None, None)
            .unwrap();
        app.state
            .db
            .lock_sync()
            .unwrap()
            .update_status(&id, JobStatus::Running, None, None)
            .unwrap();

        let resp = app
            .router()
            .oneshot(json_request("POST", &format!("/api/jobs/{}/run", id), serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(resp).await["error"],
            "Job cannot be run in running status"
        );

        let resp = app
            .router()
            .oneshot(json_request("POST", "/api/jobs/missing/run", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_report_missing_is_404() {
        let app = test_app(MockRuntime::with_stdout(""));
        let job = create(&app, &[("a.txt", "x")]).await;
        let uri = format!("/api/jobs/{}/report", job["id"].as_str().unwrap());
        let resp = app.router().oneshot(get(&uri)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_terminal_rejects_disallowed_tool() {
        let app = test_app(MockRuntime::with_stdout(""));
        let job = create(&app, &[("a.txt", "x")]).await;
        let uri = format!("/api/jobs/{}/terminal", job["id"].as_str().unwrap());
        let resp = app
            .router()
            .oneshot(json_request("POST", &uri, serde_json::json!({"tool": "rm", "arguments": ["-rf", "/"]})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["exit_code"], 1);
        assert!(body["command_id"].as_str().unwrap().starts_with("terminal_"));
        assert!(body["error"].as_str().is_some());
        assert_eq!(app.runtime.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_terminal_persists_with_session() {
        let app = test_app(MockRuntime::with_stdout("hello"));
        let job = create(&app, &[("a.txt", "x")]).await;
        let id = job["id"].as_str().unwrap().to_string();

        let resp = app
            .router()
            .oneshot(json_request("POST", "/api/history/sessions", serde_json::json!({"job_id": id})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let session = body_json(resp).await;
        assert_eq!(session["strategy"], "auto");
        let session_id = session["id"].as_str().unwrap().to_string();

        let resp = app
            .router()
            .oneshot(json_request(
                "POST",
                &format!("/api/jobs/{}/terminal", id),
                serde_json::json!({"tool": "strings", "arguments": ["a.txt"], "session_id": session_id}),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["stdout"], "hello");

        let resp = app
            .router()
            .oneshot(json_request(
                "POST",
                &format!("/api/history/sessions/{}/end", session_id),
                serde_json::json!({"summary": "done"}),
            ))
            .await
            .unwrap();
        let ended = body_json(resp).await;
        assert_eq!(ended["status"], "completed");
        assert_eq!(ended["total_commands"], 1);
        assert_eq!(ended["successful_commands"], 1);

        let resp = app
            .router()
            .oneshot(get(&format!("/api/history/sessions/{}", session_id)))
            .await
            .unwrap();
        let detail = body_json(resp).await;
        assert_eq!(detail["commands"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_session_endpoints_and_history_recommendations() {
        let app = test_app(MockRuntime::with_stdout(""));
        let job = create(&app, &[("a.png", "x")]).await;
        let id = job["id"].as_str().unwrap().to_string();

        let resp = app
            .router()
            .oneshot(json_request(
                "POST",
                "/api/history/sessions",
                serde_json::json!({"job_id": id, "name": "stego pass", "strategy": "manual"}),
            ))
            .await
            .unwrap();
        let session_id = body_json(resp).await["id"].as_str().unwrap().to_string();
        let base = format!("/api/history/sessions/{}", session_id);

        let resp = app
            .router()
            .oneshot(json_request("PATCH", &base, serde_json::json!({"detected_category": "stego"})))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["detected_category"], "stego");

        let resp = app
            .router()
            .oneshot(json_request(
                "POST",
                &format!("{}/insight", base),
                serde_json::json!({"analysis": "LSB data", "category": "stego", "confidence": 0.7}),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["ai_suggestions_used"], 1);

        let resp = app
            .router()
            .oneshot(json_request(
                "POST",
                &format!("{}/effective-tool", base),
                serde_json::json!({"tool": "zsteg"}),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["effective_tools"][0]["tool"], "zsteg");

        app.router()
            .oneshot(json_request("POST", &format!("{}/end", base), serde_json::json!({})))
            .await
            .unwrap();

        let resp = app
            .router()
            .oneshot(json_request(
                "POST",
                &format!("{}/save-global", base),
                serde_json::json!({
                    "file_types": ["png"],
                    "successful_tools": ["zsteg"],
                    "tool_sequence": ["file", "zsteg"],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(body_json(resp).await["category"], "stego");

        let resp = app
            .router()
            .oneshot(json_request(
                "POST",
                "/api/history/recommend-tools",
                serde_json::json!({"category": "stego", "file_types": ["png"]}),
            ))
            .await
            .unwrap();
        let recs = body_json(resp).await;
        assert_eq!(recs[0]["tool"], "zsteg");
        assert_eq!(recs[0]["score"], 3);

        let resp = app
            .router()
            .oneshot(get(&format!("/api/jobs/{}/sessions", id)))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["total"], 1);
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let app = test_app(MockRuntime::with_stdout(""));
        let resp = app
            .router()
            .oneshot(json_request(
                "PATCH",
                "/api/history/sessions/nope",
                serde_json::json!({"notes": "x"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .router()
            .oneshot(json_request(
                "POST",
                "/api/history/sessions/nope/end",
                serde_json::json!({"status": "exploded"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_sandbox_tools_reports_summary() {
        let app = test_app(MockRuntime::with_stdout("file:1\nstrings:1\nzsteg:0"));
        let resp = app.router().oneshot(get("/api/sandbox/tools")).await.unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["tools"]["file"], true);
        assert_eq!(body["tools"]["zsteg"], false);
        assert_eq!(body["summary"]["available"], 2);
        assert_eq!(body["cached"], false);

        let resp = app.router().oneshot(get("/api/sandbox/tools")).await.unwrap();
        assert_eq!(body_json(resp).await["cached"], true);
    }

    #[tokio::test]
    async fn test_run_script() {
        let app = test_app(MockRuntime::with_stdout("42"));
        let resp = app
            .router()
            .oneshot(json_request(
                "POST",
                "/api/sandbox/run-script",
                serde_json::json!({"script": "print(42)", "packages": ["pycryptodome", "bad;pkg"]}),
            ))
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["stdout"], "42");
        assert_eq!(body["packages"], serde_json::json!(["pycryptodome"]));

        let resp = app
            .router()
            .oneshot(json_request("POST", "/api/sandbox/run-script", serde_json::json!({"script": " "})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_analyze_falls_back_to_rules() {
        let app = test_app(MockRuntime::with_stdout(""));
        let resp = app
            .router()
            .oneshot(json_request(
                "POST",
                "/api/ai/analyze",
                serde_json::json!({
                    "files": ["chall.png"],
                    "command_history": [{"tool": "strings", "stdout": "CTF{found_it}"}],
                }),
            ))
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["rule_based"], true);
        assert_eq!(body["should_continue"], false);
    }

    #[tokio::test]
    async fn test_detect_category() {
        let app = test_app(MockRuntime::with_stdout(""));
        let resp = app
            .router()
            .oneshot(json_request(
                "POST",
                "/api/ai/detect-category",
                serde_json::json!({"files": ["capture.pcap"]}),
            ))
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["category"], "network");
    }

    #[test]
    fn test_upload_name_strips_directories() {
        assert_eq!(upload_name("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(upload_name("C:\\Users\\x\\chall.bin").as_deref(), Some("chall.bin"));
        assert_eq!(upload_name("dir/"), None);
        assert_eq!(upload_name(".."), None);
        assert_eq!(upload_name("my file.png").as_deref(), Some("my_file.png"));
    }

    #[tokio::test]
    async fn test_readiness_reports_database() {
        let app = test_app(MockRuntime::with_stdout(""));
        let resp = app.router().oneshot(get("/health/ready")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ready");
        assert_eq!(body["database"], "connected");
    }

    #[tokio::test]
    async fn test_files_artifacts_and_bundle() {
        let app = test_app(MockRuntime::with_stdout(""));
        let job = create(&app, &[("b.bin", "bb"), ("a.txt", "aa")]).await;
        let id = job["id"].as_str().unwrap().to_string();
        let extracted = job_dir(app.runs.path(), &id).join("extracted");
        std::fs::create_dir_all(&extracted).unwrap();
        std::fs::write(extracted.join("inner.txt"), b"x").unwrap();

        let resp = app.router().oneshot(get(&format!("/api/jobs/{}/files", id))).await.unwrap();
        assert_eq!(
            body_json(resp).await["files"],
            serde_json::json!(["a.txt", "b.bin", "extracted/inner.txt"])
        );

        let resp = app
            .router()
            .oneshot(get(&format!("/api/jobs/{}/artifacts", id)))
            .await
            .unwrap();
        let body = body_json(resp).await;
        let artifacts = body["artifacts"].as_array().unwrap();
        assert_eq!(artifacts.len(), 3);
        let txt = artifacts.iter().find(|a| a["path"] == "input/a.txt").unwrap();
        assert_eq!(txt["size"], 2);
        assert_eq!(txt["type"], "text/plain");
        assert!(txt["hash"].as_str().unwrap().starts_with("sha256:"));

        let resp = app
            .router()
            .oneshot(get(&format!("/api/jobs/{}/download/bundle", id)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/gzip");
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(bytes[..2], [0x1f_u8, 0x8b]);
    }

    #[tokio::test]
    async fn test_workspace_routes_unknown_job_is_404() {
        let app = test_app(MockRuntime::with_stdout(""));
        for uri in [
            "/api/jobs/nope/files",
            "/api/jobs/nope/artifacts",
            "/api/jobs/nope/download/bundle",
            "/api/jobs/nope/download/report",
        ] {
            let resp = app.router().oneshot(get(uri)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_python_packages_listing() {
        let app = test_app(MockRuntime::with_stdout("numpy==1.26.4\nz3-solver==4.12.6\n"));
        let resp = app.router().oneshot(get("/api/sandbox/python-packages")).await.unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["packages"][0]["name"], "numpy");
        assert_eq!(body["packages"][1]["version"], "4.12.6");
        assert_eq!(body["venv_supported"], true);
    }

    #[tokio::test]
    async fn test_uploaded_names_match_playbook_arguments() {
        let app = test_app(MockRuntime::with_stdout(""));
        let job = create(&app, &[("my file.png", "img")]).await;
        assert_eq!(job["input_files"], serde_json::json!(["my_file.png"]));
        let id = job["id"].as_str().unwrap().to_string();
        assert!(job_dir(app.runs.path(), &id).join(INPUT_DIR).join("my_file.png").exists());

        app.router()
            .oneshot(json_request("POST", &format!("/api/jobs/{}/run", id), serde_json::json!({})))
            .await
            .unwrap();
        wait_for_terminal(&app, &id).await;
        let commands = app.state.db.lock_sync().unwrap().list_commands(&id).unwrap();
        assert_eq!(commands[0].arguments, vec!["my_file.png"]);
    }
}
