//! Sequences one job through playbook, sandbox, extraction and report.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use super::broadcast::{LogLevel, ProgressBroadcaster, StatusUpdate};
use super::db::DbHandle;
use super::evidence::{CommandOutput, EvidenceExtractor, EvidencePack, save_evidence};
use super::models::{Job, JobStatus};
use super::playbook::{Playbook, PlaybookCatalog};
use super::report::{ReportGenerator, evidence_only_report, save_report, validate_citations};
use super::sandbox::{ExecutionResult, SandboxExecutor};
use crate::errors::{LlmError, TriageError};
use crate::util::now_rfc3339;

pub const INPUT_DIR: &str = "input";
pub const EXTRACTED_DIR: &str = "extracted";

const PROGRESS_STARTED: u8 = 5;
const PROGRESS_PLAYBOOK: u8 = 10;
const PROGRESS_STEPS_DONE: u8 = 60;
const PROGRESS_EXTRACTED: u8 = 70;
const PROGRESS_WRITEUP: u8 = 80;

pub fn job_dir(runs_dir: &Path, job_id: &str) -> PathBuf {
    runs_dir.join(job_id)
}

/// `extracted/` when it holds anything, else `input/`.
pub fn resolve_working_dir(runs_dir: &Path, job_id: &str) -> Result<PathBuf> {
    let dir = job_dir(runs_dir, job_id);
    let extracted = dir.join(EXTRACTED_DIR);
    if std::fs::read_dir(&extracted).is_ok_and(|mut entries| entries.next().is_some()) {
        return Ok(extracted);
    }
    let input = dir.join(INPUT_DIR);
    if input.is_dir() {
        return Ok(input);
    }
    Err(TriageError::NoWorkingDirectory {
        id: job_id.to_string(),
    }
    .into())
}

/// Regular files directly inside `dir`, sorted by name.
pub fn list_files(dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let entry = entry?;
        if entry.file_type()?.is_file()
            && let Some(name) = entry.file_name().to_str()
        {
            files.push(name.to_string());
        }
    }
    files.sort();
    Ok(files)
}

/// Result of an on-demand terminal command.
#[derive(Debug, Clone, Serialize)]
pub struct TerminalResult {
    pub command_id: String,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
    pub duration_ms: u64,
}

pub struct PipelineOrchestrator {
    db: DbHandle,
    executor: Arc<SandboxExecutor>,
    catalog: PlaybookCatalog,
    broadcaster: Arc<ProgressBroadcaster>,
    reports: Arc<dyn ReportGenerator>,
    runs_dir: PathBuf,
}

impl PipelineOrchestrator {
    pub fn new(
        db: DbHandle,
        executor: Arc<SandboxExecutor>,
        catalog: PlaybookCatalog,
        broadcaster: Arc<ProgressBroadcaster>,
        reports: Arc<dyn ReportGenerator>,
        runs_dir: PathBuf,
    ) -> Self {
        Self {
            db,
            executor,
            catalog,
            broadcaster,
            reports,
            runs_dir,
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    async fn timeline(&self, job_id: &str, event: String) -> Result<()> {
        let id = job_id.to_string();
        self.db
            .call(move |db| db.add_timeline_event(&id, &event))
            .await
    }

    async fn set_status(
        &self,
        job_id: &str,
        status: JobStatus,
        event: String,
        error: Option<String>,
    ) -> Result<Job> {
        let id = job_id.to_string();
        self.db
            .call(move |db| db.update_status(&id, status, Some(&event), error.as_deref()))
            .await
    }

    fn progress(&self, job_id: &str, progress: u8, message: &str) {
        self.broadcaster
            .publish_status(job_id, StatusUpdate::new(JobStatus::Running, progress, message));
    }

    /// Run a queued (or retried) job to a terminal state. On a pipeline
    /// fault the job is marked failed and the error is returned so the
    /// queue can retry it.
    pub async fn run_job(&self, job_id: &str) -> Result<usize> {
        let job = self
            .set_status(job_id, JobStatus::Running, "Analysis started".into(), None)
            .await?;
        tracing::info!(job_id, "Analysis started");
        self.progress(job_id, PROGRESS_STARTED, "Analysis started");

        match self.pipeline(&job).await {
            Ok(candidates) => {
                self.set_status(
                    job_id,
                    JobStatus::Completed,
                    "Analysis completed successfully".into(),
                    None,
                )
                .await?;
                tracing::info!(job_id, candidates, "Analysis completed");
                self.broadcaster.publish_status(
                    job_id,
                    StatusUpdate::finished(
                        JobStatus::Completed,
                        "Analysis completed successfully",
                        candidates,
                        None,
                    ),
                );
                Ok(candidates)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::error!(job_id, error = %message, "Analysis failed");
                if let Err(update_err) = self
                    .set_status(
                        job_id,
                        JobStatus::Failed,
                        format!("Analysis failed: {}", message),
                        Some(message.clone()),
                    )
                    .await
                {
                    tracing::error!(job_id, error = %update_err, "Could not record job failure");
                }
                self.broadcaster.publish_status(
                    job_id,
                    StatusUpdate::finished(
                        JobStatus::Failed,
                        format!("Analysis failed: {}", message),
                        0,
                        Some(message),
                    ),
                );
                Err(e)
            }
        }
    }

    /// Mark a job failed after its attempt was cut off from outside.
    pub async fn abandon(&self, job_id: &str, message: &str) {
        let event = format!("Analysis failed: {}", message);
        if let Err(e) = self
            .set_status(job_id, JobStatus::Failed, event.clone(), Some(message.to_string()))
            .await
        {
            tracing::error!(job_id, error = %e, "Could not record abandoned job");
        }
        self.broadcaster.publish_status(
            job_id,
            StatusUpdate::finished(JobStatus::Failed, event, 0, Some(message.to_string())),
        );
    }

    /// Only a job the pipeline itself marked failed is worth another run.
    pub async fn is_retryable(&self, job_id: &str) -> bool {
        let id = job_id.to_string();
        matches!(
            self.db.call(move |db| db.get_job(&id)).await,
            Ok(Some(job)) if job.status == JobStatus::Failed
        )
    }

    async fn pipeline(&self, job: &Job) -> Result<usize> {
        let job_id = job.id.as_str();
        let working_dir = resolve_working_dir(&self.runs_dir, job_id)?;

        let playbook = self.catalog.select_playbook(&job.input_files);
        self.timeline(job_id, format!("Selected playbook: {}", playbook.name))
            .await?;
        tracing::info!(job_id, playbook = %playbook.name, steps = playbook.steps.len(), "Selected playbook");
        self.progress(
            job_id,
            PROGRESS_PLAYBOOK,
            &format!("Selected playbook: {}", playbook.name),
        );

        let id = job_id.to_string();
        let first_index = self.db.call(move |db| db.next_step_index(&id)).await?;
        let (outputs, abort) = self
            .execute_steps(job_id, &playbook, &working_dir, first_index)
            .await?;

        // Partial results stay visible even when a step aborts the run.
        let id = job_id.to_string();
        let batch = outputs.clone();
        let persisted = self
            .db
            .call(move |db| db.insert_commands(&id, None, &batch))
            .await?;
        self.timeline(job_id, format!("Executed {} commands", persisted))
            .await?;
        self.progress(
            job_id,
            PROGRESS_STEPS_DONE,
            &format!("Executed {} commands", persisted),
        );
        if let Some(abort) = abort {
            return Err(abort);
        }

        let extractor = EvidenceExtractor::new(Some(&job.flag_format));
        let candidates = extractor.extract(&outputs);
        let id = job_id.to_string();
        let found = candidates.clone();
        self.db
            .call(move |db| db.insert_candidates(&id, None, &found))
            .await?;
        self.timeline(job_id, format!("Found {} flag candidates", candidates.len()))
            .await?;
        self.progress(
            job_id,
            PROGRESS_EXTRACTED,
            &format!("Found {} flag candidates", candidates.len()),
        );

        let dir = job_dir(&self.runs_dir, job_id);
        save_evidence(&dir, Some(&playbook.name), &outputs, &candidates)?;
        let pack = EvidencePack::build(&outputs, &candidates)?;

        self.timeline(job_id, "Generating writeup...".into()).await?;
        self.progress(job_id, PROGRESS_WRITEUP, "Generating writeup...");
        let report = match self.reports.generate(&job.title, &job.description, &pack).await {
            Ok(text) => validate_citations(&text, &pack),
            Err(LlmError::Disabled) => evidence_only_report(&job.title, &job.description, &pack),
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Writeup generation failed, writing evidence summary");
                self.broadcaster.publish_log(
                    job_id,
                    LogLevel::Warning,
                    format!("Writeup generation failed: {}", e),
                );
                evidence_only_report(&job.title, &job.description, &pack)
            }
        };
        save_report(&dir, &report)?;
        self.timeline(job_id, "Writeup generated".into()).await?;

        Ok(candidates.len())
    }

    /// Steps run strictly in order and are numbered from `first_index`. A
    /// step whose outcome is configured as fatal stops the playbook; the
    /// outputs so far are still returned.
    async fn execute_steps(
        &self,
        job_id: &str,
        playbook: &Playbook,
        working_dir: &Path,
        first_index: usize,
    ) -> Result<(Vec<CommandOutput>, Option<anyhow::Error>)> {
        let total = playbook.steps.len().max(1);
        let mut outputs = Vec::with_capacity(playbook.steps.len());

        for (index, step) in playbook.steps.iter().enumerate() {
            let files = list_files(working_dir)?;
            let arguments = step.resolve_arguments(&files);
            let command_id = format!("cmd_{:03}", first_index + index);
            let timestamp = now_rfc3339();

            tracing::info!(job_id, command_id = %command_id, tool = %step.tool, "Running step");
            self.broadcaster.publish_log(
                job_id,
                LogLevel::Info,
                format!("{} {}", step.tool, arguments.join(" ")),
            );

            let result = self.executor.run(&step.tool, &arguments, working_dir).await;
            if result.is_error() {
                tracing::warn!(
                    job_id,
                    command_id = %command_id,
                    tool = %step.tool,
                    outcome = ?result.outcome,
                    "Step did not complete"
                );
                self.broadcaster.publish_log(
                    job_id,
                    LogLevel::Error,
                    format!("{} failed: {}", step.tool, result.stderr),
                );
            }

            let outcome = result.outcome;
            let stderr = result.stderr.clone();
            outputs.push(command_output(command_id.clone(), &step.tool, arguments, result, timestamp));

            let done = index + 1;
            let progress = PROGRESS_PLAYBOOK as usize
                + (PROGRESS_STEPS_DONE - PROGRESS_PLAYBOOK) as usize * done / total;
            self.progress(
                job_id,
                progress as u8,
                &format!("Step {}/{}: {}", done, playbook.steps.len(), step.tool),
            );

            if self.executor.config().is_fatal(outcome) {
                let err = anyhow::anyhow!(
                    "Step {} ({}) aborted the playbook: {}",
                    command_id,
                    step.tool,
                    stderr
                );
                return Ok((outputs, Some(err)));
            }
        }
        Ok((outputs, None))
    }

    /// Run one allowlisted tool against a job's files on demand. The
    /// command is persisted when it belongs to a session.
    pub async fn run_terminal(
        &self,
        job_id: &str,
        tool: &str,
        arguments: &[String],
        session_id: Option<String>,
    ) -> Result<TerminalResult> {
        let id = job_id.to_string();
        self.db
            .call(move |db| {
                db.get_job(&id)?
                    .ok_or_else(|| TriageError::JobNotFound { id: id.clone() }.into())
            })
            .await?;
        let working_dir = resolve_working_dir(&self.runs_dir, job_id)?;

        let command_id = terminal_command_id();
        let timestamp = now_rfc3339();
        let result = self.executor.run(tool, arguments, &working_dir).await;
        tracing::info!(
            job_id,
            command_id = %command_id,
            tool,
            exit_code = result.exit_code,
            "Terminal command finished"
        );

        let response = TerminalResult {
            command_id: command_id.clone(),
            exit_code: result.exit_code,
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            error: result.is_error().then(|| result.stderr.clone()),
            duration_ms: result.duration_ms,
        };

        if let Some(session_id) = session_id {
            let output = command_output(command_id, tool, arguments.to_vec(), result, timestamp);
            let id = job_id.to_string();
            self.db
                .call(move |db| db.insert_commands(&id, Some(&session_id), &[output]))
                .await?;
        }
        Ok(response)
    }
}

/// `terminal_<unix-millis>_<8 hex>`, unique even for commands issued in
/// the same instant.
fn terminal_command_id() -> String {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "terminal_{}_{}",
        chrono::Utc::now().timestamp_millis(),
        &nonce[..8]
    )
}

fn command_output(
    command_id: String,
    tool: &str,
    arguments: Vec<String>,
    result: ExecutionResult,
    timestamp: String,
) -> CommandOutput {
    CommandOutput {
        command_id,
        tool: tool.to_string(),
        arguments,
        exit_code: result.exit_code,
        stdout: result.stdout,
        stderr: result.stderr,
        output_hash: result.output_hash,
        outcome: result.outcome,
        timestamp,
    }
}
