//! Typed error hierarchy for the triage service.
//!
//! - `TriageError`: job store, state machine and API failures
//! - `SandboxError`: isolation-layer failures, folded into an
//!   `ExecutionOutcome` before they reach the orchestrator
//! - `LlmError`: why a language-model call produced nothing usable; callers
//!   pick their fallback on the variant

use thiserror::Error;

use crate::triage::models::JobStatus;

/// Errors from the job store, the orchestrator state machine and the API.
#[derive(Debug, Error)]
pub enum TriageError {
    #[error("Job {id} not found")]
    JobNotFound { id: String },

    #[error("Session {id} not found")]
    SessionNotFound { id: String },

    #[error("Job cannot be run in {status} status")]
    InvalidTransition { status: JobStatus },

    #[error("Job {id} has no input files on disk")]
    NoWorkingDirectory { id: String },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Task queue is closed")]
    QueueClosed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Faults raised by the container runtime.
///
/// The executor never propagates these; it maps each one onto an
/// `ExecutionOutcome` so a single broken step cannot abort a playbook.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Tool not allowed: {tool}")]
    ToolNotAllowed { tool: String },

    #[error("Sandbox image not found: {image}")]
    ImageMissing { image: String },

    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Container launch failed: {0}")]
    LaunchFailed(String),

    #[error("Execution exceeded time limit ({secs}s)")]
    TimedOut { secs: u64 },

    #[error("Execution exceeded memory limit ({limit})")]
    ResourceExhausted { limit: String },
}

/// Failure reasons for chat-completion calls.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM is not configured")]
    Disabled,

    #[error("LLM request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("LLM returned HTTP {status}")]
    Status { status: u16 },

    #[error("LLM response malformed: {0}")]
    Malformed(String),
}
