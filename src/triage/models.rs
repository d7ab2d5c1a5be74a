use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default flag-matching expression stored on a job when the submitter
/// does not supply one.
pub const DEFAULT_FLAG_FORMAT: &str = r"CTF\{[^}]+\}";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// A run request is only honoured from a fresh or a failed job.
    pub fn can_run(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// `failed -> queued` is the re-run path; `failed -> running` is the
    /// task queue retrying the same dispatch.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Failed, Queued)
                | (Queued, Running)
                | (Failed, Running)
                | (Running, Completed)
                | (Running, Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineEvent {
    pub timestamp: String,
    pub event: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub title: String,
    pub description: String,
    pub flag_format: String,
    pub status: JobStatus,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub input_files: Vec<String>,
    pub commands_executed: i64,
    pub timeline: Vec<TimelineEvent>,
    pub error_message: Option<String>,
}

/// One persisted tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: String,
    pub job_id: String,
    pub session_id: Option<String>,
    pub tool: String,
    pub arguments: Vec<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: String,
    pub output_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagCandidate {
    pub id: String,
    pub job_id: String,
    pub session_id: Option<String>,
    pub value: String,
    pub confidence: f64,
    pub source: String,
    pub evidence_id: Option<String>,
    pub context: Option<String>,
    pub verified: bool,
    pub verified_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Abandoned,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "abandoned" => Ok(Self::Abandoned),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

/// One strategy attempt against a job.
///
/// The three counters are only written by `end_session`, which recounts
/// the session's commands and candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSession {
    pub id: String,
    pub job_id: String,
    pub name: String,
    pub strategy: String,
    pub detected_category: Option<String>,
    pub status: SessionStatus,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub total_commands: i64,
    pub successful_commands: i64,
    pub flags_found_count: i64,
    pub ai_suggestions_used: i64,
    pub ai_insights: Vec<serde_json::Value>,
    pub effective_tools: Vec<EffectiveTool>,
    pub notes: Option<String>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EffectiveTool {
    pub tool: String,
    pub context: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDetail {
    pub session: AnalysisSession,
    pub commands: Vec<CommandRecord>,
    pub flags: Vec<FlagCandidate>,
}

/// Append-only ledger row describing a strategy that solved a challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveRecord {
    pub id: String,
    pub category: String,
    pub file_types: Vec<String>,
    pub successful_tools: Vec<String>,
    pub tool_sequence: Vec<String>,
    pub winning_strategy: Option<String>,
    pub time_to_solve_seconds: Option<i64>,
    pub total_commands: i64,
    pub keywords: Vec<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolRecommendation {
    pub tool: String,
    pub score: u32,
    pub reason: String,
}
