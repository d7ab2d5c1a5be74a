use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::evidence::{Candidate, CommandOutput};
use super::models::*;
use crate::errors::TriageError;
use crate::util::{now_rfc3339, seconds_between, truncate_bytes};

/// Bytes of stdout kept in the `stdout_truncated` display column.
pub const TRUNCATED_STDOUT_BYTES: usize = 10_000;

/// Async-safe handle to the triage database.
///
/// Wraps `TriageDb` behind `Arc<Mutex>` and runs every access on tokio's
/// blocking pool, so synchronous SQLite I/O never stalls async workers.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<TriageDb>>,
}

impl DbHandle {
    pub fn new(db: TriageDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&TriageDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| TriageError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Startup and tests only.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, TriageDb>> {
        self.inner.lock().map_err(|_| TriageError::LockPoisoned.into())
    }
}

pub struct TriageDb {
    conn: Connection,
}

const JOB_COLUMNS: &str = "id, title, description, flag_format, status, created_at, started_at, completed_at, input_files, commands_executed, timeline, error_message";
const COMMAND_COLUMNS: &str = "command_id, job_id, session_id, tool, arguments, started_at, completed_at, exit_code, stdout, stderr, stdout_truncated, output_hash";
const CANDIDATE_COLUMNS: &str = "id, job_id, session_id, value, confidence, source, evidence_id, context, verified, verified_at";
const SESSION_COLUMNS: &str = "id, job_id, name, strategy, detected_category, status, started_at, ended_at, total_commands, successful_commands, flags_found_count, ai_suggestions_used, ai_insights, effective_tools, notes, summary";
const SOLVE_COLUMNS: &str = "id, category, file_types, successful_tools, tool_sequence, winning_strategy, time_to_solve_seconds, total_commands, keywords, created_at";

impl TriageDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).map_err(|e| {
            TriageError::Database(anyhow::Error::new(e).context(format!("Failed to open {}", path.display())))
        })?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    flag_format TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT,
                    input_files TEXT NOT NULL DEFAULT '[]',
                    commands_executed INTEGER NOT NULL DEFAULT 0,
                    timeline TEXT NOT NULL DEFAULT '[]',
                    error_message TEXT
                );

                CREATE TABLE IF NOT EXISTS analysis_sessions (
                    id TEXT PRIMARY KEY,
                    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    strategy TEXT NOT NULL DEFAULT 'auto',
                    detected_category TEXT,
                    status TEXT NOT NULL DEFAULT 'active',
                    started_at TEXT NOT NULL,
                    ended_at TEXT,
                    total_commands INTEGER NOT NULL DEFAULT 0,
                    successful_commands INTEGER NOT NULL DEFAULT 0,
                    flags_found_count INTEGER NOT NULL DEFAULT 0,
                    ai_suggestions_used INTEGER NOT NULL DEFAULT 0,
                    ai_insights TEXT NOT NULL DEFAULT '[]',
                    effective_tools TEXT NOT NULL DEFAULT '[]',
                    notes TEXT,
                    summary TEXT
                );

                CREATE TABLE IF NOT EXISTS commands (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    command_id TEXT NOT NULL,
                    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    session_id TEXT REFERENCES analysis_sessions(id) ON DELETE SET NULL,
                    tool TEXT NOT NULL,
                    arguments TEXT NOT NULL DEFAULT '[]',
                    started_at TEXT NOT NULL,
                    completed_at TEXT,
                    exit_code INTEGER,
                    stdout TEXT NOT NULL DEFAULT '',
                    stderr TEXT NOT NULL DEFAULT '',
                    stdout_truncated TEXT NOT NULL DEFAULT '',
                    output_hash TEXT,
                    UNIQUE(job_id, command_id)
                );

                CREATE TABLE IF NOT EXISTS flag_candidates (
                    id TEXT PRIMARY KEY,
                    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    session_id TEXT REFERENCES analysis_sessions(id) ON DELETE SET NULL,
                    value TEXT NOT NULL,
                    confidence REAL NOT NULL DEFAULT 0.5,
                    source TEXT NOT NULL,
                    evidence_id TEXT,
                    context TEXT,
                    verified INTEGER NOT NULL DEFAULT 0,
                    verified_at TEXT,
                    UNIQUE(job_id, value)
                );

                CREATE TABLE IF NOT EXISTS solve_history (
                    id TEXT PRIMARY KEY,
                    category TEXT NOT NULL,
                    file_types TEXT NOT NULL DEFAULT '[]',
                    successful_tools TEXT NOT NULL DEFAULT '[]',
                    tool_sequence TEXT NOT NULL DEFAULT '[]',
                    winning_strategy TEXT,
                    time_to_solve_seconds INTEGER,
                    total_commands INTEGER NOT NULL DEFAULT 0,
                    keywords TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                CREATE INDEX IF NOT EXISTS idx_commands_job ON commands(job_id);
                CREATE INDEX IF NOT EXISTS idx_commands_session ON commands(session_id);
                CREATE INDEX IF NOT EXISTS idx_flag_candidates_job ON flag_candidates(job_id);
                CREATE INDEX IF NOT EXISTS idx_sessions_job ON analysis_sessions(job_id);
                CREATE INDEX IF NOT EXISTS idx_solve_history_category ON solve_history(category, created_at);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    /// Cheap round trip used by the readiness check.
    pub fn ping(&self) -> Result<()> {
        self.conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .context("Database did not answer")?;
        Ok(())
    }

    pub fn create_job(&self, title: &str, description: &str, flag_format: &str) -> Result<Job> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let timeline = serde_json::to_string(&[TimelineEvent {
            timestamp: now.clone(),
            event: "Job created".to_string(),
        }])?;
        self.conn
            .execute(
                "INSERT INTO jobs (id, title, description, flag_format, status, created_at, timeline)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6)",
                params![id, title, description, flag_format, now, timeline],
            )
            .context("Failed to insert job")?;
        self.get_job(&id)?.context("Job not found after insert")
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], job_row)
            .optional()
            .context("Failed to query job")?;
        row.map(JobRow::into_job).transpose()
    }

    /// Newest first. Returns the page and the total matching count.
    pub fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Job>, i64)> {
        let status = status.map(|s| s.as_str());
        let total: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM jobs WHERE (?1 IS NULL OR status = ?1)",
                params![status],
                |row| row.get(0),
            )
            .context("Failed to count jobs")?;

        let sql = format!(
            "SELECT {} FROM jobs WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3",
            JOB_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_jobs")?;
        let rows = stmt
            .query_map(params![status, limit, offset], job_row)
            .context("Failed to query jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read job row")?.into_job()?);
        }
        Ok((jobs, total))
    }

    fn require_job(&self, id: &str) -> Result<Job> {
        self.get_job(id)?
            .ok_or_else(|| TriageError::JobNotFound { id: id.to_string() }.into())
    }

    fn write_timeline(&self, id: &str, timeline: &[TimelineEvent]) -> Result<()> {
        self.conn
            .execute(
                "UPDATE jobs SET timeline = ?1 WHERE id = ?2",
                params![serde_json::to_string(timeline)?, id],
            )
            .context("Failed to write job timeline")?;
        Ok(())
    }

    pub fn set_input_files(&self, id: &str, files: &[String]) -> Result<()> {
        let count = self
            .conn
            .execute(
                "UPDATE jobs SET input_files = ?1 WHERE id = ?2",
                params![serde_json::to_string(files)?, id],
            )
            .context("Failed to update input files")?;
        if count == 0 {
            return Err(TriageError::JobNotFound { id: id.to_string() }.into());
        }
        Ok(())
    }

    pub fn add_timeline_event(&self, id: &str, event: &str) -> Result<()> {
        let mut job = self.require_job(id)?;
        job.timeline.push(TimelineEvent {
            timestamp: now_rfc3339(),
            event: event.to_string(),
        });
        self.write_timeline(id, &job.timeline)
    }

    pub fn increment_commands(&self, id: &str, by: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE jobs SET commands_executed = commands_executed + ?1 WHERE id = ?2",
                params![by, id],
            )
            .context("Failed to increment command counter")?;
        Ok(())
    }

    /// Move a job along its lifecycle. Stamps `started_at` on the first entry
    /// into running and `completed_at` on terminal states. Entering running
    /// clears the previous attempt's error.
    pub fn update_status(
        &self,
        id: &str,
        status: JobStatus,
        event: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<Job> {
        let mut job = self.require_job(id)?;
        if !job.status.can_transition_to(status) {
            bail!("Job {} cannot move from {} to {}", id, job.status, status);
        }
        let now = now_rfc3339();
        if status == JobStatus::Running {
            job.error_message = None;
            if job.started_at.is_none() {
                job.started_at = Some(now.clone());
            }
        }
        if status.is_terminal() {
            job.completed_at = Some(now.clone());
        }
        if let Some(message) = error_message {
            job.error_message = Some(message.to_string());
        }
        if let Some(event) = event {
            job.timeline.push(TimelineEvent {
                timestamp: now,
                event: event.to_string(),
            });
        }
        self.conn
            .execute(
                "UPDATE jobs SET status = ?1, started_at = ?2, completed_at = ?3, error_message = ?4, timeline = ?5
                 WHERE id = ?6",
                params![
                    status.as_str(),
                    job.started_at,
                    job.completed_at,
                    job.error_message,
                    serde_json::to_string(&job.timeline)?,
                    id
                ],
            )
            .context("Failed to update job status")?;
        self.require_job(id)
    }

    /// Accept a run request: only from pending or failed. Clears the previous
    /// error and completion stamp.
    pub fn request_run(&self, id: &str) -> Result<Job> {
        let job = self.require_job(id)?;
        if !job.status.can_run() {
            return Err(TriageError::InvalidTransition { status: job.status }.into());
        }
        self.conn
            .execute(
                "UPDATE jobs SET error_message = NULL, completed_at = NULL WHERE id = ?1",
                params![id],
            )
            .context("Failed to reset job before queueing")?;
        self.update_status(id, JobStatus::Queued, Some("Job queued for execution"), None)
    }

    // ── Commands ──────────────────────────────────────────────────────

    /// Persist a batch of executed steps in one transaction and bump the
    /// job's command counter by the batch size. Rows are write-once: an id
    /// already recorded for the job fails the whole batch.
    pub fn insert_commands(
        &self,
        job_id: &str,
        session_id: Option<&str>,
        outputs: &[CommandOutput],
    ) -> Result<usize> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let completed_at = now_rfc3339();
        for output in outputs {
            tx.execute(
                "INSERT INTO commands (command_id, job_id, session_id, tool, arguments, started_at, completed_at,
                                       exit_code, stdout, stderr, stdout_truncated, output_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    output.command_id,
                    job_id,
                    session_id,
                    output.tool,
                    serde_json::to_string(&output.arguments)?,
                    output.timestamp,
                    completed_at,
                    output.exit_code,
                    output.stdout,
                    output.stderr,
                    truncate_bytes(&output.stdout, TRUNCATED_STDOUT_BYTES),
                    output.output_hash,
                ],
            )
            .with_context(|| format!("Failed to insert command {}", output.command_id))?;
        }
        tx.execute(
            "UPDATE jobs SET commands_executed = commands_executed + ?1 WHERE id = ?2",
            params![outputs.len() as i64, job_id],
        )
        .context("Failed to increment command counter")?;
        tx.commit().context("Failed to commit commands")?;
        Ok(outputs.len())
    }

    /// Number the next pipeline step after every `cmd_NNN` already
    /// recorded for the job, so retries never reuse an id.
    pub fn next_step_index(&self, job_id: &str) -> Result<usize> {
        let last: Option<i64> = self
            .conn
            .query_row(
                "SELECT MAX(CAST(SUBSTR(command_id, 5) AS INTEGER)) FROM commands
                 WHERE job_id = ?1 AND command_id GLOB 'cmd_[0-9]*'",
                params![job_id],
                |row| row.get(0),
            )
            .context("Failed to read last step index")?;
        Ok(last.map_or(0, |n| n as usize + 1))
    }

    pub fn list_commands(&self, job_id: &str) -> Result<Vec<CommandRecord>> {
        let sql = format!(
            "SELECT {} FROM commands WHERE job_id = ?1 ORDER BY started_at, seq",
            COMMAND_COLUMNS
        );
        self.query_commands(&sql, job_id)
    }

    fn query_commands(&self, sql: &str, key: &str) -> Result<Vec<CommandRecord>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare command query")?;
        let rows = stmt
            .query_map(params![key], command_row)
            .context("Failed to query commands")?;
        let mut commands = Vec::new();
        for row in rows {
            commands.push(row.context("Failed to read command row")?.into_command()?);
        }
        Ok(commands)
    }

    // ── Flag candidates ───────────────────────────────────────────────

    /// Insert candidates, merging on `(job_id, value)`. Returns how many
    /// were new.
    pub fn insert_candidates(
        &self,
        job_id: &str,
        session_id: Option<&str>,
        candidates: &[Candidate],
    ) -> Result<usize> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let mut inserted = 0;
        for c in candidates {
            inserted += tx
                .execute(
                    "INSERT INTO flag_candidates (id, job_id, session_id, value, confidence, source, evidence_id, context)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(job_id, value) DO NOTHING",
                    params![
                        uuid::Uuid::new_v4().to_string(),
                        job_id,
                        session_id,
                        c.value,
                        c.confidence,
                        c.source,
                        c.evidence_id,
                        c.context,
                    ],
                )
                .context("Failed to insert flag candidate")?;
        }
        tx.commit().context("Failed to commit flag candidates")?;
        Ok(inserted)
    }

    pub fn list_candidates(&self, job_id: &str) -> Result<Vec<FlagCandidate>> {
        let sql = format!(
            "SELECT {} FROM flag_candidates WHERE job_id = ?1 ORDER BY confidence DESC, rowid",
            CANDIDATE_COLUMNS
        );
        self.query_candidates(&sql, job_id)
    }

    fn query_candidates(&self, sql: &str, key: &str) -> Result<Vec<FlagCandidate>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare candidate query")?;
        let rows = stmt
            .query_map(params![key], candidate_row)
            .context("Failed to query flag candidates")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read flag candidate row")?);
        }
        Ok(out)
    }

    /// Mark a candidate as verified. `None` when it does not belong to the job.
    pub fn verify_candidate(&self, job_id: &str, candidate_id: &str) -> Result<Option<FlagCandidate>> {
        let count = self
            .conn
            .execute(
                "UPDATE flag_candidates SET verified = 1, verified_at = ?1 WHERE id = ?2 AND job_id = ?3",
                params![now_rfc3339(), candidate_id, job_id],
            )
            .context("Failed to verify flag candidate")?;
        if count == 0 {
            return Ok(None);
        }
        let sql = format!("SELECT {} FROM flag_candidates WHERE id = ?1", CANDIDATE_COLUMNS);
        self.conn
            .query_row(&sql, params![candidate_id], candidate_row)
            .optional()
            .context("Failed to read verified candidate")
    }

    // ── Analysis sessions ─────────────────────────────────────────────

    pub fn create_session(&self, job_id: &str, name: &str, strategy: &str) -> Result<AnalysisSession> {
        self.require_job(job_id)?;
        let id = uuid::Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO analysis_sessions (id, job_id, name, strategy, status, started_at)
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5)",
                params![id, job_id, name, strategy, now_rfc3339()],
            )
            .context("Failed to insert analysis session")?;
        self.require_session(&id)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<AnalysisSession>> {
        let sql = format!("SELECT {} FROM analysis_sessions WHERE id = ?1", SESSION_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], session_row)
            .optional()
            .context("Failed to query analysis session")?;
        row.map(SessionRow::into_session).transpose()
    }

    fn require_session(&self, id: &str) -> Result<AnalysisSession> {
        self.get_session(id)?
            .ok_or_else(|| TriageError::SessionNotFound { id: id.to_string() }.into())
    }

    pub fn update_session(
        &self,
        id: &str,
        detected_category: Option<&str>,
        notes: Option<&str>,
    ) -> Result<AnalysisSession> {
        self.require_session(id)?;
        if let Some(category) = detected_category {
            self.conn
                .execute(
                    "UPDATE analysis_sessions SET detected_category = ?1 WHERE id = ?2",
                    params![category, id],
                )
                .context("Failed to update session category")?;
        }
        if let Some(notes) = notes {
            self.conn
                .execute(
                    "UPDATE analysis_sessions SET notes = ?1 WHERE id = ?2",
                    params![notes, id],
                )
                .context("Failed to update session notes")?;
        }
        self.require_session(id)
    }

    /// Append a timestamped insight and count it as a used suggestion.
    pub fn add_ai_insight(&self, id: &str, insight: serde_json::Value) -> Result<AnalysisSession> {
        let session = self.require_session(id)?;
        let mut record = match insight {
            serde_json::Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("insight".to_string(), other);
                map
            }
        };
        record.insert("timestamp".to_string(), now_rfc3339().into());
        let mut insights = session.ai_insights;
        insights.push(serde_json::Value::Object(record));
        self.conn
            .execute(
                "UPDATE analysis_sessions SET ai_insights = ?1, ai_suggestions_used = ai_suggestions_used + 1
                 WHERE id = ?2",
                params![serde_json::to_string(&insights)?, id],
            )
            .context("Failed to record AI insight")?;
        self.require_session(id)
    }

    pub fn record_effective_tool(&self, id: &str, tool: &str, context: Option<&str>) -> Result<AnalysisSession> {
        let session = self.require_session(id)?;
        let mut tools = session.effective_tools;
        tools.push(EffectiveTool {
            tool: tool.to_string(),
            context: context.map(str::to_string),
            timestamp: now_rfc3339(),
        });
        self.conn
            .execute(
                "UPDATE analysis_sessions SET effective_tools = ?1 WHERE id = ?2",
                params![serde_json::to_string(&tools)?, id],
            )
            .context("Failed to record effective tool")?;
        self.require_session(id)
    }

    /// Close a session, recomputing its counters from the rows it owns.
    pub fn end_session(&self, id: &str, status: SessionStatus, summary: Option<&str>) -> Result<AnalysisSession> {
        self.require_session(id)?;
        let count = |sql: &str| -> Result<i64> {
            self.conn
                .query_row(sql, params![id], |row| row.get(0))
                .context("Failed to count session rows")
        };
        let total = count("SELECT COUNT(*) FROM commands WHERE session_id = ?1")?;
        let successful = count("SELECT COUNT(*) FROM commands WHERE session_id = ?1 AND exit_code = 0")?;
        let flags = count("SELECT COUNT(*) FROM flag_candidates WHERE session_id = ?1")?;

        self.conn
            .execute(
                "UPDATE analysis_sessions SET status = ?1, ended_at = ?2, summary = ?3,
                    total_commands = ?4, successful_commands = ?5, flags_found_count = ?6
                 WHERE id = ?7",
                params![status.as_str(), now_rfc3339(), summary, total, successful, flags, id],
            )
            .context("Failed to end analysis session")?;
        self.require_session(id)
    }

    /// Newest first.
    pub fn list_sessions(&self, job_id: &str, limit: i64) -> Result<Vec<AnalysisSession>> {
        let sql = format!(
            "SELECT {} FROM analysis_sessions WHERE job_id = ?1 ORDER BY started_at DESC, rowid DESC LIMIT ?2",
            SESSION_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_sessions")?;
        let rows = stmt
            .query_map(params![job_id, limit], session_row)
            .context("Failed to query analysis sessions")?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row.context("Failed to read session row")?.into_session()?);
        }
        Ok(sessions)
    }

    pub fn session_detail(&self, id: &str) -> Result<Option<SessionDetail>> {
        let Some(session) = self.get_session(id)? else {
            return Ok(None);
        };
        let commands = self.query_commands(
            &format!(
                "SELECT {} FROM commands WHERE session_id = ?1 ORDER BY started_at, seq",
                COMMAND_COLUMNS
            ),
            id,
        )?;
        let flags = self.query_candidates(
            &format!(
                "SELECT {} FROM flag_candidates WHERE session_id = ?1 ORDER BY confidence DESC, rowid",
                CANDIDATE_COLUMNS
            ),
            id,
        )?;
        Ok(Some(SessionDetail {
            session,
            commands,
            flags,
        }))
    }

    // ── Global solve history ──────────────────────────────────────────

    /// Promote a session into the append-only solve ledger.
    pub fn save_to_global_history(
        &self,
        session_id: &str,
        file_types: &[String],
        successful_tools: &[String],
        tool_sequence: &[String],
        keywords: &[String],
    ) -> Result<SolveRecord> {
        let session = self.require_session(session_id)?;
        let time_to_solve = session
            .ended_at
            .as_deref()
            .and_then(|end| seconds_between(&session.started_at, end));
        let id = uuid::Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO solve_history (id, category, file_types, successful_tools, tool_sequence,
                                            winning_strategy, time_to_solve_seconds, total_commands, keywords, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    id,
                    session.detected_category.as_deref().unwrap_or("misc"),
                    serde_json::to_string(file_types)?,
                    serde_json::to_string(successful_tools)?,
                    serde_json::to_string(tool_sequence)?,
                    session.strategy,
                    time_to_solve,
                    session.total_commands,
                    serde_json::to_string(keywords)?,
                    now_rfc3339(),
                ],
            )
            .context("Failed to insert solve history")?;
        let sql = format!("SELECT {} FROM solve_history WHERE id = ?1", SOLVE_COLUMNS);
        self.conn
            .query_row(&sql, params![id], solve_row)
            .context("Solve record not found after insert")?
            .into_solve()
    }

    /// Newest records for a category.
    pub fn recent_solves(&self, category: &str, limit: i64) -> Result<Vec<SolveRecord>> {
        let sql = format!(
            "SELECT {} FROM solve_history WHERE category = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            SOLVE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare recent_solves")?;
        let rows = stmt
            .query_map(params![category, limit], solve_row)
            .context("Failed to query solve history")?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("Failed to read solve row")?.into_solve()?);
        }
        Ok(records)
    }
}

// ── Row mapping ───────────────────────────────────────────────────────

fn parse_json<T: serde::de::DeserializeOwned>(raw: &str, what: &str) -> Result<T> {
    serde_json::from_str(raw).with_context(|| format!("Failed to parse {} JSON", what))
}

/// Intermediate row struct for jobs.
struct JobRow {
    id: String,
    title: String,
    description: String,
    flag_format: String,
    status: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    input_files: String,
    commands_executed: i64,
    timeline: String,
    error_message: Option<String>,
}

fn job_row(row: &Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        flag_format: row.get(3)?,
        status: row.get(4)?,
        created_at: row.get(5)?,
        started_at: row.get(6)?,
        completed_at: row.get(7)?,
        input_files: row.get(8)?,
        commands_executed: row.get(9)?,
        timeline: row.get(10)?,
        error_message: row.get(11)?,
    })
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse job status")?;
        Ok(Job {
            id: self.id,
            title: self.title,
            description: self.description,
            flag_format: self.flag_format,
            status,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            input_files: parse_json(&self.input_files, "input files")?,
            commands_executed: self.commands_executed,
            timeline: parse_json(&self.timeline, "timeline")?,
            error_message: self.error_message,
        })
    }
}

struct CommandRow {
    command_id: String,
    job_id: String,
    session_id: Option<String>,
    tool: String,
    arguments: String,
    started_at: String,
    completed_at: Option<String>,
    exit_code: Option<i64>,
    stdout: String,
    stderr: String,
    stdout_truncated: String,
    output_hash: Option<String>,
}

fn command_row(row: &Row<'_>) -> rusqlite::Result<CommandRow> {
    Ok(CommandRow {
        command_id: row.get(0)?,
        job_id: row.get(1)?,
        session_id: row.get(2)?,
        tool: row.get(3)?,
        arguments: row.get(4)?,
        started_at: row.get(5)?,
        completed_at: row.get(6)?,
        exit_code: row.get(7)?,
        stdout: row.get(8)?,
        stderr: row.get(9)?,
        stdout_truncated: row.get(10)?,
        output_hash: row.get(11)?,
    })
}

impl CommandRow {
    fn into_command(self) -> Result<CommandRecord> {
        Ok(CommandRecord {
            id: self.command_id,
            job_id: self.job_id,
            session_id: self.session_id,
            tool: self.tool,
            arguments: parse_json(&self.arguments, "command arguments")?,
            started_at: self.started_at,
            completed_at: self.completed_at,
            exit_code: self.exit_code,
            stdout: self.stdout,
            stderr: self.stderr,
            stdout_truncated: self.stdout_truncated,
            output_hash: self.output_hash,
        })
    }
}

fn candidate_row(row: &Row<'_>) -> rusqlite::Result<FlagCandidate> {
    Ok(FlagCandidate {
        id: row.get(0)?,
        job_id: row.get(1)?,
        session_id: row.get(2)?,
        value: row.get(3)?,
        confidence: row.get(4)?,
        source: row.get(5)?,
        evidence_id: row.get(6)?,
        context: row.get(7)?,
        verified: row.get(8)?,
        verified_at: row.get(9)?,
    })
}

struct SessionRow {
    id: String,
    job_id: String,
    name: String,
    strategy: String,
    detected_category: Option<String>,
    status: String,
    started_at: String,
    ended_at: Option<String>,
    total_commands: i64,
    successful_commands: i64,
    flags_found_count: i64,
    ai_suggestions_used: i64,
    ai_insights: String,
    effective_tools: String,
    notes: Option<String>,
    summary: Option<String>,
}

fn session_row(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        job_id: row.get(1)?,
        name: row.get(2)?,
        strategy: row.get(3)?,
        detected_category: row.get(4)?,
        status: row.get(5)?,
        started_at: row.get(6)?,
        ended_at: row.get(7)?,
        total_commands: row.get(8)?,
        successful_commands: row.get(9)?,
        flags_found_count: row.get(10)?,
        ai_suggestions_used: row.get(11)?,
        ai_insights: row.get(12)?,
        effective_tools: row.get(13)?,
        notes: row.get(14)?,
        summary: row.get(15)?,
    })
}

impl SessionRow {
    fn into_session(self) -> Result<AnalysisSession> {
        let status = SessionStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse session status")?;
        Ok(AnalysisSession {
            id: self.id,
            job_id: self.job_id,
            name: self.name,
            strategy: self.strategy,
            detected_category: self.detected_category,
            status,
            started_at: self.started_at,
            ended_at: self.ended_at,
            total_commands: self.total_commands,
            successful_commands: self.successful_commands,
            flags_found_count: self.flags_found_count,
            ai_suggestions_used: self.ai_suggestions_used,
            ai_insights: parse_json(&self.ai_insights, "AI insights")?,
            effective_tools: parse_json(&self.effective_tools, "effective tools")?,
            notes: self.notes,
            summary: self.summary,
        })
    }
}

struct SolveRow {
    id: String,
    category: String,
    file_types: String,
    successful_tools: String,
    tool_sequence: String,
    winning_strategy: Option<String>,
    time_to_solve_seconds: Option<i64>,
    total_commands: i64,
    keywords: String,
    created_at: String,
}

fn solve_row(row: &Row<'_>) -> rusqlite::Result<SolveRow> {
    Ok(SolveRow {
        id: row.get(0)?,
        category: row.get(1)?,
        file_types: row.get(2)?,
        successful_tools: row.get(3)?,
        tool_sequence: row.get(4)?,
        winning_strategy: row.get(5)?,
        time_to_solve_seconds: row.get(6)?,
        total_commands: row.get(7)?,
        keywords: row.get(8)?,
        created_at: row.get(9)?,
    })
}

impl SolveRow {
    fn into_solve(self) -> Result<SolveRecord> {
        Ok(SolveRecord {
            id: self.id,
            category: self.category,
            file_types: parse_json(&self.file_types, "file types")?,
            successful_tools: parse_json(&self.successful_tools, "successful tools")?,
            tool_sequence: parse_json(&self.tool_sequence, "tool sequence")?,
            winning_strategy: self.winning_strategy,
            time_to_solve_seconds: self.time_to_solve_seconds,
            total_commands: self.total_commands,
            keywords: parse_json(&self.keywords, "keywords")?,
            created_at: self.created_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
