//! Challenge triage back-end.
//!
//! ## Overview
//!
//! A submitted challenge becomes a job: its files are stored under
//! `runs/<job>/input`, a playbook is chosen from the file names, every step
//! runs as an allowlisted tool inside a locked-down container, flag-shaped
//! strings are pulled out of the output and scored, and a writeup that may
//! only cite recorded steps is produced. Progress streams to WebSocket
//! subscribers while the job runs.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, body limit, CORS)      │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                                        │
//!      ^                │         │ TaskQueue::enqueue(job_id)             │
//!      │                │         v                                        │
//!      │                │  queue.rs  (worker pool, whole-job retry)        │
//!      │                │         │                                        │
//!      │                │         │ PipelineOrchestrator::run_job()        │
//!      │                │         v                                        │
//!      │                │  orchestrator.rs                                 │
//!      │                │    ├─ playbook.rs  (PlaybookCatalog)             │
//!      │                │    ├─ sandbox.rs   (SandboxExecutor, Docker)     │
//!      │                │    ├─ evidence.rs  (EvidenceExtractor, pack)     │
//!      │                │    └─ report.rs    (ReportGenerator)             │
//!      │                │         │                                        │
//!      └──── ws.rs <─── │  broadcast.rs  (ProgressBroadcaster)             │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                             |
//! |------------|------------------------------------------------------------|
//! | `models`   | Shared types: `Job`, `JobStatus`, `FlagCandidate`, sessions |
//! | `db`       | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)        |
//! | `advisor`  | `HistoryAdvisor`: tool ranking from past solves            |
//! | `suggest`  | `Suggester` trait, rule-based analyst, category detection  |
//! | `llm`      | Chat-completions client shared by reports and suggestions  |
//! | `artifacts`| Run-directory listings and the `.tar.gz` download bundle   |
//!
//! ## Typical Request Flow (run a job)
//!
//! 1. `POST /api/jobs` stores the uploads and creates a `pending` job.
//! 2. `POST /api/jobs/{id}/run` → `TriageDb::request_run()` moves it to
//!    `queued` and the id goes onto the `TaskQueue`.
//! 3. A worker calls `PipelineOrchestrator::run_job()`: the job turns
//!    `running`, `PlaybookCatalog::select_playbook()` picks the steps and
//!    each one runs through `SandboxExecutor::run()` in order.
//! 4. Step results are stored as commands, `EvidenceExtractor` scores flag
//!    candidates, and `evidence.json` / `flags.json` land next to the inputs.
//! 5. The `EvidencePack` goes to the `ReportGenerator`; the orchestrator
//!    appends a warning block for unknown `cmd_NNN` citations. Without a model an evidence-only
//!    report is written instead.
//! 6. The job ends `completed`, or `failed` with its error text, and the
//!    queue may retry a failed run.

pub mod advisor;
pub mod api;
pub mod artifacts;
pub mod broadcast;
pub mod db;
pub mod evidence;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod playbook;
pub mod queue;
pub mod report;
pub mod sandbox;
pub mod server;
pub mod suggest;
pub mod ws;
