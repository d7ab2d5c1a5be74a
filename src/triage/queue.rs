//! Task queue: a bounded channel of job ids drained by a fixed worker pool.
//!
//! Each job runs start to finish on one worker. A pipeline fault is retried
//! at whole-job granularity up to `max_retries` more times.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use super::orchestrator::PipelineOrchestrator;
use crate::errors::TriageError;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub workers: usize,
    pub max_retries: u32,
    pub capacity: usize,
    pub retry_delay_secs: u64,
    /// Wall-clock ceiling for one attempt of a whole job.
    pub job_time_limit_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_retries: 2,
            capacity: 256,
            retry_delay_secs: 5,
            job_time_limit_secs: 60 * 20,
        }
    }
}

/// `[queue]` table of `triage.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueSection {
    pub workers: Option<usize>,
    pub max_retries: Option<u32>,
    pub capacity: Option<usize>,
    pub retry_delay_secs: Option<u64>,
    pub job_time_limit_secs: Option<u64>,
}

impl QueueConfig {
    pub fn apply(&mut self, section: QueueSection) {
        if let Some(v) = section.workers {
            self.workers = v;
        }
        if let Some(v) = section.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = section.capacity {
            self.capacity = v;
        }
        if let Some(v) = section.retry_delay_secs {
            self.retry_delay_secs = v;
        }
        if let Some(v) = section.job_time_limit_secs {
            self.job_time_limit_secs = v;
        }
    }
}

/// Sending half handed to the API.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<String>,
}

impl TaskQueue {
    /// Spawn the worker pool and return the queue handle plus worker tasks.
    /// Workers exit once every `TaskQueue` clone is dropped and the
    /// channel drains.
    pub fn start(
        orchestrator: Arc<PipelineOrchestrator>,
        config: QueueConfig,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel::<String>(config.capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let config = Arc::new(config);

        let handles = (0..config.workers.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let orchestrator = Arc::clone(&orchestrator);
                let config = Arc::clone(&config);
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(job_id) = next else {
                            break;
                        };
                        tracing::debug!(worker, job_id = %job_id, "Worker picked up job");
                        process(&orchestrator, &config, &job_id).await;
                    }
                    tracing::debug!(worker, "Worker stopped");
                })
            })
            .collect();

        (Self { tx }, handles)
    }

    pub async fn enqueue(&self, job_id: &str) -> Result<(), TriageError> {
        self.tx
            .send(job_id.to_string())
            .await
            .map_err(|_| TriageError::QueueClosed)
    }
}

/// Run a job, retrying pipeline faults. Returns the number of attempts made.
pub async fn process(orchestrator: &PipelineOrchestrator, config: &QueueConfig, job_id: &str) -> u32 {
    let limit = Duration::from_secs(config.job_time_limit_secs.max(1));
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(limit, orchestrator.run_job(job_id)).await {
            Ok(result) => result,
            Err(_) => {
                let message = format!("Job exceeded time limit ({}s)", limit.as_secs());
                orchestrator.abandon(job_id, &message).await;
                Err(anyhow::anyhow!(message))
            }
        };

        match result {
            Ok(candidates) => {
                tracing::info!(job_id, attempt, candidates, "Job finished");
                return attempt;
            }
            Err(e) if attempt <= config.max_retries && orchestrator.is_retryable(job_id).await => {
                tracing::warn!(job_id, attempt, error = %format!("{:#}", e), "Job failed, retrying");
                if config.retry_delay_secs > 0 {
                    tokio::time::sleep(Duration::from_secs(config.retry_delay_secs * attempt as u64)).await;
                }
            }
            Err(e) => {
                tracing::error!(job_id, attempt, error = %format!("{:#}", e), "Job failed permanently");
                return attempt;
            }
        }
    }
}
