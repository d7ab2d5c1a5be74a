//! Progress fan-out to WebSocket subscribers.
//!
//! Each subscriber owns a bounded channel. `publish` snapshots the matching
//! senders under the lock, releases it, then attempts every send on its
//! own, so one closed or stalled subscriber never holds up the rest.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::models::JobStatus;

/// Buffered events per subscriber before it counts as stalled.
pub const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag_candidates: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StatusUpdate {
    pub fn new(status: JobStatus, progress: u8, message: impl Into<String>) -> Self {
        Self {
            status,
            progress: progress.min(100),
            message: message.into(),
            completed: false,
            flag_candidates: None,
            error_message: None,
        }
    }

    /// Terminal update: 100% on success, 0% on failure.
    pub fn finished(
        status: JobStatus,
        message: impl Into<String>,
        flag_candidates: usize,
        error_message: Option<String>,
    ) -> Self {
        let progress = if status == JobStatus::Completed { 100 } else { 0 };
        Self {
            completed: true,
            flag_candidates: Some(flag_candidates),
            error_message,
            ..Self::new(status, progress, message)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
}

/// Wire shape of everything pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    JobUpdate { job_id: String, data: StatusUpdate },
    JobLog { job_id: String, data: LogLine },
}

impl ProgressEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::JobUpdate { job_id, .. } | Self::JobLog { job_id, .. } => job_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Job(String),
}

/// Receiving end handed to a connection task.
pub struct Subscription {
    pub id: u64,
    pub scope: Scope,
    pub rx: mpsc::Receiver<String>,
}

#[derive(Default)]
struct Subscribers {
    global: HashMap<u64, mpsc::Sender<String>>,
    per_job: HashMap<String, HashMap<u64, mpsc::Sender<String>>>,
}

impl Subscribers {
    fn remove(&mut self, scope: &Scope, id: u64) -> bool {
        match scope {
            Scope::Global => self.global.remove(&id).is_some(),
            Scope::Job(job_id) => {
                let Some(set) = self.per_job.get_mut(job_id) else {
                    return false;
                };
                let removed = set.remove(&id).is_some();
                if set.is_empty() {
                    self.per_job.remove(job_id);
                }
                removed
            }
        }
    }
}

pub struct ProgressBroadcaster {
    subscribers: Mutex<Subscribers>,
    next_id: AtomicU64,
    buffer: usize,
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(SUBSCRIBER_BUFFER)
    }
}

impl ProgressBroadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(Subscribers::default()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        // A panic while holding the lock cannot leave the maps half-updated.
        self.subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self, scope: Scope) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        {
            let mut subs = self.lock();
            match &scope {
                Scope::Global => {
                    subs.global.insert(id, tx);
                }
                Scope::Job(job_id) => {
                    subs.per_job.entry(job_id.clone()).or_default().insert(id, tx);
                }
            }
        }
        tracing::debug!(subscriber = id, scope = ?scope, "Subscriber added");
        Subscription { id, scope, rx }
    }

    pub fn unsubscribe(&self, scope: &Scope, id: u64) -> bool {
        let removed = self.lock().remove(scope, id);
        if removed {
            tracing::debug!(subscriber = id, scope = ?scope, "Subscriber removed");
        }
        removed
    }

    pub fn subscriber_count(&self, scope: &Scope) -> usize {
        let subs = self.lock();
        match scope {
            Scope::Global => subs.global.len(),
            Scope::Job(job_id) => subs.per_job.get(job_id).map_or(0, |s| s.len()),
        }
    }

    /// Deliver `event` to the job's subscribers and every global one.
    /// Returns how many subscribers accepted it; failed ones are dropped.
    pub fn publish(&self, event: &ProgressEvent) -> usize {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode progress event");
                return 0;
            }
        };

        let targets: Vec<(Scope, u64, mpsc::Sender<String>)> = {
            let subs = self.lock();
            let job_scope = Scope::Job(event.job_id().to_string());
            subs.per_job
                .get(event.job_id())
                .into_iter()
                .flat_map(|set| set.iter().map(|(id, tx)| (job_scope.clone(), *id, tx.clone())))
                .chain(subs.global.iter().map(|(id, tx)| (Scope::Global, *id, tx.clone())))
                .collect()
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (scope, id, tx) in targets {
            match tx.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(subscriber = id, error = %e, "Dropping subscriber after failed send");
                    dead.push((scope, id));
                }
            }
        }

        if !dead.is_empty() {
            let mut subs = self.lock();
            for (scope, id) in &dead {
                subs.remove(scope, *id);
            }
        }
        delivered
    }

    pub fn publish_status(&self, job_id: &str, update: StatusUpdate) -> usize {
        self.publish(&ProgressEvent::JobUpdate {
            job_id: job_id.to_string(),
            data: update,
        })
    }

    pub fn publish_log(&self, job_id: &str, level: LogLevel, message: impl Into<String>) -> usize {
        self.publish(&ProgressEvent::JobLog {
            job_id: job_id.to_string(),
            data: LogLine {
                level,
                message: message.into(),
            },
        })
    }
}
