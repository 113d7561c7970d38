//! Async job model for batch crawls: submit, status, cancel, list, plus
//! retention of terminal jobs for inspection.

use crate::context::{CancelFlag, RequestContext};
use crate::error::ErrorKind;
use crate::pipeline::{run_batch, BatchOutcome, BatchRequest, PipelineDeps};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Counters {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Progress counters shared between a job and its pipeline workers. Writes
/// are serialized and reads snapshot, so any observer sees
/// `completed + failed + cancelled <= total`.
#[derive(Debug, Default)]
pub struct JobProgress {
    counters: Mutex<Counters>,
}

impl JobProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_total(&self, total: usize) {
        if let Ok(mut counters) = self.counters.lock() {
            counters.total = total;
        }
    }

    pub fn url_completed(&self) {
        if let Ok(mut counters) = self.counters.lock() {
            counters.completed += 1;
        }
    }

    pub fn url_failed(&self) {
        if let Ok(mut counters) = self.counters.lock() {
            counters.failed += 1;
        }
    }

    pub fn url_cancelled(&self) {
        if let Ok(mut counters) = self.counters.lock() {
            counters.cancelled += 1;
        }
    }

    pub fn snapshot(&self) -> Counters {
        self.counters.lock().map(|c| *c).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: String,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<BatchOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

struct JobInner {
    state: JobState,
    result: Option<BatchOutcome>,
    error: Option<(ErrorKind, String)>,
    terminal_at: Option<Instant>,
}

struct JobEntry {
    id: String,
    submitted_at: DateTime<Utc>,
    progress: Arc<JobProgress>,
    cancel: CancelFlag,
    inner: Mutex<JobInner>,
}

pub struct JobManager {
    jobs: DashMap<String, Arc<JobEntry>>,
    deps: Arc<PipelineDeps>,
    retention: Duration,
    cap: usize,
}

impl JobManager {
    pub fn new(deps: Arc<PipelineDeps>, retention: Duration, cap: usize) -> Arc<Self> {
        Arc::new(Self {
            jobs: DashMap::new(),
            deps,
            retention,
            cap,
        })
    }

    /// Background eviction loop; stops when the manager is dropped.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.sweep(Instant::now());
            }
        });
    }

    /// Submit a batch crawl, returning immediately with the job id.
    pub fn submit(&self, request: BatchRequest, namespace: String) -> String {
        let id = Uuid::new_v4().to_string();
        let entry = Arc::new(JobEntry {
            id: id.clone(),
            submitted_at: Utc::now(),
            progress: Arc::new(JobProgress::new()),
            cancel: CancelFlag::new(),
            inner: Mutex::new(JobInner {
                state: JobState::Pending,
                result: None,
                error: None,
                terminal_at: None,
            }),
        });
        self.jobs.insert(id.clone(), Arc::clone(&entry));
        self.enforce_cap();

        let deps = Arc::clone(&self.deps);
        tokio::spawn(async move {
            {
                let Ok(mut inner) = entry.inner.lock() else {
                    return;
                };
                if inner.state != JobState::Pending {
                    // Cancelled before a worker picked it up
                    return;
                }
                inner.state = JobState::Running;
            }
            info!("Job {} running", entry.id);

            let ctx = RequestContext::with_cancel(namespace, entry.cancel.clone());
            let outcome = run_batch(deps, request, ctx, Arc::clone(&entry.progress)).await;

            let Ok(mut inner) = entry.inner.lock() else {
                return;
            };
            // The result slot is written exactly once, here, by the owning
            // worker. A concurrent cancel may already have made the state
            // terminal; it is never overwritten.
            match outcome {
                Ok(result) => {
                    debug!(
                        "Job {} finished: {} processed, {} failed, {} cancelled",
                        entry.id,
                        result.processed,
                        result.failed.len(),
                        result.cancelled
                    );
                    if inner.state == JobState::Running {
                        inner.state = JobState::Completed;
                    }
                    inner.result = Some(result);
                }
                Err(e) if e.kind == ErrorKind::Cancelled => {
                    if inner.state == JobState::Running {
                        inner.state = JobState::Cancelled;
                    }
                }
                Err(e) => {
                    warn!("Job {} failed: {}", entry.id, e);
                    if inner.state == JobState::Running {
                        inner.state = JobState::Failed;
                    }
                    inner.error = Some((e.kind, e.message));
                }
            }
            if inner.terminal_at.is_none() {
                inner.terminal_at = Some(Instant::now());
            }
        });

        id
    }

    pub fn status(&self, job_id: &str) -> Option<JobStatus> {
        let entry = self.jobs.get(job_id)?;
        let counters = entry.progress.snapshot();
        let inner = entry.inner.lock().ok()?;
        Some(JobStatus {
            job_id: entry.id.clone(),
            state: inner.state,
            submitted_at: entry.submitted_at,
            total: counters.total,
            completed: counters.completed,
            failed: counters.failed,
            cancelled: counters.cancelled,
            result: inner.result.clone(),
            error: inner
                .error
                .as_ref()
                .map(|(kind, message)| serde_json::json!({ "kind": kind, "message": message })),
        })
    }

    /// Broadcast cancellation. Returns true iff the state actually
    /// transitioned (i.e. the job was not already terminal).
    pub fn cancel(&self, job_id: &str) -> bool {
        let Some(entry) = self.jobs.get(job_id) else {
            return false;
        };
        let Ok(mut inner) = entry.inner.lock() else {
            return false;
        };
        if inner.state.is_terminal() {
            return false;
        }
        entry.cancel.cancel();
        inner.state = JobState::Cancelled;
        inner.terminal_at = Some(Instant::now());
        info!("Job {} cancelled", job_id);
        true
    }

    pub fn list(&self) -> Vec<String> {
        let mut entries: Vec<(DateTime<Utc>, String)> = self
            .jobs
            .iter()
            .map(|e| (e.submitted_at, e.id.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().map(|(_, id)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Evict terminal jobs past the retention window.
    pub fn sweep(&self, now: Instant) {
        let expired: Vec<String> = self
            .jobs
            .iter()
            .filter_map(|entry| {
                let inner = entry.inner.lock().ok()?;
                let terminal_at = inner.terminal_at?;
                (now.duration_since(terminal_at) >= self.retention).then(|| entry.id.clone())
            })
            .collect();
        for id in &expired {
            self.jobs.remove(id);
        }
        if !expired.is_empty() {
            debug!("Swept {} expired jobs", expired.len());
        }
        self.enforce_cap();
    }

    /// Hard cap: evict the oldest terminal jobs first when over capacity.
    fn enforce_cap(&self) {
        if self.jobs.len() <= self.cap {
            return;
        }
        let mut terminal: Vec<(Instant, String)> = self
            .jobs
            .iter()
            .filter_map(|entry| {
                let inner = entry.inner.lock().ok()?;
                inner.terminal_at.map(|at| (at, entry.id.clone()))
            })
            .collect();
        terminal.sort_by(|a, b| a.0.cmp(&b.0));
        let mut excess = self.jobs.len().saturating_sub(self.cap);
        for (_, id) in terminal {
            if excess == 0 {
                break;
            }
            self.jobs.remove(&id);
            excess -= 1;
        }
    }
}
