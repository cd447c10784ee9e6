//! Live per-source job status, the global run flag and per-source claims.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Pipeline stage a source is in.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Fetching,
    Parsing,
    Filtering,
    Enriching,
    Saving,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobStatus {
    pub state: JobState,
    pub detail: String,
    pub updated_at: DateTime<Utc>,
}

/// Process-wide job status map.
#[derive(Debug, Default)]
pub struct JobTracker {
    statuses: Mutex<HashMap<String, JobStatus>>,
    running: Arc<AtomicBool>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, source: &str, state: JobState, detail: impl Into<String>) {
        let status = JobStatus {
            state,
            detail: detail.into(),
            updated_at: Utc::now(),
        };
        tracing::debug!(source, state = ?status.state, detail = %status.detail, "Job state changed");
        self.statuses.lock().insert(source.to_string(), status);
    }

    pub fn get(&self, source: &str) -> Option<JobStatus> {
        self.statuses.lock().get(source).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, JobStatus> {
        self.statuses.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Claim the global run flag. `None` if a full run is already active.
    pub fn try_start_run(&self) -> Option<RunGuard> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuard {
                flag: self.running.clone(),
            })
    }

    /// Claim a source for processing. `None` while another task holds it.
    pub fn try_claim_source(&self, source: &str) -> Option<SourceGuard> {
        self.active.lock().insert(source.to_string()).then(|| SourceGuard {
            source: source.to_string(),
            active: self.active.clone(),
        })
    }

    pub fn is_source_active(&self, source: &str) -> bool {
        self.active.lock().contains(source)
    }
}

/// Releases the run flag on drop.
#[derive(Debug)]
pub struct RunGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Releases a source claim on drop.
#[derive(Debug)]
pub struct SourceGuard {
    source: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Drop for SourceGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.source);
    }
}
