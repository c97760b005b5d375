use chrono::{DateTime, Utc};
use emblem_core::{JobPhase, Outcome};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Live view of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    /// Job the status belongs to.
    pub job_id: String,
    /// Phase the job is waiting in.
    pub phase: JobPhase,
    /// Current round, from 1.
    pub round: u32,
    /// When the intent was accepted.
    pub started_at: DateTime<Utc>,
    /// Last phase change.
    pub updated_at: DateTime<Utc>,
}

/// Lifetime counters across all jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobCounters {
    /// Jobs accepted.
    pub started: u64,
    /// Jobs completed on a stop decision.
    pub converged: u64,
    /// Jobs completed on the round budget.
    pub exhausted: u64,
    /// Jobs aborted on failure or reaped.
    pub aborted: u64,
}

/// Tracks phase and age of every live job so stale ones can be reaped.
pub struct JobMonitor {
    jobs: Arc<RwLock<HashMap<String, JobStatus>>>,
    counters: Arc<RwLock<JobCounters>>,
}

impl JobMonitor {
    /// Empty monitor.
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(RwLock::new(JobCounters::default())),
        }
    }

    /// Register a new job at round 1.
    pub async fn start_job(&self, job_id: &str) {
        let now = Utc::now();
        self.jobs.write().await.insert(
            job_id.to_string(),
            JobStatus {
                job_id: job_id.to_string(),
                phase: JobPhase::AwaitingGroundSpec,
                round: 1,
                started_at: now,
                updated_at: now,
            },
        );
        self.counters.write().await.started += 1;
    }

    /// Record a phase change.
    pub async fn transition(&self, job_id: &str, phase: JobPhase, round: u32) {
        let mut jobs = self.jobs.write().await;
        if let Some(status) = jobs.get_mut(job_id) {
            status.phase = phase;
            status.round = round;
            status.updated_at = Utc::now();
        }
    }

    /// Remove a job that emitted its completion.
    pub async fn finish_job(&self, job_id: &str, outcome: Outcome) {
        self.jobs.write().await.remove(job_id);
        let mut counters = self.counters.write().await;
        match outcome {
            Outcome::Converged => counters.converged += 1,
            Outcome::Exhausted => counters.exhausted += 1,
        }
    }

    /// Remove a job that stopped without completion; returns its last status.
    pub async fn abort_job(&self, job_id: &str) -> Option<JobStatus> {
        let removed = self.jobs.write().await.remove(job_id);
        if removed.is_some() {
            self.counters.write().await.aborted += 1;
        }
        removed
    }

    /// Get the status of a specific job.
    pub async fn get(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs.read().await.get(job_id).cloned()
    }

    /// Snapshot of all live jobs, oldest first.
    pub async fn snapshot(&self) -> Vec<JobStatus> {
        let mut jobs: Vec<JobStatus> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.started_at);
        jobs
    }

    /// Number of live jobs.
    pub async fn active_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Live jobs started at least `ttl` ago.
    pub async fn stale(&self, ttl: Duration) -> Vec<JobStatus> {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return Vec::new();
        };
        let now = Utc::now();
        self.snapshot()
            .await
            .into_iter()
            .filter(|j| now - j.started_at >= ttl)
            .collect()
    }

    /// Snapshot of the lifetime counters.
    pub async fn counters(&self) -> JobCounters {
        self.counters.read().await.clone()
    }

    /// Serialize the current state as JSON (for diagnostics).
    pub async fn to_json(&self) -> serde_json::Value {
        let jobs = self.snapshot().await;
        let counters = self.counters().await;
        serde_json::json!({
            "jobs": jobs,
            "counters": counters,
        })
    }
}

impl Default for JobMonitor {
    fn default() -> Self {
        Self::new()
    }
}
