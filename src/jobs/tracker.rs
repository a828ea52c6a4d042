use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::jobs::{JobRecord, JobStatus};
use crate::runtime::ArtifactPayload;
use crate::storage::{ArtifactMeta, ArtifactStore, ArtifactStoreError};
use crate::vendors::Integration;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Open(String),
    #[error("ledger write failed: {0}")]
    Write(String),
}

/// Durable mirror of the in-memory job map. Writes are best-effort: a
/// ledger failure is logged and never fails the job itself.
///
/// Snapshots are written concurrently and may arrive out of order, so
/// implementations must drop any snapshot older (by `updated_at`) than
/// the row they already hold.
pub trait JobLedger: Send + Sync {
    fn upsert(&self, record: &JobRecord) -> Result<(), LedgerError>;
}

pub type SharedJobLedger = Arc<dyn JobLedger>;

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("invalid status transition {from:?} -> {to:?}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error(transparent)]
    Artifact(#[from] ArtifactStoreError),
}

#[derive(Default)]
struct TrackerState {
    jobs: HashMap<String, JobRecord>,
    order: Vec<String>,
}

/// In-memory source of truth for job records.
///
/// All mutation goes through here so the status state machine is enforced
/// in one place; every change is mirrored to the ledger off the hot path.
pub struct JobTracker {
    state: Mutex<TrackerState>,
    artifacts: Arc<dyn ArtifactStore>,
    ledger: Option<SharedJobLedger>,
}

impl JobTracker {
    pub fn new(artifacts: Arc<dyn ArtifactStore>, ledger: Option<SharedJobLedger>) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            artifacts,
            ledger,
        }
    }

    pub fn create(&self, job_id: &str, integration: Integration) -> JobRecord {
        let record = JobRecord::new(job_id, integration);
        {
            let mut state = self.lock_state();
            state.jobs.insert(job_id.to_string(), record.clone());
            state.order.push(job_id.to_string());
        }
        self.mirror(&record);
        record
    }

    pub fn mark_processing(&self, job_id: &str) -> Result<(), JobStoreError> {
        self.transition(job_id, JobStatus::Processing, None)
    }

    pub fn mark_failed(&self, job_id: &str, message: &str) -> Result<(), JobStoreError> {
        self.transition(job_id, JobStatus::Failed, Some(message.to_string()))
    }

    pub fn mark_timeout(&self, job_id: &str, message: &str) -> Result<(), JobStoreError> {
        self.transition(job_id, JobStatus::Timeout, Some(message.to_string()))
    }

    /// Refreshes updated-at so observers can tell a slow job from a dead
    /// one. Called once per poll attempt.
    pub fn touch(&self, job_id: &str) -> Result<(), JobStoreError> {
        let record = {
            let mut state = self.lock_state();
            let record = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))?;
            record.updated_at = Utc::now();
            record.clone()
        };
        self.mirror(&record);
        Ok(())
    }

    /// Merges newly discovered artifacts into the job's result list.
    ///
    /// References are deduplicated by exact equality and keep discovery
    /// order; byte payloads are persisted to the artifact store first.
    /// The first append that leaves the list non-empty completes the job.
    /// Appends against an already failed or timed-out job are dropped.
    pub async fn append_results(
        &self,
        job_id: &str,
        payloads: Vec<ArtifactPayload>,
    ) -> Result<usize, JobStoreError> {
        let status = self
            .get(job_id)
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))?
            .status;
        if matches!(status, JobStatus::Failed | JobStatus::Timeout) {
            warn!(job_id, status = status.as_str(), "dropping late results for settled job");
            return Ok(0);
        }

        let mut references = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match payload {
                ArtifactPayload::Reference(url) => references.push(url),
                ArtifactPayload::Bytes {
                    key,
                    content_type,
                    bytes,
                } => {
                    let meta = ArtifactMeta {
                        job_id: job_id.to_string(),
                        file_name: key,
                        content_type,
                    };
                    let stored = self.artifacts.persist(&bytes, &meta).await?;
                    references.push(stored.url);
                }
            }
        }

        let (record, added) = {
            let mut state = self.lock_state();
            let record = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))?;
            let mut added = 0;
            for reference in references {
                if !record.results.contains(&reference) {
                    record.results.push(reference);
                    added += 1;
                }
            }
            if !record.results.is_empty() && record.status == JobStatus::Processing {
                record.status = JobStatus::Completed;
                record.error_message = None;
            }
            record.updated_at = Utc::now();
            (record.clone(), added)
        };
        self.mirror(&record);
        Ok(added)
    }

    pub fn get(&self, job_id: &str) -> Option<JobRecord> {
        self.lock_state().jobs.get(job_id).cloned()
    }

    /// Most recently created jobs first.
    pub fn list_recent(&self, limit: usize) -> Vec<JobRecord> {
        let state = self.lock_state();
        state
            .order
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect()
    }

    fn transition(
        &self,
        job_id: &str,
        to: JobStatus,
        error_message: Option<String>,
    ) -> Result<(), JobStoreError> {
        let record = {
            let mut state = self.lock_state();
            let record = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))?;
            if !record.status.can_transition_to(to) {
                return Err(JobStoreError::InvalidTransition {
                    from: record.status,
                    to,
                });
            }
            record.status = to;
            record.error_message = error_message;
            record.updated_at = Utc::now();
            record.clone()
        };
        self.mirror(&record);
        Ok(())
    }

    fn mirror(&self, record: &JobRecord) {
        let Some(ledger) = self.ledger.as_ref() else {
            return;
        };
        let ledger = Arc::clone(ledger);
        let record = record.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(err) = ledger.upsert(&record) {
                error!(job_id = record.job_id, error = %err, "job ledger upsert failed");
            }
        });
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                debug!("job tracker mutex poisoned; continuing with inner state");
                poisoned.into_inner()
            }
        }
    }
}
