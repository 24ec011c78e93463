//! Job Store — durable bookkeeping of jobs and incidents on sled.
//!
//! Three trees back the three tables: `jobs` (transient work tracking with
//! a monotonic status lifecycle), `incidents` (the durable business record)
//! and `dead_letters` (envelopes whose delivery exhausted its retries).
//! Keeping them separate lets the pipeline retry and resume work without
//! corrupting an incident's accumulated `full_data`. One store is shared by
//! every stage in a process, so a job opened at triage is the same record
//! the dispatcher completes.
//!
//! Status updates run inside a sled tree transaction so a partially applied
//! read-modify-write can never be observed: the update either commits
//! whole or rolls back.

use crate::envelope::Envelope;
use crate::types::{IncidentRecord, Job, JobStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sled::transaction::ConflictableTransactionError;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const JOBS_TREE: &str = "jobs";
const INCIDENTS_TREE: &str = "incidents";
const DEAD_LETTERS_TREE: &str = "dead_letters";

/// Default database file name under the stage data directory.
pub const DEFAULT_DB_NAME: &str = "fleet.db";

/// Persistence errors. Surfaced as 5xx to callers; never partially applied.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("job not found: {0}")]
    NotFound(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Filter for [`JobStore::query_jobs`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub incident_id: Option<String>,
}

/// An envelope that exhausted its delivery retries, kept for replay or
/// inspection instead of being silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: String,
    pub source_stage: String,
    pub downstream: String,
    pub error: String,
    pub envelope: Envelope,
    pub recorded_at: DateTime<Utc>,
}

/// Durable job/incident store shared across request handlers.
#[derive(Clone)]
pub struct JobStore {
    jobs: sled::Tree,
    incidents: sled::Tree,
    dead_letters: sled::Tree,
    _db: Arc<sled::Db>,
}

impl JobStore {
    /// Open or create the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let jobs = db.open_tree(JOBS_TREE)?;
        let incidents = db.open_tree(INCIDENTS_TREE)?;
        let dead_letters = db.open_tree(DEAD_LETTERS_TREE)?;
        info!(
            jobs = jobs.len(),
            incidents = incidents.len(),
            dead_letters = dead_letters.len(),
            "job store opened"
        );
        Ok(Self {
            jobs,
            incidents,
            dead_letters,
            _db: Arc::new(db),
        })
    }

    /// Create a new PENDING job for an incident. Returns the stored job.
    pub fn create_job(&self, incident_id: &str) -> Result<Job, StoreError> {
        let now = Utc::now();
        let job = Job {
            job_id: Uuid::new_v4().to_string(),
            incident_id: incident_id.to_string(),
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            result: None,
        };
        self.jobs
            .insert(job.job_id.as_bytes(), serde_json::to_vec(&job)?)?;
        debug!(job_id = %job.job_id, incident_id, "job created");
        Ok(job)
    }

    /// Update a job's status, enforcing the monotonic lifecycle.
    ///
    /// A job already in a terminal state, or an update that would regress
    /// the lifecycle rank, is left untouched and reported as success —
    /// retried forwarding calls may legitimately re-deliver a stale update,
    /// and that redelivery must stay harmless. Returns the stored job after
    /// the update.
    pub fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        result: Option<Value>,
    ) -> Result<Job, StoreError> {
        let updated = self.jobs.transaction(|tx| {
            let raw = tx
                .get(job_id.as_bytes())?
                .ok_or_else(|| ConflictableTransactionError::Abort(StoreError::NotFound(job_id.to_string())))?;
            let mut job: Job = serde_json::from_slice(&raw).map_err(|e| {
                ConflictableTransactionError::Abort(StoreError::Serialization(e.to_string()))
            })?;

            // Idempotent no-op for terminal jobs and rank regressions.
            if job.status.is_terminal() || status.rank() < job.status.rank() {
                return Ok(job);
            }

            job.status = status;
            job.updated_at = Utc::now();
            if status.is_terminal() {
                job.result = result.clone();
            }

            let bytes = serde_json::to_vec(&job).map_err(|e| {
                ConflictableTransactionError::Abort(StoreError::Serialization(e.to_string()))
            })?;
            tx.insert(job_id.as_bytes(), bytes)?;
            Ok(job)
        });

        match updated {
            Ok(job) => {
                debug!(job_id, status = %job.status, "job status updated");
                Ok(job)
            }
            Err(sled::transaction::TransactionError::Abort(e)) => Err(e),
            Err(sled::transaction::TransactionError::Storage(e)) => Err(e.into()),
        }
    }

    /// Fetch the job with `job_id`, creating a PENDING record if none
    /// exists yet.
    ///
    /// A stage running against its own database may receive a `job_id`
    /// minted by an upstream stage's store; adopting the job under the same
    /// id keeps the lifecycle trackable wherever the update lands.
    pub fn ensure_job(&self, job_id: &str, incident_id: &str) -> Result<Job, StoreError> {
        if let Some(raw) = self.jobs.get(job_id.as_bytes())? {
            return Ok(serde_json::from_slice(&raw)?);
        }
        let now = Utc::now();
        let job = Job {
            job_id: job_id.to_string(),
            incident_id: incident_id.to_string(),
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            result: None,
        };
        self.jobs
            .insert(job.job_id.as_bytes(), serde_json::to_vec(&job)?)?;
        debug!(job_id, incident_id, "job adopted");
        Ok(job)
    }

    /// Fetch one job by id.
    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        match self.jobs.get(job_id.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// List jobs matching a filter, up to `limit`.
    pub fn query_jobs(&self, filter: &JobFilter, limit: usize) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::new();
        for item in self.jobs.iter() {
            let (_, raw) = item?;
            let job: Job = serde_json::from_slice(&raw)?;
            if let Some(status) = filter.status {
                if job.status != status {
                    continue;
                }
            }
            if let Some(ref incident_id) = filter.incident_id {
                if &job.incident_id != incident_id {
                    continue;
                }
            }
            jobs.push(job);
            if jobs.len() >= limit {
                break;
            }
        }
        Ok(jobs)
    }

    /// Insert-or-replace an incident by `incident_id`.
    ///
    /// `created_at` of an existing row is preserved; `updated_at` is always
    /// refreshed.
    pub fn upsert_incident(&self, mut incident: IncidentRecord) -> Result<(), StoreError> {
        if let Some(raw) = self.incidents.get(incident.incident_id.as_bytes())? {
            let existing: IncidentRecord = serde_json::from_slice(&raw)?;
            incident.created_at = existing.created_at;
        }
        incident.updated_at = Utc::now();
        self.incidents.insert(
            incident.incident_id.as_bytes(),
            serde_json::to_vec(&incident)?,
        )?;
        debug!(incident_id = %incident.incident_id, "incident upserted");
        Ok(())
    }

    /// Fetch one incident by id.
    pub fn get_incident(&self, incident_id: &str) -> Result<Option<IncidentRecord>, StoreError> {
        match self.incidents.get(incident_id.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// List incidents sorted by `priority_score` descending.
    pub fn list_incidents(&self, limit: usize) -> Result<Vec<IncidentRecord>, StoreError> {
        let mut incidents = Vec::new();
        for item in self.incidents.iter() {
            let (_, raw) = item?;
            incidents.push(serde_json::from_slice::<IncidentRecord>(&raw)?);
        }
        incidents.sort_by(|a, b| {
            b.priority_score
                .partial_cmp(&a.priority_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        incidents.truncate(limit);
        Ok(incidents)
    }

    /// Record an envelope whose delivery exhausted its retries.
    pub fn record_dead_letter(
        &self,
        envelope: &Envelope,
        downstream: &str,
        error: &str,
    ) -> Result<DeadLetter, StoreError> {
        let letter = DeadLetter {
            id: Uuid::new_v4().to_string(),
            source_stage: envelope.source_stage.clone(),
            downstream: downstream.to_string(),
            error: error.to_string(),
            envelope: envelope.clone(),
            recorded_at: Utc::now(),
        };
        self.dead_letters
            .insert(letter.id.as_bytes(), serde_json::to_vec(&letter)?)?;
        debug!(
            dead_letter_id = %letter.id,
            source_stage = %letter.source_stage,
            "undeliverable envelope recorded"
        );
        Ok(letter)
    }

    /// List dead letters, most recent first.
    pub fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, StoreError> {
        let mut letters = Vec::new();
        for item in self.dead_letters.iter() {
            let (_, raw) = item?;
            letters.push(serde_json::from_slice::<DeadLetter>(&raw)?);
        }
        letters.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        letters.truncate(limit);
        Ok(letters)
    }
}
