//! In-memory outbox store for tests and local development.
//!
//! A single mutex guards the job table and the referent tables together, so
//! the enqueue helpers give the same all-or-nothing guarantee as the
//! transactional enqueue path in Postgres, and a claim is exclusive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use pdpsync_core::{
    ApplicationId, GrantDuration, Job, JobId, JobPayload, JobStatus, SchemaId,
    SelectedFieldRecord, StatusUpdate,
};

use super::store::{JobStore, JobStoreError, ReferentStore};

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    /// Schema ID -> SDL.
    schemas: HashMap<SchemaId, String>,
    /// Application ID -> granted fields.
    applications: HashMap<ApplicationId, Vec<SelectedFieldRecord>>,
}

#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    tables: Mutex<Tables>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a Schema row and its `create_policy_metadata` job atomically.
    pub fn create_schema_with_job(
        &self,
        schema_id: SchemaId,
        sdl: impl Into<String>,
    ) -> Result<Job, JobStoreError> {
        let sdl = sdl.into();
        let job = Job::new(JobPayload::create_policy_metadata(
            schema_id.clone(),
            sdl.clone(),
        ));

        let mut tables = self.lock();
        if tables.schemas.contains_key(&schema_id) {
            return Err(JobStoreError::Conflict(format!(
                "schema already exists: {schema_id}"
            )));
        }
        tables.schemas.insert(schema_id, sdl);
        tables.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    /// Create an Application row and its `update_allow_list` job atomically.
    pub fn create_application_with_job(
        &self,
        application_id: ApplicationId,
        selected_fields: Vec<SelectedFieldRecord>,
        grant_duration: GrantDuration,
    ) -> Result<Job, JobStoreError> {
        let job = Job::new(JobPayload::update_allow_list(
            application_id.clone(),
            selected_fields.clone(),
            grant_duration,
        ));

        let mut tables = self.lock();
        if tables.applications.contains_key(&application_id) {
            return Err(JobStoreError::Conflict(format!(
                "application already exists: {application_id}"
            )));
        }
        tables.applications.insert(application_id, selected_fields);
        tables.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    /// Insert a job row as-is (any status, any timestamps).
    pub fn insert_job(&self, job: Job) -> Result<(), JobStoreError> {
        let mut tables = self.lock();
        if tables.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        tables.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    pub fn insert_schema(&self, schema_id: SchemaId, sdl: impl Into<String>) {
        self.lock().schemas.insert(schema_id, sdl.into());
    }

    pub fn insert_application(
        &self,
        application_id: ApplicationId,
        selected_fields: Vec<SelectedFieldRecord>,
    ) {
        self.lock().applications.insert(application_id, selected_fields);
    }

    pub fn schema_exists(&self, schema_id: &SchemaId) -> bool {
        self.lock().schemas.contains_key(schema_id)
    }

    pub fn application_exists(&self, application_id: &ApplicationId) -> bool {
        self.lock().applications.contains_key(application_id)
    }

    /// Jobs currently in `status`, oldest first.
    pub fn jobs_with_status(&self, status: JobStatus) -> Vec<Job> {
        let tables = self.lock();
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        jobs
    }
}

#[async_trait]
impl JobStore for InMemoryOutboxStore {
    async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let now = Utc::now();
        let mut tables = self.lock();

        let mut candidates: Vec<(chrono::DateTime<Utc>, JobId)> = tables
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending)
            .map(|job| (job.created_at, job.id.clone()))
            .collect();
        candidates.sort();
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(job) = tables.jobs.get_mut(&id) {
                job.mark_processing(now)
                    .map_err(|e| JobStoreError::Conflict(e.to_string()))?;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn sweep_stuck(&self, threshold: Duration) -> Result<u64, JobStoreError> {
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| JobStoreError::Storage(format!("invalid sweep threshold: {e}")))?;
        let cutoff = now - threshold;

        let mut tables = self.lock();
        let mut released = 0;
        for job in tables.jobs.values_mut() {
            if job.status == JobStatus::Processing && job.updated_at < cutoff {
                job.mark_pending(now)
                    .map_err(|e| JobStoreError::Conflict(e.to_string()))?;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn update_status(
        &self,
        job_id: &JobId,
        update: &StatusUpdate,
    ) -> Result<(), JobStoreError> {
        let mut tables = self.lock();
        let job = tables
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| JobStoreError::NotFound(job_id.clone()))?;
        job.apply(update, Utc::now());
        Ok(())
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.lock().jobs.get(job_id).cloned())
    }
}

#[async_trait]
impl ReferentStore for InMemoryOutboxStore {
    async fn delete_schema(&self, schema_id: &SchemaId) -> Result<u64, JobStoreError> {
        Ok(u64::from(self.lock().schemas.remove(schema_id).is_some()))
    }
}
