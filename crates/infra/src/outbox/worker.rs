//! The PDP outbox worker.
//!
//! Each poll claims a batch of pending jobs and runs every job through a
//! one-shot saga:
//!
//! 1. call the PDP exactly once
//! 2. on failure, compensate the local side effect
//! 3. persist the terminal status in a separate, retried transaction
//!
//! Failed compensations and exhausted status updates raise critical alerts.
//!
//! ## Shutdown
//!
//! `shutdown` stops new claims at once. Jobs that are already claimed always
//! run to a terminal state; only the caller's wait for them is bounded.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use pdpsync_core::{Job, JobId, JobOutcome, JobPayload, JobStatus};

use super::alert::{AlertDetails, AlertNotifier, Alerter, Severity};
use super::compensator::Compensator;
use super::config::{ConfigError, WorkerConfig};
use super::pdp::{AllowListUpdateRequest, PdpClient};
use super::store::{JobStore, JobStoreError, ReferentStore};

/// Worker error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("timed out after {timeout:?} waiting for {in_flight} in-flight job(s)")]
    ShutdownTimeout { timeout: Duration, in_flight: usize },

    #[error("failed to update job status after {attempts} attempts: {source}")]
    StatusUpdate {
        job_id: JobId,
        attempts: u32,
        source: JobStoreError,
    },

    #[error("job {job_id} is not claimed (status: {status})")]
    NotClaimed { job_id: JobId, status: JobStatus },
}

/// Per-poll summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub completed: usize,
    pub compensated: usize,
    pub compensation_failed: usize,
    /// Jobs whose outcome could not be persisted.
    pub status_update_failures: usize,
    /// Stuck jobs returned to `pending` by this poll's sweep.
    pub swept: u64,
}

impl BatchReport {
    fn record(&mut self, result: &Result<ProcessedJob, WorkerError>) {
        match result {
            Ok(processed) => match processed.outcome.status() {
                JobStatus::Completed => self.completed += 1,
                JobStatus::Compensated => self.compensated += 1,
                _ => self.compensation_failed += 1,
            },
            Err(WorkerError::StatusUpdate { .. }) => self.status_update_failures += 1,
            Err(_) => {}
        }
    }
}

/// A job that reached a terminal state and had it persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedJob {
    pub job_id: JobId,
    pub outcome: JobOutcome,
}

#[derive(Debug, Default)]
struct StateInner {
    in_flight: usize,
    shutting_down: bool,
    polls_since_sweep: u32,
}

/// Process-local worker state: in-flight count, shutdown flag, sweep cadence.
///
/// Guarded by its own mutex, independent of any database lock.
#[derive(Debug, Default)]
pub struct WorkerState {
    inner: Mutex<StateInner>,
    idle: Notify,
}

impl WorkerState {
    fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Set the shutdown flag. Returns `true` for the first request only.
    fn request_shutdown(&self) -> bool {
        let mut inner = self.lock();
        !std::mem::replace(&mut inner.shutting_down, true)
    }

    /// Register a unit of work unless shutdown has been requested.
    fn begin(&self) -> Option<InFlightGuard<'_>> {
        let mut inner = self.lock();
        if inner.shutting_down {
            return None;
        }
        inner.in_flight += 1;
        Some(InFlightGuard { state: self })
    }

    /// Register a unit of work that must run regardless of shutdown.
    fn track(&self) -> InFlightGuard<'_> {
        self.lock().in_flight += 1;
        InFlightGuard { state: self }
    }

    /// Count a poll; `true` (and reset) when the sweep is due.
    fn sweep_due(&self, every: u32) -> bool {
        let mut inner = self.lock();
        inner.polls_since_sweep += 1;
        if inner.polls_since_sweep >= every {
            inner.polls_since_sweep = 0;
            true
        } else {
            false
        }
    }

    /// Resolve once no work is in flight.
    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct InFlightGuard<'a> {
    state: &'a WorkerState,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let idle = {
            let mut inner = self.state.lock();
            inner.in_flight = inner.in_flight.saturating_sub(1);
            inner.in_flight == 0
        };
        if idle {
            self.state.idle.notify_waiters();
        }
    }
}

/// Background worker draining the PDP job outbox.
pub struct PdpWorker<S> {
    store: Arc<S>,
    pdp: Arc<dyn PdpClient>,
    compensator: Compensator<Arc<S>>,
    alerts: Alerter,
    config: WorkerConfig,
    state: WorkerState,
    shutdown: CancellationToken,
}

impl<S> core::fmt::Debug for PdpWorker<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PdpWorker")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("alerts", &self.alerts)
            .finish_non_exhaustive()
    }
}

impl<S> PdpWorker<S>
where
    S: JobStore + ReferentStore + 'static,
{
    /// Create a worker. `alerts` may be `None`; alerts are then only logged.
    pub fn new(
        store: Arc<S>,
        pdp: Arc<dyn PdpClient>,
        alerts: Option<Arc<dyn AlertNotifier>>,
        config: WorkerConfig,
    ) -> Result<Self, ConfigError> {
        let config = config.normalized();
        config.validate()?;

        Ok(Self {
            compensator: Compensator::new(Arc::clone(&store)),
            store,
            pdp,
            alerts: Alerter::new(alerts),
            config,
            state: WorkerState::default(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    /// Run the poll loop until `ctx` is cancelled or [`shutdown`](Self::shutdown)
    /// is called, then wait for in-flight jobs before returning.
    pub async fn start(&self, ctx: CancellationToken) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "PDP worker started (one-shot mode)"
        );

        if let Err(err) = self.pdp.health_check().await {
            tracing::warn!(error = %err, "PDP health check failed, continuing");
        }

        let period = self.config.poll_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }

        tracing::info!(
            in_flight = self.state.in_flight(),
            "PDP worker stopping, waiting for in-flight jobs"
        );
        self.state.wait_idle().await;
        tracing::info!("PDP worker stopped");
    }

    /// Request a graceful stop and wait up to `timeout` for in-flight jobs.
    ///
    /// Idempotent. In-flight jobs are never cancelled; on timeout they keep
    /// running and an error is returned.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), WorkerError> {
        if self.state.request_shutdown() {
            tracing::info!("PDP worker shutdown requested");
            self.shutdown.cancel();
        }

        match tokio::time::timeout(timeout, self.state.wait_idle()).await {
            Ok(()) => {
                tracing::info!("PDP worker shutdown complete");
                Ok(())
            }
            Err(_) => {
                let in_flight = self.state.in_flight();
                tracing::warn!(in_flight, "PDP worker shutdown timed out, jobs still in flight");
                Err(WorkerError::ShutdownTimeout { timeout, in_flight })
            }
        }
    }

    /// One poll: sweep if due, claim a batch and process it in order.
    pub async fn poll_once(&self) -> BatchReport {
        let mut report = BatchReport::default();

        let Some(_batch) = self.state.begin() else {
            tracing::debug!("shutdown in progress, not claiming");
            return report;
        };

        if self.state.sweep_due(self.config.sweep_every_polls) {
            match self.sweep_stuck_jobs().await {
                Ok(swept) => report.swept = swept,
                Err(err) => tracing::warn!(error = %err, "failed to sweep stuck processing jobs"),
            }
        }

        if self.state.is_shutting_down() {
            tracing::debug!("shutdown requested during sweep, not claiming");
            return report;
        }

        let jobs = match self.store.claim_batch(self.config.batch_size).await {
            Ok(jobs) => jobs,
            Err(err) => {
                tracing::error!(error = %err, "failed to claim pending PDP jobs");
                return report;
            }
        };

        if jobs.is_empty() {
            return report;
        }
        report.claimed = jobs.len();
        tracing::debug!(count = jobs.len(), "processing PDP jobs");

        for job in jobs {
            let result = self.process_job(job).await;
            report.record(&result);
        }

        report
    }

    /// Return abandoned `processing` jobs to `pending`.
    pub async fn sweep_stuck_jobs(&self) -> Result<u64, JobStoreError> {
        let swept = self
            .store
            .sweep_stuck(self.config.stuck_job_threshold)
            .await?;
        if swept > 0 {
            tracing::info!(
                swept,
                threshold_secs = self.config.stuck_job_threshold.as_secs(),
                "returned stuck PDP jobs to pending"
            );
        }
        Ok(swept)
    }

    /// Run one claimed job through the saga and persist its outcome.
    pub async fn process_job(&self, job: Job) -> Result<ProcessedJob, WorkerError> {
        if job.status != JobStatus::Processing {
            return Err(WorkerError::NotClaimed {
                job_id: job.id,
                status: job.status,
            });
        }

        let _in_flight = self.state.track();

        let outcome = match self.call_pdp(&job).await {
            Ok(()) => {
                tracing::info!(job_id = %job.id, job_type = job.type_name(), "PDP job completed");
                JobOutcome::Completed
            }
            Err(remote_error) => {
                tracing::warn!(
                    job_id = %job.id,
                    job_type = job.type_name(),
                    error = %remote_error,
                    "PDP call failed, compensating"
                );
                self.compensate(&job, remote_error).await
            }
        };

        self.persist_outcome(&job, &outcome).await?;

        Ok(ProcessedJob {
            job_id: job.id,
            outcome,
        })
    }

    async fn call_pdp(&self, job: &Job) -> Result<(), String> {
        match &job.payload {
            JobPayload::CreatePolicyMetadata(payload) => self
                .pdp
                .create_policy_metadata(&payload.schema_id, &payload.sdl)
                .await
                .map(drop)
                .map_err(|e| e.to_string()),
            JobPayload::UpdateAllowList(payload) => self
                .pdp
                .update_allow_list(&AllowListUpdateRequest::from(payload))
                .await
                .map(drop)
                .map_err(|e| e.to_string()),
            JobPayload::Unrecognized(payload) => Err(payload.reason.clone()),
        }
    }

    async fn compensate(&self, job: &Job, remote_error: String) -> JobOutcome {
        match self.compensator.compensate(job).await {
            Ok(_) => {
                tracing::info!(job_id = %job.id, job_type = job.type_name(), "PDP job compensated");
                JobOutcome::Compensated { remote_error }
            }
            Err(err) => {
                let compensation_error = err.to_string();
                tracing::error!(
                    job_id = %job.id,
                    job_type = job.type_name(),
                    pdp_error = %remote_error,
                    compensation_error = %compensation_error,
                    "PDP job compensation failed"
                );

                let mut details = AlertDetails::new();
                details.insert("jobId".into(), job.id.as_str().into());
                details.insert("jobType".into(), job.type_name().into());
                details.insert("pdpError".into(), remote_error.as_str().into());
                details.insert("compensationError".into(), compensation_error.as_str().into());
                details.insert(
                    "schemaId".into(),
                    job.payload
                        .schema_id()
                        .map_or(Value::Null, |id| id.as_str().into()),
                );
                details.insert(
                    "applicationId".into(),
                    job.payload
                        .application_id()
                        .map_or(Value::Null, |id| id.as_str().into()),
                );
                self.alerts
                    .send(
                        Severity::Critical,
                        &format!("PDP job compensation failed for job {}", job.id),
                        details,
                    )
                    .await;

                JobOutcome::CompensationFailed {
                    remote_error,
                    compensation_error,
                }
            }
        }
    }

    async fn persist_outcome(&self, job: &Job, outcome: &JobOutcome) -> Result<(), WorkerError> {
        let update = outcome.to_update(Utc::now());
        let policy = self.config.status_update_retry;
        let mut attempt = 1;

        loop {
            match self.store.update_status(&job.id, &update).await {
                Ok(()) => return Ok(()),
                Err(err) if policy.should_retry(attempt) => {
                    let delay = policy.delay_for_attempt(attempt);
                    tracing::warn!(
                        job_id = %job.id,
                        status = %update.status,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "failed to update PDP job status, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    tracing::error!(
                        job_id = %job.id,
                        status = %update.status,
                        attempts = attempt,
                        error = %err,
                        "failed to update PDP job status"
                    );

                    let mut details = AlertDetails::new();
                    details.insert("jobId".into(), job.id.as_str().into());
                    details.insert("jobType".into(), job.type_name().into());
                    details.insert("intendedStatus".into(), update.status.as_str().into());
                    details.insert("error".into(), err.to_string().into());
                    self.alerts
                        .send(Severity::Critical, "Failed to update PDP job status", details)
                        .await;

                    return Err(WorkerError::StatusUpdate {
                        job_id: job.id.clone(),
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }
}
