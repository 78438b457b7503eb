//! Worker behaviour against the in-memory outbox store.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use proptest::prelude::*;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use pdpsync_core::{
    ApplicationId, GrantDuration, Job, JobId, JobOutcome, JobPayload, JobStatus, PayloadColumns,
    SchemaId, SelectedFieldRecord, StatusUpdate,
};
use pdpsync_infra::outbox::{
    AlertDetails, AlertError, AlertNotifier, AllowListUpdateRequest, AllowListUpdateResponse,
    BatchReport, InMemoryOutboxStore, JobStore, JobStoreError, PdpClient, PdpError, PdpWorker,
    PolicyMetadataCreateResponse, ReferentStore, RetryPolicy, Severity, WorkerConfig,
    WorkerError,
};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakePdp {
    /// Fail every call with this message.
    fail_all: Option<String>,
    /// Fail only create calls for these schemas.
    failing_schemas: HashSet<SchemaId>,
    /// Each call sleeps this long before answering.
    latency: Duration,
    healthy: bool,
    entered: Notify,
    create_calls: Mutex<Vec<SchemaId>>,
    allow_list_calls: Mutex<Vec<AllowListUpdateRequest>>,
}

impl FakePdp {
    fn ok() -> Self {
        Self {
            healthy: true,
            ..Self::default()
        }
    }

    fn failing(message: &str) -> Self {
        Self {
            fail_all: Some(message.to_string()),
            ..Self::ok()
        }
    }

    fn failing_for(schema: &str) -> Self {
        Self {
            failing_schemas: HashSet::from([SchemaId::from_raw(schema)]),
            ..Self::ok()
        }
    }

    fn slow(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::ok()
        }
    }

    fn create_calls(&self) -> Vec<SchemaId> {
        self.create_calls.lock().unwrap().clone()
    }

    fn total_calls(&self) -> usize {
        self.create_calls.lock().unwrap().len() + self.allow_list_calls.lock().unwrap().len()
    }

    async fn respond(&self) -> Result<(), PdpError> {
        self.entered.notify_one();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match &self.fail_all {
            Some(message) => Err(PdpError::Request(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PdpClient for FakePdp {
    async fn create_policy_metadata(
        &self,
        schema_id: &SchemaId,
        _sdl: &str,
    ) -> Result<PolicyMetadataCreateResponse, PdpError> {
        self.create_calls.lock().unwrap().push(schema_id.clone());
        self.respond().await?;
        if self.failing_schemas.contains(schema_id) {
            return Err(PdpError::Status {
                status: 500,
                body: "internal error".into(),
            });
        }
        Ok(PolicyMetadataCreateResponse::default())
    }

    async fn update_allow_list(
        &self,
        request: &AllowListUpdateRequest,
    ) -> Result<AllowListUpdateResponse, PdpError> {
        self.allow_list_calls.lock().unwrap().push(request.clone());
        self.respond().await?;
        Ok(AllowListUpdateResponse::default())
    }

    async fn health_check(&self) -> Result<(), PdpError> {
        if self.healthy {
            Ok(())
        } else {
            Err(PdpError::Timeout)
        }
    }
}

#[derive(Default)]
struct RecordingAlerts {
    sent: Mutex<Vec<(Severity, String, AlertDetails)>>,
}

impl RecordingAlerts {
    fn sent(&self) -> Vec<(Severity, String, AlertDetails)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertNotifier for RecordingAlerts {
    async fn send_alert(
        &self,
        severity: Severity,
        message: &str,
        details: &AlertDetails,
    ) -> Result<(), AlertError> {
        self.sent
            .lock()
            .unwrap()
            .push((severity, message.to_string(), details.clone()));
        Ok(())
    }
}

/// Store whose first `failures` status updates fail.
struct FlakyStore {
    inner: Arc<InMemoryOutboxStore>,
    failures: Mutex<u32>,
    update_attempts: Mutex<u32>,
}

impl FlakyStore {
    fn new(inner: Arc<InMemoryOutboxStore>, failures: u32) -> Self {
        Self {
            inner,
            failures: Mutex::new(failures),
            update_attempts: Mutex::new(0),
        }
    }

    fn update_attempts(&self) -> u32 {
        *self.update_attempts.lock().unwrap()
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.inner.claim_batch(limit).await
    }

    async fn sweep_stuck(&self, threshold: Duration) -> Result<u64, JobStoreError> {
        self.inner.sweep_stuck(threshold).await
    }

    async fn update_status(
        &self,
        job_id: &JobId,
        update: &StatusUpdate,
    ) -> Result<(), JobStoreError> {
        *self.update_attempts.lock().unwrap() += 1;
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(JobStoreError::Unavailable("connection reset".into()));
            }
        }
        self.inner.update_status(job_id, update).await
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError> {
        self.inner.get(job_id).await
    }
}

#[async_trait]
impl ReferentStore for FlakyStore {
    async fn delete_schema(&self, schema_id: &SchemaId) -> Result<u64, JobStoreError> {
        self.inner.delete_schema(schema_id).await
    }
}

/// Store whose sweep blocks until released.
struct GatedSweepStore {
    inner: Arc<InMemoryOutboxStore>,
    sweep_entered: Notify,
    release_sweep: Notify,
}

impl GatedSweepStore {
    fn new(inner: Arc<InMemoryOutboxStore>) -> Self {
        Self {
            inner,
            sweep_entered: Notify::new(),
            release_sweep: Notify::new(),
        }
    }
}

#[async_trait]
impl JobStore for GatedSweepStore {
    async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.inner.claim_batch(limit).await
    }

    async fn sweep_stuck(&self, threshold: Duration) -> Result<u64, JobStoreError> {
        self.sweep_entered.notify_one();
        self.release_sweep.notified().await;
        self.inner.sweep_stuck(threshold).await
    }

    async fn update_status(
        &self,
        job_id: &JobId,
        update: &StatusUpdate,
    ) -> Result<(), JobStoreError> {
        self.inner.update_status(job_id, update).await
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError> {
        self.inner.get(job_id).await
    }
}

#[async_trait]
impl ReferentStore for GatedSweepStore {
    async fn delete_schema(&self, schema_id: &SchemaId) -> Result<u64, JobStoreError> {
        self.inner.delete_schema(schema_id).await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fast_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_status_update_retry(RetryPolicy::new(3, Duration::from_millis(1)))
}

fn worker<S>(
    store: Arc<S>,
    pdp: Arc<FakePdp>,
    alerts: Option<Arc<RecordingAlerts>>,
    config: WorkerConfig,
) -> PdpWorker<S>
where
    S: JobStore + ReferentStore + 'static,
{
    pdpsync_observability::init_for_tests();
    let alerts = alerts.map(|a| a as Arc<dyn AlertNotifier>);
    PdpWorker::new(store, pdp, alerts, config).expect("valid config")
}

fn schema(id: &str) -> SchemaId {
    SchemaId::from_raw(id)
}

async fn job(store: &InMemoryOutboxStore, id: &JobId) -> Job {
    store.get(id).await.unwrap().expect("job exists")
}

// ---------------------------------------------------------------------------
// Saga outcomes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_call_completes_job_and_keeps_schema() {
    let store = InMemoryOutboxStore::arc();
    let pdp = Arc::new(FakePdp::ok());
    let alerts = Arc::new(RecordingAlerts::default());
    let enqueued = store
        .create_schema_with_job(schema("schema_1"), "type Person { name: String }")
        .unwrap();
    let worker = worker(store.clone(), pdp.clone(), Some(alerts.clone()), fast_config());

    let report = worker.poll_once().await;

    assert_eq!(report.claimed, 1);
    assert_eq!(report.completed, 1);
    let done = job(&store, &enqueued.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.error, None);
    assert!(done.processed_at.is_some());
    assert!(store.schema_exists(&schema("schema_1")));
    assert_eq!(pdp.create_calls(), vec![schema("schema_1")]);
    assert!(alerts.sent().is_empty());
}

#[tokio::test]
async fn failed_call_is_compensated_by_deleting_schema() {
    let store = InMemoryOutboxStore::arc();
    let pdp = Arc::new(FakePdp::failing("PDP unavailable"));
    let alerts = Arc::new(RecordingAlerts::default());
    let enqueued = store.create_schema_with_job(schema("schema_1"), "sdl").unwrap();
    let worker = worker(store.clone(), pdp.clone(), Some(alerts.clone()), fast_config());

    let report = worker.poll_once().await;

    assert_eq!(report.compensated, 1);
    let done = job(&store, &enqueued.id).await;
    assert_eq!(done.status, JobStatus::Compensated);
    assert!(done.error.as_deref().unwrap().contains("PDP unavailable"));
    assert!(done.processed_at.is_some());
    assert!(!store.schema_exists(&schema("schema_1")));
    assert!(alerts.sent().is_empty());
}

#[tokio::test]
async fn missing_schema_fails_compensation_and_alerts_once() {
    let store = InMemoryOutboxStore::arc();
    let pdp = Arc::new(FakePdp::failing("PDP unavailable"));
    let alerts = Arc::new(RecordingAlerts::default());
    let orphan = Job::new(JobPayload::create_policy_metadata(schema("schema_gone"), "sdl"));
    store.insert_job(orphan.clone()).unwrap();
    let worker = worker(store.clone(), pdp, Some(alerts.clone()), fast_config());

    let report = worker.poll_once().await;

    assert_eq!(report.compensation_failed, 1);
    let done = job(&store, &orphan.id).await;
    assert_eq!(done.status, JobStatus::CompensationFailed);
    let error = done.error.unwrap();
    assert!(error.contains("PDP unavailable"));
    assert!(error.contains("schema not found for compensation: schema_gone"));

    let sent = alerts.sent();
    assert_eq!(sent.len(), 1);
    let (severity, message, details) = &sent[0];
    assert_eq!(*severity, Severity::Critical);
    assert_eq!(
        message,
        &format!("PDP job compensation failed for job {}", orphan.id)
    );
    assert_eq!(details["jobId"], orphan.id.as_str());
    assert_eq!(details["jobType"], "create_policy_metadata");
    assert_eq!(details["schemaId"], "schema_gone");
    assert!(details["pdpError"].as_str().unwrap().contains("PDP unavailable"));
}

#[tokio::test]
async fn failed_allow_list_update_keeps_application() {
    let store = InMemoryOutboxStore::arc();
    let pdp = Arc::new(FakePdp::failing("grant rejected"));
    let app = ApplicationId::from_raw("app_1");
    let enqueued = store
        .create_application_with_job(
            app.clone(),
            vec![SelectedFieldRecord {
                field_name: "person.name".into(),
                schema_id: "schema_1".into(),
            }],
            GrantDuration::OneYear,
        )
        .unwrap();
    let worker = worker(store.clone(), pdp.clone(), None, fast_config());

    worker.poll_once().await;

    let done = job(&store, &enqueued.id).await;
    assert_eq!(done.status, JobStatus::Compensated);
    assert_eq!(done.error.as_deref(), Some("PDP request failed: grant rejected"));
    assert!(store.application_exists(&app));

    let calls = pdp.allow_list_calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].application_id, "app_1");
    assert_eq!(calls[0].grant_duration, GrantDuration::OneYear);
}

#[tokio::test]
async fn compensation_only_touches_the_failing_jobs_schema() {
    let store = InMemoryOutboxStore::arc();
    let pdp = Arc::new(FakePdp::failing_for("schema_x"));
    let job_x = store.create_schema_with_job(schema("schema_x"), "sdl").unwrap();
    let job_y = store.create_schema_with_job(schema("schema_y"), "sdl").unwrap();
    let worker = worker(store.clone(), pdp, None, fast_config());

    let report = worker.poll_once().await;

    assert_eq!(report.completed, 1);
    assert_eq!(report.compensated, 1);
    assert_eq!(job(&store, &job_x.id).await.status, JobStatus::Compensated);
    assert_eq!(job(&store, &job_y.id).await.status, JobStatus::Completed);
    assert!(!store.schema_exists(&schema("schema_x")));
    assert!(store.schema_exists(&schema("schema_y")));
}

#[tokio::test]
async fn unknown_job_type_is_never_silently_dropped() {
    let store = InMemoryOutboxStore::arc();
    let pdp = Arc::new(FakePdp::ok());
    let alerts = Arc::new(RecordingAlerts::default());
    let unknown = Job::new(JobPayload::from_columns(PayloadColumns {
        job_type: "rotate_keys".into(),
        ..PayloadColumns::default()
    }));
    store.insert_job(unknown.clone()).unwrap();
    let worker = worker(store.clone(), pdp.clone(), Some(alerts.clone()), fast_config());

    let report = worker.poll_once().await;

    assert_eq!(report.compensation_failed, 1);
    let done = job(&store, &unknown.id).await;
    assert_eq!(done.status, JobStatus::CompensationFailed);
    let error = done.error.unwrap();
    assert!(error.contains("unknown job type: rotate_keys"));
    assert!(error.contains("unknown job type for compensation: rotate_keys"));
    assert_eq!(pdp.total_calls(), 0);
    assert_eq!(alerts.sent().len(), 1);
    assert_eq!(alerts.sent()[0].2["jobType"], "rotate_keys");
}

#[tokio::test]
async fn compensation_failure_without_notifier_still_terminates() {
    let store = InMemoryOutboxStore::arc();
    let pdp = Arc::new(FakePdp::failing("PDP unavailable"));
    let orphan = Job::new(JobPayload::create_policy_metadata(schema("schema_gone"), "sdl"));
    store.insert_job(orphan.clone()).unwrap();
    let worker = worker(store.clone(), pdp, None, fast_config());

    let report = worker.poll_once().await;

    assert_eq!(report.compensation_failed, 1);
    assert_eq!(
        job(&store, &orphan.id).await.status,
        JobStatus::CompensationFailed
    );
}

#[tokio::test]
async fn one_failing_job_does_not_affect_the_rest_of_the_batch() {
    let store = InMemoryOutboxStore::arc();
    let pdp = Arc::new(FakePdp::failing_for("schema_2"));
    let base = Utc::now() - chrono::Duration::minutes(1);
    let ids: Vec<JobId> = (1..=3)
        .map(|n| {
            let id = schema(&format!("schema_{n}"));
            if n != 2 {
                store.insert_schema(id.clone(), "sdl");
            }
            let job = Job::new(JobPayload::create_policy_metadata(id, "sdl"))
                .created_at(base + chrono::Duration::seconds(n));
            store.insert_job(job.clone()).unwrap();
            job.id
        })
        .collect();
    let worker = worker(store.clone(), pdp.clone(), None, fast_config());

    let report = worker.poll_once().await;

    assert_eq!(
        report,
        BatchReport {
            claimed: 3,
            completed: 2,
            compensation_failed: 1,
            ..BatchReport::default()
        }
    );
    assert_eq!(job(&store, &ids[0]).await.status, JobStatus::Completed);
    assert_eq!(job(&store, &ids[1]).await.status, JobStatus::CompensationFailed);
    assert_eq!(job(&store, &ids[2]).await.status, JobStatus::Completed);
    assert_eq!(
        pdp.create_calls(),
        vec![schema("schema_1"), schema("schema_2"), schema("schema_3")]
    );
}

#[tokio::test]
async fn terminal_jobs_are_not_reprocessed() {
    let store = InMemoryOutboxStore::arc();
    let pdp = Arc::new(FakePdp::ok());
    store.create_schema_with_job(schema("schema_1"), "sdl").unwrap();
    let worker = worker(store.clone(), pdp.clone(), None, fast_config());

    worker.poll_once().await;
    let second = worker.poll_once().await;

    assert_eq!(second.claimed, 0);
    assert_eq!(pdp.total_calls(), 1);
}

#[tokio::test]
async fn process_job_rejects_unclaimed_jobs() {
    let store = InMemoryOutboxStore::arc();
    let pdp = Arc::new(FakePdp::ok());
    let pending = store.create_schema_with_job(schema("schema_1"), "sdl").unwrap();
    let worker = worker(store.clone(), pdp.clone(), None, fast_config());

    let err = worker.process_job(pending.clone()).await.unwrap_err();

    assert_eq!(
        err,
        WorkerError::NotClaimed {
            job_id: pending.id,
            status: JobStatus::Pending
        }
    );
    assert_eq!(pdp.total_calls(), 0);
}

// ---------------------------------------------------------------------------
// Status-update retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_update_succeeds_after_transient_failures() {
    let inner = InMemoryOutboxStore::arc();
    let enqueued = inner.create_schema_with_job(schema("schema_1"), "sdl").unwrap();
    let store = Arc::new(FlakyStore::new(inner.clone(), 2));
    let alerts = Arc::new(RecordingAlerts::default());
    let worker = worker(store.clone(), Arc::new(FakePdp::ok()), Some(alerts.clone()), fast_config());

    let report = worker.poll_once().await;

    assert_eq!(report.completed, 1);
    assert_eq!(report.status_update_failures, 0);
    assert_eq!(store.update_attempts(), 3);
    assert_eq!(job(&inner, &enqueued.id).await.status, JobStatus::Completed);
    assert!(alerts.sent().is_empty());
}

#[tokio::test]
async fn exhausted_status_update_is_alerted_and_reported() {
    let inner = InMemoryOutboxStore::arc();
    let enqueued = inner.create_schema_with_job(schema("schema_1"), "sdl").unwrap();
    let store = Arc::new(FlakyStore::new(inner.clone(), u32::MAX));
    let alerts = Arc::new(RecordingAlerts::default());
    let worker = worker(store.clone(), Arc::new(FakePdp::ok()), Some(alerts.clone()), fast_config());

    let claimed = store.claim_batch(1).await.unwrap().remove(0);
    let err = worker.process_job(claimed).await.unwrap_err();

    assert!(matches!(
        err,
        WorkerError::StatusUpdate { attempts: 3, .. }
    ));
    assert!(
        err.to_string()
            .starts_with("failed to update job status after 3 attempts")
    );
    assert_eq!(store.update_attempts(), 3);

    let sent = alerts.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, Severity::Critical);
    assert_eq!(sent[0].1, "Failed to update PDP job status");
    assert_eq!(sent[0].2["jobId"], enqueued.id.as_str());
    assert_eq!(sent[0].2["intendedStatus"], "completed");

    // Left for the sweep to pick up.
    assert_eq!(job(&inner, &enqueued.id).await.status, JobStatus::Processing);
}

// ---------------------------------------------------------------------------
// Stuck-job recovery
// ---------------------------------------------------------------------------

fn stuck_job(store: &InMemoryOutboxStore, id: &str, minutes_ago: i64) -> Job {
    let at = Utc::now() - chrono::Duration::minutes(minutes_ago);
    let mut job = Job::new(JobPayload::create_policy_metadata(schema(id), "sdl")).created_at(at);
    job.mark_processing(at).unwrap();
    store.insert_schema(schema(id), "sdl");
    store.insert_job(job.clone()).unwrap();
    job
}

#[tokio::test]
async fn stuck_job_is_swept_and_then_processed() {
    let store = InMemoryOutboxStore::arc();
    let stuck = stuck_job(&store, "schema_1", 10);
    let worker = worker(
        store.clone(),
        Arc::new(FakePdp::ok()),
        None,
        fast_config().with_sweep_every_polls(1),
    );

    let report = worker.poll_once().await;

    assert_eq!(report.swept, 1);
    assert_eq!(report.completed, 1);
    assert_eq!(job(&store, &stuck.id).await.status, JobStatus::Completed);
}

#[tokio::test]
async fn sweep_runs_on_every_nth_poll_only() {
    let store = InMemoryOutboxStore::arc();
    let stuck = stuck_job(&store, "schema_1", 10);
    let worker = worker(
        store.clone(),
        Arc::new(FakePdp::ok()),
        None,
        fast_config().with_sweep_every_polls(3),
    );

    let swept: Vec<u64> = {
        let mut swept = Vec::new();
        for _ in 0..3 {
            swept.push(worker.poll_once().await.swept);
        }
        swept
    };

    assert_eq!(swept, vec![0, 0, 1]);
    assert_eq!(job(&store, &stuck.id).await.status, JobStatus::Completed);
}

#[tokio::test]
async fn recently_claimed_jobs_are_not_swept() {
    let store = InMemoryOutboxStore::arc();
    let fresh = stuck_job(&store, "schema_1", 1);
    let worker = worker(
        store.clone(),
        Arc::new(FakePdp::ok()),
        None,
        fast_config().with_sweep_every_polls(1),
    );

    let report = worker.poll_once().await;

    assert_eq!(report.swept, 0);
    assert_eq!(job(&store, &fresh.id).await.status, JobStatus::Processing);
}

// ---------------------------------------------------------------------------
// Loop and shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_processes_jobs_until_context_is_cancelled() {
    let store = InMemoryOutboxStore::arc();
    let enqueued = store.create_schema_with_job(schema("schema_1"), "sdl").unwrap();
    let pdp = Arc::new(FakePdp {
        healthy: false,
        ..FakePdp::ok()
    });
    let worker = Arc::new(worker(store.clone(), pdp.clone(), None, fast_config()));
    let ctx = CancellationToken::new();

    let handle = {
        let worker = Arc::clone(&worker);
        let ctx = ctx.clone();
        tokio::spawn(async move { worker.start(ctx).await })
    };

    tokio::time::timeout(Duration::from_secs(2), pdp.entered.notified())
        .await
        .expect("job dispatched despite failing health check");
    ctx.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("start returns after cancellation")
        .unwrap();

    assert_eq!(job(&store, &enqueued.id).await.status, JobStatus::Completed);
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_job() {
    let store = InMemoryOutboxStore::arc();
    let enqueued = store.create_schema_with_job(schema("schema_1"), "sdl").unwrap();
    let pdp = Arc::new(FakePdp::slow(Duration::from_millis(200)));
    let worker = Arc::new(worker(store.clone(), pdp.clone(), None, fast_config()));

    let handle = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.start(CancellationToken::new()).await })
    };
    tokio::time::timeout(Duration::from_secs(2), pdp.entered.notified())
        .await
        .expect("job dispatched");

    worker.shutdown(Duration::from_secs(2)).await.unwrap();

    assert_eq!(worker.state().in_flight(), 0);
    assert_eq!(job(&store, &enqueued.id).await.status, JobStatus::Completed);
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("start returns after shutdown")
        .unwrap();
}

#[tokio::test]
async fn shutdown_times_out_without_cancelling_the_job() {
    let store = InMemoryOutboxStore::arc();
    let enqueued = store.create_schema_with_job(schema("schema_1"), "sdl").unwrap();
    let pdp = Arc::new(FakePdp::slow(Duration::from_millis(300)));
    let worker = Arc::new(worker(store.clone(), pdp.clone(), None, fast_config()));

    let handle = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.start(CancellationToken::new()).await })
    };
    tokio::time::timeout(Duration::from_secs(2), pdp.entered.notified())
        .await
        .expect("job dispatched");

    let err = worker.shutdown(Duration::from_millis(20)).await.unwrap_err();
    assert!(matches!(err, WorkerError::ShutdownTimeout { in_flight, .. } if in_flight > 0));

    // A second call is allowed and waits for the same job.
    worker.shutdown(Duration::from_secs(2)).await.unwrap();
    assert_eq!(job(&store, &enqueued.id).await.status, JobStatus::Completed);
    handle.await.unwrap();
}

#[tokio::test]
async fn no_new_batch_is_claimed_after_shutdown() {
    let store = InMemoryOutboxStore::arc();
    let worker = worker(store.clone(), Arc::new(FakePdp::ok()), None, fast_config());
    worker.shutdown(Duration::from_millis(50)).await.unwrap();

    let enqueued = store.create_schema_with_job(schema("schema_1"), "sdl").unwrap();
    let report = worker.poll_once().await;

    assert_eq!(report, BatchReport::default());
    assert_eq!(job(&store, &enqueued.id).await.status, JobStatus::Pending);
}

#[tokio::test]
async fn shutdown_during_sweep_prevents_the_claim() {
    let inner = InMemoryOutboxStore::arc();
    let enqueued = inner.create_schema_with_job(schema("schema_1"), "sdl").unwrap();
    let store = Arc::new(GatedSweepStore::new(inner.clone()));
    let worker = Arc::new(worker(
        store.clone(),
        Arc::new(FakePdp::ok()),
        None,
        fast_config().with_sweep_every_polls(1),
    ));

    let poll = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.poll_once().await })
    };
    tokio::time::timeout(Duration::from_secs(2), store.sweep_entered.notified())
        .await
        .expect("sweep started");

    // The poll itself is in flight, so the first wait cannot finish yet.
    let err = worker.shutdown(Duration::from_millis(20)).await.unwrap_err();
    assert!(matches!(err, WorkerError::ShutdownTimeout { .. }));
    assert!(worker.state().is_shutting_down());

    store.release_sweep.notify_one();
    let report = poll.await.unwrap();

    assert_eq!(report.claimed, 0);
    assert_eq!(job(&inner, &enqueued.id).await.status, JobStatus::Pending);
    worker.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let result = PdpWorker::new(
        InMemoryOutboxStore::arc(),
        Arc::new(FakePdp::ok()),
        None,
        WorkerConfig::default().with_batch_size(0),
    );
    assert!(result.is_err());
}

#[test]
fn outcome_error_text_matches_persisted_format() {
    let outcome = JobOutcome::CompensationFailed {
        remote_error: "a".into(),
        compensation_error: "b".into(),
    };
    assert_eq!(
        outcome.error_text().as_deref(),
        Some("PDP call failed: a\ncompensation failed: b")
    );
}

// ---------------------------------------------------------------------------
// Exactly-once claiming
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig { cases: 32, ..ProptestConfig::default() })]

    /// Property: concurrent claimers never receive the same job and together drain the queue.
    #[test]
    fn concurrent_claimers_get_disjoint_batches(
        jobs in 1usize..60,
        batch_sizes in proptest::collection::vec(1usize..8, 2..6),
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        let (claimed, expected) = runtime.block_on(async move {
            let store = InMemoryOutboxStore::arc();
            let mut expected = HashSet::new();
            for n in 0..jobs {
                let job = store
                    .create_schema_with_job(schema(&format!("schema_{n}")), "sdl")
                    .unwrap();
                expected.insert(job.id);
            }

            let claimers: Vec<_> = batch_sizes
                .into_iter()
                .map(|limit| {
                    let store = Arc::clone(&store);
                    tokio::spawn(async move {
                        let mut mine = Vec::new();
                        loop {
                            let batch = store.claim_batch(limit).await.unwrap();
                            if batch.is_empty() {
                                break mine;
                            }
                            mine.extend(batch.into_iter().map(|job| job.id));
                            tokio::task::yield_now().await;
                        }
                    })
                })
                .collect();

            let mut claimed = Vec::new();
            for claimer in claimers {
                claimed.extend(claimer.await.unwrap());
            }
            (claimed, expected)
        });

        let unique: HashSet<JobId> = claimed.iter().cloned().collect();
        prop_assert_eq!(unique.len(), claimed.len());
        prop_assert_eq!(unique, expected);
    }
}
