//! PDP outbox worker: reconciles the local job table with the remote Policy
//! Decision Point without two-phase commit.
//!
//! ## Design
//!
//! - Jobs are written by the enqueue path in the same transaction as their
//!   Schema/Application row
//! - Workers claim pending jobs exclusively (`FOR UPDATE SKIP LOCKED`)
//! - Each job gets exactly one remote call (one-shot, no retry)
//! - A failed remote call is compensated locally; failed compensation is
//!   terminal and raises a critical alert
//! - Outcomes are persisted through a separate, retried status update
//! - Jobs stranded in `processing` by a crashed worker are swept back to
//!   `pending` on a coarse cadence
//!
//! ## Components
//!
//! - `JobStore` / `ReferentStore`: job table and domain-row access
//! - `PdpClient`: the remote capability (injected)
//! - `AlertNotifier`: operational alerts (injected, optional)
//! - `Compensator`: type-specific undo of the local side effect
//! - `PdpWorker`: poll loop, per-job saga, graceful shutdown

pub mod alert;
pub mod compensator;
pub mod config;
pub mod in_memory;
pub mod pdp;
pub mod postgres;
pub mod retry;
pub mod store;
pub mod worker;

pub use alert::{AlertDetails, AlertError, AlertNotifier, Alerter, Severity, TracingAlertNotifier};
pub use compensator::{Compensation, CompensationError, Compensator};
pub use config::{ConfigError, WorkerConfig};
pub use in_memory::InMemoryOutboxStore;
pub use pdp::{
    AllowListUpdateRequest, AllowListUpdateResponse, AllowListUpdateResponseRecord, PdpClient,
    PdpError, PolicyMetadataCreateResponse, PolicyMetadataRecord,
};
pub use postgres::PostgresJobStore;
pub use retry::RetryPolicy;
pub use store::{JobStore, JobStoreError, ReferentStore};
pub use worker::{BatchReport, PdpWorker, ProcessedJob, WorkerError, WorkerState};
