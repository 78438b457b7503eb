//! Operational alerts raised by the worker.
//!
//! The notifier is optional. [`Alerter`] wraps the optional sink so call sites
//! never branch on its presence, and a failing sink is logged, never
//! propagated into job processing.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Structured alert payload (camelCase keys such as `jobId`).
pub type AlertDetails = Map<String, Value>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
        }
    }
}

impl core::fmt::Display for Severity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to send alert: {0}")]
pub struct AlertError(pub String);

/// High-priority alert sink (pager, chat webhook, ...).
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn send_alert(
        &self,
        severity: Severity,
        message: &str,
        details: &AlertDetails,
    ) -> Result<(), AlertError>;
}

/// Nil-safe front for an optional [`AlertNotifier`].
#[derive(Clone, Default)]
pub struct Alerter {
    notifier: Option<Arc<dyn AlertNotifier>>,
}

impl core::fmt::Debug for Alerter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Alerter")
            .field("configured", &self.is_configured())
            .finish()
    }
}

impl Alerter {
    pub fn new(notifier: Option<Arc<dyn AlertNotifier>>) -> Self {
        Self { notifier }
    }

    pub fn disabled() -> Self {
        Self { notifier: None }
    }

    pub fn is_configured(&self) -> bool {
        self.notifier.is_some()
    }

    /// Send an alert if a notifier is configured. Never fails.
    pub async fn send(&self, severity: Severity, message: &str, details: AlertDetails) {
        let Some(notifier) = &self.notifier else {
            tracing::debug!(%severity, alert = message, "no alert notifier configured, alert dropped");
            return;
        };

        if let Err(err) = notifier.send_alert(severity, message, &details).await {
            tracing::error!(%severity, alert = message, error = %err, "failed to send alert");
        }
    }
}

/// Notifier that writes alerts to the log stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertNotifier;

#[async_trait]
impl AlertNotifier for TracingAlertNotifier {
    async fn send_alert(
        &self,
        severity: Severity,
        message: &str,
        details: &AlertDetails,
    ) -> Result<(), AlertError> {
        let details = Value::Object(details.clone());
        match severity {
            Severity::Critical => tracing::error!(%severity, %details, "ALERT: {message}"),
            Severity::Warning => tracing::warn!(%severity, %details, "ALERT: {message}"),
        }
        Ok(())
    }
}
