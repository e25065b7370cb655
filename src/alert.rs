//! Alerting fan-out at the orchestrator boundary.
//!
//! Template rendering and SMTP/webhook delivery are out of scope; this
//! module only owns the dispatcher shape - a trait the orchestrator
//! calls into on terminal failure, best-effort, never retried.

use async_trait::async_trait;

use crate::catalog::models::RunStatus;

#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub config_name: String,
    pub run_id: uuid::Uuid,
    pub status: RunStatus,
    pub message: String,
}

/// A subscriber registry would sit above this in a full deployment; here
/// each dispatch is a direct best-effort call that must not block or panic
/// the orchestrator regardless of what the sink does.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, event: AlertEvent);
}

/// Default sink: structured log line. Real deployments swap this for an
/// SMTP/webhook implementation with its own rate limiting.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, event: AlertEvent) {
        log::error!(
            "backup run {} for '{}' ended in {:?}: {}",
            event.run_id,
            event.config_name,
            event.status,
            event.message
        );
    }
}
