//! Audit trail sink
//!
//! Every backup, restore and schedule action is reported to an
//! [`AuditSink`]. Recording is fire-and-forget: [`record_quietly`] logs a
//! sink failure and carries on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::Result;

/// Module name used for every event emitted by the engine
pub const AUDIT_MODULE: &str = "backup";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Initiated,
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// e.g. `BACKUP_CREATE`, `BACKUP_RESTORE`
    pub action: String,
    pub module: String,
    pub status: AuditStatus,
    /// Who and what: actor id, target id
    pub context: serde_json::Value,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new<S: Into<String>>(action: S, status: AuditStatus) -> Self {
        Self {
            action: action.into(),
            module: AUDIT_MODULE.to_string(),
            status,
            context: serde_json::Value::Null,
            details: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<()>;
}

/// Record `event`, logging instead of propagating a sink failure
pub async fn record_quietly(sink: &dyn AuditSink, event: AuditEvent) {
    let action = event.action.clone();
    if let Err(e) = sink.record(event).await {
        tracing::warn!(action = %action, error = %e, "Failed to record audit event");
    }
}

/// Emits each event as a structured `tracing` record
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        tracing::info!(
            target: "backstop::audit",
            action = %event.action,
            module = %event.module,
            status = ?event.status,
            context = %event.context,
            details = %event.details,
            "audit"
        );
        Ok(())
    }
}

/// Keeps events in memory
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// `(action, status)` pairs in recording order
    pub fn actions(&self) -> Vec<(String, AuditStatus)> {
        self.events()
            .into_iter()
            .map(|e| (e.action, e.status))
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BackstopError;

    #[tokio::test]
    async fn test_record_quietly_swallows_sink_failure() {
        let mut sink = MockAuditSink::new();
        sink.expect_record()
            .times(1)
            .returning(|_| Err(BackstopError::store("audit table is locked")));

        record_quietly(&sink, AuditEvent::new("BACKUP_CREATE", AuditStatus::Initiated)).await;
    }

    #[tokio::test]
    async fn test_memory_sink_collects_in_order() {
        let sink = MemoryAuditSink::new();
        record_quietly(&sink, AuditEvent::new("BACKUP_CREATE", AuditStatus::Initiated)).await;
        record_quietly(&sink, AuditEvent::new("BACKUP_CREATE", AuditStatus::Success)).await;

        assert_eq!(
            sink.actions(),
            vec![
                ("BACKUP_CREATE".to_string(), AuditStatus::Initiated),
                ("BACKUP_CREATE".to_string(), AuditStatus::Success),
            ]
        );
        assert_eq!(sink.events()[0].module, AUDIT_MODULE);
    }
}
