//! Retention cleanup: age and count limits over completed backups.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use tracing::{info, warn};

use super::BackupOrchestrator;
use crate::audit::{AuditEvent, AuditStatus};
use crate::config::RetentionDefaults;
use crate::metadata::{BackupRecord, BackupSchedule, BackupType};
use crate::store::BackupFilter;
use crate::Result;

/// Which completed backups a cleanup pass may delete
///
/// A zero limit disables that criterion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupOptions {
    pub retention_days: u32,
    pub max_backups: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_type: Option<BackupType>,
    /// Restrict to backups created by one schedule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
}

impl CleanupOptions {
    pub fn new(retention_days: u32, max_backups: u32) -> Self {
        Self {
            retention_days,
            max_backups,
            backup_type: None,
            schedule_id: None,
        }
    }

    /// Limits of `schedule`, applied to the backups it created
    pub fn for_schedule(schedule: &BackupSchedule) -> Self {
        Self {
            retention_days: schedule.retention_days,
            max_backups: schedule.max_backups,
            backup_type: Some(schedule.backup_type),
            schedule_id: Some(schedule.id.clone()),
        }
    }

    fn filter(&self) -> BackupFilter {
        let mut filter = BackupFilter::completed();
        filter.backup_type = self.backup_type;
        filter.schedule_id = self.schedule_id.clone();
        filter
    }
}

impl From<RetentionDefaults> for CleanupOptions {
    fn from(defaults: RetentionDefaults) -> Self {
        Self::new(defaults.retention_days, defaults.max_backups)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupFailure {
    pub backup_id: String,
    pub error: String,
}

/// Outcome of a cleanup pass; per-item failures do not stop the batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub deleted: Vec<String>,
    pub errors: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }

    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    /// Fold `other` into this report
    pub fn merge(&mut self, other: CleanupReport) {
        self.deleted.extend(other.deleted);
        self.errors.extend(other.errors);
    }
}

/// Ids of `records` to delete: older than the age limit or ranked past the
/// count limit, each id once
///
/// Pre-restore snapshots and records that are not COMPLETED are never
/// selected.
pub fn select_for_cleanup(
    records: &[BackupRecord],
    options: &CleanupOptions,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut ranked: Vec<&BackupRecord> = records
        .iter()
        .filter(|r| r.status == crate::metadata::BackupStatus::Completed && !r.is_pre_restore())
        .collect();
    ranked.sort_by(|a, b| {
        b.reference_time()
            .cmp(&a.reference_time())
            .then_with(|| b.backup_id.cmp(&a.backup_id))
    });

    let cutoff = (options.retention_days > 0)
        .then(|| now - Duration::days(i64::from(options.retention_days)));
    let keep = (options.max_backups > 0).then_some(options.max_backups as usize);

    let mut seen = HashSet::new();
    let mut selected = Vec::new();
    for (rank, record) in ranked.iter().enumerate() {
        let expired = cutoff.is_some_and(|cutoff| record.reference_time() < cutoff);
        let overflow = keep.is_some_and(|keep| rank >= keep);
        if (expired || overflow) && seen.insert(record.backup_id.as_str()) {
            selected.push(record.backup_id.clone());
        }
    }
    selected
}

impl BackupOrchestrator {
    /// Delete completed backups past the age or count limit
    pub async fn cleanup_old_backups(&self, options: &CleanupOptions) -> Result<CleanupReport> {
        let records = self.store.list_backups(&options.filter()).await?;
        let doomed = select_for_cleanup(&records, options, Utc::now());

        let mut report = CleanupReport::default();
        for backup_id in doomed {
            let Some(record) = records.iter().find(|r| r.backup_id == backup_id) else {
                continue;
            };
            match self.remove_backup(record).await {
                Ok(()) => report.deleted.push(backup_id),
                Err(e) => {
                    warn!(backup_id = %backup_id, error = %e, "Failed to delete expired backup");
                    report.errors.push(CleanupFailure {
                        backup_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        if report.deleted_count() > 0 || !report.is_complete() {
            info!(
                deleted = report.deleted_count(),
                errors = report.errors.len(),
                retention_days = options.retention_days,
                max_backups = options.max_backups,
                "Retention cleanup finished"
            );
            let status = if report.is_complete() {
                AuditStatus::Success
            } else {
                AuditStatus::Failure
            };
            self.audit(
                AuditEvent::new("BACKUP_CLEANUP", status)
                    .with_context(json!({ "scheduleId": options.schedule_id }))
                    .with_details(json!({
                        "deleted": report.deleted,
                        "errors": report.errors,
                        "retentionDays": options.retention_days,
                        "maxBackups": options.max_backups,
                    })),
            )
            .await;
        }
        Ok(report)
    }
}
