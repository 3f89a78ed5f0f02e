//! Read-only aggregations: backup statistics, storage usage and service
//! status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::BackupOrchestrator;
use crate::disk::{directory_size, disk_usage, DiskUsage};
use crate::encryption::run_blocking;
use crate::metadata::{BackupRecord, BackupStatus, BackupType};
use crate::settings::OffsiteProvider;
use crate::store::BackupFilter;
use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStats {
    pub total: u64,
    /// Keyed by `DATABASE`, `FILES`, `FULL_SYSTEM`
    pub by_type: BTreeMap<String, u64>,
    /// Keyed by `IN_PROGRESS`, `COMPLETED`, `FAILED`
    pub by_status: BTreeMap<String, u64>,
    /// Bytes of all recorded artifacts
    pub total_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backup_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_backup_at: Option<DateTime<Utc>>,
}

impl BackupStats {
    /// Aggregate `records`
    pub fn from_records(records: &[BackupRecord]) -> Self {
        let mut stats = BackupStats::default();
        for record in records {
            stats.total += 1;
            *stats.by_type.entry(record.backup_type.as_str().to_string()).or_default() += 1;
            *stats.by_status.entry(record.status.as_str().to_string()).or_default() += 1;
            stats.total_size += record.size;
            stats.last_backup_at = stats.last_backup_at.max(Some(record.started_at));
            if record.status == BackupStatus::Completed {
                stats.last_successful_backup_at =
                    stats.last_successful_backup_at.max(record.completed_at);
            }
        }
        stats
    }

    pub fn count_of_type(&self, backup_type: BackupType) -> u64 {
        self.by_type.get(backup_type.as_str()).copied().unwrap_or(0)
    }

    pub fn count_of_status(&self, status: BackupStatus) -> u64 {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUsage {
    pub backup_dir: PathBuf,
    /// Bytes on disk under the backup directory
    pub artifact_bytes: u64,
    /// Sum of sizes recorded on completed backups
    pub recorded_bytes: u64,
    pub completed_backups: u64,
    pub disk: DiskUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub healthy: bool,
    pub backup_dir_writable: bool,
    pub database_configured: bool,
    pub encryption_enabled: bool,
    pub offsite_enabled: bool,
    pub offsite_provider: OffsiteProvider,
    pub in_progress_backups: u64,
    pub active_operations: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_backup_at: Option<DateTime<Utc>>,
    /// Human-readable problems found
    pub issues: Vec<String>,
}

impl BackupOrchestrator {
    /// Counts and sizes over every record, snapshots included
    pub async fn get_backup_stats(&self) -> Result<BackupStats> {
        let records = self.store.list_backups(&BackupFilter::all()).await?;
        Ok(BackupStats::from_records(&records))
    }

    /// Space used by artifacts and the host volume holding them
    pub async fn get_storage_usage(&self) -> Result<StorageUsage> {
        let completed = self
            .store
            .list_backups(&BackupFilter {
                include_pre_restore: true,
                ..BackupFilter::completed()
            })
            .await?;
        let recorded_bytes = completed.iter().map(|r| r.size).sum();

        let dir = self.config.backup_dir.clone();
        let (artifact_bytes, disk) =
            run_blocking(move || Ok((directory_size(&dir), disk_usage(&dir)))).await?;

        Ok(StorageUsage {
            backup_dir: self.config.backup_dir.clone(),
            artifact_bytes,
            recorded_bytes,
            completed_backups: completed.len() as u64,
            disk,
        })
    }

    /// Health summary for operators
    pub async fn get_service_status(&self) -> Result<ServiceStatus> {
        let encryption = self.settings.encryption_policy().await?;
        let offsite = self.settings.offsite_policy().await?;
        let stats = self.get_backup_stats().await?;

        let dir = self.config.backup_dir.clone();
        let backup_dir_writable = run_blocking(move || {
            std::fs::create_dir_all(&dir)?;
            tempfile::NamedTempFile::new_in(&dir)?;
            Ok(())
        })
        .await
        .is_ok();
        let database_configured = self
            .config
            .database
            .url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty());

        let mut issues = Vec::new();
        if !backup_dir_writable {
            issues.push(format!(
                "Backup directory {} is not writable",
                self.config.backup_dir.display()
            ));
        }
        if !database_configured {
            issues.push("Database connection URL is not configured".to_string());
        }
        if encryption.enabled && encryption.key.as_deref().map_or(true, str::is_empty) {
            issues.push(
                "Encryption is enabled without a key; keys will be generated per backup"
                    .to_string(),
            );
        }
        if offsite.enabled && offsite.provider != OffsiteProvider::Ssh {
            issues.push(format!("Offsite provider '{}' is not implemented", offsite.provider));
        }

        Ok(ServiceStatus {
            healthy: backup_dir_writable && database_configured,
            backup_dir_writable,
            database_configured,
            encryption_enabled: encryption.enabled,
            offsite_enabled: offsite.enabled,
            offsite_provider: offsite.provider,
            in_progress_backups: stats.count_of_status(BackupStatus::InProgress),
            active_operations: self.progress.active_operations().len(),
            last_successful_backup_at: stats.last_successful_backup_at,
            issues,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{BackupOrigin, CompletedArtifact};

    fn record(id: &str, backup_type: BackupType, size: Option<u64>) -> BackupRecord {
        let mut record = BackupRecord::in_progress(
            id,
            backup_type,
            PathBuf::from(format!("/backups/{id}")),
            BackupOrigin::Manual,
        );
        match size {
            Some(size) => record
                .mark_completed(CompletedArtifact {
                    location: record.location.clone(),
                    size,
                    encrypted: false,
                    encryption_key: None,
                    checksum: None,
                    metadata: serde_json::Value::Null,
                })
                .unwrap(),
            None => record.mark_failed("dump failed").unwrap(),
        }
        record
    }

    #[test]
    fn test_stats_from_records() {
        let stats = BackupStats::from_records(&[
            record("a", BackupType::Database, Some(1200)),
            record("b", BackupType::Files, Some(800)),
            record("c", BackupType::Database, None),
        ]);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.count_of_type(BackupType::Database), 2);
        assert_eq!(stats.count_of_type(BackupType::FullSystem), 0);
        assert_eq!(stats.count_of_status(BackupStatus::Completed), 2);
        assert_eq!(stats.count_of_status(BackupStatus::Failed), 1);
        assert_eq!(stats.total_size, 2000);
        assert!(stats.last_successful_backup_at.is_some());
    }

    #[test]
    fn test_empty_stats() {
        let stats = BackupStats::from_records(&[]);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.last_backup_at, None);
    }
}
