/*!
Metadata store abstraction.

Backup records, schedules and the application's domain records live in a
store owned by the host application. The engine only talks to it through
[`MetadataStore`], so any database can sit behind it. Two adapters ship with
the crate: [`MemoryStore`] and [`JsonFileStore`].
*/

pub mod json_file;
pub mod memory;

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::metadata::{BackupRecord, BackupSchedule, BackupStatus, BackupType};
use crate::Result;

/// Filter applied by [`MetadataStore::list_backups`] and
/// [`MetadataStore::count_backups`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupFilter {
    pub backup_type: Option<BackupType>,
    pub status: Option<BackupStatus>,
    /// Only backups triggered by this schedule
    pub schedule_id: Option<String>,
    /// Pre-restore snapshots are hidden unless this is set
    pub include_pre_restore: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl BackupFilter {
    pub fn all() -> Self {
        Self {
            include_pre_restore: true,
            ..Self::default()
        }
    }

    pub fn completed() -> Self {
        Self {
            status: Some(BackupStatus::Completed),
            ..Self::default()
        }
    }

    pub fn with_type(mut self, backup_type: BackupType) -> Self {
        self.backup_type = Some(backup_type);
        self
    }

    pub fn with_status(mut self, status: BackupStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn for_schedule<S: Into<String>>(mut self, schedule_id: S) -> Self {
        self.schedule_id = Some(schedule_id.into());
        self
    }

    pub fn paged(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }

    /// True if `record` passes every criterion except paging
    pub fn matches(&self, record: &BackupRecord) -> bool {
        if !self.include_pre_restore && record.is_pre_restore() {
            return false;
        }
        if self.backup_type.is_some_and(|t| t != record.backup_type) {
            return false;
        }
        if self.status.is_some_and(|s| s != record.status) {
            return false;
        }
        if let Some(schedule_id) = &self.schedule_id {
            if record.origin.schedule_id() != Some(schedule_id.as_str()) {
                return false;
            }
        }
        true
    }

    /// Sort newest-first and apply `offset`/`limit`
    pub fn apply(&self, records: impl IntoIterator<Item = BackupRecord>) -> Vec<BackupRecord> {
        let mut selected: Vec<BackupRecord> =
            records.into_iter().filter(|r| self.matches(r)).collect();
        selected.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.backup_id.cmp(&a.backup_id))
        });
        selected
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// Persistence port for records and schedules
///
/// Listing operations return records newest-first.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a new backup record; fails if the id already exists
    async fn insert_backup(&self, record: &BackupRecord) -> Result<()>;

    /// Replace an existing backup record
    ///
    /// # Returns
    /// `NotFound` if no record with that id exists
    async fn update_backup(&self, record: &BackupRecord) -> Result<()>;

    async fn get_backup(&self, backup_id: &str) -> Result<Option<BackupRecord>>;

    /// Delete a backup record, returning whether it existed
    async fn delete_backup(&self, backup_id: &str) -> Result<bool>;

    async fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<BackupRecord>>;

    /// Count matching records, ignoring paging
    async fn count_backups(&self, filter: &BackupFilter) -> Result<u64>;

    async fn insert_schedule(&self, schedule: &BackupSchedule) -> Result<()>;

    async fn update_schedule(&self, schedule: &BackupSchedule) -> Result<()>;

    async fn get_schedule(&self, schedule_id: &str) -> Result<Option<BackupSchedule>>;

    async fn delete_schedule(&self, schedule_id: &str) -> Result<bool>;

    async fn list_schedules(&self, enabled_only: bool) -> Result<Vec<BackupSchedule>>;

    /// Read-only access to application records of the given kind
    /// (e.g. `"school"`, `"academic_years"`, `"grading_scales"`)
    async fn fetch_domain_records(&self, kind: &str) -> Result<serde_json::Value>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::BackupOrigin;
    use chrono::{Duration, Utc};
    use std::path::PathBuf;

    fn record(id: &str, backup_type: BackupType, minutes_ago: i64) -> BackupRecord {
        let mut record =
            BackupRecord::in_progress(id, backup_type, PathBuf::from(id), BackupOrigin::Manual);
        record.started_at = Utc::now() - Duration::minutes(minutes_ago);
        record
    }

    #[test]
    fn test_filter_hides_pre_restore_by_default() {
        let mut snapshot = record("snap", BackupType::FullSystem, 1);
        snapshot.origin = BackupOrigin::PreRestore {
            restore_of: "x".into(),
        };

        assert!(!BackupFilter::default().matches(&snapshot));
        assert!(BackupFilter::all().matches(&snapshot));
    }

    #[test]
    fn test_filter_by_schedule() {
        let mut scheduled = record("a", BackupType::Database, 1);
        scheduled.origin = BackupOrigin::Scheduled {
            schedule_id: "nightly".into(),
        };
        let manual = record("b", BackupType::Database, 1);

        let filter = BackupFilter::default().for_schedule("nightly");
        assert!(filter.matches(&scheduled));
        assert!(!filter.matches(&manual));
    }

    #[test]
    fn test_apply_sorts_newest_first_and_pages() {
        let records = vec![
            record("old", BackupType::Files, 30),
            record("new", BackupType::Files, 1),
            record("mid", BackupType::Files, 10),
            record("db", BackupType::Database, 5),
        ];

        let filter = BackupFilter::default().with_type(BackupType::Files).paged(2, 1);
        let ids: Vec<String> = filter
            .apply(records)
            .into_iter()
            .map(|r| r.backup_id)
            .collect();
        assert_eq!(ids, vec!["mid".to_string(), "old".to_string()]);
    }
}
