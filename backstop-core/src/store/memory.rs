/*!
Concurrent in-memory metadata store.
*/

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{BackupFilter, MetadataStore};
use crate::metadata::{BackupRecord, BackupSchedule};
use crate::{BackstopError, Result};

/// Every collection in one serializable value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreDocument {
    #[serde(default)]
    pub backups: Vec<BackupRecord>,
    #[serde(default)]
    pub schedules: Vec<BackupSchedule>,
    /// Application records keyed by kind
    #[serde(default)]
    pub domain: BTreeMap<String, serde_json::Value>,
}

/// In-memory [`MetadataStore`]
///
/// Per-key locking through `DashMap`, so concurrent operations touching
/// different records never contend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    backups: DashMap<String, BackupRecord>,
    schedules: DashMap<String, BackupSchedule>,
    domain: DashMap<String, serde_json::Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated from `document`
    pub fn from_document(document: StoreDocument) -> Self {
        let store = Self::new();
        for record in document.backups {
            store.backups.insert(record.backup_id.clone(), record);
        }
        for schedule in document.schedules {
            store.schedules.insert(schedule.id.clone(), schedule);
        }
        for (kind, value) in document.domain {
            store.domain.insert(kind, value);
        }
        store
    }

    /// Copy of every collection, in stable order
    pub fn to_document(&self) -> StoreDocument {
        let mut backups: Vec<BackupRecord> =
            self.backups.iter().map(|e| e.value().clone()).collect();
        backups.sort_by(|a, b| a.backup_id.cmp(&b.backup_id));
        let mut schedules: Vec<BackupSchedule> =
            self.schedules.iter().map(|e| e.value().clone()).collect();
        schedules.sort_by(|a, b| a.id.cmp(&b.id));
        let domain = self
            .domain
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        StoreDocument {
            backups,
            schedules,
            domain,
        }
    }

    /// Install the application records returned for `kind`
    pub fn set_domain_records<S: Into<String>>(&self, kind: S, records: serde_json::Value) {
        self.domain.insert(kind.into(), records);
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn insert_backup(&self, record: &BackupRecord) -> Result<()> {
        match self.backups.entry(record.backup_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(BackstopError::store(format!(
                "Backup {} already exists",
                record.backup_id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn update_backup(&self, record: &BackupRecord) -> Result<()> {
        match self.backups.get_mut(&record.backup_id) {
            Some(mut existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(BackstopError::not_found(format!(
                "Backup {}",
                record.backup_id
            ))),
        }
    }

    async fn get_backup(&self, backup_id: &str) -> Result<Option<BackupRecord>> {
        Ok(self.backups.get(backup_id).map(|r| r.value().clone()))
    }

    async fn delete_backup(&self, backup_id: &str) -> Result<bool> {
        Ok(self.backups.remove(backup_id).is_some())
    }

    async fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<BackupRecord>> {
        let snapshot: Vec<BackupRecord> = self.backups.iter().map(|e| e.value().clone()).collect();
        Ok(filter.apply(snapshot))
    }

    async fn count_backups(&self, filter: &BackupFilter) -> Result<u64> {
        Ok(self.backups.iter().filter(|e| filter.matches(e.value())).count() as u64)
    }

    async fn insert_schedule(&self, schedule: &BackupSchedule) -> Result<()> {
        match self.schedules.entry(schedule.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(BackstopError::store(format!(
                "Schedule {} already exists",
                schedule.id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(schedule.clone());
                Ok(())
            }
        }
    }

    async fn update_schedule(&self, schedule: &BackupSchedule) -> Result<()> {
        match self.schedules.get_mut(&schedule.id) {
            Some(mut existing) => {
                *existing = schedule.clone();
                Ok(())
            }
            None => Err(BackstopError::not_found(format!("Schedule {}", schedule.id))),
        }
    }

    async fn get_schedule(&self, schedule_id: &str) -> Result<Option<BackupSchedule>> {
        Ok(self.schedules.get(schedule_id).map(|s| s.value().clone()))
    }

    async fn delete_schedule(&self, schedule_id: &str) -> Result<bool> {
        Ok(self.schedules.remove(schedule_id).is_some())
    }

    async fn list_schedules(&self, enabled_only: bool) -> Result<Vec<BackupSchedule>> {
        let mut schedules: Vec<BackupSchedule> = self
            .schedules
            .iter()
            .filter(|e| !enabled_only || e.value().enabled)
            .map(|e| e.value().clone())
            .collect();
        schedules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(schedules)
    }

    async fn fetch_domain_records(&self, kind: &str) -> Result<serde_json::Value> {
        self.domain
            .get(kind)
            .map(|v| v.value().clone())
            .ok_or_else(|| BackstopError::not_found(format!("Domain records '{kind}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{BackupOrigin, BackupStatus, BackupType};
    use std::path::PathBuf;

    fn record(id: &str) -> BackupRecord {
        BackupRecord::in_progress(id, BackupType::Database, PathBuf::from(id), BackupOrigin::Manual)
    }

    #[tokio::test]
    async fn test_insert_is_unique() {
        let store = MemoryStore::new();
        store.insert_backup(&record("a")).await.unwrap();
        let err = store.insert_backup(&record("a")).await.unwrap_err();
        assert!(matches!(err, BackstopError::Store(_)));
    }

    #[tokio::test]
    async fn test_update_requires_existing() {
        let store = MemoryStore::new();
        let err = store.update_backup(&record("ghost")).await.unwrap_err();
        assert!(matches!(err, BackstopError::NotFound(_)));

        let mut rec = record("a");
        store.insert_backup(&rec).await.unwrap();
        rec.mark_failed("boom").unwrap();
        store.update_backup(&rec).await.unwrap();
        let loaded = store.get_backup("a").await.unwrap().unwrap();
        assert_eq!(loaded.status, BackupStatus::Failed);
    }

    #[tokio::test]
    async fn test_count_and_delete() {
        let store = MemoryStore::new();
        for id in ["a", "b", "c"] {
            store.insert_backup(&record(id)).await.unwrap();
        }
        assert_eq!(store.count_backups(&BackupFilter::default()).await.unwrap(), 3);
        assert!(store.delete_backup("b").await.unwrap());
        assert!(!store.delete_backup("b").await.unwrap());
        assert_eq!(store.count_backups(&BackupFilter::default()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_domain_records() {
        let store = MemoryStore::new();
        store.set_domain_records("school", serde_json::json!({"name": "Northfield"}));
        assert_eq!(
            store.fetch_domain_records("school").await.unwrap()["name"],
            "Northfield"
        );
        assert!(store.fetch_domain_records("grading_scales").await.is_err());
    }
}
