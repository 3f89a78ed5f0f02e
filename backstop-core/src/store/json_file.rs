/*!
JSON-file backed metadata store.

Every write replaces the whole document on disk. Parent directories are
created on demand, the same way the local snapshot storage always did.
*/

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::memory::{MemoryStore, StoreDocument};
use super::{BackupFilter, MetadataStore};
use crate::metadata::{BackupRecord, BackupSchedule};
use crate::{BackstopError, Result};

/// [`MetadataStore`] persisted to a single JSON document
///
/// # Example
/// ```rust,no_run
/// use backstop_core::store::JsonFileStore;
///
/// # async fn open() -> backstop_core::Result<()> {
/// let store = JsonFileStore::open("/var/backups/backstop.json").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    inner: MemoryStore,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open the document at `path`, starting empty if it does not exist
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let document = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice::<StoreDocument>(&raw).map_err(|e| {
                BackstopError::store(format!(
                    "Failed to parse metadata document {}: {}",
                    path.display(),
                    e
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreDocument::default(),
            Err(e) => {
                return Err(BackstopError::store(format!(
                    "Failed to read metadata document {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        Ok(Self {
            path,
            inner: MemoryStore::from_document(document),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The in-memory view, e.g. to seed domain records
    pub fn memory(&self) -> &MemoryStore {
        &self.inner
    }

    /// Write the current state to disk via a sibling temp file and rename
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    BackstopError::store(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let payload = serde_json::to_vec_pretty(&self.inner.to_document())?;
        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, payload).await.map_err(|e| {
            BackstopError::store(format!(
                "Failed to write metadata document {}: {}",
                staging.display(),
                e
            ))
        })?;
        tokio::fs::rename(&staging, &self.path).await.map_err(|e| {
            BackstopError::store(format!(
                "Failed to replace metadata document {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for JsonFileStore {
    async fn insert_backup(&self, record: &BackupRecord) -> Result<()> {
        self.inner.insert_backup(record).await?;
        self.flush().await
    }

    async fn update_backup(&self, record: &BackupRecord) -> Result<()> {
        self.inner.update_backup(record).await?;
        self.flush().await
    }

    async fn get_backup(&self, backup_id: &str) -> Result<Option<BackupRecord>> {
        self.inner.get_backup(backup_id).await
    }

    async fn delete_backup(&self, backup_id: &str) -> Result<bool> {
        let existed = self.inner.delete_backup(backup_id).await?;
        if existed {
            self.flush().await?;
        }
        Ok(existed)
    }

    async fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<BackupRecord>> {
        self.inner.list_backups(filter).await
    }

    async fn count_backups(&self, filter: &BackupFilter) -> Result<u64> {
        self.inner.count_backups(filter).await
    }

    async fn insert_schedule(&self, schedule: &BackupSchedule) -> Result<()> {
        self.inner.insert_schedule(schedule).await?;
        self.flush().await
    }

    async fn update_schedule(&self, schedule: &BackupSchedule) -> Result<()> {
        self.inner.update_schedule(schedule).await?;
        self.flush().await
    }

    async fn get_schedule(&self, schedule_id: &str) -> Result<Option<BackupSchedule>> {
        self.inner.get_schedule(schedule_id).await
    }

    async fn delete_schedule(&self, schedule_id: &str) -> Result<bool> {
        let existed = self.inner.delete_schedule(schedule_id).await?;
        if existed {
            self.flush().await?;
        }
        Ok(existed)
    }

    async fn list_schedules(&self, enabled_only: bool) -> Result<Vec<BackupSchedule>> {
        self.inner.list_schedules(enabled_only).await
    }

    async fn fetch_domain_records(&self, kind: &str) -> Result<serde_json::Value> {
        self.inner.fetch_domain_records(kind).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{BackupOrigin, BackupType};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/state/backstop.json");

        let store = JsonFileStore::open(&path).await.unwrap();
        let record = BackupRecord::in_progress(
            "files_1",
            BackupType::Files,
            PathBuf::from("/b/files_1.tar.gz"),
            BackupOrigin::Manual,
        );
        store.insert_backup(&record).await.unwrap();
        assert!(path.exists());

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let loaded = reopened.get_backup("files_1").await.unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn test_corrupt_document_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("backstop.json");
        std::fs::write(&path, b"{not json").unwrap();

        let err = JsonFileStore::open(&path).await.unwrap_err();
        assert!(matches!(err, BackstopError::Store(_)));
    }
}
