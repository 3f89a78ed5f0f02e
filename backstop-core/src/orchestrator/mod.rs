/*!
Top-level backup and restore orchestration.

[`BackupOrchestrator`] is the only writer of [`BackupRecord`]s. A backup
moves its record from IN_PROGRESS to exactly one of COMPLETED or FAILED
before any result reaches the caller; a restore takes a full-system safety
snapshot first unless told not to.
*/

mod retention;
mod stats;

pub use retention::{select_for_cleanup, CleanupFailure, CleanupOptions, CleanupReport};
pub use stats::{BackupStats, ServiceStatus, StorageUsage};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::audit::{record_quietly, AuditEvent, AuditSink, AuditStatus};
use crate::config::EngineConfig;
use crate::detect::RestoreDetector;
use crate::encryption::{run_blocking, EncryptionEngine};
use crate::metadata::{
    compute_file_checksum, generate_backup_id, generate_operation_id, BackupOrigin, BackupRecord,
    BackupStatus, BackupType, CompletedArtifact,
};
use crate::observability::{
    record_backup_finished, record_backup_started, record_offsite, record_restore,
};
use crate::offsite::OffsiteTransfer;
use crate::progress::{OperationType, ProgressHandle, ProgressTracker, Stage};
use crate::settings::SettingsProvider;
use crate::store::{BackupFilter, MetadataStore};
use crate::strategy::{
    BackupArtifact, BackupOptions, BackupStrategy, DatabaseStrategy, FilesStrategy,
    FullSystemStrategy, RestoreOptions, RestoreReport, ValidationReport,
};
use crate::{BackstopError, Result};

/// A request to create one backup
#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub backup_type: BackupType,
    pub description: Option<String>,
    /// Overrides the global encryption policy when set
    pub encrypt: Option<bool>,
    /// Secret to encrypt with; falls back to the policy key, then a fresh one
    pub encryption_key: Option<String>,
    pub include_paths: Vec<PathBuf>,
    pub exclude_patterns: Vec<String>,
    pub origin: BackupOrigin,
    /// Keep the artifact local even when offsite replication is enabled
    pub skip_offsite: bool,
}

impl BackupRequest {
    pub fn new(backup_type: BackupType) -> Self {
        Self {
            backup_type,
            description: None,
            encrypt: None,
            encryption_key: None,
            include_paths: Vec::new(),
            exclude_patterns: Vec::new(),
            origin: BackupOrigin::Manual,
            skip_offsite: false,
        }
    }

    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_encryption(mut self, encrypt: bool) -> Self {
        self.encrypt = Some(encrypt);
        self
    }

    pub fn with_key<S: Into<String>>(mut self, key: S) -> Self {
        self.encrypt = Some(true);
        self.encryption_key = Some(key.into());
        self
    }

    pub fn with_include_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.include_paths = paths;
        self
    }

    pub fn with_origin(mut self, origin: BackupOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Request options as stored on the record; never includes the key
    fn summary(&self) -> Value {
        json!({
            "type": self.backup_type,
            "description": self.description,
            "encrypt": self.encrypt,
            "keySupplied": self.encryption_key.is_some(),
            "includePaths": self.include_paths,
            "excludePatterns": self.exclude_patterns,
            "skipOffsite": self.skip_offsite,
        })
    }
}

/// A request to restore from a recorded backup
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub options: RestoreOptions,
    /// Take a full-system snapshot before touching anything
    pub create_pre_restore_snapshot: bool,
}

impl Default for RestoreRequest {
    fn default() -> Self {
        Self {
            options: RestoreOptions::default(),
            create_pre_restore_snapshot: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOutcome {
    pub backup_id: String,
    /// Progress stream id of the restore
    pub operation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_restore_snapshot_id: Option<String>,
    pub report: RestoreReport,
}

/// Creates, restores, validates and deletes backups
pub struct BackupOrchestrator {
    config: Arc<EngineConfig>,
    store: Arc<dyn MetadataStore>,
    audit: Arc<dyn AuditSink>,
    settings: Arc<dyn SettingsProvider>,
    engine: EncryptionEngine,
    progress: ProgressTracker,
    detector: RestoreDetector,
    offsite: OffsiteTransfer,
}

impl BackupOrchestrator {
    /// Wire the strategies, detector and transport around the given ports
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn MetadataStore>,
        audit: Arc<dyn AuditSink>,
        settings: Arc<dyn SettingsProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let engine = EncryptionEngine::new(config.kdf);

        let database = Arc::new(DatabaseStrategy::new(config.clone(), engine.clone()));
        let files = Arc::new(FilesStrategy::new(config.clone(), engine.clone()));
        let full_system = Arc::new(FullSystemStrategy::new(
            config.clone(),
            engine.clone(),
            database.clone(),
            files.clone(),
            store.clone(),
        ));
        let detector = RestoreDetector::new(
            config.clone(),
            engine.clone(),
            database,
            files,
            full_system,
        );
        let offsite = OffsiteTransfer::new(settings.clone(), config.ssh_connect_timeout);

        Ok(Self {
            progress: ProgressTracker::new(config.progress_retention),
            config,
            store,
            audit,
            settings,
            engine,
            detector,
            offsite,
        })
    }

    /// Share an existing progress tracker instead of the private one
    pub fn with_progress_tracker(mut self, tracker: ProgressTracker) -> Self {
        self.progress = tracker;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn detector(&self) -> &RestoreDetector {
        &self.detector
    }

    pub fn offsite(&self) -> &OffsiteTransfer {
        &self.offsite
    }

    pub fn encryption(&self) -> &EncryptionEngine {
        &self.engine
    }

    fn strategy(&self, backup_type: BackupType) -> &dyn BackupStrategy {
        self.detector.strategy(backup_type)
    }

    pub(crate) async fn audit(&self, event: AuditEvent) {
        record_quietly(self.audit.as_ref(), event).await;
    }

    /// Create a backup and return its COMPLETED record
    ///
    /// # Errors
    /// `BackupFailed` wrapping the strategy error; the record has already
    /// been marked FAILED when this is returned.
    pub async fn create_backup(
        &self,
        request: BackupRequest,
        actor: Option<&str>,
    ) -> Result<BackupRecord> {
        let backup_type = request.backup_type;
        let backup_id = generate_backup_id(backup_type);

        let policy = self.settings.encryption_policy().await?;
        let advanced = self.settings.advanced_policy().await?;
        let encrypt = request.encrypt.unwrap_or(policy.enabled);
        let encryption_key = if encrypt {
            let supplied = request
                .encryption_key
                .clone()
                .or(policy.key)
                .filter(|key| !key.is_empty());
            Some(supplied.unwrap_or_else(|| {
                info!(backup_id = %backup_id, "Generating encryption key for backup");
                self.engine.generate_key(&backup_id)
            }))
        } else {
            None
        };

        let planned = self
            .config
            .backup_dir
            .join(backup_type.artifact_file_name(&backup_id, encrypt));
        let record =
            BackupRecord::in_progress(&backup_id, backup_type, planned, request.origin.clone())
                .with_description(request.description.clone())
                .with_created_by(actor)
                .with_metadata(json!({ "request": request.summary() }));
        self.store.insert_backup(&record).await?;

        self.progress.create_tracker(&backup_id, OperationType::Backup);
        let progress = self.progress.handle(&backup_id);
        record_backup_started(backup_type);
        info!(backup_id = %backup_id, %backup_type, encrypt, "Backup started");
        self.audit(
            AuditEvent::new("BACKUP_CREATE", AuditStatus::Initiated)
                .with_context(json!({ "actor": actor, "backupId": backup_id }))
                .with_details(json!({
                    "type": backup_type,
                    "encrypt": encrypt,
                    "origin": record.origin,
                })),
        )
        .await;

        let mut options = BackupOptions::new(&backup_id, &self.config.backup_dir);
        options.encrypt = encrypt;
        options.encryption_key = encryption_key;
        options.compression_level = advanced.compression_level;
        options.include_paths = request.include_paths.clone();
        options.exclude_patterns = request.exclude_patterns.clone();

        let outcome = async {
            let completed = self
                .run_backup(backup_type, &options, &request, &progress)
                .await?;
            let mut done = record.clone();
            done.mark_completed(completed)?;
            self.store.update_backup(&done).await?;
            Ok::<_, BackstopError>(done)
        }
        .await;

        match outcome {
            Ok(done) => {
                record_backup_finished(true, done.size);
                info!(
                    backup_id = %done.backup_id,
                    size = done.size,
                    encrypted = done.encrypted,
                    location = %done.location.display(),
                    "Backup completed"
                );
                self.progress.complete_tracker(
                    &backup_id,
                    "Backup completed",
                    Some(json!({ "location": done.location, "size": done.size })),
                );
                self.audit(
                    AuditEvent::new("BACKUP_CREATE", AuditStatus::Success)
                        .with_context(json!({ "actor": actor, "backupId": backup_id }))
                        .with_details(json!({
                            "type": backup_type,
                            "size": done.size,
                            "encrypted": done.encrypted,
                        })),
                )
                .await;
                Ok(done)
            }
            Err(e) => Err(self.fail_backup(record, e, actor).await),
        }
    }

    /// Strategy, checksum and offsite steps of a backup
    async fn run_backup(
        &self,
        backup_type: BackupType,
        options: &BackupOptions,
        request: &BackupRequest,
        progress: &ProgressHandle,
    ) -> Result<CompletedArtifact> {
        let artifact = self
            .strategy(backup_type)
            .create_backup(options, progress)
            .await?;
        if options.encrypt && !artifact.encrypted {
            warn!(
                backup_id = %options.backup_id,
                "Backup requested encrypted but stored in plain form"
            );
        }

        let path = artifact.location.clone();
        let checksum = run_blocking(move || compute_file_checksum(&path)).await?;

        let offsite = if request.skip_offsite {
            Value::Null
        } else {
            self.replicate(&artifact, progress).await
        };

        Ok(CompletedArtifact {
            location: artifact.location.clone(),
            size: artifact.size,
            encrypted: artifact.encrypted,
            encryption_key: options.encryption_key.clone(),
            checksum: Some(checksum),
            metadata: json!({
                "request": request.summary(),
                "result": artifact.details,
                "offsite": offsite,
                "timestamp": artifact.timestamp,
            }),
        })
    }

    /// Push `artifact` offsite; failures are recorded, not raised
    async fn replicate(&self, artifact: &BackupArtifact, progress: &ProgressHandle) -> Value {
        match self.offsite.transfer_backup(&artifact.location, progress).await {
            Ok(outcome) => {
                if outcome.transferred {
                    record_offsite(true);
                }
                serde_json::to_value(outcome).unwrap_or(Value::Null)
            }
            Err(e) => {
                record_offsite(false);
                warn!(
                    backup_id = %artifact.backup_id,
                    error = %e,
                    "Offsite transfer failed; keeping local copy"
                );
                json!({ "transferred": false, "error": e.to_string() })
            }
        }
    }

    /// Mark `record` FAILED and build the error returned to the caller
    async fn fail_backup(
        &self,
        mut record: BackupRecord,
        cause: BackstopError,
        actor: Option<&str>,
    ) -> BackstopError {
        let backup_id = record.backup_id.clone();
        error!(backup_id = %backup_id, error = %cause, "Backup failed");
        record_backup_finished(false, 0);

        if record.mark_failed(cause.to_string()).is_ok() {
            if let Err(e) = self.store.update_backup(&record).await {
                error!(backup_id = %backup_id, error = %e, "Failed to mark backup as failed");
            }
        }
        self.progress.fail_tracker(&backup_id, cause.to_string());
        self.audit(
            AuditEvent::new("BACKUP_CREATE", AuditStatus::Failure)
                .with_context(json!({ "actor": actor, "backupId": backup_id }))
                .with_details(json!({ "type": record.backup_type, "error": cause.to_string() })),
        )
        .await;

        BackstopError::BackupFailed {
            backup_id,
            source: Box::new(cause),
        }
    }

    /// Restore application state from a COMPLETED backup
    pub async fn restore_from_backup(
        &self,
        backup_id: &str,
        request: RestoreRequest,
        actor: Option<&str>,
    ) -> Result<RestoreOutcome> {
        let record = self.get_backup(backup_id).await?;
        if record.status != BackupStatus::Completed {
            return Err(BackstopError::invalid_state(format!(
                "Backup {backup_id} is {}, only COMPLETED backups can be restored",
                record.status
            )));
        }

        let operation_id = generate_operation_id("restore");
        self.progress.create_tracker(&operation_id, OperationType::Restore);
        let progress = self.progress.handle(&operation_id);
        info!(backup_id, operation_id = %operation_id, "Restore started");
        self.audit(
            AuditEvent::new("BACKUP_RESTORE", AuditStatus::Initiated)
                .with_context(restore_context(actor, backup_id, &operation_id)),
        )
        .await;

        let mut snapshot_id = None;
        let result = async {
            let location = self.locate_artifact(&record, &progress).await?;
            self.verify_checksum(&record, &location).await?;

            let mut options = request.options.clone();
            if options.encryption_key.is_none() {
                options.encryption_key = record.encryption_key.clone();
            }
            let prepared = self
                .detector
                .prepare(&location, options.encryption_key.as_deref(), &progress)
                .await?;
            if prepared.backup_type != record.backup_type {
                warn!(
                    backup_id,
                    recorded = %record.backup_type,
                    detected = %prepared.backup_type,
                    "Artifact type differs from the record; restoring as detected"
                );
            }
            self.detector.validate_prepared(&prepared, &progress).await?;

            if request.create_pre_restore_snapshot {
                snapshot_id = self.pre_restore_snapshot(&record, &progress, actor).await;
            }
            self.detector
                .restore_prepared(&prepared, &options, &progress)
                .await
        }
        .await;

        match result {
            Ok(report) => {
                record_restore(true);
                info!(backup_id, components = ?report.components, "Restore completed");
                self.progress.complete_tracker(
                    &operation_id,
                    "Restore completed",
                    Some(json!({ "components": report.components })),
                );
                self.audit(
                    AuditEvent::new("BACKUP_RESTORE", AuditStatus::Success)
                        .with_context(restore_context(actor, backup_id, &operation_id))
                        .with_details(json!({
                            "components": report.components,
                            "preRestoreSnapshotId": snapshot_id,
                        })),
                )
                .await;
                Ok(RestoreOutcome {
                    backup_id: backup_id.to_string(),
                    operation_id,
                    pre_restore_snapshot_id: snapshot_id,
                    report,
                })
            }
            Err(e) => {
                record_restore(false);
                error!(backup_id, error = %e, "Restore failed");
                self.progress.fail_tracker(&operation_id, e.to_string());
                self.audit(
                    AuditEvent::new("BACKUP_RESTORE", AuditStatus::Failure)
                        .with_context(restore_context(actor, backup_id, &operation_id))
                        .with_details(json!({
                            "error": e.to_string(),
                            "preRestoreSnapshotId": snapshot_id,
                        })),
                )
                .await;
                Err(BackstopError::RestoreFailed {
                    backup_id: backup_id.to_string(),
                    source: Box::new(e),
                })
            }
        }
    }

    /// Local artifact path, downloading it back when only the offsite copy
    /// remains
    async fn locate_artifact(
        &self,
        record: &BackupRecord,
        progress: &ProgressHandle,
    ) -> Result<PathBuf> {
        if tokio::fs::try_exists(&record.location).await.unwrap_or(false) {
            return Ok(record.location.clone());
        }

        let replicated = record.metadata["offsite"]["transferred"]
            .as_bool()
            .unwrap_or(false);
        let file_name = record.location.file_name().map(|n| n.to_string_lossy().into_owned());
        match file_name {
            Some(name) if replicated => {
                info!(
                    backup_id = %record.backup_id,
                    "Local artifact missing, downloading offsite copy"
                );
                let parent = record
                    .location
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| self.config.backup_dir.clone());
                self.offsite.download_from_offsite(&name, &parent, progress).await
            }
            _ => Err(BackstopError::not_found(format!(
                "Backup file {}",
                record.location.display()
            ))),
        }
    }

    async fn verify_checksum(&self, record: &BackupRecord, location: &Path) -> Result<()> {
        let Some(expected) = record.checksum.clone() else {
            return Ok(());
        };
        let path = location.to_path_buf();
        let actual = run_blocking(move || compute_file_checksum(&path)).await?;
        if actual != expected {
            return Err(BackstopError::validation(format!(
                "Checksum mismatch for {}: expected {expected}, found {actual}",
                record.backup_id
            )));
        }
        Ok(())
    }

    /// Full-system snapshot taken before a restore; `None` if it failed
    async fn pre_restore_snapshot(
        &self,
        record: &BackupRecord,
        progress: &ProgressHandle,
        actor: Option<&str>,
    ) -> Option<String> {
        progress.stage(Stage::CreatingPreRestoreSnapshot, "Creating pre-restore snapshot");
        let mut request = BackupRequest::new(BackupType::FullSystem)
            .with_encryption(false)
            .with_origin(BackupOrigin::PreRestore {
                restore_of: record.backup_id.clone(),
            })
            .with_description(format!("Automatic snapshot before restoring {}", record.backup_id));
        request.skip_offsite = true;

        match self.create_backup(request, actor).await {
            Ok(snapshot) => {
                info!(
                    backup_id = %record.backup_id,
                    snapshot_id = %snapshot.backup_id,
                    "Pre-restore snapshot created"
                );
                Some(snapshot.backup_id)
            }
            Err(e) => {
                warn!(
                    backup_id = %record.backup_id,
                    error = %e,
                    "Pre-restore snapshot failed; continuing with restore"
                );
                self.audit(
                    AuditEvent::new("PRE_RESTORE_SNAPSHOT", AuditStatus::Failure)
                        .with_context(json!({ "actor": actor, "backupId": record.backup_id }))
                        .with_details(json!({ "error": e.to_string() })),
                )
                .await;
                None
            }
        }
    }

    /// Records matching `filter`, newest first
    pub async fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<BackupRecord>> {
        self.store.list_backups(filter).await
    }

    pub async fn get_backup(&self, backup_id: &str) -> Result<BackupRecord> {
        self.store
            .get_backup(backup_id)
            .await?
            .ok_or_else(|| BackstopError::not_found(format!("Backup {backup_id}")))
    }

    /// Delete the record and its artifact; a missing file is tolerated
    pub async fn delete_backup(&self, backup_id: &str, actor: Option<&str>) -> Result<()> {
        let record = self.get_backup(backup_id).await?;
        self.remove_backup(&record).await?;
        info!(backup_id, "Backup deleted");
        self.audit(
            AuditEvent::new("BACKUP_DELETE", AuditStatus::Success)
                .with_context(json!({ "actor": actor, "backupId": backup_id }))
                .with_details(json!({ "type": record.backup_type, "size": record.size })),
        )
        .await;
        Ok(())
    }

    pub(crate) async fn remove_backup(&self, record: &BackupRecord) -> Result<()> {
        match tokio::fs::remove_file(&record.location).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(backup_id = %record.backup_id, "Backup file already missing");
            }
            Err(e) => return Err(e.into()),
        }
        self.store.delete_backup(&record.backup_id).await?;
        Ok(())
    }

    /// Check the artifact's checksum and structure
    pub async fn validate_backup(&self, backup_id: &str) -> Result<ValidationReport> {
        let record = self.get_backup(backup_id).await?;
        if record.status != BackupStatus::Completed {
            return Ok(ValidationReport::invalid(
                record.backup_type,
                format!("Backup is {}", record.status),
            ));
        }
        if !tokio::fs::try_exists(&record.location).await.unwrap_or(false) {
            return Ok(ValidationReport::invalid(
                record.backup_type,
                format!("Backup file {} is missing", record.location.display()),
            ));
        }
        if let Err(e) = self.verify_checksum(&record, &record.location).await {
            return Ok(ValidationReport::invalid(record.backup_type, e.to_string()));
        }

        let mut report = self
            .strategy(record.backup_type)
            .validate_backup(&record.location, record.encryption_key.as_deref())
            .await?;
        let checksum = if record.checksum.is_some() { "verified" } else { "unavailable" };
        report.details = match report.details {
            Value::Object(mut map) => {
                map.insert("checksum".to_string(), json!(checksum));
                Value::Object(map)
            }
            other => json!({ "checksum": checksum, "strategy": other }),
        };
        Ok(report)
    }
}

fn restore_context(actor: Option<&str>, backup_id: &str, operation_id: &str) -> Value {
    json!({ "actor": actor, "backupId": backup_id, "operationId": operation_id })
}
