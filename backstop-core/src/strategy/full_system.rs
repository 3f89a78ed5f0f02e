/*!
Full-system backups.

One uncompressed tar container holding:

| entry                  | content                                        |
|------------------------|------------------------------------------------|
| `database.sql.gz`      | database dump ([`DatabaseStrategy`])           |
| `files.tar.gz`         | application files ([`FilesStrategy`])          |
| `config.tar.gz`        | allowlisted configuration files                |
| `system-settings.json` | application settings records from the store    |
| `system-info.json`     | manifest: id, timestamp, component results     |

The container as a whole is optionally encrypted.
*/

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::files::{archive_paths, extract_archive, list_archive, ExcludeFilter};
use super::{
    decompress_if_needed, decrypt_if_needed, prepare_input, seal_artifact, BackupArtifact,
    BackupOptions, BackupStrategy, DatabaseStrategy, FilesStrategy, RestoreOptions, RestoreReport,
    ValidationReport, WorkDir,
};
use crate::config::EngineConfig;
use crate::encryption::{run_blocking, EncryptionEngine};
use crate::metadata::BackupType;
use crate::progress::{ProgressHandle, Stage};
use crate::store::MetadataStore;
use crate::{BackstopError, Result};

pub const DATABASE_ENTRY: &str = "database.sql.gz";
pub const FILES_ENTRY: &str = "files.tar.gz";
pub const CONFIG_ENTRY: &str = "config.tar.gz";
pub const SETTINGS_ENTRY: &str = "system-settings.json";
pub const MANIFEST_ENTRY: &str = "system-info.json";

/// Entries whose presence identifies a full-system container
pub const FULL_SYSTEM_MARKERS: [&str; 3] = [DATABASE_ENTRY, FILES_ENTRY, MANIFEST_ENTRY];

/// Application record kinds exported into `system-settings.json`
pub const SETTINGS_KINDS: [&str; 3] = ["school", "academic_years", "grading_scales"];

/// True if `entries` contains every full-system marker
pub fn has_full_system_markers<S: AsRef<str>>(entries: &[S]) -> bool {
    FULL_SYSTEM_MARKERS
        .iter()
        .all(|marker| entries.iter().any(|e| entry_name(e.as_ref()) == *marker))
}

fn entry_name(path: &str) -> &str {
    path.trim_start_matches("./")
}

pub struct FullSystemStrategy {
    config: Arc<EngineConfig>,
    engine: EncryptionEngine,
    database: Arc<DatabaseStrategy>,
    files: Arc<FilesStrategy>,
    store: Arc<dyn MetadataStore>,
}

impl FullSystemStrategy {
    pub fn new(
        config: Arc<EngineConfig>,
        engine: EncryptionEngine,
        database: Arc<DatabaseStrategy>,
        files: Arc<FilesStrategy>,
        store: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            config,
            engine,
            database,
            files,
            store,
        }
    }

    /// Fetch each settings kind independently; failures become `null`
    async fn export_settings(&self) -> (Value, Vec<String>) {
        let mut records = Map::new();
        let mut failed = Vec::new();
        for kind in SETTINGS_KINDS {
            match self.store.fetch_domain_records(kind).await {
                Ok(value) => {
                    records.insert(kind.to_string(), value);
                }
                Err(e) => {
                    warn!(kind, error = %e, "Failed to export settings records");
                    records.insert(kind.to_string(), Value::Null);
                    failed.push(kind.to_string());
                }
            }
        }
        (
            json!({
                "exportedAt": Utc::now(),
                "records": records,
            }),
            failed,
        )
    }

    /// Archive the configuration allowlist, skipping absent entries
    async fn archive_config(&self, dest: PathBuf, level: u32) -> Result<Value> {
        let mut present = Vec::new();
        let mut skipped = Vec::new();
        for path in &self.config.config_paths {
            let resolved = self.config.resolve_app_path(path);
            if resolved.exists() {
                present.push(resolved);
            } else {
                skipped.push(path.clone());
            }
        }
        if !skipped.is_empty() {
            info!(skipped = ?skipped, "Configuration paths not present, skipping");
        }

        let base = self.config.app_root.clone();
        let roots = present.clone();
        let stats = run_blocking(move || {
            archive_paths(&roots, &base, &dest, level, &ExcludeFilter::default())
        })
        .await?;

        Ok(json!({
            "included": present,
            "skipped": skipped,
            "stats": stats,
        }))
    }
}

#[async_trait]
impl BackupStrategy for FullSystemStrategy {
    fn backup_type(&self) -> BackupType {
        BackupType::FullSystem
    }

    async fn create_backup(
        &self,
        options: &BackupOptions,
        progress: &ProgressHandle,
    ) -> Result<BackupArtifact> {
        let work = WorkDir::create(&self.config.scratch_dir(), &options.backup_id)?;
        tokio::fs::create_dir_all(&options.output_dir).await?;

        let database = self
            .database
            .create_backup(&options.component("database", work.path()), progress)
            .await?;

        let files = self
            .files
            .create_backup(&options.component("files", work.path()), progress)
            .await?;

        progress.stage(Stage::CollectingFiles, "Archiving configuration");
        let config = self
            .archive_config(work.join(CONFIG_ENTRY), options.compression_level)
            .await?;

        let (settings, failed_settings) = self.export_settings().await;
        tokio::fs::write(work.join(SETTINGS_ENTRY), serde_json::to_vec_pretty(&settings)?).await?;

        let manifest = json!({
            "backupId": options.backup_id,
            "timestamp": Utc::now(),
            "version": env!("CARGO_PKG_VERSION"),
            "components": {
                "database": database,
                "files": files,
                "config": config,
                "settings": { "failed": failed_settings },
            },
            "environment": environment_info(),
        });
        tokio::fs::write(work.join(MANIFEST_ENTRY), serde_json::to_vec_pretty(&manifest)?).await?;

        progress.stage(Stage::Compressing, "Bundling full-system container");
        let container = options
            .output_dir
            .join(BackupType::FullSystem.artifact_file_name(&options.backup_id, false));
        let entries: Vec<(PathBuf, &'static str)> = [
            DATABASE_ENTRY,
            FILES_ENTRY,
            CONFIG_ENTRY,
            SETTINGS_ENTRY,
            MANIFEST_ENTRY,
        ]
        .into_iter()
        .map(|name| (work.join(name), name))
        .collect();
        let dest = container.clone();
        run_blocking(move || write_container(&dest, &entries)).await?;

        let (location, encrypted) =
            seal_artifact(&self.engine, container, options, progress).await?;
        let size = tokio::fs::metadata(&location).await?.len();
        info!(backup_id = %options.backup_id, size, encrypted, "Full-system container written");

        Ok(BackupArtifact {
            backup_id: options.backup_id.clone(),
            location,
            size,
            encrypted,
            timestamp: Utc::now(),
            details: json!({
                "components": [
                    DATABASE_ENTRY,
                    FILES_ENTRY,
                    CONFIG_ENTRY,
                    SETTINGS_ENTRY,
                    MANIFEST_ENTRY,
                ],
                "settingsFailed": failed_settings,
            }),
        })
    }

    async fn restore_from_backup(
        &self,
        path: &Path,
        options: &RestoreOptions,
        progress: &ProgressHandle,
    ) -> Result<RestoreReport> {
        let work = WorkDir::create(&self.config.scratch_dir(), "full-restore")?;
        let key = options.encryption_key.as_deref();
        let plain = prepare_input(&self.engine, path, key, &work, progress).await?;
        self.restore_prepared(&plain, options, progress).await
    }

    async fn restore_prepared(
        &self,
        plain: &Path,
        options: &RestoreOptions,
        progress: &ProgressHandle,
    ) -> Result<RestoreReport> {
        let work = WorkDir::create(&self.config.scratch_dir(), "full-unpack")?;
        let unpacked = work.join("container");
        tokio::fs::create_dir_all(&unpacked).await?;
        {
            let (src, dst) = (plain.to_path_buf(), unpacked.clone());
            run_blocking(move || extract_archive(&src, &dst, super::OverwriteMode::Overwrite))
                .await?;
        }

        let manifest_path = unpacked.join(MANIFEST_ENTRY);
        let manifest: Value = match tokio::fs::read(&manifest_path).await {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(_) => {
                return Err(BackstopError::validation(
                    "Full-system container has no manifest",
                ))
            }
        };

        let component_options = RestoreOptions {
            encryption_key: None,
            ..options.clone()
        };
        let mut components = Vec::new();

        let database_dump = unpacked.join(DATABASE_ENTRY);
        if options.restore_database && database_dump.exists() {
            let sql_file =
                decompress_if_needed(&database_dump, &work, &ProgressHandle::detached()).await?;
            self.database
                .restore_prepared(&sql_file, &component_options, progress)
                .await?;
            components.push("database".to_string());
        }

        let files_archive = unpacked.join(FILES_ENTRY);
        if options.restore_files && files_archive.exists() {
            self.files
                .restore_prepared(&files_archive, &component_options, progress)
                .await?;
            components.push("files".to_string());
        }

        let config_archive = unpacked.join(CONFIG_ENTRY);
        if options.restore_config && config_archive.exists() {
            let target = options
                .target_dir
                .clone()
                .unwrap_or_else(|| self.config.app_root.clone());
            tokio::fs::create_dir_all(&target).await?;
            let mode = options.overwrite;
            run_blocking(move || extract_archive(&config_archive, &target, mode)).await?;
            components.push("config".to_string());
        }

        info!(components = ?components, "Full-system restore finished");
        Ok(RestoreReport {
            backup_type: BackupType::FullSystem,
            components,
            details: json!({
                "manifestBackupId": manifest.get("backupId").cloned().unwrap_or(Value::Null),
                "manifestTimestamp": manifest.get("timestamp").cloned().unwrap_or(Value::Null),
            }),
        })
    }

    async fn validate_backup(
        &self,
        path: &Path,
        encryption_key: Option<&str>,
    ) -> Result<ValidationReport> {
        let work = WorkDir::create(&self.config.scratch_dir(), "full-validate")?;
        let plain = match decrypt_if_needed(
            &self.engine,
            path,
            encryption_key,
            &work,
            &ProgressHandle::detached(),
        )
        .await
        {
            Ok(plain) => plain,
            Err(e @ (BackstopError::EncryptedWithoutKey | BackstopError::NotFound(_))) => {
                return Err(e)
            }
            Err(e) => return Ok(ValidationReport::invalid(BackupType::FullSystem, e.to_string())),
        };

        let entries = match run_blocking(move || list_archive(&plain)).await {
            Ok(entries) => entries,
            Err(e) => return Ok(ValidationReport::invalid(BackupType::FullSystem, e.to_string())),
        };
        let names: Vec<&str> = entries.iter().map(|e| entry_name(&e.path)).collect();
        let missing: Vec<String> = FULL_SYSTEM_MARKERS
            .iter()
            .filter(|marker| !names.contains(*marker))
            .map(|marker| format!("Missing component {marker}"))
            .collect();

        if missing.is_empty() {
            Ok(ValidationReport::ok(
                BackupType::FullSystem,
                json!({ "entries": names }),
            ))
        } else {
            Ok(ValidationReport {
                valid: false,
                backup_type: BackupType::FullSystem,
                errors: missing,
                details: json!({ "entries": names }),
            })
        }
    }
}

/// Write an uncompressed tar of `(source, entry name)` pairs
fn write_container(dest: &Path, entries: &[(PathBuf, &str)]) -> Result<()> {
    let mut builder = tar::Builder::new(BufWriter::new(File::create(dest)?));
    for (source, name) in entries {
        let mut file = File::open(source)?;
        builder.append_file(name, &mut file).map_err(|e| {
            BackstopError::archive(format!("Failed to add {name} to container: {e}"))
        })?;
    }
    let mut output = builder
        .into_inner()
        .map_err(|e| BackstopError::archive(format!("Failed to finish container: {e}")))?;
    output.flush()?;
    Ok(())
}

fn environment_info() -> Value {
    json!({
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "cpus": num_cpus::get(),
        "hostname": std::env::var("HOSTNAME").ok(),
        "engineVersion": env!("CARGO_PKG_VERSION"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_detection() {
        assert!(has_full_system_markers(&[
            "database.sql.gz",
            "files.tar.gz",
            "config.tar.gz",
            "./system-info.json",
        ]));
        assert!(!has_full_system_markers(&["database.sql.gz", "files.tar.gz"]));
        assert!(!has_full_system_markers::<&str>(&[]));
    }
}
