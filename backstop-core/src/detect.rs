/*!
Backup type detection and restore dispatch.

Detection tries the file name first (`database_…`, `….tar.gz`, …) and falls
back to looking at the content: gzip and tar signatures, dump statements,
and the full-system container markers. Ciphertext is recognised by the
`.enc` suffix or, failing that, by a non-printable byte heuristic on the
header. An ambiguous file is reported as [`DetectedType::Unknown`] rather
than as an error.
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::compression::{is_gzip, read_gzip_prefix};
use crate::config::EngineConfig;
use crate::encryption::{has_encrypted_suffix, looks_encrypted, run_blocking, EncryptionEngine};
use crate::metadata::BackupType;
use crate::progress::{ProgressHandle, Stage};
use crate::strategy::database::{looks_like_sql_dump, sql_prefix};
use crate::strategy::files::list_archive;
use crate::strategy::full_system::has_full_system_markers;
use crate::strategy::{
    prepare_input, read_header, BackupStrategy, DatabaseStrategy, FilesStrategy,
    FullSystemStrategy, RestoreOptions, RestoreReport, WorkDir,
};
use crate::{BackstopError, Result};

/// Classified artifact type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectedType {
    Database,
    Files,
    FullSystem,
    Unknown,
}

impl DetectedType {
    pub fn backup_type(self) -> Option<BackupType> {
        match self {
            DetectedType::Database => Some(BackupType::Database),
            DetectedType::Files => Some(BackupType::Files),
            DetectedType::FullSystem => Some(BackupType::FullSystem),
            DetectedType::Unknown => None,
        }
    }
}

impl From<BackupType> for DetectedType {
    fn from(value: BackupType) -> Self {
        match value {
            BackupType::Database => DetectedType::Database,
            BackupType::Files => DetectedType::Files,
            BackupType::FullSystem => DetectedType::FullSystem,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    FileName,
    Content,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub detected: DetectedType,
    pub encrypted: bool,
    pub method: DetectionMethod,
}

/// Human-readable summary of an artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub detection: Detection,
    /// Archive entries, or the first dump lines for a database backup
    pub contents: Vec<String>,
}

/// What a restore of an artifact would do
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestorePreview {
    pub backup_type: DetectedType,
    pub encrypted: bool,
    pub will_restore: Vec<String>,
    pub warnings: Vec<String>,
    pub contents: Vec<String>,
}

/// Entries listed in info output before truncation
const CONTENTS_LIMIT: usize = 50;

/// Guess the type from the file name alone
pub fn detect_from_file_name(path: &Path) -> Option<BackupType> {
    let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
    let stem = name.strip_suffix(".enc").unwrap_or(&name);

    if stem.starts_with("full_system_") || stem.starts_with("full-system") {
        return Some(BackupType::FullSystem);
    }
    if stem.starts_with("database_") || stem.starts_with("db_") {
        return Some(BackupType::Database);
    }
    if stem.starts_with("files_") {
        return Some(BackupType::Files);
    }
    if stem.ends_with(".sql.gz") || stem.ends_with(".sql") {
        return Some(BackupType::Database);
    }
    if stem.ends_with(".tar.gz") || stem.ends_with(".tgz") {
        return Some(BackupType::Files);
    }
    // A bare .tar may be either kind; the manifest markers decide
    None
}

/// An artifact decrypted and decompressed into scratch space, ready to
/// restore. The scratch directory lives as long as this value.
#[derive(Debug)]
pub struct PreparedBackup {
    pub backup_type: BackupType,
    pub detection: Detection,
    /// Plaintext, uncompressed copy (or the artifact itself if it was both)
    pub path: PathBuf,
    _work: WorkDir,
}

/// Inspects artifacts and restores them with the matching strategy
pub struct RestoreDetector {
    config: Arc<EngineConfig>,
    engine: EncryptionEngine,
    database: Arc<DatabaseStrategy>,
    files: Arc<FilesStrategy>,
    full_system: Arc<FullSystemStrategy>,
}

impl RestoreDetector {
    pub fn new(
        config: Arc<EngineConfig>,
        engine: EncryptionEngine,
        database: Arc<DatabaseStrategy>,
        files: Arc<FilesStrategy>,
        full_system: Arc<FullSystemStrategy>,
    ) -> Self {
        Self {
            config,
            engine,
            database,
            files,
            full_system,
        }
    }

    /// The strategy for `backup_type`
    pub fn strategy(&self, backup_type: BackupType) -> &dyn BackupStrategy {
        match backup_type {
            BackupType::Database => self.database.as_ref(),
            BackupType::Files => self.files.as_ref(),
            BackupType::FullSystem => self.full_system.as_ref(),
        }
    }

    /// Determine an artifact's type
    ///
    /// # Returns
    /// `EncryptedWithoutKey` if the artifact looks encrypted and no key was
    /// given; `NotFound`/`Io` for unreadable files; otherwise a detection,
    /// possibly `Unknown`.
    pub async fn detect_backup_type(&self, path: &Path, key: Option<&str>) -> Result<Detection> {
        let flagged = has_encrypted_suffix(path);
        let header = read_header(path, 512).await?;

        if let Some(backup_type) = detect_from_file_name(path) {
            if flagged && key.is_none() {
                return Err(BackstopError::EncryptedWithoutKey);
            }
            debug!(path = %path.display(), ?backup_type, "Detected backup type from file name");
            return Ok(Detection {
                detected: backup_type.into(),
                encrypted: flagged,
                method: DetectionMethod::FileName,
            });
        }

        let sniffed = !flagged && !has_known_signature(&header) && looks_encrypted(&header);
        if !(flagged || sniffed) {
            return Ok(Detection {
                detected: classify_plain(path).await?,
                encrypted: false,
                method: DetectionMethod::Content,
            });
        }

        let key = key.ok_or(BackstopError::EncryptedWithoutKey)?;
        let work = WorkDir::create(&self.config.scratch_dir(), "detect")?;
        let plain = work.join("inspect");
        match self.engine.decrypt_file(path, &plain, key).await {
            Ok(_) => Ok(Detection {
                detected: classify_plain(&plain).await?,
                encrypted: true,
                method: DetectionMethod::Content,
            }),
            // The heuristic guessed wrong or the file is foreign
            Err(BackstopError::DecryptionFailed(_)) if sniffed => Ok(Detection {
                detected: DetectedType::Unknown,
                encrypted: false,
                method: DetectionMethod::Content,
            }),
            Err(e) => Err(e),
        }
    }

    /// Detection plus a listing of what the artifact holds
    pub async fn get_backup_info(&self, path: &Path, key: Option<&str>) -> Result<BackupInfo> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|_| BackstopError::not_found(format!("Backup file {}", path.display())))?;
        let detection = self.detect_backup_type(path, key).await?;
        let contents = self.contents(path, key, detection).await?;

        Ok(BackupInfo {
            path: path.to_path_buf(),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            detection,
            contents,
        })
    }

    /// Describe what restoring `path` with `options` would change
    pub async fn get_restore_preview(
        &self,
        path: &Path,
        options: &RestoreOptions,
    ) -> Result<RestorePreview> {
        let key = options.encryption_key.as_deref();
        let detection = self.detect_backup_type(path, key).await?;
        let contents = self.contents(path, key, detection).await?;

        let mut will_restore = Vec::new();
        let mut warnings = Vec::new();
        let target = options
            .target_dir
            .clone()
            .unwrap_or_else(|| self.config.app_root.clone());

        match detection.detected {
            DetectedType::Database => {
                will_restore.push("database".to_string());
                warnings.push("Database contents will be replaced by the dump".to_string());
            }
            DetectedType::Files => {
                will_restore.push(format!("files into {}", target.display()));
            }
            DetectedType::FullSystem => {
                if options.restore_database {
                    will_restore.push("database".to_string());
                    warnings.push("Database contents will be replaced by the dump".to_string());
                }
                if options.restore_files {
                    will_restore.push(format!("files into {}", target.display()));
                }
                if options.restore_config {
                    will_restore.push(format!("configuration into {}", target.display()));
                }
            }
            DetectedType::Unknown => {
                warnings.push("Backup type could not be determined; restore will fail".to_string());
            }
        }
        if options.drop_existing {
            warnings.push("Existing database objects will be dropped first".to_string());
        }
        if matches!(options.overwrite, crate::strategy::OverwriteMode::Overwrite)
            && !matches!(detection.detected, DetectedType::Database | DetectedType::Unknown)
        {
            warnings.push("Existing files will be overwritten".to_string());
        }

        Ok(RestorePreview {
            backup_type: detection.detected,
            encrypted: detection.encrypted,
            will_restore,
            warnings,
            contents,
        })
    }

    /// Detect the artifact's type and bring it into restorable form
    ///
    /// Emits DECRYPTING and UNCOMPRESSING, in that order, for the steps that
    /// actually run. Fails with a validation error when the type cannot be
    /// determined.
    pub async fn prepare(
        &self,
        path: &Path,
        key: Option<&str>,
        progress: &ProgressHandle,
    ) -> Result<PreparedBackup> {
        let detection = self.detect_backup_type(path, key).await?;
        let backup_type = detection.detected.backup_type().ok_or_else(|| {
            BackstopError::validation(format!(
                "Unable to determine the type of {}",
                path.display()
            ))
        })?;

        let work = WorkDir::create(&self.config.scratch_dir(), "restore")?;
        let plain = prepare_input(&self.engine, path, key, &work, progress).await?;
        debug!(path = %plain.display(), %backup_type, "Backup prepared for restore");
        Ok(PreparedBackup {
            backup_type,
            detection,
            path: plain,
            _work: work,
        })
    }

    /// Check the prepared plaintext with its strategy's validation
    pub async fn validate_prepared(
        &self,
        prepared: &PreparedBackup,
        progress: &ProgressHandle,
    ) -> Result<()> {
        progress.stage(Stage::Validating, "Validating backup contents");
        let report = self
            .strategy(prepared.backup_type)
            .validate_backup(&prepared.path, None)
            .await?;
        if !report.valid {
            return Err(BackstopError::validation(format!(
                "{} backup failed validation: {}",
                prepared.backup_type,
                report.errors.join("; ")
            )));
        }
        Ok(())
    }

    /// Hand a prepared artifact to its strategy
    pub async fn restore_prepared(
        &self,
        prepared: &PreparedBackup,
        options: &RestoreOptions,
        progress: &ProgressHandle,
    ) -> Result<RestoreReport> {
        info!(
            path = %prepared.path.display(),
            backup_type = %prepared.backup_type,
            "Restoring backup"
        );
        self.strategy(prepared.backup_type)
            .restore_prepared(&prepared.path, options, progress)
            .await
    }

    /// Prepare, validate and restore the artifact at `path`
    pub async fn restore(
        &self,
        path: &Path,
        options: &RestoreOptions,
        progress: &ProgressHandle,
    ) -> Result<RestoreReport> {
        let prepared = self
            .prepare(path, options.encryption_key.as_deref(), progress)
            .await?;
        self.validate_prepared(&prepared, progress).await?;
        self.restore_prepared(&prepared, options, progress).await
    }

    async fn contents(
        &self,
        path: &Path,
        key: Option<&str>,
        detection: Detection,
    ) -> Result<Vec<String>> {
        let work = WorkDir::create(&self.config.scratch_dir(), "info")?;
        let plain = if detection.encrypted {
            let Some(key) = key else {
                return Ok(Vec::new());
            };
            let plain = work.join("inspect");
            self.engine.decrypt_file(path, &plain, key).await?;
            plain
        } else {
            path.to_path_buf()
        };

        let mut contents = match detection.detected {
            DetectedType::Files | DetectedType::FullSystem => {
                let target = plain.clone();
                match run_blocking(move || list_archive(&target)).await {
                    Ok(entries) => entries.into_iter().map(|e| e.path).collect(),
                    Err(_) => Vec::new(),
                }
            }
            DetectedType::Database => {
                let prefix = sql_prefix(&plain).await?;
                String::from_utf8_lossy(&prefix)
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .map(str::to_string)
                    .collect()
            }
            DetectedType::Unknown => Vec::new(),
        };
        contents.truncate(CONTENTS_LIMIT);
        Ok(contents)
    }
}

/// gzip magic, `ustar`, or readable SQL
fn has_known_signature(header: &[u8]) -> bool {
    is_gzip(header) || is_ustar(header) || looks_like_sql_dump(header)
}

fn is_ustar(header: &[u8]) -> bool {
    header.len() >= 262 && &header[257..262] == b"ustar"
}

/// Classify an unencrypted artifact by content
async fn classify_plain(path: &Path) -> Result<DetectedType> {
    let header = read_header(path, 512).await?;

    if is_gzip(&header) {
        let target = path.to_path_buf();
        let inner =
            run_blocking(move || Ok(read_gzip_prefix(&target, 512).unwrap_or_default())).await?;
        if is_ustar(&inner) {
            return Ok(classify_archive(path).await);
        }
        if looks_like_sql_dump(&sql_prefix(path).await?) {
            return Ok(DetectedType::Database);
        }
        return Ok(DetectedType::Unknown);
    }

    if is_ustar(&header) {
        return Ok(classify_archive(path).await);
    }

    if looks_like_sql_dump(&read_header(path, crate::strategy::database::DUMP_PREFIX_LEN).await?) {
        return Ok(DetectedType::Database);
    }
    Ok(DetectedType::Unknown)
}

async fn classify_archive(path: &Path) -> DetectedType {
    let target = path.to_path_buf();
    match run_blocking(move || list_archive(&target)).await {
        Ok(entries) => {
            let names: Vec<String> = entries.into_iter().map(|e| e.path).collect();
            if has_full_system_markers(&names) {
                DetectedType::FullSystem
            } else {
                DetectedType::Files
            }
        }
        Err(_) => DetectedType::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_fast_path() {
        let cases = [
            ("database_20240101_000000_ab12cd34.sql.gz", Some(BackupType::Database)),
            ("files_20240101_000000_ab12cd34.tar.gz.enc", Some(BackupType::Files)),
            ("full_system_20240101_000000_ab12cd34.tar", Some(BackupType::FullSystem)),
            ("nightly.sql", Some(BackupType::Database)),
            ("assets.tgz", Some(BackupType::Files)),
            ("full-system-nightly.tar.enc", Some(BackupType::FullSystem)),
            ("snapshot.tar", None),
            ("snapshot.tar.enc", None),
            ("mystery.bin", None),
        ];
        for (name, expected) in cases {
            assert_eq!(detect_from_file_name(Path::new(name)), expected, "{name}");
        }
    }

    #[test]
    fn test_known_signatures() {
        assert!(has_known_signature(&[0x1f, 0x8b, 0x08, 0x00]));
        assert!(has_known_signature(b"-- PostgreSQL database dump"));
        assert!(!has_known_signature(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]));
    }
}
