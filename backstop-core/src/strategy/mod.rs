/*!
Backup strategies.

One implementation per [`BackupType`]: [`DatabaseStrategy`] dumps and
replays the relational database, [`FilesStrategy`] archives the application
file tree, and [`FullSystemStrategy`] composes both with configuration and
application settings into a single container. The orchestrator picks one with
a single match on the record's type.
*/

pub mod database;
pub mod files;
pub mod full_system;

pub use database::DatabaseStrategy;
pub use files::FilesStrategy;
pub use full_system::FullSystemStrategy;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::compression::{is_gzip, CompressionAdapter, GzipCompressor};
use crate::encryption::{has_encrypted_suffix, looks_encrypted, run_blocking, EncryptionEngine};
use crate::metadata::BackupType;
use crate::progress::{ProgressHandle, Stage};
use crate::{BackstopError, Result};

/// Inputs shared by every strategy's `create_backup`
#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub backup_id: String,
    /// Directory the finished artifact is written to
    pub output_dir: PathBuf,
    pub encrypt: bool,
    /// Secret used when `encrypt` is set
    pub encryption_key: Option<String>,
    /// gzip level 0-9
    pub compression_level: u32,
    /// Files strategy: paths to archive; empty means the configured defaults
    pub include_paths: Vec<PathBuf>,
    /// Files strategy: patterns excluded on top of the configured ones
    pub exclude_patterns: Vec<String>,
}

impl BackupOptions {
    pub fn new<S: Into<String>, P: Into<PathBuf>>(backup_id: S, output_dir: P) -> Self {
        Self {
            backup_id: backup_id.into(),
            output_dir: output_dir.into(),
            encrypt: false,
            encryption_key: None,
            compression_level: 6,
            include_paths: Vec::new(),
            exclude_patterns: Vec::new(),
        }
    }

    pub fn encrypted_with<S: Into<String>>(mut self, key: S) -> Self {
        self.encrypt = true;
        self.encryption_key = Some(key.into());
        self
    }

    /// Same options for an inner component: unencrypted, written to `dir`
    pub(crate) fn component(&self, backup_id: &str, dir: &Path) -> Self {
        Self {
            backup_id: backup_id.to_string(),
            output_dir: dir.to_path_buf(),
            encrypt: false,
            encryption_key: None,
            ..self.clone()
        }
    }
}

/// A finished artifact as reported by a strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupArtifact {
    pub backup_id: String,
    pub location: PathBuf,
    pub size: u64,
    /// Whether the artifact actually ended up encrypted
    pub encrypted: bool,
    pub timestamp: DateTime<Utc>,
    /// Strategy-specific facts (paths archived, tool used, components)
    #[serde(default)]
    pub details: serde_json::Value,
}

/// How extraction treats files that already exist at the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwriteMode {
    /// Replace existing files
    #[default]
    Overwrite,
    /// Keep an existing file when it is newer than the archived copy
    KeepNewer,
}

/// Inputs shared by every strategy's `restore_from_backup`
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub encryption_key: Option<String>,
    /// Database: drop and recreate objects before replaying the dump
    pub drop_existing: bool,
    /// Files: extraction root; defaults to the application root
    pub target_dir: Option<PathBuf>,
    pub overwrite: OverwriteMode,
    /// Full system: component switches
    pub restore_database: bool,
    pub restore_files: bool,
    pub restore_config: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            encryption_key: None,
            drop_existing: false,
            target_dir: None,
            overwrite: OverwriteMode::default(),
            restore_database: true,
            restore_files: true,
            restore_config: true,
        }
    }
}

/// What a restore did
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub backup_type: BackupType,
    /// Components restored, e.g. `["database", "files"]`
    pub components: Vec<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Result of structural validation of an artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub backup_type: BackupType,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl ValidationReport {
    pub fn ok(backup_type: BackupType, details: serde_json::Value) -> Self {
        Self {
            valid: true,
            backup_type,
            errors: Vec::new(),
            details,
        }
    }

    pub fn invalid<S: Into<String>>(backup_type: BackupType, error: S) -> Self {
        Self {
            valid: false,
            backup_type,
            errors: vec![error.into()],
            details: serde_json::Value::Null,
        }
    }
}

/// Type-specific backup, restore and validation
#[async_trait]
pub trait BackupStrategy: Send + Sync {
    fn backup_type(&self) -> BackupType;

    /// Produce the artifact for `options.backup_id` in `options.output_dir`
    async fn create_backup(
        &self,
        options: &BackupOptions,
        progress: &ProgressHandle,
    ) -> Result<BackupArtifact>;

    /// Restore application state from the artifact at `path`, decrypting
    /// and decompressing it first
    async fn restore_from_backup(
        &self,
        path: &Path,
        options: &RestoreOptions,
        progress: &ProgressHandle,
    ) -> Result<RestoreReport>;

    /// Restore from an artifact already passed through [`prepare_input`]
    async fn restore_prepared(
        &self,
        plain: &Path,
        options: &RestoreOptions,
        progress: &ProgressHandle,
    ) -> Result<RestoreReport>;

    /// Check that `path` is a readable artifact of this type
    async fn validate_backup(&self, path: &Path, encryption_key: Option<&str>)
        -> Result<ValidationReport>;
}

/// Per-operation scratch directory, removed on drop
#[derive(Debug)]
pub struct WorkDir {
    dir: tempfile::TempDir,
}

impl WorkDir {
    /// Create `{root}/{label}-XXXX`, creating `root` if needed
    pub fn create(root: &Path, label: &str) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{label}-"))
            .tempdir_in(root)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join<P: AsRef<Path>>(&self, name: P) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// Encrypt `path` in place when requested and a key is available
///
/// # Returns
/// The final artifact path and whether it is encrypted
pub(crate) async fn seal_artifact(
    engine: &EncryptionEngine,
    path: PathBuf,
    options: &BackupOptions,
    progress: &ProgressHandle,
) -> Result<(PathBuf, bool)> {
    if !options.encrypt {
        return Ok((path, false));
    }
    match options.encryption_key.as_deref() {
        Some(key) => {
            progress.stage(Stage::Encrypting, "Encrypting backup");
            let sealed = engine.seal_in_place(&path, key).await?;
            Ok((sealed, true))
        }
        None => {
            tracing::warn!(
                backup_id = %options.backup_id,
                "Encryption requested without a key; artifact left unencrypted"
            );
            Ok((path, false))
        }
    }
}

/// Return a plaintext path for `path`, decrypting into `work` if needed
///
/// A `.enc` suffix always requires a key. Without the suffix the file is
/// decrypted only when a key is supplied and its header looks like
/// ciphertext rather than a known format.
pub(crate) async fn decrypt_if_needed(
    engine: &EncryptionEngine,
    path: &Path,
    key: Option<&str>,
    work: &WorkDir,
    progress: &ProgressHandle,
) -> Result<PathBuf> {
    let flagged = has_encrypted_suffix(path);
    let sniffed = !flagged && key.is_some() && {
        let header = read_header(path, 512).await?;
        !is_gzip(&header) && !is_tar_header(path).await? && looks_encrypted(&header)
    };

    if !(flagged || sniffed) {
        return Ok(path.to_path_buf());
    }
    let key = key.ok_or(BackstopError::EncryptedWithoutKey)?;

    progress.stage(Stage::Decrypting, "Decrypting backup");
    let stem = file_stem(path).trim_end_matches(".enc").to_string();
    let plain = work.join(format!("decrypted-{stem}"));
    engine.decrypt_file(path, &plain, key).await?;
    Ok(plain)
}

/// Return an uncompressed path for `path`, gunzipping into `work` if needed
pub(crate) async fn decompress_if_needed(
    path: &Path,
    work: &WorkDir,
    progress: &ProgressHandle,
) -> Result<PathBuf> {
    if !is_gzip(&read_header(path, 2).await?) {
        return Ok(path.to_path_buf());
    }

    progress.stage(Stage::Uncompressing, "Decompressing backup");
    let name = file_stem(path);
    let stem = match name.strip_suffix(".tgz") {
        Some(base) => format!("{base}.tar"),
        None => name.trim_end_matches(".gz").to_string(),
    };
    let expanded = work.join(format!("expanded-{stem}"));
    let (src, dst) = (path.to_path_buf(), expanded.clone());
    run_blocking(move || GzipCompressor::new().decompress_file(&src, &dst)).await?;
    Ok(expanded)
}

/// Decrypt then decompress `path` into `work`
///
/// The result is what every strategy's `restore_prepared` consumes. Stages
/// are reported in restore order: DECRYPTING, then UNCOMPRESSING, each only
/// when the step actually runs.
pub async fn prepare_input(
    engine: &EncryptionEngine,
    path: &Path,
    key: Option<&str>,
    work: &WorkDir,
    progress: &ProgressHandle,
) -> Result<PathBuf> {
    let plain = decrypt_if_needed(engine, path, key, work, progress).await?;
    decompress_if_needed(&plain, work, progress).await
}

fn file_stem(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string())
}

/// First `len` bytes of a file (fewer if it is shorter)
pub(crate) async fn read_header(path: &Path, len: usize) -> Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;

    let file = tokio::fs::File::open(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            BackstopError::not_found(format!("Backup file {}", path.display()))
        } else {
            BackstopError::Io(e)
        }
    })?;
    let mut header = Vec::with_capacity(len);
    file.take(len as u64).read_to_end(&mut header).await?;
    Ok(header)
}

/// True if the file carries a POSIX tar `ustar` magic at offset 257
pub(crate) async fn is_tar_header(path: &Path) -> Result<bool> {
    let header = read_header(path, 512).await?;
    Ok(header.len() >= 262 && &header[257..262] == b"ustar")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::KdfParams;
    use tempfile::TempDir;

    fn engine() -> EncryptionEngine {
        EncryptionEngine::new(KdfParams::new(1024, 1, 1))
    }

    #[test]
    fn test_work_dir_is_removed_on_drop() {
        let root = TempDir::new().unwrap();
        let path = {
            let work = WorkDir::create(&root.path().join(".work"), "files_1").unwrap();
            std::fs::write(work.join("scratch.bin"), b"x").unwrap();
            work.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_seal_without_key_stays_plain() {
        let root = TempDir::new().unwrap();
        let artifact = root.path().join("db.sql.gz");
        std::fs::write(&artifact, b"data").unwrap();
        let mut options = BackupOptions::new("db", root.path());
        options.encrypt = true;

        let progress = ProgressHandle::detached();
        let (path, encrypted) = seal_artifact(&engine(), artifact.clone(), &options, &progress)
            .await
            .unwrap();
        assert_eq!(path, artifact);
        assert!(!encrypted);
    }

    #[tokio::test]
    async fn test_decrypt_requires_key_for_enc_suffix() {
        let root = TempDir::new().unwrap();
        let artifact = root.path().join("db.sql.gz.enc");
        std::fs::write(&artifact, [0u8; 64]).unwrap();
        let work = WorkDir::create(root.path(), "op").unwrap();

        let err = decrypt_if_needed(&engine(), &artifact, None, &work, &ProgressHandle::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, BackstopError::EncryptedWithoutKey));
    }

    #[tokio::test]
    async fn test_sealed_roundtrip_through_decrypt() {
        let root = TempDir::new().unwrap();
        let artifact = root.path().join("files.tar.gz");
        std::fs::write(&artifact, b"archive bytes").unwrap();
        let options = BackupOptions::new("files", root.path()).encrypted_with("k".repeat(40));

        let engine = engine();
        let progress = ProgressHandle::detached();
        let (sealed, encrypted) = seal_artifact(&engine, artifact.clone(), &options, &progress)
            .await
            .unwrap();
        assert!(encrypted);
        assert!(!artifact.exists());

        let work = WorkDir::create(root.path(), "restore").unwrap();
        let key = options.encryption_key.as_deref();
        let plain = decrypt_if_needed(&engine, &sealed, key, &work, &progress)
            .await
            .unwrap();
        assert_eq!(std::fs::read(plain).unwrap(), b"archive bytes");
    }

    #[tokio::test]
    async fn test_prepare_input_decrypts_then_decompresses() {
        use crate::progress::{OperationType, ProgressTracker};
        use std::time::Duration;

        let root = TempDir::new().unwrap();
        let artifact = root.path().join("database_1.sql.gz");
        let dump = b"-- PostgreSQL database dump\nCREATE TABLE t (id int);\n";
        GzipCompressor::new()
            .compress_file(&write_tmp(&root, "dump.sql", dump), &artifact)
            .unwrap();
        let engine = engine();
        let key = "k".repeat(40);
        let sealed = engine.seal_in_place(&artifact, &key).await.unwrap();

        let tracker = ProgressTracker::new(Duration::from_secs(60));
        tracker.create_tracker("restore_1", OperationType::Restore);
        let work = WorkDir::create(root.path(), "restore").unwrap();
        let progress = tracker.handle("restore_1");
        let plain = prepare_input(&engine, &sealed, Some(key.as_str()), &work, &progress)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&plain).unwrap(), dump);
        assert!(plain.to_string_lossy().ends_with("expanded-decrypted-database_1.sql"));
        let stages: Vec<Stage> = tracker.history("restore_1").iter().map(|e| e.stage).collect();
        assert_eq!(stages, vec![Stage::Initiated, Stage::Decrypting, Stage::Uncompressing]);
    }

    #[tokio::test]
    async fn test_prepare_input_passes_plain_tar_through() {
        let root = TempDir::new().unwrap();
        let tar = root.path().join("container.tar");
        {
            let mut builder = tar::Builder::new(std::fs::File::create(&tar).unwrap());
            let source = write_tmp(&root, "manifest.json", b"{}");
            builder.append_path_with_name(&source, "system-info.json").unwrap();
            builder.finish().unwrap();
        }
        let work = WorkDir::create(root.path(), "restore").unwrap();
        let plain = prepare_input(&engine(), &tar, None, &work, &ProgressHandle::detached())
            .await
            .unwrap();
        assert_eq!(plain, tar);
    }

    fn write_tmp(root: &TempDir, name: &str, body: &[u8]) -> PathBuf {
        let path = root.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }
}
