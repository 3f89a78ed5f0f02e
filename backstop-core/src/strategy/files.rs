/*!
File-tree backups as gzip-compressed tar archives.
*/

use async_trait::async_trait;
use chrono::Utc;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{info, warn};
use walkdir::WalkDir;

use super::{
    decrypt_if_needed, prepare_input, seal_artifact, BackupArtifact, BackupOptions, BackupStrategy,
    OverwriteMode, RestoreOptions, RestoreReport, ValidationReport, WorkDir,
};
use crate::compression::is_gzip;
use crate::config::EngineConfig;
use crate::encryption::{run_blocking, EncryptionEngine};
use crate::metadata::BackupType;
use crate::progress::{ProgressHandle, Stage};
use crate::{BackstopError, Result};

/// Path filter built from exclude patterns
///
/// A plain pattern matches any path component with that exact name;
/// `*.ext` matches file names ending in `.ext`.
#[derive(Debug, Clone, Default)]
pub struct ExcludeFilter {
    names: HashSet<String>,
    suffixes: Vec<String>,
}

impl ExcludeFilter {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self::default();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            match pattern.strip_prefix('*') {
                Some(suffix) => filter.suffixes.push(suffix.to_string()),
                None => {
                    filter.names.insert(pattern.trim_matches('/').to_string());
                }
            }
        }
        filter
    }

    /// True if any component of `relative` is excluded
    pub fn is_excluded(&self, relative: &Path) -> bool {
        relative.components().any(|c| match c {
            Component::Normal(name) => {
                let name = name.to_string_lossy();
                self.names.contains(name.as_ref())
                    || self.suffixes.iter().any(|s| name.ends_with(s.as_str()))
            }
            _ => false,
        })
    }
}

/// One entry of an archive's table of contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveEntry {
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
}

/// Result of [`FilesStrategy::estimate_backup_size`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeEstimate {
    pub raw_size: u64,
    pub estimated_size: u64,
    pub file_count: u64,
    pub compression_ratio: f64,
    pub paths: Vec<PathBuf>,
}

/// Counters reported by [`archive_paths`]
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveStats {
    pub files: u64,
    pub directories: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct FilesStrategy {
    config: Arc<EngineConfig>,
    engine: EncryptionEngine,
}

impl FilesStrategy {
    pub fn new(config: Arc<EngineConfig>, engine: EncryptionEngine) -> Self {
        Self { config, engine }
    }

    /// Resolve requested (or default) include paths, dropping absent ones
    ///
    /// # Returns
    /// `Validation` if none of the paths exist
    pub fn resolve_include_paths(&self, requested: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let candidates = if requested.is_empty() {
            &self.config.files.default_include_paths
        } else {
            requested
        };

        let existing: Vec<PathBuf> = candidates
            .iter()
            .map(|p| self.config.resolve_app_path(p))
            .filter(|p| {
                let present = p.exists();
                if !present {
                    warn!(path = %p.display(), "Include path does not exist, skipping");
                }
                present
            })
            .collect();

        if existing.is_empty() {
            return Err(BackstopError::validation(
                "No valid paths to back up: none of the include paths exist",
            ));
        }
        Ok(existing)
    }

    fn exclude_filter(&self, extra: &[String]) -> ExcludeFilter {
        ExcludeFilter::new(self.config.files.exclude_patterns.iter().chain(extra.iter()))
    }

    /// Archive `paths` into `dest` (gzip tar) on a blocking worker
    pub async fn archive(
        &self,
        paths: Vec<PathBuf>,
        dest: PathBuf,
        level: u32,
        extra_excludes: &[String],
    ) -> Result<ArchiveStats> {
        let filter = self.exclude_filter(extra_excludes);
        let base = self.config.app_root.clone();
        run_blocking(move || archive_paths(&paths, &base, &dest, level, &filter)).await
    }

    /// Table of contents of a files archive
    pub async fn list_backup_contents(
        &self,
        path: &Path,
        encryption_key: Option<&str>,
    ) -> Result<Vec<ArchiveEntry>> {
        let work = WorkDir::create(&self.config.scratch_dir(), "files-list")?;
        let plain = decrypt_if_needed(
            &self.engine,
            path,
            encryption_key,
            &work,
            &ProgressHandle::detached(),
        )
        .await?;
        run_blocking(move || list_archive(&plain)).await
    }

    /// Estimate the artifact size for `paths` (or the defaults)
    ///
    /// Raw on-disk size times the configured compression ratio; a rough
    /// guide, not a guarantee.
    pub async fn estimate_backup_size(&self, paths: &[PathBuf]) -> Result<SizeEstimate> {
        let resolved = self.resolve_include_paths(paths)?;
        let filter = self.exclude_filter(&[]);
        let ratio = self.config.files.compression_ratio_estimate;

        let (raw_size, file_count) = {
            let roots = resolved.clone();
            run_blocking(move || {
                Ok(roots
                    .par_iter()
                    .map(|root| tree_size(root, &filter))
                    .reduce(|| (0, 0), |a, b| (a.0 + b.0, a.1 + b.1)))
            })
            .await?
        };

        Ok(SizeEstimate {
            raw_size,
            estimated_size: (raw_size as f64 * ratio).ceil() as u64,
            file_count,
            compression_ratio: ratio,
            paths: resolved,
        })
    }
}

#[async_trait]
impl BackupStrategy for FilesStrategy {
    fn backup_type(&self) -> BackupType {
        BackupType::Files
    }

    async fn create_backup(
        &self,
        options: &BackupOptions,
        progress: &ProgressHandle,
    ) -> Result<BackupArtifact> {
        progress.stage(Stage::CollectingFiles, "Collecting files");
        let paths = self.resolve_include_paths(&options.include_paths)?;
        tokio::fs::create_dir_all(&options.output_dir).await?;

        progress.stage(Stage::Compressing, "Archiving and compressing files");
        let archive = options
            .output_dir
            .join(BackupType::Files.artifact_file_name(&options.backup_id, false));
        let stats = self
            .archive(
                paths.clone(),
                archive.clone(),
                options.compression_level,
                &options.exclude_patterns,
            )
            .await?;
        info!(
            backup_id = %options.backup_id,
            files = stats.files,
            bytes = stats.bytes,
            "Files archived"
        );

        let (location, encrypted) = seal_artifact(&self.engine, archive, options, progress).await?;
        let size = tokio::fs::metadata(&location).await?.len();

        Ok(BackupArtifact {
            backup_id: options.backup_id.clone(),
            location,
            size,
            encrypted,
            timestamp: Utc::now(),
            details: serde_json::json!({
                "paths": paths,
                "stats": stats,
                "compressionLevel": options.compression_level,
            }),
        })
    }

    async fn restore_from_backup(
        &self,
        path: &Path,
        options: &RestoreOptions,
        progress: &ProgressHandle,
    ) -> Result<RestoreReport> {
        let work = WorkDir::create(&self.config.scratch_dir(), "files-restore")?;
        let key = options.encryption_key.as_deref();
        let plain = prepare_input(&self.engine, path, key, &work, progress).await?;
        self.restore_prepared(&plain, options, progress).await
    }

    /// Extract a tar archive; a gzip tar is also accepted
    async fn restore_prepared(
        &self,
        plain: &Path,
        options: &RestoreOptions,
        progress: &ProgressHandle,
    ) -> Result<RestoreReport> {
        let target = options
            .target_dir
            .clone()
            .unwrap_or_else(|| self.config.app_root.clone());
        tokio::fs::create_dir_all(&target).await?;

        progress.stage(Stage::RestoringFiles, "Extracting files");
        let mode = options.overwrite;
        let (src, dest) = (plain.to_path_buf(), target.clone());
        let outcome = run_blocking(move || extract_archive(&src, &dest, mode)).await?;
        info!(
            target = %target.display(),
            restored = outcome.restored,
            skipped = outcome.skipped,
            "Files restored"
        );

        Ok(RestoreReport {
            backup_type: BackupType::Files,
            components: vec!["files".to_string()],
            details: serde_json::json!({
                "target": target,
                "restored": outcome.restored,
                "skipped": outcome.skipped,
                "overwrite": mode,
            }),
        })
    }

    async fn validate_backup(
        &self,
        path: &Path,
        encryption_key: Option<&str>,
    ) -> Result<ValidationReport> {
        match self.list_backup_contents(path, encryption_key).await {
            Ok(entries) if entries.is_empty() => {
                Ok(ValidationReport::invalid(BackupType::Files, "Archive is empty"))
            }
            Ok(entries) => Ok(ValidationReport::ok(
                BackupType::Files,
                serde_json::json!({
                    "entries": entries.len(),
                    "files": entries.iter().filter(|e| !e.is_dir).count(),
                    "totalSize": entries.iter().map(|e| e.size).sum::<u64>(),
                }),
            )),
            Err(e @ (BackstopError::EncryptedWithoutKey | BackstopError::NotFound(_))) => Err(e),
            Err(e) => Ok(ValidationReport::invalid(BackupType::Files, e.to_string())),
        }
    }
}

/// Name an archived path: relative to `base` when under it, else rooted at
/// the include path's own name
fn archive_name(path: &Path, root: &Path, base: &Path) -> PathBuf {
    if let Ok(relative) = path.strip_prefix(base) {
        return relative.to_path_buf();
    }
    let root_name = root
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("root"));
    match path.strip_prefix(root) {
        Ok(inner) if inner.as_os_str().is_empty() => root_name,
        Ok(inner) => root_name.join(inner),
        Err(_) => root_name,
    }
}

/// Write a gzip tar of `roots` to `dest`, skipping excluded paths
pub fn archive_paths(
    roots: &[PathBuf],
    base: &Path,
    dest: &Path,
    level: u32,
    filter: &ExcludeFilter,
) -> Result<ArchiveStats> {
    let output = BufWriter::new(File::create(dest)?);
    let encoder = GzEncoder::new(output, Compression::new(level.min(9)));
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut stats = ArchiveStats::default();
    let mut seen = HashSet::new();

    for root in roots {
        let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
            let name = archive_name(entry.path(), root, base);
            !filter.is_excluded(&name)
        });

        for entry in walker {
            let entry = entry.map_err(|e| {
                BackstopError::archive(format!("Failed to walk {}: {}", root.display(), e))
            })?;
            let name = archive_name(entry.path(), root, base);
            if name.as_os_str().is_empty() || !seen.insert(name.clone()) {
                continue;
            }

            let file_type = entry.file_type();
            if file_type.is_dir() {
                builder.append_dir(&name, entry.path()).map_err(|e| {
                    BackstopError::archive(format!("Failed to add {}: {}", name.display(), e))
                })?;
                stats.directories += 1;
            } else {
                builder
                    .append_path_with_name(entry.path(), &name)
                    .map_err(|e| {
                        BackstopError::archive(format!("Failed to add {}: {}", name.display(), e))
                    })?;
                stats.files += 1;
                if file_type.is_file() {
                    stats.bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
                }
            }
        }
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| BackstopError::archive(format!("Failed to finish archive: {e}")))?;
    let mut output = encoder
        .finish()
        .map_err(|e| BackstopError::compression(format!("Failed to finish compression: {e}")))?;
    output.flush()?;
    Ok(stats)
}

/// Open a tar archive, transparently gunzipping it
fn open_archive(path: &Path) -> Result<tar::Archive<Box<dyn Read>>> {
    let mut header = [0u8; 2];
    let mut probe = File::open(path)?;
    let read = probe.read(&mut header)?;
    let file = BufReader::new(File::open(path)?);
    let reader: Box<dyn Read> = if is_gzip(&header[..read]) {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(tar::Archive::new(reader))
}

/// Table of contents of a (possibly gzip) tar archive
pub fn list_archive(path: &Path) -> Result<Vec<ArchiveEntry>> {
    let mut archive = open_archive(path)?;
    let entries = archive
        .entries()
        .map_err(|e| BackstopError::archive(format!("Failed to read archive: {e}")))?;

    let mut listing = Vec::new();
    for entry in entries {
        let entry =
            entry.map_err(|e| BackstopError::archive(format!("Corrupt archive entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| BackstopError::archive(format!("Invalid entry path: {e}")))?
            .to_string_lossy()
            .into_owned();
        listing.push(ArchiveEntry {
            path,
            size: entry.header().size().unwrap_or(0),
            is_dir: entry.header().entry_type().is_dir(),
        });
    }
    Ok(listing)
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ExtractOutcome {
    pub restored: u64,
    pub skipped: u64,
}

/// Unpack `archive` into `target` honoring `mode`
pub(crate) fn extract_archive(
    archive: &Path,
    target: &Path,
    mode: OverwriteMode,
) -> Result<ExtractOutcome> {
    let mut archive = open_archive(archive)?;
    archive.set_preserve_mtime(true);
    let entries = archive
        .entries()
        .map_err(|e| BackstopError::archive(format!("Failed to read archive: {e}")))?;

    let mut outcome = ExtractOutcome::default();
    for entry in entries {
        let mut entry =
            entry.map_err(|e| BackstopError::archive(format!("Corrupt archive entry: {e}")))?;
        let relative = entry
            .path()
            .map_err(|e| BackstopError::archive(format!("Invalid entry path: {e}")))?
            .into_owned();

        if mode == OverwriteMode::KeepNewer && !entry.header().entry_type().is_dir() {
            let existing = target.join(&relative);
            let archived_mtime = entry.header().mtime().unwrap_or(0);
            if let Some(current) = modified_secs(&existing) {
                if current > archived_mtime {
                    outcome.skipped += 1;
                    continue;
                }
            }
        }

        let unpacked = entry.unpack_in(target).map_err(|e| {
            BackstopError::archive(format!("Failed to extract {}: {}", relative.display(), e))
        })?;
        if unpacked {
            outcome.restored += 1;
        } else {
            warn!(path = %relative.display(), "Skipping archive entry outside the target");
            outcome.skipped += 1;
        }
    }
    Ok(outcome)
}

fn modified_secs(path: &Path) -> Option<u64> {
    let modified = std::fs::symlink_metadata(path).ok()?.modified().ok()?;
    modified.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
}

/// (bytes, file count) under `root`, excluding filtered paths
fn tree_size(root: &Path, filter: &ExcludeFilter) -> (u64, u64) {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| {
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            !filter.is_excluded(relative)
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .fold((0, 0), |(bytes, count), entry| {
            (bytes + entry.metadata().map(|m| m.len()).unwrap_or(0), count + 1)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_exclude_patterns;
    use crate::encryption::KdfParams;
    use tempfile::TempDir;

    fn strategy(app_root: &Path, backup_dir: &Path) -> FilesStrategy {
        let config = Arc::new(EngineConfig::new(backup_dir, app_root));
        FilesStrategy::new(config, EncryptionEngine::new(KdfParams::new(1024, 1, 1)))
    }

    fn seed_tree(root: &Path) {
        std::fs::create_dir_all(root.join("uploads/avatars")).unwrap();
        std::fs::create_dir_all(root.join("uploads/node_modules/pkg")).unwrap();
        std::fs::write(root.join("uploads/avatars/ada.png"), b"\x89PNG fake image").unwrap();
        std::fs::write(root.join("uploads/report.pdf"), b"%PDF-1.4 report").unwrap();
        std::fs::write(root.join("uploads/debug.log"), b"noise").unwrap();
        std::fs::write(root.join("uploads/node_modules/pkg/index.js"), b"x").unwrap();
    }

    #[test]
    fn test_exclude_filter() {
        let filter = ExcludeFilter::new(default_exclude_patterns());
        assert!(filter.is_excluded(Path::new("app/node_modules/x.js")));
        assert!(filter.is_excluded(Path::new("uploads/server.log")));
        assert!(filter.is_excluded(Path::new(".git/HEAD")));
        assert!(!filter.is_excluded(Path::new("uploads/logo.png")));
        assert!(!filter.is_excluded(Path::new("uploads/catalog/entry.txt")));
    }

    #[tokio::test]
    async fn test_create_and_restore_roundtrip() {
        let app = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        seed_tree(app.path());
        let strategy = strategy(app.path(), backups.path());

        let mut options = BackupOptions::new("files_test", backups.path());
        options.include_paths = vec![PathBuf::from("uploads")];
        let artifact = strategy
            .create_backup(&options, &ProgressHandle::detached())
            .await
            .unwrap();
        assert!(artifact.location.ends_with("files_test.tar.gz"));
        assert!(!artifact.encrypted);

        let contents = strategy
            .list_backup_contents(&artifact.location, None)
            .await
            .unwrap();
        let names: Vec<&str> = contents.iter().map(|e| e.path.as_str()).collect();
        assert!(names.contains(&"uploads/avatars/ada.png"));
        assert!(!names.iter().any(|n| n.contains("node_modules")));
        assert!(!names.iter().any(|n| n.ends_with(".log")));

        let target = TempDir::new().unwrap();
        let restore = RestoreOptions {
            target_dir: Some(target.path().to_path_buf()),
            ..RestoreOptions::default()
        };
        strategy
            .restore_from_backup(&artifact.location, &restore, &ProgressHandle::detached())
            .await
            .unwrap();
        assert_eq!(
            std::fs::read(target.path().join("uploads/avatars/ada.png")).unwrap(),
            b"\x89PNG fake image"
        );
    }

    #[tokio::test]
    async fn test_missing_include_paths_fail() {
        let app = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        let strategy = strategy(app.path(), backups.path());

        let err = strategy
            .create_backup(
                &BackupOptions::new("files_none", backups.path()),
                &ProgressHandle::detached(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackstopError::Validation(_)));
    }

    #[tokio::test]
    async fn test_keep_newer_skips_fresher_files() {
        let app = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        seed_tree(app.path());
        let strategy = strategy(app.path(), backups.path());

        let mut options = BackupOptions::new("files_keep", backups.path());
        options.include_paths = vec![PathBuf::from("uploads")];
        let artifact = strategy
            .create_backup(&options, &ProgressHandle::detached())
            .await
            .unwrap();

        // Rewrite with an mtime well in the future
        let report = app.path().join("uploads/report.pdf");
        std::fs::write(&report, b"edited after backup").unwrap();
        let future = std::time::SystemTime::now() + std::time::Duration::from_secs(3600);
        File::options()
            .write(true)
            .open(&report)
            .unwrap()
            .set_modified(future)
            .unwrap();

        let restore = RestoreOptions {
            overwrite: OverwriteMode::KeepNewer,
            ..RestoreOptions::default()
        };
        let outcome = strategy
            .restore_from_backup(&artifact.location, &restore, &ProgressHandle::detached())
            .await
            .unwrap();
        assert!(outcome.details["skipped"].as_u64().unwrap() >= 1);
        assert_eq!(std::fs::read(&report).unwrap(), b"edited after backup");
    }

    #[tokio::test]
    async fn test_estimate_applies_ratio() {
        let app = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        std::fs::create_dir_all(app.path().join("storage")).unwrap();
        std::fs::write(app.path().join("storage/blob.bin"), vec![7u8; 1000]).unwrap();
        std::fs::write(app.path().join("storage/skip.tmp"), vec![7u8; 500]).unwrap();
        let strategy = strategy(app.path(), backups.path());

        let estimate = strategy
            .estimate_backup_size(&[PathBuf::from("storage")])
            .await
            .unwrap();
        assert_eq!(estimate.raw_size, 1000);
        assert_eq!(estimate.file_count, 1);
        assert_eq!(estimate.estimated_size, 300);
    }

    #[tokio::test]
    async fn test_validate_rejects_garbage() {
        let app = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        let strategy = strategy(app.path(), backups.path());
        let junk = backups.path().join("junk.tar.gz");
        std::fs::write(&junk, b"definitely not an archive at all, not even close").unwrap();

        let report = strategy.validate_backup(&junk, None).await.unwrap();
        assert!(!report.valid);
    }
}
