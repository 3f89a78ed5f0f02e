/*!
Database backups: dump with an external tool, gzip, optionally encrypt.

The dump tool writes SQL to stdout; the load tool replays a SQL file given
as its final argument (`pg_dump` / `psql` by default).
*/

use async_trait::async_trait;
use chrono::Utc;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

use super::{
    decrypt_if_needed, prepare_input, read_header, seal_artifact, BackupArtifact, BackupOptions,
    BackupStrategy, RestoreOptions, RestoreReport, ValidationReport, WorkDir,
};
use crate::compression::{is_gzip, read_gzip_prefix, CompressionAdapter, GzipCompressor};
use crate::config::EngineConfig;
use crate::encryption::{run_blocking, EncryptionEngine};
use crate::metadata::BackupType;
use crate::progress::{ProgressHandle, Stage};
use crate::{BackstopError, Result};

/// Bytes of decompressed dump inspected by validation and detection
pub const DUMP_PREFIX_LEN: usize = 8192;

/// Statements that mark a SQL dump
const DUMP_MARKERS: &[&str] = &[
    "PostgreSQL database dump",
    "MySQL dump",
    "CREATE TABLE",
    "CREATE SCHEMA",
    "CREATE SEQUENCE",
    "INSERT INTO",
    "COPY ",
    "ALTER TABLE",
    "SET statement_timeout",
];

/// Executed before replay when `drop_existing` is requested
const RESET_SCHEMA_SQL: &str = "DROP SCHEMA IF EXISTS public CASCADE; CREATE SCHEMA public;";

/// True if `prefix` contains a recognizable dump statement
pub fn looks_like_sql_dump(prefix: &[u8]) -> bool {
    let text = String::from_utf8_lossy(prefix);
    DUMP_MARKERS.iter().any(|marker| text.contains(marker))
}

#[derive(Debug, Clone)]
pub struct DatabaseStrategy {
    config: Arc<EngineConfig>,
    engine: EncryptionEngine,
}

impl DatabaseStrategy {
    pub fn new(config: Arc<EngineConfig>, engine: EncryptionEngine) -> Self {
        Self { config, engine }
    }

    fn database_url(&self) -> Result<&str> {
        self.config
            .database
            .url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                BackstopError::configuration("Database connection URL is not configured")
            })
    }

    /// Run the dump tool, streaming its stdout into `dest`
    async fn dump_to(&self, dest: &Path) -> Result<u64> {
        let url = self.database_url()?;
        let program = &self.config.database.dump_program;
        let tool = tool_name(program);

        debug!(tool = %tool, database = %redact_url(url), "Starting database dump");
        let sink = std::fs::File::create(dest)?;
        let output = Command::new(program)
            .args(&self.config.database.extra_dump_args)
            .arg(format!("--dbname={url}"))
            .stdin(Stdio::null())
            .stdout(Stdio::from(sink))
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&tool, e))?
            .wait_with_output()
            .await?;

        if !output.status.success() {
            return Err(BackstopError::external_tool(&tool, output.status, &output.stderr));
        }
        Ok(tokio::fs::metadata(dest).await?.len())
    }

    /// Replay `sql_file` with the load tool
    async fn load_from(&self, sql_file: &Path, drop_existing: bool) -> Result<()> {
        let url = self.database_url()?;
        let program = &self.config.database.load_program;
        let tool = tool_name(program);

        if drop_existing {
            info!(database = %redact_url(url), "Dropping existing schema before restore");
            let output = Command::new(program)
                .arg(format!("--dbname={url}"))
                .args(["-v", "ON_ERROR_STOP=1", "-c", RESET_SCHEMA_SQL])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| spawn_error(&tool, e))?
                .wait_with_output()
                .await?;
            if !output.status.success() {
                return Err(BackstopError::external_tool(&tool, output.status, &output.stderr));
            }
        }

        let output = Command::new(program)
            .arg(format!("--dbname={url}"))
            .args(["-v", "ON_ERROR_STOP=1", "-f"])
            .arg(sql_file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&tool, e))?
            .wait_with_output()
            .await?;

        if !output.status.success() {
            return Err(BackstopError::external_tool(&tool, output.status, &output.stderr));
        }
        Ok(())
    }
}

#[async_trait]
impl BackupStrategy for DatabaseStrategy {
    fn backup_type(&self) -> BackupType {
        BackupType::Database
    }

    async fn create_backup(
        &self,
        options: &BackupOptions,
        progress: &ProgressHandle,
    ) -> Result<BackupArtifact> {
        // Fail before touching the filesystem
        self.database_url()?;

        let work = WorkDir::create(&self.config.scratch_dir(), &options.backup_id)?;
        tokio::fs::create_dir_all(&options.output_dir).await?;

        progress.stage(Stage::DumpingDatabase, "Dumping database");
        let raw = work.join("dump.sql");
        let dump_size = self.dump_to(&raw).await?;
        info!(backup_id = %options.backup_id, dump_size, "Database dump finished");

        progress.stage(Stage::Compressing, "Compressing database dump");
        let compressed = options
            .output_dir
            .join(BackupType::Database.artifact_file_name(&options.backup_id, false));
        let compressor = GzipCompressor::with_level(options.compression_level);
        let (src, dst) = (raw.clone(), compressed.clone());
        run_blocking(move || compressor.compress_file(&src, &dst)).await?;

        let (location, encrypted) =
            seal_artifact(&self.engine, compressed, options, progress).await?;
        let size = tokio::fs::metadata(&location).await?.len();

        Ok(BackupArtifact {
            backup_id: options.backup_id.clone(),
            location,
            size,
            encrypted,
            timestamp: Utc::now(),
            details: serde_json::json!({
                "tool": tool_name(&self.config.database.dump_program),
                "dumpSize": dump_size,
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
        self.database_url()?;
        let work = WorkDir::create(&self.config.scratch_dir(), "db-restore")?;
        let key = options.encryption_key.as_deref();
        let sql_file = prepare_input(&self.engine, path, key, &work, progress).await?;
        self.restore_prepared(&sql_file, options, progress).await
    }

    async fn restore_prepared(
        &self,
        plain: &Path,
        options: &RestoreOptions,
        progress: &ProgressHandle,
    ) -> Result<RestoreReport> {
        self.database_url()?;
        progress.stage(Stage::RestoringDatabase, "Restoring database");
        self.load_from(plain, options.drop_existing).await?;
        info!(source = %plain.display(), "Database restored");

        Ok(RestoreReport {
            backup_type: BackupType::Database,
            components: vec!["database".to_string()],
            details: serde_json::json!({
                "droppedExisting": options.drop_existing,
                "tool": tool_name(&self.config.database.load_program),
            }),
        })
    }

    async fn validate_backup(
        &self,
        path: &Path,
        encryption_key: Option<&str>,
    ) -> Result<ValidationReport> {
        let work = WorkDir::create(&self.config.scratch_dir(), "db-validate")?;
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
            Err(e) => return Ok(ValidationReport::invalid(BackupType::Database, e.to_string())),
        };

        let prefix = sql_prefix(&plain).await?;
        if prefix.is_empty() {
            return Ok(ValidationReport::invalid(BackupType::Database, "Dump is empty"));
        }
        if !looks_like_sql_dump(&prefix) {
            return Ok(ValidationReport::invalid(
                BackupType::Database,
                "No recognizable dump statements found",
            ));
        }
        Ok(ValidationReport::ok(
            BackupType::Database,
            serde_json::json!({ "inspectedBytes": prefix.len() }),
        ))
    }
}

/// Leading bytes of a dump, decompressing when it is gzip
pub(crate) async fn sql_prefix(path: &Path) -> Result<Vec<u8>> {
    let header = read_header(path, 2).await?;
    if is_gzip(&header) {
        let path = path.to_path_buf();
        // A corrupt stream is reported as "no markers", not as an error
        run_blocking(move || Ok(read_gzip_prefix(&path, DUMP_PREFIX_LEN).unwrap_or_default())).await
    } else {
        read_header(path, DUMP_PREFIX_LEN).await
    }
}

fn tool_name(program: &Path) -> String {
    program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string())
}

fn spawn_error(tool: &str, e: std::io::Error) -> BackstopError {
    if e.kind() == std::io::ErrorKind::NotFound {
        BackstopError::configuration(format!("{tool} was not found on PATH"))
    } else {
        BackstopError::Io(e)
    }
}

/// Hide the password component of a connection URL
pub(crate) fn redact_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    let Some(at) = rest.find('@') else {
        return url.to_string();
    };
    let userinfo = &rest[..at];
    match userinfo.find(':') {
        Some(colon) => format!(
            "{}{}:***{}",
            &url[..scheme_end + 3],
            &userinfo[..colon],
            &rest[at..]
        ),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::KdfParams;
    use tempfile::TempDir;

    #[test]
    fn test_dump_markers() {
        assert!(looks_like_sql_dump(b"--\n-- PostgreSQL database dump\n--\n"));
        assert!(looks_like_sql_dump(b"INSERT INTO students VALUES (1);"));
        assert!(!looks_like_sql_dump(b"hello world"));
    }

    #[test]
    fn test_redact_url() {
        assert_eq!(
            redact_url("postgres://app:s3cret@db:5432/school"),
            "postgres://app:***@db:5432/school"
        );
        assert_eq!(redact_url("postgres://db/school"), "postgres://db/school");
        assert_eq!(redact_url("school"), "school");
    }

    #[tokio::test]
    async fn test_missing_url_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(EngineConfig::new(dir.path().join("backups"), dir.path()));
        let engine = EncryptionEngine::new(KdfParams::new(1024, 1, 1));
        let strategy = DatabaseStrategy::new(config, engine);

        let options = BackupOptions::new("database_x", dir.path().join("backups"));
        let err = strategy
            .create_backup(&options, &ProgressHandle::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, BackstopError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_validate_plain_and_gzip_dumps() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(EngineConfig::new(dir.path().join("backups"), dir.path()));
        let engine = EncryptionEngine::new(KdfParams::new(1024, 1, 1));
        let strategy = DatabaseStrategy::new(config, engine);

        let gz = dir.path().join("good.sql.gz");
        std::fs::write(
            &gz,
            GzipCompressor::new()
                .compress(b"CREATE TABLE terms (id int);\n")
                .unwrap(),
        )
        .unwrap();
        assert!(strategy.validate_backup(&gz, None).await.unwrap().valid);

        let junk = dir.path().join("junk.sql");
        std::fs::write(&junk, b"just some notes").unwrap();
        let report = strategy.validate_backup(&junk, None).await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
    }
}
