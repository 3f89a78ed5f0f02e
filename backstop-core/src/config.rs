//! Engine configuration
//!
//! Static, process-level settings: where artifacts live, how to reach the
//! database, which paths make up the application file tree. Runtime policy
//! (encryption, offsite, advanced tuning) comes from a
//! [`SettingsProvider`](crate::settings::SettingsProvider) instead.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::encryption::KdfParams;
use crate::{BackstopError, Result};

/// Connection and tooling for the relational database
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// Connection URL handed to the dump/load tools
    pub url: Option<String>,
    /// Dump tool (writes SQL to stdout)
    pub dump_program: PathBuf,
    /// Load tool (replays a SQL file)
    pub load_program: PathBuf,
    /// Extra arguments appended to the dump invocation
    #[serde(default)]
    pub extra_dump_args: Vec<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            dump_program: PathBuf::from("pg_dump"),
            load_program: PathBuf::from("psql"),
            extra_dump_args: Vec::new(),
        }
    }
}

/// Application file-tree settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilesConfig {
    /// Paths archived when a request names none (relative to `app_root`)
    pub default_include_paths: Vec<PathBuf>,
    /// Path-component patterns excluded from archives
    pub exclude_patterns: Vec<String>,
    /// Compressed/raw size ratio used by size estimates
    pub compression_ratio_estimate: f64,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            default_include_paths: vec![
                PathBuf::from("uploads"),
                PathBuf::from("public"),
                PathBuf::from("storage"),
            ],
            exclude_patterns: default_exclude_patterns(),
            compression_ratio_estimate: 0.3,
        }
    }
}

/// Build artifacts, VCS metadata, prior backups, temp and log files
pub fn default_exclude_patterns() -> Vec<String> {
    [
        "node_modules",
        "target",
        "dist",
        "build",
        ".git",
        ".svn",
        ".hg",
        "backups",
        "*.log",
        "*.tmp",
        "*.temp",
        "*.swp",
        "tmp",
        ".cache",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

/// Default retention applied by maintenance cleanup
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionDefaults {
    pub retention_days: u32,
    pub max_backups: u32,
}

impl Default for RetentionDefaults {
    fn default() -> Self {
        Self {
            retention_days: 30,
            max_backups: 10,
        }
    }
}

/// Top-level configuration for the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding finished artifacts and per-operation scratch space
    pub backup_dir: PathBuf,
    /// Root of the application; relative include/config paths resolve here
    pub app_root: PathBuf,
    pub database: DatabaseConfig,
    pub files: FilesConfig,
    /// Configuration files bundled into full-system backups
    pub config_paths: Vec<PathBuf>,
    pub kdf: KdfParams,
    /// How long completed progress histories are kept
    #[serde(with = "duration_secs")]
    pub progress_retention: Duration,
    /// Connect timeout for remote-shell sessions
    #[serde(with = "duration_secs")]
    pub ssh_connect_timeout: Duration,
    pub retention: RetentionDefaults,
}

impl EngineConfig {
    /// Create a configuration rooted at `backup_dir` / `app_root` with defaults
    pub fn new<P1: Into<PathBuf>, P2: Into<PathBuf>>(backup_dir: P1, app_root: P2) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            app_root: app_root.into(),
            database: DatabaseConfig::default(),
            files: FilesConfig::default(),
            config_paths: vec![
                PathBuf::from(".env"),
                PathBuf::from("config"),
                PathBuf::from("package.json"),
                PathBuf::from("docker-compose.yml"),
            ],
            kdf: KdfParams::default(),
            progress_retention: Duration::from_secs(3600),
            ssh_connect_timeout: Duration::from_secs(10),
            retention: RetentionDefaults::default(),
        }
    }

    /// Build a configuration from `BACKSTOP_*` environment variables
    ///
    /// Recognised variables:
    /// - `BACKSTOP_BACKUP_DIR` (default `./backups`)
    /// - `BACKSTOP_APP_ROOT` (default current directory)
    /// - `DATABASE_URL` or `BACKSTOP_DATABASE_URL`
    /// - `BACKSTOP_DUMP_PROGRAM`, `BACKSTOP_LOAD_PROGRAM`
    /// - `BACKSTOP_INCLUDE_PATHS`, `BACKSTOP_CONFIG_PATHS` (comma separated)
    /// - `BACKSTOP_COMPRESSION_RATIO`
    pub fn from_env() -> Result<Self> {
        let backup_dir =
            env_path("BACKSTOP_BACKUP_DIR").unwrap_or_else(|| PathBuf::from("./backups"));
        let app_root = match env_path("BACKSTOP_APP_ROOT") {
            Some(root) => root,
            None => std::env::current_dir()?,
        };

        let mut config = Self::new(backup_dir, app_root);

        config.database.url = std::env::var("BACKSTOP_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .ok()
            .filter(|url| !url.is_empty());
        if let Some(program) = env_path("BACKSTOP_DUMP_PROGRAM") {
            config.database.dump_program = program;
        }
        if let Some(program) = env_path("BACKSTOP_LOAD_PROGRAM") {
            config.database.load_program = program;
        }
        if let Some(paths) = env_list("BACKSTOP_INCLUDE_PATHS") {
            config.files.default_include_paths = paths;
        }
        if let Some(paths) = env_list("BACKSTOP_CONFIG_PATHS") {
            config.config_paths = paths;
        }
        if let Ok(ratio) = std::env::var("BACKSTOP_COMPRESSION_RATIO") {
            config.files.compression_ratio_estimate = ratio.parse().map_err(|_| {
                BackstopError::configuration(format!(
                    "BACKSTOP_COMPRESSION_RATIO must be a number, got '{ratio}'"
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.backup_dir.as_os_str().is_empty() {
            return Err(BackstopError::configuration("backup_dir cannot be empty"));
        }
        let ratio = self.files.compression_ratio_estimate;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(BackstopError::configuration(format!(
                "compression_ratio_estimate must be within (0, 1], got {ratio}"
            )));
        }
        if self.ssh_connect_timeout.is_zero() {
            return Err(BackstopError::configuration(
                "ssh_connect_timeout must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Resolve a possibly relative path against `app_root`
    pub fn resolve_app_path(&self, path: &std::path::Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.app_root.join(path)
        }
    }

    /// Scratch space for in-flight operations
    pub fn scratch_dir(&self) -> PathBuf {
        self.backup_dir.join(".work")
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn env_list(key: &str) -> Option<Vec<PathBuf>> {
    let raw = std::env::var(key).ok()?;
    let paths: Vec<PathBuf> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect();
    Some(paths)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::new("/var/backups", "/srv/app");
        assert_eq!(config.progress_retention, Duration::from_secs(3600));
        assert_eq!(config.files.compression_ratio_estimate, 0.3);
        assert_eq!(config.retention.retention_days, 30);
        assert_eq!(config.retention.max_backups, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolve_app_path() {
        let config = EngineConfig::new("/var/backups", "/srv/app");
        assert_eq!(
            config.resolve_app_path(std::path::Path::new("uploads")),
            PathBuf::from("/srv/app/uploads")
        );
        assert_eq!(
            config.resolve_app_path(std::path::Path::new("/etc/app.conf")),
            PathBuf::from("/etc/app.conf")
        );
    }

    #[test]
    fn test_validate_rejects_bad_ratio() {
        let mut config = EngineConfig::new("/var/backups", "/srv/app");
        config.files.compression_ratio_estimate = 0.0;
        assert!(config.validate().is_err());

        config.files.compression_ratio_estimate = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_backup_dir() {
        let config = EngineConfig::new("", "/srv/app");
        assert!(matches!(
            config.validate(),
            Err(BackstopError::Configuration(_))
        ));
    }

    #[test]
    fn test_config_roundtrips_through_json() {
        let config = EngineConfig::new("/var/backups", "/srv/app");
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ssh_connect_timeout, Duration::from_secs(10));
        assert_eq!(back.database, config.database);
    }
}
