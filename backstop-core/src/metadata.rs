/*!
Backup records, schedules and identifiers.

`BackupRecord` is the persisted description of one backup attempt and
`BackupSchedule` of one recurring job. Both are owned by the metadata store;
the orchestrator and scheduler are their only writers.
*/

use crate::{BackstopError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Kind of state captured by a backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupType {
    Database,
    Files,
    FullSystem,
}

impl BackupType {
    pub const ALL: [BackupType; 3] = [
        BackupType::Database,
        BackupType::Files,
        BackupType::FullSystem,
    ];

    /// Prefix used for generated backup ids and artifact names
    pub fn id_prefix(self) -> &'static str {
        match self {
            BackupType::Database => "database",
            BackupType::Files => "files",
            BackupType::FullSystem => "full_system",
        }
    }

    /// Extension of the unencrypted artifact
    pub fn artifact_extension(self) -> &'static str {
        match self {
            BackupType::Database => "sql.gz",
            BackupType::Files => "tar.gz",
            BackupType::FullSystem => "tar",
        }
    }

    /// File name of the artifact for `backup_id`
    pub fn artifact_file_name(self, backup_id: &str, encrypted: bool) -> String {
        if encrypted {
            format!("{}.{}.enc", backup_id, self.artifact_extension())
        } else {
            format!("{}.{}", backup_id, self.artifact_extension())
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackupType::Database => "DATABASE",
            BackupType::Files => "FILES",
            BackupType::FullSystem => "FULL_SYSTEM",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackupType {
    type Err = BackstopError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "DATABASE" | "DB" => Ok(BackupType::Database),
            "FILES" => Ok(BackupType::Files),
            "FULL_SYSTEM" | "FULL" => Ok(BackupType::FullSystem),
            other => Err(BackstopError::validation(format!(
                "Unknown backup type: {other}"
            ))),
        }
    }
}

/// Lifecycle status of a backup record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupStatus {
    InProgress,
    Completed,
    Failed,
}

impl BackupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupStatus::InProgress => "IN_PROGRESS",
            BackupStatus::Completed => "COMPLETED",
            BackupStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What triggered a backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackupOrigin {
    #[default]
    Manual,
    Scheduled {
        schedule_id: String,
    },
    /// Safety snapshot taken before restoring `restore_of`
    PreRestore {
        restore_of: String,
    },
}

impl BackupOrigin {
    pub fn is_pre_restore(&self) -> bool {
        matches!(self, BackupOrigin::PreRestore { .. })
    }

    pub fn schedule_id(&self) -> Option<&str> {
        match self {
            BackupOrigin::Scheduled { schedule_id } => Some(schedule_id),
            _ => None,
        }
    }
}

/// Persisted description of one backup attempt
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub backup_id: String,

    #[serde(rename = "type")]
    pub backup_type: BackupType,

    pub status: BackupStatus,

    /// Artifact size in bytes (0 until completed)
    pub size: u64,

    /// Artifact path; the planned path while in progress
    pub location: PathBuf,

    pub encrypted: bool,

    /// Secret needed to decrypt the artifact, retained when `encrypted`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,

    /// SHA-256 of the artifact as written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    #[serde(default)]
    pub origin: BackupOrigin,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Strategy result plus the original request options
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl BackupRecord {
    /// Create a new IN_PROGRESS record
    pub fn in_progress<S: Into<String>>(
        backup_id: S,
        backup_type: BackupType,
        location: PathBuf,
        origin: BackupOrigin,
    ) -> Self {
        Self {
            backup_id: backup_id.into(),
            backup_type,
            status: BackupStatus::InProgress,
            size: 0,
            location,
            encrypted: false,
            encryption_key: None,
            checksum: None,
            origin,
            description: None,
            created_by: None,
            started_at: Utc::now(),
            completed_at: None,
            failed_at: None,
            error_message: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_description<S: Into<String>>(mut self, description: Option<S>) -> Self {
        self.description = description.map(Into::into);
        self
    }

    pub fn with_created_by<S: Into<String>>(mut self, actor: Option<S>) -> Self {
        self.created_by = actor.map(Into::into);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Transition IN_PROGRESS -> COMPLETED
    pub fn mark_completed(&mut self, outcome: CompletedArtifact) -> Result<()> {
        self.ensure_in_progress()?;
        self.status = BackupStatus::Completed;
        self.size = outcome.size;
        self.location = outcome.location;
        self.encrypted = outcome.encrypted;
        self.encryption_key = if outcome.encrypted {
            outcome.encryption_key
        } else {
            None
        };
        self.checksum = outcome.checksum;
        self.completed_at = Some(Utc::now());
        self.metadata = outcome.metadata;
        Ok(())
    }

    /// Transition IN_PROGRESS -> FAILED
    pub fn mark_failed<S: Into<String>>(&mut self, error: S) -> Result<()> {
        self.ensure_in_progress()?;
        self.status = BackupStatus::Failed;
        self.failed_at = Some(Utc::now());
        self.error_message = Some(error.into());
        Ok(())
    }

    fn ensure_in_progress(&self) -> Result<()> {
        if self.status != BackupStatus::InProgress {
            return Err(BackstopError::invalid_state(format!(
                "Backup {} is already {}",
                self.backup_id, self.status
            )));
        }
        Ok(())
    }

    pub fn is_pre_restore(&self) -> bool {
        self.origin.is_pre_restore()
    }

    /// Time used for age/rank ordering
    pub fn reference_time(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.started_at)
    }
}

/// Outcome a strategy reports for a finished artifact
#[derive(Debug, Clone)]
pub struct CompletedArtifact {
    pub location: PathBuf,
    pub size: u64,
    pub encrypted: bool,
    pub encryption_key: Option<String>,
    pub checksum: Option<String>,
    pub metadata: serde_json::Value,
}

/// Generate a globally unique, time-ordered backup id
///
/// Format: `{type_prefix}_{YYYYMMDD}_{HHMMSS}_{8 random hex}`
pub fn generate_backup_id(backup_type: BackupType) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}",
        backup_type.id_prefix(),
        Utc::now().format("%Y%m%d_%H%M%S"),
        &random[..8]
    )
}

/// Generate an id for a restore operation's progress stream
pub fn generate_operation_id(prefix: &str) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", prefix, Utc::now().timestamp_millis(), &random[..8])
}

/// SHA-256 of a file, streamed
pub fn compute_file_checksum(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// How often a schedule fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

impl std::str::FromStr for Frequency {
    type Err = BackstopError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DAILY" => Ok(Frequency::Daily),
            "WEEKLY" => Ok(Frequency::Weekly),
            "MONTHLY" => Ok(Frequency::Monthly),
            other => Err(BackstopError::validation(format!(
                "Unknown frequency: {other}"
            ))),
        }
    }
}

/// Outcome of the last scheduled run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleRunStatus {
    Success,
    Failed,
}

/// A recurring backup job definition
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSchedule {
    pub id: String,
    pub name: String,

    #[serde(rename = "type")]
    pub backup_type: BackupType,

    pub frequency: Frequency,

    /// Time of day, `HH:mm` (UTC)
    pub time: String,

    /// 0 = Sunday ... 6 = Saturday; required for WEEKLY
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<u8>,

    /// 1..=31; required for MONTHLY
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_month: Option<u8>,

    pub enabled: bool,

    pub retention_days: u32,

    pub max_backups: u32,

    /// Per-schedule encryption override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypt: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<ScheduleRunStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backup_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl BackupSchedule {
    /// Validate timing fields
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(BackstopError::validation("Schedule name cannot be empty"));
        }
        crate::scheduler::cron::CronSpec::from_schedule(self).map(|_| ())
    }
}
