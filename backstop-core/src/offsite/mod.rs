/*!
Offsite replication of finished artifacts.

Only the remote-shell provider has a transport. The other named providers
fail fast with `NotImplemented`.
*/

pub mod ssh;

pub use ssh::SshTarget;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use backstop_retry::{classify, retry, RetryPlan};

use crate::detect::detect_from_file_name;
use crate::progress::{ProgressHandle, Stage};
use crate::settings::{OffsitePolicy, OffsiteProvider, SettingsProvider};
use crate::{BackstopError, Result};
use ssh::shell_quote;

/// Progress band used while uploading
const UPLOAD_BAND: (f64, f64) = (80.0, 95.0);
/// Progress band used while downloading
const DOWNLOAD_BAND: (f64, f64) = (10.0, 20.0);

/// Result of [`OffsiteTransfer::transfer_backup`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOutcome {
    /// False when offsite replication is disabled
    pub transferred: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<OffsiteProvider>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_location: Option<String>,
    pub bytes: u64,
    pub deleted_local: bool,
}

impl TransferOutcome {
    pub fn skipped() -> Self {
        Self::default()
    }
}

/// One step of the connection diagnostic
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticStep {
    pub name: String,
    pub passed: bool,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTest {
    pub success: bool,
    pub message: String,
    pub steps: Vec<DiagnosticStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteBackup {
    pub name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Pushes artifacts to, and pulls them from, the configured remote host
pub struct OffsiteTransfer {
    settings: Arc<dyn SettingsProvider>,
    connect_timeout: Duration,
}

impl OffsiteTransfer {
    pub fn new(settings: Arc<dyn SettingsProvider>, connect_timeout: Duration) -> Self {
        Self {
            settings,
            connect_timeout,
        }
    }

    /// Whether offsite replication is currently enabled
    pub async fn is_enabled(&self) -> Result<bool> {
        Ok(self.settings.offsite_policy().await?.enabled)
    }

    async fn target(&self, policy: &OffsitePolicy) -> Result<SshTarget> {
        match policy.provider {
            OffsiteProvider::Ssh => {
                let advanced = self.settings.advanced_policy().await?;
                SshTarget::from_policy(
                    policy,
                    self.connect_timeout,
                    Duration::from_secs(advanced.timeout_secs.max(1)),
                )
            }
            other => Err(BackstopError::not_implemented(format!(
                "Offsite provider '{other}'"
            ))),
        }
    }

    /// Replicate `local` to the remote path
    ///
    /// A disabled policy is a successful no-op. Progress is reported inside
    /// the 80-95 band of the backup's TRANSFERRING_OFFSITE stage.
    pub async fn transfer_backup(
        &self,
        local: &Path,
        progress: &ProgressHandle,
    ) -> Result<TransferOutcome> {
        let policy = self.settings.offsite_policy().await?;
        if !policy.enabled {
            return Ok(TransferOutcome::skipped());
        }
        let target = self.target(&policy).await?;
        let retry_count = self.settings.advanced_policy().await?.retry_count;

        let file_name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| BackstopError::validation(format!("Not a file: {}", local.display())))?;
        let bytes = tokio::fs::metadata(local).await?.len();

        progress.report(
            Stage::TransferringOffsite,
            UPLOAD_BAND.0,
            format!("Transferring to {}", target.host),
        );
        target
            .exec_checked(&format!("mkdir -p {}", shell_quote(&target.remote_path)))
            .await?;

        retry(
            "offsite transfer",
            RetryPlan::for_transfers(retry_count),
            |attempt| {
                let target = target.clone();
                let local = local.to_path_buf();
                let handle = progress.clone();
                async move {
                    if attempt > 1 {
                        info!(attempt, "Retrying offsite transfer");
                    }
                    target
                        .push(&local, move |pct| {
                            handle.report(
                                Stage::TransferringOffsite,
                                map_into_band(pct, UPLOAD_BAND),
                                format!("Transferring offsite ({pct}%)"),
                            )
                        })
                        .await
                        .map_err(|e| classify("offsite transfer", e))
                }
            },
        )
        .await?;

        progress.report(Stage::TransferringOffsite, UPLOAD_BAND.1, "Offsite transfer complete");

        let mut deleted_local = false;
        if policy.delete_local_after_transfer {
            match tokio::fs::remove_file(local).await {
                Ok(()) => deleted_local = true,
                Err(e) => warn!(path = %local.display(), error = %e, "Failed to remove local copy"),
            }
        }

        info!(
            host = %target.host,
            remote = %target.remote_file(&file_name),
            bytes,
            "Offsite transfer finished"
        );
        Ok(TransferOutcome {
            transferred: true,
            provider: Some(policy.provider),
            remote_location: Some(format!(
                "{}:{}",
                target.destination(),
                target.remote_file(&file_name)
            )),
            bytes,
            deleted_local,
        })
    }

    /// Fetch `remote_name` into `local_dir`
    pub async fn download_from_offsite(
        &self,
        remote_name: &str,
        local_dir: &Path,
        progress: &ProgressHandle,
    ) -> Result<PathBuf> {
        let policy = self.settings.offsite_policy().await?;
        if !policy.enabled {
            return Err(BackstopError::configuration(
                "Offsite replication is disabled",
            ));
        }
        if remote_name.contains('/') || remote_name.contains("..") {
            return Err(BackstopError::validation(format!(
                "Invalid remote backup name: {remote_name}"
            )));
        }
        let target = self.target(&policy).await?;
        let retry_count = self.settings.advanced_policy().await?.retry_count;
        tokio::fs::create_dir_all(local_dir).await?;

        progress.stage(
            Stage::DownloadingFromOffsite,
            format!("Downloading {remote_name} from {}", target.host),
        );
        let path = retry(
            "offsite download",
            RetryPlan::for_transfers(retry_count),
            |_| {
                let target = target.clone();
                let local_dir = local_dir.to_path_buf();
                let handle = progress.clone();
                let name = remote_name.to_string();
                async move {
                    target
                        .pull(&name, &local_dir, move |pct| {
                            handle.report(
                                Stage::DownloadingFromOffsite,
                                map_into_band(pct, DOWNLOAD_BAND),
                                format!("Downloading ({pct}%)"),
                            )
                        })
                        .await
                        .map_err(|e| classify("offsite download", e))
                }
            },
        )
        .await?;
        Ok(path)
    }

    /// Connect and run the diagnostic chain: path exists, path writable,
    /// free space
    ///
    /// A failing step is reported in the result, not as an error.
    pub async fn test_connection(&self) -> Result<ConnectionTest> {
        let policy = self.settings.offsite_policy().await?;
        let target = self.target(&policy).await?;
        let quoted = shell_quote(&target.remote_path);

        let chain = [
            ("path exists", format!("test -d {quoted}"), "Remote path does not exist"),
            ("path writable", format!("test -w {quoted}"), "Remote path is not writable"),
            ("disk free", format!("df -h {quoted}"), "Could not read remote disk usage"),
        ];

        let mut steps = Vec::new();
        for (name, command, failure) in chain {
            match target.exec(&command).await {
                Ok(output) if output.success => steps.push(DiagnosticStep {
                    name: name.to_string(),
                    passed: true,
                    output: output.stdout,
                }),
                Ok(output) => {
                    steps.push(DiagnosticStep {
                        name: name.to_string(),
                        passed: false,
                        output: output.stderr,
                    });
                    return Ok(ConnectionTest {
                        success: false,
                        message: format!("{failure}: {}", target.remote_path),
                        steps,
                    });
                }
                Err(e) => {
                    steps.push(DiagnosticStep {
                        name: name.to_string(),
                        passed: false,
                        output: e.to_string(),
                    });
                    return Ok(ConnectionTest {
                        success: false,
                        message: e.to_string(),
                        steps,
                    });
                }
            }
        }

        Ok(ConnectionTest {
            success: true,
            message: format!("Connected to {}", target.destination()),
            steps,
        })
    }

    /// `mkdir -p` the configured remote path
    pub async fn create_remote_directory(&self) -> Result<()> {
        let policy = self.settings.offsite_policy().await?;
        let target = self.target(&policy).await?;
        target
            .exec_checked(&format!("mkdir -p {}", shell_quote(&target.remote_path)))
            .await?;
        Ok(())
    }

    /// Backup artifacts present in the remote directory, newest first
    pub async fn list_remote_backups(&self) -> Result<Vec<RemoteBackup>> {
        let policy = self.settings.offsite_policy().await?;
        let target = self.target(&policy).await?;
        let retry_count = self.settings.advanced_policy().await?.retry_count;
        let command = format!(
            "find {} -maxdepth 1 -type f -printf '%f\\t%s\\t%T@\\n'",
            shell_quote(&target.remote_path)
        );
        let listing = retry("offsite listing", RetryPlan::for_commands(retry_count), |_| {
            let target = target.clone();
            let command = command.clone();
            async move {
                target
                    .exec_checked(&command)
                    .await
                    .map_err(|e| classify("offsite listing", e))
            }
        })
        .await?;
        Ok(parse_listing(&listing))
    }
}

/// Map rsync's 0-100 into `band`
fn map_into_band(pct: u8, band: (f64, f64)) -> f64 {
    band.0 + (band.1 - band.0) * f64::from(pct.min(100)) / 100.0
}

/// Parse `name\tsize\tmtime` lines, keeping recognizable artifacts
fn parse_listing(listing: &str) -> Vec<RemoteBackup> {
    let mut backups: Vec<RemoteBackup> = listing
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let name = fields.next()?.trim().to_string();
            let size = fields.next()?.trim().parse().ok()?;
            let modified = fields
                .next()
                .and_then(|t| t.trim().parse::<f64>().ok())
                .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single());
            detect_from_file_name(Path::new(&name))?;
            Some(RemoteBackup {
                name,
                size,
                modified,
            })
        })
        .collect();
    backups.sort_by(|a, b| b.modified.cmp(&a.modified));
    backups
}
