/*!
Remote-shell transport: `ssh` for commands, `rsync` over `ssh` for copies.

Each call is a single awaited child process. Connection attempts carry an
explicit `ConnectTimeout`, and every command is additionally bounded by an
outer deadline so a hung session cannot stall the caller.
*/

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::settings::OffsitePolicy;
use crate::{BackstopError, Result};

/// `ssh` exits with this status when it could not connect or authenticate
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Connection details for one remote host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub remote_path: String,
    pub private_key: Option<PathBuf>,
    pub connect_timeout: Duration,
    /// Upper bound on any single remote command
    pub command_timeout: Duration,
    pub ssh_program: PathBuf,
    pub rsync_program: PathBuf,
}

/// Output of a finished remote command
#[derive(Debug, Clone)]
pub struct RemoteOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl SshTarget {
    /// Build a target from policy, requiring host, user and remote path
    pub fn from_policy(
        policy: &OffsitePolicy,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Result<Self> {
        let mut missing = Vec::new();
        let host = non_empty(&policy.host);
        let user = non_empty(&policy.user);
        let remote_path = non_empty(&policy.remote_path);
        if host.is_none() {
            missing.push("host");
        }
        if user.is_none() {
            missing.push("user");
        }
        if remote_path.is_none() {
            missing.push("remote path");
        }

        match (host, user, remote_path) {
            (Some(host), Some(user), Some(remote_path)) => Ok(Self {
                host,
                port: policy.port.unwrap_or(22),
                user,
                remote_path: remote_path.trim_end_matches('/').to_string(),
                private_key: policy.private_key_path.clone(),
                connect_timeout,
                command_timeout,
                ssh_program: PathBuf::from("ssh"),
                rsync_program: PathBuf::from("rsync"),
            }),
            _ => Err(BackstopError::configuration(format!(
                "Offsite settings incomplete: missing {}",
                missing.join(", ")
            ))),
        }
    }

    /// `user@host`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Options shared by `ssh` invocations and rsync's `-e`
    pub fn ssh_options(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-p".to_string(),
            self.port.to_string(),
        ];
        if let Some(key) = &self.private_key {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args
    }

    /// rsync's `-e` value: the ssh command line, each word shell-quoted
    pub fn remote_shell(&self) -> String {
        std::iter::once("ssh".to_string())
            .chain(self.ssh_options().iter().map(|arg| shell_quote(arg)))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Remote path of an artifact named `file_name`
    pub fn remote_file(&self, file_name: &str) -> String {
        format!("{}/{}", self.remote_path, file_name)
    }

    /// Run `command` on the remote host
    ///
    /// Connection failures and timeouts are `Transport` errors; a remote
    /// command that runs and exits non-zero is returned as output.
    pub async fn exec(&self, command: &str) -> Result<RemoteOutput> {
        debug!(host = %self.host, command, "Running remote command");
        let child = Command::new(&self.ssh_program)
            .args(self.ssh_options())
            .arg(self.destination())
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error("ssh", e))?;

        let deadline = self.connect_timeout + self.command_timeout;
        let output = timeout(deadline, child.wait_with_output())
            .await
            .map_err(|_| {
                BackstopError::transport(format!(
                    "Remote command on {} timed out after {}s",
                    self.host,
                    deadline.as_secs()
                ))
            })??;

        let code = output.status.code();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if code == Some(SSH_CONNECTION_FAILURE) {
            return Err(BackstopError::transport(format!(
                "Failed to connect to {}: {}",
                self.host, stderr
            )));
        }

        Ok(RemoteOutput {
            success: output.status.success(),
            code,
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr,
        })
    }

    /// Run `command`, turning a non-zero exit into an error
    pub async fn exec_checked(&self, command: &str) -> Result<String> {
        let output = self.exec(command).await?;
        if !output.success {
            return Err(BackstopError::ExternalTool {
                tool: "ssh".to_string(),
                status: output
                    .code
                    .map(|c| format!("exit status: {c}"))
                    .unwrap_or_else(|| "signal".to_string()),
                stderr: output.stderr,
            });
        }
        Ok(output.stdout)
    }

    /// Copy `local` to the remote directory with resumable rsync
    ///
    /// `on_progress` receives rsync's overall percentage (0-100).
    pub async fn push(&self, local: &Path, mut on_progress: impl FnMut(u8) + Send) -> Result<()> {
        let source = local.display().to_string();
        let destination = format!("{}:{}/", self.destination(), self.remote_path);
        self.rsync(&source, &destination, &mut on_progress).await
    }

    /// Copy `remote_name` from the remote directory into `local_dir`
    pub async fn pull(
        &self,
        remote_name: &str,
        local_dir: &Path,
        mut on_progress: impl FnMut(u8) + Send,
    ) -> Result<PathBuf> {
        let source = format!("{}:{}", self.destination(), self.remote_file(remote_name));
        let destination = format!("{}/", local_dir.display());
        self.rsync(&source, &destination, &mut on_progress).await?;
        Ok(local_dir.join(remote_name))
    }

    async fn rsync(
        &self,
        source: &str,
        destination: &str,
        on_progress: &mut (dyn FnMut(u8) + Send),
    ) -> Result<()> {
        debug!(source, destination, "Starting rsync transfer");
        let mut child = Command::new(&self.rsync_program)
            .args(["-a", "--partial", "--append-verify", "--info=progress2"])
            .arg("-e")
            .arg(self.remote_shell())
            .arg(source)
            .arg(destination)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error("rsync", e))?;

        let mut stderr_pipe = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        if let Some(mut stdout) = child.stdout.take() {
            let mut chunk = [0u8; 4096];
            let mut pending = Vec::new();
            loop {
                let n = stdout.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                pending.extend_from_slice(&chunk[..n]);
                while let Some(pos) = pending.iter().position(|b| *b == b'\r' || *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    if let Some(pct) = parse_progress(&String::from_utf8_lossy(&line)) {
                        on_progress(pct);
                    }
                }
            }
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        if status.success() {
            return Ok(());
        }
        if status.code() == Some(SSH_CONNECTION_FAILURE) || status.code() == Some(12) {
            // 255 from ssh itself, 12 for a broken protocol stream
            return Err(BackstopError::transport(format!(
                "rsync to {} failed: {}",
                self.host,
                String::from_utf8_lossy(&stderr).trim()
            )));
        }
        Err(BackstopError::external_tool("rsync", status, &stderr))
    }
}

/// Percentage from an rsync progress line such as
/// `  1,234,567  42%  1.10MB/s    0:00:03`
pub fn parse_progress(line: &str) -> Option<u8> {
    line.split_whitespace()
        .find_map(|token| token.strip_suffix('%'))
        .and_then(|digits| digits.parse::<u8>().ok())
        .map(|pct| pct.min(100))
}

/// Single-quote `value` for a POSIX remote shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn spawn_error(tool: &str, e: std::io::Error) -> BackstopError {
    if e.kind() == std::io::ErrorKind::NotFound {
        BackstopError::configuration(format!("{tool} was not found on PATH"))
    } else {
        BackstopError::transport(format!("Failed to start {tool}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> OffsitePolicy {
        OffsitePolicy {
            enabled: true,
            host: Some("vault.example.org".into()),
            user: Some("backup".into()),
            remote_path: Some("/srv/backups/".into()),
            port: Some(2222),
            private_key_path: Some(PathBuf::from("/etc/backstop/id_ed25519")),
            ..OffsitePolicy::default()
        }
    }

    #[test]
    fn test_target_from_policy() {
        let target =
            SshTarget::from_policy(&policy(), Duration::from_secs(10), Duration::from_secs(60))
                .unwrap();
        assert_eq!(target.destination(), "backup@vault.example.org");
        assert_eq!(target.remote_path, "/srv/backups");
        assert_eq!(target.remote_file("a.tar"), "/srv/backups/a.tar");

        let options = target.ssh_options();
        assert!(options.contains(&"ConnectTimeout=10".to_string()));
        assert!(options.contains(&"2222".to_string()));
        assert!(options.contains(&"/etc/backstop/id_ed25519".to_string()));
    }

    #[test]
    fn test_missing_settings_are_named() {
        let mut incomplete = policy();
        incomplete.host = None;
        incomplete.remote_path = Some("   ".into());

        let timeouts = (Duration::from_secs(10), Duration::from_secs(60));
        let err = SshTarget::from_policy(&incomplete, timeouts.0, timeouts.1).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("host"));
        assert!(message.contains("remote path"));
        assert!(!message.contains("user"));
    }

    #[test]
    fn test_parse_progress() {
        assert_eq!(parse_progress("     32,768  42%   1.10MB/s    0:00:03"), Some(42));
        assert_eq!(
            parse_progress("  1,048,576 100%  10.00MB/s    0:00:00 (xfr#1)"),
            Some(100)
        );
        assert_eq!(parse_progress("sending incremental file list"), None);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/srv/backups"), "'/srv/backups'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_remote_shell_keeps_key_path_whole() {
        let mut spaced = policy();
        spaced.private_key_path = Some(PathBuf::from("/home/ops/My Keys/id_ed25519"));
        let target =
            SshTarget::from_policy(&spaced, Duration::from_secs(10), Duration::from_secs(60))
                .unwrap();

        let shell = target.remote_shell();
        assert!(shell.starts_with("ssh '-o' 'BatchMode=yes'"));
        assert!(shell.ends_with("'-i' '/home/ops/My Keys/id_ed25519'"));
    }
}
