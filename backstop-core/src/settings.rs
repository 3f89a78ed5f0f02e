//! Runtime policy settings
//!
//! Encryption, offsite and advanced tuning policies are looked up on every
//! operation through [`SettingsProvider`], so an administrator can change
//! them without restarting the engine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::Result;

/// Global encryption policy
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionPolicy {
    pub enabled: bool,
    /// Secret used when a request does not carry its own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Named offsite providers; only `Ssh` has a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OffsiteProvider {
    #[default]
    Ssh,
    S3,
    Gcs,
    Azure,
    Ftp,
}

impl fmt::Display for OffsiteProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OffsiteProvider::Ssh => "ssh",
            OffsiteProvider::S3 => "s3",
            OffsiteProvider::Gcs => "gcs",
            OffsiteProvider::Azure => "azure",
            OffsiteProvider::Ftp => "ftp",
        };
        f.write_str(name)
    }
}

/// Offsite replication policy
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OffsitePolicy {
    pub enabled: bool,
    #[serde(default)]
    pub provider: OffsiteProvider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_path: Option<String>,
    /// Private key used for the remote-shell session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<PathBuf>,
    /// Remove the local artifact once it is safely offsite
    #[serde(default)]
    pub delete_local_after_transfer: bool,
    /// Informational; the scheduler drives actual backup cadence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_frequency: Option<String>,
}

/// Tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AdvancedPolicy {
    /// gzip level 0-9
    pub compression_level: u32,
    pub parallelism: usize,
    /// Attempts for offsite transfers
    pub retry_count: usize,
    /// Seconds; applies to remote commands
    pub timeout_secs: u64,
}

impl Default for AdvancedPolicy {
    fn default() -> Self {
        Self {
            compression_level: 6,
            parallelism: num_cpus::get().max(1),
            retry_count: 3,
            timeout_secs: 300,
        }
    }
}

/// Source of runtime policy
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn encryption_policy(&self) -> Result<EncryptionPolicy>;
    async fn offsite_policy(&self) -> Result<OffsitePolicy>;
    async fn advanced_policy(&self) -> Result<AdvancedPolicy>;
}

/// All three policies in one serializable document
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SettingsDocument {
    #[serde(default)]
    pub encryption: EncryptionPolicy,
    #[serde(default)]
    pub offsite: OffsitePolicy,
    #[serde(default)]
    pub advanced: AdvancedPolicy,
}

/// In-process settings, replaceable at runtime
#[derive(Debug, Default)]
pub struct StaticSettings {
    inner: RwLock<SettingsDocument>,
}

impl StaticSettings {
    pub fn new(document: SettingsDocument) -> Self {
        Self {
            inner: RwLock::new(document),
        }
    }

    /// Load settings from a JSON file; a missing file yields defaults
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read(path)?;
        let document: SettingsDocument = serde_json::from_slice(&raw)?;
        Ok(Self::new(document))
    }

    pub fn snapshot(&self) -> SettingsDocument {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn update<F: FnOnce(&mut SettingsDocument)>(&self, f: F) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard);
    }
}

#[async_trait]
impl SettingsProvider for StaticSettings {
    async fn encryption_policy(&self) -> Result<EncryptionPolicy> {
        Ok(self.snapshot().encryption)
    }

    async fn offsite_policy(&self) -> Result<OffsitePolicy> {
        Ok(self.snapshot().offsite)
    }

    async fn advanced_policy(&self) -> Result<AdvancedPolicy> {
        Ok(self.snapshot().advanced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_settings_update() {
        let settings = StaticSettings::default();
        assert!(!settings.encryption_policy().await.unwrap().enabled);

        settings.update(|doc| {
            doc.encryption.enabled = true;
            doc.offsite.provider = OffsiteProvider::S3;
        });

        assert!(settings.encryption_policy().await.unwrap().enabled);
        assert_eq!(
            settings.offsite_policy().await.unwrap().provider,
            OffsiteProvider::S3
        );
    }

    #[test]
    fn test_document_parses_partial_json() {
        let doc: SettingsDocument = serde_json::from_str(
            r#"{"offsite": {"enabled": true, "host": "backup.example.com", "remotePath": "/srv/backups"}}"#,
        )
        .unwrap();
        assert!(doc.offsite.enabled);
        assert_eq!(doc.offsite.provider, OffsiteProvider::Ssh);
        assert_eq!(doc.offsite.remote_path.as_deref(), Some("/srv/backups"));
        assert_eq!(doc.advanced.compression_level, 6);
    }

    #[test]
    fn test_missing_settings_file_gives_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = StaticSettings::from_file(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings.snapshot(), SettingsDocument::default());
    }
}
