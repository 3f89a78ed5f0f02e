//! Host disk usage for the volume holding the backup directory.

use serde::{Deserialize, Serialize};
use std::path::Path;
use walkdir::WalkDir;

/// Where a [`DiskUsage`] figure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageSource {
    /// `statvfs` on the volume
    Host,
    /// Walked the directory; capacity unknown
    Estimate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub used_bytes: u64,
    pub source: UsageSource,
}

impl DiskUsage {
    /// Percentage of the volume in use, when capacity is known
    pub fn used_percent(&self) -> Option<f64> {
        (self.source == UsageSource::Host && self.total_bytes > 0)
            .then(|| self.used_bytes as f64 * 100.0 / self.total_bytes as f64)
    }
}

/// Usage of the volume containing `path`
///
/// Falls back to the size of `path` itself when the host query fails.
pub fn disk_usage(path: &Path) -> DiskUsage {
    volume_usage(path).unwrap_or_else(|| {
        let used = directory_size(path);
        DiskUsage {
            total_bytes: 0,
            free_bytes: 0,
            used_bytes: used,
            source: UsageSource::Estimate,
        }
    })
}

/// Sum of regular file sizes below `path`
pub fn directory_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

#[cfg(unix)]
fn volume_usage(path: &Path) -> Option<DiskUsage> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let raw = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::statvfs(raw.as_ptr(), &mut stat) };
    if result != 0 {
        return None;
    }
    let block_size = u128::from(stat.f_frsize.max(stat.f_bsize));
    let total = saturate(block_size.saturating_mul(u128::from(stat.f_blocks)));
    let free = saturate(block_size.saturating_mul(u128::from(stat.f_bavail)));
    let unused = saturate(block_size.saturating_mul(u128::from(stat.f_bfree)));
    Some(DiskUsage {
        total_bytes: total,
        free_bytes: free,
        used_bytes: total.saturating_sub(unused),
        source: UsageSource::Host,
    })
}

#[cfg(not(unix))]
fn volume_usage(_path: &Path) -> Option<DiskUsage> {
    None
}

fn saturate(value: u128) -> u64 {
    value.min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_saturate_clamps() {
        assert_eq!(saturate(10), 10);
        assert_eq!(saturate(u128::MAX), u64::MAX);
    }

    #[test]
    fn test_missing_path_falls_back_to_estimate() {
        let usage = disk_usage(Path::new("/path/not/found/backstop"));
        assert_eq!(usage.source, UsageSource::Estimate);
        assert_eq!(usage.used_bytes, 0);
        assert_eq!(usage.used_percent(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_existing_path_reads_host() {
        let dir = TempDir::new().unwrap();
        let usage = disk_usage(dir.path());
        assert_eq!(usage.source, UsageSource::Host);
        assert!(usage.total_bytes >= usage.free_bytes);
    }

    #[test]
    fn test_directory_size() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b"), vec![0u8; 50]).unwrap();
        assert_eq!(directory_size(dir.path()), 150);
    }
}
