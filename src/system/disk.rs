//! Free-space gate run once before any repository is touched.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::MirrorError;
use crate::remote::RepositoryRef;

/// Default margin applied to each repository's size estimate.
pub const DEFAULT_MARGIN_FACTOR: f64 = 1.2;
/// Default fixed floor added on top of the scaled estimates (2 GB).
pub const DEFAULT_MIN_BUFFER_BYTES: u64 = 2_000_000_000;

/// Sizing parameters for the precheck.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskPolicy {
    /// Multiplier covering working-copy overhead.
    pub margin_factor: f64,
    pub min_buffer_bytes: u64,
}

impl Default for DiskPolicy {
    fn default() -> Self {
        Self {
            margin_factor: DEFAULT_MARGIN_FACTOR,
            min_buffer_bytes: DEFAULT_MIN_BUFFER_BYTES,
        }
    }
}

/// Source of "bytes available" for a path.
pub trait FreeSpace: Send + Sync {
    fn available_bytes(&self, path: &Path) -> Result<u64>;
}

/// Queries the mounted filesystem holding the path.
///
/// Picks the disk with the longest mount point that prefixes the path; if
/// none matches, asks `df`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemFreeSpace;

impl FreeSpace for SystemFreeSpace {
    fn available_bytes(&self, path: &Path) -> Result<u64> {
        let path = path
            .canonicalize()
            .with_context(|| format!("failed to resolve {}", path.display()))?;

        let disks = sysinfo::Disks::new_with_refreshed_list();
        let best = disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len());

        match best {
            Some(disk) => {
                debug!(
                    path = %path.display(),
                    mount = %disk.mount_point().display(),
                    available = disk.available_space(),
                    "free space from mount table"
                );
                Ok(disk.available_space())
            }
            None => df_available(&path),
        }
    }
}

/// `df --block-size=1 --output=avail <path>`: header line, then one number.
fn df_available(path: &Path) -> Result<u64> {
    let output = Command::new("df")
        .arg("--block-size=1")
        .arg("--output=avail")
        .arg(path)
        .output()
        .context("failed to run df")?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_df_avail(&stdout)
}

fn parse_df_avail(stdout: &str) -> Result<u64> {
    let lines: Vec<&str> = stdout.trim().lines().collect();
    if lines.len() < 2 {
        anyhow::bail!("unexpected df output format");
    }
    lines[lines.len() - 1]
        .trim()
        .parse::<u64>()
        .context("invalid disk space value")
}

/// Outcome of a passing check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskVerdict {
    pub required: u64,
    pub available: u64,
}

/// Fails a run fast when the destination cannot hold the mirrors.
#[derive(Clone)]
pub struct DiskSpacePrecheck {
    policy: DiskPolicy,
    free_space: Arc<dyn FreeSpace>,
}

impl Default for DiskSpacePrecheck {
    fn default() -> Self {
        Self::new(DiskPolicy::default(), Arc::new(SystemFreeSpace))
    }
}

impl DiskSpacePrecheck {
    pub fn new(policy: DiskPolicy, free_space: Arc<dyn FreeSpace>) -> Self {
        Self { policy, free_space }
    }

    pub fn policy(&self) -> DiskPolicy {
        self.policy
    }

    /// Sum of size estimates scaled by the margin, plus the fixed buffer.
    pub fn estimate_required(&self, repositories: &[RepositoryRef]) -> u64 {
        repositories
            .iter()
            .map(|repo| (repo.size_bytes as f64 * self.policy.margin_factor).round() as u64)
            .fold(self.policy.min_buffer_bytes, u64::saturating_add)
    }

    /// Check that `path` has at least `required` bytes free, creating the
    /// directory first if it does not exist.
    pub fn check_sufficient(&self, path: &Path, required: u64) -> Result<DiskVerdict, MirrorError> {
        std::fs::create_dir_all(path).map_err(|source| MirrorError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let available = self
            .free_space
            .available_bytes(path)
            .map_err(|source| MirrorError::FreeSpace {
                path: path.to_path_buf(),
                source,
            })?;

        if available < required {
            return Err(MirrorError::DiskSpace {
                path: PathBuf::from(path),
                required,
                available,
            });
        }

        info!(
            path = %path.display(),
            required_gb = required as f64 / 1e9,
            available_gb = available as f64 / 1e9,
            "disk space check passed"
        );
        Ok(DiskVerdict {
            required,
            available,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(u64);

    impl FreeSpace for Fixed {
        fn available_bytes(&self, _path: &Path) -> Result<u64> {
            Ok(self.0)
        }
    }

    struct Unmeasurable;

    impl FreeSpace for Unmeasurable {
        fn available_bytes(&self, _path: &Path) -> Result<u64> {
            Err(anyhow::anyhow!("statvfs failed: device gone")).context("df exited with status 1")
        }
    }

    fn repo(name: &str, size_bytes: u64) -> RepositoryRef {
        RepositoryRef::new(format!("octo/{name}"), format!("https://example.test/octo/{name}.git"))
            .with_size(size_bytes)
    }

    fn precheck(available: u64) -> DiskSpacePrecheck {
        DiskSpacePrecheck::new(DiskPolicy::default(), Arc::new(Fixed(available)))
    }

    #[test]
    fn test_estimate_applies_margin_and_buffer() {
        let repos = vec![repo("a", 1_500_000_000), repo("b", 500_000_000)];
        assert_eq!(precheck(0).estimate_required(&repos), 4_400_000_000);
    }

    #[test]
    fn test_estimate_for_no_repositories_is_buffer() {
        assert_eq!(precheck(0).estimate_required(&[]), DEFAULT_MIN_BUFFER_BYTES);
    }

    #[test]
    fn test_free_space_failure_keeps_cause_chain() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = DiskSpacePrecheck::new(DiskPolicy::default(), Arc::new(Unmeasurable))
            .check_sufficient(dir.path(), 1)
            .unwrap_err();
        assert!(matches!(err, MirrorError::FreeSpace { .. }), "{err}");
        assert!(err.to_string().starts_with("failed to measure free space"));

        let chain = format!("{:#}", anyhow::Error::from(err));
        assert!(chain.contains("df exited with status 1"), "{chain}");
        assert!(chain.contains("device gone"), "{chain}");
        let err = MirrorError::FreeSpace {
            path: dir.path().to_path_buf(),
            source: anyhow::anyhow!("inner cause"),
        };
        let source = std::error::Error::source(&err);
        assert_eq!(source.map(|s| s.to_string()).as_deref(), Some("inner cause"));
    }

    #[test]
    fn test_insufficient_space_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = precheck(1_000_000_000)
            .check_sufficient(dir.path(), 4_400_000_000)
            .unwrap_err();
        match err {
            MirrorError::DiskSpace {
                required,
                available,
                ..
            } => {
                assert_eq!(required, 4_400_000_000);
                assert_eq!(available, 1_000_000_000);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_sufficient_space_passes_and_creates_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("mirrors").join("nested");
        let verdict = precheck(5_000_000_000)
            .check_sufficient(&target, 4_400_000_000)
            .unwrap();
        assert_eq!(verdict.available, 5_000_000_000);
        assert!(target.is_dir());
    }

    #[test]
    fn test_custom_policy() {
        let policy = DiskPolicy {
            margin_factor: 2.0,
            min_buffer_bytes: 0,
        };
        let check = DiskSpacePrecheck::new(policy, Arc::new(Fixed(0)));
        assert_eq!(check.estimate_required(&[repo("a", 10)]), 20);
    }

    #[test]
    fn test_parse_df_output() {
        assert_eq!(parse_df_avail("    Avail\n123456789\n").unwrap(), 123_456_789);
        assert!(parse_df_avail("Avail\n").is_err());
        assert!(parse_df_avail("Avail\nlots\n").is_err());
    }

    #[test]
    fn test_system_free_space_reports_temp_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        if let Ok(bytes) = SystemFreeSpace.available_bytes(dir.path()) {
            assert!(bytes > 0);
        }
    }
}
