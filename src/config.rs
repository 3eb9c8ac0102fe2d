//! TOML configuration for repomirror.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) is a valid configuration. Credentials are deliberately absent: they
//! come from the command line or the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::remote::github::DEFAULT_API_URL;
use crate::system::DiskPolicy;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "REPOMIRROR_CONFIG";
/// Config file picked up from the working directory.
pub const LOCAL_CONFIG: &str = "repomirror.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub disk: DiskPolicy,
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl MirrorConfig {
    /// Load and validate configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve configuration for a command.
    ///
    /// An explicitly given path must load. Otherwise, in order:
    /// 1. The path in `REPOMIRROR_CONFIG`.
    /// 2. `./repomirror.toml`.
    /// 3. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }

    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "REPOMIRROR_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.retry_limit == 0 {
            anyhow::bail!("pipeline.retry_limit must be at least 1");
        }
        if self.pipeline.repo_limit == Some(0) {
            anyhow::bail!("pipeline.repo_limit must be at least 1 when set");
        }
        if !(self.disk.margin_factor >= 1.0 && self.disk.margin_factor.is_finite()) {
            anyhow::bail!("disk.margin_factor must be a finite number >= 1.0");
        }
        if !(1..=100).contains(&self.github.per_page) {
            anyhow::bail!("github.per_page must be between 1 and 100");
        }
        if self.git.binary.trim().is_empty() {
            anyhow::bail!("git.binary must not be empty");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of the local working copies.
    pub destination: PathBuf,
    /// Ledger file; its backup sits next to it with `.bak` appended.
    pub ledger: PathBuf,
    pub ignore_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            destination: PathBuf::from("backups"),
            ledger: PathBuf::from("progress.json"),
            ignore_file: PathBuf::from("ignored_repos.txt"),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Attempts per repository.
    pub retry_limit: u32,
    pub repo_limit: Option<usize>,
    /// Age after which `cleanup` drops ledger records.
    pub retention_days: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            repo_limit: None,
            retention_days: 90,
        }
    }
}

// ---------------------------------------------------------------------------
// GitHub
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    /// REST endpoint; point at `/api/v3` for GitHub Enterprise.
    pub api_url: String,
    pub per_page: u32,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            per_page: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub binary: String,
    /// Upper bound for one clone, fetch or push.
    pub command_timeout_secs: u64,
    /// Upper bound for deleting a working copy.
    pub remove_timeout_secs: u64,
}

impl GitConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn remove_timeout(&self) -> Duration {
        Duration::from_secs(self.remove_timeout_secs)
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: "git".to_string(),
            command_timeout_secs: 3600,
            remove_timeout_secs: 300,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Append-only log of everything at `level`. Empty disables it.
    pub file: Option<PathBuf>,
    /// Append-only log of errors only. Empty disables it.
    pub error_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn log_file(&self) -> Option<&Path> {
        non_empty(&self.file)
    }

    pub fn error_log_file(&self) -> Option<&Path> {
        non_empty(&self.error_file)
    }
}

fn non_empty(path: &Option<PathBuf>) -> Option<&Path> {
    path.as_deref().filter(|p| !p.as_os_str().is_empty())
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: Some(PathBuf::from("repomirror.log")),
            error_file: Some(PathBuf::from("repomirror-error.log")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
