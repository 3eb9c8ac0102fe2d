//! `git` CLI transport: bare mirror clones under the destination directory,
//! pushed to the destination remote.
//!
//! Tokens are only ever passed on the command line for the duration of one
//! command; the working copy's configured remote never contains them, and
//! they are scrubbed from any output that ends up in an error message.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use reqwest::Url;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{TransferError, TransferErrorKind};

use super::{Credentials, DestinationRepo, RepositoryRef, Transporter};

const REFSPECS: [&str; 2] = ["+refs/heads/*:refs/heads/*", "+refs/tags/*:refs/tags/*"];

/// Transport backed by the `git` executable.
#[derive(Debug, Clone)]
pub struct GitTransporter {
    binary: String,
    command_timeout: Duration,
    remove_timeout: Duration,
}

impl Default for GitTransporter {
    fn default() -> Self {
        Self::new("git", Duration::from_secs(3600), Duration::from_secs(300))
    }
}

impl GitTransporter {
    pub fn new(binary: impl Into<String>, command_timeout: Duration, remove_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            command_timeout,
            remove_timeout,
        }
    }

    /// Run one git command, returning stdout. Failures are classified from
    /// stderr with `secrets` scrubbed out.
    async fn git(&self, args: &[&str], cwd: Option<&Path>, secrets: &[&str]) -> Result<String, TransferError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let verb = args.first().copied().unwrap_or_default();
        let output = match tokio::time::timeout(self.command_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(TransferError::transient(format!(
                    "failed to spawn {} {verb}: {e}",
                    self.binary
                )))
            }
            Err(_) => {
                return Err(TransferError::timeout(format!(
                    "git {verb} did not finish within {}s",
                    self.command_timeout.as_secs()
                )))
            }
        };

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = redact(&String::from_utf8_lossy(&output.stderr), secrets);
        let kind = classify_failure(&stderr);
        Err(TransferError::new(
            kind,
            format!("git {verb} failed ({}): {}", output.status, stderr.trim()),
        ))
    }

    /// A working copy is usable iff git resolves its git-dir to the copy
    /// itself (a bare mirror), not to some enclosing repository.
    async fn validate_copy(&self, local_path: &Path) -> Result<(), TransferError> {
        let reported = self
            .git(&["rev-parse", "--absolute-git-dir"], Some(local_path), &[])
            .await
            .map_err(|e| {
                TransferError::corrupt(format!(
                    "{} is not a git repository: {}",
                    local_path.display(),
                    e.message
                ))
            })?;

        let expected = local_path
            .canonicalize()
            .map_err(|e| TransferError::corrupt(format!("cannot resolve {}: {e}", local_path.display())))?;
        let reported = Path::new(reported.trim())
            .canonicalize()
            .unwrap_or_else(|_| Path::new(reported.trim()).to_path_buf());

        if reported != expected {
            return Err(TransferError::corrupt(format!(
                "{} is not a mirror clone (git dir resolves to {})",
                local_path.display(),
                reported.display()
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transporter for GitTransporter {
    async fn ensure_mirrored(
        &self,
        source: &RepositoryRef,
        local_path: &Path,
        credentials: &Credentials,
    ) -> Result<(), TransferError> {
        let secrets = [credentials.source()];
        let source_url = authenticated_url(&source.clone_url, credentials.source());
        let local = local_path.to_string_lossy();

        if local_path.exists() {
            self.validate_copy(local_path).await?;
            info!(repo = %source.full_name, path = %local, "updating working copy");
            let mut args = vec!["fetch", "--prune", source_url.as_str()];
            args.extend(REFSPECS);
            self.git(&args, Some(local_path), &secrets).await?;
        } else {
            info!(repo = %source.full_name, path = %local, "cloning working copy");
            self.git(&["clone", "--mirror", source_url.as_str(), local.as_ref()], None, &secrets)
                .await?;
            // Keep the token out of the on-disk config.
            self.git(
                &["remote", "set-url", "origin", source.clone_url.as_str()],
                Some(local_path),
                &secrets,
            )
            .await?;
        }
        Ok(())
    }

    async fn push(
        &self,
        source: &RepositoryRef,
        destination: &DestinationRepo,
        local_path: &Path,
        credentials: &Credentials,
    ) -> Result<(), TransferError> {
        let secrets = [credentials.source(), credentials.destination()];
        let dest_url = authenticated_url(&destination.clone_url, credentials.destination());

        debug!(repo = %source.full_name, destination = %destination.full_name, "pushing branches and tags");
        self.git(&["push", "--all", dest_url.as_str()], Some(local_path), &secrets)
            .await?;
        self.git(&["push", "--tags", dest_url.as_str()], Some(local_path), &secrets)
            .await?;
        Ok(())
    }

    async fn discard(&self, local_path: &Path) -> Result<(), TransferError> {
        warn!(path = %local_path.display(), "removing working copy");
        match tokio::time::timeout(self.remove_timeout, tokio::fs::remove_dir_all(local_path)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Ok(Err(e)) => Err(TransferError::transient(format!(
                "failed to remove {}: {e}",
                local_path.display()
            ))),
            Err(_) => Err(TransferError::timeout(format!(
                "removing {} took longer than {}s",
                local_path.display(),
                self.remove_timeout.as_secs()
            ))),
        }
    }
}

/// Embed `token` into an http(s) URL. Other URLs (local paths, ssh) are
/// returned unchanged.
pub fn authenticated_url(url: &str, token: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) if !token.is_empty() && matches!(parsed.scheme(), "http" | "https") => {
            if parsed.set_username("x-access-token").is_err() || parsed.set_password(Some(token)).is_err() {
                return url.to_string();
            }
            parsed.to_string()
        }
        _ => url.to_string(),
    }
}

fn redact(text: &str, secrets: &[&str]) -> String {
    secrets
        .iter()
        .filter(|s| !s.is_empty())
        .fold(text.to_string(), |acc, secret| acc.replace(secret, "***"))
}

fn classify_failure(stderr: &str) -> TransferErrorKind {
    let lower = stderr.to_lowercase();
    if lower.contains("not a git repository") {
        TransferErrorKind::CorruptWorkingCopy
    } else if lower.contains("repository not found")
        || (lower.contains("repository") && lower.contains("not found"))
    {
        TransferErrorKind::NotFound
    } else if lower.contains("authentication failed")
        || lower.contains("could not read username")
        || lower.contains("permission denied")
        || lower.contains("returned error: 403")
    {
        TransferErrorKind::Auth
    } else {
        TransferErrorKind::Transient
    }
}
