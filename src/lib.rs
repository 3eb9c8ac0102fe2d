//! repomirror -- resumable mirroring of hosted git repositories from one
//! account to another.
//!
//! The core is the [`pipeline::PipelineController`]: it gates a run on free
//! disk space, then transfers one repository at a time with bounded retries,
//! recording every transition in a crash-safe [`ledger::ProgressStore`] so an
//! interrupted run resumes where it stopped.

pub mod config;
pub mod error;
pub mod events;
pub mod ignore;
pub mod ledger;
pub mod logging;
pub mod pipeline;
pub mod remote;
pub mod system;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::MirrorConfig;
use crate::error::MirrorError;
use crate::ignore::IgnoreList;
use crate::ledger::ProgressStore;
use crate::pipeline::{PipelineController, RunContext, RunControls, RunOptions, RunReport};
use crate::remote::git::GitTransporter;
use crate::remote::github::GitHubClient;
use crate::remote::{Credentials, SourceLister};
use crate::system::{DiskSpacePrecheck, SystemFreeSpace};

/// Caller-supplied inputs for one mirror run. `None` fields fall back to the
/// configuration.
#[derive(Debug, Clone)]
pub struct MirrorRequest {
    pub credentials: Credentials,
    pub destination: Option<PathBuf>,
    pub retry_limit: Option<u32>,
    pub repo_limit: Option<usize>,
}

/// Logins behind the two tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedAccounts {
    pub source: String,
    pub destination: String,
}

fn clients(config: &MirrorConfig, credentials: &Credentials) -> Result<(GitHubClient, GitHubClient)> {
    if !credentials.is_complete() {
        return Err(MirrorError::Config(
            "both SOURCE_GITHUB_TOKEN and DEST_GITHUB_TOKEN must be set".into(),
        )
        .into());
    }
    let source = GitHubClient::new(
        &config.github.api_url,
        credentials.source(),
        config.github.per_page,
    )?;
    let destination = GitHubClient::new(
        &config.github.api_url,
        credentials.destination(),
        config.github.per_page,
    )?;
    Ok((source, destination))
}

async fn validate_clients(source: &GitHubClient, destination: &GitHubClient) -> Result<ValidatedAccounts> {
    let source = source
        .authenticated_login()
        .await
        .context("source token rejected")?;
    let destination = destination
        .authenticated_login()
        .await
        .context("destination token rejected")?;
    tracing::info!(%source, %destination, "tokens validated");
    Ok(ValidatedAccounts {
        source,
        destination,
    })
}

/// Check both tokens against the hosting API.
pub async fn validate_tokens(config: &MirrorConfig, credentials: &Credentials) -> Result<ValidatedAccounts> {
    let (source, destination) = clients(config, credentials)?;
    validate_clients(&source, &destination).await
}

/// Validate credentials, list the source account, and run the pipeline.
pub async fn run_mirror(
    config: &MirrorConfig,
    request: MirrorRequest,
    controls: RunControls,
) -> Result<RunReport> {
    let (source, destination) = clients(config, &request.credentials)?;
    validate_clients(&source, &destination).await?;

    let repositories = source
        .list_repositories()
        .await
        .context("failed to list source repositories")?;
    let ignore = IgnoreList::load(&config.paths.ignore_file)?;
    if !ignore.is_empty() {
        tracing::info!(entries = ignore.len(), "ignore list loaded");
    }

    let store = Arc::new(
        ProgressStore::open(&config.paths.ledger)
            .with_context(|| format!("failed to open ledger {}", config.paths.ledger.display()))?,
    );
    let transporter = GitTransporter::new(
        config.git.binary.clone(),
        config.git.command_timeout(),
        config.git.remove_timeout(),
    );
    let controller = PipelineController::new(store, Arc::new(destination), Arc::new(transporter))
        .with_disk_check(DiskSpacePrecheck::new(config.disk, Arc::new(SystemFreeSpace)))
        .with_progress(Arc::new(|percent: f64| {
            tracing::debug!(percent, "progress");
        }));

    let ctx = RunContext {
        credentials: request.credentials,
        destination: request
            .destination
            .unwrap_or_else(|| config.paths.destination.clone()),
        options: RunOptions {
            retry_limit: request.retry_limit.unwrap_or(config.pipeline.retry_limit),
            repo_limit: request.repo_limit.or(config.pipeline.repo_limit),
            ignore,
        },
    };

    Ok(controller.run(&repositories, &ctx, controls).await?)
}
