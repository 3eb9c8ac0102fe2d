//! The mirror run: disk gate, candidate selection, then one repository at a
//! time through the transfer collaborators with bounded retries.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{MirrorError, TransferError, TransferErrorKind};
use crate::events::{EventSink, NoProgress, Phase, PipelineEvent, ProgressSink, TracingEvents};
use crate::ignore::IgnoreList;
use crate::ledger::{PipelineState, ProgressStore, RecordStatus};
use crate::remote::{Credentials, DestinationRegistrar, RepositoryRef, Transporter};
use crate::system::DiskSpacePrecheck;

use super::control::{RunControls, Signal, StopReason};
use super::report::{RunReport, SkippedRepo};
use super::retry::{Decision, RetryPolicy};

/// Per-run tunables.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Total attempts per repository; must be at least 1.
    pub retry_limit: u32,
    /// Process at most this many candidates (after ignore filtering).
    pub repo_limit: Option<usize>,
    pub ignore: IgnoreList,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            retry_limit: RetryPolicy::default().limit(),
            repo_limit: None,
            ignore: IgnoreList::default(),
        }
    }
}

/// Inputs validated by the caller and passed by value into a run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub credentials: Credentials,
    /// Root directory for local working copies.
    pub destination: PathBuf,
    pub options: RunOptions,
}

enum Outcome {
    Completed { attempts: u32 },
    Skipped { reason: String, attempts: u32 },
    Failed { reason: String, attempts: u32 },
}

/// Drives end-to-end mirror runs against one ledger.
pub struct PipelineController {
    store: Arc<ProgressStore>,
    registrar: Arc<dyn DestinationRegistrar>,
    transporter: Arc<dyn Transporter>,
    disk: DiskSpacePrecheck,
    events: Arc<dyn EventSink>,
    progress: Arc<dyn ProgressSink>,
}

impl PipelineController {
    pub fn new(
        store: Arc<ProgressStore>,
        registrar: Arc<dyn DestinationRegistrar>,
        transporter: Arc<dyn Transporter>,
    ) -> Self {
        Self {
            store,
            registrar,
            transporter,
            disk: DiskSpacePrecheck::default(),
            events: Arc::new(TracingEvents),
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_disk_check(mut self, disk: DiskSpacePrecheck) -> Self {
        self.disk = disk;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn store(&self) -> &Arc<ProgressStore> {
        &self.store
    }

    /// Run the pipeline over `repositories` in order.
    ///
    /// Setup failures (missing inputs, disk space, ledger I/O) are returned as
    /// errors before any repository is touched. Per-repository failures are
    /// recorded in the ledger and itemised in the report.
    pub async fn run(
        &self,
        repositories: &[RepositoryRef],
        ctx: &RunContext,
        mut controls: RunControls,
    ) -> Result<RunReport, MirrorError> {
        validate_context(ctx)?;
        let run_id = Uuid::new_v4();
        let policy = RetryPolicy::new(ctx.options.retry_limit);

        self.store.set_state(PipelineState::Running)?;
        self.info(
            PipelineEvent::new(
                Phase::Setup,
                format!(
                    "run started: {} repositories listed, retry limit {}",
                    repositories.len(),
                    policy.limit()
                ),
            )
            .with_run(run_id),
        );

        let required = self.disk.estimate_required(repositories);
        match self.disk.check_sufficient(&ctx.destination, required) {
            Ok(verdict) => self.info(
                PipelineEvent::new(
                    Phase::DiskCheck,
                    format!(
                        "disk space ok: {} bytes required, {} available",
                        verdict.required, verdict.available
                    ),
                )
                .with_run(run_id),
            ),
            Err(e) => {
                self.error(PipelineEvent::new(Phase::DiskCheck, e.to_string()).with_run(run_id));
                self.store.set_state(PipelineState::Error)?;
                return Err(e);
            }
        }

        let candidates = select_candidates(repositories, &ctx.options);
        let total = candidates.len();
        self.store
            .mark_pending(candidates.iter().map(|r| r.full_name.as_str()))?;

        let mut report = RunReport::new(run_id, total);

        for (index, repo) in candidates.iter().enumerate() {
            if let Some(reason) = self.checkpoint(&mut controls, run_id).await? {
                self.info(
                    PipelineEvent::new(
                        Phase::Checkpoint,
                        format!("stopping before {} ({reason:?})", repo.full_name),
                    )
                    .with_run(run_id),
                );
                report.stopped = Some(reason);
                break;
            }

            if self.store.is_already_done(&repo.full_name) {
                self.info(
                    PipelineEvent::new(Phase::Checkpoint, "already completed, skipping")
                        .with_run(run_id)
                        .with_repo(&repo.full_name),
                );
                report.already_done += 1;
                self.report_progress(index + 1, total);
                continue;
            }

            self.store
                .record_outcome(&repo.full_name, RecordStatus::InProgress, None)?;

            match self.transfer(repo, ctx, policy, run_id).await {
                Outcome::Completed { attempts } => {
                    self.store
                        .record_outcome(&repo.full_name, RecordStatus::Completed, None)?;
                    self.info(
                        PipelineEvent::new(Phase::Record, "mirrored")
                            .with_run(run_id)
                            .with_repo(&repo.full_name)
                            .with_attempt(attempts),
                    );
                    report.completed += 1;
                }
                Outcome::Skipped { reason, attempts } => {
                    self.store.record_outcome(
                        &repo.full_name,
                        RecordStatus::Error,
                        Some(format!("skipped: {reason}")),
                    )?;
                    report.skipped.push(SkippedRepo {
                        full_name: repo.full_name.clone(),
                        reason,
                        attempts,
                    });
                }
                Outcome::Failed { reason, attempts } => {
                    self.store.record_outcome(
                        &repo.full_name,
                        RecordStatus::Error,
                        Some(reason.clone()),
                    )?;
                    report.failed.push(SkippedRepo {
                        full_name: repo.full_name.clone(),
                        reason,
                        attempts,
                    });
                }
            }
            self.report_progress(index + 1, total);
        }

        if total == 0 {
            self.progress.report(100.0);
        }

        report.state = match report.stopped {
            None => PipelineState::Completed,
            Some(StopReason::Cancelled) => PipelineState::Paused,
            Some(StopReason::Halted) => PipelineState::Running,
        };
        self.store.set_state(report.state)?;
        self.summarize(&report);
        Ok(report)
    }

    /// Poll the controls before starting a repository. A pause blocks here
    /// until it is cleared or the run is told to stop.
    async fn checkpoint(
        &self,
        controls: &mut RunControls,
        run_id: Uuid,
    ) -> Result<Option<StopReason>, MirrorError> {
        match controls.poll() {
            Signal::Proceed => Ok(None),
            Signal::Stop(reason) => Ok(Some(reason)),
            Signal::Paused => {
                self.store.set_state(PipelineState::Paused)?;
                self.info(PipelineEvent::new(Phase::Checkpoint, "paused").with_run(run_id));
                match controls.wait_while_paused().await {
                    Signal::Stop(reason) => Ok(Some(reason)),
                    _ => {
                        self.store.set_state(PipelineState::Running)?;
                        self.info(PipelineEvent::new(Phase::Checkpoint, "resumed").with_run(run_id));
                        Ok(None)
                    }
                }
            }
        }
    }

    async fn transfer(
        &self,
        repo: &RepositoryRef,
        ctx: &RunContext,
        policy: RetryPolicy,
        run_id: Uuid,
    ) -> Outcome {
        let local = ctx.destination.join(repo.name());
        let mut attempts = 0;
        loop {
            attempts += 1;
            let err = match self.attempt(repo, &local, &ctx.credentials, run_id, attempts).await {
                Ok(()) => return Outcome::Completed { attempts },
                Err(err) => err,
            };
            let event = PipelineEvent::new(Phase::Transfer, err.to_string())
                .with_run(run_id)
                .with_repo(&repo.full_name)
                .with_attempt(attempts);

            match policy.decide(&err, attempts) {
                Decision::Retry => self.info(event),
                Decision::Skip { reason } => {
                    self.error(event);
                    return Outcome::Skipped { reason, attempts };
                }
                Decision::GiveUp { reason } => {
                    self.error(event);
                    return Outcome::Failed { reason, attempts };
                }
            }
        }
    }

    /// One full attempt: local copy, destination, push, settings.
    ///
    /// The destination is resolved only after the local copy is current. An
    /// unusable working copy is removed and fetched again within the same attempt.
    async fn attempt(
        &self,
        repo: &RepositoryRef,
        local: &Path,
        credentials: &Credentials,
        run_id: Uuid,
        attempt: u32,
    ) -> Result<(), TransferError> {
        match self.transporter.ensure_mirrored(repo, local, credentials).await {
            Err(err) if err.kind == TransferErrorKind::CorruptWorkingCopy => {
                self.info(
                    PipelineEvent::new(
                        Phase::Retry,
                        format!("removing working copy for a fresh transfer: {err}"),
                    )
                    .with_run(run_id)
                    .with_repo(&repo.full_name)
                    .with_attempt(attempt),
                );
                self.transporter.discard(local).await.map_err(|e| {
                    if e.kind == TransferErrorKind::Timeout {
                        e
                    } else {
                        TransferError::transient(format!("discard failed: {}", e.message))
                    }
                })?;
                self.transporter.ensure_mirrored(repo, local, credentials).await?;
            }
            other => other?,
        }

        let destination = self.registrar.get_or_create(repo).await?;
        self.transporter
            .push(repo, &destination, local, credentials)
            .await?;
        self.registrar.sync_settings(repo, &destination).await
    }

    fn report_progress(&self, resolved: usize, total: usize) {
        if total > 0 {
            self.progress.report(resolved as f64 / total as f64 * 100.0);
        }
    }

    fn summarize(&self, report: &RunReport) {
        for entry in &report.skipped {
            self.error(
                PipelineEvent::new(Phase::Summary, format!("skipped: {}", entry.reason))
                    .with_run(report.run_id)
                    .with_repo(&entry.full_name)
                    .with_attempt(entry.attempts),
            );
        }
        for entry in &report.failed {
            self.error(
                PipelineEvent::new(Phase::Summary, format!("failed: {}", entry.reason))
                    .with_run(report.run_id)
                    .with_repo(&entry.full_name)
                    .with_attempt(entry.attempts),
            );
        }
        self.info(
            PipelineEvent::new(
                Phase::Summary,
                format!(
                    "run finished ({}): {} mirrored, {} already done, {} skipped, {} failed of {}",
                    report.state,
                    report.completed,
                    report.already_done,
                    report.skipped.len(),
                    report.failed.len(),
                    report.total
                ),
            )
            .with_run(report.run_id),
        );
    }

    fn info(&self, event: PipelineEvent) {
        self.events.info(&event);
    }

    fn error(&self, event: PipelineEvent) {
        self.events.error(&event);
    }
}

fn validate_context(ctx: &RunContext) -> Result<(), MirrorError> {
    if !ctx.credentials.is_complete() {
        return Err(MirrorError::Config(
            "source and destination tokens are required".into(),
        ));
    }
    if ctx.destination.as_os_str().is_empty() {
        return Err(MirrorError::Config("destination directory is required".into()));
    }
    if ctx.options.retry_limit == 0 {
        return Err(MirrorError::Config("retry limit must be at least 1".into()));
    }
    Ok(())
}

/// Drop ignored repositories, then truncate to the limit, keeping order.
fn select_candidates<'a>(repositories: &'a [RepositoryRef], options: &RunOptions) -> Vec<&'a RepositoryRef> {
    repositories
        .iter()
        .filter(|repo| !options.ignore.matches(repo))
        .take(options.repo_limit.unwrap_or(usize::MAX))
        .collect()
}
