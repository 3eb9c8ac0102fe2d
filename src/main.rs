use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use repomirror::config::MirrorConfig;
use repomirror::ignore::IgnoreList;
use repomirror::ledger::ProgressStore;
use repomirror::logging;
use repomirror::pipeline::{self, RunReport};
use repomirror::remote::Credentials;
use repomirror::MirrorRequest;

#[derive(Parser)]
#[command(
    name = "repomirror",
    about = "Resumable mirroring of GitHub repositories between accounts",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (default: $REPOMIRROR_CONFIG, then ./repomirror.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct TokenArgs {
    /// Token for the account being mirrored
    #[arg(long, env = "SOURCE_GITHUB_TOKEN", hide_env_values = true, default_value = "")]
    source_token: String,

    /// Token for the account receiving the mirrors
    #[arg(long, env = "DEST_GITHUB_TOKEN", hide_env_values = true, default_value = "")]
    dest_token: String,
}

impl TokenArgs {
    fn credentials(self) -> Credentials {
        Credentials::new(self.source_token, self.dest_token)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Mirror every source repository (resumes an interrupted run)
    Mirror {
        #[command(flatten)]
        tokens: TokenArgs,

        /// Directory holding the local working copies
        #[arg(long, env = "BACKUP_DIR")]
        dest_dir: Option<PathBuf>,

        /// Attempts per repository
        #[arg(long)]
        retries: Option<u32>,

        /// Process at most this many repositories
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show ledger state and resumability
    Status {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Drop ledger records older than the retention period
    Cleanup {
        /// Maximum record age in days (default: pipeline.retention_days)
        #[arg(long)]
        max_age_days: Option<u32>,
    },

    /// Check both tokens against the API
    Validate {
        #[command(flatten)]
        tokens: TokenArgs,
    },

    /// Manage the ignore list
    Ignore {
        #[command(subcommand)]
        action: IgnoreAction,
    },
}

#[derive(Subcommand)]
enum IgnoreAction {
    /// List ignored repositories
    List,

    /// Stop mirroring a repository
    Add {
        /// Repository name or owner/name
        name: String,
    },
}

fn print_report(report: &RunReport) {
    println!("\n=== repomirror run {} ===", report.run_id);
    println!("State:        {}", report.state);
    println!("Candidates:   {}", report.total);
    println!("Mirrored:     {}", report.completed);
    println!("Already done: {}", report.already_done);
    if let Some(reason) = report.stopped {
        println!("Stopped:      {reason:?} (run `repomirror mirror` again to resume)");
    }
    for (label, entries) in [("Skipped", &report.skipped), ("Failed", &report.failed)] {
        if entries.is_empty() {
            continue;
        }
        println!("\n{label}:");
        for entry in entries {
            println!(
                " - {} ({} attempt(s)): {}",
                entry.full_name, entry.attempts, entry.reason
            );
        }
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // Config loading logs before the configured subscriber exists.
    let config = tracing::subscriber::with_default(logging::bootstrap(), || {
        MirrorConfig::resolve(cli.config.as_deref())
    })?;
    logging::init(&config.logging)?;

    match cli.command {
        Commands::Mirror {
            tokens,
            dest_dir,
            retries,
            limit,
        } => {
            let (handle, controls) = pipeline::channel();
            tokio::spawn(async move {
                if pipeline::forward_interrupts(handle, tokio::signal::ctrl_c).await {
                    std::process::exit(130);
                }
            });

            let request = MirrorRequest {
                credentials: tokens.credentials(),
                destination: dest_dir,
                retry_limit: retries,
                repo_limit: limit,
            };
            let report = repomirror::run_mirror(&config, request, controls).await?;
            print_report(&report);
        }
        Commands::Status { json } => {
            let store = ProgressStore::open(&config.paths.ledger)?;
            let summary = store.summary();
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("Ledger:      {}", config.paths.ledger.display());
                println!("State:       {}", summary.state);
                println!("Records:     {}", summary.total);
                println!("Completed:   {}", summary.completed);
                println!("Incomplete:  {}", summary.incomplete.len());
                for name in &summary.incomplete {
                    println!(" - {name}");
                }
                println!("Failed:      {}", summary.failed.len());
                for name in &summary.failed {
                    let detail = store
                        .record(name)
                        .and_then(|r| r.detail)
                        .unwrap_or_default();
                    println!(" - {name}: {detail}");
                }
                println!("Can resume:  {}", if summary.can_resume { "yes" } else { "no" });
            }
        }
        Commands::Cleanup { max_age_days } => {
            let days = max_age_days.unwrap_or(config.pipeline.retention_days);
            let store = ProgressStore::open(&config.paths.ledger)?;
            let removed = store.cleanup_older_than(days)?;
            println!("Removed {removed} record(s) older than {days} day(s).");
        }
        Commands::Validate { tokens } => {
            let accounts = repomirror::validate_tokens(&config, &tokens.credentials()).await?;
            println!("Source:      {}", accounts.source);
            println!("Destination: {}", accounts.destination);
        }
        Commands::Ignore { action } => match action {
            IgnoreAction::List => {
                let list = IgnoreList::load(&config.paths.ignore_file)?;
                if list.is_empty() {
                    println!("No ignored repositories.");
                } else {
                    for name in list.iter() {
                        println!("{name}");
                    }
                }
            }
            IgnoreAction::Add { name } => {
                if IgnoreList::append(&config.paths.ignore_file, &name)? {
                    println!("Ignoring {name}.");
                } else {
                    println!("{name} is already ignored.");
                }
            }
        },
    }

    Ok(())
}
