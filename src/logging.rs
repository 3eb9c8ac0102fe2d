//! Tracing setup: stderr plus optional append-only log files.
//!
//! `RUST_LOG` overrides the configured level for stderr and the main log
//! file. The error log only ever receives `ERROR` events.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::Subscriber;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;

pub type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn format_layer<W>(writer: W, json: bool, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer().with_writer(writer).with_ansi(ansi);
    if json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

fn open_append(path: &Path) -> Result<Mutex<File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    Ok(Mutex::new(file))
}

/// Build the stderr layer and one layer per enabled log file.
pub fn build_layers(logging: &LoggingConfig) -> Result<Vec<BoxedLayer>> {
    let mut layers = vec![format_layer(std::io::stderr, logging.json, true)
        .with_filter(env_filter(&logging.level))
        .boxed()];

    if let Some(path) = logging.log_file() {
        layers.push(
            format_layer(open_append(path)?, logging.json, false)
                .with_filter(env_filter(&logging.level))
                .boxed(),
        );
    }
    if let Some(path) = logging.error_log_file() {
        layers.push(
            format_layer(open_append(path)?, logging.json, false)
                .with_filter(LevelFilter::ERROR)
                .boxed(),
        );
    }
    Ok(layers)
}

/// Install the global subscriber.
pub fn init(logging: &LoggingConfig) -> Result<()> {
    tracing_subscriber::registry()
        .with(build_layers(logging)?)
        .try_init()
        .context("failed to install tracing subscriber")
}

/// Stderr-only subscriber used while the configuration itself is loading.
pub fn bootstrap() -> impl Subscriber + Send + Sync {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter("info"))
        .with_writer(std::io::stderr)
        .finish()
}
