//! Error taxonomy for mirror runs.
//!
//! [`MirrorError`] covers everything that aborts a run before (or instead of)
//! processing repositories. [`TransferError`] is the tagged result a transfer
//! collaborator hands back for a single repository; it never escapes the
//! per-repository attempt loop.

use std::path::PathBuf;

use thiserror::Error;

use crate::ledger::LedgerError;

/// Fatal errors. Any of these propagates out of a run to the caller.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(
        "insufficient disk space at {}: need {:.2} GB, available {:.2} GB",
        .path.display(),
        gb(.required),
        gb(.available)
    )]
    DiskSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("remote API error: {0}")]
    Remote(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("failed to measure free space at {}", .path.display())]
    FreeSpace {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn gb(bytes: &u64) -> f64 {
    *bytes as f64 / 1e9
}

/// Classification attached to a failed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferErrorKind {
    /// Remote repository deleted or inaccessible (404-equivalent).
    NotFound,
    /// Credentials rejected while working on this repository.
    Auth,
    /// Network failure, rate limit, transport tool failure.
    Transient,
    /// The local working copy is not a usable repository.
    CorruptWorkingCopy,
    /// A bounded operation ran past its deadline.
    Timeout,
}

impl std::fmt::Display for TransferErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferErrorKind::NotFound => write!(f, "not found"),
            TransferErrorKind::Auth => write!(f, "auth"),
            TransferErrorKind::Transient => write!(f, "transient"),
            TransferErrorKind::CorruptWorkingCopy => write!(f, "corrupt working copy"),
            TransferErrorKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// Per-repository failure returned by the transfer collaborators.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct TransferError {
    pub kind: TransferErrorKind,
    pub message: String,
}

impl TransferError {
    pub fn new(kind: TransferErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::NotFound, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::Auth, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::Transient, message)
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::CorruptWorkingCopy, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::Timeout, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_space_message_reports_gigabytes() {
        let err = MirrorError::DiskSpace {
            path: PathBuf::from("/srv/mirror"),
            required: 4_400_000_000,
            available: 1_000_000_000,
        };
        let msg = err.to_string();
        assert!(msg.contains("need 4.40 GB"), "{msg}");
        assert!(msg.contains("available 1.00 GB"), "{msg}");
        assert!(msg.contains("/srv/mirror"), "{msg}");
    }

    #[test]
    fn test_transfer_error_display_includes_kind() {
        let err = TransferError::not_found("octo/gone");
        assert_eq!(err.to_string(), "not found: octo/gone");
        assert_eq!(err.kind, TransferErrorKind::NotFound);
    }
}
