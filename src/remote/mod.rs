//! Collaborators the pipeline drives: listing source repositories, creating
//! destinations, and moving repository data.

pub mod git;
pub mod github;

use std::path::Path;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{MirrorError, TransferError};

/// A source repository as reported by the listing collaborator. Immutable for
/// the duration of a run and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRef {
    /// Stable `owner/name` identity; the ledger key.
    pub full_name: String,
    pub clone_url: String,
    pub size_bytes: u64,
    pub private: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub has_issues: bool,
    #[serde(default)]
    pub has_wiki: bool,
}

impl RepositoryRef {
    pub fn new(full_name: impl Into<String>, clone_url: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            clone_url: clone_url.into(),
            size_bytes: 0,
            private: false,
            description: None,
            has_issues: true,
            has_wiki: true,
        }
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    pub fn with_private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Repository name without the owner.
    pub fn name(&self) -> &str {
        self.full_name
            .rsplit_once('/')
            .map_or(self.full_name.as_str(), |(_, name)| name)
    }
}

/// Handle to a repository on the destination account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationRepo {
    pub full_name: String,
    pub clone_url: String,
}

/// Access tokens for both accounts. Wiped from memory on drop.
#[derive(Clone)]
pub struct Credentials {
    source: Zeroizing<String>,
    destination: Zeroizing<String>,
}

impl Credentials {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: Zeroizing::new(source.into().trim().to_string()),
            destination: Zeroizing::new(destination.into().trim().to_string()),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn is_complete(&self) -> bool {
        !self.source.is_empty() && !self.destination.is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("source", &"<redacted>")
            .field("destination", &"<redacted>")
            .finish()
    }
}

/// Lists the repositories of the source account.
#[async_trait::async_trait]
pub trait SourceLister: Send + Sync {
    /// Fails with [`MirrorError::Auth`] when the credentials are rejected.
    async fn list_repositories(&self) -> Result<Vec<RepositoryRef>, MirrorError>;
}

/// Manages repositories on the destination account.
#[async_trait::async_trait]
pub trait DestinationRegistrar: Send + Sync {
    /// Return the destination for `source`, creating it if absent. Idempotent.
    async fn get_or_create(&self, source: &RepositoryRef) -> Result<DestinationRepo, TransferError>;

    /// Copy description, visibility and feature flags onto the destination.
    async fn sync_settings(
        &self,
        source: &RepositoryRef,
        destination: &DestinationRepo,
    ) -> Result<(), TransferError>;
}

/// Moves repository data from source to destination through a local working
/// copy. Whether that is a fresh clone or an update is up to the implementation.
#[async_trait::async_trait]
pub trait Transporter: Send + Sync {
    /// Bring the local working copy of `source` up to date, cloning it if
    /// absent. Fails with `CorruptWorkingCopy` when the existing copy is unusable.
    async fn ensure_mirrored(
        &self,
        source: &RepositoryRef,
        local_path: &Path,
        credentials: &Credentials,
    ) -> Result<(), TransferError>;

    /// Push every branch and tag of the local copy to `destination`.
    async fn push(
        &self,
        source: &RepositoryRef,
        destination: &DestinationRepo,
        local_path: &Path,
        credentials: &Credentials,
    ) -> Result<(), TransferError>;

    /// Remove the local working copy so the next attempt starts from scratch.
    async fn discard(&self, local_path: &Path) -> Result<(), TransferError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_strips_owner() {
        let repo = RepositoryRef::new("octo/hello-world", "https://example.test/octo/hello-world.git");
        assert_eq!(repo.name(), "hello-world");
        assert_eq!(RepositoryRef::new("bare", "x").name(), "bare");
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials::new(" ghp_source ", "ghp_dest");
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("ghp_"));
        assert_eq!(creds.source(), "ghp_source");
        assert!(creds.is_complete());
        assert!(!Credentials::new("", "x").is_complete());
    }
}
