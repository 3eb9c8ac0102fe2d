//! Repositories excluded from mirroring, kept in a newline-delimited file.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::remote::RepositoryRef;

/// Set of excluded repository names. An entry matches a repository by its
/// short name or by its full `owner/name`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreList {
    names: BTreeSet<String>,
}

impl IgnoreList {
    /// Read the ignore file. A missing file is an empty list; blank lines are
    /// skipped.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read ignore file: {}", path.display()))
            }
        };
        Ok(content.lines().collect())
    }

    /// Append `name` to the ignore file unless already present. Returns
    /// whether the file changed.
    pub fn append(path: &Path, name: &str) -> Result<bool> {
        let name = name.trim();
        if name.is_empty() {
            anyhow::bail!("repository name must not be empty");
        }
        if Self::load(path)?.names.contains(name) {
            return Ok(false);
        }

        let needs_newline = std::fs::read(path)
            .map(|bytes| bytes.last().is_some_and(|b| *b != b'\n'))
            .unwrap_or(false);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open ignore file: {}", path.display()))?;
        if needs_newline {
            writeln!(file)?;
        }
        writeln!(file, "{name}")?;
        Ok(true)
    }

    pub fn matches(&self, repo: &RepositoryRef) -> bool {
        self.names.contains(repo.name()) || self.names.contains(&repo.full_name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

impl<'a> FromIterator<&'a str> for IgnoreList {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Self {
            names: iter
                .into_iter()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}
