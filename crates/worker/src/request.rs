//! Immutable description of what one worker run should do.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Insertion-ordered, de-duplicated set of snapshot tags.
///
/// One instance is built per run and passed by reference to every operation
/// that filters by tag, so all of them see the same set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagFilter(Vec<String>);

impl TagFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Expand into repeated `--tag <value>` arguments
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        self.0
            .iter()
            .flat_map(|tag| ["--tag".to_string(), tag.clone()])
            .collect()
    }
}

impl<S: Into<String>> FromIterator<S> for TagFilter {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut tags: Vec<String> = Vec::new();
        for tag in iter {
            let tag = tag.into();
            let tag = tag.trim();
            if tag.is_empty() || tags.iter().any(|t| t == tag) {
                continue;
            }
            tags.push(tag.to_string());
        }
        Self(tags)
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(","))
    }
}

/// Where a restore is written to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RestoreKind {
    #[default]
    Folder,
    S3,
}

impl fmt::Display for RestoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Folder => f.write_str("folder"),
            Self::S3 => f.write_str("s3"),
        }
    }
}

/// S3 bucket a restore or archive is uploaded to.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct S3Destination {
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for S3Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Destination")
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Snapshot to restore; empty selects the latest snapshot
    pub snapshot_id: String,
    pub kind: RestoreKind,
    pub target_dir: String,
    /// Path filter limiting what gets restored (e.g. a PVC name)
    pub filter: String,
    pub verify: bool,
    pub s3: S3Destination,
}

impl RestoreOptions {
    /// Snapshot argument understood by restic
    #[must_use]
    pub fn snapshot(&self) -> &str {
        if self.snapshot_id.trim().is_empty() {
            "latest"
        } else {
            self.snapshot_id.trim()
        }
    }
}

/// Everything a single run needs to decide which operations to perform.
///
/// Built once at startup from CLI flags and environment and never mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationRequest {
    pub check: bool,
    pub prune: bool,
    pub restore: bool,
    pub archive: bool,
    pub verify_restore: bool,
    pub restore_options: RestoreOptions,
    pub tags: TagFilter,
}

impl OperationRequest {
    /// True when no maintenance mode is selected and the default backup runs
    #[must_use]
    pub fn is_default_backup(&self) -> bool {
        !(self.check || self.prune || self.restore || self.archive)
    }

    /// True when the in-repository lock gate has to run first
    #[must_use]
    pub fn needs_lock_wait(&self) -> bool {
        self.check || self.prune
    }
}

/// Object name under which an annotated pod's output is stored.
#[must_use]
pub fn stdin_object_name(host: &str, container: &str) -> String {
    format!("/{host}-{container}")
}

/// Normalize a file extension to either empty or a leading-dot form.
#[must_use]
pub fn normalize_extension(extension: &str) -> String {
    let trimmed = extension.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(".{trimmed}")
    }
}

/// Full `--stdin-filename` value for an object name and extension.
#[must_use]
pub fn stdin_filename(object_name: &str, extension: &str) -> String {
    format!("{object_name}{}", normalize_extension(extension))
}
