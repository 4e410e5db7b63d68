//! Primitive repository operations.
//!
//! [`RepositoryClient`] is the seam between the sequencer and whatever
//! actually talks to the repository. Every call is independent and may fail;
//! none of them retries internally.

use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::error::RepositoryError;
use crate::request::{RestoreOptions, TagFilter};

pub mod restic;
mod s3;

pub use restic::ResticCli;

/// Byte stream fed into a stdin backup.
pub type BackupStream = Pin<Box<dyn AsyncRead + Send>>;

/// Snapshot as reported by `restic snapshots --json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

#[async_trait]
pub trait RepositoryClient: Send + Sync {
    /// Initialize the repository; succeeds when it already exists
    async fn init(&self) -> Result<(), RepositoryError>;

    /// Remove locks; non-forced removal only clears stale locks
    async fn unlock(&self, force: bool) -> Result<(), RepositoryError>;

    /// List snapshots, optionally limited to the given tags
    async fn snapshots(&self, tags: Option<&TagFilter>) -> Result<Vec<Snapshot>, RepositoryError>;

    /// Block until the repository holds no lock
    async fn wait_for_locks(&self) -> Result<(), RepositoryError>;

    async fn prune(&self, tags: &TagFilter) -> Result<(), RepositoryError>;

    async fn check(&self) -> Result<(), RepositoryError>;

    async fn restore(&self, options: &RestoreOptions, tags: &TagFilter) -> Result<(), RepositoryError>;

    async fn archive(&self, filter: &str, verify: bool, tags: &TagFilter) -> Result<(), RepositoryError>;

    /// Back up a directory tree
    async fn backup(&self, dir: &Path, tags: &TagFilter) -> Result<(), RepositoryError>;

    /// Back up a byte stream as a single object named `filename` + `extension`
    async fn stdin_backup(
        &self,
        data: BackupStream,
        filename: &str,
        extension: &str,
        tags: &TagFilter,
    ) -> Result<(), RepositoryError>;
}
