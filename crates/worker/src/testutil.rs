//! In-memory repository used by unit tests.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use crate::error::RepositoryError;
use crate::repository::{BackupStream, RepositoryClient, Snapshot};
use crate::request::{RestoreOptions, TagFilter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Init,
    Unlock { force: bool },
    Snapshots { tags: Option<TagFilter> },
    WaitForLocks,
    Prune { tags: TagFilter },
    Check,
    Restore { options: RestoreOptions, tags: TagFilter },
    Archive { filter: String, verify: bool, tags: TagFilter },
    Backup { dir: PathBuf, tags: TagFilter },
    StdinBackup {
        filename: String,
        extension: String,
        tags: TagFilter,
        data: Vec<u8>,
    },
}

impl Call {
    /// Tag filter passed to the call, if the operation accepts one
    pub fn tags(&self) -> Option<&TagFilter> {
        match self {
            Self::Prune { tags }
            | Self::Restore { tags, .. }
            | Self::Archive { tags, .. }
            | Self::Backup { tags, .. }
            | Self::StdinBackup { tags, .. } => Some(tags),
            Self::Snapshots { tags } => tags.as_ref(),
            Self::Init | Self::Unlock { .. } | Self::WaitForLocks | Self::Check => None,
        }
    }
}

/// Records every call in order; operations named in `failing` return an error.
#[derive(Default)]
pub struct RecordingRepository {
    calls: Mutex<Vec<Call>>,
    failing: HashSet<&'static str>,
}

impl RecordingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, operation: &'static str) -> Self {
        self.failing.insert(operation);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, operation: &'static str, call: Call) -> Result<(), RepositoryError> {
        self.calls.lock().unwrap().push(call);
        if self.failing.contains(operation) {
            return Err(RepositoryError::CommandFailed {
                operation,
                code: "1".to_string(),
                stderr: format!("{operation} failed"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RepositoryClient for RecordingRepository {
    async fn init(&self) -> Result<(), RepositoryError> {
        self.record("init", Call::Init)
    }

    async fn unlock(&self, force: bool) -> Result<(), RepositoryError> {
        self.record("unlock", Call::Unlock { force })
    }

    async fn snapshots(&self, tags: Option<&TagFilter>) -> Result<Vec<Snapshot>, RepositoryError> {
        self.record("snapshots", Call::Snapshots { tags: tags.cloned() })?;
        Ok(Vec::new())
    }

    async fn wait_for_locks(&self) -> Result<(), RepositoryError> {
        self.record("wait_for_locks", Call::WaitForLocks)
    }

    async fn prune(&self, tags: &TagFilter) -> Result<(), RepositoryError> {
        self.record("prune", Call::Prune { tags: tags.clone() })
    }

    async fn check(&self) -> Result<(), RepositoryError> {
        self.record("check", Call::Check)
    }

    async fn restore(&self, options: &RestoreOptions, tags: &TagFilter) -> Result<(), RepositoryError> {
        self.record(
            "restore",
            Call::Restore {
                options: options.clone(),
                tags: tags.clone(),
            },
        )
    }

    async fn archive(&self, filter: &str, verify: bool, tags: &TagFilter) -> Result<(), RepositoryError> {
        self.record(
            "archive",
            Call::Archive {
                filter: filter.to_string(),
                verify,
                tags: tags.clone(),
            },
        )
    }

    async fn backup(&self, dir: &Path, tags: &TagFilter) -> Result<(), RepositoryError> {
        self.record(
            "backup",
            Call::Backup {
                dir: dir.to_path_buf(),
                tags: tags.clone(),
            },
        )
    }

    async fn stdin_backup(
        &self,
        mut data: BackupStream,
        filename: &str,
        extension: &str,
        tags: &TagFilter,
    ) -> Result<(), RepositoryError> {
        let mut buf = Vec::new();
        data.read_to_end(&mut buf)
            .await
            .map_err(|source| RepositoryError::Io { operation: "stdin backup", source })?;
        self.record(
            "stdin_backup",
            Call::StdinBackup {
                filename: filename.to_string(),
                extension: extension.to_string(),
                tags: tags.clone(),
                data: buf,
            },
        )
    }
}
