//! Command-line flags of the worker binary.

use clap::Parser;

use crate::config::WorkerConfig;
use crate::request::{OperationRequest, RestoreKind, RestoreOptions};

#[derive(Debug, Parser)]
#[command(name = "backup-worker")]
#[command(about = "Run restic repository maintenance or a backup of the current workload")]
#[command(version)]
pub struct WorkerArgs {
    /// Run a repository integrity check
    #[arg(long)]
    pub check: bool,

    /// Forget snapshots outside the retention policy and prune unreferenced data
    #[arg(long)]
    pub prune: bool,

    /// Restore a snapshot
    #[arg(long)]
    pub restore: bool,

    /// Verify restored or archived data
    #[arg(long = "verifyRestore")]
    pub verify_restore: bool,

    /// Dump the latest snapshots as tar archives
    #[arg(long)]
    pub archive: bool,

    /// Snapshot ID to restore; empty restores the latest snapshot
    #[arg(long = "restoreSnap", default_value = "")]
    pub restore_snap: String,

    /// Restore destination
    #[arg(long = "restoreType", value_enum, default_value_t = RestoreKind::Folder)]
    pub restore_type: RestoreKind,

    /// Only restore or archive paths containing this value
    #[arg(long = "restoreFilter", default_value = "")]
    pub restore_filter: String,

    /// Snapshot tag; may be given multiple times
    #[arg(long = "tag")]
    pub tags: Vec<String>,
}

impl WorkerArgs {
    /// Build the immutable request for this run
    #[must_use]
    pub fn into_request(self, config: &WorkerConfig) -> OperationRequest {
        OperationRequest {
            check: self.check,
            prune: self.prune,
            restore: self.restore,
            archive: self.archive,
            verify_restore: self.verify_restore,
            restore_options: RestoreOptions {
                snapshot_id: self.restore_snap,
                kind: self.restore_type,
                target_dir: config.restore_dir.clone(),
                filter: self.restore_filter,
                verify: self.verify_restore,
                s3: config.restore_s3.clone(),
            },
            tags: self.tags.into_iter().collect(),
        }
    }
}
