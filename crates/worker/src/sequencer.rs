//! Maintenance sequencing.
//!
//! [`MaintenanceSequencer::run`] drives one worker run through a fixed order
//! of steps:
//!
//! 1. initialize the repository
//! 2. reclaim stale locks (failure is logged only)
//! 3. list snapshots to warm the local cache (failure is fatal)
//! 4. wait for repository locks when prune or check is requested
//! 5. prune, check, restore and archive, each when requested
//! 6. when no maintenance mode ran: back up annotated pods, then the backup
//!    directory
//!
//! The first failing step ends the run; nothing after it executes.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};

use crate::collector::{backup_annotated_pods, WorkloadSource};
use crate::error::{Error, Result, SequenceError};
use crate::locks::{reclaim_stale_locks, wait_for_repository_locks};
use crate::repository::RepositoryClient;
use crate::request::OperationRequest;

/// Named step of a maintenance run, used to attribute failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Initialize,
    Unlock,
    Snapshots,
    WaitForLocks,
    Prune,
    Check,
    Restore,
    Archive,
    PodBackup,
    DirectoryBackup,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initialize => "initialize",
            Self::Unlock => "unlock",
            Self::Snapshots => "snapshots",
            Self::WaitForLocks => "wait for locks",
            Self::Prune => "prune",
            Self::Check => "check",
            Self::Restore => "restore",
            Self::Archive => "archive",
            Self::PodBackup => "backup of annotated pods",
            Self::DirectoryBackup => "backup of dir",
        };
        f.write_str(name)
    }
}

pub struct MaintenanceSequencer {
    repo: Arc<dyn RepositoryClient>,
    workloads: Arc<dyn WorkloadSource>,
    backup_dir: PathBuf,
    hostname: String,
}

impl MaintenanceSequencer {
    pub fn new(
        repo: Arc<dyn RepositoryClient>,
        workloads: Arc<dyn WorkloadSource>,
        backup_dir: impl Into<PathBuf>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            workloads,
            backup_dir: backup_dir.into(),
            hostname: hostname.into(),
        }
    }

    /// Run every step selected by `request`
    pub async fn run(&self, request: &OperationRequest) -> Result<(), SequenceError> {
        let repo = self.repo.as_ref();
        let tags = &request.tags;
        info!(
            check = request.check,
            prune = request.prune,
            restore = request.restore,
            archive = request.archive,
            tags = %tags,
            tag_count = tags.len(),
            "starting maintenance run"
        );

        step(Step::Initialize, repo.init()).await?;

        reclaim_stale_locks(repo).await;

        if let Err(e) = repo.snapshots(None).await {
            error!(step = %Step::Snapshots, error = %e, "snapshot listing failed, repository is unusable");
            return Err(SequenceError::Fatal(e));
        }

        if request.needs_lock_wait() {
            step(Step::WaitForLocks, wait_for_repository_locks(repo)).await?;
        }

        if request.prune {
            step(Step::Prune, repo.prune(tags)).await?;
        }

        if request.check {
            step(Step::Check, repo.check()).await?;
        }

        if request.restore {
            step(Step::Restore, repo.restore(&request.restore_options, tags)).await?;
        }

        if request.archive {
            step(
                Step::Archive,
                repo.archive(&request.restore_options.filter, request.verify_restore, tags),
            )
            .await?;
        }

        if !request.is_default_backup() {
            info!("maintenance run finished");
            return Ok(());
        }

        step(
            Step::PodBackup,
            backup_annotated_pods(self.workloads.as_ref(), repo, &self.hostname, tags),
        )
        .await?;

        step(Step::DirectoryBackup, repo.backup(&self.backup_dir, tags)).await?;

        info!(dir = %self.backup_dir.display(), "backup run finished");
        Ok(())
    }
}

/// Await one step, logging and wrapping its failure
async fn step<F, E>(step: Step, fut: F) -> Result<(), SequenceError>
where
    F: std::future::Future<Output = Result<(), E>>,
    E: Into<Error>,
{
    fut.await.map_err(|e| {
        let source = e.into();
        error!(step = %step, error = %source, "step failed, aborting run");
        SequenceError::Aborted { step, source }
    })
}
