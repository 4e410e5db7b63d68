//! In-repository lock handling ahead of maintenance operations.

use tracing::{debug, warn};

use crate::error::RepositoryError;
use crate::repository::RepositoryClient;

/// Remove stale repository locks left behind by crashed runs.
///
/// Failure is logged and the run continues; a live lock held by another
/// process is never removed.
pub async fn reclaim_stale_locks(repo: &dyn RepositoryClient) {
    match repo.unlock(false).await {
        Ok(()) => debug!("stale repository locks removed"),
        Err(e) => warn!(error = %e, "failed to remove stale repository locks, continuing"),
    }
}

/// Block until no other process holds a repository lock.
pub async fn wait_for_repository_locks(repo: &dyn RepositoryClient) -> Result<(), RepositoryError> {
    debug!("waiting for repository locks to clear");
    repo.wait_for_locks().await
}
