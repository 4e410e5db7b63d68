//! Backup of pods that declare a backup command through annotations.
//!
//! Each discovered pod runs its command remotely; the command's standard
//! output is streamed into the repository as one object named
//! `/<host>-<container>` plus the pod's declared file extension.

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{info, info_span, Instrument};

use crate::error::CollectorError;
use crate::repository::{BackupStream, RepositoryClient};
use crate::request::{stdin_object_name, TagFilter};

pub mod cluster;

pub use self::cluster::KubeWorkloadSource;

/// Pod selected for command-based backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotatedWorkload {
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
    /// Extension appended to the stored object name, may be empty
    pub file_extension: String,
    pub command: String,
}

/// Running remote command.
///
/// `stdout` must be drained before `exit` is awaited.
pub struct CommandOutput {
    pub stdout: BackupStream,
    pub exit: BoxFuture<'static, Result<(), CollectorError>>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkloadSource: Send + Sync {
    /// Whether cluster credentials exist at all
    fn available(&self) -> bool;

    /// Annotated pods in scope, in a stable order
    async fn list(&self) -> Result<Vec<AnnotatedWorkload>, CollectorError>;

    /// Start the workload's backup command
    async fn exec(&self, workload: &AnnotatedWorkload) -> Result<CommandOutput, CollectorError>;
}

/// Back up every annotated pod, one at a time.
///
/// The first failure, whether the remote command or the repository write,
/// stops the collection; remaining pods are not attempted.
pub async fn backup_annotated_pods(
    source: &dyn WorkloadSource,
    repo: &dyn RepositoryClient,
    host: &str,
    tags: &TagFilter,
) -> Result<(), CollectorError> {
    if !source.available() {
        info!("no cluster credentials found, skipping backup of annotated pods");
        return Ok(());
    }

    let workloads = source.list().await?;
    info!(pods = workloads.len(), "found annotated pods");

    for workload in &workloads {
        let span = info_span!(
            "pod_backup",
            namespace = %workload.namespace,
            pod = %workload.pod_name,
            container = %workload.container_name
        );
        backup_workload(source, repo, workload, host, tags)
            .instrument(span)
            .await?;
    }
    Ok(())
}

async fn backup_workload(
    source: &dyn WorkloadSource,
    repo: &dyn RepositoryClient,
    workload: &AnnotatedWorkload,
    host: &str,
    tags: &TagFilter,
) -> Result<(), CollectorError> {
    info!(command = %workload.command, "running backup command");
    let output = source.exec(workload).await?;
    let object = stdin_object_name(host, &workload.container_name);

    repo.stdin_backup(output.stdout, &object, &workload.file_extension, tags)
        .await
        .map_err(|source| CollectorError::Repository {
            pod: workload.pod_name.clone(),
            source,
        })?;
    output.exit.await?;

    info!(object = %object, "pod backup stored");
    Ok(())
}
