//! Maintenance custom resources (`backup.platform/v1`).
//!
//! Every kind implements [`MaintenanceResource`], the capability interface the
//! generic reconciler is written against.

use std::fmt::Debug;

use k8s_openapi::NamespaceResourceScope;
use kube::{CustomResourceExt, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub mod archive;
pub mod backup;
pub mod check;
pub mod common;
pub mod prune;
pub mod restore;

pub use archive::{Archive, ArchiveSpec};
pub use backup::{Backup, BackupSpec};
pub use check::{Check, CheckSpec};
pub use common::{
    ClaimTarget, RepositorySpec, RunPhase, RunStatus, S3Target, SecretKeyRef, WorkerSpec,
};
pub use prune::{Prune, PruneSpec, RetentionSpec};
pub use restore::{Restore, RestoreSpec};

pub const API_GROUP: &str = "backup.platform";

/// A resource that runs one worker Job against one repository
pub trait MaintenanceResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Lower-case operation name used for Job names, labels and lock holders
    const OPERATION: &'static str;

    fn repository(&self) -> &RepositorySpec;

    /// Worker flags, env and volumes specific to this kind
    fn job_template(&self) -> WorkerSpec;

    fn run_status(&self) -> Option<&RunStatus>;

    /// Reject specs no worker could carry out; the reason ends up in status
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    fn repository_key(&self) -> String {
        self.repository().key()
    }
}

/// Definitions of every kind as one multi-document YAML stream
pub fn crd_manifests() -> Result<String, serde_yaml::Error> {
    let crds = [
        Backup::crd(),
        Check::crd(),
        Prune::crd(),
        Restore::crd(),
        Archive::crd(),
    ];
    let mut out = String::new();
    for crd in &crds {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(crd)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifests_cover_every_kind() {
        let manifests = crd_manifests().unwrap();
        for name in [
            "backups.backup.platform",
            "checks.backup.platform",
            "prunes.backup.platform",
            "restores.backup.platform",
            "archives.backup.platform",
        ] {
            assert!(manifests.contains(name), "missing {name}");
        }
        assert_eq!(manifests.matches("---\n").count(), 5);
    }

    #[test]
    fn kinds_without_constraints_validate() {
        let check = Check::new(
            "daily",
            CheckSpec {
                repository: RepositorySpec {
                    url: "s3:https://minio.local/backups".to_string(),
                    password_secret_ref: SecretKeyRef {
                        name: "restic".to_string(),
                        key: "password".to_string(),
                    },
                    env_from_secret: None,
                },
                tags: Vec::new(),
            },
        );
        assert_eq!(check.validate(), Ok(()));
    }

    #[test]
    fn operations_are_distinct() {
        let mut operations = vec![
            Backup::OPERATION,
            Check::OPERATION,
            Prune::OPERATION,
            Restore::OPERATION,
            Archive::OPERATION,
        ];
        operations.sort_unstable();
        operations.dedup();
        assert_eq!(operations.len(), 5);
    }
}
