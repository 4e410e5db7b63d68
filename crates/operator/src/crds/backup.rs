//! `Backup` runs the default worker mode: annotated pod dumps followed by a
//! backup of the mounted data directory.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{ClaimTarget, RepositorySpec, RunStatus, WorkerSpec};
use super::MaintenanceResource;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "backup.platform", version = "v1", kind = "Backup")]
#[kube(namespaced)]
#[kube(status = "RunStatus")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    pub repository: RepositorySpec,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Volume backed up as the worker's data directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<ClaimTarget>,
}

impl MaintenanceResource for Backup {
    const OPERATION: &'static str = "backup";

    fn repository(&self) -> &RepositorySpec {
        &self.spec.repository
    }

    fn job_template(&self) -> WorkerSpec {
        let mut spec = WorkerSpec::default();
        spec.tags(&self.spec.tags);
        if let Some(claim) = &self.spec.claim {
            spec.claim("data", claim, "/data", true);
        }
        spec
    }

    fn run_status(&self) -> Option<&RunStatus> {
        self.status.as_ref()
    }
}
