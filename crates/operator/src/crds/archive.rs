//! `Archive` dumps the latest snapshots as tar files onto a volume.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{ClaimTarget, RepositorySpec, RunStatus, WorkerSpec};
use super::MaintenanceResource;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "backup.platform", version = "v1", kind = "Archive")]
#[kube(namespaced)]
#[kube(status = "RunStatus")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveSpec {
    pub repository: RepositorySpec,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Only archive snapshots whose paths contain this value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default)]
    pub verify: bool,
    /// Volume receiving the archives
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ClaimTarget>,
}

impl MaintenanceResource for Archive {
    const OPERATION: &'static str = "archive";

    fn repository(&self) -> &RepositorySpec {
        &self.spec.repository
    }

    fn job_template(&self) -> WorkerSpec {
        let mut spec = WorkerSpec::with_args(["--archive"]);
        if let Some(filter) = self.spec.filter.as_deref().filter(|f| !f.is_empty()) {
            spec.args.extend(["--restoreFilter".to_string(), filter.to_string()]);
        }
        if self.spec.verify {
            spec.args.push("--verifyRestore".to_string());
        }
        spec.tags(&self.spec.tags);
        spec.env("RESTORE_DIR", "/archive");
        if let Some(target) = &self.spec.target {
            spec.claim("archive", target, "/archive", false);
        }
        spec
    }

    fn run_status(&self) -> Option<&RunStatus> {
        self.status.as_ref()
    }
}
