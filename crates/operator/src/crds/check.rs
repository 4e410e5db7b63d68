//! `Check` verifies repository integrity.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{RepositorySpec, RunStatus, WorkerSpec};
use super::MaintenanceResource;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "backup.platform", version = "v1", kind = "Check")]
#[kube(namespaced)]
#[kube(status = "RunStatus")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[serde(rename_all = "camelCase")]
pub struct CheckSpec {
    pub repository: RepositorySpec,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl MaintenanceResource for Check {
    const OPERATION: &'static str = "check";

    fn repository(&self) -> &RepositorySpec {
        &self.spec.repository
    }

    fn job_template(&self) -> WorkerSpec {
        let mut spec = WorkerSpec::with_args(["--check"]);
        spec.tags(&self.spec.tags);
        spec
    }

    fn run_status(&self) -> Option<&RunStatus> {
        self.status.as_ref()
    }
}
