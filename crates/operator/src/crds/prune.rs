//! `Prune` applies a retention policy and removes unreferenced data.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{RepositorySpec, RunStatus, WorkerSpec};
use super::MaintenanceResource;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "backup.platform", version = "v1", kind = "Prune")]
#[kube(namespaced)]
#[kube(status = "RunStatus")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[serde(rename_all = "camelCase")]
pub struct PruneSpec {
    pub repository: RepositorySpec,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub retention: RetentionSpec,
}

/// Snapshots to keep; unset counts are not applied
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetentionSpec {
    pub keep_last: Option<u32>,
    pub keep_hourly: Option<u32>,
    pub keep_daily: Option<u32>,
    pub keep_weekly: Option<u32>,
    pub keep_monthly: Option<u32>,
    pub keep_yearly: Option<u32>,
    #[serde(default)]
    pub keep_tags: Vec<String>,
}

impl MaintenanceResource for Prune {
    const OPERATION: &'static str = "prune";

    fn repository(&self) -> &RepositorySpec {
        &self.spec.repository
    }

    fn job_template(&self) -> WorkerSpec {
        let mut spec = WorkerSpec::with_args(["--prune"]);
        spec.tags(&self.spec.tags);

        let retention = &self.spec.retention;
        let counts = [
            ("KEEP_LAST", retention.keep_last),
            ("KEEP_HOURLY", retention.keep_hourly),
            ("KEEP_DAILY", retention.keep_daily),
            ("KEEP_WEEKLY", retention.keep_weekly),
            ("KEEP_MONTHLY", retention.keep_monthly),
            ("KEEP_YEARLY", retention.keep_yearly),
        ];
        for (name, count) in counts {
            if let Some(count) = count {
                spec.env(name, count.to_string());
            }
        }
        if !retention.keep_tags.is_empty() {
            spec.env("KEEP_TAGS", retention.keep_tags.join(","));
        }
        spec
    }

    fn run_status(&self) -> Option<&RunStatus> {
        self.status.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::SecretKeyRef;

    #[test]
    fn retention_becomes_worker_env() {
        let prune = Prune::new(
            "weekly",
            PruneSpec {
                repository: RepositorySpec {
                    url: "rest:http://restic:8000/".to_string(),
                    password_secret_ref: SecretKeyRef {
                        name: "restic".to_string(),
                        key: "password".to_string(),
                    },
                    env_from_secret: None,
                },
                tags: vec!["db".to_string()],
                retention: RetentionSpec {
                    keep_daily: Some(7),
                    keep_tags: vec!["pinned".to_string(), "golden".to_string()],
                    ..RetentionSpec::default()
                },
            },
        );

        let spec = prune.job_template();
        assert_eq!(spec.args, vec!["--prune", "--tag", "db"]);
        assert_eq!(
            spec.env,
            vec![
                serde_json::json!({ "name": "KEEP_DAILY", "value": "7" }),
                serde_json::json!({ "name": "KEEP_TAGS", "value": "pinned,golden" }),
            ]
        );
        assert_eq!(prune.repository_key(), "rest:http://restic:8000");
    }
}
