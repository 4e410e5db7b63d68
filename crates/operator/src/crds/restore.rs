//! `Restore` writes a snapshot into a volume or an S3 bucket.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{ClaimTarget, RepositorySpec, RunStatus, S3Target, WorkerSpec};
use super::MaintenanceResource;

const RESTORE_DIR: &str = "/restore";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "backup.platform", version = "v1", kind = "Restore")]
#[kube(namespaced)]
#[kube(status = "RunStatus")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    pub repository: RepositorySpec,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Snapshot ID; the latest snapshot when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    /// Only restore paths containing this value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default)]
    pub verify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<ClaimTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Target>,
}

impl MaintenanceResource for Restore {
    const OPERATION: &'static str = "restore";

    fn repository(&self) -> &RepositorySpec {
        &self.spec.repository
    }

    fn job_template(&self) -> WorkerSpec {
        let restore = &self.spec;
        let kind = if restore.s3.is_some() { "s3" } else { "folder" };
        let mut spec = WorkerSpec::with_args(["--restore", "--restoreType", kind]);

        if let Some(snapshot) = restore.snapshot.as_deref().filter(|s| !s.is_empty()) {
            spec.args.extend(["--restoreSnap".to_string(), snapshot.to_string()]);
        }
        if let Some(filter) = restore.filter.as_deref().filter(|f| !f.is_empty()) {
            spec.args.extend(["--restoreFilter".to_string(), filter.to_string()]);
        }
        if restore.verify {
            spec.args.push("--verifyRestore".to_string());
        }
        spec.tags(&restore.tags);

        spec.env("RESTORE_DIR", RESTORE_DIR);
        if let Some(s3) = &restore.s3 {
            spec.env("RESTORE_S3ENDPOINT", s3.endpoint.clone());
            spec.secret_env("RESTORE_ACCESSKEYID", &s3.access_key_id_secret_ref);
            spec.secret_env("RESTORE_SECRETACCESSKEY", &s3.secret_access_key_secret_ref);
        } else if let Some(folder) = &restore.folder {
            spec.claim("restore", folder, RESTORE_DIR, false);
        }
        spec
    }

    fn run_status(&self) -> Option<&RunStatus> {
        self.status.as_ref()
    }

    fn validate(&self) -> Result<(), String> {
        match (&self.spec.folder, &self.spec.s3) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            (None, None) => Err("restore needs a folder or an s3 destination".to_string()),
            (Some(_), Some(_)) => Err("restore takes either a folder or an s3 destination, not both".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::SecretKeyRef;

    fn spec() -> RestoreSpec {
        RestoreSpec {
            repository: RepositorySpec {
                url: "s3:https://minio.local/backups".to_string(),
                password_secret_ref: SecretKeyRef {
                    name: "restic".to_string(),
                    key: "password".to_string(),
                },
                env_from_secret: Some("minio-credentials".to_string()),
            },
            tags: Vec::new(),
            snapshot: None,
            filter: None,
            verify: false,
            folder: None,
            s3: None,
        }
    }

    #[test]
    fn latest_folder_restore_mounts_claim() {
        let mut restore_spec = spec();
        restore_spec.folder = Some(ClaimTarget {
            claim_name: "restored-data".to_string(),
        });
        let spec = Restore::new("latest", restore_spec).job_template();

        assert_eq!(spec.args, vec!["--restore", "--restoreType", "folder"]);
        assert_eq!(spec.volume_mounts[0]["mountPath"], RESTORE_DIR);
        assert_eq!(spec.volume_mounts[0]["readOnly"], false);
    }

    fn s3_target() -> S3Target {
        S3Target {
            endpoint: "https://s3.local/restore".to_string(),
            access_key_id_secret_ref: SecretKeyRef {
                name: "s3".to_string(),
                key: "access-key".to_string(),
            },
            secret_access_key_secret_ref: SecretKeyRef {
                name: "s3".to_string(),
                key: "secret-key".to_string(),
            },
        }
    }

    #[test]
    fn restore_needs_exactly_one_destination() {
        let none = Restore::new("nowhere", spec());
        assert!(none.validate().unwrap_err().contains("folder or an s3"));

        let mut both_spec = spec();
        both_spec.folder = Some(ClaimTarget {
            claim_name: "restored-data".to_string(),
        });
        both_spec.s3 = Some(s3_target());
        assert!(Restore::new("both", both_spec).validate().is_err());

        let mut folder_spec = spec();
        folder_spec.folder = Some(ClaimTarget {
            claim_name: "restored-data".to_string(),
        });
        assert_eq!(Restore::new("folder", folder_spec).validate(), Ok(()));

        let mut s3_spec = spec();
        s3_spec.s3 = Some(s3_target());
        assert_eq!(Restore::new("s3", s3_spec).validate(), Ok(()));
    }

    #[test]
    fn s3_restore_reads_distinct_secret_keys() {
        let mut restore_spec = spec();
        restore_spec.snapshot = Some("4bba301e".to_string());
        restore_spec.verify = true;
        restore_spec.s3 = Some(s3_target());
        let spec = Restore::new("to-s3", restore_spec).job_template();

        assert_eq!(
            spec.args,
            vec!["--restore", "--restoreType", "s3", "--restoreSnap", "4bba301e", "--verifyRestore"]
        );
        let secret_key = spec
            .env
            .iter()
            .find(|e| e["name"] == "RESTORE_SECRETACCESSKEY")
            .unwrap();
        assert_eq!(secret_key["valueFrom"]["secretKeyRef"]["key"], "secret-key");
        assert!(spec.volumes.is_empty());
    }
}
