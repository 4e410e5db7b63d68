//! Types shared by every maintenance resource.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Reference to one key of a `Secret`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

/// The restic repository a resource operates on
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySpec {
    /// Repository location as understood by restic (e.g. `s3:https://minio/bucket`)
    pub url: String,

    /// Secret key holding the repository password
    pub password_secret_ref: SecretKeyRef,

    /// Secret whose keys are exported to the worker as backend credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_from_secret: Option<String>,
}

impl RepositorySpec {
    /// Identity used for cluster-wide locking; equal URLs lock each other
    #[must_use]
    pub fn key(&self) -> String {
        self.url.trim().trim_end_matches('/').to_string()
    }
}

/// PVC mounted into the worker
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimTarget {
    pub claim_name: String,
}

/// S3 bucket a restore is written to
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct S3Target {
    pub endpoint: String,
    pub access_key_id_secret_ref: SecretKeyRef,
    pub secret_access_key_secret_ref: SecretKeyRef,
}

/// Lifecycle phase written by the operator
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum RunPhase {
    /// Seen but not yet scheduled
    #[default]
    Pending,
    /// Another worker holds the repository lock
    WaitingForLock,
    /// Worker Job created and not finished
    Running,
    Succeeded,
    Failed,
}

impl RunPhase {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Self::Pending => "Pending",
            Self::WaitingForLock => "WaitingForLock",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        };
        f.write_str(phase)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    #[serde(default)]
    pub phase: RunPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_holder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<String>,
}

/// Worker invocation contributed by one resource kind.
///
/// `env`, `volumes` and `volume_mounts` hold container-spec JSON fragments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerSpec {
    pub args: Vec<String>,
    pub env: Vec<Value>,
    pub volumes: Vec<Value>,
    pub volume_mounts: Vec<Value>,
}

impl WorkerSpec {
    #[must_use]
    pub fn with_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Append one `--tag` per tag
    pub fn tags(&mut self, tags: &[String]) {
        for tag in tags {
            self.args.push("--tag".to_string());
            self.args.push(tag.clone());
        }
    }

    pub fn env(&mut self, name: &str, value: impl Into<String>) {
        self.env.push(json!({ "name": name, "value": value.into() }));
    }

    pub fn secret_env(&mut self, name: &str, secret: &SecretKeyRef) {
        self.env.push(secret_env(name, secret));
    }

    /// Mount a PVC at `mount_path`
    pub fn claim(&mut self, volume: &str, claim: &ClaimTarget, mount_path: &str, read_only: bool) {
        self.volumes.push(json!({
            "name": volume,
            "persistentVolumeClaim": {
                "claimName": claim.claim_name,
                "readOnly": read_only
            }
        }));
        self.volume_mounts.push(json!({
            "name": volume,
            "mountPath": mount_path,
            "readOnly": read_only
        }));
    }
}

/// Env entry reading one secret key
#[must_use]
pub fn secret_env(name: &str, secret: &SecretKeyRef) -> Value {
    json!({
        "name": name,
        "valueFrom": {
            "secretKeyRef": {
                "name": secret.name,
                "key": secret.key
            }
        }
    })
}
