//! Worker Job construction and state classification.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobStatus};
use kube::api::{Api, PostParams};
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::info;

use crate::config::OperatorConfig;
use crate::crds::common::secret_env;
use crate::crds::MaintenanceResource;
use crate::error::{Error, Result};

pub const MANAGED_BY: &str = "backup-operator";
pub const OPERATION_LABEL: &str = "backup.platform/operation";
pub const RESOURCE_LABEL: &str = "backup.platform/resource";

const WORKER_CONTAINER: &str = "backup-worker";
const MAX_NAME_LENGTH: usize = 63;

/// Observed state of the worker Job owned by a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    NotFound,
    Running,
    Succeeded,
    Failed,
}

/// `<operation>-<resource>`, cut to a valid object name
pub fn job_name<K: MaintenanceResource>(resource: &K) -> String {
    let name = format!("{}-{}", K::OPERATION, resource.name_any());
    let truncated: String = name.chars().take(MAX_NAME_LENGTH).collect();
    truncated.trim_end_matches(['-', '.']).to_string()
}

/// Lock holder identity of a resource: `<operation>/<namespace>/<name>`
pub fn holder_identity<K: MaintenanceResource>(resource: &K) -> Result<String> {
    let namespace = resource
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    Ok(format!(
        "{}/{}/{}",
        K::OPERATION,
        namespace,
        resource.name_any()
    ))
}

pub fn build_job<K: MaintenanceResource>(resource: &K, config: &OperatorConfig) -> Result<Job> {
    let name = resource
        .meta()
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let namespace = resource
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let owner = resource
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;

    let worker = &config.worker;
    let repository = resource.repository();
    let template = resource.job_template();

    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        MANAGED_BY.to_string(),
    );
    labels.insert(OPERATION_LABEL.to_string(), K::OPERATION.to_string());
    labels.insert(RESOURCE_LABEL.to_string(), name);

    // Snapshots are grouped per namespace, so the namespace doubles as host
    let mut env = vec![
        json!({ "name": "RESTIC_REPOSITORY", "value": repository.url }),
        secret_env("RESTIC_PASSWORD", &repository.password_secret_ref),
        json!({ "name": "HOSTNAME", "value": namespace }),
        json!({ "name": "POD_NAMESPACE", "value": namespace }),
    ];
    if let Some(prom_url) = &worker.prom_url {
        env.push(json!({ "name": "PROM_URL", "value": prom_url }));
    }
    if let Some(stats_url) = &worker.stats_url {
        env.push(json!({ "name": "STATS_URL", "value": stats_url }));
    }
    env.extend(template.env);

    let mut container = json!({
        "name": WORKER_CONTAINER,
        "image": worker.image,
        "args": template.args,
        "env": env,
        "volumeMounts": template.volume_mounts
    });
    if let Some(secret) = &repository.env_from_secret {
        container["envFrom"] = json!([{ "secretRef": { "name": secret } }]);
    }

    let mut pod_spec = json!({
        "restartPolicy": "Never",
        "containers": [container],
        "volumes": template.volumes
    });
    if let Some(service_account) = &worker.service_account_name {
        pod_spec["serviceAccountName"] = json!(service_account);
    }

    let job = json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": job_name(resource),
            "namespace": namespace,
            "labels": labels,
            "ownerReferences": [owner]
        },
        "spec": {
            "backoffLimit": worker.backoff_limit,
            "activeDeadlineSeconds": worker.active_deadline_seconds,
            "template": {
                "metadata": { "labels": labels },
                "spec": pod_spec
            }
        }
    });

    Ok(serde_json::from_value(job)?)
}

/// Create the Job; an existing Job of the same name is left alone
pub async fn create_job(jobs: &Api<Job>, job: &Job) -> Result<()> {
    match jobs.create(&PostParams::default(), job).await {
        Ok(_) => {
            info!(job_name = %job.name_any(), "created worker job");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            info!(job_name = %job.name_any(), "worker job already exists");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn job_state(jobs: &Api<Job>, job_name: &str) -> Result<JobState> {
    let Some(job) = jobs.get_opt(job_name).await? else {
        return Ok(JobState::NotFound);
    };
    Ok(job.status.as_ref().map_or(JobState::Running, classify))
}

/// Conditions win over the succeeded/failed counters
#[must_use]
pub fn classify(status: &JobStatus) -> JobState {
    if let Some(conditions) = &status.conditions {
        for condition in conditions {
            if condition.status != "True" {
                continue;
            }
            match condition.type_.as_str() {
                "Complete" => return JobState::Succeeded,
                "Failed" => return JobState::Failed,
                _ => {}
            }
        }
    }

    if status.succeeded.is_some_and(|n| n > 0) {
        return JobState::Succeeded;
    }
    if status.failed.is_some_and(|n| n > 0) {
        return JobState::Failed;
    }
    JobState::Running
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{Backup, BackupSpec, ClaimTarget, RepositorySpec, SecretKeyRef};
    use k8s_openapi::api::batch::v1::JobCondition;

    fn backup(name: &str) -> Backup {
        let mut backup = Backup::new(
            name,
            BackupSpec {
                repository: RepositorySpec {
                    url: "s3:https://minio.local/backups".to_string(),
                    password_secret_ref: SecretKeyRef {
                        name: "restic".to_string(),
                        key: "password".to_string(),
                    },
                    env_from_secret: Some("minio-credentials".to_string()),
                },
                tags: vec!["weekly".to_string()],
                claim: Some(ClaimTarget {
                    claim_name: "app-data".to_string(),
                }),
            },
        );
        backup.metadata.namespace = Some("apps".to_string());
        backup.metadata.uid = Some("8c1d6a4e".to_string());
        backup
    }

    fn env_value<'a>(job: &'a Job, name: &str) -> Option<&'a str> {
        job.spec.as_ref()?.template.spec.as_ref()?.containers[0]
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)?
            .value
            .as_deref()
    }

    #[test]
    fn job_is_owned_labelled_and_configured() {
        let config = OperatorConfig {
            worker: crate::config::WorkerJobConfig {
                service_account_name: Some("backup-worker".to_string()),
                prom_url: Some("http://pushgateway:9091".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let job = build_job(&backup("nightly"), &config).unwrap();

        assert_eq!(job.metadata.name.as_deref(), Some("backup-nightly"));
        let owner = &job.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "Backup");
        assert_eq!(owner.uid, "8c1d6a4e");
        assert_eq!(owner.controller, Some(true));
        let labels = job.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[OPERATION_LABEL], "backup");
        assert_eq!(labels[RESOURCE_LABEL], "nightly");

        let spec = job.spec.as_ref().unwrap();
        assert_eq!(spec.backoff_limit, Some(config.worker.backoff_limit));
        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.service_account_name.as_deref(), Some("backup-worker"));
        assert_eq!(pod.volumes.as_ref().unwrap()[0].name, "data");

        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some(config.worker.image.as_str()));
        assert_eq!(
            container.args.as_ref().unwrap(),
            &vec!["--tag".to_string(), "weekly".to_string()]
        );
        let env_from = serde_json::to_value(&container.env_from).unwrap();
        assert_eq!(env_from[0]["secretRef"]["name"], "minio-credentials");

        assert_eq!(
            env_value(&job, "RESTIC_REPOSITORY"),
            Some("s3:https://minio.local/backups")
        );
        assert_eq!(env_value(&job, "HOSTNAME"), Some("apps"));
        assert_eq!(env_value(&job, "PROM_URL"), Some("http://pushgateway:9091"));
        assert_eq!(env_value(&job, "STATS_URL"), None);
    }

    #[test]
    fn job_requires_uid_for_owner_reference() {
        let mut resource = backup("nightly");
        resource.metadata.uid = None;
        assert!(matches!(
            build_job(&resource, &OperatorConfig::default()),
            Err(Error::MissingObjectKey(_))
        ));
    }

    #[test]
    fn long_names_are_truncated() {
        let name = format!("{}-x", "a".repeat(58));
        let job_name = job_name(&backup(&name));
        assert!(job_name.len() <= MAX_NAME_LENGTH);
        assert!(!job_name.ends_with('-'));
        assert!(job_name.starts_with("backup-aaa"));
    }

    #[test]
    fn holder_names_operation_namespace_and_resource() {
        assert_eq!(
            holder_identity(&backup("nightly")).unwrap(),
            "backup/apps/nightly"
        );
    }

    fn condition(type_: &str, status: &str) -> JobCondition {
        JobCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn classification_prefers_conditions() {
        let complete = JobStatus {
            conditions: Some(vec![condition("Complete", "True")]),
            failed: Some(1),
            ..Default::default()
        };
        assert_eq!(classify(&complete), JobState::Succeeded);

        let failed = JobStatus {
            conditions: Some(vec![condition("Failed", "True")]),
            ..Default::default()
        };
        assert_eq!(classify(&failed), JobState::Failed);

        let suspended = JobStatus {
            conditions: Some(vec![condition("Complete", "False")]),
            ..Default::default()
        };
        assert_eq!(classify(&suspended), JobState::Running);
    }

    #[test]
    fn classification_falls_back_to_counters() {
        let succeeded = JobStatus {
            succeeded: Some(1),
            ..Default::default()
        };
        assert_eq!(classify(&succeeded), JobState::Succeeded);

        let failed = JobStatus {
            failed: Some(1),
            ..Default::default()
        };
        assert_eq!(classify(&failed), JobState::Failed);

        assert_eq!(classify(&JobStatus::default()), JobState::Running);
    }
}
