//! Kubernetes-backed [`WorkloadSource`].

use std::collections::HashSet;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{AttachParams, ListParams};
use kube::{Api, Client, ResourceExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{AnnotatedWorkload, CommandOutput, WorkloadSource};
use crate::config::{AnnotationKeys, WorkerConfig};
use crate::error::CollectorError;

const RUNNING_PHASE: &str = "Running";
const SUCCESS_STATUS: &str = "Success";

pub struct KubeWorkloadSource {
    client: OnceCell<Client>,
    namespace: Option<String>,
    annotations: AnnotationKeys,
    has_credentials: bool,
    token: CancellationToken,
}

impl KubeWorkloadSource {
    #[must_use]
    pub fn new(config: &WorkerConfig, token: CancellationToken) -> Self {
        Self {
            client: OnceCell::new(),
            namespace: config.namespace.clone(),
            annotations: config.annotations.clone(),
            has_credentials: config.has_cluster_credentials(),
            token,
        }
    }

    async fn client(&self) -> Result<&Client, CollectorError> {
        self.client
            .get_or_try_init(|| async {
                Client::try_default()
                    .await
                    .map_err(|e| CollectorError::Client(e.to_string()))
            })
            .await
    }

    async fn pods(&self) -> Result<Api<Pod>, CollectorError> {
        let client = self.client().await?.clone();
        let namespace = self
            .namespace
            .clone()
            .unwrap_or_else(|| client.default_namespace().to_string());
        Ok(Api::namespaced(client, &namespace))
    }
}

#[async_trait]
impl WorkloadSource for KubeWorkloadSource {
    fn available(&self) -> bool {
        self.has_credentials
    }

    async fn list(&self) -> Result<Vec<AnnotatedWorkload>, CollectorError> {
        let pods = self.pods().await?;
        let list = pods.list(&ListParams::default()).await?;
        debug!(pods = list.items.len(), "listed pods");
        Ok(select_workloads(list.items, &self.annotations))
    }

    async fn exec(&self, workload: &AnnotatedWorkload) -> Result<CommandOutput, CollectorError> {
        let pods: Api<Pod> = Api::namespaced(self.client().await?.clone(), &workload.namespace);
        let params = AttachParams::default()
            .container(workload.container_name.clone())
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let exec_error = |message: String| CollectorError::Exec {
            pod: workload.pod_name.clone(),
            container: workload.container_name.clone(),
            message,
        };

        let mut attached = pods
            .exec(
                &workload.pod_name,
                vec!["/bin/sh", "-c", workload.command.as_str()],
                &params,
            )
            .await
            .map_err(|e| exec_error(e.to_string()))?;

        let stdout = attached
            .stdout()
            .ok_or_else(|| exec_error("stdout was not attached".to_string()))?;
        let status = attached
            .take_status()
            .ok_or_else(|| exec_error("status channel was not attached".to_string()))?;

        if let Some(stderr) = attached.stderr() {
            let pod = workload.pod_name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(pod = %pod, "{line}");
                }
            });
        }

        let pod = workload.pod_name.clone();
        let container = workload.container_name.clone();
        let token = self.token.clone();
        let exit = Box::pin(async move {
            let status = tokio::select! {
                status = status => status,
                () = token.cancelled() => {
                    return Err(CollectorError::Exec {
                        pod,
                        container,
                        message: "cancelled by termination request".to_string(),
                    });
                }
            };
            if let Err(e) = attached.join().await {
                debug!(pod = %pod, error = %e, "exec session did not close cleanly");
            }
            check_exit_status(&pod, status.as_ref())
        });

        Ok(CommandOutput {
            stdout: Box::pin(stdout),
            exit,
        })
    }
}

/// Interpret the status reported by the exec session
fn check_exit_status(pod: &str, status: Option<&Status>) -> Result<(), CollectorError> {
    match status {
        Some(s) if s.status.as_deref() == Some(SUCCESS_STATUS) => Ok(()),
        Some(s) => Err(CollectorError::CommandStatus {
            pod: pod.to_string(),
            status: s.status.clone().unwrap_or_else(|| "Unknown".to_string()),
            message: s.message.clone().unwrap_or_default(),
        }),
        None => Err(CollectorError::CommandStatus {
            pod: pod.to_string(),
            status: "Unknown".to_string(),
            message: "exec session closed without a status".to_string(),
        }),
    }
}

/// Pick the pods to back up from a pod list.
///
/// Only running pods carrying a non-empty command annotation qualify, and at
/// most one pod per controlling owner is kept so replicas are not dumped
/// twice.
pub(crate) fn select_workloads(pods: Vec<Pod>, keys: &AnnotationKeys) -> Vec<AnnotatedWorkload> {
    let mut owners = HashSet::new();
    let mut selected = Vec::new();

    for pod in pods {
        let running = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|phase| phase == RUNNING_PHASE);
        if !running {
            continue;
        }

        let annotations = pod.annotations();
        let Some(command) = annotations
            .get(&keys.command)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
        else {
            continue;
        };

        if let Some(owner) = pod
            .owner_references()
            .iter()
            .find(|o| o.controller == Some(true))
        {
            if !owners.insert(owner.uid.clone()) {
                debug!(pod = %pod.name_any(), owner = %owner.name, "skipping replica of already selected owner");
                continue;
            }
        }

        let container_name = annotations
            .get(&keys.container)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .or_else(|| {
                pod.spec
                    .as_ref()
                    .and_then(|s| s.containers.first())
                    .map(|c| c.name.clone())
            });
        let Some(container_name) = container_name else {
            warn!(pod = %pod.name_any(), "annotated pod has no containers, skipping");
            continue;
        };

        selected.push(AnnotatedWorkload {
            namespace: pod.namespace().unwrap_or_default(),
            pod_name: pod.name_any(),
            container_name,
            file_extension: annotations
                .get(&keys.file_extension)
                .cloned()
                .unwrap_or_default(),
            command,
        });
    }

    selected
}
