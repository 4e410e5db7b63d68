//! Generic reconciliation shared by every maintenance resource.
//!
//! A worker Job is only created while the reconciler holds the repository's
//! cluster lock; the lock is released once the Job finishes or the resource
//! is deleted.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};

use crate::config::OperatorConfig;
use crate::crds::{
    Archive, Backup, Check, MaintenanceResource, Prune, Restore, RunPhase, RunStatus,
};
use crate::error::{Error, Result};
use crate::jobs::{self, JobState, OPERATION_LABEL};
use crate::lock::{Acquisition, LockError, LockToken, RepositoryLock};
use crate::revision::revision_changes;

pub const FINALIZER: &str = "backup.platform/finalizer";

pub struct Context {
    pub client: Client,
    pub config: Arc<OperatorConfig>,
    pub lock: Arc<dyn RepositoryLock>,
}

/// Next step for a resource given its Job state and the lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    CreateJob(LockToken),
    WaitForLock { holder: String },
    KeepRunning,
    Finish { succeeded: bool },
}

pub async fn decide(
    lock: &dyn RepositoryLock,
    state: JobState,
    repository_key: &str,
    holder: &str,
) -> Result<Decision, LockError> {
    match state {
        JobState::NotFound => match lock.acquire(repository_key, holder).await? {
            Acquisition::Acquired(token) => Ok(Decision::CreateJob(token)),
            Acquisition::Busy { holder } => Ok(Decision::WaitForLock { holder }),
        },
        JobState::Running => {
            // Renewal keeps the lease alive; the Job keeps running either way
            match lock.acquire(repository_key, holder).await {
                Ok(Acquisition::Acquired(_)) => {}
                Ok(Acquisition::Busy { holder: current }) => {
                    warn!(repository_key, holder = %current, "lock taken over while job is running");
                }
                Err(e) => warn!(repository_key, error = %e, "failed to renew repository lock"),
            }
            Ok(Decision::KeepRunning)
        }
        JobState::Succeeded | JobState::Failed => {
            lock.release(&LockToken::new(repository_key, holder)).await?;
            Ok(Decision::Finish {
                succeeded: state == JobState::Succeeded,
            })
        }
    }
}

/// Finished and already recorded for the current generation
pub fn is_settled<K: MaintenanceResource>(resource: &K) -> bool {
    resource.run_status().is_some_and(|status| {
        status.phase.is_terminal() && status.observed_generation == resource.meta().generation
    })
}

/// Terminal status for a spec that failed validation
fn rejected_status(reason: String) -> RunStatus {
    RunStatus {
        phase: RunPhase::Failed,
        message: Some(reason),
        ..RunStatus::default()
    }
}

fn status_unchanged(current: Option<&RunStatus>, desired: &RunStatus) -> bool {
    current.is_some_and(|current| {
        current.phase == desired.phase
            && current.message == desired.message
            && current.job_name == desired.job_name
            && current.observed_generation == desired.observed_generation
            && current.lock_holder == desired.lock_holder
    })
}

#[instrument(skip(resource, ctx), fields(kind = K::OPERATION, name = %resource.name_any()))]
pub async fn reconcile<K: MaintenanceResource>(resource: Arc<K>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = resource
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let api: Api<K> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, FINALIZER, resource, |event| async {
        match event {
            FinalizerEvent::Apply(resource) => apply(resource, &ctx).await,
            FinalizerEvent::Cleanup(resource) => cleanup(resource, &ctx).await,
        }
    })
    .await
    .map_err(|e| match e {
        kube::runtime::finalizer::Error::ApplyFailed(err)
        | kube::runtime::finalizer::Error::CleanupFailed(err) => err,
        kube::runtime::finalizer::Error::AddFinalizer(e)
        | kube::runtime::finalizer::Error::RemoveFinalizer(e) => Error::KubeError(e),
        kube::runtime::finalizer::Error::UnnamedObject => {
            Error::MissingObjectKey(".metadata.name")
        }
        kube::runtime::finalizer::Error::InvalidFinalizer => {
            Error::ConfigError("Invalid finalizer name".to_string())
        }
    })
}

async fn apply<K: MaintenanceResource>(resource: Arc<K>, ctx: &Context) -> Result<Action> {
    if is_settled(resource.as_ref()) {
        debug!("resource already finished, ignoring");
        return Ok(Action::await_change());
    }

    let namespace = resource
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &namespace);
    let job_name = jobs::job_name(resource.as_ref());
    let repository_key = resource.repository_key();
    let holder = jobs::holder_identity(resource.as_ref())?;

    let state = jobs::job_state(&jobs, &job_name).await?;
    debug!(job_name = %job_name, ?state, "observed worker job");

    if state == JobState::NotFound {
        if let Err(reason) = resource.validate() {
            warn!(reason = %reason, "invalid resource, no worker job scheduled");
            update_status(resource.as_ref(), ctx, rejected_status(reason)).await?;
            return Ok(Action::await_change());
        }
    }

    match decide(ctx.lock.as_ref(), state, &repository_key, &holder).await? {
        Decision::CreateJob(token) => {
            let created = match jobs::build_job(resource.as_ref(), &ctx.config) {
                Ok(job) => jobs::create_job(&jobs, &job).await,
                Err(e) => Err(e),
            };
            if let Err(e) = created {
                if let Err(release_err) = ctx.lock.release(&token).await {
                    warn!(repository_key = %repository_key, error = %release_err, "failed to release lock after job creation failure");
                }
                return Err(e);
            }

            info!(job_name = %job_name, repository_key = %repository_key, "worker job started");
            let status = RunStatus {
                phase: RunPhase::Running,
                message: Some("Worker job running".to_string()),
                job_name: Some(job_name),
                lock_holder: Some(holder),
                ..RunStatus::default()
            };
            update_status(resource.as_ref(), ctx, status).await?;
            Ok(Action::requeue(ctx.config.running_requeue()))
        }
        Decision::WaitForLock { holder: current } => {
            info!(repository_key = %repository_key, holder = %current, "repository locked, waiting");
            let status = RunStatus {
                phase: RunPhase::WaitingForLock,
                message: Some(format!("Repository locked by {current}")),
                lock_holder: Some(current),
                ..RunStatus::default()
            };
            update_status(resource.as_ref(), ctx, status).await?;
            Ok(Action::requeue(ctx.config.lock_retry()))
        }
        Decision::KeepRunning => {
            let status = RunStatus {
                phase: RunPhase::Running,
                message: Some("Worker job running".to_string()),
                job_name: Some(job_name),
                lock_holder: Some(holder),
                ..RunStatus::default()
            };
            update_status(resource.as_ref(), ctx, status).await?;
            Ok(Action::requeue(ctx.config.running_requeue()))
        }
        Decision::Finish { succeeded } => {
            let (phase, message) = if succeeded {
                (RunPhase::Succeeded, "Worker job completed")
            } else {
                (RunPhase::Failed, "Worker job failed")
            };
            info!(job_name = %job_name, %phase, "worker job finished, lock released");
            let status = RunStatus {
                phase,
                message: Some(message.to_string()),
                job_name: Some(job_name),
                ..RunStatus::default()
            };
            update_status(resource.as_ref(), ctx, status).await?;
            Ok(Action::await_change())
        }
    }
}

async fn cleanup<K: MaintenanceResource>(resource: Arc<K>, ctx: &Context) -> Result<Action> {
    let repository_key = resource.repository_key();
    let holder = jobs::holder_identity(resource.as_ref())?;
    info!(repository_key = %repository_key, holder = %holder, "resource deleted, releasing lock");

    // The worker Job is garbage collected through its owner reference
    ctx.lock
        .release(&LockToken::new(&repository_key, &holder))
        .await?;
    Ok(Action::await_change())
}

/// Merge-patch the status subresource, skipping no-op updates
async fn update_status<K: MaintenanceResource>(
    resource: &K,
    ctx: &Context,
    mut desired: RunStatus,
) -> Result<()> {
    desired.observed_generation = resource.meta().generation;
    if status_unchanged(resource.run_status(), &desired) {
        debug!(phase = %desired.phase, "status unchanged, skipping update");
        return Ok(());
    }

    let namespace = resource
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let api: Api<K> = Api::namespaced(ctx.client.clone(), &namespace);

    desired.last_update = Some(chrono::Utc::now().to_rfc3339());
    let mut status = serde_json::to_value(&desired)?;
    // Merge patches only clear fields that are explicitly null
    for field in ["message", "jobName", "lockHolder"] {
        if status.get(field).is_none() {
            status[field] = Value::Null;
        }
    }
    let patch = json!({ "status": status });
    api.patch_status(
        &resource.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

pub fn error_policy<K: MaintenanceResource>(
    resource: Arc<K>,
    error: &Error,
    ctx: Arc<Context>,
) -> Action {
    error!(
        kind = K::OPERATION,
        name = %resource.name_any(),
        error = %error,
        "reconciliation failed"
    );
    Action::requeue(ctx.config.error_requeue())
}

/// Watch one resource kind and the Jobs it owns until the stream ends
pub async fn run_controller<K: MaintenanceResource>(ctx: Arc<Context>) {
    let namespace = ctx.config.namespace.clone();
    info!(kind = K::OPERATION, namespace = %namespace, "starting controller");

    let resources: Api<K> = Api::namespaced(ctx.client.clone(), &namespace);
    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &namespace);
    let watcher_config = watcher::Config::default().any_semantic();
    let job_config = watcher::Config::default()
        .any_semantic()
        .labels(&format!("{OPERATION_LABEL}={}", K::OPERATION));

    // Status writes by this reconciler must not trigger it again
    let (reader, writer) = reflector::store();
    let changes = revision_changes(
        watcher(resources, watcher_config)
            .default_backoff()
            .reflect(writer),
    );

    Controller::for_stream(changes, reader)
        .owns(jobs, job_config)
        .run(reconcile::<K>, error_policy::<K>, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(kind = K::OPERATION, name = %object.name, "reconciled"),
                Err(e) => warn!(kind = K::OPERATION, error = %e, "reconciliation error"),
            }
        })
        .await;

    info!(kind = K::OPERATION, "controller stopped");
}

/// Run one controller per maintenance kind until all of them stop
pub async fn run_controllers(ctx: Arc<Context>) {
    futures::join!(
        run_controller::<Backup>(ctx.clone()),
        run_controller::<Check>(ctx.clone()),
        run_controller::<Prune>(ctx.clone()),
        run_controller::<Restore>(ctx.clone()),
        run_controller::<Archive>(ctx),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{CheckSpec, RepositorySpec, SecretKeyRef};
    use crate::lock::MemoryLock;

    const REPO: &str = "s3:https://minio.local/backups";

    #[tokio::test]
    async fn second_resource_waits_until_first_finishes() {
        let lock = MemoryLock::default();

        let first = decide(&lock, JobState::NotFound, REPO, "prune/apps/weekly")
            .await
            .unwrap();
        assert!(matches!(first, Decision::CreateJob(ref t) if t.holder == "prune/apps/weekly"));

        let second = decide(&lock, JobState::NotFound, REPO, "check/apps/daily")
            .await
            .unwrap();
        assert_eq!(
            second,
            Decision::WaitForLock {
                holder: "prune/apps/weekly".to_string()
            }
        );

        let finished = decide(&lock, JobState::Succeeded, REPO, "prune/apps/weekly")
            .await
            .unwrap();
        assert_eq!(finished, Decision::Finish { succeeded: true });
        assert_eq!(lock.holder(REPO), None);

        let retry = decide(&lock, JobState::NotFound, REPO, "check/apps/daily")
            .await
            .unwrap();
        assert!(matches!(retry, Decision::CreateJob(ref t) if t.holder == "check/apps/daily"));
    }

    #[tokio::test]
    async fn other_repositories_are_not_blocked() {
        let lock = MemoryLock::default();
        decide(&lock, JobState::NotFound, REPO, "prune/apps/weekly")
            .await
            .unwrap();

        let other = decide(&lock, JobState::NotFound, "rest:http://restic:8000", "backup/apps/db")
            .await
            .unwrap();
        assert!(matches!(other, Decision::CreateJob(_)));
    }

    #[tokio::test]
    async fn running_job_keeps_its_lock() {
        let lock = MemoryLock::default();
        decide(&lock, JobState::NotFound, REPO, "backup/apps/db")
            .await
            .unwrap();

        let running = decide(&lock, JobState::Running, REPO, "backup/apps/db")
            .await
            .unwrap();
        assert_eq!(running, Decision::KeepRunning);
        assert_eq!(lock.holder(REPO).as_deref(), Some("backup/apps/db"));
    }

    #[tokio::test]
    async fn failed_job_releases_only_its_own_lock() {
        let lock = MemoryLock::default();
        decide(&lock, JobState::NotFound, REPO, "backup/apps/db")
            .await
            .unwrap();

        let stray = decide(&lock, JobState::Failed, REPO, "check/apps/daily")
            .await
            .unwrap();
        assert_eq!(stray, Decision::Finish { succeeded: false });
        assert_eq!(lock.holder(REPO).as_deref(), Some("backup/apps/db"));
    }

    fn check(generation: i64, status: Option<RunStatus>) -> Check {
        let mut check = Check::new(
            "daily",
            CheckSpec {
                repository: RepositorySpec {
                    url: REPO.to_string(),
                    password_secret_ref: SecretKeyRef {
                        name: "restic".to_string(),
                        key: "password".to_string(),
                    },
                    env_from_secret: None,
                },
                tags: Vec::new(),
            },
        );
        check.metadata.generation = Some(generation);
        check.status = status;
        check
    }

    #[test]
    fn only_finished_current_generation_is_settled() {
        let finished = RunStatus {
            phase: RunPhase::Succeeded,
            observed_generation: Some(1),
            ..RunStatus::default()
        };
        assert!(is_settled(&check(1, Some(finished.clone()))));
        assert!(!is_settled(&check(2, Some(finished))));

        let running = RunStatus {
            phase: RunPhase::Running,
            observed_generation: Some(1),
            ..RunStatus::default()
        };
        assert!(!is_settled(&check(1, Some(running))));
        assert!(!is_settled(&check(1, None)));
    }

    #[test]
    fn rejected_spec_settles_until_edited() {
        let mut status = rejected_status("restore needs a folder or an s3 destination".to_string());
        status.observed_generation = Some(1);
        assert!(is_settled(&check(1, Some(status.clone()))));
        assert!(!is_settled(&check(2, Some(status.clone()))));
        assert_eq!(status.lock_holder, None);
        assert_eq!(status.job_name, None);
    }

    #[test]
    fn timestamp_alone_is_not_a_change() {
        let current = RunStatus {
            phase: RunPhase::WaitingForLock,
            lock_holder: Some("prune/apps/weekly".to_string()),
            observed_generation: Some(3),
            last_update: Some("2026-01-01T00:00:00Z".to_string()),
            ..RunStatus::default()
        };
        let mut desired = RunStatus {
            last_update: None,
            ..current.clone()
        };
        assert!(status_unchanged(Some(&current), &desired));

        desired.lock_holder = Some("backup/apps/db".to_string());
        assert!(!status_unchanged(Some(&current), &desired));
        assert!(!status_unchanged(None, &desired));
    }
}
