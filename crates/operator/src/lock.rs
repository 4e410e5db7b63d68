//! # Repository Lock
//!
//! Cluster-wide mutual exclusion keyed by repository identity, backed by the
//! `coordination.k8s.io/v1` Lease API. The operator acquires the lock before
//! it creates a worker Job and releases it once the Job is finished, so at
//! most one worker mutates a repository at any time.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, DeleteParams, PostParams, Preconditions};
use kube::core::ObjectMeta;
use kube::{Client, Error as KubeError};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{debug, info, warn};

const LEASE_PREFIX: &str = "repo-lock-";
const REPOSITORY_ANNOTATION: &str = "backup.platform/repository";
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const MANAGER: &str = "backup-operator";

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] KubeError),

    #[error("Lease {lease} changed while releasing it")]
    ReleaseConflict { lease: String },
}

/// Proof of holding the lock for one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub repository_key: String,
    pub holder: String,
    pub lease_name: String,
}

impl LockToken {
    #[must_use]
    pub fn new(repository_key: &str, holder: &str) -> Self {
        Self {
            repository_key: repository_key.to_string(),
            holder: holder.to_string(),
            lease_name: lease_name(repository_key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    Acquired(LockToken),
    /// Another holder owns a live lease
    Busy { holder: String },
}

#[async_trait]
pub trait RepositoryLock: Send + Sync {
    /// Acquire or renew the lock for `repository_key` on behalf of `holder`.
    ///
    /// Re-acquiring a lock already held by `holder` renews it.
    async fn acquire(&self, repository_key: &str, holder: &str) -> Result<Acquisition, LockError>;

    /// Release the lock if it is still held by the token's holder
    async fn release(&self, token: &LockToken) -> Result<(), LockError>;
}

/// Lease name for a repository key; stable and DNS-1123 safe.
#[must_use]
pub fn lease_name(repository_key: &str) -> String {
    let digest = Sha1::digest(repository_key.as_bytes());
    let hex = hex::encode(digest);
    format!("{LEASE_PREFIX}{}", &hex[..16])
}

fn holder_of(lease: &Lease) -> Option<&str> {
    lease.spec.as_ref().and_then(|spec| spec.holder_identity.as_deref())
}

/// Whether a lease can be taken over at `now`
fn is_expired(lease: &Lease, now: DateTime<Utc>) -> bool {
    let Some(spec) = &lease.spec else {
        return true;
    };

    let Some(renew_time) = spec.renew_time.as_ref().or(spec.acquire_time.as_ref()) else {
        return true;
    };

    let Some(duration_seconds) = spec.lease_duration_seconds else {
        return true;
    };

    renew_time.0 + chrono::Duration::seconds(i64::from(duration_seconds)) < now
}

/// Lease-backed [`RepositoryLock`].
#[derive(Clone)]
pub struct LeaseLock {
    client: Client,
    namespace: String,
    lease_duration: Duration,
}

impl LeaseLock {
    #[must_use]
    pub fn new(client: Client, namespace: &str, lease_duration: Duration) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            lease_duration,
        }
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn lease_seconds(&self) -> i32 {
        i32::try_from(self.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }

    fn lease_object(&self, token: &LockToken) -> Lease {
        let now = Utc::now();
        Lease {
            metadata: ObjectMeta {
                name: Some(token.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGER.to_string())])),
                annotations: Some(BTreeMap::from([(
                    REPOSITORY_ANNOTATION.to_string(),
                    token.repository_key.clone(),
                )])),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(token.holder.clone()),
                lease_duration_seconds: Some(self.lease_seconds()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        }
    }

    /// Replace an existing lease, keeping its `resourceVersion` so a
    /// concurrent writer makes this fail with a conflict
    async fn replace_existing(
        &self,
        api: &Api<Lease>,
        existing: Lease,
        token: &LockToken,
        takeover: bool,
    ) -> Result<Acquisition, LockError> {
        let now = MicroTime(Utc::now());
        let previous_holder = holder_of(&existing).unwrap_or("unknown").to_string();
        let mut updated = existing;
        let spec = updated.spec.get_or_insert_with(LeaseSpec::default);
        spec.holder_identity = Some(token.holder.clone());
        spec.lease_duration_seconds = Some(self.lease_seconds());
        spec.renew_time = Some(now.clone());
        if takeover {
            spec.acquire_time = Some(now);
            spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
        }

        match api
            .replace(&token.lease_name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => {
                if takeover {
                    info!(
                        lease = %token.lease_name,
                        holder = %token.holder,
                        previous_holder = %previous_holder,
                        "took over expired repository lock"
                    );
                } else {
                    debug!(lease = %token.lease_name, holder = %token.holder, "renewed repository lock");
                }
                Ok(Acquisition::Acquired(token.clone()))
            }
            Err(KubeError::Api(err)) if err.code == 409 => {
                debug!(lease = %token.lease_name, "lease changed concurrently");
                Ok(Acquisition::Busy {
                    holder: previous_holder,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl RepositoryLock for LeaseLock {
    async fn acquire(&self, repository_key: &str, holder: &str) -> Result<Acquisition, LockError> {
        let token = LockToken::new(repository_key, holder);
        let api = self.api();

        match api.create(&PostParams::default(), &self.lease_object(&token)).await {
            Ok(_) => {
                info!(
                    lease = %token.lease_name,
                    repository_key = %repository_key,
                    holder = %holder,
                    "acquired repository lock"
                );
                return Ok(Acquisition::Acquired(token));
            }
            Err(KubeError::Api(err)) if err.code == 409 => {}
            Err(e) => return Err(e.into()),
        }

        let existing = match api.get(&token.lease_name).await {
            Ok(lease) => lease,
            // Released between our create and get; the next attempt will win
            Err(KubeError::Api(err)) if err.code == 404 => {
                return Ok(Acquisition::Busy {
                    holder: "unknown".to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let current = holder_of(&existing).map(str::to_string);
        if current.as_deref() == Some(holder) {
            return self.replace_existing(&api, existing, &token, false).await;
        }
        if is_expired(&existing, Utc::now()) {
            return self.replace_existing(&api, existing, &token, true).await;
        }

        let current = current.unwrap_or_else(|| "unknown".to_string());
        debug!(lease = %token.lease_name, holder = %current, "repository lock is held");
        Ok(Acquisition::Busy { holder: current })
    }

    async fn release(&self, token: &LockToken) -> Result<(), LockError> {
        let api = self.api();
        let existing = match api.get(&token.lease_name).await {
            Ok(lease) => lease,
            Err(KubeError::Api(err)) if err.code == 404 => {
                debug!(lease = %token.lease_name, "repository lock already released");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if holder_of(&existing) != Some(token.holder.as_str()) {
            warn!(
                lease = %token.lease_name,
                holder = %token.holder,
                current = holder_of(&existing).unwrap_or("unknown"),
                "repository lock is held by someone else, not releasing"
            );
            return Ok(());
        }

        let params = DeleteParams {
            preconditions: Some(Preconditions {
                resource_version: existing.metadata.resource_version.clone(),
                uid: existing.metadata.uid.clone(),
            }),
            ..DeleteParams::default()
        };
        match api.delete(&token.lease_name, &params).await {
            Ok(_) => {
                info!(lease = %token.lease_name, holder = %token.holder, "released repository lock");
                Ok(())
            }
            Err(KubeError::Api(err)) if err.code == 404 => Ok(()),
            Err(KubeError::Api(err)) if err.code == 409 => Err(LockError::ReleaseConflict {
                lease: token.lease_name.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local lock with the same contract as [`LeaseLock`].
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemoryLock {
    holders: std::sync::Mutex<std::collections::HashMap<String, String>>,
}

#[cfg(test)]
impl MemoryLock {
    pub(crate) fn holder(&self, repository_key: &str) -> Option<String> {
        self.holders.lock().unwrap().get(repository_key).cloned()
    }
}

#[cfg(test)]
#[async_trait]
impl RepositoryLock for MemoryLock {
    async fn acquire(&self, repository_key: &str, holder: &str) -> Result<Acquisition, LockError> {
        let mut holders = self.holders.lock().unwrap();
        let current = holders
            .entry(repository_key.to_string())
            .or_insert_with(|| holder.to_string());
        if current == holder {
            Ok(Acquisition::Acquired(LockToken::new(repository_key, holder)))
        } else {
            Ok(Acquisition::Busy {
                holder: current.clone(),
            })
        }
    }

    async fn release(&self, token: &LockToken) -> Result<(), LockError> {
        let mut holders = self.holders.lock().unwrap();
        if holders.get(&token.repository_key) == Some(&token.holder) {
            holders.remove(&token.repository_key);
        }
        Ok(())
    }
}
