//! Error types for the backup operator.

use thiserror::Error;

use crate::lock::LockError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Repository lock error: {0}")]
    LockError(#[from] LockError),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
