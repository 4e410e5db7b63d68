//! Error types for the maintenance worker.

use thiserror::Error;

use crate::sequencer::Step;

/// Errors raised by a primitive repository operation.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The repository binary could not be started
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// The repository binary exited unsuccessfully
    #[error("{operation} exited with {code}: {stderr}")]
    CommandFailed {
        operation: &'static str,
        code: String,
        stderr: String,
    },

    /// Streaming data into or out of the repository failed
    #[error("I/O error during {operation}: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The repository returned output that could not be decoded
    #[error("failed to decode {operation} output: {source}")]
    Decode {
        operation: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// The operation observed the cancellation token
    #[error("{operation} cancelled by termination request")]
    Cancelled { operation: &'static str },

    /// The adapter cannot perform the requested variant
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Writing an archive into object storage failed
    #[error("upload of {key} failed: {message}")]
    Upload { key: String, message: String },
}

/// Errors raised while backing up annotated pods.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Client construction from in-cluster or kubeconfig credentials failed
    #[error("failed to build Kubernetes client: {0}")]
    Client(String),

    /// The remote command could not be started or streamed
    #[error("exec in pod {pod} (container {container}) failed: {message}")]
    Exec {
        pod: String,
        container: String,
        message: String,
    },

    /// The remote command finished with a non-success status
    #[error("backup command in pod {pod} finished with {status}: {message}")]
    CommandStatus {
        pod: String,
        status: String,
        message: String,
    },

    /// Writing the command output into the repository failed
    #[error("repository write for pod {pod} failed: {source}")]
    Repository {
        pod: String,
        #[source]
        source: RepositoryError,
    },
}

/// Error surfaced by an individual sequencer step.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Collector(#[from] CollectorError),
}

/// Outcome of a failed maintenance run.
#[derive(Debug, Error)]
pub enum SequenceError {
    /// Snapshot listing failed during cache warm-up; nothing else can be trusted
    #[error("repository unreachable, snapshot listing failed: {0}")]
    Fatal(#[source] RepositoryError),

    /// A step failed and the remaining sequence was skipped
    #[error("{step} failed: {source}")]
    Aborted {
        step: Step,
        #[source]
        source: Error,
    },
}

impl SequenceError {
    /// Step that failed, if the run was aborted rather than terminated
    #[must_use]
    pub fn step(&self) -> Option<Step> {
        match self {
            Self::Fatal(_) => None,
            Self::Aborted { step, .. } => Some(*step),
        }
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
