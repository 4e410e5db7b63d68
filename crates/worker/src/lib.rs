#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Backup maintenance worker
//!
//! This crate is the entry point of a worker process started inside a
//! Kubernetes Job. It sequences repository maintenance (initialize, unlock,
//! prune, check, restore, archive, backup) against a restic repository and
//! streams command output of annotated pods into the repository.
//!
//! The crate is organised around a few seams:
//!
//! - [`repository::RepositoryClient`]: the primitive repository operations,
//!   implemented for real by [`repository::ResticCli`]
//! - [`collector::WorkloadSource`]: discovery and remote execution of
//!   annotated pods, implemented by [`collector::KubeWorkloadSource`]
//! - [`sequencer::MaintenanceSequencer`]: the state machine driving both
//! - [`cancellation::CancellationSupervisor`]: SIGTERM to token wiring

pub mod cancellation;
pub mod cli;
pub mod collector;
pub mod config;
pub mod error;
pub mod locks;
pub mod repository;
pub mod request;
pub mod sequencer;
pub mod stats;

#[cfg(test)]
pub(crate) mod testutil;

pub use cancellation::CancellationSupervisor;
pub use config::WorkerConfig;
pub use error::{CollectorError, Error, RepositoryError, SequenceError};
pub use request::{OperationRequest, RestoreKind, RestoreOptions, S3Destination, TagFilter};
pub use sequencer::{MaintenanceSequencer, Step};
