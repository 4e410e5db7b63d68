#![allow(clippy::missing_errors_doc, clippy::doc_markdown)]

//! Backup operator
//!
//! Watches the maintenance resources of the `backup.platform` group and runs
//! one worker Job per resource. Jobs touching the same restic repository are
//! serialised through a Lease-backed lock ([`lock::LeaseLock`]) so that a
//! prune never races a backup or another prune.

pub mod config;
pub mod crds;
pub mod error;
pub mod jobs;
pub mod lock;
pub mod reconciler;
pub mod revision;

pub use config::OperatorConfig;
pub use error::{Error, Result};
pub use lock::{Acquisition, LeaseLock, LockToken, RepositoryLock};
pub use reconciler::{run_controllers, Context};
