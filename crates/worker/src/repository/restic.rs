//! Process-backed [`RepositoryClient`] driving the `restic` binary.
//!
//! Repository location and password are inherited from the standard restic
//! environment (`RESTIC_REPOSITORY`, `RESTIC_PASSWORD`, backend credentials).
//! Every child process is killed when the cancellation token fires.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::s3::S3Upload;
use super::{BackupStream, RepositoryClient, Snapshot};
use crate::config::{RetentionPolicy, WorkerConfig};
use crate::error::RepositoryError;
use crate::request::{stdin_filename, RestoreKind, RestoreOptions, TagFilter};
use crate::stats::{OperationStats, StatsReporter};

pub struct ResticCli {
    binary: String,
    hostname: String,
    retention: RetentionPolicy,
    archive_dir: PathBuf,
    lock_wait_interval: Duration,
    token: CancellationToken,
    stats: Option<StatsReporter>,
}

impl ResticCli {
    #[must_use]
    pub fn new(config: &WorkerConfig, token: CancellationToken) -> Self {
        Self {
            binary: config.restic_binary.clone(),
            hostname: config.hostname.clone(),
            retention: config.retention.clone(),
            archive_dir: PathBuf::from(&config.restore_dir),
            lock_wait_interval: config.lock_wait_interval,
            token,
            stats: None,
        }
    }

    #[must_use]
    pub fn with_stats(mut self, stats: StatsReporter) -> Self {
        self.stats = Some(stats);
        self
    }

    fn command(&self, args: &[String]) -> Command {
        let mut command = Command::new(&self.binary);
        command.args(args).kill_on_drop(true);
        command
    }

    /// Run restic to completion and return its stdout
    async fn run(&self, operation: &'static str, args: Vec<String>) -> Result<Vec<u8>, RepositoryError> {
        if self.token.is_cancelled() {
            return Err(RepositoryError::Cancelled { operation });
        }
        debug!(operation, args = ?args, "running restic");

        let child = self
            .command(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RepositoryError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;

        let output = tokio::select! {
            output = child.wait_with_output() => output.map_err(|source| RepositoryError::Io { operation, source })?,
            () = self.token.cancelled() => return Err(RepositoryError::Cancelled { operation }),
        };

        check_status(operation, &output)?;
        Ok(output.stdout)
    }

    async fn observed<T, F>(&self, operation: &'static str, fut: F) -> Result<T, RepositoryError>
    where
        F: Future<Output = Result<T, RepositoryError>> + Send,
    {
        let started = Instant::now();
        let result = fut.await;
        if let Some(stats) = &self.stats {
            let event = OperationStats::new(operation, &self.hostname, result.is_ok(), started.elapsed());
            stats.report(&event).await;
        }
        result
    }

    pub(crate) fn prune_args(&self, tags: &TagFilter) -> Vec<String> {
        let mut args = vec!["forget".to_string(), "--prune".to_string()];
        args.extend(self.retention.to_args());
        args.extend(tags.to_args());
        args
    }

    pub(crate) fn snapshot_args(tags: Option<&TagFilter>) -> Vec<String> {
        let mut args = vec!["snapshots".to_string(), "--json".to_string()];
        if let Some(tags) = tags {
            args.extend(tags.to_args());
        }
        args
    }

    pub(crate) fn restore_args(options: &RestoreOptions, tags: &TagFilter) -> Vec<String> {
        let mut args = vec![
            "restore".to_string(),
            options.snapshot().to_string(),
            "--target".to_string(),
            options.target_dir.clone(),
        ];
        if !options.filter.is_empty() {
            args.push("--include".to_string());
            args.push(options.filter.clone());
        }
        if options.verify {
            args.push("--verify".to_string());
        }
        args.extend(tags.to_args());
        args
    }

    pub(crate) fn backup_args(&self, dir: &Path, tags: &TagFilter) -> Vec<String> {
        let mut args = vec![
            "backup".to_string(),
            dir.display().to_string(),
            "--host".to_string(),
            self.hostname.clone(),
        ];
        args.extend(tags.to_args());
        args
    }

    pub(crate) fn stdin_backup_args(&self, filename: &str, extension: &str, tags: &TagFilter) -> Vec<String> {
        let mut args = vec![
            "backup".to_string(),
            "--stdin".to_string(),
            "--stdin-filename".to_string(),
            stdin_filename(filename, extension),
            "--host".to_string(),
            self.hostname.clone(),
        ];
        args.extend(tags.to_args());
        args
    }

    async fn locks(&self) -> Result<usize, RepositoryError> {
        let stdout = self
            .run("list locks", vec!["list".to_string(), "locks".to_string(), "--no-lock".to_string()])
            .await?;
        Ok(String::from_utf8_lossy(&stdout)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .count())
    }

    async fn stream_into_stdin(
        &self,
        mut data: BackupStream,
        args: Vec<String>,
    ) -> Result<(), RepositoryError> {
        const OPERATION: &str = "stdin backup";
        if self.token.is_cancelled() {
            return Err(RepositoryError::Cancelled { operation: OPERATION });
        }

        let mut child = self
            .command(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RepositoryError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;

        let Some(mut stdin) = child.stdin.take() else {
            return Err(RepositoryError::Io {
                operation: OPERATION,
                source: std::io::Error::other("child stdin was not captured"),
            });
        };
        let stderr = drain_stderr(&mut child);

        let streamed = async move {
            let copied = tokio::io::copy(&mut data, &mut stdin)
                .await
                .map_err(|source| RepositoryError::Io { operation: OPERATION, source })?;
            stdin
                .shutdown()
                .await
                .map_err(|source| RepositoryError::Io { operation: OPERATION, source })?;
            drop(stdin);
            let output = finish(OPERATION, child, stderr).await?;
            Ok::<_, RepositoryError>((copied, output))
        };

        let (copied, output) = tokio::select! {
            result = streamed => result?,
            () = self.token.cancelled() => return Err(RepositoryError::Cancelled { operation: OPERATION }),
        };
        check_status(OPERATION, &output)?;
        debug!(bytes = copied, "stdin backup streamed");
        Ok(())
    }

    /// `restic dump` of a whole snapshot as a tar stream
    pub(crate) fn dump_args(snapshot: &str, tags: &TagFilter) -> Vec<String> {
        let mut args = vec![
            "dump".to_string(),
            "--archive".to_string(),
            "tar".to_string(),
            snapshot.to_string(),
            "/".to_string(),
        ];
        args.extend(tags.to_args());
        args
    }

    async fn dump_to_file(
        &self,
        operation: &'static str,
        args: Vec<String>,
        target: &Path,
    ) -> Result<u64, RepositoryError> {
        if self.token.is_cancelled() {
            return Err(RepositoryError::Cancelled { operation });
        }
        let mut child = self
            .command(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RepositoryError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;
        let Some(mut stdout) = child.stdout.take() else {
            return Err(RepositoryError::Io {
                operation,
                source: std::io::Error::other("child stdout was not captured"),
            });
        };
        let stderr = drain_stderr(&mut child);

        let target = target.to_path_buf();
        let written = async move {
            let mut file = tokio::fs::File::create(&target)
                .await
                .map_err(|source| RepositoryError::Io { operation, source })?;
            let written = tokio::io::copy(&mut stdout, &mut file)
                .await
                .map_err(|source| RepositoryError::Io { operation, source })?;
            file.flush()
                .await
                .map_err(|source| RepositoryError::Io { operation, source })?;
            let output = finish(operation, child, stderr).await?;
            Ok::<_, RepositoryError>((written, output))
        };

        let (written, output) = tokio::select! {
            result = written => result?,
            () = self.token.cancelled() => return Err(RepositoryError::Cancelled { operation }),
        };
        check_status(operation, &output)?;
        Ok(written)
    }

    /// Dump the requested snapshot and upload it to the destination bucket
    async fn restore_to_s3(&self, options: &RestoreOptions, tags: &TagFilter) -> Result<(), RepositoryError> {
        let upload = S3Upload::new(&options.s3)?;
        let name = format!("{}-{}.tar", self.hostname, options.snapshot());
        let staging = std::env::temp_dir().join(format!("restore-{name}"));

        let result = async {
            let written = self
                .dump_to_file("restore", Self::dump_args(options.snapshot(), tags), &staging)
                .await?;
            if options.verify && written == 0 {
                return Err(RepositoryError::CommandFailed {
                    operation: "restore",
                    code: "0".to_string(),
                    stderr: format!("dump of snapshot {} is empty", options.snapshot()),
                });
            }
            upload.upload(&name, &staging).await?;
            Ok(())
        }
        .await;

        if let Err(e) = tokio::fs::remove_file(&staging).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %staging.display(), error = %e, "failed to remove staged restore archive");
            }
        }
        result
    }
}

/// Read the child's stderr in the background until it closes.
///
/// Restic may write more than a pipe buffer of warnings while its stdin or
/// stdout is still being streamed; the pipe has to be emptied concurrently.
fn drain_stderr(child: &mut Child) -> JoinHandle<Vec<u8>> {
    let stderr = child.stderr.take();
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stderr) = stderr {
            if let Err(e) = stderr.read_to_end(&mut buf).await {
                warn!(error = %e, "failed to read restic stderr");
            }
        }
        buf
    })
}

/// Wait for the child and pair its exit status with the drained stderr
async fn finish(
    operation: &'static str,
    mut child: Child,
    stderr: JoinHandle<Vec<u8>>,
) -> Result<Output, RepositoryError> {
    let status = child
        .wait()
        .await
        .map_err(|source| RepositoryError::Io { operation, source })?;
    let stderr = stderr.await.unwrap_or_default();
    Ok(Output {
        status,
        stdout: Vec::new(),
        stderr,
    })
}

fn check_status(operation: &'static str, output: &Output) -> Result<(), RepositoryError> {
    if output.status.success() {
        return Ok(());
    }
    let code = output
        .status
        .code()
        .map_or_else(|| "signal".to_string(), |c| c.to_string());
    Err(RepositoryError::CommandFailed {
        operation,
        code,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Latest snapshot per host and path set, limited to snapshots whose paths
/// contain `filter` when it is not empty.
pub(crate) fn latest_per_source<'a>(snapshots: &'a [Snapshot], filter: &str) -> Vec<&'a Snapshot> {
    let mut latest: Vec<&Snapshot> = Vec::new();
    for snapshot in snapshots {
        if !filter.is_empty() && !snapshot.paths.iter().any(|p| p.contains(filter)) {
            continue;
        }
        match latest
            .iter_mut()
            .find(|s| s.hostname == snapshot.hostname && s.paths == snapshot.paths)
        {
            Some(existing) if existing.time < snapshot.time => *existing = snapshot,
            Some(_) => {}
            None => latest.push(snapshot),
        }
    }
    latest
}

#[async_trait]
impl RepositoryClient for ResticCli {
    async fn init(&self) -> Result<(), RepositoryError> {
        self.observed("init", async {
            if self
                .run("cat config", vec!["cat".to_string(), "config".to_string()])
                .await
                .is_ok()
            {
                info!("repository already initialized");
                return Ok(());
            }
            self.run("init", vec!["init".to_string()]).await?;
            info!("repository initialized");
            Ok(())
        })
        .await
    }

    async fn unlock(&self, force: bool) -> Result<(), RepositoryError> {
        let mut args = vec!["unlock".to_string()];
        if force {
            args.push("--remove-all".to_string());
        }
        self.observed("unlock", async {
            self.run("unlock", args).await?;
            Ok(())
        })
        .await
    }

    async fn snapshots(&self, tags: Option<&TagFilter>) -> Result<Vec<Snapshot>, RepositoryError> {
        let args = Self::snapshot_args(tags);
        self.observed("snapshots", async {
            let stdout = self.run("snapshots", args).await?;
            let snapshots: Option<Vec<Snapshot>> = serde_json::from_slice(&stdout)
                .map_err(|source| RepositoryError::Decode { operation: "snapshots", source })?;
            let snapshots = snapshots.unwrap_or_default();
            debug!(count = snapshots.len(), "listed snapshots");
            Ok(snapshots)
        })
        .await
    }

    async fn wait_for_locks(&self) -> Result<(), RepositoryError> {
        loop {
            let held = self.locks().await?;
            if held == 0 {
                debug!("repository holds no locks");
                return Ok(());
            }
            info!(
                locks = held,
                retry_in_secs = self.lock_wait_interval.as_secs(),
                "repository is locked, waiting"
            );
            tokio::select! {
                () = tokio::time::sleep(self.lock_wait_interval) => {}
                () = self.token.cancelled() => {
                    return Err(RepositoryError::Cancelled { operation: "wait for locks" });
                }
            }
        }
    }

    async fn prune(&self, tags: &TagFilter) -> Result<(), RepositoryError> {
        let args = self.prune_args(tags);
        if self.retention.is_empty() {
            warn!("no retention policy configured, prune will only remove unreferenced data");
        }
        self.observed("prune", async {
            self.run("prune", args).await?;
            Ok(())
        })
        .await
    }

    async fn check(&self) -> Result<(), RepositoryError> {
        self.observed("check", async {
            self.run("check", vec!["check".to_string()]).await?;
            Ok(())
        })
        .await
    }

    async fn restore(&self, options: &RestoreOptions, tags: &TagFilter) -> Result<(), RepositoryError> {
        info!(
            kind = %options.kind,
            snapshot = options.snapshot(),
            target = %options.target_dir,
            "restoring snapshot"
        );
        if options.kind == RestoreKind::S3 {
            return self.observed("restore", self.restore_to_s3(options, tags)).await;
        }
        let args = Self::restore_args(options, tags);
        self.observed("restore", async {
            self.run("restore", args).await?;
            Ok(())
        })
        .await
    }

    async fn archive(&self, filter: &str, verify: bool, tags: &TagFilter) -> Result<(), RepositoryError> {
        self.observed("archive", async {
            let snapshots = self.snapshots(Some(tags)).await?;
            let selected = latest_per_source(&snapshots, filter);
            info!(snapshots = selected.len(), target = %self.archive_dir.display(), "archiving snapshots");

            for snapshot in selected {
                let short_id = if snapshot.short_id.is_empty() {
                    snapshot.id.chars().take(8).collect()
                } else {
                    snapshot.short_id.clone()
                };
                let target = self
                    .archive_dir
                    .join(format!("{}-{}.tar", snapshot.hostname, short_id));
                let args = Self::dump_args(&snapshot.id, &TagFilter::new());
                let written = self.dump_to_file("archive", args, &target).await?;
                if verify && written == 0 {
                    return Err(RepositoryError::CommandFailed {
                        operation: "archive",
                        code: "0".to_string(),
                        stderr: format!("archive {} is empty", target.display()),
                    });
                }
                info!(snapshot = %short_id, bytes = written, "archived snapshot");
            }
            Ok(())
        })
        .await
    }

    async fn backup(&self, dir: &Path, tags: &TagFilter) -> Result<(), RepositoryError> {
        let args = self.backup_args(dir, tags);
        self.observed("backup", async {
            self.run("backup", args).await?;
            Ok(())
        })
        .await
    }

    async fn stdin_backup(
        &self,
        data: BackupStream,
        filename: &str,
        extension: &str,
        tags: &TagFilter,
    ) -> Result<(), RepositoryError> {
        let args = self.stdin_backup_args(filename, extension, tags);
        self.observed("stdin backup", self.stream_into_stdin(data, args)).await
    }
}
