//! End-to-end worker runs against a scripted restic binary.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use backup_worker::collector::{AnnotatedWorkload, CommandOutput, WorkloadSource};
use backup_worker::repository::ResticCli;
use backup_worker::{CancellationSupervisor, CollectorError, MaintenanceSequencer, WorkerConfig};
use backup_worker::{OperationRequest, TagFilter};
use serial_test::serial;

/// Single annotated pod whose command prints a fixed dump.
struct StaticWorkloads {
    workloads: Vec<AnnotatedWorkload>,
}

#[async_trait]
impl WorkloadSource for StaticWorkloads {
    fn available(&self) -> bool {
        true
    }

    async fn list(&self) -> Result<Vec<AnnotatedWorkload>, CollectorError> {
        Ok(self.workloads.clone())
    }

    async fn exec(&self, _workload: &AnnotatedWorkload) -> Result<CommandOutput, CollectorError> {
        Ok(CommandOutput {
            stdout: Box::pin(std::io::Cursor::new(&b"CREATE TABLE accounts;"[..])),
            exit: Box::pin(async { Ok(()) }),
        })
    }
}

fn fake_restic(dir: &Path) -> String {
    let path = dir.join("restic");
    let script = format!(
        r#"#!/bin/sh
echo "$@" >> {log}
case "$1" in
  snapshots) echo '[]' ;;
  backup) [ "$2" = "--stdin" ] && cat > {dump} ;;
esac
exit 0
"#,
        log = dir.join("calls.log").display(),
        dump = dir.join("stdin.bin").display(),
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.display().to_string()
}

fn calls(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("calls.log"))
        .unwrap()
        .lines()
        .map(String::from)
        .collect()
}

fn config(dir: &Path) -> WorkerConfig {
    WorkerConfig {
        hostname: "web-1".to_string(),
        restic_binary: fake_restic(dir),
        ..WorkerConfig::default()
    }
}

#[tokio::test]
#[serial]
async fn default_run_stores_pod_dump_before_directory_backup() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let supervisor = CancellationSupervisor::new();
    let workloads = StaticWorkloads {
        workloads: vec![AnnotatedWorkload {
            namespace: "apps".to_string(),
            pod_name: "db-0".to_string(),
            container_name: "postgres".to_string(),
            file_extension: "sql".to_string(),
            command: "dump-db".to_string(),
        }],
    };
    let sequencer = MaintenanceSequencer::new(
        Arc::new(ResticCli::new(&config, supervisor.token())),
        Arc::new(workloads),
        config.backup_dir.clone(),
        config.hostname.clone(),
    );
    let request = OperationRequest {
        tags: ["weekly"].into_iter().collect::<TagFilter>(),
        ..OperationRequest::default()
    };

    sequencer.run(&request).await.unwrap();

    assert_eq!(
        calls(dir.path()),
        vec![
            "cat config",
            "unlock",
            "snapshots --json",
            "backup --stdin --stdin-filename /web-1-postgres.sql --host web-1 --tag weekly",
            "backup /data --host web-1 --tag weekly",
        ]
    );
    assert_eq!(
        std::fs::read(dir.path().join("stdin.bin")).unwrap(),
        b"CREATE TABLE accounts;"
    );
}

#[tokio::test]
#[serial]
async fn prune_run_waits_for_locks_and_skips_backup() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let supervisor = CancellationSupervisor::new();
    let sequencer = MaintenanceSequencer::new(
        Arc::new(ResticCli::new(&config, supervisor.token())),
        Arc::new(StaticWorkloads { workloads: Vec::new() }),
        config.backup_dir.clone(),
        config.hostname.clone(),
    );
    let request = OperationRequest {
        prune: true,
        ..OperationRequest::default()
    };

    sequencer.run(&request).await.unwrap();

    assert_eq!(
        calls(dir.path()),
        vec![
            "cat config",
            "unlock",
            "snapshots --json",
            "list locks --no-lock",
            "forget --prune",
        ]
    );
}
