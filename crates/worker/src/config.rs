//! Worker configuration sourced from the process environment.
//!
//! The operator sets these variables on the worker Job. Everything has a
//! default so that a bare `backup-worker` run performs a `/data` backup.

use std::path::PathBuf;
use std::time::Duration;

use crate::request::S3Destination;

pub const ENV_COMMAND_ANNOTATION: &str = "BACKUPCOMMAND_ANNOTATION";
pub const ENV_FILE_EXTENSION_ANNOTATION: &str = "FILEEXTENSION_ANNOTATION";
pub const ENV_CONTAINER_ANNOTATION: &str = "BACKUPCONTAINER_ANNOTATION";
pub const ENV_PROM_URL: &str = "PROM_URL";
pub const ENV_STATS_URL: &str = "STATS_URL";
pub const ENV_HOSTNAME: &str = "HOSTNAME";
pub const ENV_POD_NAMESPACE: &str = "POD_NAMESPACE";
pub const ENV_RESTORE_DIR: &str = "RESTORE_DIR";
pub const ENV_RESTORE_S3_ENDPOINT: &str = "RESTORE_S3ENDPOINT";
pub const ENV_RESTORE_S3_ACCESS_KEY_ID: &str = "RESTORE_ACCESSKEYID";
pub const ENV_RESTORE_S3_SECRET_ACCESS_KEY: &str = "RESTORE_SECRETACCESSKEY";
pub const ENV_BACKUP_DIR: &str = "BACKUP_DIR";
pub const ENV_KUBECONFIG: &str = "KUBECONFIG";
pub const ENV_RESTIC_BINARY: &str = "RESTIC_BINARY";
pub const ENV_LOCK_WAIT_INTERVAL: &str = "LOCK_WAIT_INTERVAL";

pub const DEFAULT_COMMAND_ANNOTATION: &str = "backup.platform/backupcommand";
pub const DEFAULT_FILE_EXTENSION_ANNOTATION: &str = "backup.platform/file-extension";
pub const DEFAULT_CONTAINER_ANNOTATION: &str = "backup.platform/backupcommand-container";
pub const DEFAULT_BACKUP_DIR: &str = "/data";
pub const DEFAULT_RESTORE_DIR: &str = "/restore";
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io";

const DEFAULT_LOCK_WAIT_SECS: u64 = 10;

/// Annotation keys used to discover pods with a backup command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationKeys {
    pub command: String,
    pub file_extension: String,
    pub container: String,
}

impl Default for AnnotationKeys {
    fn default() -> Self {
        Self {
            command: DEFAULT_COMMAND_ANNOTATION.to_string(),
            file_extension: DEFAULT_FILE_EXTENSION_ANNOTATION.to_string(),
            container: DEFAULT_CONTAINER_ANNOTATION.to_string(),
        }
    }
}

/// `restic forget` retention flags applied by prune.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep_last: Option<u32>,
    pub keep_hourly: Option<u32>,
    pub keep_daily: Option<u32>,
    pub keep_weekly: Option<u32>,
    pub keep_monthly: Option<u32>,
    pub keep_yearly: Option<u32>,
    pub keep_tags: Vec<String>,
}

impl RetentionPolicy {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_args().is_empty()
    }

    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let counts = [
            ("--keep-last", self.keep_last),
            ("--keep-hourly", self.keep_hourly),
            ("--keep-daily", self.keep_daily),
            ("--keep-weekly", self.keep_weekly),
            ("--keep-monthly", self.keep_monthly),
            ("--keep-yearly", self.keep_yearly),
        ];
        for (flag, value) in counts {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(value.to_string());
            }
        }
        for tag in &self.keep_tags {
            args.push("--keep-tag".to_string());
            args.push(tag.clone());
        }
        args
    }
}

/// Runtime configuration of one worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub annotations: AnnotationKeys,
    pub prom_url: Option<String>,
    pub stats_url: Option<String>,
    /// Host identifier used for snapshot hostnames and stdin object names
    pub hostname: String,
    pub namespace: Option<String>,
    pub restore_dir: String,
    pub restore_s3: S3Destination,
    pub backup_dir: PathBuf,
    pub kubeconfig: PathBuf,
    pub restic_binary: String,
    pub retention: RetentionPolicy,
    pub lock_wait_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl WorkerConfig {
    /// Load configuration from the process environment
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let count = |key: &str| get(key).and_then(|v| v.trim().parse::<u32>().ok());

        let annotations = AnnotationKeys {
            command: get(ENV_COMMAND_ANNOTATION)
                .unwrap_or_else(|| DEFAULT_COMMAND_ANNOTATION.to_string()),
            file_extension: get(ENV_FILE_EXTENSION_ANNOTATION)
                .unwrap_or_else(|| DEFAULT_FILE_EXTENSION_ANNOTATION.to_string()),
            container: get(ENV_CONTAINER_ANNOTATION)
                .unwrap_or_else(|| DEFAULT_CONTAINER_ANNOTATION.to_string()),
        };

        let retention = RetentionPolicy {
            keep_last: count("KEEP_LAST"),
            keep_hourly: count("KEEP_HOURLY"),
            keep_daily: count("KEEP_DAILY"),
            keep_weekly: count("KEEP_WEEKLY"),
            keep_monthly: count("KEEP_MONTHLY"),
            keep_yearly: count("KEEP_YEARLY"),
            keep_tags: get("KEEP_TAGS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
        };

        let kubeconfig = get(ENV_KUBECONFIG).map_or_else(
            || {
                let home = get("HOME").unwrap_or_else(|| "/root".to_string());
                PathBuf::from(home).join(".kube").join("config")
            },
            PathBuf::from,
        );

        let lock_wait_secs = get(ENV_LOCK_WAIT_INTERVAL)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_LOCK_WAIT_SECS);

        Self {
            annotations,
            prom_url: get(ENV_PROM_URL),
            stats_url: get(ENV_STATS_URL),
            hostname: get(ENV_HOSTNAME).unwrap_or_else(|| "localhost".to_string()),
            namespace: get(ENV_POD_NAMESPACE),
            restore_dir: get(ENV_RESTORE_DIR).unwrap_or_else(|| DEFAULT_RESTORE_DIR.to_string()),
            restore_s3: S3Destination {
                endpoint: get(ENV_RESTORE_S3_ENDPOINT).unwrap_or_default(),
                access_key_id: get(ENV_RESTORE_S3_ACCESS_KEY_ID).unwrap_or_default(),
                secret_access_key: get(ENV_RESTORE_S3_SECRET_ACCESS_KEY).unwrap_or_default(),
            },
            backup_dir: get(ENV_BACKUP_DIR)
                .map_or_else(|| PathBuf::from(DEFAULT_BACKUP_DIR), PathBuf::from),
            kubeconfig,
            restic_binary: get(ENV_RESTIC_BINARY).unwrap_or_else(|| "restic".to_string()),
            retention,
            lock_wait_interval: Duration::from_secs(lock_wait_secs),
        }
    }

    /// True when either in-cluster service account credentials or a
    /// kubeconfig file are present
    #[must_use]
    pub fn has_cluster_credentials(&self) -> bool {
        std::path::Path::new(SERVICE_ACCOUNT_DIR).exists() || self.kubeconfig.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = WorkerConfig::from_lookup(lookup(&[("HOME", "/home/worker")]));
        assert_eq!(config.annotations, AnnotationKeys::default());
        assert_eq!(config.backup_dir, PathBuf::from("/data"));
        assert_eq!(config.restore_dir, "/restore");
        assert_eq!(config.kubeconfig, PathBuf::from("/home/worker/.kube/config"));
        assert_eq!(config.restic_binary, "restic");
        assert_eq!(config.lock_wait_interval, Duration::from_secs(10));
        assert!(config.prom_url.is_none());
        assert!(config.stats_url.is_none());
        assert!(config.retention.is_empty());
    }

    #[test]
    fn empty_backup_dir_falls_back_to_data() {
        let config = WorkerConfig::from_lookup(lookup(&[(ENV_BACKUP_DIR, "  ")]));
        assert_eq!(config.backup_dir, PathBuf::from("/data"));
    }

    #[test]
    fn annotation_overrides_are_honoured() {
        let config = WorkerConfig::from_lookup(lookup(&[
            (ENV_COMMAND_ANNOTATION, "example.com/cmd"),
            (ENV_FILE_EXTENSION_ANNOTATION, "example.com/ext"),
        ]));
        assert_eq!(config.annotations.command, "example.com/cmd");
        assert_eq!(config.annotations.file_extension, "example.com/ext");
        assert_eq!(config.annotations.container, DEFAULT_CONTAINER_ANNOTATION);
    }

    #[test]
    fn s3_secret_reads_its_own_variable() {
        let config = WorkerConfig::from_lookup(lookup(&[
            (ENV_RESTORE_S3_ENDPOINT, "https://minio:9000/restore"),
            (ENV_RESTORE_S3_ACCESS_KEY_ID, "access"),
            (ENV_RESTORE_S3_SECRET_ACCESS_KEY, "secret"),
        ]));
        assert_eq!(config.restore_s3.endpoint, "https://minio:9000/restore");
        assert_eq!(config.restore_s3.access_key_id, "access");
        assert_eq!(config.restore_s3.secret_access_key, "secret");
    }

    #[test]
    fn retention_policy_builds_forget_flags() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("KEEP_LAST", "5"),
            ("KEEP_DAILY", "14"),
            ("KEEP_WEEKLY", "not-a-number"),
            ("KEEP_TAGS", "important, pinned,"),
        ]));
        assert_eq!(
            config.retention.to_args(),
            vec![
                "--keep-last",
                "5",
                "--keep-daily",
                "14",
                "--keep-tag",
                "important",
                "--keep-tag",
                "pinned"
            ]
        );
    }

    #[test]
    fn zero_lock_wait_interval_uses_default() {
        let config = WorkerConfig::from_lookup(lookup(&[(ENV_LOCK_WAIT_INTERVAL, "0")]));
        assert_eq!(config.lock_wait_interval, Duration::from_secs(10));
    }

    #[test]
    #[serial]
    fn from_env_reads_process_environment() {
        std::env::set_var(ENV_BACKUP_DIR, "/srv/backup");
        std::env::set_var(ENV_HOSTNAME, "web-1");
        let config = WorkerConfig::from_env();
        std::env::remove_var(ENV_BACKUP_DIR);
        std::env::remove_var(ENV_HOSTNAME);
        assert_eq!(config.backup_dir, PathBuf::from("/srv/backup"));
        assert_eq!(config.hostname, "web-1");
    }

    #[test]
    fn kubeconfig_presence_counts_as_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "apiVersion: v1\n").unwrap();
        let config = WorkerConfig::from_lookup(lookup(&[(ENV_KUBECONFIG, path.to_str().unwrap())]));
        assert!(config.has_cluster_credentials());
    }
}
