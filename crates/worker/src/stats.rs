//! Best-effort delivery of per-operation statistics.
//!
//! Two optional sinks are supported: a Prometheus push gateway (`PROM_URL`)
//! and a JSON webhook (`STATS_URL`). Delivery failures are logged and never
//! affect the outcome of the operation being reported.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

const PUSH_JOB: &str = "backup-worker";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of a single repository operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationStats {
    pub operation: String,
    pub hostname: String,
    pub succeeded: bool,
    pub duration_seconds: f64,
    pub finished_at: DateTime<Utc>,
}

impl OperationStats {
    #[must_use]
    pub fn new(operation: &str, hostname: &str, succeeded: bool, duration: Duration) -> Self {
        Self {
            operation: operation.to_string(),
            hostname: hostname.to_string(),
            succeeded,
            duration_seconds: duration.as_secs_f64(),
            finished_at: Utc::now(),
        }
    }

    /// Prometheus text exposition of this event
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let operation = self.operation.replace(' ', "_");
        let labels = format!("operation=\"{operation}\"");
        format!(
            "# TYPE backup_worker_operation_success gauge\n\
             backup_worker_operation_success{{{labels}}} {}\n\
             # TYPE backup_worker_operation_duration_seconds gauge\n\
             backup_worker_operation_duration_seconds{{{labels}}} {}\n\
             # TYPE backup_worker_operation_finished_timestamp gauge\n\
             backup_worker_operation_finished_timestamp{{{labels}}} {}\n",
            u8::from(self.succeeded),
            self.duration_seconds,
            self.finished_at.timestamp(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct StatsReporter {
    client: reqwest::Client,
    prom_url: Option<String>,
    webhook_url: Option<String>,
    hostname: String,
}

impl StatsReporter {
    /// Build a reporter; returns `None` when neither sink is configured
    #[must_use]
    pub fn new(prom_url: Option<String>, webhook_url: Option<String>, hostname: &str) -> Option<Self> {
        if prom_url.is_none() && webhook_url.is_none() {
            return None;
        }
        let client = build_client(reqwest::Client::builder().timeout(REQUEST_TIMEOUT))?;
        Some(Self {
            client,
            prom_url,
            webhook_url,
            hostname: hostname.to_string(),
        })
    }

    fn push_url(&self, base: &str) -> String {
        format!(
            "{}/metrics/job/{PUSH_JOB}/instance/{}",
            base.trim_end_matches('/'),
            self.hostname
        )
    }

    pub async fn report(&self, stats: &OperationStats) {
        if let Some(base) = &self.prom_url {
            let url = self.push_url(base);
            match self
                .client
                .post(&url)
                .header("Content-Type", "text/plain; version=0.0.4")
                .body(stats.to_prometheus())
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
            {
                Ok(_) => debug!(operation = %stats.operation, "pushed metrics"),
                Err(e) => warn!(operation = %stats.operation, error = %e, "failed to push metrics"),
            }
        }

        if let Some(url) = &self.webhook_url {
            match self
                .client
                .post(url)
                .json(stats)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
            {
                Ok(_) => debug!(operation = %stats.operation, "sent stats webhook"),
                Err(e) => warn!(operation = %stats.operation, error = %e, "failed to send stats webhook"),
            }
        }
    }
}

/// Stats are best effort; a client that cannot be built disables reporting
fn build_client(builder: reqwest::ClientBuilder) -> Option<reqwest::Client> {
    match builder.build() {
        Ok(client) => Some(client),
        Err(e) => {
            warn!(error = %e, "failed to build stats HTTP client, reporting disabled");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn reporter_is_disabled_without_sinks() {
        assert!(StatsReporter::new(None, None, "web-1").is_none());
    }

    #[test]
    fn unbuildable_client_disables_reporting() {
        let broken = reqwest::Client::builder().user_agent("bad\nagent");
        assert!(build_client(broken).is_none());
        assert!(build_client(reqwest::Client::builder()).is_some());
    }

    #[test]
    fn prometheus_payload_labels_operation() {
        let stats = OperationStats::new("stdin backup", "web-1", true, Duration::from_millis(1500));
        let text = stats.to_prometheus();
        assert!(text.contains("backup_worker_operation_success{operation=\"stdin_backup\"} 1"));
        assert!(text.contains("backup_worker_operation_duration_seconds{operation=\"stdin_backup\"} 1.5"));
    }

    #[tokio::test]
    async fn webhook_receives_json_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/stats"))
            .and(body_partial_json(serde_json::json!({
                "operation": "prune",
                "hostname": "web-1",
                "succeeded": false
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let reporter = StatsReporter::new(None, Some(format!("{}/stats", server.uri())), "web-1").unwrap();
        reporter
            .report(&OperationStats::new("prune", "web-1", false, Duration::from_secs(2)))
            .await;
    }

    #[tokio::test]
    async fn push_gateway_receives_metrics_for_instance() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/metrics/job/backup-worker/instance/web-1"))
            .and(body_string_contains("backup_worker_operation_success{operation=\"check\"} 1"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let reporter = StatsReporter::new(Some(format!("{}/", server.uri())), None, "web-1").unwrap();
        reporter
            .report(&OperationStats::new("check", "web-1", true, Duration::from_secs(1)))
            .await;
    }

    #[tokio::test]
    async fn delivery_failure_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let reporter = StatsReporter::new(None, Some(server.uri()), "web-1").unwrap();
        reporter
            .report(&OperationStats::new("backup", "web-1", true, Duration::from_secs(1)))
            .await;
    }
}
