/*
 * 5D Labs Backup Platform - Maintenance Worker
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Maintenance worker entry point
//!
//! Started by the backup operator inside a Kubernetes Job. Exit codes:
//! - 0: the run succeeded
//! - 1: a step failed and the run was aborted
//! - 2: the repository could not be listed

use std::sync::Arc;

use backup_worker::cli::WorkerArgs;
use backup_worker::collector::KubeWorkloadSource;
use backup_worker::repository::ResticCli;
use backup_worker::stats::StatsReporter;
use backup_worker::{CancellationSupervisor, MaintenanceSequencer, WorkerConfig};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const FATAL_EXIT_CODE: i32 = 2;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = WorkerArgs::parse();
    let config = WorkerConfig::from_env();
    let request = args.into_request(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        hostname = %config.hostname,
        "starting backup worker"
    );

    let supervisor = CancellationSupervisor::new();
    let listener = supervisor.listen();

    let mut restic = ResticCli::new(&config, supervisor.token());
    if let Some(stats) =
        StatsReporter::new(config.prom_url.clone(), config.stats_url.clone(), &config.hostname)
    {
        restic = restic.with_stats(stats);
    }
    let workloads = KubeWorkloadSource::new(&config, supervisor.token());

    let sequencer = MaintenanceSequencer::new(
        Arc::new(restic),
        Arc::new(workloads),
        config.backup_dir.clone(),
        config.hostname.clone(),
    );

    let result = sequencer.run(&request).await;
    listener.abort();

    match result {
        Ok(()) => {
            info!("backup worker finished");
            Ok(())
        }
        Err(e) if e.is_fatal() => {
            error!(error = %e, "terminating worker");
            std::process::exit(FATAL_EXIT_CODE);
        }
        Err(e) => Err(e.into()),
    }
}
