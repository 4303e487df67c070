// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Finishes the bootstrap of a new database cluster.
//!
//! Invoked once by the orchestrator, on the node that ran `initdb`, as
//! `post-bootstrap --config <path> --marker <path> <connection string>`. A
//! nonzero exit makes the orchestrator abandon the bootstrap.

use std::path::PathBuf;
use std::process;
use std::time::{Duration, Instant};

use anyhow::Context;
use pgha_backboard::{BackboardArgs, Client, TelemetryEvent};
use pgha_node_supervisor::bootstrap::{self, PostBootstrap};
use pgha_ore::cli::{self, CliConfig};
use pgha_ore::error::ErrorExt;
use pgha_ore::marker::DurableMarker;
use pgha_ore::tracing::TracingCliArgs;
use tracing::{info, warn};

/// How long delivery of the completion event may take.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, clap::Parser)]
#[clap(name = "post-bootstrap", about = "Finishes the bootstrap of a new database cluster.")]
struct Args {
    /// The orchestrator configuration file.
    #[clap(long, env = "PATRONI_CONFIG_PATH", value_name = "PATH", default_value = "/etc/patroni/patroni.yml")]
    config: PathBuf,
    /// The coordination marker to write once the cluster is ready.
    #[clap(long, value_name = "PATH")]
    marker: PathBuf,
    /// The connection string appended by the orchestrator. Connections go
    /// through the socket named in the configuration file instead.
    connection: Option<String>,
    #[clap(flatten)]
    tracing: TracingCliArgs,
    #[clap(flatten)]
    backboard: BackboardArgs,
}

#[tokio::main]
async fn main() {
    let args: Args = cli::parse_args(CliConfig {
        env_prefix: None,
        enable_version_flag: true,
    });
    if let Err(err) = run(args).await {
        eprintln!("post-bootstrap: fatal: {}", err.display_with_causes());
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    pgha_ore::tracing::configure(args.tracing.to_config()?)?;
    let start = Instant::now();

    let hook = PostBootstrap::from_patroni_config(&args.config)
        .context("reading orchestrator configuration")?;
    info!(node = %hook.node, "finishing cluster bootstrap");
    let marker = DurableMarker::new(args.marker);
    bootstrap::complete(&hook.database, &hook.replication, &marker).await?;

    let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    info!(node = %hook.node, duration_ms, "cluster bootstrap complete");
    report(&args.backboard, TelemetryEvent::BootstrapCompleted {
        node: hook.node,
        duration_ms,
    })
    .await;
    Ok(())
}

async fn report(args: &BackboardArgs, event: TelemetryEvent) {
    let Some(config) = args.to_config() else {
        return;
    };
    let client = match Client::new(config, SEND_TIMEOUT) {
        Ok(client) => client,
        Err(e) => {
            warn!("building telemetry client failed: {e}");
            return;
        }
    };
    match tokio::time::timeout(SEND_TIMEOUT, client.send_telemetry("postgres-ha", &event)).await {
        Ok(Ok(())) => (),
        Ok(Err(e)) => warn!("failed to deliver bootstrap event: {e}"),
        Err(_) => warn!("timed out delivering bootstrap event"),
    }
}
