// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Publishes the identity of the current database primary.

use std::process;
use std::time::Duration;

use anyhow::Context;
use pgha_backboard::{BackboardArgs, Client, Telemetry};
use pgha_leader_watcher::source::parse_endpoint;
use pgha_leader_watcher::{BackboardSink, HttpStatusSource, TrackerConfig, Watcher};
use pgha_ore::cli::{self, CliConfig};
use pgha_ore::error::ErrorExt;
use pgha_ore::signal;
use pgha_ore::tracing::TracingCliArgs;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, clap::Parser)]
#[clap(name = "leader-watcher", about = "Publishes the identity of the current database primary.")]
struct Args {
    /// Comma-separated base URLs of the orchestrators' REST APIs.
    #[clap(long, env = "WATCHER_STATUS_ENDPOINTS", value_name = "URLS")]
    status_endpoints: String,
    /// How often the cluster status is polled.
    #[clap(long, env = "WATCHER_POLL_INTERVAL", value_name = "DURATION", value_parser = humantime::parse_duration, default_value = "3s")]
    poll_interval: Duration,
    /// The timeout of each status request.
    #[clap(long, env = "WATCHER_REQUEST_TIMEOUT", value_name = "DURATION", value_parser = humantime::parse_duration, default_value = "2s")]
    request_timeout: Duration,
    /// Consecutive polls reaching no endpoint after which the cluster is
    /// reported down.
    #[clap(long, env = "WATCHER_DOWN_THRESHOLD", value_name = "N", default_value = "5")]
    down_threshold: u32,
    /// The longest delay between retries of a failed publication.
    #[clap(long, env = "WATCHER_PUBLISH_BACKOFF_MAX", value_name = "DURATION", value_parser = humantime::parse_duration, default_value = "5m")]
    publish_backoff_max: Duration,
    /// Re-publish an unchanged leader this often. Zero publishes changes
    /// only.
    #[clap(long, env = "WATCHER_RESYNC_INTERVAL", value_name = "DURATION", value_parser = humantime::parse_duration, default_value = "30s")]
    resync_interval: Duration,
    /// The variable that receives the leader's name.
    #[clap(long, env = "WATCHER_LEADER_NAME_VARIABLE", value_name = "NAME", default_value = "PRIMARY_NAME")]
    leader_name_variable: String,
    /// The variable that receives the leader's database address.
    #[clap(long, env = "WATCHER_LEADER_ADDRESS_VARIABLE", value_name = "NAME", default_value = "PRIMARY_ADDRESS")]
    leader_address_variable: String,
    /// The database port used in published addresses.
    #[clap(long, env = "WATCHER_DATABASE_PORT", value_name = "PORT", default_value = "5432")]
    database_port: u16,
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
        eprintln!("leader-watcher: fatal: {}", err.display_with_causes());
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    pgha_ore::tracing::configure(args.tracing.to_config()?)?;

    let endpoints = cli::split_list(&args.status_endpoints)
        .iter()
        .map(|e| parse_endpoint(e).with_context(|| format!("invalid status endpoint {e:?}")))
        .collect::<Result<Vec<Url>, _>>()?;
    anyhow::ensure!(!endpoints.is_empty(), "WATCHER_STATUS_ENDPOINTS must be set");
    anyhow::ensure!(!args.poll_interval.is_zero(), "WATCHER_POLL_INTERVAL must be greater than zero");

    let backboard = args
        .backboard
        .to_config()
        .context("RAILWAY_PROJECT_ID and RAILWAY_ENVIRONMENT_ID must be set")?;
    anyhow::ensure!(backboard.token.is_some(), "BACKBOARD_TOKEN must be set");
    let client = Client::new(backboard, args.request_timeout).context("building backboard client")?;

    let shutdown = CancellationToken::new();
    let _signals = signal::shutdown_on_signal(shutdown.clone())
        .context("installing signal handlers")?;

    let source = HttpStatusSource::new(endpoints, args.request_timeout)
        .context("building status client")?;
    let sink = BackboardSink::new(
        client.clone(),
        args.leader_name_variable,
        args.leader_address_variable,
    );
    let telemetry = Telemetry::new("leader-watcher", client);
    let config = TrackerConfig {
        poll_interval: args.poll_interval,
        backoff_max: args.publish_backoff_max.max(args.poll_interval),
        down_threshold: args.down_threshold.max(1),
        resync_interval: (!args.resync_interval.is_zero()).then_some(args.resync_interval),
    };

    let mut watcher = Watcher::new(source, sink, config, args.database_port, telemetry);
    watcher.run(shutdown).await;
    Ok(())
}
