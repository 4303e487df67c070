// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Bootstraps and supervises one etcd registry member.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Context;
use pgha_backboard::{BackboardArgs, Telemetry};
use pgha_ore::cli::{self, CliConfig};
use pgha_ore::error::ErrorExt;
use pgha_ore::signal;
use pgha_ore::tracing::TracingCliArgs;
use pgha_registry_bootstrap::{
    BootstrapConfig, Coordinator, EtcdLauncher, HttpRegistry, InitialCluster, Outcome, Runner,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Exit code when every bootstrap attempt failed.
const EXIT_RETRIES_EXHAUSTED: i32 = 2;

#[derive(Debug, clap::Parser)]
#[clap(name = "registry-bootstrap", about = "Bootstraps and supervises one etcd registry member.")]
struct Args {
    /// The name of the local node.
    #[clap(long, env = "ETCD_NAME", value_name = "NAME")]
    name: String,
    /// Every node of the cluster, as `name=peer-url,...`.
    #[clap(long, env = "ETCD_INITIAL_CLUSTER", value_name = "CLUSTER")]
    initial_cluster: InitialCluster,
    /// The registry's data directory.
    #[clap(long, env = "ETCD_DATA_DIR", value_name = "PATH", default_value = "/var/lib/etcd")]
    data_dir: PathBuf,
    /// How many bootstrap attempts to make before giving up.
    #[clap(long, env = "ETCD_MAX_RETRIES", value_name = "N", default_value = "60")]
    max_retries: usize,
    /// The pause between bootstrap attempts.
    #[clap(long, env = "ETCD_RETRY_DELAY", value_name = "DURATION", value_parser = humantime::parse_duration, default_value = "5s")]
    retry_delay: Duration,
    /// How long a follower waits for a healthy peer within one attempt.
    #[clap(long, env = "ETCD_PEER_WAIT_TIMEOUT", value_name = "DURATION", value_parser = humantime::parse_duration, default_value = "300s")]
    peer_wait_timeout: Duration,
    /// How often a waiting follower probes its peers.
    #[clap(long, env = "ETCD_PEER_CHECK_INTERVAL", value_name = "DURATION", value_parser = humantime::parse_duration, default_value = "5s")]
    peer_check_interval: Duration,
    /// How often the local registry's health is polled after it starts.
    #[clap(long, env = "ETCD_HEALTH_POLL_INTERVAL", value_name = "DURATION", value_parser = humantime::parse_duration, default_value = "5s")]
    health_poll_interval: Duration,
    /// The timeout of each registry request.
    #[clap(long, env = "ETCD_REQUEST_TIMEOUT", value_name = "DURATION", value_parser = humantime::parse_duration, default_value = "5s")]
    request_timeout: Duration,
    /// The registry client port, shared by every node.
    #[clap(long, env = "ETCD_CLIENT_PORT", value_name = "PORT", default_value = "2379")]
    client_port: u16,
    /// The registry binary.
    #[clap(long, env = "ETCD_BINARY", value_name = "PATH", default_value = "/usr/local/bin/etcd")]
    etcd_binary: PathBuf,
    /// How long the registry may take to exit after `SIGTERM` before it is
    /// killed.
    #[clap(long, env = "ETCD_TERMINATION_GRACE", value_name = "DURATION", value_parser = humantime::parse_duration, default_value = "10s")]
    termination_grace: Duration,
    #[clap(flatten)]
    tracing: TracingCliArgs,
    #[clap(flatten)]
    backboard: BackboardArgs,
    /// Additional arguments for the registry binary.
    #[clap(last = true, value_name = "ETCD_ARGS")]
    etcd_args: Vec<OsString>,
}

#[tokio::main]
async fn main() {
    let args: Args = cli::parse_args(CliConfig {
        env_prefix: None,
        enable_version_flag: true,
    });
    match run(args).await {
        Ok(Outcome::Exited | Outcome::Shutdown) => {}
        Ok(Outcome::RetriesExhausted { attempts }) => {
            error!(attempts, "failed to start registry");
            eprintln!("registry-bootstrap: fatal: registry failed to start after {attempts} attempts");
            process::exit(EXIT_RETRIES_EXHAUSTED);
        }
        Err(err) => {
            eprintln!("registry-bootstrap: fatal: {}", err.display_with_causes());
            process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<Outcome, anyhow::Error> {
    pgha_ore::tracing::configure(args.tracing.to_config()?)?;

    let config = BootstrapConfig {
        name: args.name,
        initial_cluster: args.initial_cluster,
        data_dir: args.data_dir,
        max_attempts: args.max_retries,
        retry_delay: args.retry_delay,
        peer_wait_timeout: args.peer_wait_timeout,
        peer_check_interval: args.peer_check_interval,
        health_poll_interval: args.health_poll_interval,
        client_port: args.client_port,
    }
    .validate()
    .context("invalid registry configuration")?;

    let shutdown = CancellationToken::new();
    let _signals = signal::shutdown_on_signal(shutdown.clone())
        .context("installing signal handlers")?;

    let telemetry = Telemetry::from_args("etcd", &args.backboard, args.request_timeout);
    let coordinator = Coordinator::new(config, HttpRegistry::new(args.request_timeout), telemetry);
    let launcher = EtcdLauncher::new(args.etcd_binary, args.etcd_args);
    let runner = Runner::new(coordinator, launcher, args.termination_grace);

    let outcome = runner.run(shutdown).await?;
    info!(?outcome, "registry bootstrap finished");
    Ok(outcome)
}
