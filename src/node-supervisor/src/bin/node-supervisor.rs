// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Prepares a database node and supervises its HA orchestrator.

use std::process;

use anyhow::Context;
use pgha_backboard::{BackboardArgs, Telemetry};
use pgha_node_supervisor::adoption::AdoptionController;
use pgha_node_supervisor::child;
use pgha_node_supervisor::config::SupervisorArgs;
use pgha_node_supervisor::patroni::PatroniConfig;
use pgha_node_supervisor::probe::HttpProbe;
use pgha_node_supervisor::replication::{self, LocalDatabase};
use pgha_node_supervisor::supervisor::{Exit, Supervisor};
use pgha_ore::cli::{self, CliConfig};
use pgha_ore::error::ErrorExt;
use pgha_ore::signal;
use pgha_ore::tracing::TracingCliArgs;
use pgha_registry_client::ClientConfig;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, clap::Parser)]
#[clap(
    name = "node-supervisor",
    about = "Prepares a database node and supervises its HA orchestrator."
)]
struct Args {
    #[clap(flatten)]
    supervisor: SupervisorArgs,
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
        eprintln!("node-supervisor: fatal: {}", err.display_with_causes());
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    pgha_ore::tracing::configure(args.tracing.to_config()?)?;

    let config = args
        .supervisor
        .to_config()
        .context("invalid node configuration")?;
    info!(
        node = %config.name,
        address = %config.connect_address,
        designated_primary = %config.designated_primary,
        scope = %config.scope,
        "starting node supervisor"
    );

    let shutdown = CancellationToken::new();
    let _signals = signal::shutdown_on_signal(shutdown.clone())
        .context("installing signal handlers")?;

    let telemetry = Telemetry::from_args("postgres-ha", &args.backboard, config.registry_timeout);
    let registry = ClientConfig::new(config.registry_endpoints.clone())
        .timeout(config.registry_timeout)
        .build()
        .context("building registry client")?;

    let preparation = AdoptionController::new(&config, &registry, &telemetry)
        .prepare()
        .await
        .context("preparing data directory")?;

    PatroniConfig::new(&config)
        .write(&config.config_path)
        .context("writing orchestrator configuration")?;
    child::prepare_data_dir(&config.data_dir)
        .with_context(|| format!("preparing {}", config.data_dir.display()))?;

    let env = child::environment(&config);
    let orchestrator = child::launch(&config, &env).context("starting orchestrator")?;

    let _role_task = preparation.ensure_replication_role.then(|| {
        replication::spawn_ensure_role(LocalDatabase::new(&config), config.replication.clone())
    });

    let health_url = config.health_url().context("building health URL")?;
    let probe = HttpProbe::new(health_url, config.health.timeout)
        .context("building health probe")?;
    let supervisor = Supervisor::new(config.name.clone(), probe, config.health, telemetry);
    match supervisor.supervise(orchestrator, shutdown).await? {
        Exit::Shutdown => {
            info!("node supervisor stopped");
            Ok(())
        }
        exit => Err(anyhow::anyhow!("{exit}")),
    }
}
