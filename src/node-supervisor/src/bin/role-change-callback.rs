// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Reports role changes of the local database node.
//!
//! Invoked by the orchestrator as `role-change-callback <action> <role>
//! <scope>`. Always exits successfully, so it can never hold up a failover.

use std::time::Duration;

use pgha_backboard::{BackboardArgs, Client};
use pgha_node_supervisor::callback::RoleChange;
use pgha_ore::cli::{CliConfig, try_parse_args_from};
use pgha_ore::tracing::TracingCliArgs;
use tracing::{info, warn};

/// How long delivery of the event may take.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, clap::Parser)]
#[clap(name = "role-change-callback", about = "Reports role changes of the local database node.")]
struct Args {
    /// The callback action.
    action: Option<String>,
    /// The node's new role.
    role: Option<String>,
    /// The cluster name.
    scope: Option<String>,
    /// The name of the local node.
    #[clap(long, env = "PATRONI_NAME", value_name = "NAME", default_value = "unknown")]
    node: String,
    #[clap(flatten)]
    tracing: TracingCliArgs,
    #[clap(flatten)]
    backboard: BackboardArgs,
}

#[tokio::main]
async fn main() {
    let args: Args = match try_parse_args_from(CliConfig::default(), std::env::args_os()) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("role-change-callback: ignoring invalid arguments: {e}");
            return;
        }
    };
    if let Ok(config) = args.tracing.to_config() {
        let _ = pgha_ore::tracing::configure(config);
    }
    run(args).await;
}

async fn run(args: Args) {
    let change = RoleChange::from_args(
        [args.action, args.role, args.scope]
            .into_iter()
            .map(Option::unwrap_or_default),
    );
    let Some(change) = change else {
        return;
    };
    let event = change.to_event(&args.node);
    info!(
        node = %args.node,
        role = %change.role,
        scope = %change.scope,
        "{}",
        event.message()
    );

    let Some(config) = args.backboard.to_config() else {
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
        Ok(Err(e)) => warn!("failed to deliver role change event: {e}"),
        Err(_) => warn!("timed out delivering role change event"),
    }
}
