// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Starts the registry process.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::info;

use crate::config::BootstrapConfig;
use crate::coordinator::BootstrapPlan;

/// Environment variables that configure this binary and must not leak into
/// the registry process, which would reject them as unknown flags.
pub const CONTROL_ENV_VARS: &[&str] = &[
    "ETCD_MAX_RETRIES",
    "ETCD_RETRY_DELAY",
    "ETCD_PEER_WAIT_TIMEOUT",
    "ETCD_PEER_CHECK_INTERVAL",
    "ETCD_HEALTH_POLL_INTERVAL",
    "ETCD_REQUEST_TIMEOUT",
    "ETCD_CLIENT_PORT",
    "ETCD_BINARY",
    "ETCD_TERMINATION_GRACE",
];

/// Starts registry processes.
pub trait RegistryLauncher: fmt::Debug + Send + Sync {
    /// Spawns a registry process for `plan`.
    fn launch(&self, config: &BootstrapConfig, plan: &BootstrapPlan) -> Result<Child, io::Error>;
}

/// Launches the `etcd` binary.
#[derive(Debug, Clone)]
pub struct EtcdLauncher {
    binary: PathBuf,
    extra_args: Vec<OsString>,
}

impl EtcdLauncher {
    /// Creates a launcher for `binary` that appends `extra_args` to the
    /// generated flags.
    pub fn new(binary: impl Into<PathBuf>, extra_args: Vec<OsString>) -> EtcdLauncher {
        EtcdLauncher {
            binary: binary.into(),
            extra_args,
        }
    }

    /// Builds the command without spawning it.
    pub fn command(&self, config: &BootstrapConfig, plan: &BootstrapPlan) -> Command {
        let max_learners = config.initial_cluster.len().saturating_sub(1).max(1);
        let mut cmd = Command::new(&self.binary);
        for var in CONTROL_ENV_VARS {
            cmd.env_remove(var);
        }
        cmd.env("ETCD_NAME", &config.name)
            .env("ETCD_DATA_DIR", &config.data_dir)
            .env("ETCD_INITIAL_CLUSTER", plan.initial_cluster.to_string())
            .env("ETCD_INITIAL_CLUSTER_STATE", plan.cluster_state.to_string())
            .env("ETCD_INITIAL_ADVERTISE_PEER_URLS", config.peer_url())
            .arg(format!("--max-learners={max_learners}"))
            .arg("--auto-compaction-retention=1")
            .args(&self.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

impl RegistryLauncher for EtcdLauncher {
    fn launch(&self, config: &BootstrapConfig, plan: &BootstrapPlan) -> Result<Child, io::Error> {
        info!(
            binary = %self.binary.display(),
            cluster = %plan.initial_cluster,
            state = %plan.cluster_state,
            "starting registry"
        );
        self.command(config, plan).spawn()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::ffi::OsStr;
    use std::time::Duration;

    use super::*;
    use crate::config::InitialCluster;
    use crate::coordinator::ClusterState;

    fn config() -> BootstrapConfig {
        BootstrapConfig {
            name: "etcd-2".into(),
            initial_cluster: "etcd-1=http://etcd-1:2380,etcd-2=http://etcd-2:2380,etcd-3=http://etcd-3:2380"
                .parse()
                .unwrap(),
            data_dir: "/var/lib/etcd".into(),
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            peer_wait_timeout: Duration::from_secs(10),
            peer_check_interval: Duration::from_secs(1),
            health_poll_interval: Duration::from_secs(1),
            client_port: 2379,
        }
    }

    #[test]
    fn command_sets_registry_environment() {
        let config = config();
        let plan = BootstrapPlan {
            initial_cluster: InitialCluster::single("etcd-1", "http://etcd-1:2380"),
            cluster_state: ClusterState::Existing,
            joined_as_learner: true,
        };
        let launcher = EtcdLauncher::new("/usr/local/bin/etcd", vec!["--log-level=warn".into()]);
        let cmd = launcher.command(&config, &plan);
        let cmd = cmd.as_std();

        let envs: BTreeMap<&OsStr, Option<&OsStr>> = cmd.get_envs().collect();
        let get = |k: &str| envs.get(OsStr::new(k)).copied().flatten();
        assert_eq!(get("ETCD_NAME"), Some(OsStr::new("etcd-2")));
        assert_eq!(get("ETCD_DATA_DIR"), Some(OsStr::new("/var/lib/etcd")));
        assert_eq!(
            get("ETCD_INITIAL_CLUSTER"),
            Some(OsStr::new("etcd-1=http://etcd-1:2380"))
        );
        assert_eq!(get("ETCD_INITIAL_CLUSTER_STATE"), Some(OsStr::new("existing")));
        assert_eq!(
            get("ETCD_INITIAL_ADVERTISE_PEER_URLS"),
            Some(OsStr::new("http://etcd-2:2380"))
        );
        for var in CONTROL_ENV_VARS {
            assert_eq!(envs.get(OsStr::new(var)), Some(&None), "{var} not removed");
        }

        let args: Vec<_> = cmd.get_args().collect();
        assert_eq!(
            args,
            ["--max-learners=2", "--auto-compaction-retention=1", "--log-level=warn"]
        );
    }
}
