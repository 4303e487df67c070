// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Runtime identity of a database node.
//!
//! Everything the supervisor needs to know before it touches the disk or the
//! network is resolved here, from configuration alone. A missing or
//! malformed value is a [`ConfigError`].

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use pgha_ore::cli;
use pgha_ore::marker::DurableMarker;
use url::Url;

/// The name of the coordination marker in the volume root.
pub const COORDINATION_MARKER: &str = ".patroni_bootstrap_complete";

/// The registry port assumed for hosts given without one.
pub const DEFAULT_REGISTRY_PORT: u16 = 2379;

/// The default volume mount path.
pub const DEFAULT_VOLUME_ROOT: &str = "/var/lib/postgresql/data";

/// A missing or malformed configuration value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A required value is unset or empty.
    #[error("{0} must be set")]
    Missing(&'static str),
    /// A registry host could not be parsed.
    #[error("invalid registry host {0:?}")]
    InvalidRegistryHost(String),
    /// The node is not one of the configured cluster members.
    #[error("node {name} is not one of the cluster members {members:?}")]
    UnknownNode {
        /// The node name.
        name: String,
        /// The configured members.
        members: Vec<String>,
    },
    /// The registry session timings cannot keep a leader lease alive.
    #[error(
        "loop wait ({loop_wait}s) plus twice the retry timeout ({retry_timeout}s) exceeds the ttl ({ttl}s)"
    )]
    DcsTimings {
        /// The leader key time-to-live.
        ttl: u32,
        /// The orchestrator loop interval.
        loop_wait: u32,
        /// The registry operation retry timeout.
        retry_timeout: u32,
    },
    /// A value that must be positive is zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Command-line arguments of the node supervisor, for flattening into a
/// binary's own arguments.
#[derive(Debug, Clone, clap::Args)]
pub struct SupervisorArgs {
    /// The name of this node.
    #[clap(long, env = "PATRONI_NAME", value_name = "NAME")]
    pub name: Option<String>,
    /// The address other nodes use to reach this node.
    #[clap(long, env = "RAILWAY_PRIVATE_DOMAIN", value_name = "HOST")]
    pub connect_address: Option<String>,
    /// Comma-separated registry hosts, as `host:port` or URLs.
    #[clap(long, env = "PATRONI_ETCD3_HOSTS", value_name = "HOSTS")]
    pub etcd_hosts: Option<String>,
    /// Comma-separated, ordered names of every database node.
    #[clap(long, env = "PATRONI_CLUSTER_MEMBERS", value_name = "NAMES")]
    pub cluster_members: Option<String>,
    /// The node that owns the initial data. Defaults to the first cluster
    /// member.
    #[clap(long, env = "PATRONI_DESIGNATED_PRIMARY", value_name = "NAME")]
    pub designated_primary: Option<String>,
    /// The cluster name.
    #[clap(long, env = "PATRONI_SCOPE", value_name = "SCOPE", default_value = "pg-ha")]
    pub scope: String,
    /// The registry key namespace.
    #[clap(long, env = "PATRONI_NAMESPACE", value_name = "PATH", default_value = "/service")]
    pub namespace: String,
    /// The database superuser.
    #[clap(long, env = "PATRONI_SUPERUSER_USERNAME", value_name = "USER", default_value = "postgres")]
    pub superuser_username: String,
    /// The database superuser's password.
    #[clap(long, env = "PATRONI_SUPERUSER_PASSWORD", value_name = "PASSWORD", hide_env_values = true)]
    pub superuser_password: Option<String>,
    /// The replication user.
    #[clap(long, env = "PATRONI_REPLICATION_USERNAME", value_name = "USER", default_value = "replicator")]
    pub replication_username: String,
    /// The replication user's password.
    #[clap(long, env = "PATRONI_REPLICATION_PASSWORD", value_name = "PASSWORD", hide_env_values = true)]
    pub replication_password: Option<String>,
    /// The volume mount path.
    #[clap(long, env = "RAILWAY_VOLUME_MOUNT_PATH", value_name = "PATH", default_value = DEFAULT_VOLUME_ROOT)]
    pub volume_root: PathBuf,
    /// The database data directory. Defaults to `pgdata` in the volume root.
    #[clap(long, env = "PGDATA", value_name = "PATH")]
    pub pgdata: Option<PathBuf>,
    /// The certificate directory. Defaults to `certs` in the volume root.
    #[clap(long, env = "PATRONI_CERTS_DIR", value_name = "PATH")]
    pub certs_dir: Option<PathBuf>,
    /// The leader key time-to-live, in seconds.
    #[clap(long, env = "PATRONI_TTL", value_name = "SECONDS", default_value = "40")]
    pub ttl: u32,
    /// The orchestrator loop interval, in seconds.
    #[clap(long, env = "PATRONI_LOOP_WAIT", value_name = "SECONDS", default_value = "10")]
    pub loop_wait: u32,
    /// The registry operation retry timeout, in seconds.
    #[clap(long, env = "PATRONI_RETRY_TIMEOUT", value_name = "SECONDS", default_value = "10")]
    pub retry_timeout: u32,
    /// How often the orchestrator's health is probed.
    #[clap(long, env = "PATRONI_HEALTH_CHECK_INTERVAL", value_name = "DURATION", value_parser = humantime::parse_duration, default_value = "5s")]
    pub health_check_interval: Duration,
    /// The timeout of each health probe.
    #[clap(long, env = "PATRONI_HEALTH_CHECK_TIMEOUT", value_name = "DURATION", value_parser = humantime::parse_duration, default_value = "5s")]
    pub health_check_timeout: Duration,
    /// Consecutive failed probes that force a restart.
    #[clap(long, env = "PATRONI_MAX_HEALTH_FAILURES", value_name = "N", default_value = "3")]
    pub max_health_failures: u32,
    /// How long after start probe failures are not counted.
    #[clap(long, env = "PATRONI_STARTUP_GRACE_PERIOD", value_name = "DURATION", value_parser = humantime::parse_duration, default_value = "60s")]
    pub startup_grace_period: Duration,
    /// How long the orchestrator may take to exit after `SIGTERM` before it
    /// is killed.
    #[clap(long, env = "PATRONI_TERMINATION_GRACE", value_name = "DURATION", value_parser = humantime::parse_duration, default_value = "10s")]
    pub termination_grace: Duration,
    /// Discard registry state for existing data on the designated primary.
    #[clap(long, env = "PATRONI_FORCE_REINIT")]
    pub force_reinit: bool,
    /// The orchestrator binary.
    #[clap(long, env = "PATRONI_BINARY", value_name = "PATH", default_value = "patroni")]
    pub patroni_binary: PathBuf,
    /// Where the orchestrator configuration file is written.
    #[clap(long, env = "PATRONI_CONFIG_PATH", value_name = "PATH", default_value = "/etc/patroni/patroni.yml")]
    pub config_path: PathBuf,
    /// The orchestrator REST API port.
    #[clap(long, env = "PATRONI_API_PORT", value_name = "PORT", default_value = "8008")]
    pub api_port: u16,
    /// The database port.
    #[clap(long, env = "PATRONI_POSTGRES_PORT", value_name = "PORT", default_value = "5432")]
    pub postgres_port: u16,
    /// The database's Unix socket directory.
    #[clap(long, env = "PATRONI_SOCKET_DIR", value_name = "PATH", default_value = "/var/run/postgresql")]
    pub socket_dir: PathBuf,
    /// The program the orchestrator runs when the node's role changes.
    #[clap(long, env = "PATRONI_ROLE_CHANGE_CALLBACK", value_name = "PATH", default_value = "/usr/local/bin/role-change-callback")]
    pub role_change_callback: PathBuf,
    /// The program the orchestrator runs once after initializing a new
    /// cluster.
    #[clap(long, env = "PATRONI_POST_BOOTSTRAP", value_name = "PATH", default_value = "/usr/local/bin/post-bootstrap")]
    pub post_bootstrap: PathBuf,
    /// The timeout of each registry request.
    #[clap(long, env = "PATRONI_REGISTRY_TIMEOUT", value_name = "DURATION", value_parser = humantime::parse_duration, default_value = "5s")]
    pub registry_timeout: Duration,
}

/// A username and password.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// The role name.
    pub username: String,
    /// The role's password.
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// The orchestrator's registry session timings, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DcsTimings {
    /// The leader key time-to-live.
    pub ttl: u32,
    /// The orchestrator loop interval.
    pub loop_wait: u32,
    /// The registry operation retry timeout.
    pub retry_timeout: u32,
}

impl DcsTimings {
    /// Checks that a leader can renew its key before it expires:
    /// `loop_wait + 2 * retry_timeout <= ttl`.
    pub fn validate(self) -> Result<DcsTimings, ConfigError> {
        let needed = self
            .loop_wait
            .saturating_add(self.retry_timeout.saturating_mul(2));
        if self.ttl == 0 {
            return Err(ConfigError::Zero("ttl"));
        }
        if needed > self.ttl {
            return Err(ConfigError::DcsTimings {
                ttl: self.ttl,
                loop_wait: self.loop_wait,
                retry_timeout: self.retry_timeout,
            });
        }
        Ok(self)
    }
}

/// Health-loop settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSettings {
    /// How often the orchestrator is probed.
    pub interval: Duration,
    /// The timeout of each probe.
    pub timeout: Duration,
    /// Consecutive failures that force a restart.
    pub max_failures: u32,
    /// How long after start failures are not counted.
    pub startup_grace: Duration,
    /// How long the orchestrator may take to stop.
    pub termination_grace: Duration,
}

/// Validated configuration of one database node.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// The node name.
    pub name: String,
    /// The address other nodes use to reach this node.
    pub connect_address: String,
    /// The registry hosts as `host:port`.
    pub registry_hosts: Vec<String>,
    /// The registry endpoints.
    pub registry_endpoints: Vec<Url>,
    /// The node that owns the initial data.
    pub designated_primary: String,
    /// The cluster name.
    pub scope: String,
    /// The registry key namespace, without a trailing slash.
    pub namespace: String,
    /// The database superuser.
    pub superuser: Credentials,
    /// The replication user.
    pub replication: Credentials,
    /// The volume mount path.
    pub volume_root: PathBuf,
    /// The database data directory.
    pub data_dir: PathBuf,
    /// The certificate directory.
    pub certs_dir: PathBuf,
    /// Registry session timings.
    pub dcs: DcsTimings,
    /// Health-loop settings.
    pub health: HealthSettings,
    /// Whether registry state is discarded for existing primary data.
    pub force_reinit: bool,
    /// The orchestrator binary.
    pub patroni_binary: PathBuf,
    /// The orchestrator configuration file.
    pub config_path: PathBuf,
    /// The orchestrator REST API port.
    pub api_port: u16,
    /// The database port.
    pub postgres_port: u16,
    /// The database's Unix socket directory.
    pub socket_dir: PathBuf,
    /// The role-change callback program.
    pub role_change_callback: PathBuf,
    /// The post-bootstrap hook program.
    pub post_bootstrap: PathBuf,
    /// The timeout of each registry request.
    pub registry_timeout: Duration,
}

impl SupervisorArgs {
    /// Resolves and validates the node's configuration.
    pub fn to_config(&self) -> Result<SupervisorConfig, ConfigError> {
        let name = required(&self.name, "PATRONI_NAME")?;
        let connect_address = required(&self.connect_address, "RAILWAY_PRIVATE_DOMAIN")?;
        let hosts = cli::split_list(&required(&self.etcd_hosts, "PATRONI_ETCD3_HOSTS")?);
        if hosts.is_empty() {
            return Err(ConfigError::Missing("PATRONI_ETCD3_HOSTS"));
        }
        let mut registry_hosts = Vec::with_capacity(hosts.len());
        let mut registry_endpoints = Vec::with_capacity(hosts.len());
        for host in hosts {
            let (host_port, url) = parse_registry_host(&host)?;
            registry_hosts.push(host_port);
            registry_endpoints.push(url);
        }

        let members = self
            .cluster_members
            .as_deref()
            .map(cli::split_list)
            .unwrap_or_default();
        if !members.is_empty() && !members.contains(&name) {
            return Err(ConfigError::UnknownNode { name, members });
        }
        let designated_primary = match self.designated_primary.as_deref().map(str::trim) {
            Some(primary) if !primary.is_empty() => primary.to_string(),
            _ => members
                .first()
                .cloned()
                .ok_or(ConfigError::Missing("PATRONI_CLUSTER_MEMBERS"))?,
        };

        let superuser = Credentials {
            username: non_empty(&self.superuser_username, "PATRONI_SUPERUSER_USERNAME")?,
            password: required(&self.superuser_password, "PATRONI_SUPERUSER_PASSWORD")?,
        };
        let replication = Credentials {
            username: non_empty(&self.replication_username, "PATRONI_REPLICATION_USERNAME")?,
            password: required(&self.replication_password, "PATRONI_REPLICATION_PASSWORD")?,
        };

        let dcs = DcsTimings {
            ttl: self.ttl,
            loop_wait: self.loop_wait,
            retry_timeout: self.retry_timeout,
        }
        .validate()?;
        if self.max_health_failures == 0 {
            return Err(ConfigError::Zero("PATRONI_MAX_HEALTH_FAILURES"));
        }
        if self.health_check_interval.is_zero() {
            return Err(ConfigError::Zero("PATRONI_HEALTH_CHECK_INTERVAL"));
        }

        let namespace = match self.namespace.trim().trim_end_matches('/') {
            "" => String::new(),
            ns if ns.starts_with('/') => ns.to_string(),
            ns => format!("/{ns}"),
        };

        Ok(SupervisorConfig {
            name,
            connect_address,
            registry_hosts,
            registry_endpoints,
            designated_primary,
            scope: non_empty(&self.scope, "PATRONI_SCOPE")?,
            namespace,
            superuser,
            replication,
            data_dir: self
                .pgdata
                .clone()
                .unwrap_or_else(|| self.volume_root.join("pgdata")),
            certs_dir: self
                .certs_dir
                .clone()
                .unwrap_or_else(|| self.volume_root.join("certs")),
            volume_root: self.volume_root.clone(),
            dcs,
            health: HealthSettings {
                interval: self.health_check_interval,
                timeout: self.health_check_timeout,
                max_failures: self.max_health_failures,
                startup_grace: self.startup_grace_period,
                termination_grace: self.termination_grace,
            },
            force_reinit: self.force_reinit,
            patroni_binary: self.patroni_binary.clone(),
            config_path: self.config_path.clone(),
            api_port: self.api_port,
            postgres_port: self.postgres_port,
            socket_dir: self.socket_dir.clone(),
            role_change_callback: self.role_change_callback.clone(),
            post_bootstrap: self.post_bootstrap.clone(),
            registry_timeout: self.registry_timeout,
        })
    }
}

impl SupervisorConfig {
    /// Reports whether this node owns the initial data.
    pub fn is_designated_primary(&self) -> bool {
        self.name == self.designated_primary
    }

    /// The marker recording that the data directory is managed by the
    /// orchestrator.
    pub fn coordination_marker(&self) -> DurableMarker {
        DurableMarker::in_dir(&self.volume_root, COORDINATION_MARKER)
    }

    /// The orchestrator's local health endpoint.
    pub fn health_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&format!("http://127.0.0.1:{}/health", self.api_port))
    }

    /// The registry key prefix holding this cluster's state, with a
    /// trailing slash.
    pub fn registry_prefix(&self) -> String {
        format!("{}/{}/", self.namespace, self.scope)
    }
}

fn required(value: &Option<String>, name: &'static str) -> Result<String, ConfigError> {
    match value.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn non_empty(value: &str, name: &'static str) -> Result<String, ConfigError> {
    match value.trim() {
        "" => Err(ConfigError::Missing(name)),
        value => Ok(value.to_string()),
    }
}

/// Parses a registry host given as `host:port` or as a URL into its
/// `host:port` form and its URL. A missing port defaults to
/// [`DEFAULT_REGISTRY_PORT`].
pub fn parse_registry_host(host: &str) -> Result<(String, Url), ConfigError> {
    let invalid = || ConfigError::InvalidRegistryHost(host.to_string());
    let mut url = if host.contains("://") {
        Url::parse(host)
    } else {
        Url::parse(&format!("http://{host}"))
    }
    .map_err(|_| invalid())?;
    if url.port().is_none() {
        url.set_port(Some(DEFAULT_REGISTRY_PORT))
            .map_err(|()| invalid())?;
    }
    let name = url.host_str().ok_or_else(invalid)?;
    let port = url.port().unwrap_or(DEFAULT_REGISTRY_PORT);
    Ok((format!("{name}:{port}"), url))
}

/// Builds a configuration for `name` in a three-node cluster whose volume is
/// rooted at `volume_root`.
#[cfg(test)]
pub(crate) fn test_config(name: &str, volume_root: &std::path::Path) -> SupervisorConfig {
    use clap::Parser;

    #[derive(Debug, clap::Parser)]
    struct Args {
        #[clap(flatten)]
        supervisor: SupervisorArgs,
    }

    let args = Args::try_parse_from([
        "node-supervisor".to_string(),
        format!("--name={name}"),
        format!("--connect-address={name}.internal"),
        "--etcd-hosts=etcd-1:2379,etcd-2:2379,etcd-3:2379".to_string(),
        "--cluster-members=pg-1,pg-2,pg-3".to_string(),
        "--superuser-password=su-secret".to_string(),
        "--replication-password=repl-secret".to_string(),
        format!("--volume-root={}", volume_root.display()),
    ])
    .unwrap();
    args.supervisor.to_config().unwrap()
}

#[cfg(test)]
mod tests {
    use pgha_ore::cli::{CliConfig, try_parse_args_from};

    use super::*;

    #[derive(Debug, clap::Parser)]
    struct Args {
        #[clap(flatten)]
        supervisor: SupervisorArgs,
    }

    const BASE: &[&str] = &[
        "node-supervisor",
        "--name=pg-2",
        "--connect-address=pg-2.internal",
        "--etcd-hosts=etcd-1:2379, http://etcd-2:2379,etcd-3",
        "--cluster-members=pg-1,pg-2,pg-3",
        "--superuser-password=su",
        "--replication-password=repl",
        "--volume-root=/data",
    ];

    fn parse(extra: &[&str]) -> Result<SupervisorConfig, ConfigError> {
        let argv = BASE.iter().chain(extra).copied();
        let args: Args = try_parse_args_from(CliConfig::default(), argv).unwrap();
        args.supervisor.to_config()
    }

    #[test]
    fn resolves_identity_without_side_effects() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.name, "pg-2");
        assert_eq!(config.designated_primary, "pg-1");
        assert!(!config.is_designated_primary());
        assert_eq!(
            config.registry_hosts,
            vec!["etcd-1:2379", "etcd-2:2379", "etcd-3:2379"]
        );
        assert_eq!(config.data_dir, PathBuf::from("/data/pgdata"));
        assert_eq!(config.certs_dir, PathBuf::from("/data/certs"));
        assert_eq!(
            config.coordination_marker().path(),
            PathBuf::from("/data/.patroni_bootstrap_complete")
        );
        assert_eq!(config.registry_prefix(), "/service/pg-ha/");
        assert_eq!(config.health_url().unwrap().as_str(), "http://127.0.0.1:8008/health");
    }

    #[test]
    fn explicit_designated_primary_wins() {
        let config = parse(&["--designated-primary=pg-2"]).unwrap();
        assert!(config.is_designated_primary());
    }

    #[test]
    fn missing_values_are_reported_by_name() {
        let args: Args = try_parse_args_from(
            CliConfig::default(),
            ["node-supervisor", "--connect-address=x", "--etcd-hosts=e:2379"],
        )
        .unwrap();
        let mut supervisor = args.supervisor;
        supervisor.name = None;
        assert_eq!(
            supervisor.to_config().unwrap_err(),
            ConfigError::Missing("PATRONI_NAME")
        );

        assert_eq!(
            parse(&["--replication-password="]).unwrap_err(),
            ConfigError::Missing("PATRONI_REPLICATION_PASSWORD")
        );
    }

    #[test]
    fn node_must_be_a_member() {
        assert!(matches!(
            parse(&["--cluster-members=pg-1,pg-3"]),
            Err(ConfigError::UnknownNode { .. })
        ));
    }

    #[test]
    fn dcs_timings_must_fit_ttl() {
        assert!(parse(&["--ttl=30"]).is_ok());
        assert_eq!(
            parse(&["--ttl=29"]).unwrap_err(),
            ConfigError::DcsTimings {
                ttl: 29,
                loop_wait: 10,
                retry_timeout: 10
            }
        );
    }

    #[test]
    fn namespace_is_normalized() {
        let config = parse(&["--namespace=service/"]).unwrap();
        assert_eq!(config.registry_prefix(), "/service/pg-ha/");
    }

    #[test]
    fn credentials_are_redacted() {
        let config = parse(&[]).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("repl\""), "{debug}");
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn registry_hosts_must_parse() {
        assert_eq!(
            parse_registry_host("http://").unwrap_err(),
            ConfigError::InvalidRegistryHost("http://".into())
        );
    }
}
