// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The orchestrator's runtime configuration file.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bootstrap;
use crate::config::{Credentials, SupervisorConfig};

/// The root of the orchestrator's configuration document.
#[derive(Debug, Clone, Serialize)]
pub struct PatroniConfig {
    /// The cluster name.
    pub scope: String,
    /// The registry key namespace, with a trailing slash.
    pub namespace: String,
    /// The node name.
    pub name: String,
    /// The REST API the supervisor probes.
    pub restapi: RestApi,
    /// The registry hosts.
    pub etcd3: Etcd3,
    /// Settings used only when this node initializes a new cluster.
    pub bootstrap: Bootstrap,
    /// The local database.
    pub postgresql: Postgresql,
}

/// REST API addresses.
#[derive(Debug, Clone, Serialize)]
pub struct RestApi {
    /// The local listen address.
    pub listen: String,
    /// The address other nodes and the watcher use.
    pub connect_address: String,
}

/// Registry hosts, as `host:port`.
#[derive(Debug, Clone, Serialize)]
pub struct Etcd3 {
    /// Every registry member.
    pub hosts: Vec<String>,
}

/// The `bootstrap` section.
#[derive(Debug, Clone, Serialize)]
pub struct Bootstrap {
    /// Cluster-wide settings seeded into the registry.
    pub dcs: Dcs,
    /// Options passed to `initdb`.
    pub initdb: Vec<InitdbOption>,
    /// The initial `pg_hba.conf`.
    pub pg_hba: Vec<String>,
    /// The hook run once after `initdb`. The orchestrator appends a
    /// connection string to the command.
    pub post_bootstrap: String,
}

/// Registry session timings and replication settings shared by every node.
#[derive(Debug, Clone, Serialize)]
pub struct Dcs {
    /// The leader key time-to-live, in seconds.
    pub ttl: u32,
    /// The orchestrator loop interval, in seconds.
    pub loop_wait: u32,
    /// The registry operation retry timeout, in seconds.
    pub retry_timeout: u32,
    /// The replication lag, in bytes, beyond which a replica may not be
    /// promoted.
    pub maximum_lag_on_failover: u64,
    /// Whether a leader keeps its role while the registry is unreachable,
    /// as long as every member confirms it.
    pub failsafe_mode: bool,
    /// Database settings seeded into the registry.
    pub postgresql: DcsPostgresql,
}

/// Database settings shared by every node.
#[derive(Debug, Clone, Serialize)]
pub struct DcsPostgresql {
    /// Whether a former primary is rewound instead of recloned.
    pub use_pg_rewind: bool,
    /// Whether replicas stream through replication slots.
    pub use_slots: bool,
    /// Server parameters every node must agree on.
    pub parameters: BTreeMap<&'static str, String>,
}

/// An `initdb` flag, either bare or with a value.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum InitdbOption {
    /// A flag without a value, like `data-checksums`.
    Flag(String),
    /// A flag with a value, like `{encoding: UTF8}`.
    Value(BTreeMap<String, String>),
}

/// Settings of the local database.
#[derive(Debug, Clone, Serialize)]
pub struct Postgresql {
    /// The local listen address.
    pub listen: String,
    /// The address replicas connect to.
    pub connect_address: String,
    /// The database cluster directory.
    pub data_dir: PathBuf,
    /// Where the orchestrator writes the password file it uses for
    /// replication connections.
    pub pgpass: PathBuf,
    /// Event programs.
    pub callbacks: Callbacks,
    /// Whether a replica whose rewind fails is recloned.
    pub remove_data_directory_on_rewind_failure: bool,
    /// Whether a replica on a diverged timeline is recloned.
    pub remove_data_directory_on_diverged_timelines: bool,
    /// How replicas are created, in order of preference.
    pub create_replica_methods: Vec<String>,
    /// Options of `pg_basebackup`.
    pub basebackup: BTreeMap<&'static str, String>,
    /// The roles the orchestrator connects as.
    pub authentication: Authentication,
    /// Server parameters local to this node.
    pub parameters: BTreeMap<&'static str, String>,
}

/// Programs the orchestrator runs on events.
#[derive(Debug, Clone, Serialize)]
pub struct Callbacks {
    /// Run with `<action> <role> <scope>` when the node's role changes.
    pub on_role_change: PathBuf,
}

/// The roles the orchestrator connects as.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authentication {
    /// The role replicas stream as.
    pub replication: User,
    /// The role the orchestrator manages the database as.
    pub superuser: User,
}

/// A database role and its password.
#[derive(Clone, Serialize, Deserialize)]
pub struct User {
    /// The role name.
    pub username: String,
    /// The role password.
    pub password: String,
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl From<User> for Credentials {
    fn from(user: User) -> Credentials {
        Credentials {
            username: user.username,
            password: user.password,
        }
    }
}

/// The `pg_hba.conf` rules that admit the replication user from any
/// address.
pub fn replication_hba_rules(user: &str) -> Vec<String> {
    ["hostssl", "host"]
        .into_iter()
        .flat_map(|kind| {
            ["0.0.0.0/0", "::/0"]
                .into_iter()
                .map(move |net| format!("{kind} replication {user} {net} scram-sha-256"))
        })
        .collect()
}

impl PatroniConfig {
    /// Builds the document for `config`.
    pub fn new(config: &SupervisorConfig) -> PatroniConfig {
        let dcs_parameters = BTreeMap::from([
            ("wal_level", "replica".to_string()),
            ("hot_standby", "on".to_string()),
            ("max_wal_senders", "10".to_string()),
            ("max_replication_slots", "10".to_string()),
            ("max_connections", "200".to_string()),
            ("password_encryption", "scram-sha-256".to_string()),
        ]);

        let mut pg_hba = vec!["local all all trust".to_string()];
        pg_hba.extend(replication_hba_rules(&config.replication.username));
        pg_hba.extend(
            ["hostssl", "host"]
                .into_iter()
                .flat_map(|kind| {
                    ["0.0.0.0/0", "::/0"]
                        .into_iter()
                        .map(move |net| format!("{kind} all all {net} scram-sha-256"))
                }),
        );

        let certs = &config.certs_dir;
        let parameters = BTreeMap::from([
            (
                "unix_socket_directories",
                config.socket_dir.display().to_string(),
            ),
            ("ssl", "on".to_string()),
            ("ssl_cert_file", certs.join("server.crt").display().to_string()),
            ("ssl_key_file", certs.join("server.key").display().to_string()),
            ("ssl_ca_file", certs.join("root.crt").display().to_string()),
        ]);

        PatroniConfig {
            scope: config.scope.clone(),
            namespace: format!("{}/", config.namespace),
            name: config.name.clone(),
            restapi: RestApi {
                listen: format!("0.0.0.0:{}", config.api_port),
                connect_address: format!("{}:{}", config.connect_address, config.api_port),
            },
            etcd3: Etcd3 {
                hosts: config.registry_hosts.clone(),
            },
            bootstrap: Bootstrap {
                dcs: Dcs {
                    ttl: config.dcs.ttl,
                    loop_wait: config.dcs.loop_wait,
                    retry_timeout: config.dcs.retry_timeout,
                    maximum_lag_on_failover: 1 << 20,
                    failsafe_mode: true,
                    postgresql: DcsPostgresql {
                        use_pg_rewind: true,
                        use_slots: true,
                        parameters: dcs_parameters,
                    },
                },
                initdb: vec![
                    InitdbOption::Value(BTreeMap::from([("encoding".into(), "UTF8".into())])),
                    InitdbOption::Flag("data-checksums".into()),
                    InitdbOption::Value(BTreeMap::from([(
                        "username".into(),
                        config.superuser.username.clone(),
                    )])),
                ],
                pg_hba,
                post_bootstrap: bootstrap::hook_command(config),
            },
            postgresql: Postgresql {
                listen: format!("*:{}", config.postgres_port),
                connect_address: format!("{}:{}", config.connect_address, config.postgres_port),
                data_dir: config.data_dir.clone(),
                pgpass: PathBuf::from("/tmp/pgpass"),
                callbacks: Callbacks {
                    on_role_change: config.role_change_callback.clone(),
                },
                remove_data_directory_on_rewind_failure: true,
                remove_data_directory_on_diverged_timelines: true,
                create_replica_methods: vec!["basebackup".into()],
                basebackup: BTreeMap::from([
                    ("checkpoint", "fast".to_string()),
                    ("wal-method", "stream".to_string()),
                ]),
                authentication: Authentication {
                    replication: User {
                        username: config.replication.username.clone(),
                        password: config.replication.password.clone(),
                    },
                    superuser: User {
                        username: config.superuser.username.clone(),
                        password: config.superuser.password.clone(),
                    },
                },
                parameters,
            },
        }
    }

    /// Renders the document as YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Writes the document to `path`, readable only by the owner. Parent
    /// directories are created as needed.
    pub fn write(&self, path: &Path) -> Result<(), anyhow::Error> {
        let yaml = self.to_yaml()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        // An existing file keeps its mode on open.
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
        file.write_all(yaml.as_bytes())?;
        file.sync_all()?;
        info!(path = %path.display(), "wrote orchestrator configuration");
        Ok(())
    }
}

/// Prepends replication rules for `user` to the `pg_hba.conf` in
/// `data_dir`, unless rules for that user already exist.
///
/// Returns whether the file was changed. A missing file is left alone.
pub fn patch_pg_hba(data_dir: &Path, user: &str) -> Result<bool, io::Error> {
    let path = data_dir.join("pg_hba.conf");
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let has_rule = content.lines().any(|line| {
        let mut fields = line.split_whitespace();
        matches!(
            (fields.next(), fields.next(), fields.next()),
            (Some(kind), Some("replication"), Some(u)) if !kind.starts_with('#') && u == user
        )
    });
    if has_rule {
        info!(%user, "pg_hba.conf already admits replication user");
        return Ok(false);
    }

    let mut patched = format!("# Replication entries for {user}\n");
    for rule in replication_hba_rules(user) {
        patched.push_str(&rule);
        patched.push('\n');
    }
    patched.push('\n');
    patched.push_str(&content);
    fs::write(&path, patched)?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
    info!(%user, path = %path.display(), "added replication entries to pg_hba.conf");
    Ok(true)
}
