// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Completion of a new cluster's bootstrap.
//!
//! The orchestrator runs its post-bootstrap hook once, on the node that
//! initialized the cluster, after `initdb` and before the database accepts
//! clients. The hook provisions the replication role and then writes the
//! coordination marker, so that later restarts of the node classify its
//! data as managed. If the hook fails the orchestrator abandons the
//! bootstrap, so the marker is only written once the role exists.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use pgha_ore::marker::DurableMarker;
use serde::Deserialize;
use tracing::info;

use crate::config::{Credentials, SupervisorConfig};
use crate::patroni::Authentication;
use crate::replication::{LocalDatabase, RoleAction};

/// Creates or updates database roles.
#[async_trait]
pub trait RoleProvisioner: Send + Sync {
    /// Gives `role` replication and login privileges and sets its password.
    async fn ensure_role(&self, role: &Credentials) -> Result<RoleAction, anyhow::Error>;
}

#[async_trait]
impl RoleProvisioner for LocalDatabase {
    async fn ensure_role(&self, role: &Credentials) -> Result<RoleAction, anyhow::Error> {
        LocalDatabase::ensure_role(self, role).await
    }
}

/// The hook command rendered into the orchestrator configuration.
pub fn hook_command(config: &SupervisorConfig) -> String {
    let marker = config.coordination_marker();
    [
        config.post_bootstrap.display().to_string(),
        "--config".into(),
        config.config_path.display().to_string(),
        "--marker".into(),
        marker.path().display().to_string(),
    ]
    .iter()
    .map(|word| shell_word(word))
    .collect::<Vec<_>>()
    .join(" ")
}

/// Quotes `word` for a POSIX shell lexer, unless it needs no quoting.
fn shell_word(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=:,@%".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

#[derive(Deserialize)]
struct Document {
    name: String,
    postgresql: DocumentPostgresql,
}

#[derive(Deserialize)]
struct DocumentPostgresql {
    listen: String,
    authentication: Authentication,
    parameters: DocumentParameters,
}

#[derive(Deserialize)]
struct DocumentParameters {
    unix_socket_directories: String,
}

/// What the hook needs to know, read back from the orchestrator
/// configuration. The orchestrator runs the hook without the supervisor's
/// credentials in its environment.
#[derive(Debug, Clone)]
pub struct PostBootstrap {
    /// The node name.
    pub node: String,
    /// The freshly initialized database.
    pub database: LocalDatabase,
    /// The replication role to provision.
    pub replication: Credentials,
}

impl PostBootstrap {
    /// Reads the orchestrator configuration at `path`.
    pub fn from_patroni_config(path: &Path) -> Result<PostBootstrap, anyhow::Error> {
        let yaml =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let doc: Document =
            serde_yaml::from_str(&yaml).with_context(|| format!("parsing {}", path.display()))?;
        let port = doc
            .postgresql
            .listen
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .ok_or_else(|| anyhow!("no port in listen address {:?}", doc.postgresql.listen))?;
        let socket_dir = doc
            .postgresql
            .parameters
            .unix_socket_directories
            .split(',')
            .map(str::trim)
            .find(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("no unix socket directory configured"))?;
        let Authentication {
            replication,
            superuser,
        } = doc.postgresql.authentication;
        Ok(PostBootstrap {
            node: doc.name,
            database: LocalDatabase {
                socket_dir,
                port,
                superuser: superuser.into(),
            },
            replication: replication.into(),
        })
    }
}

/// Provisions `replication` through `provisioner` and then marks the data
/// directory as managed by the orchestrator.
pub async fn complete<P: RoleProvisioner>(
    provisioner: &P,
    replication: &Credentials,
    marker: &DurableMarker,
) -> Result<RoleAction, anyhow::Error> {
    let action = provisioner
        .ensure_role(replication)
        .await
        .context("provisioning replication role")?;
    info!(role = %replication.username, ?action, "replication role provisioned");
    if marker
        .mark()
        .with_context(|| format!("writing {}", marker.path().display()))?
    {
        info!(path = %marker.path().display(), "bootstrap marked complete");
    }
    Ok(action)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::test_config;
    use crate::patroni::PatroniConfig;

    #[derive(Debug, Default)]
    struct FakeProvisioner {
        fail: bool,
        roles: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RoleProvisioner for FakeProvisioner {
        async fn ensure_role(&self, role: &Credentials) -> Result<RoleAction, anyhow::Error> {
            if self.fail {
                anyhow::bail!("database is not accepting connections");
            }
            self.roles.lock().unwrap().push(role.username.clone());
            Ok(RoleAction::Create)
        }
    }

    #[test]
    fn words_are_quoted_only_when_needed() {
        assert_eq!(shell_word("/etc/patroni/patroni.yml"), "/etc/patroni/patroni.yml");
        assert_eq!(shell_word("/mnt/my volume"), "'/mnt/my volume'");
        assert_eq!(shell_word("it's"), r"'it'\''s'");
        assert_eq!(shell_word(""), "''");
    }

    #[test]
    fn hook_settings_are_read_back_from_rendered_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config("pg-1", dir.path());
        let path = dir.path().join("patroni.yml");
        PatroniConfig::new(&config).write(&path).unwrap();

        let hook = PostBootstrap::from_patroni_config(&path).unwrap();
        assert_eq!(hook.node, "pg-1");
        assert_eq!(hook.database.port, 5432);
        assert_eq!(hook.database.socket_dir, PathBuf::from("/var/run/postgresql"));
        assert_eq!(hook.database.superuser, config.superuser);
        assert_eq!(hook.replication, config.replication);
    }

    #[test]
    fn missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PostBootstrap::from_patroni_config(&dir.path().join("absent.yml")).is_err());
    }

    #[tokio::test]
    async fn marker_follows_role() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config("pg-1", dir.path());
        let marker = config.coordination_marker();

        let failing = FakeProvisioner {
            fail: true,
            ..Default::default()
        };
        assert!(complete(&failing, &config.replication, &marker).await.is_err());
        assert!(!marker.exists());

        let provisioner = FakeProvisioner::default();
        let action = complete(&provisioner, &config.replication, &marker).await.unwrap();
        assert_eq!(action, RoleAction::Create);
        assert!(marker.exists());
        assert_eq!(*provisioner.roles.lock().unwrap(), vec!["replicator"]);
    }
}
