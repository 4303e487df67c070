// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Provisioning of the replication role on adopted data.
//!
//! Data adopted from a standalone server has no replication role. Once the
//! orchestrator has started the database, the role is created, or its
//! password reset, over the local Unix socket.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use pgha_ore::retry::Retry;
use pgha_ore::task;
use tokio_postgres::NoTls;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Credentials, SupervisorConfig};

/// How long to keep trying to reach the database.
const ROLE_TASK_MAX_DURATION: Duration = Duration::from_secs(600);

/// Quotes `ident` as a SQL identifier.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quotes `literal` as a SQL string literal. Literals containing
/// backslashes use the escape string syntax.
pub fn quote_literal(literal: &str) -> String {
    let quoted = literal.replace('\'', "''");
    if quoted.contains('\\') {
        format!("E'{}'", quoted.replace('\\', "\\\\"))
    } else {
        format!("'{quoted}'")
    }
}

/// Whether a role is created or updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleAction {
    /// The role does not exist.
    Create,
    /// The role exists.
    Alter,
}

/// The statement that gives `role` replication and login privileges and
/// sets its password.
pub fn role_statement(action: RoleAction, role: &Credentials) -> String {
    let verb = match action {
        RoleAction::Create => "CREATE",
        RoleAction::Alter => "ALTER",
    };
    format!(
        "{verb} ROLE {} WITH REPLICATION LOGIN PASSWORD {}",
        quote_ident(&role.username),
        quote_literal(&role.password)
    )
}

/// Where and as whom to connect to the local database.
#[derive(Debug, Clone)]
pub struct LocalDatabase {
    /// The Unix socket directory.
    pub socket_dir: PathBuf,
    /// The database port, which names the socket.
    pub port: u16,
    /// The superuser to connect as.
    pub superuser: Credentials,
}

impl LocalDatabase {
    /// The local database of `config`.
    pub fn new(config: &SupervisorConfig) -> LocalDatabase {
        LocalDatabase {
            socket_dir: config.socket_dir.clone(),
            port: config.postgres_port,
            superuser: config.superuser.clone(),
        }
    }

    async fn connect(&self) -> Result<tokio_postgres::Client, anyhow::Error> {
        let (client, conn) = tokio_postgres::Config::new()
            .host_path(&self.socket_dir)
            .port(self.port)
            .user(&self.superuser.username)
            .password(&self.superuser.password)
            .dbname("postgres")
            .connect_timeout(Duration::from_secs(5))
            .connect(NoTls)
            .await
            .context("connecting to local database")?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("local database connection closed: {e}");
            }
        });
        Ok(client)
    }

    /// Creates `role`, or updates it if it exists.
    pub async fn ensure_role(&self, role: &Credentials) -> Result<RoleAction, anyhow::Error> {
        let client = self.connect().await?;
        let exists = client
            .query_opt("SELECT 1 FROM pg_roles WHERE rolname = $1", &[&role.username])
            .await
            .context("looking up replication role")?
            .is_some();
        let action = if exists {
            RoleAction::Alter
        } else {
            RoleAction::Create
        };
        client
            .batch_execute(&role_statement(action, role))
            .await
            .with_context(|| format!("provisioning role {}", role.username))?;
        Ok(action)
    }
}

/// Provisions `role` in the background, retrying with backoff until the
/// database accepts connections or the attempts run out. Dropping the handle
/// cancels the task.
pub fn spawn_ensure_role(database: LocalDatabase, role: Credentials) -> AbortOnDropHandle<()> {
    task::spawn("replication-role", async move {
        let result = Retry::default()
            .initial_backoff(Duration::from_secs(2))
            .clamp_backoff(Duration::from_secs(30))
            .max_duration(ROLE_TASK_MAX_DURATION)
            .jitter(true)
            .retry_async(|state| {
                let database = &database;
                let role = &role;
                async move {
                    let res = database.ensure_role(role).await;
                    if let Err(e) = &res {
                        if state.next_backoff.is_some() {
                            warn!(attempt = state.i, "replication role not provisioned yet: {e:#}");
                        }
                    }
                    res
                }
            })
            .await;
        match result {
            Ok(RoleAction::Create) => info!(role = %role.username, "created replication role"),
            Ok(RoleAction::Alter) => info!(role = %role.username, "updated replication role"),
            Err(e) => error!(role = %role.username, "giving up on replication role: {e:#}"),
        }
    })
}
