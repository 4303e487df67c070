// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Launching the orchestrator.
//!
//! The orchestrator's environment is built explicitly rather than inherited.
//! Its embedded database clients prefer ambient libpq variables over the
//! credentials in its configuration file, so a stray `PGPASSWORD` in the
//! supervisor's environment would silently authenticate internal operations
//! as the wrong role.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;

use nix::sys::stat::{Mode, umask};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::config::SupervisorConfig;

/// Inherited variables that reach the orchestrator unchanged.
pub const INHERITED_VARS: &[&str] = &["PATH", "HOME", "LANG", "TZ", "USER"];

/// Inherited variables needed by the role-change callback, which the
/// orchestrator runs with its own environment.
pub const CALLBACK_VARS: &[&str] = &[
    "BACKBOARD_ENDPOINT",
    "BACKBOARD_TOKEN",
    "RAILWAY_PROJECT_ID",
    "RAILWAY_ENVIRONMENT_ID",
    "RAILWAY_SERVICE_ID",
    "PGHA_LOG_FILTER",
];

/// libpq variables that would shadow configured credentials. These never
/// reach the orchestrator.
pub const AMBIENT_CREDENTIAL_VARS: &[&str] = &[
    "PGPASSWORD",
    "PGUSER",
    "PGHOST",
    "PGPORT",
    "PGDATABASE",
    "PGPASSFILE",
    "PGSERVICE",
    "PGSSLMODE",
];

fn is_inherited(name: &str) -> bool {
    INHERITED_VARS.contains(&name) || CALLBACK_VARS.contains(&name) || name.starts_with("LC_")
}

fn is_ambient_credential(name: &OsStr) -> bool {
    name.to_str()
        .is_some_and(|name| AMBIENT_CREDENTIAL_VARS.contains(&name))
}

/// The complete environment of the orchestrator process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildEnvironment {
    vars: BTreeMap<OsString, OsString>,
}

impl ChildEnvironment {
    /// Keeps the allow-listed variables of `vars`.
    pub fn inherit<I, K, V>(vars: I) -> ChildEnvironment
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        let vars = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| k.to_str().is_some_and(is_inherited))
            .collect();
        ChildEnvironment { vars }
    }

    /// Keeps the allow-listed variables of this process's environment.
    pub fn from_process() -> ChildEnvironment {
        ChildEnvironment::inherit(std::env::vars_os())
    }

    /// Sets `key` to `value`. Ambient credential variables are refused.
    pub fn set(&mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> &mut Self {
        let key = key.into();
        if is_ambient_credential(&key) {
            warn!(key = ?key, "refusing to pass ambient credential variable to orchestrator");
        } else {
            self.vars.insert(key, value.into());
        }
        self
    }

    /// Returns the value of `key`, if set.
    pub fn get(&self, key: impl AsRef<OsStr>) -> Option<&OsStr> {
        self.vars.get(key.as_ref()).map(|v| v.as_os_str())
    }

    /// Iterates over the variables in order of name.
    pub fn iter(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.vars.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str()))
    }

    /// Replaces the environment of `cmd` with this one.
    pub fn apply(&self, cmd: &mut Command) {
        cmd.env_clear();
        cmd.envs(self.iter());
    }
}

/// The orchestrator's environment for `config`.
pub fn environment(config: &SupervisorConfig) -> ChildEnvironment {
    let mut env = ChildEnvironment::from_process();
    env.set("PATRONI_NAME", &config.name)
        .set("PATRONI_SCOPE", &config.scope);
    env
}

/// Creates the data directory if needed and restricts it to its owner, as
/// the database requires.
pub fn prepare_data_dir(path: &Path) -> Result<(), io::Error> {
    fs::create_dir_all(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
}

/// Builds the orchestrator command.
pub fn command(config: &SupervisorConfig, env: &ChildEnvironment) -> Command {
    let mut cmd = Command::new(&config.patroni_binary);
    cmd.arg(&config.config_path)
        .stdin(Stdio::null())
        .kill_on_drop(true);
    env.apply(&mut cmd);
    cmd
}

/// Starts the orchestrator.
///
/// The process umask is set to `077` first, so files created by the
/// orchestrator and its base backups are private to the owner.
pub fn launch(config: &SupervisorConfig, env: &ChildEnvironment) -> Result<Child, io::Error> {
    umask(Mode::from_bits_truncate(0o077));
    let child = command(config, env).spawn()?;
    info!(
        pid = child.id(),
        binary = %config.patroni_binary.display(),
        config = %config.config_path.display(),
        "started orchestrator"
    );
    Ok(child)
}
