// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Startup classification of a node's on-disk and registry state.
//!
//! The controller looks at the data directory, the coordination marker and,
//! only when the answer matters, the registry. It picks a [`StartupMode`] and
//! performs the preparation that mode calls for before the orchestrator is
//! started. Nothing here touches the database files beyond what the selected
//! mode requires.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use pgha_backboard::{Telemetry, TelemetryEvent};
use pgha_ore::dir;
use tracing::{info, warn};

use crate::config::SupervisorConfig;
use crate::patroni;

/// The registry keys holding a cluster's orchestration state, relative to
/// the cluster prefix. Trailing slashes denote directories.
pub const CLUSTER_STATE_KEYS: &[&str] = &[
    "initialize",
    "leader",
    "members/",
    "config",
    "history",
    "status",
    "sync",
    "failover",
];

/// File extensions of certificate material kept across a data refresh.
const CERTIFICATE_EXTENSIONS: &[&str] = &["crt", "key", "pem", "srl"];

/// How a node starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupMode {
    /// The designated primary has no data. The orchestrator initializes a
    /// new cluster.
    FreshInit,
    /// The designated primary has data and a reinit was requested. Registry
    /// state is cleared and the data is kept.
    ForcedReinit,
    /// The designated primary has data that was never managed by the
    /// orchestrator. Registry state is cleared and the data is adopted.
    AdoptStandalone,
    /// The designated primary has managed data but the registry still holds
    /// a previous cluster's state, which is cleared.
    Reclaim,
    /// The designated primary has managed data and the registry is empty.
    Resume,
    /// A replica has data. Everything but certificate material is wiped and
    /// the orchestrator clones from the leader.
    CloneRefresh,
    /// A replica has no data. The orchestrator clones from the leader.
    CloneFresh,
}

impl StartupMode {
    /// Reports whether the mode clears the cluster's registry state.
    pub fn clears_registry(&self) -> bool {
        matches!(
            self,
            StartupMode::ForcedReinit | StartupMode::AdoptStandalone | StartupMode::Reclaim
        )
    }

    fn as_str(&self) -> &'static str {
        match self {
            StartupMode::FreshInit => "FRESH_INIT",
            StartupMode::ForcedReinit => "FORCED_REINIT",
            StartupMode::AdoptStandalone => "ADOPT_STANDALONE",
            StartupMode::Reclaim => "RECLAIM",
            StartupMode::Resume => "RESUME",
            StartupMode::CloneRefresh => "CLONE_REFRESH",
            StartupMode::CloneFresh => "CLONE_FRESH",
        }
    }
}

impl fmt::Display for StartupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What is known about a node at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeFacts {
    /// Whether the node owns the initial data.
    pub is_designated_primary: bool,
    /// Whether the data directory holds a database.
    pub has_data: bool,
    /// Whether a reinit was requested.
    pub force_reinit: bool,
    /// Whether the coordination marker is present.
    pub has_coordination_metadata: bool,
    /// Whether the registry holds state for the cluster.
    pub registry_has_prior_state: bool,
}

/// Selects the startup mode for `facts`. The first matching rule wins.
pub fn classify(facts: &NodeFacts) -> StartupMode {
    match (facts.is_designated_primary, facts.has_data) {
        (true, false) => StartupMode::FreshInit,
        (true, true) if facts.force_reinit => StartupMode::ForcedReinit,
        (true, true) if !facts.has_coordination_metadata => StartupMode::AdoptStandalone,
        (true, true) if facts.registry_has_prior_state => StartupMode::Reclaim,
        (true, true) => StartupMode::Resume,
        (false, true) => StartupMode::CloneRefresh,
        (false, false) => StartupMode::CloneFresh,
    }
}

/// Reports whether `data_dir` holds a database cluster.
pub fn has_postgres_data(data_dir: &Path) -> bool {
    data_dir.join("global").join("pg_control").exists() || data_dir.join("PG_VERSION").exists()
}

/// Lists the direct children of `data_dir` that hold certificate material:
/// the entry containing `certs_dir`, if any, and top-level certificate and
/// key files.
pub fn certificate_material(data_dir: &Path, certs_dir: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut preserve = vec![];
    if let Ok(relative) = certs_dir.strip_prefix(data_dir) {
        if let Some(first) = relative.components().next() {
            preserve.push(data_dir.join(first));
        }
    }
    let entries = match std::fs::read_dir(data_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(preserve),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let path = entry?.path();
        let is_certificate = path.is_file()
            && path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| CERTIFICATE_EXTENSIONS.contains(&ext));
        if is_certificate && !preserve.contains(&path) {
            preserve.push(path);
        }
    }
    preserve.sort();
    Ok(preserve)
}

/// The registry as seen by the adoption controller.
#[async_trait]
pub trait RegistryState: Send + Sync {
    /// Reports whether any key exists under `prefix`.
    async fn has_prior_state(&self, prefix: &str) -> Result<bool, anyhow::Error>;

    /// Deletes every key under each of `prefixes`, ignoring individual
    /// failures.
    async fn clear(&self, prefixes: &[String]);
}

#[async_trait]
impl RegistryState for pgha_registry_client::Client {
    async fn has_prior_state(&self, prefix: &str) -> Result<bool, anyhow::Error> {
        Ok(self.prefix_count(prefix).await? > 0)
    }

    async fn clear(&self, prefixes: &[String]) {
        let results = self.delete_prefixes_best_effort(prefixes).await;
        let failed = results.iter().filter(|(_, res)| res.is_err()).count();
        if failed > 0 {
            warn!(failed, total = results.len(), "registry state partially cleared");
        }
    }
}

/// What the caller must do after [`AdoptionController::prepare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preparation {
    /// The selected mode.
    pub mode: StartupMode,
    /// Whether the replication role must be created once the database
    /// accepts connections.
    pub ensure_replication_role: bool,
}

/// Classifies a node's state and prepares its data directory.
#[derive(Debug)]
pub struct AdoptionController<'a, R> {
    config: &'a SupervisorConfig,
    registry: &'a R,
    telemetry: &'a Telemetry,
}

impl<'a, R: RegistryState> AdoptionController<'a, R> {
    /// Creates a controller for the node described by `config`.
    pub fn new(
        config: &'a SupervisorConfig,
        registry: &'a R,
        telemetry: &'a Telemetry,
    ) -> AdoptionController<'a, R> {
        AdoptionController {
            config,
            registry,
            telemetry,
        }
    }

    /// The registry keys cleared by modes that clear registry state.
    pub fn cluster_state_prefixes(&self) -> Vec<String> {
        let prefix = self.config.registry_prefix();
        CLUSTER_STATE_KEYS
            .iter()
            .map(|key| format!("{prefix}{key}"))
            .collect()
    }

    /// Gathers the node's facts and selects a mode.
    ///
    /// The registry is only consulted when the mode depends on it. An
    /// unreachable registry is taken to hold no prior state.
    pub async fn decide(&self) -> NodeFacts {
        let mut facts = NodeFacts {
            is_designated_primary: self.config.is_designated_primary(),
            has_data: has_postgres_data(&self.config.data_dir),
            force_reinit: self.config.force_reinit,
            has_coordination_metadata: self.config.coordination_marker().exists(),
            registry_has_prior_state: false,
        };
        if facts.is_designated_primary
            && facts.has_data
            && !facts.force_reinit
            && facts.has_coordination_metadata
        {
            let prefix = self.config.registry_prefix();
            facts.registry_has_prior_state = match self.registry.has_prior_state(&prefix).await {
                Ok(found) => found,
                Err(e) => {
                    warn!(%prefix, "checking registry for prior cluster state failed: {e:#}");
                    false
                }
            };
        }
        facts
    }

    /// Selects the startup mode and applies its preparation.
    pub async fn prepare(&self) -> Result<Preparation, anyhow::Error> {
        let facts = self.decide().await;
        let mode = classify(&facts);
        info!(
            node = %self.config.name,
            %mode,
            is_designated_primary = facts.is_designated_primary,
            has_data = facts.has_data,
            has_coordination_metadata = facts.has_coordination_metadata,
            "selected startup mode"
        );
        self.telemetry.send(TelemetryEvent::StartupModeSelected {
            node: self.config.name.clone(),
            mode: mode.to_string(),
        });

        if mode.clears_registry() {
            self.registry.clear(&self.cluster_state_prefixes()).await;
        }

        let mut ensure_replication_role = false;
        match mode {
            StartupMode::AdoptStandalone => {
                patroni::patch_pg_hba(&self.config.data_dir, &self.config.replication.username)
                    .context("patching pg_hba.conf")?;
                let marker = self.config.coordination_marker();
                marker
                    .mark()
                    .with_context(|| format!("writing {}", marker.path().display()))?;
                ensure_replication_role = true;
            }
            StartupMode::CloneRefresh => {
                let data_dir = &self.config.data_dir;
                let preserve = certificate_material(data_dir, &self.config.certs_dir)
                    .context("listing certificate material")?;
                let removed = dir::clear_directory(data_dir, &preserve)
                    .await
                    .with_context(|| format!("clearing {}", data_dir.display()))?;
                info!(
                    removed = removed.len(),
                    preserved = preserve.len(),
                    "cleared replica data for a full resync"
                );
            }
            StartupMode::FreshInit
            | StartupMode::ForcedReinit
            | StartupMode::Reclaim
            | StartupMode::Resume
            | StartupMode::CloneFresh => (),
        }

        Ok(Preparation {
            mode,
            ensure_replication_role,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::bootstrap::{self, RoleProvisioner};
    use crate::config::{Credentials, test_config};
    use crate::replication::RoleAction;

    #[derive(Debug, Default)]
    struct FakeRegistry {
        prior_state: bool,
        unreachable: bool,
        queries: Mutex<Vec<String>>,
        cleared: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RegistryState for FakeRegistry {
        async fn has_prior_state(&self, prefix: &str) -> Result<bool, anyhow::Error> {
            self.queries.lock().unwrap().push(prefix.to_string());
            if self.unreachable {
                anyhow::bail!("connection refused");
            }
            Ok(self.prior_state)
        }

        async fn clear(&self, prefixes: &[String]) {
            self.cleared.lock().unwrap().extend_from_slice(prefixes);
        }
    }

    #[derive(Debug)]
    struct AcceptingDatabase;

    #[async_trait]
    impl RoleProvisioner for AcceptingDatabase {
        async fn ensure_role(&self, _: &Credentials) -> Result<RoleAction, anyhow::Error> {
            Ok(RoleAction::Create)
        }
    }

    fn facts(primary: bool, data: bool, force: bool, metadata: bool, prior: bool) -> NodeFacts {
        NodeFacts {
            is_designated_primary: primary,
            has_data: data,
            force_reinit: force,
            has_coordination_metadata: metadata,
            registry_has_prior_state: prior,
        }
    }

    fn seed_database(data_dir: &Path) {
        std::fs::create_dir_all(data_dir.join("global")).unwrap();
        std::fs::write(data_dir.join("global/pg_control"), b"ctl").unwrap();
        std::fs::write(data_dir.join("PG_VERSION"), b"16").unwrap();
        std::fs::write(data_dir.join("pg_hba.conf"), "local all all trust\n").unwrap();
    }

    #[test]
    fn decision_table() {
        assert_eq!(classify(&facts(true, false, true, true, true)), StartupMode::FreshInit);
        assert_eq!(classify(&facts(true, true, true, false, false)), StartupMode::ForcedReinit);
        assert_eq!(classify(&facts(true, true, false, false, true)), StartupMode::AdoptStandalone);
        assert_eq!(classify(&facts(true, true, false, true, true)), StartupMode::Reclaim);
        assert_eq!(classify(&facts(true, true, false, true, false)), StartupMode::Resume);
        assert_eq!(classify(&facts(false, true, true, true, true)), StartupMode::CloneRefresh);
        assert_eq!(classify(&facts(false, false, false, false, false)), StartupMode::CloneFresh);
    }

    #[test]
    fn mode_names() {
        assert_eq!(StartupMode::AdoptStandalone.to_string(), "ADOPT_STANDALONE");
        assert_eq!(StartupMode::CloneRefresh.to_string(), "CLONE_REFRESH");
        assert!(StartupMode::Reclaim.clears_registry());
        assert!(!StartupMode::Resume.clears_registry());
        assert!(!StartupMode::CloneRefresh.clears_registry());
    }

    #[test]
    fn database_detection() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_postgres_data(dir.path()));
        std::fs::write(dir.path().join("PG_VERSION"), b"16").unwrap();
        assert!(has_postgres_data(dir.path()));
    }

    #[tokio::test]
    async fn standalone_data_is_adopted() {
        let volume = tempfile::tempdir().unwrap();
        let config = test_config("pg-1", volume.path());
        seed_database(&config.data_dir);
        let registry = FakeRegistry::default();
        let telemetry = Telemetry::disabled("test");

        let prep = AdoptionController::new(&config, &registry, &telemetry)
            .prepare()
            .await
            .unwrap();

        assert_eq!(prep.mode, StartupMode::AdoptStandalone);
        assert!(prep.ensure_replication_role);
        assert!(config.coordination_marker().exists());
        let hba = std::fs::read_to_string(config.data_dir.join("pg_hba.conf")).unwrap();
        assert!(hba.contains("host replication replicator 0.0.0.0/0 scram-sha-256"));
        let cleared = registry.cleared.lock().unwrap().clone();
        assert_eq!(cleared.len(), CLUSTER_STATE_KEYS.len());
        assert!(cleared.contains(&"/service/pg-ha/members/".to_string()));
        assert!(registry.queries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn managed_primary_reclaims_or_resumes() {
        let volume = tempfile::tempdir().unwrap();
        let config = test_config("pg-1", volume.path());
        seed_database(&config.data_dir);
        config.coordination_marker().mark().unwrap();
        let telemetry = Telemetry::disabled("test");

        let registry = FakeRegistry {
            prior_state: true,
            ..Default::default()
        };
        let prep = AdoptionController::new(&config, &registry, &telemetry)
            .prepare()
            .await
            .unwrap();
        assert_eq!(prep.mode, StartupMode::Reclaim);
        assert!(!prep.ensure_replication_role);
        assert_eq!(*registry.queries.lock().unwrap(), vec!["/service/pg-ha/"]);
        assert_eq!(registry.cleared.lock().unwrap().len(), CLUSTER_STATE_KEYS.len());

        let registry = FakeRegistry::default();
        let prep = AdoptionController::new(&config, &registry, &telemetry)
            .prepare()
            .await
            .unwrap();
        assert_eq!(prep.mode, StartupMode::Resume);
        assert!(registry.cleared.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_registry_resumes() {
        let volume = tempfile::tempdir().unwrap();
        let config = test_config("pg-1", volume.path());
        seed_database(&config.data_dir);
        config.coordination_marker().mark().unwrap();
        let registry = FakeRegistry {
            prior_state: true,
            unreachable: true,
            ..Default::default()
        };
        let telemetry = Telemetry::disabled("test");

        let facts = AdoptionController::new(&config, &registry, &telemetry)
            .decide()
            .await;
        assert_eq!(classify(&facts), StartupMode::Resume);
    }

    #[tokio::test]
    async fn replica_refresh_keeps_certificates() {
        let volume = tempfile::tempdir().unwrap();
        let config = test_config("pg-2", volume.path());
        let data_dir = &config.data_dir;
        seed_database(data_dir);
        std::fs::create_dir_all(data_dir.join("base/1")).unwrap();
        std::fs::write(data_dir.join("base/1/1259"), b"rel").unwrap();
        std::fs::write(data_dir.join("server.crt"), b"cert").unwrap();
        std::fs::write(data_dir.join("server.key"), b"key").unwrap();
        std::fs::write(data_dir.join("postgresql.conf"), b"").unwrap();
        let registry = FakeRegistry::default();
        let telemetry = Telemetry::disabled("test");

        let prep = AdoptionController::new(&config, &registry, &telemetry)
            .prepare()
            .await
            .unwrap();

        assert_eq!(prep.mode, StartupMode::CloneRefresh);
        let mut left: Vec<_> = std::fs::read_dir(data_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        left.sort();
        assert_eq!(left, vec!["server.crt", "server.key"]);
        assert!(registry.cleared.lock().unwrap().is_empty());
    }

    #[test]
    fn certs_dir_inside_data_dir_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path();
        std::fs::create_dir_all(data_dir.join("tls/live")).unwrap();
        std::fs::write(data_dir.join("root.pem"), b"ca").unwrap();
        std::fs::write(data_dir.join("PG_VERSION"), b"16").unwrap();

        let preserve = certificate_material(data_dir, &data_dir.join("tls/live")).unwrap();
        assert_eq!(preserve, vec![data_dir.join("root.pem"), data_dir.join("tls")]);
    }

    #[tokio::test]
    async fn fresh_nodes_leave_everything_alone() {
        let volume = tempfile::tempdir().unwrap();
        let registry = FakeRegistry::default();
        let telemetry = Telemetry::disabled("test");

        let primary = test_config("pg-1", volume.path());
        let prep = AdoptionController::new(&primary, &registry, &telemetry)
            .prepare()
            .await
            .unwrap();
        assert_eq!(prep.mode, StartupMode::FreshInit);

        let replica = test_config("pg-3", volume.path());
        let prep = AdoptionController::new(&replica, &registry, &telemetry)
            .prepare()
            .await
            .unwrap();
        assert_eq!(prep.mode, StartupMode::CloneFresh);
        assert!(registry.cleared.lock().unwrap().is_empty());
        assert!(registry.queries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn initialized_cluster_is_managed_on_restart() {
        let volume = tempfile::tempdir().unwrap();
        let config = test_config("pg-1", volume.path());
        let telemetry = Telemetry::disabled("test");

        let registry = FakeRegistry::default();
        let prep = AdoptionController::new(&config, &registry, &telemetry)
            .prepare()
            .await
            .unwrap();
        assert_eq!(prep.mode, StartupMode::FreshInit);
        assert!(!config.coordination_marker().exists());

        // The orchestrator runs initdb and then the post-bootstrap hook.
        seed_database(&config.data_dir);
        bootstrap::complete(
            &AcceptingDatabase,
            &config.replication,
            &config.coordination_marker(),
        )
        .await
        .unwrap();

        let registry = FakeRegistry::default();
        let prep = AdoptionController::new(&config, &registry, &telemetry)
            .prepare()
            .await
            .unwrap();
        assert_eq!(prep.mode, StartupMode::Resume);
        assert!(!prep.ensure_replication_role);
        assert!(registry.cleared.lock().unwrap().is_empty());

        let registry = FakeRegistry {
            prior_state: true,
            ..Default::default()
        };
        let prep = AdoptionController::new(&config, &registry, &telemetry)
            .prepare()
            .await
            .unwrap();
        assert_eq!(prep.mode, StartupMode::Reclaim);
        assert!(!prep.ensure_replication_role);

        let hba = std::fs::read_to_string(config.data_dir.join("pg_hba.conf")).unwrap();
        assert_eq!(hba, "local all all trust\n");
    }
}
