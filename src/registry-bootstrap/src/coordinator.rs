// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Decides how the local registry instance joins the cluster.
//!
//! Every node independently computes the same bootstrap leader from the
//! static peer set. Without a bootstrap marker, the leader starts a brand-new
//! single-member cluster, which has quorum immediately, and every other node
//! joins it as a non-voting learner. A learner is promoted by the
//! [`Monitor`](crate::monitor::Monitor) once it is healthy.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, bail};
use pgha_backboard::{Telemetry, TelemetryEvent};
use pgha_ore::dir;
use pgha_registry_client::MemberId;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{BootstrapConfig, InitialCluster};
use crate::membership::{MembershipState, RegistryCluster};
use crate::monitor::Monitor;

/// The bootstrap state of the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    /// Nothing has been decided yet.
    Uninitialized,
    /// Starting a new single-member cluster as the bootstrap leader.
    LeaderBootstrap,
    /// Waiting for a healthy peer to join through.
    FollowerWait,
    /// Registered as a learner, registry starting.
    JoiningAsLearner,
    /// Healthy learner awaiting promotion.
    Promoting,
    /// Healthy voting member with a durable bootstrap marker.
    VoterHealthy,
    /// The last attempt failed and will be retried.
    FailedRetry,
}

/// The `initial-cluster-state` passed to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    /// Form a new cluster.
    New,
    /// Join a cluster that already exists.
    Existing,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ClusterState::New => "new",
            ClusterState::Existing => "existing",
        })
    }
}

/// How to start the local registry instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPlan {
    /// The initial cluster the instance is started with.
    pub initial_cluster: InitialCluster,
    /// Whether the cluster is new or existing.
    pub cluster_state: ClusterState,
    /// Whether the node was added as a learner during this attempt.
    pub joined_as_learner: bool,
}

/// Plans bootstrap attempts for the local node.
#[derive(Debug)]
pub struct Coordinator<R> {
    config: Arc<BootstrapConfig>,
    registry: Arc<R>,
    telemetry: Telemetry,
    state: watch::Sender<BootstrapState>,
}

impl<R: RegistryCluster> Coordinator<R> {
    /// Creates a coordinator for the node described by `config`.
    pub fn new(config: BootstrapConfig, registry: R, telemetry: Telemetry) -> Self {
        let (state, _) = watch::channel(BootstrapState::Uninitialized);
        Coordinator {
            config: Arc::new(config),
            registry: Arc::new(registry),
            telemetry,
            state,
        }
    }

    /// The node's configuration.
    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    /// The telemetry reporter.
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// The current bootstrap state.
    pub fn state(&self) -> BootstrapState {
        *self.state.borrow()
    }

    /// Subscribes to bootstrap state changes.
    pub fn subscribe(&self) -> watch::Receiver<BootstrapState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, state: BootstrapState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(node = %self.config.name, from = ?previous, to = ?state, "bootstrap state changed");
        }
    }

    /// A monitor for the registry instance started from the current plan.
    pub fn monitor(&self, joined_as_learner: bool) -> Monitor<R> {
        Monitor::new(
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
            self.telemetry.clone(),
            self.state.clone(),
            joined_as_learner,
        )
    }

    /// Wipes the data directory if it holds data but no bootstrap marker.
    ///
    /// Returns whether anything was wiped. Once the marker exists this never
    /// deletes anything.
    pub async fn clean_stale_data(&self, reason: &str) -> Result<bool, anyhow::Error> {
        let marker = self.config.marker();
        if marker.exists() {
            debug!(path = %self.config.data_dir.display(), "bootstrap marker present; preserving data");
            return Ok(false);
        }
        if !dir::has_entries(&self.config.data_dir).await? {
            return Ok(false);
        }
        info!(path = %self.config.data_dir.display(), %reason, "wiping registry data without bootstrap marker");
        let removed = dir::clear_directory(&self.config.data_dir, &[])
            .await
            .with_context(|| format!("clearing {}", self.config.data_dir.display()))?;
        debug!(entries = removed.len(), "registry data wiped");
        self.telemetry.send(TelemetryEvent::RegistryDataCleared {
            node: self.config.name.clone(),
            reason: reason.into(),
        });
        Ok(true)
    }

    /// Reports whether the local registry instance has write-ahead log
    /// entries.
    pub async fn has_local_data(&self) -> Result<bool, anyhow::Error> {
        let wal = self.config.data_dir.join("member").join("wal");
        Ok(dir::has_entries(&wal).await?)
    }

    /// Decides how to start the local registry instance.
    ///
    /// Returns an error if the attempt should be retried.
    pub async fn plan(&self) -> Result<BootstrapPlan, anyhow::Error> {
        if self.config.marker().exists() {
            info!(node = %self.config.name, "bootstrap marker present; rejoining existing cluster");
            return Ok(BootstrapPlan {
                initial_cluster: self.config.initial_cluster.clone(),
                cluster_state: ClusterState::Existing,
                joined_as_learner: false,
            });
        }
        if self.config.is_bootstrap_leader() {
            self.plan_as_leader().await
        } else {
            self.plan_as_follower().await
        }
    }

    async fn plan_as_leader(&self) -> Result<BootstrapPlan, anyhow::Error> {
        let name = &self.config.name;
        if let Some((peer, endpoint)) = self.find_healthy_peer().await {
            warn!(node = %name, %peer, "bootstrap leader has no marker but a peer is healthy; rejoining existing cluster");
            self.telemetry.send(TelemetryEvent::RegistryRecoveryMode {
                node: name.clone(),
                reason: format!("bootstrap leader data lost, cluster alive at {peer}"),
            });
            if let Err(e) = self.remove_stale_self(&endpoint).await {
                warn!("failed to remove stale member entry, continuing: {e:#}");
            }
            let initial_cluster = self.join_as_learner(&endpoint).await?;
            return Ok(BootstrapPlan {
                initial_cluster,
                cluster_state: ClusterState::Existing,
                joined_as_learner: true,
            });
        }

        self.set_state(BootstrapState::LeaderBootstrap);
        let initial_cluster = InitialCluster::single(name, self.config.peer_url());
        info!(node = %name, cluster = %initial_cluster, "bootstrapping single-member cluster");
        self.telemetry.send(TelemetryEvent::RegistryBootstrap {
            node: name.clone(),
            is_leader: true,
            cluster_size: self.config.initial_cluster.len(),
        });
        Ok(BootstrapPlan {
            initial_cluster,
            cluster_state: ClusterState::New,
            joined_as_learner: false,
        })
    }

    async fn plan_as_follower(&self) -> Result<BootstrapPlan, anyhow::Error> {
        self.set_state(BootstrapState::FollowerWait);
        let (peer, endpoint) = self.wait_for_healthy_peer().await?;
        info!(node = %self.config.name, via = %peer, "joining existing cluster");
        let initial_cluster = self.join_as_learner(&endpoint).await?;
        Ok(BootstrapPlan {
            initial_cluster,
            cluster_state: ClusterState::Existing,
            joined_as_learner: true,
        })
    }

    /// Probes every other node once, bootstrap leader first, and returns the
    /// first healthy one.
    async fn find_healthy_peer(&self) -> Option<(String, Url)> {
        for (peer, endpoint) in self.config.peer_client_urls() {
            if self.registry.is_healthy(&endpoint).await {
                debug!(%peer, %endpoint, "found healthy peer");
                return Some((peer, endpoint));
            }
            debug!(%peer, %endpoint, "peer not healthy");
        }
        None
    }

    /// Waits up to the configured peer wait timeout for any peer to become
    /// healthy.
    async fn wait_for_healthy_peer(&self) -> Result<(String, Url), anyhow::Error> {
        let leader = self.config.initial_cluster.bootstrap_leader();
        info!(%leader, timeout = %humantime::format_duration(self.config.peer_wait_timeout), "waiting for bootstrap leader or any healthy peer");
        let deadline = Instant::now() + self.config.peer_wait_timeout;
        loop {
            if let Some(found) = self.find_healthy_peer().await {
                return Ok(found);
            }
            let now = Instant::now();
            if now >= deadline {
                bail!(
                    "no healthy peer within {}",
                    humantime::format_duration(self.config.peer_wait_timeout)
                );
            }
            debug!(remaining = ?deadline - now, "no healthy peer yet");
            time::sleep(self.config.peer_check_interval.min(deadline - now)).await;
        }
    }

    /// Removes the local node's member entry, if any, through `endpoint`.
    async fn remove_stale_self(&self, endpoint: &Url) -> Result<Option<MemberId>, anyhow::Error> {
        let members = self.registry.member_list(endpoint).await?;
        let (_, member) = MembershipState::observe(&members, &self.config.name, self.config.peer_url());
        let Some(member) = member else {
            debug!("no stale member entry");
            return Ok(None);
        };
        let id = member.id;
        info!(%id, "removing stale member entry");
        self.registry.remove(endpoint, id).await?;
        self.telemetry.send(TelemetryEvent::RegistryStaleMemberRemoved {
            node: self.config.name.clone(),
            removed_id: id.to_string(),
        });
        Ok(Some(id))
    }

    /// Registers the local node as a learner through `endpoint` and returns
    /// the initial cluster to start the registry with.
    ///
    /// Joining is idempotent: if the node is already listed and either has
    /// never started or still has its data, the existing entry is reused. An
    /// entry for a node that has started before but lost its data is stale;
    /// it is removed and the node is added again.
    pub async fn join_as_learner(&self, endpoint: &Url) -> Result<InitialCluster, anyhow::Error> {
        let name = &self.config.name;
        let peer_url = self.config.peer_url();
        let members = self
            .registry
            .member_list(endpoint)
            .await
            .with_context(|| format!("listing members via {endpoint}"))?;

        let (mut state, member) = MembershipState::observe(&members, name, peer_url);
        if let Some(member) = member {
            let started = !member.name.is_empty();
            if !started || self.has_local_data().await? {
                info!(node = %name, %state, id = %member.id, "already a member; reusing entry");
                self.set_state(BootstrapState::JoiningAsLearner);
                return Ok(InitialCluster::from_members(&members, name, peer_url));
            }
            warn!(node = %name, id = %member.id, "listed as a member but no local data; removing stale entry");
            let id = member.id;
            self.registry
                .remove(endpoint, id)
                .await
                .with_context(|| format!("removing stale member {id}"))?;
            self.telemetry.send(TelemetryEvent::RegistryStaleMemberRemoved {
                node: name.clone(),
                removed_id: id.to_string(),
            });
            self.clean_stale_data("stale member entry removed").await?;
            state = MembershipState::Absent;
        }

        let added = self
            .registry
            .add_learner(endpoint, peer_url)
            .await
            .with_context(|| format!("adding {name} as learner via {endpoint}"))?;
        let joined = if added.member.is_learner {
            MembershipState::Learner
        } else {
            MembershipState::Voter
        };
        state
            .advance(joined)
            .with_context(|| format!("registry added {name} as a {joined}"))?;
        info!(node = %name, id = %added.member.id, "added as learner");
        self.set_state(BootstrapState::JoiningAsLearner);
        self.telemetry.send(TelemetryEvent::RegistryNodeJoined {
            node: name.clone(),
            joined_as: MembershipState::Learner.to_string(),
        });
        let members = if added.members.is_empty() {
            vec![added.member]
        } else {
            added.members
        };
        Ok(InitialCluster::from_members(&members, name, peer_url))
    }
}
