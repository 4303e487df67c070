// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Background health monitoring of the local registry instance.

use std::sync::Arc;

use anyhow::anyhow;
use pgha_backboard::{Telemetry, TelemetryEvent};
use pgha_registry_client::{Member, PromoteError};
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{BootstrapConfig, ConfigError};
use crate::coordinator::BootstrapState;
use crate::membership::{MembershipState, RegistryCluster};

/// The result of one monitor poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// The local instance is not healthy yet.
    Unhealthy,
    /// The local instance is healthy but not yet a voter.
    Pending(MembershipState),
    /// The marker is set and the node is a voter.
    Complete,
}

/// Watches a starting registry instance until it is a healthy voter.
///
/// The first healthy poll sets the bootstrap marker. While the node is a
/// learner every poll attempts to promote it; the monitor exits once the
/// node is a voter.
#[derive(Debug)]
pub struct Monitor<R> {
    config: Arc<BootstrapConfig>,
    registry: Arc<R>,
    telemetry: Telemetry,
    state: watch::Sender<BootstrapState>,
    joined_as_learner: bool,
}

impl<R: RegistryCluster> Monitor<R> {
    pub(crate) fn new(
        config: Arc<BootstrapConfig>,
        registry: Arc<R>,
        telemetry: Telemetry,
        state: watch::Sender<BootstrapState>,
        joined_as_learner: bool,
    ) -> Self {
        Monitor {
            config,
            registry,
            telemetry,
            state,
            joined_as_learner,
        }
    }

    /// Polls until the node is a healthy voter.
    pub async fn run(self) {
        let mut unhealthy_polls = 0usize;
        loop {
            time::sleep(self.config.health_poll_interval).await;
            match self.poll_once().await {
                Ok(PollStatus::Complete) => {
                    info!(node = %self.config.name, "registry member is a healthy voter");
                    return;
                }
                Ok(PollStatus::Unhealthy) => {
                    unhealthy_polls += 1;
                    if unhealthy_polls % 10 == 0 {
                        info!(polls = unhealthy_polls, "local registry not healthy yet");
                    } else {
                        debug!(polls = unhealthy_polls, "local registry not healthy yet");
                    }
                }
                Ok(PollStatus::Pending(state)) => {
                    debug!(%state, "waiting to become a voter");
                }
                Err(e) => warn!("registry monitor poll failed: {e:#}"),
            }
        }
    }

    /// Performs one poll.
    pub async fn poll_once(&self) -> Result<PollStatus, anyhow::Error> {
        let local = self.config.local_client_url()?;
        if !self.registry.is_healthy(&local).await {
            return Ok(PollStatus::Unhealthy);
        }

        let marker = self.config.marker();
        if marker.mark()? {
            info!(path = %marker.path().display(), "bootstrap marked complete");
        }

        let (state, member, endpoint) = self.observe().await?;
        match (state, member) {
            (MembershipState::Voter, _) => {
                self.set_state(BootstrapState::VoterHealthy);
                Ok(PollStatus::Complete)
            }
            (MembershipState::Learner, Some(member)) => {
                self.set_state(BootstrapState::Promoting);
                self.promote(&member, &endpoint).await
            }
            (state, _) => {
                warn!(node = %self.config.name, "healthy but not listed as a member");
                Ok(PollStatus::Pending(state))
            }
        }
    }

    async fn promote(&self, member: &Member, via: &Url) -> Result<PollStatus, anyhow::Error> {
        // A learner cannot promote itself, so prefer any other endpoint.
        let mut endpoints: Vec<Url> = self.peer_endpoints();
        endpoints.push(via.clone());
        endpoints.dedup();
        let mut last_err = None;
        for endpoint in &endpoints {
            match self.registry.promote(endpoint, member.id).await {
                Ok(()) => {
                    info!(node = %self.config.name, id = %member.id, "promoted to voter");
                    self.telemetry.send(TelemetryEvent::RegistryNodePromoted {
                        node: self.config.name.clone(),
                    });
                    self.set_state(BootstrapState::VoterHealthy);
                    return Ok(PollStatus::Complete);
                }
                Err(PromoteError::NotLearner) => {
                    debug!(id = %member.id, "already a voter");
                    self.set_state(BootstrapState::VoterHealthy);
                    return Ok(PollStatus::Complete);
                }
                Err(PromoteError::NotReady) => {
                    debug!(id = %member.id, "learner not yet in sync with leader");
                    return Ok(PollStatus::Pending(MembershipState::Learner));
                }
                Err(PromoteError::Other(e)) if e.is_unavailable() => {
                    debug!(%endpoint, "promotion endpoint unavailable: {e}");
                    last_err = Some(e);
                }
                Err(PromoteError::Other(e)) => return Err(e.into()),
            }
        }
        match last_err {
            Some(e) => Err(anyhow!(e).context("promoting learner")),
            None => Ok(PollStatus::Pending(MembershipState::Learner)),
        }
    }

    /// Observes the node's membership through the first endpoint that
    /// answers.
    async fn observe(&self) -> Result<(MembershipState, Option<Member>, Url), anyhow::Error> {
        let mut last_err = None;
        for endpoint in self.membership_endpoints()? {
            match self.registry.member_list(&endpoint).await {
                Ok(members) => {
                    let (state, member) =
                        MembershipState::observe(&members, &self.config.name, self.config.peer_url());
                    return Ok((state, member.cloned(), endpoint));
                }
                Err(e) => {
                    debug!(%endpoint, "member list failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(anyhow!(e).context("listing members")),
            None => Err(anyhow!("no registry endpoints")),
        }
    }

    /// The local endpoint comes first unless the node joined as a learner in
    /// which case the peers know more about it.
    fn membership_endpoints(&self) -> Result<Vec<Url>, ConfigError> {
        let local = self.config.local_client_url()?;
        let mut endpoints = self.peer_endpoints();
        if self.joined_as_learner {
            endpoints.push(local);
        } else {
            endpoints.insert(0, local);
        }
        Ok(endpoints)
    }

    fn peer_endpoints(&self) -> Vec<Url> {
        self.config
            .peer_client_urls()
            .into_iter()
            .map(|(_, url)| url)
            .collect()
    }

    fn set_state(&self, state: BootstrapState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(node = %self.config.name, from = ?previous, to = ?state, "bootstrap state changed");
        }
    }
}
