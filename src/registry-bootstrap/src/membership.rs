// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Registry membership as seen by one node.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use pgha_registry_client::{ClientConfig, Error, Member, MemberAddResponse, MemberId, PromoteError};
use url::Url;

/// The membership operations the coordinator needs, addressed to a specific
/// registry endpoint.
///
/// There is deliberately no operation that adds a voting member: a node can
/// only become a voter by being promoted after it joined as a learner.
#[async_trait]
pub trait RegistryCluster: fmt::Debug + Send + Sync + 'static {
    /// Reports whether the registry member at `endpoint` is healthy.
    async fn is_healthy(&self, endpoint: &Url) -> bool;

    /// Lists the cluster's members.
    async fn member_list(&self, endpoint: &Url) -> Result<Vec<Member>, Error>;

    /// Adds a learner with the given peer URL.
    async fn add_learner(&self, endpoint: &Url, peer_url: &str) -> Result<MemberAddResponse, Error>;

    /// Promotes a learner to a voter.
    async fn promote(&self, endpoint: &Url, id: MemberId) -> Result<(), PromoteError>;

    /// Removes a member.
    async fn remove(&self, endpoint: &Url, id: MemberId) -> Result<(), Error>;
}

/// A [`RegistryCluster`] backed by the registry's HTTP gateway.
#[derive(Debug, Clone)]
pub struct HttpRegistry {
    timeout: Duration,
}

impl HttpRegistry {
    /// Creates a registry whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> HttpRegistry {
        HttpRegistry { timeout }
    }

    fn client(&self, endpoint: &Url) -> Result<pgha_registry_client::Client, Error> {
        ClientConfig::new([endpoint.clone()])
            .timeout(self.timeout)
            .build()
    }
}

#[async_trait]
impl RegistryCluster for HttpRegistry {
    async fn is_healthy(&self, endpoint: &Url) -> bool {
        match self.client(endpoint) {
            Ok(client) => client.is_healthy().await,
            Err(_) => false,
        }
    }

    async fn member_list(&self, endpoint: &Url) -> Result<Vec<Member>, Error> {
        self.client(endpoint)?.member_list().await
    }

    async fn add_learner(&self, endpoint: &Url, peer_url: &str) -> Result<MemberAddResponse, Error> {
        self.client(endpoint)?
            .member_add_learner(&[peer_url.to_string()])
            .await
    }

    async fn promote(&self, endpoint: &Url, id: MemberId) -> Result<(), PromoteError> {
        self.client(endpoint)?.member_promote(id).await?;
        Ok(())
    }

    async fn remove(&self, endpoint: &Url, id: MemberId) -> Result<(), Error> {
        self.client(endpoint)?.member_remove(id).await?;
        Ok(())
    }
}

/// A node's membership state. It only ever advances
/// `Absent → Learner → Voter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MembershipState {
    /// The node is not a member.
    Absent,
    /// The node is a non-voting learner.
    Learner,
    /// The node is a voting member.
    Voter,
}

/// An attempt to skip a membership state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid membership transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    /// The current state.
    pub from: MembershipState,
    /// The requested state.
    pub to: MembershipState,
}

impl MembershipState {
    /// The state of the node `name` with peer URL `peer_url` in `members`,
    /// along with its member entry.
    pub fn observe<'a>(members: &'a [Member], name: &str, peer_url: &str) -> (MembershipState, Option<&'a Member>) {
        match members.iter().find(|m| m.is_node(name, peer_url)) {
            None => (MembershipState::Absent, None),
            Some(m) if m.is_learner => (MembershipState::Learner, Some(m)),
            Some(m) => (MembershipState::Voter, Some(m)),
        }
    }

    /// Validates a transition to `to`. Staying in the same state is allowed;
    /// skipping a state or moving backwards is not.
    pub fn advance(self, to: MembershipState) -> Result<MembershipState, InvalidTransition> {
        use MembershipState::*;
        match (self, to) {
            (Absent, Absent) | (Absent, Learner) | (Learner, Learner) | (Learner, Voter) | (Voter, Voter) => Ok(to),
            _ => Err(InvalidTransition { from: self, to }),
        }
    }
}

impl fmt::Display for MembershipState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            MembershipState::Absent => "absent",
            MembershipState::Learner => "learner",
            MembershipState::Voter => "voter",
        })
    }
}
