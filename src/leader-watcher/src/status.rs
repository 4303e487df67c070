// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The orchestrator's cluster status document.

use std::fmt;

use serde::Deserialize;

/// The role of the member that holds the primary.
pub const LEADER_ROLE: &str = "leader";

/// The response of an orchestrator's `/cluster` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClusterStatus {
    /// Every member known to the orchestrator.
    #[serde(default)]
    pub members: Vec<ClusterMember>,
}

/// One member of a [`ClusterStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClusterMember {
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    /// The port reported by the orchestrator. The published address uses
    /// the configured database port instead.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub timeline: Option<u64>,
}

impl ClusterStatus {
    /// The member holding the primary, or `None` during an election.
    pub fn leader(&self) -> Option<&ClusterMember> {
        self.members.iter().find(|m| m.role == LEADER_ROLE)
    }
}

/// The identity of the primary, as published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leader {
    /// The node name.
    pub name: String,
    /// `host:port` of the node's database, if its host is known.
    pub address: Option<String>,
}

impl Leader {
    /// The leader described by `member`, reachable on `database_port`.
    pub fn from_member(member: &ClusterMember, database_port: u16) -> Leader {
        Leader {
            name: member.name.clone(),
            address: member
                .host
                .as_deref()
                .filter(|host| !host.is_empty())
                .map(|host| format!("{host}:{database_port}")),
        }
    }
}

impl fmt::Display for Leader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            Some(address) => write!(f, "{} ({address})", self.name),
            None => f.write_str(&self.name),
        }
    }
}
