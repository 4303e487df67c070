// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Static cluster configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use pgha_ore::marker::DurableMarker;
use pgha_registry_client::Member;
use url::Url;

/// The name of the bootstrap marker file inside the data directory.
pub const BOOTSTRAP_MARKER: &str = ".bootstrap_complete";

/// Errors in the static cluster configuration. These are never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The initial cluster is empty.
    #[error("initial cluster is empty")]
    EmptyCluster,
    /// An initial cluster entry is not of the form `name=url`.
    #[error("malformed initial cluster entry {0:?}: expected name=peer-url")]
    MalformedEntry(String),
    /// A peer URL does not parse or has no host.
    #[error("invalid peer URL {url:?} for {name}")]
    InvalidPeerUrl {
        /// The node the URL belongs to.
        name: String,
        /// The offending URL.
        url: String,
    },
    /// A node name appears twice.
    #[error("node {0} appears more than once in the initial cluster")]
    DuplicateName(String),
    /// The local node is not part of the initial cluster.
    #[error("node {0} is not listed in the initial cluster")]
    UnknownNode(String),
    /// A required value is empty.
    #[error("{0} must not be empty")]
    Empty(&'static str),
    /// The client port cannot form a loopback URL.
    #[error("invalid client port {0}")]
    InvalidClientPort(u16),
}

/// The static peer set, keyed and ordered by node name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialCluster {
    peers: BTreeMap<String, String>,
}

impl InitialCluster {
    /// A cluster made of the single node `name`.
    pub fn single(name: &str, peer_url: &str) -> InitialCluster {
        InitialCluster {
            peers: BTreeMap::from([(name.to_string(), peer_url.to_string())]),
        }
    }

    /// The cluster described by the registry's membership, with `name` added
    /// if it is not already listed.
    ///
    /// Members that have not started yet carry no name and are skipped,
    /// except for the local node, which is recognized by its peer URL.
    pub fn from_members(members: &[Member], name: &str, peer_url: &str) -> InitialCluster {
        let mut peers = BTreeMap::new();
        for member in members {
            if member.is_node(name, peer_url) || member.name.is_empty() {
                continue;
            }
            if let Some(url) = member.peer_urls.first() {
                peers.insert(member.name.clone(), url.trim_end_matches('/').to_string());
            }
        }
        peers.insert(name.to_string(), peer_url.to_string());
        InitialCluster { peers }
    }

    /// The deterministic bootstrap leader: the lexicographically first name.
    pub fn bootstrap_leader(&self) -> &str {
        self.peers
            .keys()
            .next()
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// The number of nodes.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Reports whether the cluster has no nodes.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Reports whether `name` is part of the cluster.
    pub fn contains(&self, name: &str) -> bool {
        self.peers.contains_key(name)
    }

    /// The peer URL of `name`.
    pub fn peer_url(&self, name: &str) -> Option<&str> {
        self.peers.get(name).map(String::as_str)
    }

    /// The client URL of `name`: its peer URL with the port replaced by
    /// `client_port`.
    pub fn client_url(&self, name: &str, client_port: u16) -> Option<Url> {
        let mut url = Url::parse(self.peer_url(name)?).ok()?;
        url.set_port(Some(client_port)).ok()?;
        Some(url)
    }

    /// Iterates over `(name, peer URL)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.peers.iter().map(|(n, u)| (n.as_str(), u.as_str()))
    }
}

impl fmt::Display for InitialCluster {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, (name, url)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{name}={url}")?;
        }
        Ok(())
    }
}

impl FromStr for InitialCluster {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut peers = BTreeMap::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, url) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::MalformedEntry(entry.into()))?;
            let (name, url) = (name.trim(), url.trim().trim_end_matches('/'));
            if name.is_empty() {
                return Err(ConfigError::MalformedEntry(entry.into()));
            }
            match Url::parse(url) {
                Ok(parsed) if parsed.host_str().is_some() => (),
                _ => {
                    return Err(ConfigError::InvalidPeerUrl {
                        name: name.into(),
                        url: url.into(),
                    });
                }
            }
            if peers.insert(name.to_string(), url.to_string()).is_some() {
                return Err(ConfigError::DuplicateName(name.into()));
            }
        }
        if peers.is_empty() {
            return Err(ConfigError::EmptyCluster);
        }
        Ok(InitialCluster { peers })
    }
}

/// Validated configuration of one registry node.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// The local node's name.
    pub name: String,
    /// The static peer set.
    pub initial_cluster: InitialCluster,
    /// The registry's data directory.
    pub data_dir: PathBuf,
    /// How many bootstrap attempts are made before giving up.
    pub max_attempts: usize,
    /// The pause between bootstrap attempts.
    pub retry_delay: Duration,
    /// How long a follower waits for a healthy peer within one attempt.
    pub peer_wait_timeout: Duration,
    /// How often a follower probes its peers while waiting.
    pub peer_check_interval: Duration,
    /// How often the background monitor polls local health.
    pub health_poll_interval: Duration,
    /// The registry client port, shared by all nodes.
    pub client_port: u16,
}

impl BootstrapConfig {
    /// Checks the configuration for internal consistency.
    pub fn validate(self) -> Result<BootstrapConfig, ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Empty("node name"));
        }
        if !self.initial_cluster.contains(&self.name) {
            return Err(ConfigError::UnknownNode(self.name));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Empty("max attempts"));
        }
        self.local_client_url()?;
        Ok(self)
    }

    /// The local node's peer URL.
    pub fn peer_url(&self) -> &str {
        self.initial_cluster.peer_url(&self.name).unwrap_or_default()
    }

    /// Reports whether the local node is the bootstrap leader.
    pub fn is_bootstrap_leader(&self) -> bool {
        self.initial_cluster.bootstrap_leader() == self.name
    }

    /// The bootstrap marker of the local data directory.
    pub fn marker(&self) -> DurableMarker {
        DurableMarker::in_dir(&self.data_dir, BOOTSTRAP_MARKER)
    }

    /// The loopback client URL of the local registry instance.
    pub fn local_client_url(&self) -> Result<Url, ConfigError> {
        if self.client_port == 0 {
            return Err(ConfigError::InvalidClientPort(self.client_port));
        }
        Url::parse(&format!("http://127.0.0.1:{}/", self.client_port))
            .map_err(|_| ConfigError::InvalidClientPort(self.client_port))
    }

    /// The client URLs of every other node, bootstrap leader first.
    pub fn peer_client_urls(&self) -> Vec<(String, Url)> {
        let leader = self.initial_cluster.bootstrap_leader();
        let mut names: Vec<&str> = self
            .initial_cluster
            .iter()
            .map(|(name, _)| name)
            .filter(|name| *name != self.name)
            .collect();
        names.sort_by_key(|name| *name != leader);
        names
            .into_iter()
            .filter_map(|name| {
                let url = self.initial_cluster.client_url(name, self.client_port)?;
                Some((name.to_string(), url))
            })
            .collect()
    }
}
