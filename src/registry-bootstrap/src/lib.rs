// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Bootstraps one member of the etcd registry cluster.
//!
//! Starting every member of a static cluster at once deadlocks when members
//! come up at different times: no member can reach quorum until a majority
//! is running. Instead, the alphabetically first node (the bootstrap leader)
//! starts a single-member cluster, and every other node joins it as a
//! learner that is promoted to a voter once it is healthy.
//!
//! A durable marker in the data directory records that the node has been a
//! healthy member at least once. Without the marker, any data in the data
//! directory is the remnant of an incomplete bootstrap and is wiped before
//! each attempt; with the marker, data is never deleted.

#![warn(missing_docs)]

pub mod config;
pub mod coordinator;
pub mod launcher;
pub mod membership;
pub mod monitor;
pub mod runner;

pub use crate::config::{BOOTSTRAP_MARKER, BootstrapConfig, ConfigError, InitialCluster};
pub use crate::coordinator::{BootstrapPlan, BootstrapState, ClusterState, Coordinator};
pub use crate::launcher::{EtcdLauncher, RegistryLauncher};
pub use crate::membership::{HttpRegistry, MembershipState, RegistryCluster};
pub use crate::monitor::{Monitor, PollStatus};
pub use crate::runner::{Outcome, Runner};
