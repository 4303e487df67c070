// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Tracks which database node holds the primary role and publishes it.
//!
//! The watcher runs outside the database nodes and shares no locks with
//! them. Each tick it asks the orchestrators for the cluster status, one
//! endpoint at a time, and publishes the leader's identity whenever it
//! differs from what was last published.

pub mod sink;
pub mod source;
pub mod status;
pub mod tracker;
pub mod watcher;

pub use sink::{BackboardSink, LeaderSink};
pub use source::{FetchError, HttpStatusSource, StatusSource};
pub use status::{ClusterMember, ClusterStatus, Leader};
pub use tracker::{LeaderTracker, Observation, TrackerConfig};
pub use watcher::Watcher;
