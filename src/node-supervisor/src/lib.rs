// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Supervision of a database node's HA orchestrator.
//!
//! Startup runs in a fixed order:
//!
//!  1. The node's identity is resolved from configuration ([`config`]).
//!  2. The on-disk and registry state are classified and the data directory
//!     is prepared for the selected mode ([`adoption`]).
//!  3. The orchestrator's configuration file is written ([`patroni`]) and
//!     the orchestrator is launched with an explicit environment
//!     ([`child`]).
//!  4. On the node that initializes a new cluster, the orchestrator runs
//!     the post-bootstrap hook, which marks the data as managed
//!     ([`bootstrap`]).
//!  5. The health loop runs until the orchestrator dies, wedges, or the
//!     supervisor is asked to stop ([`supervisor`]).

#![warn(missing_docs)]

pub mod adoption;
pub mod bootstrap;
pub mod callback;
pub mod child;
pub mod config;
pub mod health;
pub mod patroni;
pub mod probe;
pub mod replication;
pub mod supervisor;

pub use adoption::{AdoptionController, StartupMode};
pub use config::{SupervisorArgs, SupervisorConfig};
pub use supervisor::{Exit, Supervisor};
