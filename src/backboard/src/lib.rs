// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A client for the Railway backboard GraphQL API.
//!
//! Backboard is the external source of truth for service variables. The
//! control plane uses it for two things:
//!
//!  * The leader watcher publishes the identity of the current primary as
//!    service variables via [`Client::upsert_variables`].
//!  * Every binary reports notable lifecycle events through [`Telemetry`].
//!    Event delivery is best effort and never blocks the caller.

mod client;
mod config;
mod error;
mod telemetry;

pub use client::Client;
pub use config::{BackboardArgs, BackboardConfig, DEFAULT_ENDPOINT};
pub use error::Error;
pub use telemetry::{Telemetry, TelemetryEvent};
