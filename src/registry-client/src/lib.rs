// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! An API client for the etcd v3 JSON gateway.
//!
//! Only the subset of the API needed to bootstrap a registry cluster and to
//! clear coordination state is implemented: cluster health, membership
//! (list, learner add, promote, remove) and prefix range reads and deletes.
//!
//! Every request is bounded by the timeout configured on [`ClientConfig`].
//! When several endpoints are configured they are tried in order and the
//! first one that answers is used.

#![warn(missing_docs)]

mod client;
mod config;
mod error;
mod keys;
mod member;

pub use client::{Client, MemberAddResponse};
pub use config::{ClientConfig, DEFAULT_TIMEOUT};
pub use error::{ApiError, Error, PromoteError};
pub use keys::prefix_range_end;
pub use member::{Member, MemberId};
