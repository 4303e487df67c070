// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Tokio task utilities.

use std::future::Future;

use tokio_util::task::AbortOnDropHandle;
use tracing::{Instrument, info_span};

/// Spawns a named background task.
///
/// The task runs inside a span carrying `name`, so its log lines can be told
/// apart from the foreground loop. Dropping the returned handle aborts the
/// task.
pub fn spawn<Fut>(name: &str, future: Fut) -> AbortOnDropHandle<Fut::Output>
where
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    let span = info_span!("task", name = %name);
    AbortOnDropHandle::new(tokio::spawn(future.instrument(span)))
}
