// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Shutdown signal handling.

use std::io;

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// The termination signals a control-plane binary reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// `SIGTERM`, as sent by container runtimes.
    Terminate,
    /// `SIGINT`, as sent by an interactive terminal.
    Interrupt,
}

/// Cancels `token` when the process receives `SIGTERM` or `SIGINT`.
///
/// The handlers are installed before this function returns, so signals that
/// arrive afterwards are never lost. The returned task resolves to the
/// signal that triggered cancellation, or to `None` if `token` was cancelled
/// by other means first.
pub fn shutdown_on_signal(
    token: CancellationToken,
) -> Result<tokio::task::JoinHandle<Option<ShutdownSignal>>, io::Error> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    Ok(tokio::spawn(async move {
        let received = tokio::select! {
            _ = sigterm.recv() => ShutdownSignal::Terminate,
            _ = sigint.recv() => ShutdownSignal::Interrupt,
            _ = token.cancelled() => return None,
        };
        info!(signal = ?received, "received shutdown signal");
        token.cancel();
        Some(received)
    }))
}
