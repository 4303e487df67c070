// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Utilities for process-handling.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tracing::{info, warn};

/// Reports whether a process with the given PID exists.
///
/// A process that exists but belongs to another user counts as alive.
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Delivers `signal` to the process with the given PID.
pub fn send_signal(pid: u32, signal: Signal) -> Result<(), io::Error> {
    let raw = i32::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    signal::kill(Pid::from_raw(raw), signal).map_err(io::Error::from)
}

/// Terminates a child process.
///
/// Sends `SIGTERM` and waits up to `grace` for the child to exit, then sends
/// `SIGKILL` and reaps it. A child that already exited is reaped without
/// being signaled.
pub async fn terminate(child: &mut Child, grace: Duration) -> Result<ExitStatus, io::Error> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }
    if let Some(pid) = child.id() {
        match send_signal(pid, Signal::SIGTERM) {
            Ok(()) => info!(pid, "sent SIGTERM to child"),
            Err(e) => warn!(pid, "failed to send SIGTERM to child: {e}"),
        }
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(
                grace = %humantime::format_duration(grace),
                "child did not exit within grace period; sending SIGKILL"
            );
            child.kill().await?;
            child.wait().await
        }
    }
}
