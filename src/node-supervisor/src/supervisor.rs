// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The orchestrator's health loop.
//!
//! A process that is alive can still be wedged, so liveness alone is not
//! enough. Each tick checks that the process exists and then probes its
//! health endpoint. Consecutive probe failures past the startup grace period
//! are counted by a [`HealthTracker`]; once the threshold is reached the
//! orchestrator is stopped and the supervisor exits, leaving the restart to
//! the surrounding process manager. There is no restart within the loop.

use std::fmt;
use std::io;

use pgha_backboard::{Telemetry, TelemetryEvent};
use pgha_ore::process;
use tokio::process::Child;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HealthSettings;
use crate::health::{HealthTracker, Verdict};
use crate::probe::HealthProbe;

/// Why supervision ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The supervisor was asked to shut down and the orchestrator was
    /// stopped.
    Shutdown,
    /// The orchestrator exited on its own.
    ChildDied {
        /// The exit code, if the process was not killed by a signal.
        code: Option<i32>,
    },
    /// The orchestrator failed too many consecutive health probes and was
    /// stopped.
    Unhealthy {
        /// The number of consecutive failures.
        failures: u32,
    },
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exit::Shutdown => f.write_str("shut down on request"),
            Exit::ChildDied { code: Some(code) } => {
                write!(f, "orchestrator exited with code {code}")
            }
            Exit::ChildDied { code: None } => f.write_str("orchestrator was killed by a signal"),
            Exit::Unhealthy { failures } => write!(
                f,
                "orchestrator failed {failures} consecutive health checks"
            ),
        }
    }
}

/// Watches one orchestrator process.
#[derive(Debug)]
pub struct Supervisor<P> {
    node: String,
    probe: P,
    settings: HealthSettings,
    telemetry: Telemetry,
}

impl<P: HealthProbe> Supervisor<P> {
    /// Creates a supervisor for the orchestrator of `node`.
    pub fn new(
        node: impl Into<String>,
        probe: P,
        settings: HealthSettings,
        telemetry: Telemetry,
    ) -> Supervisor<P> {
        Supervisor {
            node: node.into(),
            probe,
            settings,
            telemetry,
        }
    }

    /// Supervises `child` until it dies, becomes unhealthy, or `shutdown` is
    /// cancelled. In every case the child has exited when this returns.
    pub async fn supervise(
        &self,
        mut child: Child,
        shutdown: CancellationToken,
    ) -> Result<Exit, io::Error> {
        let started = Instant::now();
        let pid = child.id();
        let mut tracker = HealthTracker::new(self.settings.startup_grace, self.settings.max_failures);
        let mut ticker = time::interval_at(started + self.settings.interval, self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            pid,
            interval = %humantime::format_duration(self.settings.interval),
            grace = %humantime::format_duration(self.settings.startup_grace),
            max_failures = self.settings.max_failures,
            "supervising orchestrator"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(pid, "forwarding shutdown to orchestrator");
                    let status = process::terminate(&mut child, self.settings.termination_grace).await?;
                    info!(%status, "orchestrator stopped");
                    return Ok(Exit::Shutdown);
                }
                status = child.wait() => {
                    return self.child_died(status?.code());
                }
                _ = ticker.tick() => (),
            }

            if let Some(pid) = pid {
                if !process::is_alive(pid) {
                    warn!(pid, "orchestrator process is gone");
                    let status = child.wait().await?;
                    return self.child_died(status.code());
                }
            }

            let elapsed = started.elapsed();
            let healthy = time::timeout(self.settings.timeout, self.probe.probe())
                .await
                .unwrap_or(false);
            match tracker.record(elapsed, healthy) {
                Verdict::Continue if healthy => debug!("orchestrator is healthy"),
                Verdict::Continue if elapsed < self.settings.startup_grace => {
                    debug!(
                        elapsed = %humantime::format_duration(elapsed),
                        "ignoring failed health check during startup grace period"
                    );
                }
                Verdict::Continue => warn!(
                    failures = tracker.failures(),
                    max_failures = self.settings.max_failures,
                    "orchestrator health check failed"
                ),
                Verdict::Restart { failures } => {
                    error!(failures, "orchestrator is unhealthy; stopping it");
                    self.telemetry.send(TelemetryEvent::HealthCheckFailed {
                        node: self.node.clone(),
                        consecutive_failures: failures,
                        max_failures: self.settings.max_failures,
                    });
                    process::terminate(&mut child, self.settings.termination_grace).await?;
                    return Ok(Exit::Unhealthy { failures });
                }
            }
        }
    }

    fn child_died(&self, code: Option<i32>) -> Result<Exit, io::Error> {
        error!(?code, "orchestrator exited");
        self.telemetry.send(TelemetryEvent::ProcessDied {
            node: self.node.clone(),
            process: "patroni".into(),
            exit_code: code,
        });
        Ok(Exit::ChildDied { code })
    }
}
