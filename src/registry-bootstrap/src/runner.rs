// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The bootstrap attempt loop.

use std::time::Duration;

use anyhow::Context;
use pgha_backboard::TelemetryEvent;
use pgha_ore::process;
use pgha_ore::retry::{INFO_MIN_RETRIES, Retry};
use pgha_ore::task;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::{BootstrapState, Coordinator};
use crate::launcher::RegistryLauncher;
use crate::membership::RegistryCluster;

/// How a run of the bootstrap loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The registry process exited successfully.
    Exited,
    /// A shutdown was requested and the registry process was stopped.
    Shutdown,
    /// Every attempt failed.
    RetriesExhausted {
        /// The number of attempts made.
        attempts: usize,
    },
}

enum Attempt {
    Done(Outcome),
    Failed(String),
}

/// Runs bootstrap attempts until the registry exits cleanly, a shutdown is
/// requested, or the attempts are exhausted.
#[derive(Debug)]
pub struct Runner<R, L> {
    coordinator: Coordinator<R>,
    launcher: L,
    termination_grace: Duration,
}

impl<R, L> Runner<R, L>
where
    R: RegistryCluster,
    L: RegistryLauncher,
{
    /// Creates a runner. A registry process that ignores `SIGTERM` is killed
    /// after `termination_grace`.
    pub fn new(coordinator: Coordinator<R>, launcher: L, termination_grace: Duration) -> Self {
        Runner {
            coordinator,
            launcher,
            termination_grace,
        }
    }

    /// The coordinator driving each attempt.
    pub fn coordinator(&self) -> &Coordinator<R> {
        &self.coordinator
    }

    /// Runs the loop. Errors are fatal conditions that retrying cannot fix.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<Outcome, anyhow::Error> {
        let config = self.coordinator.config();
        let leader = config.initial_cluster.bootstrap_leader();
        info!(
            node = %config.name,
            %leader,
            is_leader = config.is_bootstrap_leader(),
            "cluster bootstrap"
        );
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("creating {}", config.data_dir.display()))?;

        let mut retry = Retry::fixed(config.retry_delay, config.max_attempts).into_retry_stream();
        loop {
            let attempt = retry.attempt() + 1;
            info!(attempt, max = config.max_attempts, "starting registry");
            let error = match self.attempt(&shutdown).await? {
                Attempt::Done(outcome) => return Ok(outcome),
                Attempt::Failed(error) => error,
            };

            self.coordinator.set_state(BootstrapState::FailedRetry);
            if attempt > INFO_MIN_RETRIES {
                warn!(attempt, max = config.max_attempts, %error, "bootstrap attempt failed");
            } else {
                info!(attempt, max = config.max_attempts, %error, "bootstrap attempt failed");
            }
            self.coordinator
                .telemetry()
                .send(TelemetryEvent::RegistryStartupFailed {
                    node: config.name.clone(),
                    attempt,
                    max_attempts: config.max_attempts,
                    error,
                });

            if retry.exhausted() {
                return Ok(Outcome::RetriesExhausted { attempts: attempt });
            }
            debug!(delay = ?config.retry_delay, "retrying");
            retry = tokio::select! {
                next = retry.sleep() => next,
                _ = shutdown.cancelled() => return Ok(Outcome::Shutdown),
            };
        }
    }

    async fn attempt(&self, shutdown: &CancellationToken) -> Result<Attempt, anyhow::Error> {
        // A no-op once the marker exists.
        self.coordinator
            .clean_stale_data("incomplete bootstrap")
            .await?;

        let plan = tokio::select! {
            plan = self.coordinator.plan() => plan,
            _ = shutdown.cancelled() => return Ok(Attempt::Done(Outcome::Shutdown)),
        };
        let plan = match plan {
            Ok(plan) => plan,
            Err(e) => return Ok(Attempt::Failed(format!("{e:#}"))),
        };

        let config = self.coordinator.config();
        let mut child = self
            .launcher
            .launch(config, &plan)
            .context("spawning registry process")?;
        info!(pid = ?child.id(), "registry started");

        // Dropped, and therefore aborted, before the next attempt.
        let _monitor = task::spawn(
            "registry-monitor",
            self.coordinator.monitor(plan.joined_as_learner).run(),
        );

        let status = tokio::select! {
            status = child.wait() => status.context("waiting for registry process")?,
            _ = shutdown.cancelled() => {
                info!("stopping registry");
                let status = process::terminate(&mut child, self.termination_grace)
                    .await
                    .context("stopping registry process")?;
                info!(%status, "registry stopped");
                return Ok(Attempt::Done(Outcome::Shutdown));
            }
        };

        if status.success() {
            info!("registry exited cleanly");
            return Ok(Attempt::Done(Outcome::Exited));
        }
        if config.marker().exists() {
            info!("bootstrap complete; preserving data");
        }
        Ok(Attempt::Failed(format!("registry exited with {status}")))
    }
}
