// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The watcher's polling loop.

use std::time::Duration;

use pgha_backboard::{Telemetry, TelemetryEvent};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::sink::LeaderSink;
use crate::source::StatusSource;
use crate::status::Leader;
use crate::tracker::{LeaderTracker, Observation, Step, TrackerConfig};

/// Polls a [`StatusSource`] and publishes leader changes to a
/// [`LeaderSink`].
///
/// Neither an unreachable cluster nor a failing sink stops the watcher.
#[derive(Debug)]
pub struct Watcher<S, K> {
    source: S,
    sink: K,
    tracker: LeaderTracker,
    poll_interval: Duration,
    database_port: u16,
    telemetry: Telemetry,
}

impl<S: StatusSource, K: LeaderSink> Watcher<S, K> {
    /// Creates a watcher. Published addresses use `database_port`.
    pub fn new(
        source: S,
        sink: K,
        config: TrackerConfig,
        database_port: u16,
        telemetry: Telemetry,
    ) -> Watcher<S, K> {
        Watcher {
            source,
            sink,
            tracker: LeaderTracker::new(config),
            poll_interval: config.poll_interval,
            database_port,
            telemetry,
        }
    }

    /// The tracker's view of the cluster.
    pub fn tracker(&self) -> &LeaderTracker {
        &self.tracker
    }

    /// Polls once and publishes if needed.
    pub async fn tick(&mut self) -> Step {
        let observation = match self.source.fetch().await {
            Ok(status) => match status.leader() {
                Some(member) => Observation::Leader(Leader::from_member(member, self.database_port)),
                None => Observation::NoLeader,
            },
            Err(e) => {
                warn!("fetching cluster status failed: {e}");
                Observation::Unreachable
            }
        };

        let step = self.tracker.observe(Instant::now(), observation);
        if let Some(change) = &step.change {
            match &change.previous {
                Some(previous) => info!(%previous, current = %change.current, "leader changed"),
                None => info!(current = %change.current, "observed leader"),
            }
            self.telemetry.send(TelemetryEvent::LeaderChanged {
                previous: change.previous.as_ref().map(|l| l.name.clone()),
                leader: change.current.name.clone(),
            });
        }
        if let Some(leader) = &step.publish {
            match self.sink.publish(leader).await {
                Ok(()) => {
                    info!(%leader, "published leader");
                    self.tracker.publish_succeeded(Instant::now(), leader.clone());
                }
                Err(e) => {
                    let delay = self.tracker.publish_failed(Instant::now());
                    warn!(
                        %leader,
                        retry_in = %humantime::format_duration(delay),
                        "publishing leader failed: {e:#}"
                    );
                }
            }
        }
        step
    }

    /// Polls until `shutdown` is cancelled.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        let mut ticker = time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval = %humantime::format_duration(self.poll_interval),
            "watching for leader changes"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => (),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.tick() => (),
            }
        }
        info!("leader watcher stopped");
    }
}
