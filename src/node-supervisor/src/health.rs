// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Consecutive-failure accounting for the orchestrator's health.

use std::time::Duration;

/// The supervised orchestrator's health, as far as the supervisor can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Within the startup grace period.
    Starting,
    /// The last probe after the grace period passed.
    Healthy,
    /// Some consecutive probes failed, but fewer than the threshold.
    Degraded {
        /// The number of consecutive failures.
        failures: u32,
    },
    /// The threshold was reached. The orchestrator must be restarted.
    Failed {
        /// The number of consecutive failures.
        failures: u32,
    },
}

/// The outcome of recording one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Nothing to do.
    Continue,
    /// The failure threshold was reached.
    Restart {
        /// The number of consecutive failures.
        failures: u32,
    },
}

/// Tracks consecutive probe failures once a startup grace period has
/// elapsed.
///
/// Failures observed within the grace period are never counted. A single
/// success resets the count.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    grace: Duration,
    max_failures: u32,
    failures: u32,
    state: ProcessState,
}

impl HealthTracker {
    /// Creates a tracker that ignores failures for `grace` after start and
    /// asks for a restart after `max_failures` consecutive failures.
    pub fn new(grace: Duration, max_failures: u32) -> HealthTracker {
        HealthTracker {
            grace,
            max_failures: max_failures.max(1),
            failures: 0,
            state: ProcessState::Starting,
        }
    }

    /// The current state.
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// The number of counted consecutive failures.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Records a probe result observed `elapsed` after the orchestrator
    /// started.
    pub fn record(&mut self, elapsed: Duration, healthy: bool) -> Verdict {
        if elapsed < self.grace {
            if healthy {
                self.failures = 0;
            }
            return Verdict::Continue;
        }
        if healthy {
            self.failures = 0;
            self.state = ProcessState::Healthy;
            return Verdict::Continue;
        }
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.max_failures {
            self.state = ProcessState::Failed {
                failures: self.failures,
            };
            Verdict::Restart {
                failures: self.failures,
            }
        } else {
            self.state = ProcessState::Degraded {
                failures: self.failures,
            };
            Verdict::Continue
        }
    }
}
