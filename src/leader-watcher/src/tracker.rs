// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Leader-change detection and publication bookkeeping.
//!
//! The tracker remembers the last leader it observed and, separately, the
//! last leader that was successfully published. A leader is published when
//! it differs from the last published one, so a failed publication is
//! retried on later ticks. Retries of a failed publication back off
//! exponentially; a successful publication or a new leader resets the
//! backoff. An unchanged leader is also re-published once per resync
//! interval.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::status::Leader;

/// What one poll of the cluster found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// A member holds the leader role.
    Leader(Leader),
    /// An endpoint answered, but no member holds the leader role.
    NoLeader,
    /// No endpoint answered.
    Unreachable,
}

/// A change of the observed leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderChange {
    /// The previously observed leader, if any.
    pub previous: Option<Leader>,
    /// The new leader.
    pub current: Leader,
}

/// What to do after an observation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Step {
    /// The observed leader changed.
    pub change: Option<LeaderChange>,
    /// This leader should be published now.
    pub publish: Option<Leader>,
}

/// How often an unchanged leader is re-published unless configured
/// otherwise.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Tracker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    /// The first retry delay after a failed publication.
    pub poll_interval: Duration,
    /// The longest retry delay.
    pub backoff_max: Duration,
    /// Consecutive unreachable polls after which the cluster is reported
    /// down.
    pub down_threshold: u32,
    /// Re-publish an unchanged leader this long after its last
    /// publication. `None` publishes changes only.
    pub resync_interval: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
struct Backoff {
    delay: Duration,
    next_attempt: Instant,
}

/// Tracks the observed and published leader.
#[derive(Debug)]
pub struct LeaderTracker {
    config: TrackerConfig,
    last_observed: Option<Leader>,
    last_published: Option<Leader>,
    last_published_at: Option<Instant>,
    backoff: Option<Backoff>,
    unreachable: u32,
}

impl LeaderTracker {
    /// Creates a tracker that has observed and published nothing.
    pub fn new(config: TrackerConfig) -> LeaderTracker {
        LeaderTracker {
            config,
            last_observed: None,
            last_published: None,
            last_published_at: None,
            backoff: None,
            unreachable: 0,
        }
    }

    /// The last observed leader.
    pub fn last_observed(&self) -> Option<&Leader> {
        self.last_observed.as_ref()
    }

    /// The last successfully published leader.
    pub fn last_published(&self) -> Option<&Leader> {
        self.last_published.as_ref()
    }

    /// The number of consecutive polls that reached no endpoint.
    pub fn consecutive_unreachable(&self) -> u32 {
        self.unreachable
    }

    /// Records an observation made at `now`.
    pub fn observe(&mut self, now: Instant, observation: Observation) -> Step {
        let leader = match observation {
            Observation::Unreachable => {
                self.unreachable = self.unreachable.saturating_add(1);
                if self.unreachable == self.config.down_threshold {
                    warn!(
                        polls = self.unreachable,
                        "cluster appears to be down: no status endpoint is reachable"
                    );
                } else {
                    debug!(polls = self.unreachable, "no status endpoint is reachable");
                }
                return Step::default();
            }
            Observation::NoLeader => {
                self.reachable();
                info!("no member holds the leader role; election in progress");
                return Step::default();
            }
            Observation::Leader(leader) => leader,
        };
        self.reachable();

        let mut step = Step::default();
        if self.last_observed.as_ref() != Some(&leader) {
            step.change = Some(LeaderChange {
                previous: self.last_observed.clone(),
                current: leader.clone(),
            });
            self.last_observed = Some(leader.clone());
            self.backoff = None;
        }

        let unpublished = self.last_published.as_ref() != Some(&leader);
        let resync_due = match (self.config.resync_interval, self.last_published_at) {
            (Some(interval), Some(at)) => now.saturating_duration_since(at) >= interval,
            _ => false,
        };
        let backoff_elapsed = self.backoff.is_none_or(|b| now >= b.next_attempt);
        if (unpublished || resync_due) && backoff_elapsed {
            step.publish = Some(leader);
        }
        step
    }

    /// Records that `leader` was published at `now`.
    pub fn publish_succeeded(&mut self, now: Instant, leader: Leader) {
        self.last_published = Some(leader);
        self.last_published_at = Some(now);
        self.backoff = None;
    }

    /// Records that a publication attempted at `now` failed. Returns the
    /// delay before the next attempt.
    pub fn publish_failed(&mut self, now: Instant) -> Duration {
        let delay = match self.backoff {
            None => self.config.poll_interval,
            Some(b) => b.delay.saturating_mul(2),
        }
        .min(self.config.backoff_max);
        self.backoff = Some(Backoff {
            delay,
            next_attempt: now + delay,
        });
        delay
    }

    fn reachable(&mut self) {
        if self.unreachable >= self.config.down_threshold {
            info!(polls = self.unreachable, "cluster is reachable again");
        }
        self.unreachable = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLL: Duration = Duration::from_secs(3);

    fn config() -> TrackerConfig {
        TrackerConfig {
            poll_interval: POLL,
            backoff_max: Duration::from_secs(20),
            down_threshold: 3,
            resync_interval: Some(DEFAULT_RESYNC_INTERVAL),
        }
    }

    fn leader(name: &str) -> Leader {
        Leader {
            name: name.into(),
            address: Some(format!("{name}.internal:5432")),
        }
    }

    /// Feeds `names` one poll apart, publishing successfully whenever asked.
    fn publications(tracker: &mut LeaderTracker, start: Instant, names: &[&str]) -> Vec<String> {
        let mut published = vec![];
        let mut now = start;
        for name in names {
            let step = tracker.observe(now, Observation::Leader(leader(name)));
            if let Some(l) = step.publish {
                published.push(l.name.clone());
                tracker.publish_succeeded(now, l);
            }
            now += POLL;
        }
        published
    }

    #[test]
    fn each_change_is_published_once() {
        let mut tracker = LeaderTracker::new(config());
        let published = publications(&mut tracker, Instant::now(), &["A", "A", "B", "B", "A"]);
        assert_eq!(published, vec!["A", "B", "A"]);
    }

    #[test]
    fn changes_are_reported_with_previous_leader() {
        let mut tracker = LeaderTracker::new(config());
        let now = Instant::now();
        let step = tracker.observe(now, Observation::Leader(leader("A")));
        assert_eq!(
            step.change,
            Some(LeaderChange {
                previous: None,
                current: leader("A"),
            })
        );
        let step = tracker.observe(now, Observation::Leader(leader("B")));
        assert_eq!(step.change.unwrap().previous, Some(leader("A")));
        let step = tracker.observe(now, Observation::Leader(leader("B")));
        assert_eq!(step.change, None);
    }

    #[test]
    fn failed_publication_retries_with_backoff() {
        let mut tracker = LeaderTracker::new(config());
        let start = Instant::now();
        let mut attempts = vec![];
        // Poll every 3s for a minute with the store down throughout.
        for poll in 0..20u32 {
            let now = start + POLL * poll;
            if tracker
                .observe(now, Observation::Leader(leader("A")))
                .publish
                .is_some()
            {
                attempts.push(poll);
                tracker.publish_failed(now);
            }
        }
        // Delays of 3s, 6s, 12s, then clamped at 20s.
        assert_eq!(attempts, vec![0, 1, 3, 7, 14]);
        assert_eq!(tracker.last_published(), None);
        assert_eq!(tracker.last_observed(), Some(&leader("A")));

        let now = start + POLL * 21;
        let l = tracker
            .observe(now, Observation::Leader(leader("A")))
            .publish
            .unwrap();
        tracker.publish_succeeded(now, l);
        assert_eq!(tracker.last_published(), Some(&leader("A")));
        assert_eq!(tracker.observe(now + POLL, Observation::Leader(leader("A"))).publish, None);
    }

    #[test]
    fn new_leader_skips_backoff() {
        let mut tracker = LeaderTracker::new(config());
        let now = Instant::now();
        assert!(tracker.observe(now, Observation::Leader(leader("A"))).publish.is_some());
        tracker.publish_failed(now);
        assert!(tracker.observe(now, Observation::Leader(leader("A"))).publish.is_none());
        assert!(tracker.observe(now, Observation::Leader(leader("B"))).publish.is_some());
    }

    #[test]
    fn elections_and_outages_change_nothing() {
        let mut tracker = LeaderTracker::new(config());
        let now = Instant::now();
        assert_eq!(publications(&mut tracker, now, &["A"]), vec!["A"]);
        for _ in 0..5 {
            assert_eq!(tracker.observe(now, Observation::Unreachable), Step::default());
        }
        assert_eq!(tracker.consecutive_unreachable(), 5);
        assert_eq!(tracker.observe(now, Observation::NoLeader), Step::default());
        assert_eq!(tracker.consecutive_unreachable(), 0);
        assert_eq!(tracker.observe(now, Observation::Leader(leader("A"))), Step::default());
    }

    #[test]
    fn resync_republishes_unchanged_leader() {
        let mut tracker = LeaderTracker::new(config());
        let start = Instant::now();
        let names = ["A"; 21];
        // Published at 0s, 30s and 60s.
        assert_eq!(publications(&mut tracker, start, &names), vec!["A", "A", "A"]);
    }

    #[test]
    fn changes_only_without_resync() {
        let mut tracker = LeaderTracker::new(TrackerConfig {
            resync_interval: None,
            ..config()
        });
        let names = ["A"; 21];
        assert_eq!(publications(&mut tracker, Instant::now(), &names), vec!["A"]);
    }
}
