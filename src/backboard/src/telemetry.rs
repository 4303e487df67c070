// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Best-effort lifecycle event reporting.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::config::BackboardArgs;

/// The maximum number of undelivered events. Once this limit is reached,
/// new events will be dropped.
const MAX_PENDING_EVENTS: usize = 256;

/// A notable lifecycle event of a control-plane component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TelemetryEvent {
    /// A registry node started bootstrapping.
    RegistryBootstrap {
        node: String,
        is_leader: bool,
        cluster_size: usize,
    },
    /// A registry node joined an existing cluster.
    RegistryNodeJoined { node: String, joined_as: String },
    /// A registry learner was promoted to a voting member.
    RegistryNodePromoted { node: String },
    /// A stale membership entry was removed.
    RegistryStaleMemberRemoved { node: String, removed_id: String },
    /// Local registry data was wiped.
    RegistryDataCleared { node: String, reason: String },
    /// The bootstrap leader found a surviving cluster and is rejoining it.
    RegistryRecoveryMode { node: String, reason: String },
    /// A bootstrap attempt failed and will be retried.
    RegistryStartupFailed {
        node: String,
        attempt: usize,
        max_attempts: usize,
        error: String,
    },
    /// A database node was promoted to primary.
    Failover {
        node: String,
        new_role: String,
        scope: String,
    },
    /// A database node rejoined the cluster as a replica.
    Rejoined {
        node: String,
        role: String,
        scope: String,
    },
    /// The orchestrator failed a health probe after its grace period.
    HealthCheckFailed {
        node: String,
        consecutive_failures: u32,
        max_failures: u32,
    },
    /// A supervised process exited on its own.
    ProcessDied {
        node: String,
        process: String,
        exit_code: Option<i32>,
    },
    /// The adoption controller picked a startup mode.
    StartupModeSelected { node: String, mode: String },
    /// A new database cluster finished initializing.
    BootstrapCompleted { node: String, duration_ms: u64 },
    /// The leader watcher observed a new primary.
    LeaderChanged {
        previous: Option<String>,
        leader: String,
    },
}

impl TelemetryEvent {
    /// The event type name reported to backboard.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RegistryBootstrap { .. } => "REGISTRY_BOOTSTRAP",
            Self::RegistryNodeJoined { .. } => "REGISTRY_NODE_JOINED",
            Self::RegistryNodePromoted { .. } => "REGISTRY_NODE_PROMOTED",
            Self::RegistryStaleMemberRemoved { .. } => "REGISTRY_STALE_MEMBER_REMOVED",
            Self::RegistryDataCleared { .. } => "REGISTRY_DATA_CLEARED",
            Self::RegistryRecoveryMode { .. } => "REGISTRY_RECOVERY_MODE",
            Self::RegistryStartupFailed { .. } => "REGISTRY_STARTUP_FAILED",
            Self::Failover { .. } => "POSTGRES_HA_FAILOVER",
            Self::Rejoined { .. } => "POSTGRES_HA_REJOINED",
            Self::HealthCheckFailed { .. } => "POSTGRES_HA_HEALTH_CHECK_FAILED",
            Self::ProcessDied { .. } => "POSTGRES_HA_PROCESS_DIED",
            Self::StartupModeSelected { .. } => "POSTGRES_HA_STARTUP_MODE",
            Self::BootstrapCompleted { .. } => "POSTGRES_HA_BOOTSTRAP_COMPLETED",
            Self::LeaderChanged { .. } => "POSTGRES_HA_LEADER_CHANGED",
        }
    }

    /// A one-line human-readable description.
    pub fn message(&self) -> String {
        match self {
            Self::RegistryBootstrap {
                node,
                is_leader,
                cluster_size,
            } => format!("registry bootstrap on {node} (leader={is_leader}, size={cluster_size})"),
            Self::RegistryNodeJoined { node, joined_as } => {
                format!("registry node {node} joined as {joined_as}")
            }
            Self::RegistryNodePromoted { node } => {
                format!("registry node {node} promoted to voting member")
            }
            Self::RegistryStaleMemberRemoved { node, removed_id } => {
                format!("registry node {node} removed stale member {removed_id}")
            }
            Self::RegistryDataCleared { node, reason } => {
                format!("registry node {node} cleared its data: {reason}")
            }
            Self::RegistryRecoveryMode { node, reason } => {
                format!("registry node {node} entering recovery: {reason}")
            }
            Self::RegistryStartupFailed {
                node,
                attempt,
                max_attempts,
                error,
            } => format!("registry node {node} startup failed ({attempt}/{max_attempts}): {error}"),
            Self::Failover { node, new_role, .. } => format!("{node} promoted to {new_role}"),
            Self::Rejoined { node, role, .. } => format!("{node} rejoined as {role}"),
            Self::HealthCheckFailed {
                node,
                consecutive_failures,
                max_failures,
            } => format!("health check failed on {node} ({consecutive_failures}/{max_failures})"),
            Self::ProcessDied {
                node,
                process,
                exit_code,
            } => match exit_code {
                Some(code) => format!("{process} died on {node} (exit code {code})"),
                None => format!("{process} died on {node} (killed by signal)"),
            },
            Self::StartupModeSelected { node, mode } => {
                format!("{node} starting in mode {mode}")
            }
            Self::BootstrapCompleted { node, duration_ms } => {
                format!("{node} initialized a new cluster in {duration_ms}ms")
            }
            Self::LeaderChanged { previous, leader } => match previous {
                Some(previous) => format!("leader changed from {previous} to {leader}"),
                None => format!("leader is {leader}"),
            },
        }
    }
}

/// A best-effort telemetry reporter.
///
/// Every event is logged locally. When backboard is configured, events are
/// additionally queued for delivery by a background task. Delivery is best
/// effort: events may be dropped when the queue is full, and errors are
/// logged but not returned.
#[derive(Clone)]
pub struct Telemetry {
    component: Arc<str>,
    tx: Option<Sender<TelemetryEvent>>,
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry")
            .field("component", &self.component)
            .field("enabled", &self.tx.is_some())
            .finish()
    }
}

impl Telemetry {
    /// Creates a reporter that delivers events through `client`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(component: &str, client: Client) -> Telemetry {
        let (tx, rx) = mpsc::channel(MAX_PENDING_EVENTS);
        let component: Arc<str> = Arc::from(component);
        let send_task = SendTask {
            component: Arc::clone(&component),
            client,
        };
        tokio::spawn(async move { send_task.run(rx).await });
        Telemetry {
            component,
            tx: Some(tx),
        }
    }

    /// Creates a reporter that only logs events locally.
    pub fn disabled(component: &str) -> Telemetry {
        Telemetry {
            component: Arc::from(component),
            tx: None,
        }
    }

    /// Creates a reporter from command-line arguments. Falls back to a
    /// disabled reporter when backboard is not configured or its client
    /// cannot be built.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_args(component: &str, args: &BackboardArgs, timeout: Duration) -> Telemetry {
        let Some(config) = args.to_config() else {
            debug!(component, "backboard not configured; telemetry is local only");
            return Telemetry::disabled(component);
        };
        match Client::new(config, timeout) {
            Ok(client) => Telemetry::new(component, client),
            Err(e) => {
                warn!(component, "building telemetry client failed, telemetry is local only: {e}");
                Telemetry::disabled(component)
            }
        }
    }

    /// Reports an event. Never blocks.
    pub fn send(&self, event: TelemetryEvent) {
        info!(
            component = %self.component,
            event = event.event_type(),
            "{}",
            event.message()
        );
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => (),
            Err(TrySendError::Closed(_)) => debug!("telemetry task has shut down"),
            Err(TrySendError::Full(_)) => {
                warn!("dropping telemetry event because queue is full");
            }
        }
    }
}

struct SendTask {
    component: Arc<str>,
    client: Client,
}

impl SendTask {
    async fn run(&self, mut rx: Receiver<TelemetryEvent>) {
        while let Some(event) = rx.recv().await {
            if let Err(e) = self.client.send_telemetry(&self.component, &event).await {
                warn!(event = event.event_type(), "failed to deliver telemetry event: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tagged() {
        let event = TelemetryEvent::RegistryNodePromoted {
            node: "etcd-2".into(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({"type": "RegistryNodePromoted", "node": "etcd-2"})
        );
        assert_eq!(event.event_type(), "REGISTRY_NODE_PROMOTED");
    }

    #[test]
    fn messages() {
        assert_eq!(
            TelemetryEvent::LeaderChanged {
                previous: Some("pg-1".into()),
                leader: "pg-2".into(),
            }
            .message(),
            "leader changed from pg-1 to pg-2"
        );
        assert_eq!(
            TelemetryEvent::ProcessDied {
                node: "pg-1".into(),
                process: "patroni".into(),
                exit_code: None,
            }
            .message(),
            "patroni died on pg-1 (killed by signal)"
        );
    }

    #[test]
    fn disabled_only_logs() {
        let telemetry = Telemetry::disabled("test");
        telemetry.send(TelemetryEvent::RegistryNodePromoted {
            node: "etcd-1".into(),
        });
        assert!(format!("{telemetry:?}").contains("enabled: false"));
    }
}
