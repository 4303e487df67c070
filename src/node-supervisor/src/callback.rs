// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The orchestrator's role-change callback.
//!
//! The orchestrator runs the callback as `<program> <action> <role> <scope>`.

use pgha_backboard::TelemetryEvent;

/// The action name of role-change invocations.
pub const ON_ROLE_CHANGE: &str = "on_role_change";

/// A role change reported by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleChange {
    /// The node's new role.
    pub role: String,
    /// The cluster name.
    pub scope: String,
}

impl RoleChange {
    /// Parses the callback arguments, without the program name. Returns
    /// `None` for actions other than [`ON_ROLE_CHANGE`].
    pub fn from_args<I, S>(args: I) -> Option<RoleChange>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = args.into_iter().map(Into::into);
        if args.next()? != ON_ROLE_CHANGE {
            return None;
        }
        Some(RoleChange {
            role: args.next().unwrap_or_default(),
            scope: args.next().unwrap_or_default(),
        })
    }

    /// Reports whether the node became the primary.
    pub fn is_promotion(&self) -> bool {
        matches!(self.role.as_str(), "primary" | "master")
    }

    /// The telemetry event describing the change on `node`.
    pub fn to_event(&self, node: &str) -> TelemetryEvent {
        if self.is_promotion() {
            TelemetryEvent::Failover {
                node: node.to_string(),
                new_role: self.role.clone(),
                scope: self.scope.clone(),
            }
        } else {
            TelemetryEvent::Rejoined {
                node: node.to_string(),
                role: self.role.clone(),
                scope: self.scope.clone(),
            }
        }
    }
}
