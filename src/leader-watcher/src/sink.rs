// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Where leader identities are published.

use std::collections::BTreeMap;

use async_trait::async_trait;
use pgha_backboard::Client;

use crate::status::Leader;

/// A destination for the current leader's identity.
#[async_trait]
pub trait LeaderSink: Send + Sync {
    /// Publishes `leader`. Publishing the same leader twice has the same
    /// effect as publishing it once.
    async fn publish(&self, leader: &Leader) -> Result<(), anyhow::Error>;
}

/// Publishes the leader as backboard service variables.
#[derive(Debug, Clone)]
pub struct BackboardSink {
    client: Client,
    name_variable: String,
    address_variable: String,
}

impl BackboardSink {
    /// Creates a sink that writes the leader's name to `name_variable` and
    /// its address to `address_variable`.
    pub fn new(client: Client, name_variable: String, address_variable: String) -> BackboardSink {
        BackboardSink {
            client,
            name_variable,
            address_variable,
        }
    }

    /// The variables written for `leader`. The address is omitted when it
    /// is unknown.
    pub fn variables(&self, leader: &Leader) -> BTreeMap<String, String> {
        let mut variables = BTreeMap::from([(self.name_variable.clone(), leader.name.clone())]);
        if let Some(address) = &leader.address {
            variables.insert(self.address_variable.clone(), address.clone());
        }
        variables
    }
}

#[async_trait]
impl LeaderSink for BackboardSink {
    async fn publish(&self, leader: &Leader) -> Result<(), anyhow::Error> {
        self.client.upsert_variables(&self.variables(leader)).await?;
        Ok(())
    }
}
