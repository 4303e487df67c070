// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;
use std::time::Duration;

use pgha_ore::retry::Retry;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::BackboardConfig;
use crate::error::Error;
use crate::telemetry::TelemetryEvent;

/// The number of attempts made for each request before giving up.
const TRANSPORT_TRIES: usize = 3;

const UPSERT_VARIABLES: &str = "mutation variableCollectionUpsert($input: VariableCollectionUpsertInput!) { variableCollectionUpsert(input: $input) }";

const TELEMETRY_SEND: &str =
    "mutation telemetrySend($input: TelemetrySendInput!) { telemetrySend(input: $input) }";

#[derive(Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Value,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

/// A backboard API client.
#[derive(Debug, Clone)]
pub struct Client {
    inner: reqwest::Client,
    config: BackboardConfig,
    retry_backoff: Duration,
}

impl Client {
    /// Creates a client whose requests each time out after `timeout`.
    pub fn new(config: BackboardConfig, timeout: Duration) -> Result<Client, Error> {
        let inner = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()?;
        Ok(Client {
            inner,
            config,
            retry_backoff: Duration::from_millis(500),
        })
    }

    /// Sets the delay before the first retry of a failed request.
    pub fn retry_backoff(mut self, backoff: Duration) -> Client {
        self.retry_backoff = backoff;
        self
    }

    /// The configuration the client was built from.
    pub fn config(&self) -> &BackboardConfig {
        &self.config
    }

    async fn post_once(&self, body: &Value) -> Result<Value, Error> {
        let mut req = self.inner.post(self.config.endpoint.clone()).json(body);
        if let Some(token) = &self.config.token {
            req = req.bearer_auth(token);
        }
        let res = req.send().await?;
        let status = res.status();
        let bytes = res.bytes().await?;
        if !status.is_success() {
            return Err(Error::Http {
                status,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        let res: GraphQlResponse = serde_json::from_slice(&bytes)?;
        if !res.errors.is_empty() {
            return Err(Error::GraphQl(
                res.errors.into_iter().map(|e| e.message).collect(),
            ));
        }
        Ok(res.data)
    }

    /// Executes a GraphQL operation, retrying transport failures and server
    /// errors a small number of times.
    async fn graphql(&self, query: &str, variables: Value) -> Result<Value, Error> {
        let body = json!({ "query": query, "variables": variables });
        let body = &body;
        Retry::default()
            .initial_backoff(self.retry_backoff)
            .max_tries(TRANSPORT_TRIES)
            .retry_async(|state| async move {
                match self.post_once(body).await {
                    Err(e) if e.is_retryable() => {
                        if state.next_backoff.is_some() {
                            warn!(
                                attempt = state.i + 1,
                                max = TRANSPORT_TRIES,
                                "backboard request failed, retrying: {e}"
                            );
                        }
                        Err(e)
                    }
                    res => Ok(res),
                }
            })
            .await?
    }

    /// Creates or updates the given service variables.
    ///
    /// Variables not named in `variables` are left untouched, so repeating the
    /// same upsert is harmless.
    pub async fn upsert_variables(&self, variables: &BTreeMap<String, String>) -> Result<(), Error> {
        if self.config.token.is_none() {
            return Err(Error::MissingToken);
        }
        let mut input = json!({
            "projectId": self.config.project_id,
            "environmentId": self.config.environment_id,
            "variables": variables,
            "replace": false,
        });
        if let Some(service_id) = &self.config.service_id {
            input["serviceId"] = json!(service_id);
        }
        let data = self
            .graphql(UPSERT_VARIABLES, json!({ "input": input }))
            .await?;
        debug!(?data, names = ?variables.keys().collect::<Vec<_>>(), "upserted backboard variables");
        Ok(())
    }

    /// Reports a telemetry event.
    pub async fn send_telemetry(&self, component: &str, event: &TelemetryEvent) -> Result<(), Error> {
        let input = json!({
            "command": event.event_type(),
            "error": event.message(),
            "stacktrace": serde_json::to_string(event)?,
            "projectId": self.config.project_id,
            "environmentId": self.config.environment_id,
            "version": component,
        });
        self.graphql(TELEMETRY_SEND, json!({ "input": input }))
            .await?;
        Ok(())
    }
}
