// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use url::Url;

/// The default backboard GraphQL endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://backboard.railway.app/graphql/v2";

/// Configures a backboard [`Client`](crate::Client).
#[derive(Clone, PartialEq, Eq)]
pub struct BackboardConfig {
    /// The GraphQL endpoint.
    pub endpoint: Url,
    /// The bearer token used to authenticate mutations. Telemetry is sent
    /// unauthenticated when absent; variable upserts are refused.
    pub token: Option<String>,
    /// The project that owns the variables.
    pub project_id: String,
    /// The environment that owns the variables.
    pub environment_id: String,
    /// The service that owns the variables, or `None` for shared variables.
    pub service_id: Option<String>,
}

impl std::fmt::Debug for BackboardConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackboardConfig")
            .field("endpoint", &self.endpoint.as_str())
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("project_id", &self.project_id)
            .field("environment_id", &self.environment_id)
            .field("service_id", &self.service_id)
            .finish()
    }
}

/// Command-line arguments that locate backboard, for flattening into a
/// binary's own arguments.
#[derive(Debug, Clone, clap::Args)]
pub struct BackboardArgs {
    /// The backboard GraphQL endpoint.
    #[clap(long, env = "BACKBOARD_ENDPOINT", value_name = "URL", default_value = DEFAULT_ENDPOINT)]
    pub backboard_endpoint: Url,
    /// The bearer token used to authenticate with backboard.
    #[clap(long, env = "BACKBOARD_TOKEN", value_name = "TOKEN", hide_env_values = true)]
    pub backboard_token: Option<String>,
    /// The Railway project ID.
    #[clap(long, env = "RAILWAY_PROJECT_ID", value_name = "ID")]
    pub railway_project_id: Option<String>,
    /// The Railway environment ID.
    #[clap(long, env = "RAILWAY_ENVIRONMENT_ID", value_name = "ID")]
    pub railway_environment_id: Option<String>,
    /// The Railway service ID.
    #[clap(long, env = "RAILWAY_SERVICE_ID", value_name = "ID")]
    pub railway_service_id: Option<String>,
}

impl BackboardArgs {
    /// Returns the backboard configuration, or `None` if the project or
    /// environment is unknown.
    pub fn to_config(&self) -> Option<BackboardConfig> {
        let project_id = self.railway_project_id.clone().filter(|s| !s.is_empty())?;
        let environment_id = self
            .railway_environment_id
            .clone()
            .filter(|s| !s.is_empty())?;
        Some(BackboardConfig {
            endpoint: self.backboard_endpoint.clone(),
            token: self.backboard_token.clone().filter(|s| !s.is_empty()),
            project_id,
            environment_id,
            service_id: self.railway_service_id.clone().filter(|s| !s.is_empty()),
        })
    }
}
