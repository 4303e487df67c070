// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::time::Duration;

use url::Url;

use crate::client::Client;
use crate::error::Error;

/// The request timeout used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for a [`Client`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    endpoints: Vec<Url>,
    timeout: Duration,
}

impl ClientConfig {
    /// Constructs a new `ClientConfig` that will target the registry
    /// endpoints in the order given.
    pub fn new(endpoints: impl IntoIterator<Item = Url>) -> ClientConfig {
        ClientConfig {
            endpoints: endpoints.into_iter().collect(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets the timeout applied to every request, including connection
    /// establishment.
    pub fn timeout(mut self, timeout: Duration) -> ClientConfig {
        self.timeout = timeout;
        self
    }

    /// Builds the [`Client`].
    ///
    /// Fails if no endpoint was configured.
    pub fn build(self) -> Result<Client, Error> {
        if self.endpoints.is_empty() {
            return Err(Error::NoEndpoints);
        }
        let inner = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(self.timeout)
            .connect_timeout(self.timeout)
            .build()?;
        Ok(Client::new(inner, self.endpoints))
    }
}
