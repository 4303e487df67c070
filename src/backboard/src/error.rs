// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use reqwest::StatusCode;

/// Errors returned by the backboard [`Client`](crate::Client).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport error from the `reqwest` crate during a network request.
    #[error("network error during a backboard request: {0}")]
    Transport(#[from] reqwest::Error),
    /// Backboard answered with a non-success HTTP status.
    #[error("backboard returned status {status}: {body}")]
    Http {
        /// The HTTP status code.
        status: StatusCode,
        /// The response body, for diagnostics.
        body: String,
    },
    /// Backboard answered, but reported GraphQL errors.
    #[error("backboard rejected the request: {}", .0.join("; "))]
    GraphQl(Vec<String>),
    /// The response could not be decoded.
    #[error("decoding backboard response: {0}")]
    Decode(#[from] serde_json::Error),
    /// The operation requires a token and none was configured.
    #[error("no backboard token configured")]
    MissingToken,
}

impl Error {
    /// Reports whether retrying the request might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Http { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Error::GraphQl(_) | Error::Decode(_) | Error::MissingToken => false,
        }
    }
}
