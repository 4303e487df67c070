// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;

use reqwest::StatusCode;

/// An error returned by the registry gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// The HTTP status code.
    pub status_code: StatusCode,
    /// The gRPC status code reported by the gateway, if any.
    pub code: Option<i64>,
    /// A detailed message about the error conditions.
    pub message: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (status {})", self.message, self.status_code)
    }
}

impl std::error::Error for ApiError {}

/// Errors returned by the [`Client`](crate::Client).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No endpoint was configured.
    #[error("no registry endpoints configured")]
    NoEndpoints,
    /// Every endpoint failed at the transport level. Holds the error from the
    /// last endpoint tried.
    #[error("registry unreachable at {endpoint}")]
    Transport {
        /// The last endpoint tried.
        endpoint: String,
        /// The transport error.
        #[source]
        source: reqwest::Error,
    },
    /// The gateway answered with an error.
    #[error("registry request failed: {0}")]
    Api(#[from] ApiError),
    /// The gateway's answer could not be decoded.
    #[error("decoding registry response: {0}")]
    Decode(String),
    /// The client could not be constructed.
    #[error("building registry client")]
    Build(#[from] reqwest::Error),
}

impl Error {
    /// Reports whether the error stems from the registry being unreachable
    /// or timing out, as opposed to the registry rejecting the request.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::Transport { .. })
            || matches!(self, Error::Api(e) if e.status_code.is_server_error() && e.code == Some(14))
    }
}

/// Errors returned by [`Client::member_promote`](crate::Client::member_promote).
#[derive(Debug, thiserror::Error)]
pub enum PromoteError {
    /// The member is already a voting member.
    #[error("member is not a learner")]
    NotLearner,
    /// The learner has not caught up with the leader yet.
    #[error("learner is not in sync with the leader")]
    NotReady,
    /// Any other failure.
    #[error(transparent)]
    Other(#[from] Error),
}

impl PromoteError {
    pub(crate) fn classify(err: Error) -> PromoteError {
        match &err {
            Error::Api(api) if api.message.contains("in sync with leader") => PromoteError::NotReady,
            Error::Api(api)
                if api.message.contains("can only promote a learner member")
                    || api.message.contains("is not a learner") =>
            {
                PromoteError::NotLearner
            }
            _ => PromoteError::Other(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(message: &str) -> Error {
        Error::Api(ApiError {
            status_code: StatusCode::BAD_REQUEST,
            code: Some(9),
            message: message.into(),
        })
    }

    #[test]
    fn promote_classification() {
        assert!(matches!(
            PromoteError::classify(api(
                "etcdserver: can only promote a learner member which is in sync with leader"
            )),
            PromoteError::NotReady
        ));
        assert!(matches!(
            PromoteError::classify(api("etcdserver: can only promote a learner member")),
            PromoteError::NotLearner
        ));
        assert!(matches!(
            PromoteError::classify(api("etcdserver: member not found")),
            PromoteError::Other(_)
        ));
    }
}
