// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Where cluster status documents come from.

use std::time::Duration;

use async_trait::async_trait;
use pgha_ore::error::ErrorExt;
use tracing::debug;
use url::Url;

use crate::status::ClusterStatus;

/// No status endpoint produced a document.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// There are no endpoints to ask.
    #[error("no status endpoints configured")]
    NoEndpoints,
    /// Every endpoint failed.
    #[error("all {} status endpoints failed: {}", .0.len(), .0.join("; "))]
    AllFailed(Vec<String>),
}

/// A source of cluster status documents.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Fetches the current cluster status.
    async fn fetch(&self) -> Result<ClusterStatus, FetchError>;
}

/// Fetches `/cluster` from a list of orchestrator endpoints.
///
/// Endpoints are tried in order and the first document wins. Documents are
/// not merged across endpoints.
#[derive(Debug, Clone)]
pub struct HttpStatusSource {
    client: reqwest::Client,
    endpoints: Vec<Url>,
}

impl HttpStatusSource {
    /// Creates a source over `endpoints`, the base URLs of the orchestrators'
    /// REST APIs. Each request times out after `timeout`.
    pub fn new(endpoints: Vec<Url>, timeout: Duration) -> Result<HttpStatusSource, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpStatusSource { client, endpoints })
    }

    async fn fetch_one(&self, endpoint: &Url) -> Result<ClusterStatus, String> {
        let url = endpoint
            .join("cluster")
            .map_err(|e| e.to_string_with_causes())?;
        let res = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string_with_causes())?;
        let status = res.status();
        if !status.is_success() {
            return Err(format!("status {status}"));
        }
        res.json().await.map_err(|e| e.to_string_with_causes())
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn fetch(&self) -> Result<ClusterStatus, FetchError> {
        if self.endpoints.is_empty() {
            return Err(FetchError::NoEndpoints);
        }
        let mut failures = vec![];
        for endpoint in &self.endpoints {
            match self.fetch_one(endpoint).await {
                Ok(status) => return Ok(status),
                Err(e) => {
                    debug!(%endpoint, "fetching cluster status failed: {e}");
                    failures.push(format!("{endpoint}: {e}"));
                }
            }
        }
        Err(FetchError::AllFailed(failures))
    }
}

/// Normalizes a status endpoint so that relative joins append to its path.
pub fn parse_endpoint(endpoint: &str) -> Result<Url, url::ParseError> {
    let endpoint = endpoint.trim();
    let mut url = if endpoint.contains("://") {
        Url::parse(endpoint)?
    } else {
        Url::parse(&format!("http://{endpoint}"))?
    };
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_are_normalized() {
        assert_eq!(
            parse_endpoint("pg-1.internal:8008").unwrap().as_str(),
            "http://pg-1.internal:8008/"
        );
        assert_eq!(
            parse_endpoint("https://pg-2.internal:8008/patroni")
                .unwrap()
                .join("cluster")
                .unwrap()
                .as_str(),
            "https://pg-2.internal:8008/patroni/cluster"
        );
        assert!(parse_endpoint("http://").is_err());
    }

    #[tokio::test]
    async fn no_endpoints() {
        let source = HttpStatusSource::new(vec![], Duration::from_secs(1)).unwrap();
        assert!(matches!(source.fetch().await, Err(FetchError::NoEndpoints)));
    }
}
