// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Health probes against the orchestrator.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use url::Url;

/// A check of the orchestrator's health.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Reports whether the orchestrator is healthy.
    async fn probe(&self) -> bool;
}

/// Probes an HTTP endpoint. Any 2xx response is healthy; anything else,
/// including a timeout, is not.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: Url,
}

impl HttpProbe {
    /// Creates a probe of `url` whose requests time out after `timeout`.
    pub fn new(url: Url, timeout: Duration) -> Result<HttpProbe, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpProbe { client, url })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self) -> bool {
        match self.client.get(self.url.clone()).send().await {
            Ok(res) if res.status().is_success() => true,
            Ok(res) => {
                debug!(url = %self.url, status = %res.status(), "health probe failed");
                false
            }
            Err(e) => {
                debug!(url = %self.url, "health probe failed: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;

    use super::*;

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        addr
    }

    fn probe(addr: SocketAddr, path: &str) -> HttpProbe {
        let url = Url::parse(&format!("http://{addr}{path}")).unwrap();
        HttpProbe::new(url, Duration::from_millis(500)).unwrap()
    }

    #[tokio::test]
    async fn status_decides_health() {
        let addr = serve(
            Router::new()
                .route("/health", get(|| async { StatusCode::OK }))
                .route("/replica", get(|| async { StatusCode::SERVICE_UNAVAILABLE })),
        )
        .await;
        assert!(probe(addr, "/health").probe().await);
        assert!(!probe(addr, "/replica").probe().await);
    }

    #[tokio::test]
    async fn slow_endpoint_is_unhealthy() {
        let addr = serve(Router::new().route(
            "/health",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                StatusCode::OK
            }),
        ))
        .await;
        assert!(!probe(addr, "/health").probe().await);
    }

    #[tokio::test]
    async fn refused_connection_is_unhealthy() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(!probe(addr, "/health").probe().await);
    }
}
