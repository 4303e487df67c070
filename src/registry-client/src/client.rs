// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use futures::future;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::error::{ApiError, Error, PromoteError};
use crate::keys::{encode, prefix_range_end};
use crate::member::{Member, MemberId, deserialize_count};

/// An API client for the registry's JSON gateway.
///
/// Construct it with a [`ClientConfig`](crate::ClientConfig).
#[derive(Debug, Clone)]
pub struct Client {
    inner: reqwest::Client,
    endpoints: Vec<Url>,
}

/// The registry's answer to a learner add.
#[derive(Debug, Clone, Deserialize)]
pub struct MemberAddResponse {
    /// The member that was added.
    pub member: Member,
    /// The full membership after the add, including the new member.
    #[serde(default)]
    pub members: Vec<Member>,
}

#[derive(Deserialize)]
struct HealthResponse {
    health: String,
    #[serde(default)]
    reason: String,
}

#[derive(Deserialize)]
struct MembersResponse {
    #[serde(default)]
    members: Vec<Member>,
}

#[derive(Serialize)]
struct MemberAddRequest<'a> {
    #[serde(rename = "peerURLs")]
    peer_urls: &'a [String],
    #[serde(rename = "isLearner")]
    is_learner: bool,
}

#[derive(Serialize)]
struct MemberIdRequest {
    #[serde(rename = "ID")]
    id: MemberId,
}

#[derive(Serialize)]
struct RangeRequest {
    key: String,
    range_end: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    count_only: bool,
}

#[derive(Deserialize)]
struct RangeResponse {
    #[serde(default, deserialize_with = "deserialize_count")]
    count: u64,
}

#[derive(Deserialize)]
struct DeleteRangeResponse {
    #[serde(default, deserialize_with = "deserialize_count")]
    deleted: u64,
}

#[derive(Deserialize)]
struct GatewayError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
    code: Option<i64>,
}

impl Client {
    pub(crate) fn new(inner: reqwest::Client, endpoints: Vec<Url>) -> Self {
        Client { inner, endpoints }
    }

    /// The endpoints this client targets, in the order they are tried.
    pub fn endpoints(&self) -> &[Url] {
        &self.endpoints
    }

    /// Sends a request to each endpoint in turn, returning the first answer
    /// regardless of its status.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<(StatusCode, Vec<u8>), Error> {
        let mut last_err = None;
        for endpoint in &self.endpoints {
            let url = format!("{}/{}", endpoint.as_str().trim_end_matches('/'), path);
            let mut req = self.inner.request(method.clone(), &url);
            if let Some(body) = body {
                req = req.json(body);
            }
            let res = match req.send().await {
                Ok(res) => res,
                Err(e) => {
                    debug!(%url, "registry endpoint unreachable: {e}");
                    last_err = Some((endpoint, e));
                    continue;
                }
            };
            let status = res.status();
            match res.bytes().await {
                Ok(bytes) => return Ok((status, bytes.to_vec())),
                Err(e) => {
                    debug!(%url, "reading registry response failed: {e}");
                    last_err = Some((endpoint, e));
                }
            }
        }
        match last_err {
            Some((endpoint, source)) => Err(Error::Transport {
                endpoint: endpoint.to_string(),
                source,
            }),
            None => Err(Error::NoEndpoints),
        }
    }

    async fn post<Req, Res>(&self, path: &str, req: &Req) -> Result<Res, Error>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let body = serde_json::to_value(req).map_err(|e| Error::Decode(e.to_string()))?;
        let (status, bytes) = self.send(Method::POST, path, Some(&body)).await?;
        if !status.is_success() {
            return Err(Error::Api(api_error(status, &bytes)));
        }
        serde_json::from_slice(&bytes).map_err(|e| Error::Decode(e.to_string()))
    }

    /// Fetches the health of the registry as seen by the first endpoint that
    /// answers.
    ///
    /// Returns `Ok(())` if the member reports itself healthy. An unhealthy
    /// report is returned as an [`Error::Api`] carrying the reported reason.
    pub async fn health(&self) -> Result<(), Error> {
        let (status, bytes) = self.send(Method::GET, "health", None).await?;
        match serde_json::from_slice::<HealthResponse>(&bytes) {
            Ok(h) if h.health == "true" => Ok(()),
            Ok(h) => Err(Error::Api(ApiError {
                status_code: status,
                code: None,
                message: if h.reason.is_empty() {
                    "registry reports unhealthy".into()
                } else {
                    h.reason
                },
            })),
            Err(_) => Err(Error::Api(api_error(status, &bytes))),
        }
    }

    /// Like [`Client::health`], but collapses the answer to a boolean.
    pub async fn is_healthy(&self) -> bool {
        self.health().await.is_ok()
    }

    /// Lists the members of the cluster.
    pub async fn member_list(&self) -> Result<Vec<Member>, Error> {
        let res: MembersResponse = self
            .post("v3/cluster/member/list", &serde_json::json!({}))
            .await?;
        Ok(res.members)
    }

    /// Adds a non-voting learner with the given peer URLs.
    pub async fn member_add_learner(
        &self,
        peer_urls: &[String],
    ) -> Result<MemberAddResponse, Error> {
        self.post(
            "v3/cluster/member/add",
            &MemberAddRequest {
                peer_urls,
                is_learner: true,
            },
        )
        .await
    }

    /// Promotes a learner to a voting member. Returns the membership after
    /// the promotion.
    pub async fn member_promote(&self, id: MemberId) -> Result<Vec<Member>, PromoteError> {
        match self
            .post::<_, MembersResponse>("v3/cluster/member/promote", &MemberIdRequest { id })
            .await
        {
            Ok(res) => Ok(res.members),
            Err(e) => Err(PromoteError::classify(e)),
        }
    }

    /// Removes a member from the cluster. Returns the remaining membership.
    pub async fn member_remove(&self, id: MemberId) -> Result<Vec<Member>, Error> {
        let res: MembersResponse = self
            .post("v3/cluster/member/remove", &MemberIdRequest { id })
            .await?;
        Ok(res.members)
    }

    /// Counts the keys that start with `prefix`.
    pub async fn prefix_count(&self, prefix: &str) -> Result<u64, Error> {
        let res: RangeResponse = self
            .post("v3/kv/range", &range_request(prefix, true))
            .await?;
        Ok(res.count)
    }

    /// Deletes every key that starts with `prefix`. Returns the number of
    /// deleted keys.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<u64, Error> {
        let res: DeleteRangeResponse = self
            .post("v3/kv/deleterange", &range_request(prefix, false))
            .await?;
        Ok(res.deleted)
    }

    /// Deletes every key under each of `prefixes`, independently.
    ///
    /// A failure to delete one prefix does not prevent the others from being
    /// deleted. The per-prefix outcomes are returned in the order of
    /// `prefixes`, and failures are logged.
    pub async fn delete_prefixes_best_effort(
        &self,
        prefixes: &[String],
    ) -> Vec<(String, Result<u64, Error>)> {
        let results = future::join_all(prefixes.iter().map(|p| self.delete_prefix(p))).await;
        prefixes
            .iter()
            .cloned()
            .zip(results)
            .inspect(|(prefix, res)| match res {
                Ok(deleted) => debug!(%prefix, deleted, "cleared registry prefix"),
                Err(e) => warn!(%prefix, "ignoring failure to clear registry prefix: {e}"),
            })
            .collect()
    }
}

fn range_request(prefix: &str, count_only: bool) -> RangeRequest {
    RangeRequest {
        key: encode(prefix.as_bytes()),
        range_end: encode(&prefix_range_end(prefix.as_bytes())),
        count_only,
    }
}

fn api_error(status: StatusCode, bytes: &[u8]) -> ApiError {
    match serde_json::from_slice::<GatewayError>(bytes) {
        Ok(e) => ApiError {
            status_code: status,
            code: e.code,
            message: if e.message.is_empty() { e.error } else { e.message },
        },
        Err(_) => ApiError {
            status_code: status,
            code: None,
            message: String::from_utf8_lossy(bytes).into_owned(),
        },
    }
}
