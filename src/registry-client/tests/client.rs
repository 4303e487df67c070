// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Tests the registry client against an in-process impersonation of the
//! etcd JSON gateway.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use url::Url;

use pgha_registry_client::{ClientConfig, Error, MemberId, PromoteError};

#[derive(Default)]
struct MockEtcd {
    healthy: bool,
    next_id: u64,
    members: Vec<Value>,
    learners_synced: bool,
    keys: BTreeMap<Vec<u8>, Vec<u8>>,
    poisoned_prefix: Option<Vec<u8>>,
    delay: Option<Duration>,
}

type Shared = Arc<Mutex<MockEtcd>>;

fn gateway_error(status: StatusCode, code: i64, message: &str) -> Response {
    (
        status,
        Json(json!({"error": message, "code": code, "message": message})),
    )
        .into_response()
}

async fn health(State(state): State<Shared>) -> Response {
    let (healthy, delay) = {
        let state = state.lock().unwrap();
        (state.healthy, state.delay)
    };
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    if healthy {
        Json(json!({"health": "true", "reason": ""})).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"health": "false", "reason": "RAFT NO LEADER"})),
        )
            .into_response()
    }
}

async fn member_list(State(state): State<Shared>) -> Response {
    let state = state.lock().unwrap();
    Json(json!({"header": {}, "members": state.members})).into_response()
}

async fn member_add(State(state): State<Shared>, Json(req): Json<Value>) -> Response {
    let mut state = state.lock().unwrap();
    assert_eq!(req["isLearner"], json!(true));
    state.next_id += 1;
    let member = json!({
        "ID": state.next_id.to_string(),
        "peerURLs": req["peerURLs"],
        "isLearner": true,
    });
    state.members.push(member.clone());
    Json(json!({"member": member, "members": state.members})).into_response()
}

async fn member_promote(State(state): State<Shared>, Json(req): Json<Value>) -> Response {
    let mut state = state.lock().unwrap();
    let synced = state.learners_synced;
    let Some(member) = state.members.iter_mut().find(|m| m["ID"] == req["ID"]) else {
        return gateway_error(StatusCode::NOT_FOUND, 5, "etcdserver: member not found");
    };
    if member.get("isLearner") != Some(&json!(true)) {
        return gateway_error(
            StatusCode::BAD_REQUEST,
            9,
            "etcdserver: can only promote a learner member",
        );
    }
    if !synced {
        return gateway_error(
            StatusCode::BAD_REQUEST,
            9,
            "etcdserver: can only promote a learner member which is in sync with leader",
        );
    }
    member["isLearner"] = json!(false);
    Json(json!({"members": state.members})).into_response()
}

async fn member_remove(State(state): State<Shared>, Json(req): Json<Value>) -> Response {
    let mut state = state.lock().unwrap();
    let before = state.members.len();
    state.members.retain(|m| m["ID"] != req["ID"]);
    if state.members.len() == before {
        return gateway_error(StatusCode::NOT_FOUND, 5, "etcdserver: member not found");
    }
    Json(json!({"members": state.members})).into_response()
}

fn decode_range(req: &Value) -> (Vec<u8>, Vec<u8>) {
    let key = STANDARD.decode(req["key"].as_str().unwrap()).unwrap();
    let end = STANDARD.decode(req["range_end"].as_str().unwrap()).unwrap();
    (key, end)
}

async fn range(State(state): State<Shared>, Json(req): Json<Value>) -> Response {
    let state = state.lock().unwrap();
    assert_eq!(req["count_only"], json!(true));
    let (key, end) = decode_range(&req);
    let count = state.keys.range(key..end).count();
    if count == 0 {
        Json(json!({"header": {}})).into_response()
    } else {
        Json(json!({"header": {}, "count": count.to_string()})).into_response()
    }
}

async fn delete_range(State(state): State<Shared>, Json(req): Json<Value>) -> Response {
    let mut state = state.lock().unwrap();
    let (key, end) = decode_range(&req);
    if state.poisoned_prefix.as_ref() == Some(&key) {
        return gateway_error(StatusCode::SERVICE_UNAVAILABLE, 14, "etcdserver: leader changed");
    }
    let doomed: Vec<_> = state.keys.range(key..end).map(|(k, _)| k.clone()).collect();
    for k in &doomed {
        state.keys.remove(k);
    }
    Json(json!({"header": {}, "deleted": doomed.len().to_string()})).into_response()
}

async fn serve(state: Shared) -> SocketAddr {
    let app = Router::new()
        .route("/health", get(health))
        .route("/v3/cluster/member/list", post(member_list))
        .route("/v3/cluster/member/add", post(member_add))
        .route("/v3/cluster/member/promote", post(member_promote))
        .route("/v3/cluster/member/remove", post(member_remove))
        .route("/v3/kv/range", post(range))
        .route("/v3/kv/deleterange", post(delete_range))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

fn url(addr: SocketAddr) -> Url {
    format!("http://{addr}").parse().unwrap()
}

async fn unused_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

fn shared(mock: MockEtcd) -> Shared {
    Arc::new(Mutex::new(mock))
}

#[tokio::test]
async fn health_reports_reason() -> Result<(), anyhow::Error> {
    let state = shared(MockEtcd {
        healthy: true,
        ..Default::default()
    });
    let client = ClientConfig::new([url(serve(Arc::clone(&state)).await)]).build()?;
    client.health().await?;
    assert!(client.is_healthy().await);

    state.lock().unwrap().healthy = false;
    match client.health().await {
        Err(Error::Api(e)) => {
            assert_eq!(e.status_code, StatusCode::SERVICE_UNAVAILABLE.as_u16());
            assert_eq!(e.message, "RAFT NO LEADER");
        }
        res => panic!("expected unhealthy error, got {res:?}"),
    }
    assert!(!client.is_healthy().await);
    Ok(())
}

#[tokio::test]
async fn falls_back_to_next_endpoint() -> Result<(), anyhow::Error> {
    let state = shared(MockEtcd {
        healthy: true,
        ..Default::default()
    });
    let live = serve(state).await;
    let dead = unused_addr().await;
    let client = ClientConfig::new([url(dead), url(live)])
        .timeout(Duration::from_secs(2))
        .build()?;
    assert!(client.is_healthy().await);

    let client = ClientConfig::new([url(dead)])
        .timeout(Duration::from_secs(2))
        .build()?;
    let err = client.health().await.unwrap_err();
    assert!(err.is_unavailable(), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn requests_time_out() -> Result<(), anyhow::Error> {
    let state = shared(MockEtcd {
        healthy: true,
        delay: Some(Duration::from_secs(5)),
        ..Default::default()
    });
    let client = ClientConfig::new([url(serve(state).await)])
        .timeout(Duration::from_millis(200))
        .build()?;
    assert!(matches!(client.health().await, Err(Error::Transport { .. })));
    Ok(())
}

#[tokio::test]
async fn learner_lifecycle() -> Result<(), anyhow::Error> {
    let state = shared(MockEtcd {
        healthy: true,
        next_id: 10501334649042878790,
        members: vec![json!({
            "ID": "10501334649042878790",
            "name": "etcd-1",
            "peerURLs": ["http://etcd-1:2380"],
            "clientURLs": ["http://etcd-1:2379"],
        })],
        ..Default::default()
    });
    let client = ClientConfig::new([url(serve(Arc::clone(&state)).await)]).build()?;

    let added = client
        .member_add_learner(&["http://etcd-2:2380".to_string()])
        .await?;
    assert!(added.member.is_learner);
    assert_eq!(added.member.id, MemberId(10501334649042878791));
    assert_eq!(added.members.len(), 2);

    let members = client.member_list().await?;
    assert_eq!(members.len(), 2);
    assert!(!members[0].is_learner);
    assert!(members[1].is_node("etcd-2", "http://etcd-2:2380"));

    assert!(matches!(
        client.member_promote(added.member.id).await,
        Err(PromoteError::NotReady)
    ));

    state.lock().unwrap().learners_synced = true;
    let members = client.member_promote(added.member.id).await?;
    assert!(members.iter().all(|m| !m.is_learner));

    assert!(matches!(
        client.member_promote(added.member.id).await,
        Err(PromoteError::NotLearner)
    ));

    let members = client.member_remove(added.member.id).await?;
    assert_eq!(members.len(), 1);
    assert!(matches!(
        client.member_remove(added.member.id).await,
        Err(Error::Api(_))
    ));
    Ok(())
}

#[tokio::test]
async fn prefix_operations() -> Result<(), anyhow::Error> {
    let mut keys = BTreeMap::new();
    for key in [
        "/service/pg-ha/initialize",
        "/service/pg-ha/leader",
        "/service/pg-ha/members/pg-1",
        "/service/pg-ha/members/pg-2",
        "/service/pg-ha/failover",
        "/service/pg-ha2/leader",
    ] {
        keys.insert(key.as_bytes().to_vec(), b"x".to_vec());
    }
    let state = shared(MockEtcd {
        healthy: true,
        keys,
        poisoned_prefix: Some(b"/service/pg-ha/failover".to_vec()),
        ..Default::default()
    });
    let client = ClientConfig::new([url(serve(Arc::clone(&state)).await)]).build()?;

    assert_eq!(client.prefix_count("/service/pg-ha/").await?, 5);
    assert_eq!(client.prefix_count("/service/nothing/").await?, 0);

    let prefixes: Vec<String> = ["initialize", "leader", "members/", "failover", "sync"]
        .iter()
        .map(|k| format!("/service/pg-ha/{k}"))
        .collect();
    let results = client.delete_prefixes_best_effort(&prefixes).await;
    let outcomes: Vec<_> = results
        .iter()
        .map(|(prefix, res)| (prefix.as_str(), res.as_ref().ok().copied()))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            ("/service/pg-ha/initialize", Some(1)),
            ("/service/pg-ha/leader", Some(1)),
            ("/service/pg-ha/members/", Some(2)),
            ("/service/pg-ha/failover", None),
            ("/service/pg-ha/sync", Some(0)),
        ]
    );

    let remaining: Vec<_> = state
        .lock()
        .unwrap()
        .keys
        .keys()
        .map(|k| String::from_utf8(k.clone()).unwrap())
        .collect();
    assert_eq!(
        remaining,
        vec!["/service/pg-ha/failover", "/service/pg-ha2/leader"]
    );
    Ok(())
}

#[test]
fn build_requires_endpoints() {
    assert!(matches!(
        ClientConfig::new(Vec::<Url>::new()).build(),
        Err(Error::NoEndpoints)
    ));
}
