// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Tests the watcher against in-process orchestrator and backboard servers.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use pgha_backboard::{BackboardConfig, Client, Telemetry};
use pgha_leader_watcher::source::parse_endpoint;
use pgha_leader_watcher::{
    BackboardSink, HttpStatusSource, Leader, LeaderSink, StatusSource, TrackerConfig, Watcher,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use url::Url;

/// The document an orchestrator serves, or `None` to answer 503.
type Document = Arc<Mutex<Option<Value>>>;

async fn cluster(State(doc): State<Document>) -> Response {
    match doc.lock().unwrap().clone() {
        Some(doc) => Json(doc).into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn serve_status(doc: Document) -> Url {
    let app = Router::new().route("/cluster", get(cluster)).with_state(doc);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    parse_endpoint(&addr.to_string()).unwrap()
}

async fn refused_endpoint() -> Url {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    parse_endpoint(&addr.to_string()).unwrap()
}

fn status_with_leader(leader: &str) -> Value {
    let members: Vec<Value> = ["pg-1", "pg-2", "pg-3"]
        .into_iter()
        .map(|name| {
            json!({
                "name": name,
                "role": if name == leader { "leader" } else { "replica" },
                "state": if name == leader { "running" } else { "streaming" },
                "host": format!("{name}.railway.internal"),
                "port": 5432,
                "api_url": format!("http://{name}.railway.internal:8008/patroni"),
                "timeline": 2,
            })
        })
        .collect();
    json!({ "members": members, "scope": "pg-ha" })
}

fn source(endpoints: Vec<Url>) -> HttpStatusSource {
    HttpStatusSource::new(endpoints, Duration::from_millis(500)).unwrap()
}

#[derive(Debug, Clone, Default)]
struct RecordingSink {
    published: Arc<Mutex<Vec<Leader>>>,
    failing: Arc<Mutex<bool>>,
}

impl RecordingSink {
    fn names(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|l| l.name.clone())
            .collect()
    }
}

#[async_trait]
impl LeaderSink for RecordingSink {
    async fn publish(&self, leader: &Leader) -> Result<(), anyhow::Error> {
        if *self.failing.lock().unwrap() {
            anyhow::bail!("store unavailable");
        }
        self.published.lock().unwrap().push(leader.clone());
        Ok(())
    }
}

fn config(poll_interval: Duration) -> TrackerConfig {
    TrackerConfig {
        poll_interval,
        backoff_max: Duration::from_secs(60),
        down_threshold: 3,
        resync_interval: None,
    }
}

fn watcher<S: StatusSource>(source: S, sink: RecordingSink) -> Watcher<S, RecordingSink> {
    Watcher::new(
        source,
        sink,
        config(Duration::from_millis(10)),
        5432,
        Telemetry::disabled("test"),
    )
}

#[tokio::test]
async fn first_answering_endpoint_wins() {
    let down: Document = Arc::new(Mutex::new(None));
    let second: Document = Arc::new(Mutex::new(Some(status_with_leader("pg-2"))));
    let third: Document = Arc::new(Mutex::new(Some(status_with_leader("pg-3"))));
    let endpoints = vec![
        refused_endpoint().await,
        serve_status(down).await,
        serve_status(second).await,
        serve_status(third).await,
    ];

    let status = source(endpoints).fetch().await.unwrap();
    assert_eq!(status.leader().unwrap().name, "pg-2");
}

#[tokio::test]
async fn leader_sequence_publishes_each_change_once() {
    let doc: Document = Arc::new(Mutex::new(None));
    let endpoint = serve_status(Arc::clone(&doc)).await;
    let sink = RecordingSink::default();
    let mut watcher = watcher(source(vec![endpoint]), sink.clone());

    for leader in ["pg-1", "pg-1", "pg-2", "pg-2", "pg-1"] {
        *doc.lock().unwrap() = Some(status_with_leader(leader));
        watcher.tick().await;
    }

    assert_eq!(sink.names(), vec!["pg-1", "pg-2", "pg-1"]);
    assert_eq!(
        sink.published.lock().unwrap()[1].address.as_deref(),
        Some("pg-2.railway.internal:5432")
    );
}

#[tokio::test]
async fn elections_and_outages_are_survived() {
    let doc: Document = Arc::new(Mutex::new(Some(status_with_leader("pg-1"))));
    let endpoint = serve_status(Arc::clone(&doc)).await;
    let sink = RecordingSink::default();
    let mut watcher = watcher(source(vec![endpoint]), sink.clone());
    watcher.tick().await;

    *doc.lock().unwrap() = Some(json!({"members": [{"name": "pg-2", "role": "replica"}]}));
    let step = watcher.tick().await;
    assert_eq!(step.publish, None);

    *doc.lock().unwrap() = None;
    for _ in 0..4 {
        watcher.tick().await;
    }
    assert_eq!(watcher.tracker().consecutive_unreachable(), 4);

    *doc.lock().unwrap() = Some(status_with_leader("pg-3"));
    watcher.tick().await;
    assert_eq!(watcher.tracker().consecutive_unreachable(), 0);
    assert_eq!(sink.names(), vec!["pg-1", "pg-3"]);
}

#[tokio::test]
async fn failed_publication_is_retried() {
    let doc: Document = Arc::new(Mutex::new(Some(status_with_leader("pg-2"))));
    let endpoint = serve_status(doc).await;
    let sink = RecordingSink::default();
    *sink.failing.lock().unwrap() = true;
    let mut watcher = watcher(source(vec![endpoint]), sink.clone());

    let step = watcher.tick().await;
    assert!(step.publish.is_some());
    assert_eq!(watcher.tracker().last_published(), None);

    *sink.failing.lock().unwrap() = false;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let step = watcher.tick().await;
    assert!(step.publish.is_some());
    assert_eq!(sink.names(), vec!["pg-2"]);
    assert_eq!(
        watcher.tracker().last_published().map(|l| l.name.as_str()),
        Some("pg-2")
    );
}

#[tokio::test]
async fn run_stops_on_shutdown() {
    let doc: Document = Arc::new(Mutex::new(Some(status_with_leader("pg-1"))));
    let endpoint = serve_status(doc).await;
    let sink = RecordingSink::default();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let mut watcher = watcher(source(vec![endpoint]), sink.clone());
        let shutdown = shutdown.clone();
        async move { watcher.run(shutdown).await }
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sink.names(), vec!["pg-1"]);
}

type Requests = Arc<Mutex<Vec<Value>>>;

async fn graphql(State(requests): State<Requests>, Json(body): Json<Value>) -> Response {
    requests.lock().unwrap().push(body);
    Json(json!({"data": {"variableCollectionUpsert": true}})).into_response()
}

async fn serve_backboard(requests: Requests) -> SocketAddr {
    let app = Router::new()
        .route("/graphql/v2", post(graphql))
        .with_state(requests);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

#[tokio::test]
async fn backboard_sink_upserts_leader_variables() -> Result<(), anyhow::Error> {
    let requests: Requests = Default::default();
    let addr = serve_backboard(Arc::clone(&requests)).await;
    let client = Client::new(
        BackboardConfig {
            endpoint: format!("http://{addr}/graphql/v2").parse()?,
            token: Some("tok".into()),
            project_id: "proj-1".into(),
            environment_id: "env-1".into(),
            service_id: None,
        },
        Duration::from_secs(2),
    )?;
    let sink = BackboardSink::new(client, "PRIMARY_NAME".into(), "PRIMARY_ADDRESS".into());

    let leader = Leader {
        name: "pg-3".into(),
        address: Some("pg-3.railway.internal:5432".into()),
    };
    sink.publish(&leader).await?;
    sink.publish(&Leader {
        name: "pg-1".into(),
        address: None,
    })
    .await?;

    let requests = requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(
        requests[0]["variables"]["input"]["variables"],
        json!({
            "PRIMARY_NAME": "pg-3",
            "PRIMARY_ADDRESS": "pg-3.railway.internal:5432",
        })
    );
    assert_eq!(
        requests[1]["variables"]["input"]["variables"],
        json!({ "PRIMARY_NAME": "pg-1" })
    );
    Ok(())
}
