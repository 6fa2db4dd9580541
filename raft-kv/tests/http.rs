//! HTTP API tests, driving the router directly with `tower::ServiceExt`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use axum::routing::post;
use raft_kv::{Cluster, Config, http};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tower::ServiceExt;

fn node_config(dir: &TempDir, raft_port: u16, leader: Option<String>) -> Config {
    Config {
        storage_path: dir.path().to_path_buf(),
        raft_address: "127.0.0.1".to_string(),
        raft_port,
        raft_leader: leader,
        commit_timeout_secs: 10,
        join_timeout_secs: 10,
        join_settle_secs: 0,
        lock_timeout_micros: 100_000,
        snapshot_chance: 0,
        ..Config::default()
    }
}

async fn leader_router(dir: &TempDir, raft_port: u16) -> Result<(Router, Arc<Cluster>)> {
    let cluster = Arc::new(Cluster::start(node_config(dir, raft_port, None)).await?);
    let start = Instant::now();
    while !cluster.is_leader() {
        if start.elapsed() > Duration::from_secs(10) {
            bail!("node never became leader");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok((http::router(cluster.clone()), cluster))
}

async fn send(
    router: &Router,
    method: Method,
    uri: &str,
    body: impl Into<Body>,
) -> Result<(StatusCode, String, Option<String>)> {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(body.into())?;
    let response = router.clone().oneshot(request).await?;
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok((status, String::from_utf8(bytes.to_vec())?, content_type))
}

#[tokio::test]
async fn root_says_hello() -> Result<()> {
    let dir = TempDir::new()?;
    let (router, cluster) = leader_router(&dir, 19501).await?;

    let (status, body, content_type) = send(&router, Method::GET, "/", Body::empty()).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some(http::JSON_CONTENT_TYPE));
    assert_eq!(serde_json::from_str::<Value>(&body)?, json!({"hello": "world"}));

    cluster.shutdown();
    Ok(())
}

#[tokio::test]
async fn key_lifecycle_over_http() -> Result<()> {
    let dir = TempDir::new()?;
    let (router, cluster) = leader_router(&dir, 19511).await?;

    let (status, body, _) = send(&router, Method::GET, "/key/k", Body::empty()).await?;
    assert_eq!((status, body.as_str()), (StatusCode::OK, ""));

    let (status, body, content_type) = send(&router, Method::POST, "/key/k", "hello world").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, r#"{"status":"success"}"#);
    assert_eq!(content_type.as_deref(), Some(http::JSON_CONTENT_TYPE));

    let (status, body, _) = send(&router, Method::GET, "/key/k", Body::empty()).await?;
    assert_eq!((status, body.as_str()), (StatusCode::OK, "hello world"));

    let (status, body, _) = send(&router, Method::DELETE, "/key/k", Body::empty()).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, r#"{"status":"success"}"#);

    let (_, body, _) = send(&router, Method::GET, "/key/k", Body::empty()).await?;
    assert_eq!(body, "");

    cluster.shutdown();
    Ok(())
}

#[tokio::test]
async fn bad_requests_are_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let (router, cluster) = leader_router(&dir, 19521).await?;

    let (status, body, _) =
        send(&router, Method::POST, "/key/k", vec![0xffu8, 0xfe, 0xfd]).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(serde_json::from_str::<Value>(&body)?["error"].is_string());
    assert_eq!(cluster.get("k")?, "");

    let (status, _, _) = send(&router, Method::POST, "/raft/add", "{not json").await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body, _) = send(
        &router,
        Method::POST,
        "/raft/add",
        r#"{"ID":"node-two","Address":"127.0.0.1:1"}"#,
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("invalid node id"), "{body}");

    cluster.shutdown();
    Ok(())
}

#[tokio::test]
async fn status_reports_leadership() -> Result<()> {
    let dir = TempDir::new()?;
    let (router, cluster) = leader_router(&dir, 19531).await?;

    let (status, body, _) = send(&router, Method::GET, "/raft/status", Body::empty()).await?;
    assert_eq!(status, StatusCode::OK);
    let status: Value = serde_json::from_str(&body)?;
    assert_eq!(status["role"], "leader");
    assert_eq!(status["node_id"], json!(cluster.node_id()));
    assert_eq!(status["address"], "127.0.0.1:19531");
    assert_eq!(status["voters"], json!([cluster.node_id()]));

    cluster.shutdown();
    Ok(())
}

/// A node whose join was acknowledged but never applied has no leader: it
/// serves local reads and refuses writes instead of forwarding.
#[tokio::test]
async fn leaderless_node_handles_requests_locally() -> Result<()> {
    let stub = TcpListener::bind("127.0.0.1:0").await?;
    let stub_addr = stub.local_addr()?;
    let stub_app = Router::new().route(
        "/raft/add",
        post(|| async { axum::Json(json!({"status": "success"})) }),
    );
    tokio::spawn(async move {
        let _ = axum::serve(stub, stub_app).await;
    });

    let dir = TempDir::new()?;
    let config = node_config(&dir, 19541, Some(format!("http://{stub_addr}")));
    let cluster = Arc::new(Cluster::start(config).await?);
    let router = http::router(cluster.clone());
    assert!(!cluster.is_leader());
    assert!(cluster.leader_address().is_none());

    let (status, body, _) = send(&router, Method::POST, "/key/k", "v").await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(serde_json::from_str::<Value>(&body)?, json!({"error": "not leader"}));

    let (status, body, _) = send(&router, Method::GET, "/key/k", Body::empty()).await?;
    assert_eq!((status, body.as_str()), (StatusCode::OK, ""));

    cluster.shutdown();
    Ok(())
}
