//! Integration tests for the cluster coordinator over real TCP.
//!
//! Each test uses its own fixed localhost ports; a node's raft port is its
//! HTTP port + 1, matching the default `HTTP_PORT_OFFSET` of -1.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use raft_kv::consensus::Role;
use raft_kv::{Cluster, Config, Error, http};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(15);

fn node_config(dir: &TempDir, http_port: u16, leader: Option<String>) -> Config {
    Config {
        port: http_port,
        storage_path: dir.path().to_path_buf(),
        raft_address: "127.0.0.1".to_string(),
        raft_port: http_port + 1,
        raft_leader: leader,
        commit_timeout_secs: 10,
        join_timeout_secs: 10,
        join_settle_secs: 0,
        lock_timeout_micros: 100_000,
        snapshot_chance: 0,
        ..Config::default()
    }
}

/// A cluster node with its HTTP API served on the configured port.
struct TestNode {
    cluster: Arc<Cluster>,
    stop_http: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
}

impl TestNode {
    async fn start(config: Config) -> Result<Self> {
        let port = config.port;
        // Bind first so a joining node can reach us as soon as we are up.
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let cluster = Arc::new(Cluster::start(config).await?);

        let (stop_http, stopped) = oneshot::channel::<()>();
        let app = http::router(cluster.clone());
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stopped.await;
                })
                .await;
        });

        Ok(Self {
            cluster,
            stop_http: Some(stop_http),
            server,
        })
    }

    async fn shutdown(mut self) {
        self.cluster.shutdown();
        if let Some(stop) = self.stop_http.take() {
            let _ = stop.send(());
        }
        let _ = self.server.await;
    }
}

async fn start_seed(dir: &TempDir, http_port: u16) -> Result<Arc<Cluster>> {
    let cluster = Arc::new(Cluster::start(node_config(dir, http_port, None)).await?);
    wait_until("seed becomes leader", || cluster.is_leader()).await?;
    Ok(cluster)
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) -> Result<()> {
    let start = Instant::now();
    while !check() {
        if start.elapsed() > WAIT {
            bail!("timeout waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

#[tokio::test]
async fn single_node_set_get_delete() -> Result<()> {
    let dir = TempDir::new()?;
    let cluster = start_seed(&dir, 19100).await?;

    assert_eq!(cluster.get("k")?, "");
    cluster.set("k", "v").await?;
    assert_eq!(cluster.get("k")?, "v");
    cluster.delete("k").await?;
    assert_eq!(cluster.get("k")?, "");

    // Deleting an absent key succeeds.
    cluster.delete("never-set").await?;

    cluster.shutdown();
    Ok(())
}

#[tokio::test]
async fn legacy_delete_removes_literal_key() -> Result<()> {
    let dir = TempDir::new()?;
    let config = Config {
        legacy_delete_key: true,
        ..node_config(&dir, 19110, None)
    };
    let cluster = Arc::new(Cluster::start(config).await?);
    wait_until("seed becomes leader", || cluster.is_leader()).await?;

    cluster.set("key", "literal").await?;
    cluster.set("k", "v").await?;
    cluster.delete("k").await?;

    assert_eq!(cluster.get("k")?, "v", "requested key must survive");
    assert_eq!(cluster.get("key")?, "");

    cluster.shutdown();
    Ok(())
}

#[tokio::test]
async fn restarted_seed_keeps_data_and_leadership() -> Result<()> {
    let dir = TempDir::new()?;
    {
        let cluster = start_seed(&dir, 19120).await?;
        cluster.set("persisted", "yes").await?;
        cluster.shutdown();
    }
    // Let the old transport release its port.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let cluster = Arc::new(Cluster::start(node_config(&dir, 19120, None)).await?);
    wait_until("restarted seed becomes leader", || cluster.is_leader()).await?;
    assert_eq!(cluster.get("persisted")?, "yes");

    cluster.set("after", "restart").await?;
    assert_eq!(cluster.get("after")?, "restart");

    cluster.shutdown();
    Ok(())
}

#[tokio::test]
async fn joined_node_sees_writes_and_rejects_its_own() -> Result<()> {
    let (dir_a, dir_b) = (TempDir::new()?, TempDir::new()?);
    let a = TestNode::start(node_config(&dir_a, 19130, None)).await?;
    wait_until("A becomes leader", || a.cluster.is_leader()).await?;

    let b = TestNode::start(node_config(
        &dir_b,
        19140,
        Some("http://127.0.0.1:19130".to_string()),
    ))
    .await?;

    a.cluster.set("k", "v").await?;
    wait_until("B applies the write", || {
        b.cluster.get("k").ok().as_deref() == Some("v")
    })
    .await?;

    let voters = a.cluster.status().voters;
    assert_eq!(voters.len(), 2);
    assert!(voters.contains(&b.cluster.node_id()));
    assert_eq!(b.cluster.status().role, Role::Follower);
    assert_eq!(
        b.cluster.leader_address().as_deref(),
        Some("127.0.0.1:19131")
    );

    // Leader gating: a follower refuses writes and changes nothing.
    let err = b.cluster.set("k", "from-b").await.unwrap_err();
    assert!(matches!(err, Error::NotLeader), "{err:?}");
    let err = b.cluster.delete("k").await.unwrap_err();
    assert!(matches!(err, Error::NotLeader), "{err:?}");
    assert_eq!(b.cluster.get("k")?, "v");
    assert_eq!(a.cluster.get("k")?, "v");

    b.shutdown().await;
    a.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn follower_forwards_http_writes_to_leader() -> Result<()> {
    let (dir_a, dir_b) = (TempDir::new()?, TempDir::new()?);
    let a = TestNode::start(node_config(&dir_a, 19150, None)).await?;
    wait_until("A becomes leader", || a.cluster.is_leader()).await?;
    let b = TestNode::start(node_config(
        &dir_b,
        19160,
        Some("http://127.0.0.1:19150".to_string()),
    ))
    .await?;
    wait_until("B learns the leader", || b.cluster.leader_address().is_some()).await?;

    let client = reqwest::Client::new();
    let response = client
        .post("http://127.0.0.1:19160/key/forwarded")
        .body("through-b")
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.headers()[reqwest::header::CONTENT_TYPE],
        "application/json; charset=utf-8"
    );
    assert_eq!(response.text().await?, r#"{"status":"success"}"#);
    assert_eq!(a.cluster.get("forwarded")?, "through-b");

    // Reads through a follower are answered by the leader too.
    let body = client
        .get("http://127.0.0.1:19160/key/forwarded")
        .send()
        .await?
        .text()
        .await?;
    assert_eq!(body, "through-b");

    let response = client
        .delete("http://127.0.0.1:19160/key/forwarded")
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(a.cluster.get("forwarded")?, "");

    b.shutdown().await;
    a.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unreachable_leader_aborts_join() -> Result<()> {
    let dir = TempDir::new()?;
    // Nothing listens on 19179.
    let config = node_config(&dir, 19170, Some("http://127.0.0.1:19179".to_string()));
    let err = match Cluster::start(config).await {
        Ok(_) => bail!("join against a dead leader must fail"),
        Err(err) => err,
    };
    assert!(matches!(err, Error::Join { .. }), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn transport_port_conflict_is_fatal() -> Result<()> {
    let (dir_a, dir_b) = (TempDir::new()?, TempDir::new()?);
    let first = start_seed(&dir_a, 19180).await?;

    let err = match Cluster::start(node_config(&dir_b, 19180, None)).await {
        Ok(_) => bail!("second node on the same raft port must fail"),
        Err(err) => err,
    };
    assert!(matches!(err, Error::Consensus(_)), "{err:?}");

    first.shutdown();
    Ok(())
}

#[tokio::test]
async fn seed_bootstrap_write_failure_is_fatal() -> Result<()> {
    let dir = TempDir::new()?;
    // A directory where the first snapshot's temp file goes makes its write fail.
    std::fs::create_dir_all(dir.path().join("snaps").join("00000000000000000001.tmp"))?;

    let err = match Cluster::start(node_config(&dir, 19200, None)).await {
        Ok(cluster) => bail!(
            "seed started without an initial configuration: {:?}",
            cluster.status()
        ),
        Err(err) => err,
    };
    assert!(matches!(err, Error::Consensus(_)), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn leadership_gain_can_trigger_snapshot() -> Result<()> {
    let dir = TempDir::new()?;
    let config = Config {
        snapshot_chance: 1,
        ..node_config(&dir, 19190, None)
    };
    let cluster = Arc::new(Cluster::start(config).await?);

    // Bootstrap snapshots at index 1; the leader's first entry follows it.
    wait_until("snapshot past bootstrap", || cluster.status().snapshot_index >= 2).await?;
    assert!(!cluster.watcher_finished());

    cluster.shutdown();
    wait_until("watcher exits", || cluster.watcher_finished()).await?;
    Ok(())
}
