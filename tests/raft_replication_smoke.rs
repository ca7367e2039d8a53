use std::{collections::BTreeSet, path::Path, sync::Arc};

use anyhow::Context as _;
use tokio::{
    net::TcpListener,
    sync::oneshot,
    task::JoinHandle,
    time::{Duration, Instant},
};

use routeplane::{
    control::{ControlApi, ControlError, ReadConsistency},
    http::build_router,
    raft::{
        NodeId, NodeMeta, RaftRuntime, RaftSettings, app::RaftFacade as _,
        network_http::HttpNetworkFactory, start_raft,
    },
    routing::Route,
};

struct ServerHandle {
    base_url: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<anyhow::Result<()>>,
}

impl ServerHandle {
    async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.join
            .await
            .context("join server task")?
            .context("server exited with error")?;
        Ok(())
    }
}

struct TestNode {
    id: NodeId,
    runtime: RaftRuntime,
    control: ControlApi,
    server: ServerHandle,
}

impl TestNode {
    fn meta(&self) -> NodeMeta {
        NodeMeta {
            name: format!("node-{}", self.id),
            api_base_url: self.server.base_url.clone(),
            raft_endpoint: self.server.base_url.clone(),
        }
    }
}

async fn spawn_node(data_dir: &Path, id: NodeId) -> anyhow::Result<TestNode> {
    let settings = RaftSettings {
        cluster_name: "raft-replication-smoke".to_string(),
        ..Default::default()
    };
    let runtime = start_raft(data_dir, id, &settings, HttpNetworkFactory::try_new()?)
        .await
        .with_context(|| format!("start raft-{id}"))?;
    let control = ControlApi::new(
        Arc::new(runtime.raft.clone()),
        runtime.fsm.clone(),
        Duration::from_secs(5),
    );

    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .context("bind listener")?;
    let addr = listener.local_addr().context("local_addr")?;
    let router = build_router(control.clone(), Some(runtime.raft.raft()));

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .map_err(|e| anyhow::anyhow!("axum serve: {e}"))?;
        Ok(())
    });

    Ok(TestNode {
        id,
        runtime,
        control,
        server: ServerHandle {
            base_url: format!("http://{addr}"),
            shutdown_tx: Some(shutdown_tx),
            join,
        },
    })
}

async fn wait_for_leader(node: &TestNode, timeout: Duration) -> anyhow::Result<()> {
    let mut rx = node.runtime.raft.metrics();
    let deadline = Instant::now() + timeout;
    loop {
        {
            let m = rx.borrow();
            if m.state == openraft::ServerState::Leader && m.current_leader == Some(node.id) {
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            let m = rx.borrow();
            anyhow::bail!(
                "timeout waiting for leader={}; state={:?} current_leader={:?}",
                node.id,
                m.state,
                m.current_leader
            );
        }
        let _ = tokio::time::timeout(Duration::from_millis(100), rx.changed()).await;
    }
}

async fn wait_for_route(
    node: &TestNode,
    destination: &str,
    present: bool,
    timeout: Duration,
) -> anyhow::Result<Option<Route>> {
    let deadline = Instant::now() + timeout;
    loop {
        let route = node.runtime.fsm.route(destination).await;
        if route.is_some() == present {
            return Ok(route);
        }
        if Instant::now() >= deadline {
            anyhow::bail!(
                "timeout waiting for route {destination} present={present} on node-{}",
                node.id
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn two_node_route_replication() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir().context("tempdir")?;
    let node1 = spawn_node(&tmp.path().join("node-1"), 1).await?;
    let node2 = spawn_node(&tmp.path().join("node-2"), 2).await?;

    let initialized = node1
        .runtime
        .raft
        .bootstrap_cluster([(node1.id, node1.meta())].into())
        .await?;
    assert!(initialized);
    wait_for_leader(&node1, Duration::from_secs(8)).await?;

    // A second bootstrap on an initialized node is a no-op.
    assert!(
        !node1
            .runtime
            .raft
            .bootstrap_cluster([(node1.id, node1.meta())].into())
            .await?
    );

    node1
        .runtime
        .raft
        .add_learner(node2.id, node2.meta())
        .await
        .context("add node-2 learner")?;
    node1
        .runtime
        .raft
        .add_voters(BTreeSet::from([node2.id]))
        .await
        .context("promote node-2 to voter")?;

    let route = Route::new("10.0.0.0/24", "10.0.0.1", 1);
    let ack = node1
        .control
        .add_route(route.clone())
        .await
        .context("add route on leader")?;
    assert!(ack.index > 0);

    let replicated = wait_for_route(&node2, "10.0.0.0/24", true, Duration::from_secs(8)).await?;
    assert_eq!(replicated, Some(route.clone()));

    // Writes on the follower are refused locally and point at the leader.
    let err = node2
        .control
        .add_route(Route::new("192.168.0.0/16", "10.0.0.9", 3))
        .await
        .unwrap_err();
    match err {
        ControlError::NotLeader {
            leader_id,
            leader_api_base_url,
        } => {
            assert_eq!(leader_id, Some(node1.id));
            assert_eq!(leader_api_base_url, Some(node1.server.base_url.clone()));
        }
        other => panic!("expected NotLeader, got {other:?}"),
    }
    let last_log = node1.runtime.raft.metrics().borrow().last_log_index;
    assert!(node1.runtime.fsm.route("192.168.0.0/16").await.is_none());

    // The same flow over HTTP.
    let client = reqwest::Client::new();
    let res = client
        .post(format!("{}/routes", node2.server.base_url))
        .json(&serde_json::json!({"destination": "a", "next_hop": "b", "metric": 0}))
        .send()
        .await?;
    assert_eq!(res.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(node1.runtime.raft.metrics().borrow().last_log_index, last_log);

    let res = client
        .delete(format!("{}/routes", node1.server.base_url))
        .query(&[("destination", "10.0.0.0/24")])
        .send()
        .await?;
    assert_eq!(res.status(), reqwest::StatusCode::OK);
    wait_for_route(&node2, "10.0.0.0/24", false, Duration::from_secs(8)).await?;

    let routes = node1
        .control
        .list_routes(ReadConsistency::Linearizable)
        .await
        .context("linearizable read on leader")?;
    assert!(routes.is_empty());

    let status: serde_json::Value = client
        .get(format!("{}/cluster/status", node2.server.base_url))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(status["state"], "Follower");
    assert_eq!(status["current_leader"], 1);
    assert_eq!(status["voters"], serde_json::json!([1, 2]));
    drop(client);

    node1.runtime.raft.shutdown().await?;
    node2.runtime.raft.shutdown().await?;
    node1.server.shutdown().await?;
    node2.server.shutdown().await?;
    Ok(())
}
