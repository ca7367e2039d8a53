use std::{collections::BTreeMap, path::Path, sync::Arc};

use anyhow::Context as _;
use tokio::time::{Duration, Instant};

use routeplane::{
    control::ControlApi,
    raft::{
        NodeMeta, RaftRuntime, RaftSettings, app::Metrics, app::RaftFacade as _,
        network_http::HttpNetworkFactory, snapshot_manager::SnapshotSettings, start_raft,
    },
    routing::Route,
};

fn settings() -> RaftSettings {
    RaftSettings {
        cluster_name: "snapshot-recovery".to_string(),
        snapshot: SnapshotSettings {
            threshold: 10_000,
            interval: Duration::from_secs(3600),
            retain: 2,
            trailing_logs: 0,
        },
        ..Default::default()
    }
}

async fn start(data_dir: &Path) -> anyhow::Result<RaftRuntime> {
    start_raft(data_dir, 1, &settings(), HttpNetworkFactory::try_new()?).await
}

async fn wait_for<F>(runtime: &RaftRuntime, what: &str, mut done: F) -> anyhow::Result<Metrics>
where
    F: FnMut(&Metrics) -> bool,
{
    let mut rx = runtime.raft.metrics();
    let deadline = Instant::now() + Duration::from_secs(8);
    loop {
        let m = rx.borrow().clone();
        if done(&m) {
            return Ok(m);
        }
        if Instant::now() >= deadline {
            anyhow::bail!(
                "timeout waiting for {what}; state={:?} last_applied={:?} snapshot={:?}",
                m.state,
                m.last_applied,
                m.snapshot
            );
        }
        let _ = tokio::time::timeout(Duration::from_millis(100), rx.changed()).await;
    }
}

#[tokio::test]
async fn restart_restores_snapshot_and_replays_tail() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir().context("tempdir")?;
    let data_dir = tmp.path().join("node-1");

    let runtime = start(&data_dir).await?;
    runtime
        .raft
        .bootstrap_cluster(BTreeMap::from([(1, NodeMeta::default())]))
        .await?;
    wait_for(&runtime, "leadership", |m| {
        m.state == openraft::ServerState::Leader
    })
    .await?;

    let control = ControlApi::new(
        Arc::new(runtime.raft.clone()),
        runtime.fsm.clone(),
        Duration::from_secs(5),
    );
    for i in 0..10 {
        control
            .add_route(Route::new(format!("10.{i}.0.0/16"), "10.0.0.1", i))
            .await
            .with_context(|| format!("add route {i}"))?;
    }
    control.delete_route("10.9.0.0/16").await?;

    runtime
        .raft
        .raft()
        .trigger()
        .snapshot()
        .await
        .context("trigger snapshot")?;
    let m = wait_for(&runtime, "snapshot", |m| {
        m.snapshot.is_some() && m.snapshot == m.last_applied
    })
    .await?;
    let snapshot_index = m.snapshot.map(|l| l.index).unwrap_or_default();
    wait_for(&runtime, "log purge", |m| {
        m.purged.is_some_and(|p| p.index == snapshot_index)
    })
    .await?;

    // Entries after the snapshot live only in the log.
    control
        .add_route(Route::new("192.168.0.0/16", "10.0.0.2", 7))
        .await?;
    let expected = runtime.fsm.routes().await;
    assert_eq!(expected.len(), 10);
    let applied = runtime.fsm.last_applied().await;

    assert_eq!(runtime.snapshots.list().await?.len(), 1);
    assert!(runtime.log_store.first_index().await > snapshot_index);

    runtime.raft.shutdown().await?;
    drop(control);
    drop(runtime);

    let runtime = start(&data_dir).await?;
    // The snapshot is loaded before raft replays anything.
    assert!(runtime.fsm.route_count().await >= 9);
    assert!(runtime.fsm.route("10.9.0.0/16").await.is_none());

    let applied_index = applied.map(|l| l.index).unwrap_or_default();
    wait_for(&runtime, "replay", |m| {
        m.last_applied.is_some_and(|l| l.index >= applied_index)
    })
    .await?;
    assert_eq!(runtime.fsm.routes().await, expected);

    runtime.raft.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn tampered_snapshot_refuses_to_start() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir().context("tempdir")?;
    let data_dir = tmp.path().join("node-1");

    let runtime = start(&data_dir).await?;
    runtime
        .raft
        .bootstrap_cluster(BTreeMap::from([(1, NodeMeta::default())]))
        .await?;
    wait_for(&runtime, "leadership", |m| {
        m.state == openraft::ServerState::Leader
    })
    .await?;
    let control = ControlApi::new(
        Arc::new(runtime.raft.clone()),
        runtime.fsm.clone(),
        Duration::from_secs(5),
    );
    control
        .add_route(Route::new("10.0.0.0/24", "10.0.0.1", 1))
        .await?;
    runtime.raft.raft().trigger().snapshot().await?;
    wait_for(&runtime, "snapshot", |m| m.snapshot.is_some()).await?;
    let snapshot_dir = runtime.snapshots.dir().to_path_buf();
    runtime.raft.shutdown().await?;
    drop(control);
    drop(runtime);

    let mut entries = std::fs::read_dir(&snapshot_dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect::<Vec<_>>();
    entries.sort();
    let newest = entries.pop().context("no snapshot directory")?;
    std::fs::write(newest.join("state.json"), b"{\"tampered\":true}")?;

    let err = match start(&data_dir).await {
        Ok(_) => anyhow::bail!("start succeeded with a tampered snapshot"),
        Err(err) => err,
    };
    assert!(format!("{err:#}").contains("state machine"), "{err:#}");
    Ok(())
}
