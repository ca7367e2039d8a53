use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use tracing::info;

use crate::{
    config::Config,
    raft::{
        app::RealRaft,
        network_http::HttpNetworkFactory,
        snapshot_manager::SnapshotSettings,
        storage::{FileLogStore, FileSnapshotStore, RouteStateMachine},
        types::{NodeId, TypeConfig},
    },
    routing::RouteFsm,
};

/// Consensus timing and snapshot knobs for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftSettings {
    pub cluster_name: String,
    pub heartbeat_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub snapshot: SnapshotSettings,
}

impl Default for RaftSettings {
    /// Loopback timings, used by tests.
    fn default() -> Self {
        Self {
            cluster_name: "routeplane".to_string(),
            heartbeat_interval_ms: 50,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            snapshot: SnapshotSettings::default(),
        }
    }
}

impl RaftSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cluster_name: config.cluster_name.clone(),
            heartbeat_interval_ms: config.heartbeat_interval_ms,
            election_timeout_min_ms: config.election_timeout_min_ms,
            election_timeout_max_ms: config.election_timeout_max_ms,
            snapshot: SnapshotSettings {
                threshold: config.snapshot_threshold,
                interval: Duration::from_secs(config.snapshot_interval_secs),
                retain: config.snapshot_retain as usize,
                trailing_logs: config.trailing_logs,
            },
        }
    }

    pub fn openraft_config(&self) -> anyhow::Result<openraft::Config> {
        openraft::Config {
            cluster_name: self.cluster_name.clone(),
            heartbeat_interval: self.heartbeat_interval_ms,
            election_timeout_min: self.election_timeout_min_ms,
            election_timeout_max: self.election_timeout_max_ms,
            // Replication RPCs use the heartbeat as hard TTL; snapshots need longer.
            install_snapshot_timeout: (self.heartbeat_interval_ms * 20).max(1_000),
            snapshot_policy: self.snapshot.policy(),
            max_in_snapshot_log_to_keep: self.snapshot.trailing_logs,
            ..Default::default()
        }
        .validate()
        .map_err(|e| anyhow::anyhow!("raft config validate: {e}"))
    }
}

/// A running consensus node and the stores it was started from.
#[derive(Clone)]
pub struct RaftRuntime {
    pub raft: RealRaft,
    pub fsm: Arc<RouteFsm>,
    pub log_store: FileLogStore,
    pub snapshots: FileSnapshotStore,
}

/// Open storage under `data_dir` (restoring the newest snapshot) and start raft.
///
/// Initialization is left to the caller: only a bootstrapping node should call
/// [`RealRaft::bootstrap_cluster`].
pub async fn start_raft(
    data_dir: &Path,
    node_id: NodeId,
    settings: &RaftSettings,
    network: HttpNetworkFactory,
) -> anyhow::Result<RaftRuntime> {
    let config = Arc::new(settings.openraft_config()?);

    let log_store = FileLogStore::open(data_dir)
        .await
        .map_err(|e| anyhow::anyhow!("open log store: {e}"))?;
    let snapshots = FileSnapshotStore::open(data_dir, settings.snapshot.retain)
        .await
        .map_err(|e| anyhow::anyhow!("open snapshot store: {e}"))?;

    let fsm = Arc::new(RouteFsm::new());
    let state_machine = RouteStateMachine::open(fsm.clone(), snapshots.clone())
        .await
        .map_err(|e| anyhow::anyhow!("open state machine: {e}"))?;

    let raft = openraft::Raft::<TypeConfig>::new(
        node_id,
        config,
        network,
        log_store.clone(),
        state_machine,
    )
    .await
    .context("start raft")?;

    info!(
        node_id,
        data_dir = %data_dir.display(),
        recovered_routes = fsm.route_count().await,
        "raft started"
    );

    Ok(RaftRuntime {
        raft: RealRaft::new(raft),
        fsm,
        log_store,
        snapshots,
    })
}
