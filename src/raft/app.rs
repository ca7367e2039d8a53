use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::Context;
use openraft::{
    CommittedLeaderId, LogId, ServerState,
    error::{CheckIsLeaderError, ClientWriteError, ForwardToLeader, RaftError},
};
use tokio::sync::{Mutex, watch};
use tracing::info;

use crate::{
    raft::types::{ClientResponse, CommandPayload, NodeId, NodeMeta, TypeConfig},
    routing::RouteFsm,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type Metrics = openraft::RaftMetrics<NodeId, NodeMeta>;

/// A committed and applied write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub index: u64,
    pub term: u64,
    pub response: ClientResponse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    NotLeader {
        leader_id: Option<NodeId>,
        leader_api_base_url: Option<String>,
    },
    /// The consensus core stopped; the node cannot make progress until restarted.
    Halted { message: String },
    Failed { message: String },
}

impl std::fmt::Display for ConsensusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotLeader { leader_id, .. } => match leader_id {
                Some(id) => write!(f, "not the leader; current leader is node {id}"),
                None => write!(f, "not the leader; no leader known"),
            },
            Self::Halted { message } => write!(f, "consensus halted: {message}"),
            Self::Failed { message } => write!(f, "consensus error: {message}"),
        }
    }
}

impl std::error::Error for ConsensusError {}

/// The narrow slice of the consensus engine the control API talks to.
pub trait RaftFacade: Send + Sync + 'static {
    fn metrics(&self) -> watch::Receiver<Metrics>;

    /// Submit an opaque payload; resolves once it is committed and applied locally.
    fn submit(&self, payload: CommandPayload) -> BoxFuture<'_, Result<Committed, ConsensusError>>;

    /// Confirm leadership with a quorum and wait until the local state machine has caught up to the
    /// commit index observed at that moment.
    fn ensure_linearizable(&self) -> BoxFuture<'_, Result<(), ConsensusError>>;
}

#[derive(Clone)]
pub struct RealRaft {
    raft: openraft::Raft<TypeConfig>,
    metrics: watch::Receiver<Metrics>,
}

impl RealRaft {
    pub fn new(raft: openraft::Raft<TypeConfig>) -> Self {
        let metrics = raft.metrics();
        Self { raft, metrics }
    }

    pub fn raft(&self) -> openraft::Raft<TypeConfig> {
        self.raft.clone()
    }

    /// Initialize membership with `members` as voters unless this node already has state.
    ///
    /// Returns whether initialization happened now.
    pub async fn bootstrap_cluster(
        &self,
        members: BTreeMap<NodeId, NodeMeta>,
    ) -> anyhow::Result<bool> {
        let initialized = self
            .raft
            .is_initialized()
            .await
            .context("raft is_initialized")?;
        if initialized {
            info!("raft already initialized; skipping bootstrap");
            return Ok(false);
        }
        let ids: Vec<NodeId> = members.keys().copied().collect();
        self.raft
            .initialize(members)
            .await
            .map_err(|e| anyhow::anyhow!("raft initialize: {e}"))?;
        info!(voters = ?ids, "bootstrapped raft cluster");
        Ok(true)
    }

    pub async fn add_learner(&self, node_id: NodeId, node: NodeMeta) -> anyhow::Result<()> {
        self.raft
            .add_learner(node_id, node, true)
            .await
            .map_err(|e| anyhow::anyhow!("raft add_learner: {e}"))?;
        Ok(())
    }

    pub async fn add_voters(&self, node_ids: BTreeSet<NodeId>) -> anyhow::Result<()> {
        self.raft
            .change_membership(openraft::ChangeMembers::AddVoterIds(node_ids), true)
            .await
            .map_err(|e| anyhow::anyhow!("raft change_membership(add_voters): {e}"))?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.raft
            .shutdown()
            .await
            .map_err(|e| anyhow::anyhow!("raft shutdown: {e}"))
    }
}

impl RaftFacade for RealRaft {
    fn metrics(&self) -> watch::Receiver<Metrics> {
        self.metrics.clone()
    }

    fn submit(&self, payload: CommandPayload) -> BoxFuture<'_, Result<Committed, ConsensusError>> {
        Box::pin(async move {
            match self.raft.client_write(payload).await {
                Ok(resp) => Ok(Committed {
                    index: resp.log_id.index,
                    term: resp.log_id.leader_id.term,
                    response: resp.data,
                }),
                Err(RaftError::APIError(ClientWriteError::ForwardToLeader(forward))) => {
                    let metrics = self.metrics.borrow().clone();
                    Err(not_leader(&forward, &metrics))
                }
                Err(RaftError::APIError(other)) => Err(ConsensusError::Failed {
                    message: other.to_string(),
                }),
                Err(RaftError::Fatal(fatal)) => Err(ConsensusError::Halted {
                    message: fatal.to_string(),
                }),
            }
        })
    }

    fn ensure_linearizable(&self) -> BoxFuture<'_, Result<(), ConsensusError>> {
        Box::pin(async move {
            match self.raft.ensure_linearizable().await {
                Ok(_) => Ok(()),
                Err(RaftError::APIError(CheckIsLeaderError::ForwardToLeader(forward))) => {
                    let metrics = self.metrics.borrow().clone();
                    Err(not_leader(&forward, &metrics))
                }
                Err(RaftError::APIError(other)) => Err(ConsensusError::Failed {
                    message: other.to_string(),
                }),
                Err(RaftError::Fatal(fatal)) => Err(ConsensusError::Halted {
                    message: fatal.to_string(),
                }),
            }
        })
    }
}

fn not_leader(forward: &ForwardToLeader<NodeId, NodeMeta>, metrics: &Metrics) -> ConsensusError {
    let leader_id = forward.leader_id.or(metrics.current_leader);
    let leader_api_base_url = forward
        .leader_node
        .as_ref()
        .filter(|node| !node.api_base_url.is_empty())
        .map(|node| node.api_base_url.clone())
        .or_else(|| leader_id.and_then(|id| leader_api_base_url(metrics, id)));
    ConsensusError::NotLeader {
        leader_id,
        leader_api_base_url,
    }
}

/// Look up a member's control API URL in the current membership.
pub fn leader_api_base_url(metrics: &Metrics, leader_id: NodeId) -> Option<String> {
    metrics
        .membership_config
        .nodes()
        .find(|(id, _node)| **id == leader_id)
        .map(|(_id, node)| node.api_base_url.clone())
        .filter(|url| !url.is_empty())
}

/// A test-only Raft facade that applies payloads directly to a local FSM.
#[derive(Clone)]
pub struct LocalRaft {
    fsm: Arc<RouteFsm>,
    metrics: watch::Receiver<Metrics>,
    term: u64,
    /// Held from index allocation through apply so entries land in index order.
    next_index: Arc<Mutex<u64>>,
    submissions: Arc<AtomicU64>,
}

impl LocalRaft {
    pub fn new(fsm: Arc<RouteFsm>, metrics: watch::Receiver<Metrics>) -> Self {
        let term = metrics.borrow().current_term.max(1);
        Self {
            fsm,
            metrics,
            term,
            next_index: Arc::new(Mutex::new(1)),
            submissions: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of payloads handed to `submit`.
    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::SeqCst)
    }
}

impl RaftFacade for LocalRaft {
    fn metrics(&self) -> watch::Receiver<Metrics> {
        self.metrics.clone()
    }

    fn submit(&self, payload: CommandPayload) -> BoxFuture<'_, Result<Committed, ConsensusError>> {
        Box::pin(async move {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            let mut next_index = self.next_index.lock().await;
            let index = *next_index;
            *next_index += 1;
            let log_id = LogId::new(CommittedLeaderId::new(self.term, 0), index);
            let response = match self.fsm.apply(log_id, payload.as_bytes()).await {
                Ok(effect) => ClientResponse::Ok { effect },
                Err(err) => ClientResponse::Rejected {
                    code: err.code().to_string(),
                    message: err.to_string(),
                },
            };
            drop(next_index);
            Ok(Committed {
                index,
                term: self.term,
                response,
            })
        })
    }

    fn ensure_linearizable(&self) -> BoxFuture<'_, Result<(), ConsensusError>> {
        Box::pin(async move {
            let metrics = self.metrics.borrow().clone();
            if metrics.state == ServerState::Leader {
                return Ok(());
            }
            let leader_id = metrics.current_leader;
            Err(ConsensusError::NotLeader {
                leader_id,
                leader_api_base_url: leader_id.and_then(|id| leader_api_base_url(&metrics, id)),
            })
        })
    }
}
