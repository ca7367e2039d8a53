//! Client-facing operations, independent of the HTTP framing.
//!
//! A write moves through `received -> validated -> submitted -> {committed, timed out,
//! rejected (not leader), failed}`. Validation and the leader check happen before anything reaches
//! consensus, so a rejected write never produces a log entry.
//!
//! Reads default to the local state machine: on the leader that is read-your-writes, on a follower
//! it may lag. `ReadConsistency::Linearizable` first confirms leadership with a quorum and waits for
//! the local apply to reach the confirmed commit index.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use openraft::ServerState;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::{
    raft::{
        app::{ConsensusError, Metrics, RaftFacade, leader_api_base_url},
        types::{ClientResponse, NodeId},
    },
    routing::{ApplyEffect, Command, Route, RouteFsm, ValidationError},
};

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadConsistency {
    #[default]
    Local,
    Linearizable,
}

/// Outcome of a committed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteAck {
    pub destination: String,
    pub index: u64,
    pub term: u64,
    pub effect: ApplyEffect,
}

impl WriteAck {
    /// False only for a committed delete of a destination that was not in the table.
    pub fn found(&self) -> bool {
        !matches!(self.effect, ApplyEffect::RouteDeleted { existed: false, .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    Validation(ValidationError),
    NotLeader {
        leader_id: Option<NodeId>,
        leader_api_base_url: Option<String>,
    },
    /// The write may still commit later.
    Timeout {
        after: Duration,
    },
    /// Committed, but the state machine refused the command.
    Rejected {
        code: String,
        message: String,
    },
    Failed {
        message: String,
    },
    Halted {
        message: String,
    },
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(e) => write!(f, "{e}"),
            Self::NotLeader { leader_id, .. } => match leader_id {
                Some(id) => write!(f, "this node is not the leader; leader is node {id}"),
                None => write!(f, "this node is not the leader; no leader is known"),
            },
            Self::Timeout { after } => write!(
                f,
                "commit not confirmed within {}ms; the write may still be applied",
                after.as_millis()
            ),
            Self::Rejected { message, .. } => write!(f, "command rejected: {message}"),
            Self::Failed { message } => write!(f, "submission failed: {message}"),
            Self::Halted { message } => write!(f, "node halted: {message}"),
        }
    }
}

impl std::error::Error for ControlError {}

impl From<ValidationError> for ControlError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

impl From<ConsensusError> for ControlError {
    fn from(e: ConsensusError) -> Self {
        match e {
            ConsensusError::NotLeader {
                leader_id,
                leader_api_base_url,
            } => Self::NotLeader {
                leader_id,
                leader_api_base_url,
            },
            ConsensusError::Halted { message } => Self::Halted { message },
            ConsensusError::Failed { message } => Self::Failed { message },
        }
    }
}

pub fn raft_state_name(state: ServerState) -> &'static str {
    match state {
        ServerState::Leader => "Leader",
        ServerState::Follower => "Follower",
        ServerState::Candidate => "Candidate",
        ServerState::Learner => "Learner",
        ServerState::Shutdown => "Shutdown",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// `healthy` on the leader, `follower` elsewhere, `halted` after a fatal consensus error.
    pub status: &'static str,
    pub raft_state: &'static str,
    pub node_id: NodeId,
    pub term: u64,
}

#[derive(Clone)]
pub struct ControlApi {
    raft: Arc<dyn RaftFacade>,
    fsm: Arc<RouteFsm>,
    write_timeout: Duration,
}

impl ControlApi {
    pub fn new(raft: Arc<dyn RaftFacade>, fsm: Arc<RouteFsm>, write_timeout: Duration) -> Self {
        Self {
            raft,
            fsm,
            write_timeout,
        }
    }

    fn metrics(&self) -> Metrics {
        self.raft.metrics().borrow().clone()
    }

    pub async fn add_route(&self, route: Route) -> Result<WriteAck, ControlError> {
        route.validate()?;
        self.submit(Command::AddRoute(route)).await
    }

    /// Deleting an absent destination still commits; the ack reports `found() == false`.
    pub async fn delete_route(&self, destination: &str) -> Result<WriteAck, ControlError> {
        if destination.trim().is_empty() {
            return Err(ValidationError::EmptyDestination.into());
        }
        self.submit(Command::DeleteRoute {
            destination: destination.to_string(),
        })
        .await
    }

    pub async fn list_routes(
        &self,
        consistency: ReadConsistency,
    ) -> Result<BTreeMap<String, Route>, ControlError> {
        if consistency == ReadConsistency::Linearizable {
            self.raft.ensure_linearizable().await?;
        }
        Ok(self.fsm.routes().await)
    }

    pub fn health(&self) -> HealthReport {
        let metrics = self.metrics();
        let status = if metrics.running_state.is_err() {
            "halted"
        } else if metrics.state == ServerState::Leader {
            "healthy"
        } else {
            "follower"
        };
        HealthReport {
            status,
            raft_state: raft_state_name(metrics.state),
            node_id: metrics.id,
            term: metrics.current_term,
        }
    }

    /// Consensus statistics as reported by the engine, plus the local route count.
    pub async fn cluster_status(&self) -> Map<String, Value> {
        let metrics = self.metrics();
        let membership = metrics.membership_config.membership();
        let voters: Vec<NodeId> = membership.voter_ids().collect();
        let learners: Vec<NodeId> = membership.learner_ids().collect();
        let peers: Vec<Value> = membership
            .nodes()
            .filter(|(id, _)| **id != metrics.id)
            .map(|(id, node)| {
                json!({
                    "id": id,
                    "name": node.name,
                    "api_base_url": node.api_base_url,
                })
            })
            .collect();
        let replication: Option<BTreeMap<String, Option<u64>>> =
            metrics.replication.as_ref().map(|r| {
                r.iter()
                    .map(|(id, matched)| (id.to_string(), matched.map(|l| l.index)))
                    .collect()
            });

        let mut status = Map::new();
        status.insert("node_id".into(), json!(metrics.id));
        status.insert("state".into(), json!(raft_state_name(metrics.state)));
        status.insert("term".into(), json!(metrics.current_term));
        status.insert("last_log_index".into(), json!(metrics.last_log_index));
        status.insert(
            "applied_index".into(),
            json!(metrics.last_applied.map(|l| l.index)),
        );
        status.insert(
            "snapshot_index".into(),
            json!(metrics.snapshot.map(|l| l.index)),
        );
        status.insert(
            "purged_index".into(),
            json!(metrics.purged.map(|l| l.index)),
        );
        status.insert("current_leader".into(), json!(metrics.current_leader));
        status.insert(
            "leader_api_base_url".into(),
            json!(
                metrics
                    .current_leader
                    .and_then(|id| leader_api_base_url(&metrics, id))
            ),
        );
        status.insert("voters".into(), json!(voters));
        status.insert("learners".into(), json!(learners));
        status.insert("num_peers".into(), json!(peers.len()));
        status.insert("peers".into(), Value::Array(peers));
        status.insert("replication".into(), json!(replication));
        status.insert("running".into(), json!(metrics.running_state.is_ok()));
        status.insert("routes".into(), json!(self.fsm.route_count().await));
        status
    }

    async fn submit(&self, cmd: Command) -> Result<WriteAck, ControlError> {
        let metrics = self.metrics();
        if let Err(fatal) = &metrics.running_state {
            return Err(ControlError::Halted {
                message: fatal.to_string(),
            });
        }
        if metrics.state != ServerState::Leader {
            let leader_id = metrics.current_leader;
            debug!(op = cmd.op(), key = cmd.key(), ?leader_id, "write rejected on non-leader");
            return Err(ControlError::NotLeader {
                leader_id,
                leader_api_base_url: leader_id.and_then(|id| leader_api_base_url(&metrics, id)),
            });
        }

        let destination = cmd.key().to_string();
        let op = cmd.op();
        let payload = cmd.encode().map_err(|e| ControlError::Failed {
            message: format!("encode command: {e}"),
        })?;

        debug!(op, destination = %destination, "submitting command");
        let committed = match tokio::time::timeout(self.write_timeout, self.raft.submit(payload))
            .await
        {
            Ok(res) => res?,
            Err(_elapsed) => {
                warn!(
                    op,
                    destination = %destination,
                    timeout_ms = self.write_timeout.as_millis() as u64,
                    "commit not confirmed in time"
                );
                return Err(ControlError::Timeout {
                    after: self.write_timeout,
                });
            }
        };

        match committed.response {
            ClientResponse::Ok { effect } => {
                debug!(op, destination = %destination, index = committed.index, "committed");
                Ok(WriteAck {
                    destination,
                    index: committed.index,
                    term: committed.term,
                    effect,
                })
            }
            ClientResponse::Rejected { code, message } => {
                warn!(op, index = committed.index, code = %code, "committed command rejected");
                Err(ControlError::Rejected { code, message })
            }
        }
    }
}
