//! Deterministic routing-table state machine.
//!
//! Every committed log entry carries an opaque payload. [`RouteFsm::apply`] decodes it into a
//! [`Command`] and applies it to the in-memory [`RoutingTable`]. Nodes that apply the same ordered
//! prefix of the log end up with identical tables, and [`RouteSnapshot`] captures a table together
//! with the log position it reflects so the log prefix can be discarded.
//!
//! The table is only ever mutated here: `apply` (one entry at a time, in log order) and `restore`
//! (whole-table replacement). Readers get clones, never references into the map.

use std::collections::BTreeMap;

use openraft::LogId;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::raft::types::{CommandPayload, NodeId};

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

pub const OP_ADD_ROUTE: &str = "ADD_ROUTE";
pub const OP_DELETE_ROUTE: &str = "DELETE_ROUTE";

/// One routing-table entry, keyed by `destination`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub destination: String,
    pub next_hop: String,
    pub metric: i64,
}

impl Route {
    pub fn new(destination: impl Into<String>, next_hop: impl Into<String>, metric: i64) -> Self {
        Self {
            destination: destination.into(),
            next_hop: next_hop.into(),
            metric,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.destination.trim().is_empty() {
            return Err(ValidationError::EmptyDestination);
        }
        if self.metric < 0 {
            return Err(ValidationError::NegativeMetric {
                metric: self.metric,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    EmptyDestination,
    NegativeMetric { metric: i64 },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyDestination => write!(f, "destination must not be empty"),
            Self::NegativeMetric { metric } => {
                write!(f, "metric must be non-negative, got {metric}")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// A routing mutation, the unit of replication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Insert or fully replace the route for `route.destination`.
    AddRoute(Route),
    /// Remove the route for `destination`; absent keys are a successful no-op.
    DeleteRoute { destination: String },
}

/// JSON shape of a command inside a log entry: `{"op": "...", "key": "...", "value": {...}}`.
#[derive(Debug, Serialize, Deserialize)]
struct WireCommand {
    op: String,
    #[serde(default)]
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Route>,
}

impl Command {
    pub fn op(&self) -> &'static str {
        match self {
            Self::AddRoute(_) => OP_ADD_ROUTE,
            Self::DeleteRoute { .. } => OP_DELETE_ROUTE,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::AddRoute(route) => &route.destination,
            Self::DeleteRoute { destination } => destination,
        }
    }

    pub fn encode(&self) -> Result<CommandPayload, serde_json::Error> {
        let wire = match self {
            Self::AddRoute(route) => WireCommand {
                op: OP_ADD_ROUTE.to_string(),
                key: route.destination.clone(),
                value: Some(route.clone()),
            },
            Self::DeleteRoute { destination } => WireCommand {
                op: OP_DELETE_ROUTE.to_string(),
                key: destination.clone(),
                value: None,
            },
        };
        Ok(CommandPayload::new(serde_json::to_vec(&wire)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ApplyError> {
        let wire: WireCommand = serde_json::from_slice(bytes).map_err(|e| ApplyError::Decode {
            reason: e.to_string(),
        })?;

        match wire.op.as_str() {
            OP_ADD_ROUTE => {
                let route = wire.value.ok_or_else(|| ApplyError::Decode {
                    reason: "ADD_ROUTE without a value".to_string(),
                })?;
                if route.destination != wire.key {
                    return Err(ApplyError::Decode {
                        reason: format!(
                            "ADD_ROUTE key {:?} does not match destination {:?}",
                            wire.key, route.destination
                        ),
                    });
                }
                route.validate().map_err(|e| ApplyError::Decode {
                    reason: format!("invalid route: {e}"),
                })?;
                Ok(Self::AddRoute(route))
            }
            OP_DELETE_ROUTE => {
                if wire.key.is_empty() {
                    return Err(ApplyError::Decode {
                        reason: "DELETE_ROUTE without a key".to_string(),
                    });
                }
                Ok(Self::DeleteRoute {
                    destination: wire.key,
                })
            }
            _ => Err(ApplyError::UnknownOperation { op: wire.op }),
        }
    }
}

/// A committed entry that could not be applied. The entry still counts as applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    Decode { reason: String },
    UnknownOperation { op: String },
}

impl ApplyError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Decode { .. } => "decode_error",
            Self::UnknownOperation { .. } => "unknown_operation",
        }
    }
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode { reason } => write!(f, "malformed command: {reason}"),
            Self::UnknownOperation { op } => write!(f, "unknown operation: {op}"),
        }
    }
}

impl std::error::Error for ApplyError {}

/// What a successfully applied entry did to the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApplyEffect {
    RouteAdded { destination: String, replaced: bool },
    RouteDeleted { destination: String, existed: bool },
    /// Blank and membership entries.
    Noop,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingTable {
    routes: BTreeMap<String, Route>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last-writer-wins: the previous value for the destination, if any, is returned and dropped.
    pub fn upsert(&mut self, route: Route) -> Option<Route> {
        self.routes.insert(route.destination.clone(), route)
    }

    pub fn remove(&mut self, destination: &str) -> Option<Route> {
        self.routes.remove(destination)
    }

    pub fn get(&self, destination: &str) -> Option<&Route> {
        self.routes.get(destination)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Route)> {
        self.routes.iter()
    }

    pub fn to_map(&self) -> BTreeMap<String, Route> {
        self.routes.clone()
    }

    fn check_consistent(&self) -> Result<(), RestoreError> {
        for (key, route) in &self.routes {
            if key != &route.destination {
                return Err(RestoreError::InconsistentRoute {
                    key: key.clone(),
                    reason: format!("keyed under a different destination {:?}", route.destination),
                });
            }
            route
                .validate()
                .map_err(|e| RestoreError::InconsistentRoute {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }
}

impl FromIterator<Route> for RoutingTable {
    fn from_iter<T: IntoIterator<Item = Route>>(iter: T) -> Self {
        let mut table = Self::new();
        for route in iter {
            table.upsert(route);
        }
        table
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreError {
    Malformed {
        reason: String,
    },
    SchemaVersionMismatch {
        expected: u32,
        got: u32,
    },
    InconsistentRoute {
        key: String,
        reason: String,
    },
    LogIdMismatch {
        expected: Option<LogId<NodeId>>,
        got: Option<LogId<NodeId>>,
    },
}

impl std::fmt::Display for RestoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed { reason } => write!(f, "malformed snapshot: {reason}"),
            Self::SchemaVersionMismatch { expected, got } => {
                write!(
                    f,
                    "snapshot schema_version mismatch: expected {expected}, got {got}"
                )
            }
            Self::InconsistentRoute { key, reason } => {
                write!(f, "snapshot route {key:?} is invalid: {reason}")
            }
            Self::LogIdMismatch { expected, got } => write!(
                f,
                "snapshot covers {} but its metadata says {}",
                display_log_id(got),
                display_log_id(expected)
            ),
        }
    }
}

impl std::error::Error for RestoreError {}

fn display_log_id(log_id: &Option<LogId<NodeId>>) -> String {
    match log_id {
        Some(log_id) => format!("{}-{}", log_id.leader_id.term, log_id.index),
        None => "nothing".to_string(),
    }
}

/// Point-in-time copy of the table and the last log id it reflects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSnapshot {
    pub last_applied: Option<LogId<NodeId>>,
    pub table: RoutingTable,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotPayload {
    schema_version: u32,
    last_index: u64,
    last_term: u64,
    last_applied: Option<LogId<NodeId>>,
    routes: RoutingTable,
}

impl RouteSnapshot {
    pub fn last_index(&self) -> u64 {
        self.last_applied.map(|l| l.index).unwrap_or(0)
    }

    pub fn last_term(&self) -> u64 {
        self.last_applied.map(|l| l.leader_id.term).unwrap_or(0)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&SnapshotPayload {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            last_index: self.last_index(),
            last_term: self.last_term(),
            last_applied: self.last_applied,
            routes: self.table.clone(),
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RestoreError> {
        let payload: SnapshotPayload =
            serde_json::from_slice(bytes).map_err(|e| RestoreError::Malformed {
                reason: e.to_string(),
            })?;
        if payload.schema_version != SNAPSHOT_SCHEMA_VERSION {
            return Err(RestoreError::SchemaVersionMismatch {
                expected: SNAPSHOT_SCHEMA_VERSION,
                got: payload.schema_version,
            });
        }
        let snapshot = Self {
            last_applied: payload.last_applied,
            table: payload.routes,
        };
        if snapshot.last_index() != payload.last_index || snapshot.last_term() != payload.last_term
        {
            return Err(RestoreError::Malformed {
                reason: format!(
                    "header says {}-{}, last_applied says {}",
                    payload.last_term,
                    payload.last_index,
                    display_log_id(&payload.last_applied)
                ),
            });
        }
        snapshot.table.check_consistent()?;
        Ok(snapshot)
    }
}

#[derive(Debug, Default)]
struct FsmState {
    table: RoutingTable,
    last_applied: Option<LogId<NodeId>>,
}

/// The routing finite state machine.
///
/// `apply`, `mark_applied` and `restore` take the write lock; reads and `snapshot` take the read
/// lock, so a reader never observes a half-applied command and a snapshot never interleaves with an
/// apply.
#[derive(Debug, Default)]
pub struct RouteFsm {
    state: RwLock<FsmState>,
}

impl RouteFsm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one committed entry.
    ///
    /// The entry's log id is recorded as applied even when the payload is rejected: a bad command
    /// is a business error, not a consensus failure.
    pub async fn apply(
        &self,
        log_id: LogId<NodeId>,
        payload: &[u8],
    ) -> Result<ApplyEffect, ApplyError> {
        let decoded = Command::decode(payload);

        let mut state = self.state.write().await;
        debug_assert!(
            state.last_applied.is_none_or(|l| l.index < log_id.index),
            "apply out of order: {:?} after {:?}",
            log_id,
            state.last_applied
        );
        state.last_applied = Some(log_id);

        let cmd = match decoded {
            Ok(cmd) => cmd,
            Err(err) => {
                warn!(index = log_id.index, error = %err, "rejected committed command");
                return Err(err);
            }
        };

        let effect = match cmd {
            Command::AddRoute(route) => {
                let destination = route.destination.clone();
                debug!(
                    index = log_id.index,
                    destination = %destination,
                    next_hop = %route.next_hop,
                    metric = route.metric,
                    "added route"
                );
                let replaced = state.table.upsert(route).is_some();
                ApplyEffect::RouteAdded {
                    destination,
                    replaced,
                }
            }
            Command::DeleteRoute { destination } => {
                let existed = state.table.remove(&destination).is_some();
                debug!(index = log_id.index, destination = %destination, existed, "deleted route");
                ApplyEffect::RouteDeleted {
                    destination,
                    existed,
                }
            }
        };
        Ok(effect)
    }

    /// Advance the applied position for entries that carry no command (blank, membership).
    pub async fn mark_applied(&self, log_id: LogId<NodeId>) {
        let mut state = self.state.write().await;
        state.last_applied = Some(log_id);
    }

    pub async fn snapshot(&self) -> RouteSnapshot {
        let state = self.state.read().await;
        RouteSnapshot {
            last_applied: state.last_applied,
            table: state.table.clone(),
        }
    }

    /// Replace the whole table. On error the current state is left untouched.
    pub async fn restore(&self, snapshot: RouteSnapshot) -> Result<(), RestoreError> {
        snapshot.table.check_consistent()?;

        let mut state = self.state.write().await;
        info!(
            last_index = snapshot.last_index(),
            last_term = snapshot.last_term(),
            routes = snapshot.table.len(),
            "restored routing table from snapshot"
        );
        state.table = snapshot.table;
        state.last_applied = snapshot.last_applied;
        Ok(())
    }

    pub async fn restore_from_bytes(&self, bytes: &[u8]) -> Result<RouteSnapshot, RestoreError> {
        let snapshot = RouteSnapshot::decode(bytes)?;
        self.restore(snapshot.clone()).await?;
        Ok(snapshot)
    }

    pub async fn routes(&self) -> BTreeMap<String, Route> {
        self.state.read().await.table.to_map()
    }

    pub async fn route(&self, destination: &str) -> Option<Route> {
        self.state.read().await.table.get(destination).cloned()
    }

    pub async fn route_count(&self) -> usize {
        self.state.read().await.table.len()
    }

    pub async fn last_applied(&self) -> Option<LogId<NodeId>> {
        self.state.read().await.last_applied
    }
}
