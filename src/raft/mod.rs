//! Consensus wiring: openraft type config, durable storage, the HTTP peer transport and the facade
//! the control API submits through.

pub mod app;
pub mod http_rpc;
pub mod network_http;
pub mod runtime;
pub mod snapshot_manager;
pub mod storage;
pub mod types;

pub use app::{Committed, ConsensusError, RaftFacade, RealRaft};
pub use runtime::{RaftRuntime, RaftSettings, start_raft};
pub use types::{NodeId, NodeMeta, TypeConfig};
