//! Durable storage behind openraft's storage-v2 split: the log store (`RaftLogStorage`) and the
//! state machine (`RaftStateMachine`) with its snapshot files.

mod fs;
pub mod log_store;
pub mod snapshot_store;
pub mod state_machine;

pub use log_store::{FileLogStore, LogEntry, LogStoreError};
pub use snapshot_store::{FileSnapshotStore, SnapshotStoreError, StoredSnapshot};
pub use state_machine::{RouteSnapshotBuilder, RouteStateMachine};
