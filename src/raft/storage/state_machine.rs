use std::{io, io::Cursor, sync::Arc};

use chrono::Utc;
use openraft::{
    EntryPayload, ErrorSubject, ErrorVerb, LogId, RaftSnapshotBuilder, Snapshot, SnapshotMeta,
    StoredMembership, storage::RaftStateMachine,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{
    log_store::LogEntry,
    snapshot_store::{FileSnapshotStore, SnapshotStoreError},
};
use crate::{
    raft::types::{ClientResponse, NodeId, NodeMeta, TypeConfig},
    routing::{ApplyEffect, RestoreError, RouteFsm, RouteSnapshot},
};

/// Bridges the routing FSM and the snapshot store into openraft's state machine.
///
/// The FSM itself is shared with the control API, which reads the table directly.
#[derive(Debug, Clone)]
pub struct RouteStateMachine {
    fsm: Arc<RouteFsm>,
    snapshots: FileSnapshotStore,
    membership: Arc<Mutex<StoredMembership<NodeId, NodeMeta>>>,
}

impl RouteStateMachine {
    /// Restore the newest retained snapshot, if any, into `fsm`.
    ///
    /// A snapshot that cannot be verified or decoded fails the open; the node must not come up
    /// with a state that silently differs from what the cluster committed.
    pub async fn open(
        fsm: Arc<RouteFsm>,
        snapshots: FileSnapshotStore,
    ) -> Result<Self, openraft::StorageError<NodeId>> {
        let mut membership = StoredMembership::default();

        let latest = snapshots
            .latest()
            .await
            .map_err(|e| snapshot_err(None, ErrorVerb::Read, e))?;
        if let Some(stored) = latest {
            let snapshot = decode_for(&stored.meta, &stored.data)
                .map_err(|e| restore_err(&stored.meta, e))?;
            fsm.restore(snapshot)
                .await
                .map_err(|e| restore_err(&stored.meta, e))?;
            membership = stored.meta.last_membership.clone();
            info!(
                snapshot_id = %stored.meta.snapshot_id,
                routes = fsm.route_count().await,
                "recovered routing table from snapshot"
            );
        }

        Ok(Self {
            fsm,
            snapshots,
            membership: Arc::new(Mutex::new(membership)),
        })
    }

    pub fn fsm(&self) -> Arc<RouteFsm> {
        self.fsm.clone()
    }

    pub fn snapshots(&self) -> &FileSnapshotStore {
        &self.snapshots
    }
}

/// Serializes a capture taken at a single applied index.
#[derive(Debug)]
pub struct RouteSnapshotBuilder {
    captured: RouteSnapshot,
    membership: StoredMembership<NodeId, NodeMeta>,
    snapshots: FileSnapshotStore,
}

impl RaftSnapshotBuilder<TypeConfig> for RouteSnapshotBuilder {
    async fn build_snapshot(
        &mut self,
    ) -> Result<Snapshot<TypeConfig>, openraft::StorageError<NodeId>> {
        let bytes = self.captured.encode().map_err(|e| {
            openraft::StorageError::from_io_error(
                ErrorSubject::Snapshot(None),
                ErrorVerb::Write,
                io::Error::other(e),
            )
        })?;

        let meta = SnapshotMeta {
            last_log_id: self.captured.last_applied,
            last_membership: self.membership.clone(),
            snapshot_id: format!(
                "{}-{}-{}",
                self.captured.last_term(),
                self.captured.last_index(),
                Utc::now().timestamp_millis()
            ),
        };

        self.snapshots
            .save(&meta, &bytes)
            .await
            .map_err(|e| snapshot_err(Some(&meta), ErrorVerb::Write, e))?;

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(bytes)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for RouteStateMachine {
    type SnapshotBuilder = RouteSnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<
        (Option<LogId<NodeId>>, StoredMembership<NodeId, NodeMeta>),
        openraft::StorageError<NodeId>,
    > {
        let membership = self.membership.lock().await.clone();
        Ok((self.fsm.last_applied().await, membership))
    }

    async fn apply<I>(
        &mut self,
        entries: I,
    ) -> Result<Vec<ClientResponse>, openraft::StorageError<NodeId>>
    where
        I: IntoIterator<Item = LogEntry> + openraft::OptionalSend,
        I::IntoIter: openraft::OptionalSend,
    {
        let mut responses = Vec::new();

        for entry in entries {
            let log_id = entry.log_id;
            let resp = match entry.payload {
                EntryPayload::Normal(payload) => {
                    match self.fsm.apply(log_id, payload.as_bytes()).await {
                        Ok(effect) => ClientResponse::Ok { effect },
                        Err(err) => ClientResponse::Rejected {
                            code: err.code().to_string(),
                            message: err.to_string(),
                        },
                    }
                }
                EntryPayload::Membership(membership) => {
                    *self.membership.lock().await = StoredMembership::new(Some(log_id), membership);
                    self.fsm.mark_applied(log_id).await;
                    ClientResponse::Ok {
                        effect: ApplyEffect::Noop,
                    }
                }
                EntryPayload::Blank => {
                    self.fsm.mark_applied(log_id).await;
                    ClientResponse::Ok {
                        effect: ApplyEffect::Noop,
                    }
                }
            };
            responses.push(resp);
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        // Captured here, between applies, so the table and membership agree on one log position
        // even though openraft builds the snapshot concurrently with later applies.
        RouteSnapshotBuilder {
            captured: self.fsm.snapshot().await,
            membership: self.membership.lock().await.clone(),
            snapshots: self.snapshots.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<
        Box<<TypeConfig as openraft::RaftTypeConfig>::SnapshotData>,
        openraft::StorageError<NodeId>,
    > {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, NodeMeta>,
        snapshot: Box<<TypeConfig as openraft::RaftTypeConfig>::SnapshotData>,
    ) -> Result<(), openraft::StorageError<NodeId>> {
        let data = snapshot.into_inner();

        // Validate before touching disk or memory so a bad transfer leaves the node as it was.
        let decoded = decode_for(meta, &data).map_err(|e| restore_err(meta, e))?;

        self.snapshots
            .save(meta, &data)
            .await
            .map_err(|e| snapshot_err(Some(meta), ErrorVerb::Write, e))?;
        self.fsm
            .restore(decoded)
            .await
            .map_err(|e| restore_err(meta, e))?;
        *self.membership.lock().await = meta.last_membership.clone();

        info!(snapshot_id = %meta.snapshot_id, "installed snapshot from leader");
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, openraft::StorageError<NodeId>> {
        let latest = self
            .snapshots
            .latest()
            .await
            .map_err(|e| snapshot_err(None, ErrorVerb::Read, e))?;
        Ok(latest.map(|stored| Snapshot {
            meta: stored.meta,
            snapshot: Box::new(Cursor::new(stored.data)),
        }))
    }
}

fn decode_for(
    meta: &SnapshotMeta<NodeId, NodeMeta>,
    data: &[u8],
) -> Result<RouteSnapshot, RestoreError> {
    let snapshot = RouteSnapshot::decode(data)?;
    if snapshot.last_applied != meta.last_log_id {
        return Err(RestoreError::LogIdMismatch {
            expected: meta.last_log_id,
            got: snapshot.last_applied,
        });
    }
    Ok(snapshot)
}

fn snapshot_err(
    meta: Option<&SnapshotMeta<NodeId, NodeMeta>>,
    verb: ErrorVerb,
    err: SnapshotStoreError,
) -> openraft::StorageError<NodeId> {
    openraft::StorageError::from_io_error(
        ErrorSubject::Snapshot(meta.map(|m| m.signature())),
        verb,
        err.into(),
    )
}

fn restore_err(
    meta: &SnapshotMeta<NodeId, NodeMeta>,
    err: RestoreError,
) -> openraft::StorageError<NodeId> {
    warn!(snapshot_id = %meta.snapshot_id, error = %err, "refusing snapshot");
    openraft::StorageError::from_io_error(
        ErrorSubject::Snapshot(Some(meta.signature())),
        ErrorVerb::Read,
        io::Error::new(io::ErrorKind::InvalidData, err.to_string()),
    )
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use openraft::{CommittedLeaderId, Membership};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        raft::types::CommandPayload,
        routing::{Command, Route},
    };

    fn log_id(index: u64) -> LogId<NodeId> {
        LogId::new(CommittedLeaderId::new(1, 1), index)
    }

    fn normal(index: u64, cmd: Command) -> LogEntry {
        openraft::impls::Entry {
            log_id: log_id(index),
            payload: EntryPayload::Normal(cmd.encode().unwrap()),
        }
    }

    fn membership_entry(index: u64) -> LogEntry {
        let nodes = BTreeMap::from([(1, NodeMeta::default())]);
        openraft::impls::Entry {
            log_id: log_id(index),
            payload: EntryPayload::Membership(Membership::new(
                vec![BTreeSet::from([1])],
                nodes,
            )),
        }
    }

    async fn open(dir: &std::path::Path) -> RouteStateMachine {
        let snapshots = FileSnapshotStore::open(dir, 2).await.unwrap();
        RouteStateMachine::open(Arc::new(RouteFsm::new()), snapshots)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn apply_returns_one_response_per_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sm = open(tmp.path()).await;

        let responses = sm
            .apply(vec![
                membership_entry(1),
                normal(2, Command::AddRoute(Route::new("A", "X", 1))),
                openraft::impls::Entry {
                    log_id: log_id(3),
                    payload: EntryPayload::Normal(CommandPayload::new(
                        br#"{"op":"BOGUS","key":"A"}"#.to_vec(),
                    )),
                },
                openraft::impls::Entry {
                    log_id: log_id(4),
                    payload: EntryPayload::Blank,
                },
            ])
            .await
            .unwrap();

        assert_eq!(responses.len(), 4);
        assert_eq!(
            responses[1],
            ClientResponse::Ok {
                effect: ApplyEffect::RouteAdded {
                    destination: "A".to_string(),
                    replaced: false
                }
            }
        );
        assert!(matches!(
            &responses[2],
            ClientResponse::Rejected { code, .. } if code == "unknown_operation"
        ));

        let (applied, membership) = sm.applied_state().await.unwrap();
        assert_eq!(applied, Some(log_id(4)));
        assert_eq!(membership.log_id(), &Some(log_id(1)));
    }

    #[tokio::test]
    async fn builder_captures_state_at_request_time() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sm = open(tmp.path()).await;
        sm.apply(vec![
            membership_entry(1),
            normal(2, Command::AddRoute(Route::new("A", "X", 1))),
        ])
        .await
        .unwrap();

        let mut builder = sm.get_snapshot_builder().await;
        sm.apply(vec![normal(
            3,
            Command::DeleteRoute {
                destination: "A".to_string(),
            },
        )])
        .await
        .unwrap();

        let snapshot = builder.build_snapshot().await.unwrap();
        assert_eq!(snapshot.meta.last_log_id, Some(log_id(2)));
        let captured = RouteSnapshot::decode(snapshot.snapshot.get_ref()).unwrap();
        assert_eq!(captured.table.len(), 1);
    }

    #[tokio::test]
    async fn reopen_restores_latest_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mut sm = open(tmp.path()).await;
            sm.apply(vec![
                membership_entry(1),
                normal(2, Command::AddRoute(Route::new("A", "X", 1))),
                normal(3, Command::AddRoute(Route::new("B", "Y", 2))),
            ])
            .await
            .unwrap();
            sm.get_snapshot_builder()
                .await
                .build_snapshot()
                .await
                .unwrap();
        }

        let mut sm = open(tmp.path()).await;
        let (applied, membership) = sm.applied_state().await.unwrap();
        assert_eq!(applied, Some(log_id(3)));
        assert_eq!(membership.log_id(), &Some(log_id(1)));
        assert_eq!(sm.fsm().routes().await.len(), 2);
        assert!(sm.get_current_snapshot().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn install_snapshot_replaces_table() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sm = open(tmp.path()).await;
        sm.apply(vec![normal(1, Command::AddRoute(Route::new("old", "X", 1)))])
            .await
            .unwrap();

        let source = RouteFsm::new();
        source
            .apply(
                log_id(7),
                Command::AddRoute(Route::new("new", "Y", 3))
                    .encode()
                    .unwrap()
                    .as_bytes(),
            )
            .await
            .unwrap();
        let bytes = source.snapshot().await.encode().unwrap();
        let meta = SnapshotMeta {
            last_log_id: Some(log_id(7)),
            last_membership: StoredMembership::default(),
            snapshot_id: "1-7-0".to_string(),
        };

        sm.install_snapshot(&meta, Box::new(Cursor::new(bytes)))
            .await
            .unwrap();

        let routes = sm.fsm().routes().await;
        assert_eq!(routes.keys().collect::<Vec<_>>(), vec!["new"]);
        assert_eq!(sm.fsm().last_applied().await, Some(log_id(7)));
    }

    #[tokio::test]
    async fn corrupt_install_leaves_state_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sm = open(tmp.path()).await;
        sm.apply(vec![normal(1, Command::AddRoute(Route::new("A", "X", 1)))])
            .await
            .unwrap();
        let before = sm.fsm().snapshot().await;

        let meta = SnapshotMeta {
            last_log_id: Some(log_id(9)),
            last_membership: StoredMembership::default(),
            snapshot_id: "1-9-0".to_string(),
        };
        let res = sm
            .install_snapshot(&meta, Box::new(Cursor::new(b"garbage".to_vec())))
            .await;
        assert!(res.is_err());
        assert_eq!(sm.fsm().snapshot().await, before);
        assert!(sm.snapshots().latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tampered_snapshot_fails_open() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = {
            let mut sm = open(tmp.path()).await;
            sm.apply(vec![normal(1, Command::AddRoute(Route::new("A", "X", 1)))])
                .await
                .unwrap();
            sm.get_snapshot_builder()
                .await
                .build_snapshot()
                .await
                .unwrap();
            sm.snapshots().dir().to_path_buf()
        };

        let snapshot_dir = std::fs::read_dir(&dir)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        std::fs::write(snapshot_dir.join("state.json"), b"{}").unwrap();

        let snapshots = FileSnapshotStore::open(tmp.path(), 2).await.unwrap();
        let res = RouteStateMachine::open(Arc::new(RouteFsm::new()), snapshots).await;
        assert!(res.is_err());
    }
}
