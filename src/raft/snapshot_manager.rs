//! When to snapshot.
//!
//! Two triggers run side by side: openraft's own `LogsSinceLast(threshold)` policy fires as soon as
//! `threshold` entries were applied past the last snapshot, and [`spawn_snapshot_ticker`] fires on a
//! fixed interval whenever anything was applied since the last one. Building and persisting is the
//! state machine's job (`storage::state_machine`); log compaction after a snapshot keeps
//! `trailing_logs` entries for slow followers.

use std::time::Duration;

use openraft::SnapshotPolicy;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::raft::{app::Metrics, types::TypeConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotSettings {
    /// Applied entries since the last snapshot that force a new one.
    pub threshold: u64,
    pub interval: Duration,
    /// Snapshots kept on disk, newest first.
    pub retain: usize,
    /// Entries kept in the log behind the newest snapshot.
    pub trailing_logs: u64,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            threshold: 1024,
            interval: Duration::from_secs(30),
            retain: 2,
            trailing_logs: 1024,
        }
    }
}

impl SnapshotSettings {
    pub fn policy(&self) -> SnapshotPolicy {
        SnapshotPolicy::LogsSinceLast(self.threshold.max(1))
    }
}

/// Entries applied after the newest snapshot.
pub fn applied_since_snapshot(metrics: &Metrics) -> u64 {
    let Some(applied) = metrics.last_applied else {
        return 0;
    };
    match metrics.snapshot {
        Some(snapshot) => applied.index.saturating_sub(snapshot.index),
        None => applied.index + 1,
    }
}

pub fn spawn_snapshot_ticker(
    raft: openraft::Raft<TypeConfig>,
    settings: SnapshotSettings,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let metrics = raft.metrics().borrow().clone();
            if let Err(fatal) = &metrics.running_state {
                warn!(error = %fatal, "raft stopped; snapshot ticker exiting");
                break;
            }
            let pending = applied_since_snapshot(&metrics);
            if pending == 0 {
                debug!("no entries since last snapshot");
                continue;
            }

            info!(pending, "interval snapshot");
            if let Err(err) = raft.trigger().snapshot().await {
                warn!(error = %err, "trigger snapshot failed; snapshot ticker exiting");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use openraft::{CommittedLeaderId, LogId};

    use super::*;

    fn log_id(index: u64) -> LogId<u64> {
        LogId::new(CommittedLeaderId::new(1, 1), index)
    }

    #[test]
    fn counts_entries_since_last_snapshot() {
        let mut metrics = Metrics::new_initial(1);
        assert_eq!(applied_since_snapshot(&metrics), 0);

        metrics.last_applied = Some(log_id(0));
        assert_eq!(applied_since_snapshot(&metrics), 1);

        metrics.last_applied = Some(log_id(12));
        metrics.snapshot = Some(log_id(10));
        assert_eq!(applied_since_snapshot(&metrics), 2);

        metrics.snapshot = Some(log_id(12));
        assert_eq!(applied_since_snapshot(&metrics), 0);
    }

    #[test]
    fn policy_never_uses_zero_threshold() {
        let settings = SnapshotSettings {
            threshold: 0,
            ..Default::default()
        };
        assert!(matches!(settings.policy(), SnapshotPolicy::LogsSinceLast(1)));
    }
}
