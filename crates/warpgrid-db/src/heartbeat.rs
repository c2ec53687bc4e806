//! Heartbeat coordinator.
//!
//! Only the leader originates heartbeat rounds. Each attempt checks
//! whether this node currently leads and, if so, asks the local daemon
//! to begin a round through its control socket. Attempts are triggered
//! after every successful outbound dial and, optionally, on a timer.
//! Failures are logged and absorbed; the next trigger retries.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use warpgrid_cluster::HeartbeatInfo;

use crate::database::Database;

/// What a heartbeat attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// The database has not finished opening.
    NotOpen,
    /// Another member leads; nothing to do.
    NotLeader,
    RoundStarted,
    /// A step failed and was logged.
    Failed,
}

impl Database {
    /// Run one heartbeat attempt.
    ///
    /// Concurrent attempts on one node run one after another.
    pub async fn heartbeat(&self) -> HeartbeatOutcome {
        if !self.is_open() {
            return HeartbeatOutcome::NotOpen;
        }

        let _guard = self.inner.heartbeat_lock.lock().await;
        let address = &self.inner.config.listen_address;

        let leader = match self.leader().await {
            Ok(leader) => leader,
            Err(e) => {
                error!(%address, error = %e, "failed to get leader client");
                return HeartbeatOutcome::Failed;
            }
        };

        let info = match leader.leader().await {
            Ok(info) => info,
            Err(e) => {
                error!(%address, error = %e, "failed to get leader address");
                return HeartbeatOutcome::Failed;
            }
        };

        if info.address != *address {
            debug!(%address, leader = %info.address, "not the leader, skipping heartbeat");
            return HeartbeatOutcome::NotLeader;
        }

        let client = match self.inner.control.connect().await {
            Ok(client) => client,
            Err(e) => {
                error!(%address, error = %e, "failed to get control client");
                return HeartbeatOutcome::Failed;
            }
        };

        match client.heartbeat(HeartbeatInfo::begin_round()).await {
            Ok(()) => {
                debug!(%address, "heartbeat round started");
                HeartbeatOutcome::RoundStarted
            }
            Err(e) => {
                error!(%address, error = %e, "failed to begin heartbeat round");
                HeartbeatOutcome::Failed
            }
        }
    }

    /// Run a heartbeat attempt in the background.
    pub fn spawn_heartbeat(&self) -> JoinHandle<HeartbeatOutcome> {
        let db = self.clone();
        tokio::spawn(async move { db.heartbeat().await })
    }

    /// Attempt a heartbeat every `interval` until `shutdown` is cancelled.
    pub async fn run_heartbeats(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.heartbeat().await;
                }
                _ = shutdown.cancelled() => {
                    debug!("heartbeat timer shutting down");
                    break;
                }
            }
        }
    }
}
