//! Single-host engine.
//!
//! Every instance started from one [`LocalEngine`] opens the same SQLite
//! files in a shared cluster directory, so writes made through one member
//! are immediately visible to the others. Leadership is the earliest
//! registered instance that is still running. Peer links are still dialed
//! and accepted through the tunnel so the transport is exercised end to
//! end, but no traffic is replicated over them.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warpgrid_cluster::PeerConn;

use super::{Engine, EngineConfig, EngineError, EngineLauncher, LeaderClient, NodeInfo};
use crate::config::MARKER_FILE;
use crate::members::Role;

/// How long a member waits on another member's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Registry {
    next_id: u64,
    nodes: BTreeMap<u64, NodeInfo>,
}

type SharedRegistry = Arc<Mutex<Registry>>;

fn lock(registry: &SharedRegistry) -> std::sync::MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Contents of the node's `info.yaml` marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub id: u64,
    pub address: String,
    pub role: String,
}

/// Launcher for single-host engine instances sharing `cluster_dir`.
#[derive(Clone)]
pub struct LocalEngine {
    cluster_dir: PathBuf,
    registry: SharedRegistry,
}

impl LocalEngine {
    pub fn new(cluster_dir: impl Into<PathBuf>) -> Self {
        Self {
            cluster_dir: cluster_dir.into(),
            registry: Arc::default(),
        }
    }

    /// Running instances, ordered by registration.
    pub fn nodes(&self) -> Vec<NodeInfo> {
        lock(&self.registry).nodes.values().cloned().collect()
    }
}

#[async_trait]
impl EngineLauncher for LocalEngine {
    async fn start(&self, config: EngineConfig) -> Result<Arc<dyn Engine>, EngineError> {
        tokio::fs::create_dir_all(&config.dir).await?;
        tokio::fs::create_dir_all(&self.cluster_dir).await?;

        let peers = join_peers(&config).await?;

        let id = {
            let mut registry = lock(&self.registry);
            registry.next_id += 1;
            let id = registry.next_id;
            registry.nodes.insert(
                id,
                NodeInfo {
                    id,
                    address: config.address.clone(),
                    role: Role::Voter,
                },
            );
            id
        };

        let marker = config.dir.join(MARKER_FILE);
        if !tokio::fs::try_exists(&marker).await? {
            let state = NodeState {
                id,
                address: config.address.clone(),
                role: Role::Voter.to_string(),
            };
            tokio::fs::write(&marker, serde_yaml::to_string(&state)?).await?;
            debug!(path = %marker.display(), "wrote node marker");
        }

        let instance = Arc::new(LocalInstance {
            id,
            address: config.address.clone(),
            cluster_dir: self.cluster_dir.clone(),
            registry: self.registry.clone(),
            held: Arc::new(Mutex::new(peers)),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        instance.spawn_accept_loop(config.incoming);

        info!(id, address = %config.address, peers = config.cluster.len(), "engine started");
        Ok(instance)
    }
}

/// Dial every configured peer other than this node; at least one must
/// answer when any are listed.
async fn join_peers(config: &EngineConfig) -> Result<Vec<PeerConn>, EngineError> {
    let mut peers = Vec::new();
    if config.cluster.is_empty() {
        return Ok(peers);
    }

    let deadline = Instant::now() + config.dial_timeout;
    let mut last_error = None;
    for address in config.cluster.iter().filter(|a| **a != config.address) {
        match config.dialer.dial(address, deadline).await {
            Ok(conn) => peers.push(conn),
            Err(e) => {
                warn!(%address, error = %e, "failed dialing cluster peer");
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) if peers.is_empty() => Err(EngineError::Tunnel(e)),
        _ => {
            if peers.is_empty() {
                debug!(address = %config.address, "no other peers listed, restarting as sole member");
            }
            Ok(peers)
        }
    }
}

struct LocalInstance {
    id: u64,
    address: String,
    cluster_dir: PathBuf,
    registry: SharedRegistry,
    held: Arc<Mutex<Vec<PeerConn>>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl LocalInstance {
    fn spawn_accept_loop(&self, incoming: warpgrid_cluster::Incoming) {
        let held = self.held.clone();
        let shutdown = self.shutdown.clone();
        let id = self.id;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    conn = incoming.next() => match conn {
                        Some(conn) => {
                            debug!(id, "accepted peer connection");
                            held.lock().unwrap_or_else(PoisonError::into_inner).push(conn);
                        }
                        None => break,
                    },
                }
            }
            debug!(id, "engine accept loop stopped");
        });
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for LocalInstance {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Engine for LocalInstance {
    fn address(&self) -> &str {
        &self.address
    }

    async fn ready(&self) -> Result<(), EngineError> {
        self.ensure_running()
    }

    async fn open(&self, name: &str) -> Result<Connection, EngineError> {
        self.ensure_running()?;
        let conn = Connection::open(self.cluster_dir.join(name)).await?;
        conn.call(|conn: &mut rusqlite::Connection| {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            Ok(())
        })
        .await?;
        Ok(conn)
    }

    async fn leader(&self) -> Result<Arc<dyn LeaderClient>, EngineError> {
        self.ensure_running()?;
        Ok(Arc::new(LocalLeader {
            registry: self.registry.clone(),
        }))
    }

    async fn close(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();
        lock(&self.registry).nodes.remove(&self.id);
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!(id = self.id, address = %self.address, "engine closed");
        Ok(())
    }
}

struct LocalLeader {
    registry: SharedRegistry,
}

#[async_trait]
impl LeaderClient for LocalLeader {
    async fn leader(&self) -> Result<NodeInfo, EngineError> {
        lock(&self.registry)
            .nodes
            .values()
            .next()
            .cloned()
            .ok_or(EngineError::NoLeader)
    }

    async fn cluster(&self) -> Result<Vec<NodeInfo>, EngineError> {
        let nodes: Vec<NodeInfo> = lock(&self.registry).nodes.values().cloned().collect();
        if nodes.is_empty() {
            return Err(EngineError::NoLeader);
        }
        Ok(nodes)
    }
}
