//! Seam to the embedded replicated SQL engine.
//!
//! The engine owns consensus and replication. This crate only starts it,
//! opens the database through it, asks it who leads, and closes it. It
//! never opens sockets of its own: peer links go through the supplied
//! [`Dial`] and arrive through [`Incoming`].

pub mod local;

#[cfg(test)]
pub(crate) mod testing;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use warpgrid_cluster::{Dial, Incoming, TunnelError};

use crate::members::Role;

pub use local::LocalEngine;

/// Errors raised by an engine implementation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to start engine: {0}")]
    Start(String),

    #[error("no leader is currently known")]
    NoLeader,

    #[error("engine is closed")]
    Closed,

    #[error("failed to open database: {0}")]
    Open(#[from] tokio_rusqlite::Error),

    #[error("engine state file error: {0}")]
    State(#[from] serde_yaml::Error),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A node as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: u64,
    pub address: String,
    pub role: Role,
}

/// Parameters for one engine instance.
#[derive(Clone)]
pub struct EngineConfig {
    /// Node-local data directory.
    pub dir: PathBuf,
    /// This node's address.
    pub address: String,
    /// Peers to join. Empty when founding a new cluster.
    pub cluster: Vec<String>,
    pub dial_timeout: Duration,
    pub dialer: Arc<dyn Dial>,
    pub incoming: Incoming,
}

/// Starts engine instances.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn start(&self, config: EngineConfig) -> Result<Arc<dyn Engine>, EngineError>;
}

/// A running engine instance.
#[async_trait]
pub trait Engine: Send + Sync {
    fn address(&self) -> &str;

    /// Resolve once the instance can serve queries.
    async fn ready(&self) -> Result<(), EngineError>;

    /// Open the named replicated database.
    async fn open(&self, name: &str) -> Result<tokio_rusqlite::Connection, EngineError>;

    /// A client bound to the current leader.
    async fn leader(&self) -> Result<Arc<dyn LeaderClient>, EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}

/// Queries answered by the current leader.
#[async_trait]
pub trait LeaderClient: Send + Sync {
    /// The leader's own view of itself.
    async fn leader(&self) -> Result<NodeInfo, EngineError>;

    /// The leader's view of cluster membership.
    async fn cluster(&self) -> Result<Vec<NodeInfo>, EngineError>;
}
