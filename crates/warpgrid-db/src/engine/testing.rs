//! Test doubles for the engine seam.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_rusqlite::Connection;
use warpgrid_cluster::{Dial, PeerConn, TunnelError};

use super::{Engine, EngineConfig, EngineError, EngineLauncher, LeaderClient, NodeInfo};
use crate::members::Role;

/// Records dialed addresses and hands back in-memory streams.
#[derive(Default)]
pub(crate) struct RecordingDial {
    dialed: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingDial {
    pub(crate) fn new() -> Arc<Self> {
        Arc::default()
    }

    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub(crate) fn dialed(&self) -> Vec<String> {
        self.dialed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dial for RecordingDial {
    async fn dial(&self, address: &str, _deadline: Instant) -> Result<PeerConn, TunnelError> {
        self.dialed.lock().unwrap().push(address.to_string());
        if self.fail {
            return Err(TunnelError::Timeout {
                address: address.to_string(),
            });
        }
        let (conn, _peer) = tokio::io::duplex(64);
        Ok(Box::new(conn))
    }
}

type CloseHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Launcher whose engines open one SQLite file and report a scripted
/// leader.
pub(crate) struct FakeLauncher {
    db_path: PathBuf,
    leader: Arc<Mutex<Option<String>>>,
    starts: AtomicUsize,
    closes: Arc<AtomicUsize>,
    on_close: Mutex<Option<CloseHook>>,
    fail_start: AtomicBool,
    last_config: Mutex<Option<EngineConfig>>,
}

impl FakeLauncher {
    pub(crate) fn new(db_path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            db_path,
            leader: Arc::default(),
            starts: AtomicUsize::new(0),
            closes: Arc::default(),
            on_close: Mutex::new(None),
            fail_start: AtomicBool::new(false),
            last_config: Mutex::new(None),
        })
    }

    pub(crate) fn set_leader(&self, address: Option<&str>) {
        *self.leader.lock().unwrap() = address.map(str::to_string);
    }

    /// Run `hook` with the running close count after every engine close.
    pub(crate) fn on_close(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.on_close.lock().unwrap() = Some(Arc::new(hook));
    }

    pub(crate) fn fail_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    pub(crate) fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn last_config(&self) -> Option<EngineConfig> {
        self.last_config.lock().unwrap().clone()
    }
}

#[async_trait]
impl EngineLauncher for FakeLauncher {
    async fn start(&self, config: EngineConfig) -> Result<Arc<dyn Engine>, EngineError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(EngineError::Start("refused by test".to_string()));
        }

        let engine = FakeEngine {
            address: config.address.clone(),
            db_path: self.db_path.clone(),
            leader: self.leader.clone(),
            closes: self.closes.clone(),
            on_close: self.on_close.lock().unwrap().clone(),
            closed: AtomicBool::new(false),
        };
        *self.last_config.lock().unwrap() = Some(config);
        Ok(Arc::new(engine))
    }
}

struct FakeEngine {
    address: String,
    db_path: PathBuf,
    leader: Arc<Mutex<Option<String>>>,
    closes: Arc<AtomicUsize>,
    on_close: Option<CloseHook>,
    closed: AtomicBool,
}

#[async_trait]
impl Engine for FakeEngine {
    fn address(&self) -> &str {
        &self.address
    }

    async fn ready(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    async fn open(&self, _name: &str) -> Result<Connection, EngineError> {
        Ok(Connection::open(&self.db_path).await?)
    }

    async fn leader(&self) -> Result<Arc<dyn LeaderClient>, EngineError> {
        Ok(Arc::new(FakeLeader {
            leader: self.leader.clone(),
        }))
    }

    async fn close(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let count = self.closes.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = &self.on_close {
            hook(count);
        }
        Ok(())
    }
}

struct FakeLeader {
    leader: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl LeaderClient for FakeLeader {
    async fn leader(&self) -> Result<NodeInfo, EngineError> {
        let address = self.leader.lock().unwrap().clone();
        address
            .map(|address| NodeInfo {
                id: 1,
                address,
                role: Role::Voter,
            })
            .ok_or(EngineError::NoLeader)
    }

    async fn cluster(&self) -> Result<Vec<NodeInfo>, EngineError> {
        Ok(vec![self.leader().await?])
    }
}
