//! Cluster controller: owns the embedded engine for this process.
//!
//! A [`Database`] is created closed. [`Database::bootstrap`] founds a
//! new cluster and [`Database::join`] enters an existing one; either
//! way the handle flips to open exactly once, after the schema has been
//! brought up to date. Every engine instance gets the same tunnel hooks:
//! a dialer that also nudges the heartbeat coordinator, and the shared
//! inbound queue fed by the HTTP endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tokio_rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use warpgrid_cluster::tunnel::{self, Acceptor, Incoming};
use warpgrid_cluster::{CertKeyPair, ControlConnector, Dial, PeerConn, TunnelDialer, TunnelError};

use crate::config::DatabaseConfig;
use crate::engine::{Engine, EngineConfig, EngineLauncher, LeaderClient, NodeInfo};
use crate::error::{DbError, DbResult, carry};
use crate::schema::{Ensured, MemberVersionCheck, Schema, SchemaCheck, Update};

/// Handle to the replicated cluster database. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) config: DatabaseConfig,
    server_cert: CertKeyPair,
    launcher: Arc<dyn EngineLauncher>,
    pub(crate) control: Arc<dyn ControlConnector>,
    schema: Schema,
    handle: Mutex<Option<Handle>>,
    acceptor: Acceptor,
    incoming: Incoming,
    upgraded: Notify,
    open: watch::Sender<bool>,
    pub(crate) heartbeat_lock: tokio::sync::Mutex<()>,
    pub(crate) shutdown: CancellationToken,
}

#[derive(Clone)]
struct Handle {
    engine: Arc<dyn Engine>,
    conn: Connection,
    /// Stops the periodic heartbeat timer, when one is configured.
    timer: Option<CancellationToken>,
}

/// Builder for [`Database`].
pub struct DatabaseBuilder {
    config: DatabaseConfig,
    server_cert: CertKeyPair,
    launcher: Arc<dyn EngineLauncher>,
    control: Option<Arc<dyn ControlConnector>>,
    extensions: Vec<Update>,
    shutdown: CancellationToken,
}

impl DatabaseBuilder {
    /// Local control-plane connector. Defaults to the configured control
    /// socket.
    pub fn control(mut self, control: Arc<dyn ControlConnector>) -> Self {
        self.control = Some(control);
        self
    }

    /// Application schema updates, applied after the cluster's own.
    pub fn schema_updates(mut self, updates: Vec<Update>) -> Self {
        self.extensions = updates;
        self
    }

    /// Process-wide shutdown signal. Cancelling it abandons in-flight
    /// joins, dials and hand-offs.
    pub fn shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn build(self) -> DbResult<Database> {
        self.config.validate()?;
        self.server_cert.certificate()?;

        let control = match self.control {
            Some(control) => control,
            None => default_control(&self.config)?,
        };

        let (acceptor, incoming) = tunnel::handoff(self.shutdown.clone());
        let (open, _) = watch::channel(false);

        Ok(Database {
            inner: Arc::new(Inner {
                schema: Schema::with_extensions(&self.extensions),
                config: self.config,
                server_cert: self.server_cert,
                launcher: self.launcher,
                control,
                handle: Mutex::new(None),
                acceptor,
                incoming,
                upgraded: Notify::new(),
                open,
                heartbeat_lock: tokio::sync::Mutex::new(()),
                shutdown: self.shutdown,
            }),
        })
    }
}

#[cfg(unix)]
fn default_control(config: &DatabaseConfig) -> DbResult<Arc<dyn ControlConnector>> {
    Ok(Arc::new(warpgrid_cluster::ControlSocket::new(
        config.control_socket_path(),
    )))
}

#[cfg(not(unix))]
fn default_control(_config: &DatabaseConfig) -> DbResult<Arc<dyn ControlConnector>> {
    Err(DbError::Config(
        "a control connector must be supplied on this platform".to_string(),
    ))
}

impl Database {
    pub fn builder(
        config: DatabaseConfig,
        server_cert: CertKeyPair,
        launcher: Arc<dyn EngineLauncher>,
    ) -> DatabaseBuilder {
        DatabaseBuilder {
            config,
            server_cert,
            launcher,
            control: None,
            extensions: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    pub fn server_cert(&self) -> &CertKeyPair {
        &self.inner.server_cert
    }

    /// Schema version this build brings the database to.
    pub fn schema_version(&self) -> u32 {
        self.inner.schema.version()
    }

    /// Found a new single-member cluster.
    ///
    /// Fails if this node already has on-disk cluster state.
    pub async fn bootstrap(&self, cluster_cert: &CertKeyPair) -> DbResult<()> {
        self.ensure_closed()?;
        let marker = self.inner.config.marker_path();
        if tokio::fs::try_exists(&marker).await? {
            return Err(DbError::Precondition(format!(
                "database already initialized at {}",
                marker.display()
            )));
        }

        let result = self.bootstrap_engine(cluster_cert).await;
        if result.is_err() {
            self.discard_marker().await;
        }
        result
    }

    async fn bootstrap_engine(&self, cluster_cert: &CertKeyPair) -> DbResult<()> {
        let engine = self.start_engine(cluster_cert, Vec::new()).await?;
        let opened = tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => Err(DbError::Cancelled),
            opened = self.open(engine.clone(), true) => opened,
        };

        if let Err(e) = opened {
            self.close_engine(&engine, "bootstrap failed").await;
            return Err(e);
        }

        info!(address = %self.inner.config.listen_address, "cluster bootstrapped");
        Ok(())
    }

    /// Join an existing cluster through `peers`.
    ///
    /// A graceful-restart request from the schema check closes the local
    /// engine and starts the join over. This repeats until the join
    /// succeeds, fails for another reason, or `max_join_attempts` is
    /// reached.
    pub async fn join(&self, cluster_cert: &CertKeyPair, peers: &[String]) -> DbResult<()> {
        self.ensure_closed()?;
        if peers.is_empty() {
            return Err(DbError::Precondition(
                "joining requires at least one peer address".to_string(),
            ));
        }

        // A node rejoining its cluster keeps its marker whatever happens.
        let rejoining = tokio::fs::try_exists(self.inner.config.marker_path()).await?;
        let result = self.join_engine(cluster_cert, peers).await;
        if result.is_err() && !rejoining {
            self.discard_marker().await;
        }
        result
    }

    async fn join_engine(&self, cluster_cert: &CertKeyPair, peers: &[String]) -> DbResult<()> {
        let max_attempts = self.inner.config.max_join_attempts;
        let mut attempts = 0u32;

        loop {
            if self.inner.shutdown.is_cancelled() {
                return Err(DbError::Cancelled);
            }
            attempts += 1;

            let engine = self.start_engine(cluster_cert, peers.to_vec()).await?;
            let opened = tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => Err(DbError::Cancelled),
                opened = self.open(engine.clone(), false) => opened,
            };

            match opened {
                Ok(()) => {
                    info!(attempts, peers = ?peers, "joined cluster");
                    return Ok(());
                }
                Err(DbError::GracefulRestart) => {
                    self.close_engine(&engine, "graceful restart").await;
                    if max_attempts.is_some_and(|max| attempts >= max) {
                        return Err(DbError::JoinAttemptsExhausted { attempts });
                    }
                    info!(attempts, "restarting engine to pick up cluster schema");
                }
                Err(e) => {
                    self.close_engine(&engine, "join failed").await;
                    return Err(e);
                }
            }
        }
    }

    /// Rejoin the cluster this node already belongs to, given the last
    /// known members keyed by id.
    pub async fn start_with_cluster(
        &self,
        members: &HashMap<u64, String>,
        cluster_cert: &CertKeyPair,
    ) -> DbResult<()> {
        let mut ids: Vec<&u64> = members.keys().collect();
        ids.sort_unstable();
        let peers: Vec<String> = ids.into_iter().map(|id| members[id].clone()).collect();
        self.join(cluster_cert, &peers).await
    }

    /// Client bound to the current leader. Leadership moves; do not cache.
    pub async fn leader(&self) -> DbResult<Arc<dyn LeaderClient>> {
        let engine = self.handle()?.engine;
        Ok(engine.leader().await?)
    }

    /// Cluster membership as seen by the current leader.
    pub async fn cluster(&self) -> DbResult<Vec<NodeInfo>> {
        let leader = self.leader().await?;
        Ok(leader.cluster().await?)
    }

    /// Whether bootstrap or join has completed.
    pub fn is_open(&self) -> bool {
        *self.inner.open.borrow()
    }

    /// Resolve once the database has opened.
    pub async fn wait_open(&self) -> DbResult<()> {
        let mut open = self.inner.open.subscribe();
        tokio::select! {
            changed = open.wait_for(|open| *open) => changed.map(|_| ()).map_err(|_| DbError::Cancelled),
            _ = self.inner.shutdown.cancelled() => Err(DbError::Cancelled),
        }
    }

    /// Let a join waiting on a peer upgrade proceed.
    ///
    /// Holds at most one pending notification; extra calls are dropped.
    pub fn notify_upgraded(&self) {
        self.inner.upgraded.notify_one();
    }

    /// Intake for connections upgraded by the HTTP layer.
    pub fn acceptor(&self) -> Acceptor {
        self.inner.acceptor.clone()
    }

    /// Hand an upgraded inbound connection to the engine, waiting until it
    /// has been received.
    pub async fn accept(&self, conn: PeerConn) -> DbResult<()> {
        Ok(self.inner.acceptor.accept(conn).await?)
    }

    /// Run `f` inside one transaction, committing if it succeeds.
    pub async fn transaction<T, F>(&self, f: F) -> DbResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Transaction<'_>) -> DbResult<T> + Send + 'static,
    {
        let conn = self.handle()?.conn;
        let result = conn
            .call(move |conn: &mut rusqlite::Connection| {
                let tx = conn.transaction()?;
                let result = f(&tx).map_err(carry)?;
                tx.commit()?;
                Ok(result)
            })
            .await?;
        Ok(result)
    }

    /// Close the database connection and stop the engine.
    pub async fn close(&self) -> DbResult<()> {
        let handle = self
            .inner
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return Ok(());
        };

        if let Some(timer) = handle.timer {
            timer.cancel();
        }

        if let Err(e) = handle.conn.close().await {
            warn!(error = %e, "failed closing database connection");
        }
        handle.engine.close().await?;
        info!("database closed");
        Ok(())
    }

    fn ensure_closed(&self) -> DbResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        if self.handle().is_err() {
            return Err(DbError::Precondition(
                "database handle was closed and cannot be reused".to_string(),
            ));
        }
        Err(DbError::Precondition("database is already open".to_string()))
    }

    /// Remove the marker left by an engine whose bootstrap or first join
    /// did not complete, so the attempt can be retried.
    async fn discard_marker(&self) {
        let marker = self.inner.config.marker_path();
        match tokio::fs::remove_file(&marker).await {
            Ok(()) => debug!(path = %marker.display(), "removed marker of failed attempt"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %marker.display(), error = %e, "failed removing node marker"),
        }
    }

    fn handle(&self) -> DbResult<Handle> {
        self.inner
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(DbError::NotOpen)
    }

    async fn start_engine(
        &self,
        cluster_cert: &CertKeyPair,
        cluster: Vec<String>,
    ) -> DbResult<Arc<dyn Engine>> {
        let config = &self.inner.config;
        let dialer = TunnelDialer::new(&self.inner.server_cert, cluster_cert)?
            .with_keepalive(config.keepalive());

        let engine = self
            .inner
            .launcher
            .start(EngineConfig {
                dir: config.database_dir(),
                address: config.listen_address.clone(),
                cluster,
                dial_timeout: config.dial_timeout(),
                dialer: Arc::new(HeartbeatDialer {
                    inner: dialer,
                    db: Arc::downgrade(&self.inner),
                    shutdown: self.inner.shutdown.clone(),
                }),
                incoming: self.inner.incoming.clone(),
            })
            .await?;
        Ok(engine)
    }

    /// Wait for the engine, open the database and bring the schema up to
    /// date. On success the handle is stored and the open signal fires.
    async fn open(&self, engine: Arc<dyn Engine>, bootstrap: bool) -> DbResult<()> {
        let config = &self.inner.config;

        tokio::time::timeout(config.ready_timeout(), engine.ready())
            .await
            .map_err(|_| DbError::Timeout("engine readiness"))??;

        let conn = engine.open(&config.database_name).await?;

        let schema = self.inner.schema.clone();
        let address = config.listen_address.clone();
        let ensured = conn
            .call(move |conn: &mut rusqlite::Connection| {
                let tx = conn.transaction()?;
                let member_check = MemberVersionCheck { address: &address };
                let check: Option<&dyn SchemaCheck> = if bootstrap { None } else { Some(&member_check) };
                let ensured = schema.ensure(&tx, check).map_err(carry)?;
                tx.commit()?;
                Ok(ensured)
            })
            .await;

        let ensured = match ensured {
            Ok(ensured) => ensured,
            Err(e) => {
                close_connection(conn).await;
                return Err(e.into());
            }
        };

        match ensured {
            Ensured::Applied { from, to } => {
                let interval = config.heartbeat_interval();
                let timer = interval.map(|_| self.inner.shutdown.child_token());
                *self
                    .inner
                    .handle
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(Handle {
                    engine,
                    conn,
                    timer: timer.clone(),
                });
                self.inner.open.send_replace(true);
                info!(schema_from = from, schema_to = to, "database open");

                if let (Some(interval), Some(timer)) = (interval, timer) {
                    let db = self.clone();
                    tokio::spawn(async move { db.run_heartbeats(interval, timer).await });
                }
                Ok(())
            }
            Ensured::Waiting { current } => {
                close_connection(conn).await;
                info!(current, local = self.inner.schema.version(), "waiting for the cluster to upgrade");
                tokio::select! {
                    _ = self.inner.upgraded.notified() => debug!("upgrade notification received"),
                    _ = tokio::time::sleep(config.upgrade_wait()) => debug!("upgrade wait elapsed"),
                }
                Err(DbError::GracefulRestart)
            }
        }
    }

    async fn close_engine(&self, engine: &Arc<dyn Engine>, reason: &str) {
        match engine.close().await {
            Ok(()) => info!(%reason, "closed local engine"),
            Err(e) => error!(%reason, error = %e, "failed closing local engine"),
        }
    }
}

async fn close_connection(conn: Connection) {
    if let Err(e) = conn.close().await {
        warn!(error = %e, "failed closing database connection");
    }
}

/// Whether a possibly absent database has opened.
pub fn is_open(db: Option<&Database>) -> bool {
    db.is_some_and(Database::is_open)
}

/// Tunnel dialer that kicks off a heartbeat after every successful dial.
/// In-flight dials are abandoned on shutdown.
struct HeartbeatDialer {
    inner: TunnelDialer,
    db: Weak<Inner>,
    shutdown: CancellationToken,
}

#[async_trait]
impl Dial for HeartbeatDialer {
    async fn dial(&self, address: &str, deadline: Instant) -> Result<PeerConn, TunnelError> {
        let conn = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(TunnelError::Shutdown),
            conn = self.inner.dial(address, deadline) => conn?,
        };
        if let Some(inner) = self.db.upgrade() {
            Database { inner }.spawn_heartbeat();
        }
        Ok(conn)
    }
}
