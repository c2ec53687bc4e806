//! Node startup: decides between reloading an existing cluster and
//! waiting for an explicit bootstrap or join.

use std::collections::HashMap;

use tracing::{info, warn};
use warpgrid_cluster::CertKeyPair;

use crate::database::Database;
use crate::error::{DbError, DbResult};
use crate::members::{self, ClusterMember};

/// A cluster node: its database plus the startup rules around it.
#[derive(Clone)]
pub struct Node {
    db: Database,
}

impl Node {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Name recorded for this node in the membership table: the base name
    /// of its state directory.
    pub fn name(&self) -> String {
        let state_dir = &self.db.config().state_dir;
        state_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| state_dir.display().to_string())
    }

    /// Whether this node has bootstrapped or joined before.
    pub fn is_bootstrapped(&self) -> bool {
        self.db.config().marker_path().exists()
    }

    /// Rejoin `remotes` if this node was part of a cluster before.
    ///
    /// Returns `false`, leaving the database closed, when the node has no
    /// cluster state yet.
    pub async fn reload_if_bootstrapped(
        &self,
        cluster_cert: &CertKeyPair,
        remotes: &HashMap<u64, String>,
    ) -> DbResult<bool> {
        if !self.is_bootstrapped() {
            warn!(
                dir = %self.db.config().database_dir().display(),
                "database is uninitialized, waiting for bootstrap or join"
            );
            return Ok(false);
        }

        self.db.start_with_cluster(remotes, cluster_cert).await?;
        Ok(true)
    }

    /// Found a new cluster with this node as its only member.
    pub async fn bootstrap(&self, cluster_cert: &CertKeyPair) -> DbResult<ClusterMember> {
        if self.is_bootstrapped() {
            return Err(DbError::Precondition(
                "node has already been bootstrapped".to_string(),
            ));
        }

        self.db.bootstrap(cluster_cert).await?;

        let founder = ClusterMember::pending(
            self.name(),
            self.db.config().listen_address.clone(),
            self.db.server_cert().cert_pem.clone(),
            self.db.schema_version(),
        );
        let created = founder.clone();
        let id = self
            .db
            .transaction(move |tx| members::create_cluster_member(tx, &created))
            .await?;

        info!(name = %founder.name, address = %founder.address, id, "created founding cluster member");
        Ok(ClusterMember { id, ..founder })
    }

    /// Join the cluster reachable through `peers`.
    ///
    /// The leader must already have admitted this node's membership row.
    pub async fn join(&self, cluster_cert: &CertKeyPair, peers: &[String]) -> DbResult<()> {
        if self.is_bootstrapped() {
            return Err(DbError::Precondition(
                "node is already part of a cluster".to_string(),
            ));
        }
        self.db.join(cluster_cert, peers).await
    }

    /// This node's membership row.
    pub async fn local_member(&self) -> DbResult<ClusterMember> {
        let address = self.db.config().listen_address.clone();
        self.db
            .transaction(move |tx| members::get_cluster_member(tx, &address))
            .await
    }
}
