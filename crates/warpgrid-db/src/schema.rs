//! Schema updates for the replicated database.
//!
//! A schema is an ordered list of update functions; its version is the
//! number of updates. Applied versions are recorded in the `schemas`
//! table so every member sees the same history.
//!
//! During a rolling upgrade members run different builds. Before
//! applying anything a joining node publishes its own version in the
//! membership table and compares it with every other member's, see
//! [`MemberVersionCheck`].

use std::sync::Arc;

use rusqlite::Transaction;
use tracing::{debug, info, warn};

use crate::error::{DbError, DbResult};
use crate::members;

/// A single schema update.
pub type Update = fn(&Transaction<'_>) -> rusqlite::Result<()>;

/// Updates every cluster database starts from.
const CLUSTER_UPDATES: &[Update] = &[create_members_table];

fn create_members_table(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "CREATE TABLE internal_cluster_members (
             id          INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
             name        TEXT NOT NULL,
             address     TEXT NOT NULL,
             certificate TEXT NOT NULL,
             schema      INTEGER NOT NULL,
             heartbeat   DATETIME,
             role        TEXT NOT NULL,
             UNIQUE (name),
             UNIQUE (address)
         );",
    )
}

/// Whether pending updates may be applied now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Proceed,
    /// Other members still run an older build.
    Wait,
}

/// Outcome of [`Schema::ensure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensured {
    /// The database is now at version `to`.
    Applied { from: u32, to: u32 },
    /// Updates were held back by the check. The caller should commit and
    /// wait for the rest of the cluster to upgrade.
    Waiting { current: u32 },
}

/// Hook run by [`Schema::ensure`] before applying updates to an
/// already-initialised database.
pub trait SchemaCheck {
    fn check(&self, tx: &Transaction<'_>, local: u32) -> DbResult<Gate>;
}

/// Publishes this node's version and compares it with every joined
/// member's.
#[derive(Debug, Clone, Copy)]
pub struct MemberVersionCheck<'a> {
    pub address: &'a str,
}

impl SchemaCheck for MemberVersionCheck<'_> {
    fn check(&self, tx: &Transaction<'_>, local: u32) -> DbResult<Gate> {
        members::update_cluster_member_schema_version(tx, local, self.address)?;
        let versions = members::get_cluster_member_schema_versions(tx)?;

        let mut gate = Gate::Proceed;
        for version in versions {
            if version > local {
                return Err(DbError::NodeBehind {
                    local,
                    cluster: version,
                });
            }
            if version < local {
                gate = Gate::Wait;
            }
        }

        Ok(gate)
    }
}

/// Ordered schema updates.
#[derive(Clone)]
pub struct Schema {
    updates: Arc<[Update]>,
}

impl Schema {
    /// The base cluster schema.
    pub fn cluster() -> Self {
        Self {
            updates: CLUSTER_UPDATES.into(),
        }
    }

    /// The base cluster schema followed by `extensions`.
    pub fn with_extensions(extensions: &[Update]) -> Self {
        let updates: Vec<Update> = CLUSTER_UPDATES
            .iter()
            .chain(extensions)
            .copied()
            .collect();
        Self {
            updates: updates.into(),
        }
    }

    /// Version reached once every update is applied.
    pub fn version(&self) -> u32 {
        self.updates.len() as u32
    }

    /// Bring the database up to [`version`](Self::version) inside `tx`.
    ///
    /// `check` runs only when the database already holds a schema; pass
    /// `None` when bootstrapping. Nothing is committed here.
    pub fn ensure(&self, tx: &Transaction<'_>, check: Option<&dyn SchemaCheck>) -> DbResult<Ensured> {
        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS schemas (
                 id         INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                 version    INTEGER NOT NULL,
                 updated_at DATETIME NOT NULL,
                 UNIQUE (version)
             );",
        )?;

        let current = current_version(tx)?;
        let local = self.version();

        if current > local {
            return Err(DbError::SchemaAhead { current, local });
        }

        if current > 0
            && let Some(check) = check
            && check.check(tx, local)? == Gate::Wait
        {
            warn!(current, local, "holding back schema updates until all members are upgraded");
            return Ok(Ensured::Waiting { current });
        }

        for (index, update) in self.updates.iter().enumerate().skip(current as usize) {
            let version = index as u32 + 1;
            update(tx)?;
            tx.execute(
                "INSERT INTO schemas (version, updated_at) VALUES (?, strftime('%s'))",
                [version],
            )?;
            debug!(version, "applied schema update");
        }

        if current < local {
            info!(from = current, to = local, "schema updated");
        }

        Ok(Ensured::Applied { from: current, to: local })
    }
}

/// Highest version recorded in the `schemas` table, 0 for a fresh database.
pub fn current_version(tx: &Transaction<'_>) -> DbResult<u32> {
    let version = tx.query_row("SELECT COALESCE(MAX(version), 0) FROM schemas", [], |row| {
        row.get(0)
    })?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::*;
    use crate::members::{ClusterMember, Role, create_cluster_member};

    fn add_settings(tx: &Transaction<'_>) -> rusqlite::Result<()> {
        tx.execute_batch("CREATE TABLE settings (key TEXT PRIMARY KEY, value TEXT);")
    }

    fn add_settings_index(tx: &Transaction<'_>) -> rusqlite::Result<()> {
        tx.execute_batch("CREATE INDEX settings_value ON settings (value);")
    }

    fn table_exists(tx: &Transaction<'_>, name: &str) -> bool {
        tx.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            [name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            > 0
    }

    /// A database at the base schema with the given (address, schema, role) members.
    fn cluster_db(members: &[(&str, u32, Role)]) -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        let tx = conn.transaction().unwrap();
        Schema::cluster().ensure(&tx, None).unwrap();
        for (i, (address, schema, role)) in members.iter().enumerate() {
            let member = ClusterMember {
                role: *role,
                ..ClusterMember::pending(format!("node{i}"), *address, "cert", *schema)
            };
            create_cluster_member(&tx, &member).unwrap();
        }
        tx.commit().unwrap();
        conn
    }

    #[test]
    fn fresh_database_gets_every_update() {
        let mut conn = Connection::open_in_memory().unwrap();
        let tx = conn.transaction().unwrap();

        let schema = Schema::with_extensions(&[add_settings]);
        let ensured = schema.ensure(&tx, None).unwrap();

        assert_eq!(ensured, Ensured::Applied { from: 0, to: 2 });
        assert!(table_exists(&tx, members::TABLE));
        assert!(table_exists(&tx, "settings"));
        assert_eq!(current_version(&tx).unwrap(), 2);
    }

    #[test]
    fn ensure_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        let tx = conn.transaction().unwrap();

        Schema::cluster().ensure(&tx, None).unwrap();
        let again = Schema::cluster().ensure(&tx, None).unwrap();
        assert_eq!(again, Ensured::Applied { from: 1, to: 1 });
    }

    #[test]
    fn database_ahead_of_local_schema_fails() {
        let mut conn = Connection::open_in_memory().unwrap();
        let tx = conn.transaction().unwrap();
        Schema::with_extensions(&[add_settings]).ensure(&tx, None).unwrap();

        let err = Schema::cluster().ensure(&tx, None).unwrap_err();
        assert!(matches!(err, DbError::SchemaAhead { current: 2, local: 1 }));
    }

    #[test]
    fn check_publishes_local_version() {
        let mut conn = cluster_db(&[("10.0.0.1:7443", 1, Role::Voter), ("10.0.0.2:7443", 1, Role::Voter)]);
        let tx = conn.transaction().unwrap();
        let check = MemberVersionCheck { address: "10.0.0.1:7443" };

        let ensured = Schema::cluster().ensure(&tx, Some(&check)).unwrap();
        assert_eq!(ensured, Ensured::Applied { from: 1, to: 1 });
    }

    #[test]
    fn lagging_member_holds_back_updates() {
        let mut conn = cluster_db(&[("10.0.0.1:7443", 1, Role::Voter), ("10.0.0.2:7443", 1, Role::Voter)]);
        let tx = conn.transaction().unwrap();
        let check = MemberVersionCheck { address: "10.0.0.2:7443" };

        let ensured = Schema::with_extensions(&[add_settings])
            .ensure(&tx, Some(&check))
            .unwrap();

        assert_eq!(ensured, Ensured::Waiting { current: 1 });
        assert!(!table_exists(&tx, "settings"));
        // The version bump is still recorded for this member.
        assert_eq!(members::get_cluster_member(&tx, "10.0.0.2:7443").unwrap().schema, 2);
    }

    #[test]
    fn pending_members_do_not_hold_back_updates() {
        let mut conn = cluster_db(&[("10.0.0.1:7443", 1, Role::Voter), ("10.0.0.2:7443", 1, Role::Pending)]);
        let tx = conn.transaction().unwrap();
        let check = MemberVersionCheck { address: "10.0.0.1:7443" };

        let ensured = Schema::with_extensions(&[add_settings, add_settings_index])
            .ensure(&tx, Some(&check))
            .unwrap();

        assert_eq!(ensured, Ensured::Applied { from: 1, to: 3 });
        assert!(table_exists(&tx, "settings"));
    }

    #[test]
    fn member_ahead_means_node_is_behind() {
        let mut conn = cluster_db(&[("10.0.0.1:7443", 1, Role::Voter), ("10.0.0.2:7443", 3, Role::Voter)]);
        let tx = conn.transaction().unwrap();
        let check = MemberVersionCheck { address: "10.0.0.1:7443" };

        let err = Schema::with_extensions(&[add_settings])
            .ensure(&tx, Some(&check))
            .unwrap_err();
        assert!(matches!(err, DbError::NodeBehind { local: 2, cluster: 3 }));
    }

    #[test]
    fn check_skipped_for_fresh_database() {
        struct Refuse;
        impl SchemaCheck for Refuse {
            fn check(&self, _tx: &Transaction<'_>, _local: u32) -> DbResult<Gate> {
                Err(DbError::Precondition("check must not run".to_string()))
            }
        }

        let mut conn = Connection::open_in_memory().unwrap();
        let tx = conn.transaction().unwrap();
        assert!(Schema::cluster().ensure(&tx, Some(&Refuse)).is_ok());
    }
}
