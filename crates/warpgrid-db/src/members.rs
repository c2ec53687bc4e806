//! Membership store: the `internal_cluster_members` table.
//!
//! Every accessor runs inside a caller-supplied transaction obtained from
//! [`Database::transaction`](crate::Database::transaction); nothing here
//! commits. The member's `address` is its natural key and never changes
//! once the row exists.
//!
//! [`update_cluster_member_schema_version`] and
//! [`get_cluster_member_schema_versions`] run while the schema itself is
//! being upgraded, so they must not depend on [`ClusterMember`].

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{ErrorCode, OptionalExtension, Row, Transaction, params};
use rustls::pki_types::CertificateDer;
use thiserror::Error;
use tracing::debug;
use warpgrid_cluster::tls;

use crate::error::{DbError, DbResult};

/// Membership table name.
pub const TABLE: &str = "internal_cluster_members";

const SELECT_MEMBERS: &str = "SELECT id, name, address, certificate, schema, heartbeat, role \
     FROM internal_cluster_members ORDER BY id";
const SELECT_MEMBERS_BY_ADDRESS: &str = "SELECT id, name, address, certificate, schema, heartbeat, role \
     FROM internal_cluster_members WHERE address = ? ORDER BY id";
const SELECT_MEMBER_ID: &str = "SELECT id FROM internal_cluster_members WHERE address = ?";
const INSERT_MEMBER: &str = "INSERT INTO internal_cluster_members \
     (name, address, certificate, schema, heartbeat, role) VALUES (?, ?, ?, ?, ?, ?)";
const UPDATE_MEMBER: &str = "UPDATE internal_cluster_members \
     SET name = ?, certificate = ?, schema = ?, heartbeat = ?, role = ? WHERE address = ?";
const DELETE_MEMBER: &str = "DELETE FROM internal_cluster_members WHERE address = ?";

/// Role of a member within the replicated engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Admitted to the table but not yet part of the engine's voter set.
    Pending,
    Voter,
    StandBy,
    Spare,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Pending => "PENDING",
            Role::Voter => "voter",
            Role::StandBy => "stand-by",
            Role::Spare => "spare",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown member role {0:?}")]
pub struct UnknownRole(String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Role::Pending),
            "voter" => Ok(Role::Voter),
            "stand-by" | "standby" => Ok(Role::StandBy),
            "spare" => Ok(Role::Spare),
            _ => Err(UnknownRole(s.to_string())),
        }
    }
}

impl ToSql for Role {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// One row of the membership table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMember {
    /// Engine-assigned surrogate key. Ignored on create.
    pub id: i64,
    pub name: String,
    pub address: String,
    /// PEM-encoded certificate presented by the member.
    pub certificate: String,
    pub schema: u32,
    /// Last acknowledged heartbeat; `None` means never heard from.
    pub heartbeat: Option<DateTime<Utc>>,
    pub role: Role,
}

impl ClusterMember {
    /// A freshly admitted member: pending, never heard from.
    pub fn pending(
        name: impl Into<String>,
        address: impl Into<String>,
        certificate: impl Into<String>,
        schema: u32,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            address: address.into(),
            certificate: certificate.into(),
            schema,
            heartbeat: None,
            role: Role::Pending,
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            address: row.get(2)?,
            certificate: row.get(3)?,
            schema: row.get(4)?,
            heartbeat: row.get(5)?,
            role: row.get(6)?,
        })
    }

    /// Convert into the API view, parsing the address and certificate.
    pub fn to_api(&self) -> DbResult<Member> {
        let address = self
            .address
            .parse::<SocketAddr>()
            .map_err(|e| DbError::InvalidMember {
                address: self.address.clone(),
                reason: e.to_string(),
            })?;
        let certificate = tls::parse_certificate(&self.certificate)?;

        Ok(Member {
            name: self.name.clone(),
            address,
            certificate,
            schema_version: self.schema,
            last_heartbeat: self.heartbeat,
            role: self.role,
            status: MemberStatus::Unreachable,
        })
    }
}

/// Reachability of a member as reported by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Online,
    Unreachable,
    UpgradeNeeded,
}

/// API view of a cluster member.
#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub address: SocketAddr,
    pub certificate: CertificateDer<'static>,
    pub schema_version: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub role: Role,
    pub status: MemberStatus,
}

/// Optional filter for [`get_cluster_members`].
#[derive(Debug, Clone, Default)]
pub struct ClusterMemberFilter {
    pub address: Option<String>,
}

impl ClusterMemberFilter {
    pub fn address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
        }
    }
}

/// Insert a new member and return its id.
pub fn create_cluster_member(tx: &Transaction<'_>, member: &ClusterMember) -> DbResult<i64> {
    if cluster_member_exists(tx, &member.address)? {
        return Err(DbError::AlreadyExists(format!(
            "cluster member {}",
            member.address
        )));
    }

    let result = tx.prepare_cached(INSERT_MEMBER)?.execute(params![
        member.name,
        member.address,
        member.certificate,
        member.schema,
        member.heartbeat,
        member.role,
    ]);

    match result {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            return Err(DbError::AlreadyExists(format!(
                "cluster member {}",
                member.name
            )));
        }
        Err(e) => return Err(e.into()),
    }

    let id = tx.last_insert_rowid();
    debug!(address = %member.address, id, role = %member.role, "cluster member created");
    Ok(id)
}

/// Fetch every member matching `filter`, ordered by id.
pub fn get_cluster_members(
    tx: &Transaction<'_>,
    filter: &ClusterMemberFilter,
) -> DbResult<Vec<ClusterMember>> {
    let mut members = Vec::new();
    match &filter.address {
        Some(address) => {
            let mut stmt = tx.prepare_cached(SELECT_MEMBERS_BY_ADDRESS)?;
            for member in stmt.query_map([address], ClusterMember::from_row)? {
                members.push(member?);
            }
        }
        None => {
            let mut stmt = tx.prepare_cached(SELECT_MEMBERS)?;
            for member in stmt.query_map([], ClusterMember::from_row)? {
                members.push(member?);
            }
        }
    }
    Ok(members)
}

/// Fetch the member with the given address.
pub fn get_cluster_member(tx: &Transaction<'_>, address: &str) -> DbResult<ClusterMember> {
    get_cluster_members(tx, &ClusterMemberFilter::address(address))?
        .into_iter()
        .next()
        .ok_or_else(|| DbError::NotFound(format!("cluster member {address}")))
}

pub fn get_cluster_member_id(tx: &Transaction<'_>, address: &str) -> DbResult<i64> {
    tx.prepare_cached(SELECT_MEMBER_ID)?
        .query_row([address], |row| row.get(0))
        .optional()?
        .ok_or_else(|| DbError::NotFound(format!("cluster member {address}")))
}

pub fn cluster_member_exists(tx: &Transaction<'_>, address: &str) -> DbResult<bool> {
    Ok(tx
        .prepare_cached(SELECT_MEMBER_ID)?
        .query_row([address], |row| row.get::<_, i64>(0))
        .optional()?
        .is_some())
}

/// Replace the mutable fields of the member at `address`.
///
/// The address itself cannot change, and the schema version may only
/// move forward.
pub fn update_cluster_member(
    tx: &Transaction<'_>,
    address: &str,
    member: &ClusterMember,
) -> DbResult<()> {
    if member.address != address {
        return Err(DbError::Precondition(format!(
            "cluster member address is immutable ({address} -> {})",
            member.address
        )));
    }

    let current = get_cluster_member(tx, address)?;
    if member.schema < current.schema {
        return Err(DbError::SchemaRegression {
            address: address.to_string(),
            from: current.schema,
            to: member.schema,
        });
    }

    let affected = tx.prepare_cached(UPDATE_MEMBER)?.execute(params![
        member.name,
        member.certificate,
        member.schema,
        member.heartbeat,
        member.role,
        address,
    ])?;
    if affected != 1 {
        return Err(DbError::RowCount { affected });
    }

    Ok(())
}

/// Remove the member at `address`.
pub fn delete_cluster_member(tx: &Transaction<'_>, address: &str) -> DbResult<()> {
    let affected = tx.prepare_cached(DELETE_MEMBER)?.execute([address])?;
    match affected {
        1 => {
            debug!(%address, "cluster member deleted");
            Ok(())
        }
        0 => Err(DbError::NotFound(format!("cluster member {address}"))),
        affected => Err(DbError::RowCount { affected }),
    }
}

/// Set the schema version of the member at `address`.
///
/// Fails unless exactly one row was updated.
pub fn update_cluster_member_schema_version(
    tx: &Transaction<'_>,
    version: u32,
    address: &str,
) -> DbResult<()> {
    let affected = tx.execute(
        "UPDATE internal_cluster_members SET schema = ? WHERE address = ?",
        params![version, address],
    )?;
    if affected != 1 {
        return Err(DbError::RowCount { affected });
    }
    Ok(())
}

/// Schema versions of every member that has finished joining.
pub fn get_cluster_member_schema_versions(tx: &Transaction<'_>) -> DbResult<Vec<u32>> {
    let mut stmt = tx.prepare(
        "SELECT schema FROM internal_cluster_members WHERE NOT lower(role) = 'pending'",
    )?;
    let versions = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<u32>>>()?;
    Ok(versions)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rusqlite::Connection;

    use super::*;
    use crate::schema::Schema;

    fn member_db() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        let tx = conn.transaction().unwrap();
        Schema::cluster().ensure(&tx, None).unwrap();
        tx.commit().unwrap();
        conn
    }

    fn cert() -> String {
        tls::generate_cert("node", &[]).unwrap().cert_pem
    }

    fn member(name: &str, address: &str, schema: u32, role: Role) -> ClusterMember {
        ClusterMember {
            role,
            ..ClusterMember::pending(name, address, "cert", schema)
        }
    }

    #[test]
    fn create_and_get() {
        let mut conn = member_db();
        let tx = conn.transaction().unwrap();

        let id = create_cluster_member(&tx, &member("node1", "10.0.0.1:7443", 3, Role::Pending))
            .unwrap();
        let fetched = get_cluster_member(&tx, "10.0.0.1:7443").unwrap();

        assert_eq!(fetched.id, id);
        assert_eq!(fetched.name, "node1");
        assert_eq!(fetched.schema, 3);
        assert_eq!(fetched.role, Role::Pending);
        assert_eq!(fetched.heartbeat, None);
        assert_eq!(get_cluster_member_id(&tx, "10.0.0.1:7443").unwrap(), id);
    }

    #[test]
    fn role_is_stored_in_its_canonical_spelling() {
        let mut conn = member_db();
        let tx = conn.transaction().unwrap();
        create_cluster_member(&tx, &member("node1", "10.0.0.1:7443", 1, Role::Pending)).unwrap();
        create_cluster_member(&tx, &member("node2", "10.0.0.2:7443", 1, Role::StandBy)).unwrap();

        let roles: Vec<String> = tx
            .prepare("SELECT role FROM internal_cluster_members ORDER BY id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(roles, vec!["PENDING", "stand-by"]);
    }

    #[test]
    fn create_rejects_duplicate_address() {
        let mut conn = member_db();
        let tx = conn.transaction().unwrap();
        create_cluster_member(&tx, &member("node1", "10.0.0.1:7443", 1, Role::Pending)).unwrap();

        let err = create_cluster_member(&tx, &member("node2", "10.0.0.1:7443", 1, Role::Pending))
            .unwrap_err();
        assert!(matches!(err, DbError::AlreadyExists(_)));
    }

    #[test]
    fn create_rejects_duplicate_name() {
        let mut conn = member_db();
        let tx = conn.transaction().unwrap();
        create_cluster_member(&tx, &member("node1", "10.0.0.1:7443", 1, Role::Pending)).unwrap();

        let err = create_cluster_member(&tx, &member("node1", "10.0.0.2:7443", 1, Role::Pending))
            .unwrap_err();
        assert!(matches!(err, DbError::AlreadyExists(_)));
    }

    #[test]
    fn filter_by_address() {
        let mut conn = member_db();
        let tx = conn.transaction().unwrap();
        create_cluster_member(&tx, &member("node1", "10.0.0.1:7443", 1, Role::Voter)).unwrap();
        create_cluster_member(&tx, &member("node2", "10.0.0.2:7443", 1, Role::Voter)).unwrap();

        let all = get_cluster_members(&tx, &ClusterMemberFilter::default()).unwrap();
        assert_eq!(all.len(), 2);

        let one = get_cluster_members(&tx, &ClusterMemberFilter::address("10.0.0.2:7443")).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].name, "node2");

        assert!(cluster_member_exists(&tx, "10.0.0.2:7443").unwrap());
        assert!(!cluster_member_exists(&tx, "10.0.0.3:7443").unwrap());
        assert!(matches!(
            get_cluster_member(&tx, "10.0.0.3:7443"),
            Err(DbError::NotFound(_))
        ));
    }

    #[test]
    fn update_changes_mutable_fields() {
        let mut conn = member_db();
        let tx = conn.transaction().unwrap();
        create_cluster_member(&tx, &member("node1", "10.0.0.1:7443", 1, Role::Pending)).unwrap();

        let seen = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let mut updated = get_cluster_member(&tx, "10.0.0.1:7443").unwrap();
        updated.schema = 2;
        updated.role = Role::Voter;
        updated.heartbeat = Some(seen);
        update_cluster_member(&tx, "10.0.0.1:7443", &updated).unwrap();

        let fetched = get_cluster_member(&tx, "10.0.0.1:7443").unwrap();
        assert_eq!(fetched.schema, 2);
        assert_eq!(fetched.role, Role::Voter);
        assert_eq!(fetched.heartbeat, Some(seen));
    }

    #[test]
    fn update_rejects_address_change() {
        let mut conn = member_db();
        let tx = conn.transaction().unwrap();
        create_cluster_member(&tx, &member("node1", "10.0.0.1:7443", 1, Role::Pending)).unwrap();

        let moved = member("node1", "10.0.0.9:7443", 1, Role::Pending);
        let err = update_cluster_member(&tx, "10.0.0.1:7443", &moved).unwrap_err();
        assert!(matches!(err, DbError::Precondition(_)));
    }

    #[test]
    fn update_rejects_schema_regression() {
        let mut conn = member_db();
        let tx = conn.transaction().unwrap();
        create_cluster_member(&tx, &member("node1", "10.0.0.1:7443", 4, Role::Voter)).unwrap();

        let older = member("node1", "10.0.0.1:7443", 3, Role::Voter);
        let err = update_cluster_member(&tx, "10.0.0.1:7443", &older).unwrap_err();
        assert!(matches!(
            err,
            DbError::SchemaRegression { from: 4, to: 3, .. }
        ));
    }

    #[test]
    fn delete_by_address() {
        let mut conn = member_db();
        let tx = conn.transaction().unwrap();
        create_cluster_member(&tx, &member("node1", "10.0.0.1:7443", 1, Role::Voter)).unwrap();

        delete_cluster_member(&tx, "10.0.0.1:7443").unwrap();
        assert!(!cluster_member_exists(&tx, "10.0.0.1:7443").unwrap());
        assert!(matches!(
            delete_cluster_member(&tx, "10.0.0.1:7443"),
            Err(DbError::NotFound(_))
        ));
    }

    #[test]
    fn schema_versions_exclude_pending_members() {
        let mut conn = member_db();
        let tx = conn.transaction().unwrap();
        create_cluster_member(&tx, &member("node1", "10.0.0.1:7443", 5, Role::Voter)).unwrap();
        create_cluster_member(&tx, &member("node2", "10.0.0.2:7443", 4, Role::Spare)).unwrap();
        create_cluster_member(&tx, &member("node3", "10.0.0.3:7443", 9, Role::Pending)).unwrap();

        let mut versions = get_cluster_member_schema_versions(&tx).unwrap();
        versions.sort_unstable();
        assert_eq!(versions, vec![4, 5]);
    }

    #[test]
    fn schema_version_update_by_address() {
        let mut conn = member_db();
        let tx = conn.transaction().unwrap();
        create_cluster_member(&tx, &member("node1", "10.0.0.1:7443", 1, Role::Voter)).unwrap();

        update_cluster_member_schema_version(&tx, 2, "10.0.0.1:7443").unwrap();
        assert_eq!(get_cluster_member(&tx, "10.0.0.1:7443").unwrap().schema, 2);
    }

    #[test]
    fn schema_version_update_requires_a_match() {
        let mut conn = member_db();
        let tx = conn.transaction().unwrap();

        let err = update_cluster_member_schema_version(&tx, 2, "10.0.0.1:7443").unwrap_err();
        assert!(matches!(err, DbError::RowCount { affected: 0 }));
    }

    #[test]
    fn schema_version_update_rejects_duplicate_rows() {
        // A table without the uniqueness constraint, to model a corrupted store.
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE internal_cluster_members (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 name TEXT NOT NULL,
                 address TEXT NOT NULL,
                 certificate TEXT NOT NULL,
                 schema INTEGER NOT NULL,
                 heartbeat DATETIME,
                 role TEXT NOT NULL
             );
             INSERT INTO internal_cluster_members (name, address, certificate, schema, role)
                 VALUES ('a', '10.0.0.1:7443', 'x', 1, 'voter'), ('b', '10.0.0.1:7443', 'x', 1, 'voter');",
        )
        .unwrap();
        let tx = conn.transaction().unwrap();

        let err = update_cluster_member_schema_version(&tx, 2, "10.0.0.1:7443").unwrap_err();
        assert!(matches!(err, DbError::RowCount { affected: 2 }));
    }

    #[test]
    fn to_api_parses_address_and_certificate() {
        let mut member = member("node1", "10.0.0.1:7443", 2, Role::Voter);
        member.certificate = cert();

        let api = member.to_api().unwrap();
        assert_eq!(api.address, "10.0.0.1:7443".parse::<SocketAddr>().unwrap());
        assert_eq!(api.schema_version, 2);
        assert_eq!(api.status, MemberStatus::Unreachable);
    }

    #[test]
    fn to_api_rejects_bad_address() {
        let mut member = member("node1", "node1.local", 2, Role::Voter);
        member.certificate = cert();
        assert!(matches!(
            member.to_api(),
            Err(DbError::InvalidMember { .. })
        ));
    }

    #[test]
    fn role_parsing_is_case_insensitive() {
        assert_eq!("PENDING".parse::<Role>().unwrap(), Role::Pending);
        assert_eq!("pending".parse::<Role>().unwrap(), Role::Pending);
        assert_eq!("stand-by".parse::<Role>().unwrap(), Role::StandBy);
        assert!("leader".parse::<Role>().is_err());
    }
}
