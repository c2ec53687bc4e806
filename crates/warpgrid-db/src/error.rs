//! Error types for the cluster database.

use thiserror::Error;
use warpgrid_cluster::{TlsError, TunnelError};

use crate::engine::EngineError;

/// Result type alias for cluster database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors that can occur while managing the cluster database.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("sql error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("database connection error: {0}")]
    Connection(String),

    #[error("database is not open")]
    NotOpen,

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    /// A statement that must touch exactly one row touched some other number.
    #[error("query updated {affected} rows instead of 1")]
    RowCount { affected: usize },

    #[error("invalid cluster member {address}: {reason}")]
    InvalidMember { address: String, reason: String },

    #[error("schema version of member {address} cannot decrease from {from} to {to}")]
    SchemaRegression { address: String, from: u32, to: u32 },

    #[error("schema version {current} is more recent than the expected {local}")]
    SchemaAhead { current: u32, local: u32 },

    #[error("this node's schema version {local} is behind the cluster's version {cluster}")]
    NodeBehind { local: u32, cluster: u32 },

    /// The schema was advanced elsewhere; the local engine must restart.
    #[error("graceful restart requested")]
    GracefulRestart,

    #[error("join abandoned after {attempts} attempts")]
    JoinAttemptsExhausted { attempts: u32 },

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_rusqlite::Error> for DbError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        match e {
            tokio_rusqlite::Error::Rusqlite(e) => DbError::Sql(e),
            tokio_rusqlite::Error::Other(e) => match e.downcast::<DbError>() {
                Ok(e) => *e,
                Err(e) => DbError::Connection(e.to_string()),
            },
            e => DbError::Connection(e.to_string()),
        }
    }
}

/// Carry a [`DbError`] out of a `tokio_rusqlite` call closure.
///
/// The matching `From` impl unwraps it again on the async side.
pub(crate) fn carry(e: DbError) -> tokio_rusqlite::Error {
    tokio_rusqlite::Error::Other(Box::new(e))
}
