//! warpgrid-db: replicated cluster database for WarpGrid.
//!
//! Bootstraps or joins the embedded replicated SQL engine, tracks
//! cluster members and their schema versions, and coordinates rolling
//! upgrades and leader-originated heartbeats.
//!
//! # Architecture
//!
//! ```text
//! Node
//!   ├── reload_if_bootstrapped() → info.yaml present? rejoin : wait
//!   ├── bootstrap() → Database::bootstrap + founding member row
//!   └── Database
//!       ├── EngineLauncher::start(EngineConfig)
//!       │   ├── dialer: TunnelDialer (+ heartbeat trigger)
//!       │   └── incoming: shared inbound hand-off queue
//!       ├── open → Schema::ensure (MemberVersionCheck when joining)
//!       │   └── Waiting → graceful restart → close + rejoin
//!       ├── transaction() → members::* accessors
//!       └── heartbeat() → leader only → ControlConnector
//! ```

pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod members;
pub mod node;
pub mod schema;

pub use config::DatabaseConfig;
pub use database::{Database, DatabaseBuilder};
pub use engine::{Engine, EngineConfig, EngineError, EngineLauncher, LeaderClient, LocalEngine, NodeInfo};
pub use error::{DbError, DbResult};
pub use heartbeat::HeartbeatOutcome;
pub use members::{ClusterMember, ClusterMemberFilter, Member, MemberStatus, Role};
pub use node::Node;
pub use schema::{Schema, Update};
