//! Cluster database configuration.
//!
//! Durations are written the same way as elsewhere in WarpGrid config
//! files: `"30s"`, `"500ms"`, `"2m"`, or a bare number of seconds.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DbError, DbResult};

/// Name of the marker file written once a node has bootstrapped or joined.
pub const MARKER_FILE: &str = "info.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Root of this node's on-disk state.
    pub state_dir: PathBuf,
    /// `host:port` the node's cluster endpoint listens on. Also its
    /// identity in the membership table.
    pub listen_address: String,
    /// Name of the replicated database opened through the engine.
    pub database_name: String,
    /// Local daemon control socket. Defaults to `<state_dir>/control.socket`.
    pub control_socket: Option<PathBuf>,
    pub ready_timeout: String,
    pub dial_timeout: String,
    /// Upper bound on one wait for a peer upgrade during join.
    pub upgrade_wait: String,
    pub keepalive: String,
    /// Fixed heartbeat period. Heartbeats are only dial-triggered when unset.
    pub heartbeat_interval: Option<String>,
    /// Cap on join attempts after graceful restarts. Unbounded when unset.
    pub max_join_attempts: Option<u32>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::new(),
            listen_address: String::new(),
            database_name: "db.bin".to_string(),
            control_socket: None,
            ready_timeout: "30s".to_string(),
            dial_timeout: "10s".to_string(),
            upgrade_wait: "30s".to_string(),
            keepalive: "3s".to_string(),
            heartbeat_interval: None,
            max_join_attempts: None,
        }
    }
}

impl DatabaseConfig {
    pub fn new(state_dir: impl Into<PathBuf>, listen_address: impl Into<String>) -> Self {
        Self {
            state_dir: state_dir.into(),
            listen_address: listen_address.into(),
            ..Self::default()
        }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: DatabaseConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Check the configuration before any engine or network resource is
    /// touched.
    pub fn validate(&self) -> DbResult<()> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(DbError::Config("state_dir must be set".to_string()));
        }

        if self.listen_address.parse::<SocketAddr>().is_err() {
            return Err(DbError::Config(format!(
                "invalid listen address {:?}",
                self.listen_address
            )));
        }

        if self.database_name.is_empty() {
            return Err(DbError::Config("database_name must be set".to_string()));
        }

        let durations = [
            ("ready_timeout", Some(&self.ready_timeout)),
            ("dial_timeout", Some(&self.dial_timeout)),
            ("upgrade_wait", Some(&self.upgrade_wait)),
            ("keepalive", Some(&self.keepalive)),
            ("heartbeat_interval", self.heartbeat_interval.as_ref()),
        ];
        for (field, value) in durations {
            if let Some(value) = value
                && parse_duration(value).is_none_or(|d| d.is_zero())
            {
                return Err(DbError::Config(format!("invalid {field} {value:?}")));
            }
        }

        if self.max_join_attempts == Some(0) {
            return Err(DbError::Config(
                "max_join_attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn database_dir(&self) -> PathBuf {
        self.state_dir.join("database")
    }

    pub fn marker_path(&self) -> PathBuf {
        self.database_dir().join(MARKER_FILE)
    }

    pub fn control_socket_path(&self) -> PathBuf {
        self.control_socket
            .clone()
            .unwrap_or_else(|| self.state_dir.join("control.socket"))
    }

    pub fn ready_timeout(&self) -> Duration {
        parse_duration(&self.ready_timeout).unwrap_or(Duration::from_secs(30))
    }

    pub fn dial_timeout(&self) -> Duration {
        parse_duration(&self.dial_timeout).unwrap_or(Duration::from_secs(10))
    }

    pub fn upgrade_wait(&self) -> Duration {
        parse_duration(&self.upgrade_wait).unwrap_or(Duration::from_secs(30))
    }

    pub fn keepalive(&self) -> Duration {
        parse_duration(&self.keepalive).unwrap_or(Duration::from_secs(3))
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval.as_deref().and_then(parse_duration)
    }
}

/// Parse a duration string like "5s", "500ms", or "2m".
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
