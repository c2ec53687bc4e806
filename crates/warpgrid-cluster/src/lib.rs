//! warpgrid-cluster: transport for the replicated cluster database.
//!
//! Carries the embedded engine's peer traffic over mutually
//! authenticated TLS, and delivers heartbeat instructions to the local
//! daemon's control socket.
//!
//! # Architecture
//!
//! ```text
//! Node
//!   ├── tls
//!   │   ├── generate_cert() → self-signed node / cluster certificates
//!   │   └── client_config() / server_config() → pinned mTLS configs
//!   ├── tunnel
//!   │   ├── TunnelDialer → TLS + HTTP Upgrade to a peer (outbound)
//!   │   ├── serve_endpoint / handle_upgrade → 101 or 426 (inbound)
//!   │   └── Acceptor ──▶ Incoming → hand-off to the engine
//!   └── control
//!       └── ControlSocket → POST /cluster/internal/heartbeat
//! ```

pub mod control;
pub mod tls;
pub mod tunnel;

pub use control::{ControlClient, ControlConnector, ControlError, HeartbeatInfo};
#[cfg(unix)]
pub use control::ControlSocket;
pub use tls::{CertKeyPair, TlsError};
pub use tunnel::{Acceptor, Dial, Incoming, PeerConn, TunnelDialer, TunnelError};
