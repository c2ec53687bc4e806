//! Database tunnel: carries the replicated engine's peer traffic.
//!
//! The engine never opens sockets of its own. Outbound links are dialed
//! by [`TunnelDialer`], which performs a mutual-TLS handshake and then an
//! HTTP/1.1 `Upgrade` exchange on the encrypted stream. Inbound links
//! arrive through the HTTP layer, are answered by [`handle_upgrade`], and
//! are handed to the engine through the [`Acceptor`] / [`Incoming`] queue.
//!
//! ```text
//! node A (engine)                               node B (engine)
//!   Dial::dial ──TLS──▶ POST /cluster/internal/database
//!                       Upgrade: warpdb ──▶ handle_upgrade ──▶ Acceptor
//!   ◀── 101 Switching Protocols                               │
//!   raw stream ◀═══════════════ peer traffic ═══════════▶ Incoming::next
//! ```

pub mod accept;
pub mod dial;
pub mod endpoint;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::tls::TlsError;

pub use accept::{Acceptor, Incoming, handoff};
pub use dial::TunnelDialer;
pub use endpoint::{handle_upgrade, serve_endpoint};

/// Protocol name carried in the `Upgrade` header.
pub const PROTOCOL: &str = "warpdb";

/// Header carrying the tunnel protocol version.
pub const VERSION_HEADER: &str = "x-warpdb-version";

/// Tunnel protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

/// Internal path that accepts database connection upgrades.
pub const DATABASE_ENDPOINT: &str = "/cluster/internal/database";

/// A raw bidirectional byte stream between two engine peers.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Owned peer connection as exchanged with the engine.
pub type PeerConn = Box<dyn PeerStream>;

/// Something that can open a peer connection before a deadline.
///
/// Implemented by [`TunnelDialer`]; engines receive it as an
/// `Arc<dyn Dial>` instead of dialing directly.
#[async_trait]
pub trait Dial: Send + Sync {
    async fn dial(&self, address: &str, deadline: Instant) -> Result<PeerConn, TunnelError>;
}

/// Errors raised by the tunnel transport.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed connecting to {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },

    #[error("TLS handshake with {address} failed: {source}")]
    Handshake {
        address: String,
        source: std::io::Error,
    },

    #[error("invalid peer address {0:?}")]
    Address(String),

    #[error("dialing {address} timed out")]
    Timeout { address: String },

    #[error("HTTP exchange failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("failed to build upgrade request: {0}")]
    Request(#[from] http::Error),

    /// The peer speaks a different tunnel protocol version. Upstream
    /// upgrade logic keys off this variant.
    #[error("peer {address} requires a protocol upgrade")]
    UpgradeRequired { address: String },

    #[error("dialing failed: expected status code 101 got {status}")]
    UnexpectedStatus { status: u16 },

    #[error("missing or unexpected Upgrade header in response")]
    MissingUpgradeHeader,

    #[error("connection hand-off abandoned: engine is not accepting")]
    HandoffClosed,

    #[error("tunnel is shutting down")]
    Shutdown,

    #[error(transparent)]
    Tls(#[from] TlsError),
}

impl TunnelError {
    /// Whether this error signals a protocol-version mismatch.
    pub fn is_upgrade_required(&self) -> bool {
        matches!(self, TunnelError::UpgradeRequired { .. })
    }
}
