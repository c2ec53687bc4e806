//! Local control-plane client.
//!
//! The heartbeat coordinator never talks to peers directly. When this
//! node is leader it asks the local daemon, over its administrative
//! socket, to begin a heartbeat round; the daemon fans out from there.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Internal path that begins a heartbeat round.
pub const HEARTBEAT_ENDPOINT: &str = "/cluster/internal/heartbeat";

/// Instruction body posted to the heartbeat endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatInfo {
    pub begin_round: bool,
}

impl HeartbeatInfo {
    /// Ask the daemon to start a new round.
    pub fn begin_round() -> Self {
        Self { begin_round: true }
    }
}

/// Errors raised by the control-plane client.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("failed connecting to control socket {}: {source}", .path.display())]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("control request failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("failed to build control request: {0}")]
    Request(#[from] http::Error),

    #[error("failed to encode control request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("control request rejected with status {0}")]
    Rejected(http::StatusCode),
}

/// Produces connected control-plane clients.
#[async_trait]
pub trait ControlConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ControlClient>, ControlError>;
}

/// A connected control-plane client.
#[async_trait]
pub trait ControlClient: Send + Sync {
    /// Deliver a heartbeat instruction to the local daemon.
    async fn heartbeat(&self, info: HeartbeatInfo) -> Result<(), ControlError>;
}

#[cfg(unix)]
pub use unix::ControlSocket;

#[cfg(unix)]
mod unix {
    use bytes::Bytes;
    use http::header::{CONTENT_TYPE, HOST};
    use http::{Method, Request};
    use http_body_util::Full;
    use hyper::client::conn::http1::SendRequest;
    use hyper_util::rt::TokioIo;
    use tokio::net::UnixStream;
    use tokio::sync::Mutex;
    use tokio::task::JoinHandle;
    use tracing::debug;

    use super::*;

    /// Control-plane client speaking HTTP/1.1 over the daemon's Unix socket.
    #[derive(Debug, Clone)]
    pub struct ControlSocket {
        path: PathBuf,
    }

    impl ControlSocket {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    struct SocketClient {
        sender: Mutex<SendRequest<Full<Bytes>>>,
        driver: JoinHandle<()>,
    }

    impl Drop for SocketClient {
        fn drop(&mut self) {
            self.driver.abort();
        }
    }

    #[async_trait]
    impl ControlConnector for ControlSocket {
        async fn connect(&self) -> Result<Box<dyn ControlClient>, ControlError> {
            let stream = UnixStream::connect(&self.path)
                .await
                .map_err(|source| ControlError::Connect {
                    path: self.path.clone(),
                    source,
                })?;

            let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
            let driver = tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(error = %e, "control connection closed");
                }
            });

            Ok(Box::new(SocketClient {
                sender: Mutex::new(sender),
                driver,
            }))
        }
    }

    #[async_trait]
    impl ControlClient for SocketClient {
        async fn heartbeat(&self, info: HeartbeatInfo) -> Result<(), ControlError> {
            let body = serde_json::to_vec(&info)?;
            let request = Request::builder()
                .method(Method::POST)
                .uri(HEARTBEAT_ENDPOINT)
                .header(HOST, "control.socket")
                .header(CONTENT_TYPE, "application/json")
                .body(Full::new(Bytes::from(body)))?;

            let mut sender = self.sender.lock().await;
            sender.ready().await?;
            let response = sender.send_request(request).await?;

            if response.status().is_success() {
                Ok(())
            } else {
                Err(ControlError::Rejected(response.status()))
            }
        }
    }
}
