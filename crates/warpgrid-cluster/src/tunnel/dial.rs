//! Outbound side of the tunnel.
//!
//! Dials a peer over TCP, performs the mutual-TLS handshake, then asks
//! the peer's HTTP layer to switch the stream over to the database
//! protocol. The upgraded stream is returned to the engine unmodified.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONNECTION, HOST, UPGRADE};
use http::{Method, Request, StatusCode};
use http_body_util::Empty;
use hyper::client::conn::http1::SendRequest;
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::{DATABASE_ENDPOINT, Dial, PROTOCOL, PROTOCOL_VERSION, PeerConn, TunnelError, VERSION_HEADER};
use crate::tls::{self, CertKeyPair};

/// Keepalive probe interval applied to peer links by default.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(3);

/// Unacknowledged-data timeout applied to peer links.
const TCP_USER_TIMEOUT: Duration = Duration::from_secs(30);

/// Dials peers through the mutually authenticated upgrade tunnel.
#[derive(Clone)]
pub struct TunnelDialer {
    tls: Arc<ClientConfig>,
    keepalive: Duration,
}

impl TunnelDialer {
    /// Create a dialer presenting `identity` and pinning the cluster
    /// certificate every peer endpoint serves.
    pub fn new(identity: &CertKeyPair, cluster: &CertKeyPair) -> Result<Self, TunnelError> {
        let tls = tls::client_config(identity, cluster.certificate()?)?;
        Ok(Self {
            tls,
            keepalive: DEFAULT_KEEPALIVE,
        })
    }

    /// Set the TCP keepalive interval for established links.
    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    async fn connect(&self, address: &str) -> Result<PeerConn, TunnelError> {
        let server_name = server_name(address)?;

        let tcp = TcpStream::connect(address)
            .await
            .map_err(|source| TunnelError::Connect {
                address: address.to_string(),
                source,
            })?;

        debug!(
            local = ?tcp.local_addr().ok(),
            remote = ?tcp.peer_addr().ok(),
            "database connected outbound"
        );

        if let Err(e) = set_timeouts(&tcp, self.keepalive) {
            warn!(%address, error = %e, "failed setting TCP timeouts on remote connection");
        }

        let stream = TlsConnector::from(Arc::clone(&self.tls))
            .connect(server_name, tcp)
            .await
            .map_err(|source| TunnelError::Handshake {
                address: address.to_string(),
                source,
            })?;

        upgrade(stream, address).await
    }
}

#[async_trait]
impl Dial for TunnelDialer {
    async fn dial(&self, address: &str, deadline: Instant) -> Result<PeerConn, TunnelError> {
        match tokio::time::timeout_at(deadline, self.connect(address)).await {
            Ok(result) => result,
            Err(_) => Err(TunnelError::Timeout {
                address: address.to_string(),
            }),
        }
    }
}

/// Run the HTTP upgrade exchange over an established stream.
///
/// Any failure tears the connection down before the error is returned.
pub async fn upgrade<S>(stream: S, address: &str) -> Result<PeerConn, TunnelError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    let driver = tokio::spawn(conn.with_upgrades());

    match exchange(&mut sender, address).await {
        Ok(conn) => Ok(conn),
        Err(e) => {
            drop(sender);
            driver.abort();
            // Wait for the aborted task so the socket is dropped before we return.
            let _ = driver.await;
            Err(e)
        }
    }
}

async fn exchange(
    sender: &mut SendRequest<Empty<Bytes>>,
    address: &str,
) -> Result<PeerConn, TunnelError> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(DATABASE_ENDPOINT)
        .header(HOST, address)
        .header(UPGRADE, PROTOCOL)
        .header(CONNECTION, "Upgrade")
        .header(VERSION_HEADER, PROTOCOL_VERSION.to_string())
        .body(Empty::<Bytes>::new())?;

    let response = sender.send_request(request).await?;

    if response.status() == StatusCode::UPGRADE_REQUIRED {
        // TODO: kick off the software upgrade flow instead of only reporting it.
        return Err(TunnelError::UpgradeRequired {
            address: address.to_string(),
        });
    }

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(TunnelError::UnexpectedStatus {
            status: response.status().as_u16(),
        });
    }

    let protocol = response
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok());
    if protocol != Some(PROTOCOL) {
        return Err(TunnelError::MissingUpgradeHeader);
    }

    let upgraded = hyper::upgrade::on(response).await?;
    Ok(Box::new(TokioIo::new(upgraded)))
}

fn server_name(address: &str) -> Result<ServerName<'static>, TunnelError> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(ServerName::IpAddress(addr.ip().into()));
    }

    let (host, _port) = address
        .rsplit_once(':')
        .ok_or_else(|| TunnelError::Address(address.to_string()))?;

    ServerName::try_from(host.to_string()).map_err(|_| TunnelError::Address(address.to_string()))
}

/// Tune a peer link for long-lived use: keepalive probes and a bound on
/// how long unacknowledged data may sit before the link is declared dead.
fn set_timeouts(stream: &TcpStream, keepalive: Duration) -> std::io::Result<()> {
    let socket = SockRef::from(stream);

    let params = TcpKeepalive::new().with_time(keepalive);
    #[cfg(target_os = "linux")]
    let params = params.with_interval(keepalive).with_retries(3);
    socket.set_tcp_keepalive(&params)?;

    #[cfg(target_os = "linux")]
    socket.set_tcp_user_timeout(Some(TCP_USER_TIMEOUT))?;

    stream.set_nodelay(true)
}
