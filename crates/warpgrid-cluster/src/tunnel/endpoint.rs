//! Inbound side of the tunnel.
//!
//! Answers `POST /cluster/internal/database` upgrade requests and hands
//! the switched stream to the engine through an [`Acceptor`].

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use http::header::{CONNECTION, UPGRADE};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::Empty;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Acceptor, DATABASE_ENDPOINT, PROTOCOL, PROTOCOL_VERSION, VERSION_HEADER};

fn status(code: StatusCode) -> Response<Empty<Bytes>> {
    let mut response = Response::new(Empty::new());
    *response.status_mut() = code;
    response
}

/// Answer a database upgrade request.
///
/// On success the response is `101 Switching Protocols` and a background
/// task forwards the upgraded stream to `acceptor` once hyper releases it.
/// A peer speaking another protocol version gets `426 Upgrade Required`
/// and nothing is handed off.
pub fn handle_upgrade<B>(acceptor: &Acceptor, mut request: Request<B>) -> Response<Empty<Bytes>>
where
    B: Send + 'static,
{
    if request.method() != Method::POST {
        return status(StatusCode::METHOD_NOT_ALLOWED);
    }

    let protocol = request
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok());
    if protocol != Some(PROTOCOL) {
        return status(StatusCode::BAD_REQUEST);
    }

    let version = request
        .headers()
        .get(VERSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u32>().ok());
    if version != Some(PROTOCOL_VERSION) {
        warn!(?version, expected = PROTOCOL_VERSION, "rejecting database peer with mismatched protocol version");
        let mut response = status(StatusCode::UPGRADE_REQUIRED);
        let headers = response.headers_mut();
        headers.insert(UPGRADE, HeaderValue::from_static(PROTOCOL));
        headers.insert(VERSION_HEADER, HeaderValue::from(PROTOCOL_VERSION));
        return response;
    }

    let on_upgrade = hyper::upgrade::on(&mut request);
    let acceptor = acceptor.clone();
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                if let Err(e) = acceptor.accept(Box::new(TokioIo::new(upgraded))).await {
                    warn!(error = %e, "dropping inbound database connection");
                }
            }
            Err(e) => warn!(error = %e, "database connection upgrade failed"),
        }
    });

    let mut response = status(StatusCode::SWITCHING_PROTOCOLS);
    let headers = response.headers_mut();
    headers.insert(UPGRADE, HeaderValue::from_static(PROTOCOL));
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    response
}

/// Serve the internal database endpoint over mutual TLS until `shutdown`
/// is cancelled.
///
/// Connections that fail the TLS handshake are dropped; any path other
/// than the database endpoint gets a 404.
pub async fn serve_endpoint(
    listener: TcpListener,
    tls: Arc<ServerConfig>,
    acceptor: Acceptor,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let tls = TlsAcceptor::from(tls);
    let local = listener.local_addr().context("listener has no local address")?;
    info!(addr = %local, "database endpoint listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = accepted.context("accept failed")?;
                let tls = tls.clone();
                let acceptor = acceptor.clone();

                tokio::spawn(async move {
                    let stream = match tls.accept(stream).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            debug!(%peer_addr, error = %e, "TLS handshake rejected");
                            return;
                        }
                    };

                    let svc = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let response = if req.uri().path() == DATABASE_ENDPOINT {
                            handle_upgrade(&acceptor, req)
                        } else {
                            status(StatusCode::NOT_FOUND)
                        };
                        async move { Ok::<_, Infallible>(response) }
                    });

                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .with_upgrades()
                        .await
                    {
                        debug!(%peer_addr, error = %e, "database endpoint connection error");
                    }
                });
            }
            _ = shutdown.cancelled() => {
                info!("database endpoint shutting down");
                break;
            }
        }
    }

    Ok(())
}
