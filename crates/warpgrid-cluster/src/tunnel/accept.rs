//! Inbound hand-off queue between the HTTP layer and the engine.
//!
//! [`Acceptor::accept`] is a rendezvous: it resumes only once the engine
//! has taken the connection out of [`Incoming::next`], or fails if the
//! node shuts down first.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{PeerConn, TunnelError};

struct Handoff {
    conn: PeerConn,
    received: oneshot::Sender<()>,
}

/// Sending half, held by the HTTP layer.
#[derive(Clone)]
pub struct Acceptor {
    tx: mpsc::Sender<Handoff>,
    shutdown: CancellationToken,
}

/// Receiving half, handed to every engine instance the node starts.
///
/// Cloning shares the same queue so a restarted engine picks up where
/// the previous one left off.
#[derive(Clone)]
pub struct Incoming {
    rx: Arc<Mutex<mpsc::Receiver<Handoff>>>,
}

/// Create a connected acceptor / incoming pair.
///
/// Cancelling `shutdown` abandons in-flight hand-offs.
pub fn handoff(shutdown: CancellationToken) -> (Acceptor, Incoming) {
    let (tx, rx) = mpsc::channel(1);
    (
        Acceptor { tx, shutdown },
        Incoming {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

impl Acceptor {
    /// Forward a raw connection to the engine, waiting until it is received.
    pub async fn accept(&self, conn: PeerConn) -> Result<(), TunnelError> {
        let (received, ack) = oneshot::channel();
        let handoff = Handoff { conn, received };

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(TunnelError::Shutdown),
            sent = self.tx.send(handoff) => sent.map_err(|_| TunnelError::HandoffClosed)?,
        }

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(TunnelError::Shutdown),
            ack = ack => ack.map_err(|_| TunnelError::HandoffClosed),
        }
    }
}

impl Incoming {
    /// Wait for the next inbound connection.
    ///
    /// Returns `None` once every [`Acceptor`] has been dropped.
    pub async fn next(&self) -> Option<PeerConn> {
        let handoff = self.rx.lock().await.recv().await?;
        if handoff.received.send(()).is_err() {
            debug!("inbound connection received after its sender gave up");
        }
        Some(handoff.conn)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn accept_completes_once_engine_receives() {
        let (acceptor, incoming) = handoff(CancellationToken::new());
        let (client, server) = tokio::io::duplex(64);

        let pending = tokio::spawn(async move { acceptor.accept(Box::new(server)).await });

        // Not yet received by the engine side.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        let mut conn = incoming.next().await.unwrap();
        pending.await.unwrap().unwrap();

        let mut client = client;
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn shutdown_abandons_pending_handoff() {
        let shutdown = CancellationToken::new();
        let (acceptor, _incoming) = handoff(shutdown.clone());
        let (_client, server) = tokio::io::duplex(64);

        let pending = tokio::spawn(async move { acceptor.accept(Box::new(server)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(TunnelError::Shutdown)));
    }

    #[tokio::test]
    async fn incoming_is_shared_between_clones() {
        let (acceptor, incoming) = handoff(CancellationToken::new());
        let restarted = incoming.clone();
        drop(incoming);

        let (_client, server) = tokio::io::duplex(64);
        let pending = tokio::spawn(async move { acceptor.accept(Box::new(server)).await });

        assert!(restarted.next().await.is_some());
        pending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn next_returns_none_when_acceptors_dropped() {
        let (acceptor, incoming) = handoff(CancellationToken::new());
        drop(acceptor);
        assert!(incoming.next().await.is_none());
    }
}
