//! Fan-out publisher: binds a TCP listener and forwards every published
//! message to all connected subscribers.  A single task owns the connection
//! set; publishing never blocks on a slow subscriber (its queue fills and the
//! connection is dropped instead).

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::frame;

/// Per-subscriber queue depth before the subscriber is considered too slow
/// and dropped.
const SUBSCRIBER_QUEUE: usize = 32;

enum Cmd {
    Publish(Arc<Vec<u8>>),
    SubscriberCount(oneshot::Sender<usize>),
}

pub struct Publisher {
    local_addr: SocketAddr,
    cmd_tx: mpsc::Sender<Cmd>,
    task: JoinHandle<()>,
}

impl Publisher {
    /// Bind `addr` (e.g. `0.0.0.0:2222`) and start accepting subscribers.
    pub async fn bind(addr: &str) -> Result<Publisher> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind publisher on {addr}"))?;
        let local_addr = listener.local_addr().context("publisher local_addr")?;

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let task = tokio::spawn(run(listener, cmd_rx));

        debug!(%local_addr, "publisher bound");
        Ok(Publisher {
            local_addr,
            cmd_tx,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Publish one message to all current subscribers.  Failures to reach an
    /// individual subscriber drop that subscriber, never the publisher.
    pub async fn publish(&self, topic: &str, body: &[u8]) -> Result<()> {
        let encoded = Arc::new(frame::encode_message(topic, body)?);
        self.cmd_tx
            .send(Cmd::Publish(encoded))
            .await
            .context("publisher task is gone")?;
        Ok(())
    }

    /// Number of currently connected subscribers (test hook).
    pub async fn subscriber_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::SubscriberCount(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Stop accepting and disconnect all subscribers.
    pub async fn shutdown(self) {
        drop(self.cmd_tx);
        let _ = self.task.await;
    }
}

async fn run(listener: TcpListener, mut cmd_rx: mpsc::Receiver<Cmd>) {
    let mut conns: Vec<mpsc::Sender<Arc<Vec<u8>>>> = Vec::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "subscriber connected");
                        conns.push(spawn_writer(stream));
                    }
                    Err(e) => warn!("publisher accept failed: {e}"),
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Cmd::Publish(encoded)) => {
                        // try_send keeps the publish path non-blocking; a full
                        // queue means the subscriber stopped draining.
                        conns.retain(|tx| match tx.try_send(Arc::clone(&encoded)) {
                            Ok(()) => true,
                            Err(_) => {
                                warn!("dropping slow or closed subscriber");
                                false
                            }
                        });
                    }
                    Some(Cmd::SubscriberCount(reply)) => {
                        conns.retain(|tx| !tx.is_closed());
                        let _ = reply.send(conns.len());
                    }
                    None => break,
                }
            }
        }
    }
}

/// Spawn the per-connection writer; returns its feed queue.
pub(super) fn spawn_writer(stream: TcpStream) -> mpsc::Sender<Arc<Vec<u8>>> {
    let (tx, mut rx) = mpsc::channel::<Arc<Vec<u8>>>(SUBSCRIBER_QUEUE);
    tokio::spawn(async move {
        let mut stream = stream;
        while let Some(buf) = rx.recv().await {
            if tokio::io::AsyncWriteExt::write_all(&mut stream, &buf).await.is_err() {
                break;
            }
        }
    });
    tx
}

// ===========================================================================
// Tests
// ===========================================================================
