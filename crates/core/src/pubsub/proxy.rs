//! Last-value-caching proxy.
//!
//! Sits between the controller's publisher and its subscribers: every
//! upstream message is forwarded to all downstream connections and stored in
//! a single cache slot; a newly connected subscriber receives the cached
//! message before any further upstream traffic.  One task owns the cache, so
//! upstream ingress and subscribe events are naturally serialized.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::frame;
use super::publisher::spawn_writer;

const RECONNECT_DELAY: Duration = Duration::from_millis(500);

pub struct Proxy {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Proxy {
    /// Bind `bind_addr` for downstream subscribers and start relaying from
    /// `upstream_addr`.  The upstream connection is retried forever; the
    /// proxy keeps serving its cache while upstream is down.
    pub async fn start(upstream_addr: String, bind_addr: &str, topic: String) -> Result<Proxy> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind proxy on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("proxy local_addr")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(listener, upstream_addr, topic, shutdown_rx));

        info!(%local_addr, "cache proxy started");
        Ok(Proxy {
            local_addr,
            shutdown_tx,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
        info!("cache proxy stopped");
    }
}

async fn run(
    listener: TcpListener,
    upstream_addr: String,
    topic: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut cache: Option<Arc<Vec<u8>>> = None;
    let mut last_forwarded_id: Option<u64> = None;
    let mut conns: Vec<mpsc::Sender<Arc<Vec<u8>>>> = Vec::new();
    let mut upstream: Option<TcpStream> = None;

    loop {
        let upstream_down = upstream.is_none();
        let upstream_read = async {
            match upstream.as_mut() {
                Some(stream) => frame::read_message(stream).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "downstream subscriber connected");
                        let tx = spawn_writer(stream);
                        // Replay the last value before any further upstream
                        // message can reach this subscriber.
                        match &cache {
                            Some(cached) => {
                                let _ = tx.try_send(Arc::clone(cached));
                            }
                            None => debug!("cache is empty, nothing to replay"),
                        }
                        conns.push(tx);
                    }
                    Err(e) => warn!("proxy accept failed: {e}"),
                }
            }

            received = upstream_read => {
                match received {
                    Ok((msg_topic, body)) => {
                        if msg_topic != topic {
                            continue;
                        }
                        // Duplicates are dropped by message-id equality only;
                        // bodies without an id (foreign topics) always pass.
                        let id = extract_message_id(&body);
                        if id.is_some() && id == last_forwarded_id {
                            debug!(?id, "duplicate message id, not forwarding");
                            continue;
                        }
                        last_forwarded_id = id;

                        let encoded = match frame::encode_message(&msg_topic, &body) {
                            Ok(buf) => Arc::new(buf),
                            Err(e) => {
                                warn!("failed to re-encode relayed message: {e}");
                                continue;
                            }
                        };
                        cache = Some(Arc::clone(&encoded));
                        conns.retain(|tx| tx.try_send(Arc::clone(&encoded)).is_ok());
                    }
                    Err(e) => {
                        warn!("upstream connection lost: {e}");
                        upstream = None;
                    }
                }
            }

            _ = tokio::time::sleep(RECONNECT_DELAY), if upstream_down => {
                match TcpStream::connect(&upstream_addr).await {
                    Ok(stream) => {
                        info!(addr = %upstream_addr, "connected to upstream publisher");
                        upstream = Some(stream);
                    }
                    Err(e) => debug!("upstream connect failed, will retry: {e}"),
                }
            }
        }
    }
}

/// Pull `message_id` out of a JSON body without committing to the full
/// control-message schema.
fn extract_message_id(body: &[u8]) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("message_id")?.as_u64()
}

// ===========================================================================
// Tests
// ===========================================================================
