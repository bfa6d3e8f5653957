//! Subscriber side of the pub/sub transport: connects (and reconnects) to a
//! publisher or proxy and delivers messages latest-wins through a
//! single-slot mailbox.  Dropping stale queued messages is expected; the
//! consumer only ever cares about the most recent control message.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::frame;

const RECONNECT_MIN: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(5);

/// One received message plus its arrival time on the monotonic clock, used
/// by liveness watchdogs and healthz.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub body: Arc<Vec<u8>>,
    pub received: Instant,
}

pub struct Subscription {
    messages: watch::Receiver<Option<RawMessage>>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Start a subscription to `addr` for `topic`.  Connection establishment
    /// and reconnects happen in the background; the mailbox starts empty.
    pub fn connect(addr: String, topic: String) -> Subscription {
        let (msg_tx, msg_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(addr, topic, msg_tx, shutdown_rx));

        Subscription {
            messages: msg_rx,
            shutdown_tx,
            task,
        }
    }

    /// Single-slot mailbox: `borrow()` always holds the latest message.
    pub fn messages(&self) -> watch::Receiver<Option<RawMessage>> {
        self.messages.clone()
    }

    /// Arrival time of the most recent message, if any.
    pub fn last_received(&self) -> Option<Instant> {
        self.messages.borrow().as_ref().map(|m| m.received)
    }

    /// True when no message has arrived within `timeout`.
    pub fn is_stale(&self, timeout: Duration) -> bool {
        match self.last_received() {
            Some(at) => at.elapsed() > timeout,
            None => true,
        }
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

async fn run(
    addr: String,
    topic: String,
    msg_tx: watch::Sender<Option<RawMessage>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = RECONNECT_MIN;

    'outer: loop {
        if *shutdown.borrow() {
            break;
        }

        let mut stream = tokio::select! {
            connected = TcpStream::connect(&addr) => match connected {
                Ok(stream) => {
                    info!(addr = %addr, topic = %topic, "subscribed");
                    backoff = RECONNECT_MIN;
                    stream
                }
                Err(e) => {
                    debug!("subscriber connect to {addr} failed: {e}");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {},
                        _ = shutdown.changed() => {},
                    }
                    backoff = (backoff * 2).min(RECONNECT_MAX);
                    continue;
                }
            },
            _ = shutdown.changed() => continue,
        };

        loop {
            tokio::select! {
                received = frame::read_message(&mut stream) => {
                    match received {
                        Ok((msg_topic, body)) => {
                            if msg_topic != topic {
                                debug!(got = %msg_topic, "ignoring foreign topic");
                                continue;
                            }
                            let _ = msg_tx.send(Some(RawMessage {
                                body: Arc::new(body),
                                received: Instant::now(),
                            }));
                        }
                        Err(e) => {
                            warn!("subscription to {addr} lost: {e}");
                            continue 'outer;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break 'outer;
                    }
                }
            }
        }
    }

    debug!("subscriber task stopped");
}

// ===========================================================================
// Tests
// ===========================================================================
