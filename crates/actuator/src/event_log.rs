//! Append-only event log: an in-process ring of recent records, a bounded
//! queue feeding the single SQLite writer, and a broadcast channel fanning
//! appends out to the status publisher.
//!
//! Overflow policy: when the writer queue is full the oldest Info record is
//! dropped first; Warn/Err records are never dropped.  Drops are reported at
//! most once per hour.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use mistcool_core::config::StorageConfig;
use mistcool_core::db::{self, Db};
use mistcool_core::event::{EventKind, EventRecord, LogLevel};

const DROP_WARN_INTERVAL: Duration = Duration::from_secs(3600);
const BROADCAST_CAPACITY: usize = 256;

struct Inner {
    pool: Db,
    next_id: AtomicI64,
    ring: RwLock<VecDeque<EventRecord>>,
    ring_size: usize,
    queue: Mutex<VecDeque<EventRecord>>,
    queue_max: usize,
    dropped: AtomicI64,
    drop_warned_at: Mutex<Option<Instant>>,
    wakeup: Notify,
    fanout: broadcast::Sender<EventRecord>,
}

#[derive(Clone)]
pub struct EventLog {
    inner: Arc<Inner>,
}

impl EventLog {
    /// Open the log on an already-migrated pool and start the writer task.
    /// The id counter is seeded from the table so ids keep strictly
    /// increasing across restarts.
    pub async fn open(
        pool: Db,
        config: &StorageConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(EventLog, JoinHandle<()>)> {
        let max_id = db::max_event_id(&pool).await?;
        let (fanout, _) = broadcast::channel(BROADCAST_CAPACITY);

        let inner = Arc::new(Inner {
            pool,
            next_id: AtomicI64::new(max_id + 1),
            ring: RwLock::new(VecDeque::with_capacity(config.ring_size)),
            ring_size: config.ring_size,
            queue: Mutex::new(VecDeque::new()),
            queue_max: config.write_queue_max,
            dropped: AtomicI64::new(0),
            drop_warned_at: Mutex::new(None),
            wakeup: Notify::new(),
            fanout,
        });

        let log = EventLog {
            inner: Arc::clone(&inner),
        };
        let writer = tokio::spawn(writer_task(inner, shutdown));
        Ok((log, writer))
    }

    /// Append one record: assigns id and timestamp, mirrors into the ring,
    /// enqueues for the SQLite writer, and fans out to subscribers.
    pub fn append(&self, level: LogLevel, kind: EventKind, message: impl Into<String>) -> EventRecord {
        let record = EventRecord {
            id: self.inner.next_id.fetch_add(1, Ordering::SeqCst),
            ts: Utc::now(),
            level,
            kind,
            message: message.into(),
        };

        match level {
            LogLevel::Info => info!(kind = kind.as_str(), "{}", record.message),
            LogLevel::Warn => warn!(kind = kind.as_str(), "{}", record.message),
            LogLevel::Err => error!(kind = kind.as_str(), "{}", record.message),
        }

        {
            let mut ring = self.inner.ring.write().unwrap_or_else(|e| e.into_inner());
            if ring.len() >= self.inner.ring_size {
                ring.pop_front();
            }
            ring.push_back(record.clone());
        }

        self.enqueue(record.clone());
        let _ = self.inner.fanout.send(record.clone());
        record
    }

    fn enqueue(&self, record: EventRecord) {
        let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= self.inner.queue_max {
            // Shed the oldest Info first; an Info arrival with nothing
            // sheddable is itself dropped.  Warn/Err always enter the queue.
            if let Some(pos) = queue.iter().position(|r| r.level == LogLevel::Info) {
                queue.remove(pos);
                self.note_drop();
            } else if record.level == LogLevel::Info {
                self.note_drop();
                return;
            }
        }
        queue.push_back(record);
        drop(queue);
        self.inner.wakeup.notify_one();
    }

    fn note_drop(&self) {
        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        let mut warned_at = self
            .inner
            .drop_warned_at
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let due = match *warned_at {
            Some(at) => now.duration_since(at) >= DROP_WARN_INTERVAL,
            None => true,
        };
        if due {
            *warned_at = Some(now);
            let total = self.inner.dropped.load(Ordering::Relaxed);
            warn!(total_dropped = total, "event write queue full, shedding info records");
        }
    }

    pub fn last_id(&self) -> i64 {
        self.inner.next_id.load(Ordering::SeqCst) - 1
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.inner.fanout.subscribe()
    }

    /// Paged read, newest first.  Served from the ring when the requested
    /// page lies entirely within it, falling through to the table otherwise.
    pub async fn read_paged(&self, offset: usize, limit: usize) -> Result<Vec<EventRecord>> {
        {
            let ring = self.inner.ring.read().unwrap_or_else(|e| e.into_inner());
            let covered = offset + limit <= ring.len();
            if covered {
                return Ok(ring.iter().rev().skip(offset).take(limit).cloned().collect());
            }
        }
        db::list_events(&self.inner.pool, offset as i64, limit as i64).await
    }

    /// Wait until everything queued so far has reached SQLite.
    pub async fn flush(&self) {
        loop {
            let empty = {
                let queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
                queue.is_empty()
            };
            if empty {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }
}

/// Single SQLite writer: drains the queue on wakeup, and drains whatever is
/// left when shutdown is requested before exiting.
async fn writer_task(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let stopping = *shutdown.borrow();

        loop {
            let record = {
                let mut queue = inner.queue.lock().unwrap_or_else(|e| e.into_inner());
                queue.pop_front()
            };
            let Some(record) = record else { break };
            if let Err(e) = db::insert_event(&inner.pool, &record).await {
                error!(id = record.id, "failed to persist event: {e:#}");
            }
        }

        if stopping {
            break;
        }

        tokio::select! {
            _ = inner.wakeup.notified() => {}
            _ = shutdown.changed() => {}
        }
    }
    info!("event log writer stopped");
}

// ===========================================================================
// Tests
// ===========================================================================
