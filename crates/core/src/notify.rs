//! Outbound fault notification through a narrow interface.
//!
//! The transport is a Slack incoming webhook when configured, otherwise the
//! log.  Hazard paths wrap the notifier in a rate limiter so a persistent
//! fault produces one notification per interval, not one per tick.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, warn};

use crate::config::NotifyConfig;

pub trait Notifier: Send + Sync {
    /// Fire-and-forget; the caller never waits on delivery.
    fn notify(&self, message: &str);
}

/// Fallback notifier: the message only reaches the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        warn!(target: "notify", "{message}");
    }
}

/// Posts `{"text": ...}` to a Slack incoming webhook.
pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> SlackNotifier {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        SlackNotifier {
            client,
            webhook_url,
        }
    }
}

impl Notifier for SlackNotifier {
    fn notify(&self, message: &str) {
        let client = self.client.clone();
        let url = self.webhook_url.clone();
        let payload = serde_json::json!({ "text": message });
        tokio::spawn(async move {
            match client.post(&url).json(&payload).send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => error!("slack webhook returned {}", resp.status()),
                Err(e) => error!("slack webhook failed: {e}"),
            }
        });
    }
}

/// Suppresses repeat notifications within `interval`.
pub struct RateLimited {
    inner: Arc<dyn Notifier>,
    interval: Duration,
    last_sent: Mutex<Option<Instant>>,
}

impl RateLimited {
    pub fn new(inner: Arc<dyn Notifier>, interval: Duration) -> RateLimited {
        RateLimited {
            inner,
            interval,
            last_sent: Mutex::new(None),
        }
    }

    /// True when the message was actually forwarded.
    pub fn notify(&self, message: &str) -> bool {
        let mut last = self.last_sent.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if let Some(at) = *last {
            if now.duration_since(at) < self.interval {
                return false;
            }
        }
        *last = Some(now);
        self.inner.notify(message);
        true
    }
}

/// Notifier from config: Slack when a webhook is set, log otherwise.
pub fn from_config(config: &NotifyConfig) -> Arc<dyn Notifier> {
    match &config.slack_webhook_url {
        Some(url) if !url.is_empty() => Arc::new(SlackNotifier::new(url.clone())),
        _ => Arc::new(LogNotifier),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingNotifier(AtomicUsize);

    impl Notifier for CountingNotifier {
        fn notify(&self, _message: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_suppresses_repeats() {
        let counter = Arc::new(CountingNotifier(AtomicUsize::new(0)));
        let limited = RateLimited::new(counter.clone(), Duration::from_secs(1800));

        assert!(limited.notify("water leak"));
        assert!(!limited.notify("water leak"));
        assert!(!limited.notify("water leak"));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        // After the interval the next notification goes through.
        tokio::time::advance(Duration::from_secs(1801)).await;
        assert!(limited.notify("water leak"));
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn from_config_falls_back_to_log() {
        let notifier = from_config(&NotifyConfig::default());
        // Must not panic or block.
        notifier.notify("test message");
    }
}
