//! Lifecycle event delivery
//!
//! Posting never blocks: events go into a bounded queue and are dropped with
//! a warning when it is full. A background task hands each event to the
//! configured listeners in order.

use crate::config::EventsConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    ProxyStart,
    ProxyStartFailed,
    ProxyStop,
    ProxyStopFailed,
    ProxyRecovered,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ProxyStart => "PROXY_START",
            EventType::ProxyStartFailed => "PROXY_START_FAILED",
            EventType::ProxyStop => "PROXY_STOP",
            EventType::ProxyStopFailed => "PROXY_STOP_FAILED",
            EventType::ProxyRecovered => "PROXY_RECOVERED",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event_type: EventType,
    pub user_id: String,
    pub instance_id: String,
    pub spec_id: String,
    pub timestamp: DateTime<Utc>,
    /// Extra details, e.g. the error message of a failed start
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(event_type: EventType, user_id: &str, instance_id: &str, spec_id: &str) -> Self {
        Self {
            event_type,
            user_id: user_id.to_string(),
            instance_id: instance_id.to_string(),
            spec_id: spec_id.to_string(),
            timestamp: Utc::now(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Fire-and-forget destination for lifecycle events
pub trait EventSink: Send + Sync {
    fn post(&self, event: Event);
}

/// Discards every event
pub struct NullSink;

impl EventSink for NullSink {
    fn post(&self, _event: Event) {}
}

/// Consumer of events, called from the dispatch task
#[async_trait]
pub trait EventListener: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_event(&self, event: &Event) -> anyhow::Result<()>;
}

/// Writes events to the log
pub struct LogListener;

#[async_trait]
impl EventListener for LogListener {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        info!(
            target: "events",
            event = event.event_type.as_str(),
            user_id = %event.user_id,
            instance_id = %event.instance_id,
            spec_id = %event.spec_id,
            data = %event.data,
            "Lifecycle event"
        );
        Ok(())
    }
}

/// POSTs each event as JSON
pub struct WebhookListener {
    client: reqwest::Client,
    url: String,
}

impl WebhookListener {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl EventListener for WebhookListener {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .header("X-Gantry-Event", event.event_type.as_str())
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Bounded, non-blocking [`EventSink`] feeding a set of listeners
pub struct EventBus {
    tx: mpsc::Sender<Event>,
    dropped: AtomicU64,
}

impl EventBus {
    /// Start the dispatch task. Must be called within a tokio runtime.
    pub fn start(capacity: usize, listeners: Vec<Arc<dyn EventListener>>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<Event>(capacity.max(1));

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for listener in &listeners {
                    if let Err(e) = listener.on_event(&event).await {
                        warn!(
                            listener = listener.name(),
                            event = event.event_type.as_str(),
                            error = %e,
                            "Event listener failed"
                        );
                    }
                }
            }
            debug!("Event dispatcher stopped");
        });

        Arc::new(Self {
            tx,
            dropped: AtomicU64::new(0),
        })
    }

    pub fn from_config(config: &EventsConfig) -> anyhow::Result<Arc<Self>> {
        let mut listeners: Vec<Arc<dyn EventListener>> = Vec::new();
        if config.log {
            listeners.push(Arc::new(LogListener));
        }
        if let Some(ref url) = config.webhook_url {
            listeners.push(Arc::new(WebhookListener::new(
                url,
                Duration::from_secs(config.webhook_timeout_secs),
            )?));
            info!(url, "Event webhook enabled");
        }
        Ok(Self::start(config.queue_size, listeners))
    }

    /// Number of events dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for EventBus {
    fn post(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event = event.event_type.as_str(),
                    instance_id = %event.instance_id,
                    "Event queue full, dropping event"
                );
            }
            Err(TrySendError::Closed(_)) => debug!("Event dispatcher gone, dropping event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    struct Recording {
        events: Mutex<Vec<EventType>>,
        notify: Notify,
    }

    #[async_trait]
    impl EventListener for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn on_event(&self, event: &Event) -> anyhow::Result<()> {
            self.events.lock().push(event.event_type);
            self.notify.notify_one();
            Ok(())
        }
    }

    struct Blocking {
        release: Notify,
    }

    #[async_trait]
    impl EventListener for Blocking {
        fn name(&self) -> &'static str {
            "blocking"
        }

        async fn on_event(&self, _event: &Event) -> anyhow::Result<()> {
            self.release.notified().await;
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventListener for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn on_event(&self, _event: &Event) -> anyhow::Result<()> {
            anyhow::bail!("unreachable sink")
        }
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let recording = Arc::new(Recording {
            events: Mutex::new(Vec::new()),
            notify: Notify::new(),
        });
        let bus = EventBus::start(16, vec![Arc::new(Failing), recording.clone()]);

        bus.post(Event::new(EventType::ProxyStart, "jack", "i1", "app"));
        bus.post(Event::new(EventType::ProxyStop, "jack", "i1", "app"));

        tokio::time::timeout(Duration::from_secs(2), async {
            while recording.events.lock().len() < 2 {
                recording.notify.notified().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            *recording.events.lock(),
            vec![EventType::ProxyStart, EventType::ProxyStop]
        );
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let blocking = Arc::new(Blocking {
            release: Notify::new(),
        });
        let bus = EventBus::start(1, vec![blocking.clone()]);

        for _ in 0..10 {
            bus.post(Event::new(EventType::ProxyStart, "jack", "i", "app"));
        }
        assert!(bus.dropped() >= 8);
        blocking.release.notify_waiters();
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::new(EventType::ProxyStartFailed, "jack", "i1", "app")
            .with_data(serde_json::json!({ "error": "boom" }));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "PROXY_START_FAILED");
        assert_eq!(json["data"]["error"], "boom");
    }
}
