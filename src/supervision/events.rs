//! Event bus
//!
//! Lifecycle notifications fan out over a bounded `tokio::sync::broadcast`
//! channel. Delivery is best effort: a subscriber that falls more than the
//! buffer behind loses the oldest events and is told how many it missed.
//! Publishing never blocks and never fails, with or without subscribers.

use crate::config::ThresholdSet;
use crate::resource::{Domain, Snapshot, Status};
use crate::self_healing::RecoveryOutcome;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Everything the monitor announces.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum MonitorEvent {
    ResourceUpdated(Vec<Snapshot>),
    MonitoringStarted {
        domains: Vec<Domain>,
        interval_ms: u64,
    },
    MonitoringStopped {
        domains: Vec<Domain>,
    },
    StatusChanged {
        domain: Domain,
        from: Status,
        to: Status,
    },
    CleanupStarted {
        domains: Vec<Domain>,
        forced: bool,
    },
    CleanupCompleted {
        domain: Domain,
        outcomes: Vec<RecoveryOutcome>,
        total_released: f64,
    },
    CleanupFailed {
        domain: Domain,
        error: String,
    },
    RecoverySuccess {
        domain: Domain,
        strategy: String,
    },
    RecoveryFailed {
        domain: Domain,
    },
    ThresholdsUpdated(BTreeMap<Domain, ThresholdSet>),
}

impl MonitorEvent {
    /// Wire name of the event, matching its serialized tag.
    pub fn name(&self) -> &'static str {
        match self {
            MonitorEvent::ResourceUpdated(_) => "resource-updated",
            MonitorEvent::MonitoringStarted { .. } => "monitoring-started",
            MonitorEvent::MonitoringStopped { .. } => "monitoring-stopped",
            MonitorEvent::StatusChanged { .. } => "status-changed",
            MonitorEvent::CleanupStarted { .. } => "cleanup-started",
            MonitorEvent::CleanupCompleted { .. } => "cleanup-completed",
            MonitorEvent::CleanupFailed { .. } => "cleanup-failed",
            MonitorEvent::RecoverySuccess { .. } => "recovery-success",
            MonitorEvent::RecoveryFailed { .. } => "recovery-failed",
            MonitorEvent::ThresholdsUpdated(_) => "thresholds-updated",
        }
    }
}

struct BusInner {
    tx: broadcast::Sender<MonitorEvent>,
    published: AtomicU64,
}

/// Cloneable handle to the shared broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                tx,
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Fire-and-forget. Returns how many subscribers the event reached.
    pub fn publish(&self, event: MonitorEvent) -> usize {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        let name = event.name();
        match self.inner.tx.send(event) {
            Ok(n) => n,
            Err(_) => {
                debug!(event = name, "No subscribers for event");
                0
            }
        }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.inner.tx.subscribe(),
            missed: 0,
        }
    }

    /// Run `callback` for every event on a background task until the returned
    /// handle is dropped. Must be called inside a tokio runtime.
    pub fn subscribe_with<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(MonitorEvent) + Send + 'static,
    {
        let mut sub = self.subscribe();
        let task = tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                callback(event);
            }
        });
        SubscriptionHandle { task: Some(task) }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }

    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("published", &self.published())
            .finish()
    }
}

/// Pull-style subscription. Dropping it unsubscribes.
pub struct Subscription {
    rx: broadcast::Receiver<MonitorEvent>,
    missed: u64,
}

impl Subscription {
    /// Next event, skipping over any the subscriber lagged past.
    /// `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<MonitorEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => {
                    self.missed += n;
                    warn!(missed = n, "Event subscriber lagged, oldest events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<MonitorEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(n)) => self.missed += n,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<MonitorEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Events lost to lag so far.
    pub fn missed(&self) -> u64 {
        self.missed
    }
}

/// Keeps a callback subscription alive. Dropping it stops delivery.
pub struct SubscriptionHandle {
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn unsubscribe(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn started() -> MonitorEvent {
        MonitorEvent::MonitoringStarted {
            domains: vec![Domain::Memory],
            interval_ms: 1000,
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new(8);
        assert_eq!(bus.publish(started()), 0);
        assert_eq!(bus.published(), 1);
    }

    #[tokio::test]
    async fn test_subscribers_each_receive_events() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.publish(started()), 2);

        assert_eq!(a.recv().await.unwrap().name(), "monitoring-started");
        assert_eq!(b.recv().await.unwrap().name(), "monitoring-started");
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = EventBus::new(8);
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_slow_subscriber_loses_oldest() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();
        for _ in 0..5 {
            bus.publish(MonitorEvent::RecoveryFailed {
                domain: Domain::Cpu,
            });
        }
        let events = sub.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(sub.missed(), 3);
    }

    #[tokio::test]
    async fn test_callback_subscription_stops_on_drop() {
        let bus = EventBus::new(8);
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = bus.subscribe_with(move |e| sink.lock().unwrap().push(e.name()));

        bus.publish(started());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.lock().unwrap().as_slice(), &["monitoring-started"]);

        drop(handle);
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(started());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_event_serializes_with_kebab_tag() {
        let json = serde_json::to_value(MonitorEvent::StatusChanged {
            domain: Domain::Memory,
            from: Status::Normal,
            to: Status::Warning,
        })
        .unwrap();
        assert_eq!(json["event"], "status-changed");
        assert_eq!(json["data"]["domain"], "memory");
        assert_eq!(json["data"]["to"], "warning");
    }
}
