//! # Event Bus
//!
//! Channel-per-subscriber publish/subscribe.
//!
//! Publishing never blocks: each matching subscriber receives the event via
//! `try_send` on its own bounded channel. A full or closed channel is logged
//! and counted in [`EventBusStats`]; closed subscribers are removed.

use crate::config::EventsConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventType};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Predicate applied after event-type matching
pub type EventFilter = Arc<dyn Fn(&EngineEvent) -> bool + Send + Sync>;

struct Subscriber {
    /// Empty means every type
    event_types: HashSet<EventType>,
    filter: Option<EventFilter>,
    sender: mpsc::Sender<Arc<EngineEvent>>,
}

impl Subscriber {
    fn matches(&self, event: &EngineEvent) -> bool {
        (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
            && self.filter.as_ref().map_or(true, |filter| filter(event))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventBusStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped_full: u64,
    pub dropped_closed: u64,
    pub subscribers: usize,
}

/// Engine event bus, constructed once and shared by reference
pub struct EventBus {
    subscribers: DashMap<String, Subscriber>,
    subscriber_capacity: usize,
    audit_log: Mutex<VecDeque<Arc<EngineEvent>>>,
    audit_capacity: usize,
    stats: Mutex<EventBusStats>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.len())
            .field("subscriber_capacity", &self.subscriber_capacity)
            .field("audit_capacity", &self.audit_capacity)
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(&EventsConfig::default())
    }
}

impl EventBus {
    pub fn new(config: &EventsConfig) -> Self {
        Self {
            subscribers: DashMap::new(),
            subscriber_capacity: config.subscriber_capacity.max(1),
            audit_log: Mutex::new(VecDeque::with_capacity(config.audit_log_capacity)),
            audit_capacity: config.audit_log_capacity,
            stats: Mutex::new(EventBusStats::default()),
        }
    }

    /// Publish without blocking. Returns the number of subscribers reached.
    pub fn publish(&self, event: EngineEvent) -> usize {
        let event = Arc::new(event);
        self.record_audit(&event);

        let mut delivered = 0usize;
        let mut dropped_full = 0u64;
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if !subscriber.matches(&event) {
                continue;
            }
            match subscriber.sender.try_send(Arc::clone(&event)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    dropped_full += 1;
                    warn!(
                        subscriber = %entry.key(),
                        event_type = %event.event_type,
                        correlation_id = %event.correlation_id,
                        "Subscriber channel full, event not delivered"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    closed.push(entry.key().clone());
                }
            }
        }

        for id in &closed {
            warn!(
                subscriber = %id,
                event_type = %event.event_type,
                correlation_id = %event.correlation_id,
                "Subscriber channel closed, removing subscriber"
            );
            self.subscribers.remove(id);
        }

        let mut stats = self.stats.lock();
        stats.published += 1;
        stats.delivered += delivered as u64;
        stats.dropped_full += dropped_full;
        stats.dropped_closed += closed.len() as u64;

        debug!(
            event_type = %event.event_type,
            correlation_id = %event.correlation_id,
            delivered = delivered,
            "Event published"
        );
        delivered
    }

    fn record_audit(&self, event: &Arc<EngineEvent>) {
        if self.audit_capacity == 0 {
            return;
        }
        let mut log = self.audit_log.lock();
        if log.len() == self.audit_capacity {
            log.pop_front();
        }
        log.push_back(Arc::clone(event));
    }

    /// Register a channel subscriber. An empty `event_types` receives everything.
    pub fn subscribe(
        &self,
        subscriber_id: impl Into<String>,
        event_types: Vec<EventType>,
        filter: Option<EventFilter>,
    ) -> EngineResult<mpsc::Receiver<Arc<EngineEvent>>> {
        let subscriber_id = subscriber_id.into();
        let (sender, receiver) = mpsc::channel(self.subscriber_capacity);

        match self.subscribers.entry(subscriber_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(EngineError::Event(format!(
                    "subscriber '{subscriber_id}' already registered"
                )))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Subscriber {
                    event_types: event_types.into_iter().collect(),
                    filter,
                    sender,
                });
            }
        }

        debug!(subscriber = %subscriber_id, "Subscriber registered");
        Ok(receiver)
    }

    /// Register a subscriber whose events are handed to `callback` on a
    /// dedicated delivery task.
    pub fn subscribe_with_callback<F, Fut>(
        &self,
        subscriber_id: impl Into<String>,
        event_types: Vec<EventType>,
        filter: Option<EventFilter>,
        callback: F,
    ) -> EngineResult<JoinHandle<()>>
    where
        F: Fn(Arc<EngineEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut receiver = self.subscribe(subscriber_id, event_types, filter)?;
        Ok(tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                callback(event).await;
            }
        }))
    }

    pub fn unsubscribe(&self, subscriber_id: &str) -> bool {
        self.subscribers.remove(subscriber_id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn stats(&self) -> EventBusStats {
        let mut stats = self.stats.lock().clone();
        stats.subscribers = self.subscribers.len();
        stats
    }

    /// Most recent events, oldest first
    pub fn recent_events(&self, limit: usize) -> Vec<Arc<EngineEvent>> {
        let log = self.audit_log.lock();
        let skip = log.len().saturating_sub(limit);
        log.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPayload;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn event(event_type: EventType) -> EngineEvent {
        EngineEvent::new(
            event_type,
            Uuid::new_v4(),
            "OK",
            EventPayload::Workflow {
                items: 1,
                completed: 1,
                failed: 0,
                skipped: 0,
            },
        )
    }

    fn bus(subscriber_capacity: usize, audit_log_capacity: usize) -> EventBus {
        EventBus::new(&EventsConfig {
            subscriber_capacity,
            audit_log_capacity,
        })
    }

    #[tokio::test]
    async fn test_type_filtered_delivery() {
        let bus = bus(8, 10);
        let mut workflow_rx = bus
            .subscribe("workflows", vec![EventType::WorkflowCompleted], None)
            .unwrap();
        let mut all_rx = bus.subscribe("all", vec![], None).unwrap();

        assert_eq!(bus.publish(event(EventType::StepStarted)), 1);
        assert_eq!(bus.publish(event(EventType::WorkflowCompleted)), 2);

        assert_eq!(
            workflow_rx.recv().await.unwrap().event_type,
            EventType::WorkflowCompleted
        );
        assert_eq!(all_rx.recv().await.unwrap().event_type, EventType::StepStarted);
        assert_eq!(bus.stats().delivered, 3);
    }

    #[tokio::test]
    async fn test_predicate_filter() {
        let bus = bus(8, 10);
        let filter: EventFilter = Arc::new(|event: &EngineEvent| event.item_id.as_deref() == Some("Q2"));
        let mut rx = bus.subscribe("q2", vec![], Some(filter)).unwrap();

        bus.publish(event(EventType::StepStarted).with_item("Q1"));
        bus.publish(event(EventType::StepStarted).with_item("Q2"));

        assert_eq!(rx.recv().await.unwrap().item_id.as_deref(), Some("Q2"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_and_closed_channels_are_counted() {
        let bus = bus(1, 10);
        let _slow = bus.subscribe("slow", vec![], None).unwrap();
        let gone = bus.subscribe("gone", vec![], None).unwrap();
        drop(gone);

        bus.publish(event(EventType::StepStarted));
        bus.publish(event(EventType::StepStarted));

        let stats = bus.stats();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.dropped_full, 1);
        assert_eq!(stats.dropped_closed, 1);
        assert_eq!(stats.subscribers, 1);
    }

    #[tokio::test]
    async fn test_duplicate_subscriber_rejected_and_unsubscribe() {
        let bus = bus(4, 10);
        let _rx = bus.subscribe("a", vec![], None).unwrap();
        assert!(matches!(
            bus.subscribe("a", vec![], None),
            Err(EngineError::Event(_))
        ));
        assert!(bus.unsubscribe("a"));
        assert!(!bus.unsubscribe("a"));
    }

    #[tokio::test]
    async fn test_callback_subscriber() {
        let bus = bus(4, 10);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let handle = bus
            .subscribe_with_callback("cb", vec![EventType::StepFailed], None, move |_event| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        bus.publish(event(EventType::StepFailed));
        bus.publish(event(EventType::StepFailed));
        bus.unsubscribe("cb");
        handle.await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_audit_log_is_bounded() {
        let bus = bus(4, 3);
        for _ in 0..5 {
            bus.publish(event(EventType::StepStarted));
        }
        assert_eq!(bus.recent_events(10).len(), 3);
        assert_eq!(bus.recent_events(2).len(), 2);
    }
}
