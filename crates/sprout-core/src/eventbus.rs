//! Event bus collaborator.
//!
//! The recovery core only publishes alert events here; everything else on the
//! bus belongs to the surrounding application. Two subscription styles are
//! offered: pull-based receivers and push-based handlers that run on their
//! own task until unsubscribed.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::event::{EventMetadata, SproutEvent};

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Identifier returned by handler subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Push-style event consumer.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &SproutEvent, metadata: &EventMetadata) -> anyhow::Result<()>;
}

/// Predicate applied to events before delivery.
pub type EventFilter = Arc<dyn Fn(&SproutEvent) -> bool + Send + Sync>;

/// Options for handler subscriptions.
#[derive(Clone, Default)]
pub struct SubscriptionOptions {
    /// Event type names to accept (see [`SproutEvent::type_name`]); empty accepts all.
    pub event_types: Vec<String>,
    /// Additional predicate.
    pub filter: Option<EventFilter>,
}

impl SubscriptionOptions {
    pub fn alerts() -> Self {
        Self {
            event_types: vec!["DeviceAlert".to_string()],
            filter: None,
        }
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&SproutEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    fn accepts(&self, event: &SproutEvent) -> bool {
        let type_ok = self.event_types.is_empty()
            || self.event_types.iter().any(|t| t == event.type_name());
        type_ok && self.filter.as_ref().map_or(true, |f| f(event))
    }
}

/// Event bus for Sprout.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<(SproutEvent, EventMetadata)>,
    handlers: Arc<DashMap<SubscriptionId, JoinHandle<()>>>,
    name: String,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with the specified capacity.
    ///
    /// The capacity determines how many events are buffered for slow subscribers.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            handlers: Arc::new(DashMap::new()),
            name: "default".to_string(),
        }
    }

    /// Create a new event bus with a name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::new()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of live receivers, including handler tasks.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event from the `system` source.
    pub async fn publish(&self, event: SproutEvent) -> bool {
        self.publish_with_source(event, "system").await
    }

    /// Publish an event with a custom source.
    ///
    /// Returns `true` if at least one subscriber received it.
    pub async fn publish_with_source(&self, event: SproutEvent, source: impl Into<String>) -> bool {
        let metadata = EventMetadata::new(source);
        self.tx.send((event, metadata)).is_ok()
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
        }
    }

    /// Subscribe to events matching a filter.
    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredReceiver<F>
    where
        F: Fn(&SproutEvent) -> bool + Send + 'static,
    {
        FilteredReceiver {
            rx: self.tx.subscribe(),
            filter,
        }
    }

    /// Run `handler` for every accepted event until [`unsubscribe`](Self::unsubscribe) is called.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe_handler(
        &self,
        handler: Arc<dyn EventHandler>,
        options: SubscriptionOptions,
    ) -> SubscriptionId {
        let id = SubscriptionId::new();
        let mut rx = self.tx.subscribe();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok((event, metadata)) => {
                        if !options.accepts(&event) {
                            continue;
                        }
                        let outcome = AssertUnwindSafe(handler.handle(&event, &metadata))
                            .catch_unwind()
                            .await;
                        match outcome {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => tracing::warn!(
                                subscription = %id,
                                event = event.type_name(),
                                error = %e,
                                "Event handler failed"
                            ),
                            Err(_) => tracing::error!(
                                subscription = %id,
                                event = event.type_name(),
                                "Event handler panicked"
                            ),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(subscription = %id, missed, "Event handler lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.handlers.insert(id, task);
        id
    }

    /// Stop a handler subscription. Returns `false` if the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.handlers.remove(&id) {
            Some((_, task)) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver for all events from the event bus.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<(SproutEvent, EventMetadata)>,
}

impl EventBusReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` if the event bus is closed.
    pub async fn recv(&mut self) -> Option<(SproutEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<(SproutEvent, EventMetadata)> {
        self.rx.try_recv().ok()
    }
}

/// Receiver for filtered events from the event bus.
pub struct FilteredReceiver<F>
where
    F: Fn(&SproutEvent) -> bool + Send,
{
    rx: broadcast::Receiver<(SproutEvent, EventMetadata)>,
    filter: F,
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&SproutEvent) -> bool + Send,
{
    /// Receive the next event matching the filter.
    pub async fn recv(&mut self) -> Option<(SproutEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok((event, meta)) => {
                    if (self.filter)(&event) {
                        return Some((event, meta));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive a matching event without blocking.
    pub fn try_recv(&mut self) -> Option<(SproutEvent, EventMetadata)> {
        while let Ok((event, meta)) = self.rx.try_recv() {
            if (self.filter)(&event) {
                return Some((event, meta));
            }
        }
        None
    }
}

/// Shared event bus handle.
pub type SharedEventBus = Arc<EventBus>;
