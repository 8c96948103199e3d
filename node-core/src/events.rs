//! In-process publish/subscribe.
//!
//! Producers enqueue into a bounded FIFO without ever waiting. A single
//! consumer task drains the queue and runs every handler subscribed to the
//! event's topic, in registration order. Handlers therefore run one at a
//! time on the consumer task and a slow handler delays everything queued
//! behind it.

use crate::device::ConnectivitySnapshot;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    ConnectivityChanged,
    ButtonShortPress,
    ButtonLongPress,
    RestartRequested,
}

/// An event with its topic-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ConnectivityChanged(ConnectivitySnapshot),
    ButtonShortPress,
    ButtonLongPress,
    RestartRequested,
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::ConnectivityChanged(_) => Topic::ConnectivityChanged,
            Event::ButtonShortPress => Topic::ButtonShortPress,
            Event::ButtonLongPress => Topic::ButtonLongPress,
            Event::RestartRequested => Topic::RestartRequested,
        }
    }
}

/// A subscriber. Runs on the consumer task and must not block indefinitely.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event);
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, event: &Event) {
        (self.0)(event.clone()).await
    }
}

type Subscribers = HashMap<Topic, Vec<Arc<dyn EventHandler>>>;

pub struct EventBus {
    tx: mpsc::Sender<Event>,
    rx: Mutex<Option<mpsc::Receiver<Event>>>,
    subscribers: RwLock<Subscribers>,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Arc::new(Self {
            tx,
            rx: Mutex::new(Some(rx)),
            subscribers: RwLock::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        })
    }

    /// Enqueues `event` without waiting.
    ///
    /// A full (or closed) queue drops the event; the only trace is a warning
    /// and the [`EventBus::dropped`] counter. Returns whether it was queued.
    pub fn publish(&self, event: Event) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(topic = ?event.topic(), dropped_total = total, "Event queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(topic = ?event.topic(), "Event consumer gone, dropping event");
                false
            }
        }
    }

    pub fn subscribe(&self, topic: Topic, handler: Arc<dyn EventHandler>) {
        let mut subscribers = self.subscribers.write();
        let list = subscribers.entry(topic).or_default();
        list.push(handler);
        tracing::debug!(?topic, count = list.len(), "Handler subscribed");
    }

    pub fn subscribe_fn<F, Fut>(&self, topic: Topic, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(topic, Arc::new(FnHandler(handler)));
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Spawns the consumer task. Only one consumer may ever run.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let mut rx = self.rx.lock().take().ok_or(Error::ConsumerRunning)?;
        let bus = Arc::clone(self);
        Ok(tokio::spawn(async move {
            tracing::info!("Event consumer started");
            while let Some(event) = rx.recv().await {
                bus.dispatch(&event).await;
            }
            tracing::info!("Event consumer stopped");
        }))
    }

    async fn dispatch(&self, event: &Event) {
        let topic = event.topic();
        // Snapshot so that handlers may subscribe without deadlocking.
        let handlers = self.subscribers.read().get(&topic).cloned().unwrap_or_default();
        tracing::trace!(?topic, handlers = handlers.len(), "Dispatching event");
        for handler in handlers {
            handler.handle(event).await;
        }
    }
}
