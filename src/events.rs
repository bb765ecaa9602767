//! Status notifications for UI/CLI consumers.
//!
//! Every subscriber gets its own unbounded queue. `publish` pushes the event
//! onto all of them before it returns, so each subscriber sees every event in
//! publish order and a slow subscriber never causes another to miss one.
//! Publishes are serialized, so concurrent publishers still reach every
//! subscriber in the same order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::Device;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusKind {
    Started {
        device_id: String,
        device_name: String,
    },
    Streaming {
        stream_url: String,
    },
    Reconnecting {
        attempt: u32,
        reason: String,
    },
    Stopped,
    Failed {
        reason: String,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: StatusKind,
}

impl StatusEvent {
    pub fn new(kind: StatusKind) -> Self {
        Self { at: Utc::now(), kind }
    }

    pub fn started(device: &Device) -> Self {
        Self::new(StatusKind::Started {
            device_id: device.id.clone(),
            device_name: device.display_name.clone(),
        })
    }

    pub fn streaming(stream_url: impl Into<String>) -> Self {
        Self::new(StatusKind::Streaming {
            stream_url: stream_url.into(),
        })
    }

    pub fn reconnecting(attempt: u32, reason: impl Into<String>) -> Self {
        Self::new(StatusKind::Reconnecting {
            attempt,
            reason: reason.into(),
        })
    }

    pub fn stopped() -> Self {
        Self::new(StatusKind::Stopped)
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::new(StatusKind::Failed {
            reason: reason.into(),
        })
    }
}

pub type SubscriptionId = u64;

/// Receiving end of a [`StatusBus`] subscription.
pub struct StatusSubscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<StatusEvent>,
}

impl StatusSubscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next event, or `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StatusEvent> {
        self.rx.try_recv().ok()
    }
}

#[derive(Clone, Default)]
pub struct StatusBus {
    subscribers: Arc<DashMap<SubscriptionId, mpsc::UnboundedSender<StatusEvent>>>,
    next_id: Arc<AtomicU64>,
    publishing: Arc<Mutex<()>>,
}

impl StatusBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> StatusSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(id, tx);
        StatusSubscription { id, rx }
    }

    /// Remove a subscriber. Events already queued stay readable.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    pub fn publish(&self, event: StatusEvent) {
        debug!("Status event: {:?}", event.kind);
        let _order = self.publishing.lock().unwrap_or_else(PoisonError::into_inner);
        self.subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
