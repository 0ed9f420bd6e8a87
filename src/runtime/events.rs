//! Station lifecycle event bus.
//!
//! Broadcasts high-level station events (connected, disconnected,
//! transaction lifecycle) to any number of subscribers — an admin CLI,
//! a future HTTP surface, tests — independent of the raw OCPP message
//! log kept by `runtime::logger`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::domain::transaction::{StopReason, TransactionId};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum StationEvent {
    Connected {
        station_id: String,
        timestamp: DateTime<Utc>,
    },
    Disconnected {
        station_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    TransactionStarted {
        station_id: String,
        connector_id: u32,
        transaction_id: TransactionId,
        timestamp: DateTime<Utc>,
    },
    TransactionStopped {
        station_id: String,
        connector_id: u32,
        transaction_id: TransactionId,
        reason: StopReason,
        timestamp: DateTime<Utc>,
    },
    AuthorizationRejected {
        station_id: String,
        id_tag: String,
        timestamp: DateTime<Utc>,
    },
}

impl StationEvent {
    pub fn station_id(&self) -> &str {
        match self {
            Self::Connected { station_id, .. }
            | Self::Disconnected { station_id, .. }
            | Self::TransactionStarted { station_id, .. }
            | Self::TransactionStopped { station_id, .. }
            | Self::AuthorizationRejected { station_id, .. } => station_id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::TransactionStarted { .. } => "transaction_started",
            Self::TransactionStopped { .. } => "transaction_stopped",
            Self::AuthorizationRejected { .. } => "authorization_rejected",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StationEvent>,
    subscriber_count: Arc<AtomicUsize>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscriber_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn publish(&self, event: StationEvent) {
        let kind = event.kind();
        let station_id = event.station_id().to_string();
        match self.sender.send(event) {
            Ok(count) => debug!(kind, station_id, subscribers = count, "event published"),
            Err(_) => debug!(kind, station_id, "event published (no subscribers)"),
        }
    }

    pub fn subscribe(&self) -> EventSubscriber {
        let receiver = self.sender.subscribe();
        self.subscriber_count.fetch_add(1, Ordering::SeqCst);
        let count = self.subscriber_count.load(Ordering::SeqCst);
        info!(total = count, "new event subscriber");
        EventSubscriber {
            receiver,
            subscriber_count: self.subscriber_count.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct EventSubscriber {
    receiver: broadcast::Receiver<StationEvent>,
    subscriber_count: Arc<AtomicUsize>,
}

impl EventSubscriber {
    pub async fn recv(&mut self) -> Option<StationEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!(missed = count, "event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for EventSubscriber {
    fn drop(&mut self) {
        let prev = self.subscriber_count.fetch_sub(1, Ordering::SeqCst);
        info!(remaining = prev - 1, "event subscriber disconnected");
    }
}

pub type SharedEventBus = Arc<EventBus>;

pub fn create_event_bus() -> SharedEventBus {
    Arc::new(EventBus::new())
}
