//! Message logger: bounded ring buffer of `MessageRecord`s with batched
//! flush to a repository and broadcast fan-out to live subscribers.
//!
//! Follows the same broadcast-channel fan-out pattern as `runtime::events`'
//! `EventBus`, but fans out raw OCPP-J traffic rather than domain events,
//! and adds the ring-buffer plus batched flush to a repository.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, Duration};
use tracing::{debug, warn};

use crate::domain::message::{Direction, MessageRecord, MessageStats, MessageType};
use crate::support::ShutdownSignal;

const DEFAULT_RING_CAPACITY: usize = 2048;
const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 5;
const DEFAULT_FLUSH_BATCH: usize = 256;

/// Sink a batch of records are flushed to, e.g. an in-memory or durable
/// message repository.
#[async_trait::async_trait]
pub trait MessageSink: Send + Sync {
    async fn store_batch(&self, records: Vec<MessageRecord>);
}

struct RingBuffer {
    records: VecDeque<MessageRecord>,
    capacity: usize,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, record: MessageRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    fn drain_batch(&mut self, max: usize) -> Vec<MessageRecord> {
        let n = self.records.len().min(max);
        self.records.drain(..n).collect()
    }
}

/// Per-process message logger. One instance is shared across all
/// stations; records carry `station_id` for disambiguation.
pub struct MessageLogger {
    buffer: Mutex<RingBuffer>,
    broadcast: broadcast::Sender<MessageRecord>,
    stats: Mutex<MessageStats>,
    sink: Option<Arc<dyn MessageSink>>,
}

impl MessageLogger {
    pub fn new(sink: Option<Arc<dyn MessageSink>>) -> Self {
        let (broadcast, _) = broadcast::channel(DEFAULT_RING_CAPACITY);
        Self {
            buffer: Mutex::new(RingBuffer::new(DEFAULT_RING_CAPACITY)),
            broadcast,
            stats: Mutex::new(MessageStats::default()),
            sink,
        }
    }

    /// Record a single message: updates stats, enqueues it for the next
    /// flush, and fans it out to any live subscribers immediately.
    pub async fn record(&self, record: MessageRecord) {
        {
            let mut stats = self.stats.lock().await;
            stats.record(record.direction, record.message_type);
        }
        let _ = self.broadcast.send(record.clone());
        self.buffer.lock().await.push(record);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MessageRecord> {
        self.broadcast.subscribe()
    }

    pub async fn stats(&self) -> MessageStats {
        *self.stats.lock().await
    }

    async fn flush_once(&self) {
        let Some(sink) = &self.sink else { return };
        let batch = self.buffer.lock().await.drain_batch(DEFAULT_FLUSH_BATCH);
        if batch.is_empty() {
            return;
        }
        let n = batch.len();
        sink.store_batch(batch).await;
        debug!(count = n, "flushed message log batch");
    }

    /// Run the periodic flush loop until `shutdown` fires.
    pub async fn run_flush_loop(self: Arc<Self>, shutdown: ShutdownSignal) {
        let mut ticker = interval(Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_once().await;
                }
                _ = shutdown.notified().wait() => {
                    self.flush_once().await;
                    warn!("message logger flush loop stopped");
                    break;
                }
            }
        }
    }
}

/// Convenience constructors mirroring the two call sites the runtime needs.
pub fn new_outbound_record(
    station_id: &str,
    unique_id: &str,
    action: Option<String>,
    message_type: MessageType,
    raw: &str,
) -> MessageRecord {
    MessageRecord::new(
        station_id,
        Direction::Outbound,
        message_type,
        unique_id,
        action,
        raw,
    )
}

pub fn new_inbound_record(
    station_id: &str,
    unique_id: &str,
    action: Option<String>,
    message_type: MessageType,
    raw: &str,
) -> MessageRecord {
    MessageRecord::new(
        station_id,
        Direction::Inbound,
        message_type,
        unique_id,
        action,
        raw,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_updates_stats_and_broadcasts() {
        let logger = MessageLogger::new(None);
        let mut sub = logger.subscribe();
        logger
            .record(new_outbound_record(
                "CP001",
                "id1",
                Some("Heartbeat".into()),
                MessageType::Call,
                "[2,\"id1\",\"Heartbeat\",{}]",
            ))
            .await;
        let stats = logger.stats().await;
        assert_eq!(stats.calls_sent, 1);
        let received = sub.recv().await.unwrap();
        assert_eq!(received.unique_id, "id1");
    }

    #[tokio::test]
    async fn ring_buffer_evicts_oldest_past_capacity() {
        let mut ring = RingBuffer::new(2);
        ring.push(new_outbound_record("CP001", "a", None, MessageType::Call, "a"));
        ring.push(new_outbound_record("CP001", "b", None, MessageType::Call, "b"));
        ring.push(new_outbound_record("CP001", "c", None, MessageType::Call, "c"));
        let drained = ring.drain_batch(10);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].unique_id, "b");
    }
}
