//! Broker abstraction.
//!
//! The core never links a Kafka client; a [`Broker`] hands out the process
//! singleton producer, fresh consumers, and an admin surface. The `rdkafka`
//! binding lives in the `kew-kafka` crate; the in-memory double used by
//! tests lives in [`crate::memory`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::errors::BrokerError;
use crate::headers::HeaderMap;

/// A record handed to the producer.
#[derive(Debug, Clone)]
pub struct OutgoingRecord {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: HeaderMap,
}

/// Delivery report for one produced record.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Resolves once the broker acknowledges (or rejects) a produced record.
#[derive(Debug)]
pub struct DeliveryHandle {
    rx: oneshot::Receiver<Result<Delivery, BrokerError>>,
}

/// Producer-side end of a [`DeliveryHandle`].
#[derive(Debug)]
pub struct DeliverySlot {
    tx: oneshot::Sender<Result<Delivery, BrokerError>>,
}

impl DeliveryHandle {
    pub fn channel() -> (DeliverySlot, DeliveryHandle) {
        let (tx, rx) = oneshot::channel();
        (DeliverySlot { tx }, DeliveryHandle { rx })
    }

    /// Await the delivery report.
    pub async fn wait(self) -> Result<Delivery, BrokerError> {
        self.rx
            .await
            .map_err(|_| BrokerError::Delivery("delivery report was dropped".to_string()))?
    }
}

impl DeliverySlot {
    pub fn resolve(self, report: Result<Delivery, BrokerError>) {
        // The other side may have given up waiting; that is fine.
        let _ = self.tx.send(report);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

/// A record received from the broker.
#[derive(Debug, Clone)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub headers: HeaderMap,
}

/// What a poll can yield besides nothing.
#[derive(Debug)]
pub enum ConsumerEvent {
    Record(ConsumedRecord),
    /// Group coordinator gave this member the listed partitions.
    Assigned(Vec<TopicPartition>),
    /// Group coordinator took the listed partitions away.
    Revoked(Vec<TopicPartition>),
}

/// Non-blocking producer with per-record delivery reports.
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    /// Enqueue a record. The returned handle resolves with the delivery
    /// report once the broker acknowledges or rejects it.
    async fn send(&self, record: OutgoingRecord) -> Result<DeliveryHandle, BrokerError>;

    /// Push all in-flight records to the broker.
    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError>;

    /// Poll for the next event, waiting up to `timeout`.
    async fn poll(&self, timeout: Duration) -> Result<Option<ConsumerEvent>, BrokerError>;

    /// Stop fetching from every assigned partition of `topic`.
    fn pause_topic(&self, topic: &str) -> Result<(), BrokerError>;

    /// Resume fetching from every assigned partition of `topic`.
    fn resume_topic(&self, topic: &str) -> Result<(), BrokerError>;

    /// Record the offset to resume from after a restart. Callers pass the
    /// processed record's offset + 1.
    fn store_offset(&self, topic: &str, partition: i32, offset: i64) -> Result<(), BrokerError>;

    fn close(&self);
}

/// Spec for one topic to create.
#[derive(Debug, Clone)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication: i32,
}

#[async_trait]
pub trait BrokerAdmin: Send + Sync {
    /// Create topics, treating already-existing topics as success.
    async fn create_topics(&self, specs: &[TopicSpec], timeout: Duration)
    -> Result<(), BrokerError>;

    async fn topic_exists(&self, topic: &str, timeout: Duration) -> Result<bool, BrokerError>;
}

/// Entry point a binding implements.
///
/// The producer is a process singleton constructed lazily on first use;
/// creating producers per message exhausts broker connections and breaks
/// per-partition ordering. Consumers are created per subscription need
/// (one shared, plus one per exclusive-connection type, plus one per
/// coordination election).
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    fn producer(&self) -> Arc<dyn BrokerProducer>;

    async fn consumer(&self, group_id: &str) -> Result<Arc<dyn BrokerConsumer>, BrokerError>;

    fn admin(&self) -> Arc<dyn BrokerAdmin>;
}
