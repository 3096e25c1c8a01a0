use std::time::Duration;

use async_trait::async_trait;
use rdkafka::TopicPartitionList;
use rdkafka::consumer::{
    BaseConsumer, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::message::{Headers, Message};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use kew_core::broker::{BrokerConsumer, ConsumedRecord, ConsumerEvent, TopicPartition};
use kew_core::errors::BrokerError;
use kew_core::headers::HeaderMap;

use crate::settings::KafkaSettings;

/// Forwards rebalance callbacks into a channel so the poll loop (and the
/// exclusive-node election) see assignments as ordinary consumer events.
pub struct RebalanceContext {
    events: mpsc::UnboundedSender<ConsumerEvent>,
}

impl rdkafka::client::ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(list) => {
                let partitions = to_partitions(list);
                debug!("🧩 Partitions assigned: {partitions:?}");
                let _ = self.events.send(ConsumerEvent::Assigned(partitions));
            }
            Rebalance::Revoke(list) => {
                let partitions = to_partitions(list);
                debug!("🧩 Partitions revoked: {partitions:?}");
                let _ = self.events.send(ConsumerEvent::Revoked(partitions));
            }
            Rebalance::Error(e) => warn!("❌ Rebalance error: {e}"),
        }
    }
}

fn to_partitions(list: &TopicPartitionList) -> Vec<TopicPartition> {
    list.elements()
        .iter()
        .map(|element| TopicPartition {
            topic: element.topic().to_string(),
            partition: element.partition(),
        })
        .collect()
}

pub struct KafkaConsumer {
    inner: StreamConsumer<RebalanceContext>,
    events: Mutex<mpsc::UnboundedReceiver<ConsumerEvent>>,
}

impl KafkaConsumer {
    pub fn create(settings: &KafkaSettings, group_id: &str) -> Result<Self, BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner: StreamConsumer<RebalanceContext> = settings
            .consumer_config(group_id)
            .create_with_context(RebalanceContext { events: tx })
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        Ok(Self {
            inner,
            events: Mutex::new(rx),
        })
    }

    /// The currently assigned partitions of one topic.
    fn assignment_for(&self, topic: &str) -> Result<TopicPartitionList, BrokerError> {
        let assignment = self
            .inner
            .assignment()
            .map_err(|e| BrokerError::Consume(e.to_string()))?;
        let mut list = TopicPartitionList::new();
        for element in assignment.elements() {
            if element.topic() == topic {
                list.add_partition(element.topic(), element.partition());
            }
        }
        Ok(list)
    }
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.inner
            .subscribe(&topics)
            .map_err(|e| BrokerError::Consume(e.to_string()))
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<ConsumerEvent>, BrokerError> {
        // Rebalance callbacks take priority over buffered records.
        if let Ok(event) = self.events.lock().await.try_recv() {
            return Ok(Some(event));
        }

        match tokio::time::timeout(timeout, self.inner.recv()).await {
            Ok(Ok(message)) => {
                let mut headers = HeaderMap::new();
                if let Some(wire_headers) = message.headers() {
                    for header in wire_headers.iter() {
                        if let Some(value) = header.value {
                            headers.insert(header.key, value.to_vec());
                        }
                    }
                }
                Ok(Some(ConsumerEvent::Record(ConsumedRecord {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                    key: message.key().map(<[u8]>::to_vec),
                    payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                    headers,
                })))
            }
            Ok(Err(e)) => Err(BrokerError::Consume(e.to_string())),
            Err(_elapsed) => {
                // A rebalance may have fired while we waited.
                if let Ok(event) = self.events.lock().await.try_recv() {
                    return Ok(Some(event));
                }
                Ok(None)
            }
        }
    }

    fn pause_topic(&self, topic: &str) -> Result<(), BrokerError> {
        let list = self.assignment_for(topic)?;
        self.inner
            .pause(&list)
            .map_err(|e| BrokerError::Consume(e.to_string()))
    }

    fn resume_topic(&self, topic: &str) -> Result<(), BrokerError> {
        let list = self.assignment_for(topic)?;
        self.inner
            .resume(&list)
            .map_err(|e| BrokerError::Consume(e.to_string()))
    }

    fn store_offset(&self, topic: &str, partition: i32, offset: i64) -> Result<(), BrokerError> {
        // `offset` is the resume point (processed offset + 1), stored as-is
        // and committed by the background auto-committer.
        self.inner
            .store_offset(topic, partition, offset)
            .map_err(|e| BrokerError::Consume(e.to_string()))
    }

    fn close(&self) {
        self.inner.unsubscribe();
        debug!("🏁 Kafka consumer unsubscribed");
    }
}
