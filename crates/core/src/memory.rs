//! In-memory store and broker.
//!
//! Functional doubles for the host store and the Kafka client: the store
//! keeps outbox/inbox tables behind a mutex with real transactional
//! staging, the broker keeps per-topic logs with delivery reports,
//! pause/resume bookkeeping, offset storage, and single-partition group
//! assignment. Used by this crate's tests and available to applications
//! that want to test their handlers without a cluster.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::broker::{
    Broker, BrokerAdmin, BrokerConsumer, BrokerProducer, ConsumedRecord, ConsumerEvent,
    Delivery, DeliveryHandle, OutgoingRecord, TopicPartition, TopicSpec,
};
use crate::errors::BrokerError;
use crate::headers::HeaderMap;
use crate::store::{InboxInsert, InboxRow, OutboxRow, Store, StoreError, StoreSession};

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryStoreState {
    outbox: Vec<OutboxRow>,
    inbox: Vec<InboxRow>,
    next_sequence: i64,
}

/// Shared in-memory store; clones see the same tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryStoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outbox_rows(&self) -> Vec<OutboxRow> {
        self.state.lock().outbox.clone()
    }

    pub fn inbox_rows(&self) -> Vec<InboxRow> {
        self.state.lock().inbox.clone()
    }

    /// Application-side cleanup of expired inbox rows.
    pub fn purge_expired_inbox(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.lock();
        let before = state.inbox.len();
        state
            .inbox
            .retain(|row| row.expired_at.is_none_or(|expired| expired >= now));
        before - state.inbox.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        Ok(Box::new(MemorySession {
            state: self.state.clone(),
            staged_outbox: Vec::new(),
            staged_inbox: Vec::new(),
            staged_updates: Vec::new(),
        }))
    }
}

struct MemorySession {
    state: Arc<Mutex<MemoryStoreState>>,
    staged_outbox: Vec<OutboxRow>,
    staged_inbox: Vec<InboxRow>,
    staged_updates: Vec<OutboxRow>,
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn next_outbox_sequence(&mut self) -> Result<i64, StoreError> {
        let mut state = self.state.lock();
        state.next_sequence += 1;
        Ok(state.next_sequence)
    }

    fn stage_outbox(&mut self, row: OutboxRow) {
        self.staged_outbox.push(row);
    }

    async fn insert_inbox(&mut self, row: InboxRow) -> Result<InboxInsert, StoreError> {
        let committed = self
            .state
            .lock()
            .inbox
            .iter()
            .any(|existing| existing.fingerprint == row.fingerprint);
        let staged = self
            .staged_inbox
            .iter()
            .any(|existing| existing.fingerprint == row.fingerprint);
        if committed || staged {
            return Ok(InboxInsert::Duplicate);
        }
        self.staged_inbox.push(row);
        Ok(InboxInsert::Inserted)
    }

    async fn pending_outbox(&mut self, limit: usize) -> Result<Vec<OutboxRow>, StoreError> {
        Ok(self
            .state
            .lock()
            .outbox
            .iter()
            .filter(|row| !row.is_success)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_outbox(&mut self, rows: &[OutboxRow]) -> Result<(), StoreError> {
        self.staged_updates.extend_from_slice(rows);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        for row in &self.staged_inbox {
            if state
                .inbox
                .iter()
                .any(|existing| existing.fingerprint == row.fingerprint)
            {
                return Err(StoreError::Transaction(format!(
                    "inbox fingerprint {:#x} violates the unique index",
                    row.fingerprint
                )));
            }
        }
        state.inbox.extend(self.staged_inbox);
        state.outbox.extend(self.staged_outbox);
        state
            .outbox
            .sort_by_key(|row| row.sequence_number);
        for update in self.staged_updates {
            if let Some(existing) = state.outbox.iter_mut().find(|row| row.id == update.id) {
                *existing = update;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// A record as kept in a topic log.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: HeaderMap,
}

#[derive(Default)]
struct TopicState {
    records: Vec<StoredRecord>,
}

struct ConsumerState {
    group: String,
    subscriptions: Vec<String>,
    positions: HashMap<String, usize>,
    paused: HashSet<String>,
    events: VecDeque<ConsumerEvent>,
    closed: bool,
}

#[derive(Default)]
struct MemoryBrokerState {
    topics: HashMap<String, TopicState>,
    /// Remaining scripted delivery failures per topic.
    fail_plans: HashMap<String, u32>,
    consumers: HashMap<u64, ConsumerState>,
    /// (group, topic) → consumer currently holding the partition.
    assignments: HashMap<(String, String), u64>,
    stored_offsets: HashMap<(String, String, i32), Vec<i64>>,
    next_consumer_id: u64,
}

/// Single-node in-memory broker with per-topic logs.
pub struct MemoryBroker {
    state: Arc<Mutex<MemoryBrokerState>>,
    producer: Arc<MemoryProducer>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        let state = Arc::new(Mutex::new(MemoryBrokerState::default()));
        Arc::new(Self {
            producer: Arc::new(MemoryProducer {
                state: state.clone(),
            }),
            state,
        })
    }

    /// Make the next `count` deliveries to `topic` fail with a transient
    /// error reported through the delivery handle.
    pub fn fail_next_deliveries(&self, topic: &str, count: u32) {
        self.state
            .lock()
            .fail_plans
            .insert(topic.to_string(), count);
    }

    pub fn records(&self, topic: &str) -> Vec<StoredRecord> {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(|t| t.records.clone())
            .unwrap_or_default()
    }

    pub fn topic_exists(&self, topic: &str) -> bool {
        self.state.lock().topics.contains_key(topic)
    }

    /// Offsets stored for a group/topic, in store order.
    pub fn stored_offsets(&self, group: &str, topic: &str) -> Vec<i64> {
        self.state
            .lock()
            .stored_offsets
            .get(&(group.to_string(), topic.to_string(), 0))
            .cloned()
            .unwrap_or_default()
    }

    /// Whether any live consumer currently has the topic paused.
    pub fn is_topic_paused(&self, topic: &str) -> bool {
        self.state
            .lock()
            .consumers
            .values()
            .any(|c| !c.closed && c.paused.contains(topic))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn producer(&self) -> Arc<dyn BrokerProducer> {
        self.producer.clone()
    }

    async fn consumer(&self, group_id: &str) -> Result<Arc<dyn BrokerConsumer>, BrokerError> {
        let mut state = self.state.lock();
        state.next_consumer_id += 1;
        let id = state.next_consumer_id;
        state.consumers.insert(
            id,
            ConsumerState {
                group: group_id.to_string(),
                subscriptions: Vec::new(),
                positions: HashMap::new(),
                paused: HashSet::new(),
                events: VecDeque::new(),
                closed: false,
            },
        );
        Ok(Arc::new(MemoryConsumer {
            id,
            state: self.state.clone(),
        }))
    }

    fn admin(&self) -> Arc<dyn BrokerAdmin> {
        Arc::new(MemoryAdmin {
            state: self.state.clone(),
        })
    }
}

pub struct MemoryProducer {
    state: Arc<Mutex<MemoryBrokerState>>,
}

#[async_trait]
impl BrokerProducer for MemoryProducer {
    async fn send(&self, record: OutgoingRecord) -> Result<DeliveryHandle, BrokerError> {
        let (slot, handle) = DeliveryHandle::channel();
        let mut state = self.state.lock();

        if let Some(remaining) = state.fail_plans.get_mut(&record.topic) {
            if *remaining > 0 {
                *remaining -= 1;
                slot.resolve(Err(BrokerError::Delivery(
                    "scripted transient delivery failure".to_string(),
                )));
                return Ok(handle);
            }
        }

        let topic = state.topics.entry(record.topic.clone()).or_default();
        let offset = topic.records.len() as i64;
        topic.records.push(StoredRecord {
            offset,
            key: record.key,
            payload: record.payload,
            headers: record.headers,
        });
        slot.resolve(Ok(Delivery {
            partition: 0,
            offset,
            timestamp: Some(Utc::now()),
        }));
        Ok(handle)
    }

    async fn flush(&self, _timeout: std::time::Duration) -> Result<(), BrokerError> {
        Ok(())
    }
}

pub struct MemoryConsumer {
    id: u64,
    state: Arc<Mutex<MemoryBrokerState>>,
}

impl MemoryConsumer {
    fn try_next(&self) -> Option<ConsumerEvent> {
        let mut state = self.state.lock();
        let consumer = state.consumers.get_mut(&self.id)?;
        if consumer.closed {
            return None;
        }
        if let Some(event) = consumer.events.pop_front() {
            return Some(event);
        }

        let group = consumer.group.clone();
        let candidates: Vec<String> = consumer
            .subscriptions
            .iter()
            .filter(|t| !consumer.paused.contains(*t))
            .cloned()
            .collect();
        for topic in candidates {
            let holder = state
                .assignments
                .get(&(group.clone(), topic.clone()))
                .copied();
            if holder != Some(self.id) {
                continue;
            }
            let position = *state
                .consumers
                .get(&self.id)
                .and_then(|c| c.positions.get(&topic))
                .unwrap_or(&0);
            let Some(record) = state
                .topics
                .get(&topic)
                .and_then(|t| t.records.get(position))
                .cloned()
            else {
                continue;
            };
            if let Some(consumer) = state.consumers.get_mut(&self.id) {
                consumer.positions.insert(topic.clone(), position + 1);
            }
            return Some(ConsumerEvent::Record(ConsumedRecord {
                topic,
                partition: 0,
                offset: record.offset,
                key: record.key.map(String::into_bytes),
                payload: record.payload,
                headers: record.headers,
            }));
        }
        None
    }
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        let Some(consumer) = state.consumers.get_mut(&self.id) else {
            return Err(BrokerError::Consume("consumer is gone".to_string()));
        };
        let group = consumer.group.clone();
        consumer.subscriptions = topics.to_vec();

        for topic in topics {
            state.topics.entry(topic.clone()).or_default();
            let start = state
                .stored_offsets
                .get(&(group.clone(), topic.clone(), 0))
                .and_then(|offsets| offsets.last())
                .map(|last| *last as usize)
                .unwrap_or(0);
            if let Some(consumer) = state.consumers.get_mut(&self.id) {
                consumer.positions.insert(topic.clone(), start);
            }

            // The single partition goes to the first live subscriber.
            let key = (group.clone(), topic.clone());
            if !state.assignments.contains_key(&key) {
                state.assignments.insert(key, self.id);
                if let Some(consumer) = state.consumers.get_mut(&self.id) {
                    consumer
                        .events
                        .push_back(ConsumerEvent::Assigned(vec![TopicPartition {
                            topic: topic.clone(),
                            partition: 0,
                        }]));
                }
            }
        }
        Ok(())
    }

    async fn poll(
        &self,
        timeout: std::time::Duration,
    ) -> Result<Option<ConsumerEvent>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.try_next() {
                return Ok(Some(event));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    fn pause_topic(&self, topic: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if let Some(consumer) = state.consumers.get_mut(&self.id) {
            consumer.paused.insert(topic.to_string());
        }
        Ok(())
    }

    fn resume_topic(&self, topic: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if let Some(consumer) = state.consumers.get_mut(&self.id) {
            consumer.paused.remove(topic);
        }
        Ok(())
    }

    fn store_offset(&self, topic: &str, partition: i32, offset: i64) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        let Some(consumer) = state.consumers.get(&self.id) else {
            return Err(BrokerError::Consume("consumer is gone".to_string()));
        };
        let key = (consumer.group.clone(), topic.to_string(), partition);
        state.stored_offsets.entry(key).or_default().push(offset);
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock();
        let Some(consumer) = state.consumers.get_mut(&self.id) else {
            return;
        };
        consumer.closed = true;
        let group = consumer.group.clone();

        // Hand every partition this consumer held to another live
        // subscriber in the same group, mirroring a group rebalance.
        let held: Vec<String> = state
            .assignments
            .iter()
            .filter(|((g, _), holder)| *g == group && **holder == self.id)
            .map(|((_, topic), _)| topic.clone())
            .collect();
        for topic in held {
            state.assignments.remove(&(group.clone(), topic.clone()));
            if let Some(consumer) = state.consumers.get_mut(&self.id) {
                consumer
                    .events
                    .push_back(ConsumerEvent::Revoked(vec![TopicPartition {
                        topic: topic.clone(),
                        partition: 0,
                    }]));
            }
            let successor = state
                .consumers
                .iter()
                .filter(|(id, c)| {
                    **id != self.id && !c.closed && c.group == group
                        && c.subscriptions.contains(&topic)
                })
                .map(|(id, _)| *id)
                .min();
            if let Some(successor) = successor {
                state
                    .assignments
                    .insert((group.clone(), topic.clone()), successor);
                if let Some(consumer) = state.consumers.get_mut(&successor) {
                    consumer
                        .events
                        .push_back(ConsumerEvent::Assigned(vec![TopicPartition {
                            topic: topic.clone(),
                            partition: 0,
                        }]));
                }
            }
        }
    }
}

pub struct MemoryAdmin {
    state: Arc<Mutex<MemoryBrokerState>>,
}

#[async_trait]
impl BrokerAdmin for MemoryAdmin {
    async fn create_topics(
        &self,
        specs: &[TopicSpec],
        _timeout: std::time::Duration,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        for topic in specs {
            state.topics.entry(topic.name.clone()).or_default();
        }
        Ok(())
    }

    async fn topic_exists(
        &self,
        topic: &str,
        _timeout: std::time::Duration,
    ) -> Result<bool, BrokerError> {
        Ok(self.state.lock().topics.contains_key(topic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn outbox_row(sequence: i64) -> OutboxRow {
        OutboxRow {
            sequence_number: sequence,
            id: Uuid::new_v4(),
            compile_type: "order-created".to_string(),
            runtime_type: None,
            topic: "orders".to_string(),
            aggregate_key: Some("42".to_string()),
            headers: Vec::new(),
            payload: vec![1, 2, 3],
            enqueued_at: Utc::now(),
            processed_at: None,
            retries: 0,
            is_success: false,
        }
    }

    #[tokio::test]
    async fn staged_rows_commit_atomically() {
        let store = MemoryStore::new();
        let mut session = store.begin().await.unwrap();
        let sequence = session.next_outbox_sequence().await.unwrap();
        session.stage_outbox(outbox_row(sequence));
        assert!(store.outbox_rows().is_empty());

        session.commit().await.unwrap();
        assert_eq!(store.outbox_rows().len(), 1);
    }

    #[tokio::test]
    async fn dropped_sessions_roll_back() {
        let store = MemoryStore::new();
        let mut session = store.begin().await.unwrap();
        let sequence = session.next_outbox_sequence().await.unwrap();
        session.stage_outbox(outbox_row(sequence));
        drop(session);
        assert!(store.outbox_rows().is_empty());
    }

    #[tokio::test]
    async fn duplicate_inbox_fingerprints_are_detected() {
        let store = MemoryStore::new();
        let row = InboxRow {
            id: Uuid::new_v4(),
            fingerprint: 7,
            received_at: Utc::now(),
            expired_at: None,
        };
        let mut session = store.begin().await.unwrap();
        assert_eq!(
            session.insert_inbox(row.clone()).await.unwrap(),
            InboxInsert::Inserted
        );
        session.commit().await.unwrap();

        let mut session = store.begin().await.unwrap();
        let again = InboxRow {
            id: Uuid::new_v4(),
            ..row
        };
        assert_eq!(
            session.insert_inbox(again).await.unwrap(),
            InboxInsert::Duplicate
        );
    }

    #[tokio::test]
    async fn scripted_failures_resolve_through_the_delivery_handle() {
        let broker = MemoryBroker::new();
        broker.fail_next_deliveries("orders", 1);
        let producer = broker.producer();

        let record = OutgoingRecord {
            topic: "orders".to_string(),
            key: None,
            payload: vec![1],
            headers: HeaderMap::new(),
        };
        let handle = producer.send(record.clone()).await.unwrap();
        assert!(handle.wait().await.is_err());
        assert!(broker.records("orders").is_empty());

        let handle = producer.send(record).await.unwrap();
        let delivery = handle.wait().await.unwrap();
        assert_eq!(delivery.offset, 0);
        assert_eq!(broker.records("orders").len(), 1);
    }

    #[tokio::test]
    async fn closing_the_assignment_holder_reassigns_the_partition() {
        let broker = MemoryBroker::new();
        let first = broker.consumer("leaders").await.unwrap();
        let second = broker.consumer("leaders").await.unwrap();
        let topic = vec!["__election".to_string()];
        first.subscribe(&topic).unwrap();
        second.subscribe(&topic).unwrap();

        let event = first
            .poll(std::time::Duration::from_millis(10))
            .await
            .unwrap();
        assert!(matches!(event, Some(ConsumerEvent::Assigned(_))));

        first.close();
        let event = second
            .poll(std::time::Duration::from_millis(10))
            .await
            .unwrap();
        assert!(matches!(event, Some(ConsumerEvent::Assigned(_))));
    }
}
