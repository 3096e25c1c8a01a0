//! # kew-core
//!
//! Binds a transactional host store to a Kafka cluster through two
//! reliability patterns and a middleware pipeline:
//!
//! - **Transactional outbox**: outbound messages are staged as rows in the
//!   same transaction as the business data that caused them, then drained
//!   to the broker by a background poll engine (optionally gated by
//!   cluster-wide leader election).
//! - **Deduplicating inbox**: consumed messages are fingerprinted and
//!   recorded in the same transaction as the handler's work, so a
//!   redelivered message never produces a second business effect.
//! - **Middleware chains**: both directions run ordered stage chains with
//!   user-registered stages interleaved at a fixed insertion point.
//!
//! The crate is broker-agnostic: everything talks to the [`broker`] traits,
//! implemented by `kew-kafka` for rdkafka and by [`memory`] for tests.

pub mod broker;
pub mod client;
pub mod config;
pub mod coordination;
pub mod envelope;
pub mod errors;
pub mod headers;
pub mod inbox;
pub mod memory;
pub mod message;
pub mod middleware;
pub mod outbox;
pub mod scope;
pub mod serializer;
pub mod store;
pub mod trace;

mod breaker;
mod channel;
mod consume;
mod produce;
mod registry;

pub use broker::{
    Broker, BrokerAdmin, BrokerConsumer, BrokerProducer, ConsumedRecord, ConsumerEvent,
    Delivery, DeliveryHandle, DeliverySlot, OutgoingRecord, TopicPartition, TopicSpec,
};
pub use client::{KewClient, KewClientBuilder};
pub use config::{
    BreakerConfig, CoordinationMode, ExclusiveNodeSettings, ForgetStrategy, FullMode,
    OutboxSettings, OutboxStrategy, TypeConfigBuilder,
};
pub use coordination::{Coordination, ExclusiveNode, OutboxQuery, SingleNode};
pub use envelope::{Envelope, PipelinePhase};
pub use errors::{BrokerError, KewError, StoreError};
pub use headers::{
    HeaderMap, RUNTIME_TYPE_HEADER, TRACEPARENT_HEADER, TRACESTATE_HEADER, TYPE_HEADER,
};
pub use message::{Handler, Message};
pub use middleware::{Middleware, Next, Pipeline};
pub use scope::Scope;
pub use serializer::{JsonSerializer, MessageSerializer};
pub use store::{InboxInsert, InboxRow, OutboxRow, Store, StoreSession};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBroker, MemoryStore};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tokio::sync::Semaphore;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct OrderCreated {
        order_id: u64,
        customer: String,
    }

    impl Message for OrderCreated {
        const TYPE_ID: &'static str = "order-created";
    }

    fn order(order_id: u64, customer: &str) -> OrderCreated {
        OrderCreated {
            order_id,
            customer: customer.to_string(),
        }
    }

    struct TestHandler {
        attempts: Arc<AtomicUsize>,
        handled: Arc<AtomicUsize>,
        gate: Option<Arc<Semaphore>>,
        fail: Arc<AtomicBool>,
    }

    impl TestHandler {
        fn new() -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>, Arc<AtomicBool>) {
            let attempts = Arc::new(AtomicUsize::new(0));
            let handled = Arc::new(AtomicUsize::new(0));
            let fail = Arc::new(AtomicBool::new(false));
            (
                Self {
                    attempts: attempts.clone(),
                    handled: handled.clone(),
                    gate: None,
                    fail: fail.clone(),
                },
                attempts,
                handled,
                fail,
            )
        }

        fn gated(mut self, gate: Arc<Semaphore>) -> Self {
            self.gate = Some(gate);
            self
        }
    }

    #[async_trait]
    impl Handler<OrderCreated> for TestHandler {
        async fn handle(&self, _scope: Arc<Scope>, _message: OrderCreated) -> Result<(), KewError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(KewError::Handler("induced handler failure".to_string()));
            }
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn wait_for(what: &str, timeout: Duration, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + timeout;
        while !condition() {
            if Instant::now() >= deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn seed_record(broker: &MemoryBroker, topic: &str, message: &OrderCreated) {
        let mut headers = HeaderMap::new();
        headers.insert(TYPE_HEADER, OrderCreated::TYPE_ID.as_bytes().to_vec());
        let payload = serde_json::to_vec(message).unwrap();
        let handle = broker
            .producer()
            .send(OutgoingRecord {
                topic: topic.to_string(),
                key: Some(message.order_id.to_string()),
                payload,
                headers,
            })
            .await
            .unwrap();
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn outbox_happy_path_drains_to_the_broker() {
        let store = MemoryStore::new();
        let broker = MemoryBroker::new();
        let client = KewClient::builder(Arc::new(store.clone()), broker.clone())
            .outbox_polling_interval(Duration::from_millis(100))
            .message::<OrderCreated>(|t| {
                t.topic("orders").producer(|p| {
                    p.key(|m| m.order_id.to_string())
                        .outbox(OutboxStrategy::BackgroundOnly)
                })
            })
            .build()
            .unwrap();

        let scope = client.scope();
        scope.publish(order(42, "A")).unwrap();
        scope.save_changes().await.unwrap();

        let rows = store.outbox_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].topic, "orders");
        assert_eq!(rows[0].aggregate_key.as_deref(), Some("42"));
        assert_eq!(rows[0].compile_type, "order-created");
        assert!(!rows[0].is_success);
        assert!(client.outbox_engine().is_started());

        wait_for("the outbox row to drain", Duration::from_secs(2), || {
            store.outbox_rows()[0].is_success
        })
        .await;

        let records = broker.records("orders");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key.as_deref(), Some("42"));
        let row = &store.outbox_rows()[0];
        assert!(row.processed_at.is_some());
        assert_eq!(row.retries, 0);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn outbox_retries_transient_broker_errors() {
        let store = MemoryStore::new();
        let broker = MemoryBroker::new();
        broker.fail_next_deliveries("orders", 2);

        let client = KewClient::builder(Arc::new(store.clone()), broker.clone())
            .outbox_polling_interval(Duration::from_millis(50))
            .message::<OrderCreated>(|t| {
                t.topic("orders").producer(|p| {
                    p.key(|m| m.order_id.to_string())
                        .outbox(OutboxStrategy::BackgroundOnly)
                })
            })
            .build()
            .unwrap();

        let scope = client.scope();
        scope.publish(order(1, "A")).unwrap();
        scope.save_changes().await.unwrap();

        wait_for("the first failed attempt", Duration::from_secs(2), || {
            store.outbox_rows()[0].retries >= 1
        })
        .await;
        assert!(!store.outbox_rows()[0].is_success);

        wait_for("the delivery to succeed", Duration::from_secs(2), || {
            store.outbox_rows()[0].is_success
        })
        .await;

        let row = &store.outbox_rows()[0];
        assert_eq!(row.retries, 2);
        assert_eq!(broker.records("orders").len(), 1);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn outbox_rows_drain_in_sequence_order() {
        let store = MemoryStore::new();
        let broker = MemoryBroker::new();
        let client = KewClient::builder(Arc::new(store.clone()), broker.clone())
            .outbox_polling_interval(Duration::from_millis(50))
            .message::<OrderCreated>(|t| {
                t.topic("orders").producer(|p| {
                    p.key(|m| m.order_id.to_string())
                        .outbox(OutboxStrategy::BackgroundOnly)
                })
            })
            .build()
            .unwrap();

        let scope = client.scope();
        for order_id in 1..=3 {
            scope.publish(order(order_id, "A")).unwrap();
        }
        scope.save_changes().await.unwrap();

        wait_for("all rows to drain", Duration::from_secs(2), || {
            store.outbox_rows().iter().all(|row| row.is_success)
        })
        .await;

        let keys: Vec<Option<String>> = broker
            .records("orders")
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(
            keys,
            vec![
                Some("1".to_string()),
                Some("2".to_string()),
                Some("3".to_string())
            ]
        );

        client.shutdown().await;
    }

    #[tokio::test]
    async fn immediate_with_fallback_marks_the_row_after_commit() {
        let store = MemoryStore::new();
        let broker = MemoryBroker::new();
        let client = KewClient::builder(Arc::new(store.clone()), broker.clone())
            .message::<OrderCreated>(|t| {
                t.topic("orders").producer(|p| {
                    p.key(|m| m.order_id.to_string())
                        .outbox(OutboxStrategy::ImmediateWithFallback)
                })
            })
            .build()
            .unwrap();

        let scope = client.scope();
        scope.publish(order(9, "B")).unwrap();
        scope.save_changes().await.unwrap();

        // The produce happened on the save path, not through the engine.
        assert_eq!(broker.records("orders").len(), 1);
        let rows = store.outbox_rows();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_success);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn direct_produce_without_outbox_surfaces_after_commit() {
        let store = MemoryStore::new();
        let broker = MemoryBroker::new();
        let client = KewClient::builder(Arc::new(store.clone()), broker.clone())
            .message::<OrderCreated>(|t| {
                t.topic("orders")
                    .producer(|p| p.key(|m| m.order_id.to_string()))
            })
            .build()
            .unwrap();

        let scope = client.scope();
        scope.publish(order(5, "C")).unwrap();
        scope.save_changes().await.unwrap();

        assert_eq!(broker.records("orders").len(), 1);
        assert!(store.outbox_rows().is_empty());

        client.shutdown().await;
    }

    #[tokio::test]
    async fn detached_save_rejects_non_fire_forget_types() {
        let store = MemoryStore::new();
        let broker = MemoryBroker::new();
        let client = KewClient::builder(Arc::new(store.clone()), broker.clone())
            .message::<OrderCreated>(|t| {
                t.topic("orders").producer(|p| {
                    p.key(|m| m.order_id.to_string())
                        .outbox(OutboxStrategy::BackgroundOnly)
                })
            })
            .build()
            .unwrap();

        let scope = client.scope();
        scope.publish(order(1, "A")).unwrap();
        let err = scope.save_changes_detached().await.unwrap_err();
        assert!(matches!(err, KewError::Config(_)));
        // Nothing was committed.
        assert!(store.outbox_rows().is_empty());

        client.shutdown().await;
    }

    #[tokio::test]
    async fn inbox_dedup_short_circuits_the_second_delivery() {
        let store = MemoryStore::new();
        let broker = MemoryBroker::new();

        let message = order(7, "A");
        seed_record(&broker, "orders", &message).await;
        seed_record(&broker, "orders", &message).await;

        let (handler, _attempts, handled, _fail) = TestHandler::new();
        let client = KewClient::builder(Arc::new(store.clone()), broker.clone())
            .message::<OrderCreated>(|t| {
                t.topic("orders").consumer(|c| {
                    c.handler(handler)
                        .inbox(|m| m.order_id, Some(Duration::from_secs(3600)))
                })
            })
            .build()
            .unwrap();
        client.start().await.unwrap();

        wait_for("both offsets to be stored", Duration::from_secs(2), || {
            broker.stored_offsets("kew", "orders").len() == 2
        })
        .await;

        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert_eq!(broker.stored_offsets("kew", "orders"), vec![1, 2]);

        let inbox = store.inbox_rows();
        assert_eq!(inbox.len(), 1);
        let expected = inbox::fingerprint(&serde_json::json!(7)).unwrap();
        assert_eq!(inbox[0].fingerprint, expected);
        assert!(inbox[0].expired_at.is_some());

        client.shutdown().await;
    }

    #[tokio::test]
    async fn backpressure_pauses_and_resumes_around_the_watermarks() {
        let store = MemoryStore::new();
        let broker = MemoryBroker::new();

        for order_id in 1..=9 {
            seed_record(&broker, "orders", &order(order_id, "A")).await;
        }

        let gate = Arc::new(Semaphore::new(0));
        let (handler, _attempts, handled, _fail) = TestHandler::new();
        let handler = handler.gated(gate.clone());
        let client = KewClient::builder(Arc::new(store.clone()), broker.clone())
            .message::<OrderCreated>(|t| {
                t.topic("orders").consumer(|c| {
                    c.handler(handler)
                        .max_buffered_messages(10)
                        .watermarks(0.8, 0.5)
                })
            })
            .build()
            .unwrap();
        client.start().await.unwrap();

        // One record sits in the handler, eight fill the channel to the
        // high watermark.
        wait_for("the consumer to pause", Duration::from_secs(2), || {
            broker.is_topic_paused("orders")
        })
        .await;

        // One drained record is not enough to reach the low watermark.
        gate.add_permits(1);
        wait_for("first record to drain", Duration::from_secs(2), || {
            handled.load(Ordering::SeqCst) == 1
        })
        .await;
        assert!(broker.is_topic_paused("orders"));

        // Draining down to the low watermark resumes the consumer.
        gate.add_permits(2);
        wait_for("the consumer to resume", Duration::from_secs(2), || {
            !broker.is_topic_paused("orders")
        })
        .await;

        gate.add_permits(20);
        wait_for("everything to drain", Duration::from_secs(2), || {
            handled.load(Ordering::SeqCst) == 9
        })
        .await;

        client.shutdown().await;
    }

    #[tokio::test]
    async fn circuit_breaker_pauses_and_recovers() {
        let store = MemoryStore::new();
        let broker = MemoryBroker::new();

        for order_id in 1..=3 {
            seed_record(&broker, "orders", &order(order_id, "A")).await;
        }

        let (handler, attempts, handled, fail) = TestHandler::new();
        fail.store(true, Ordering::SeqCst);
        let client = KewClient::builder(Arc::new(store.clone()), broker.clone())
            .message::<OrderCreated>(|t| {
                t.topic("orders").consumer(|c| {
                    c.handler(handler).circuit_breaker(BreakerConfig {
                        trip_threshold: 3,
                        window_size: 5,
                        active_threshold: 1,
                        reset_interval: Duration::from_millis(200),
                    })
                })
            })
            .build()
            .unwrap();
        client.start().await.unwrap();

        wait_for("three failures", Duration::from_secs(2), || {
            attempts.load(Ordering::SeqCst) == 3
        })
        .await;
        wait_for("the breaker to pause the type", Duration::from_secs(2), || {
            broker.is_topic_paused("orders")
        })
        .await;

        fail.store(false, Ordering::SeqCst);
        seed_record(&broker, "orders", &order(4, "A")).await;

        // After the reset interval the breaker half-opens, the probe
        // succeeds, and consumption is fully resumed.
        wait_for("the probe to succeed", Duration::from_secs(2), || {
            handled.load(Ordering::SeqCst) == 1
        })
        .await;
        wait_for("the consumer to resume", Duration::from_secs(2), || {
            !broker.is_topic_paused("orders")
        })
        .await;

        client.shutdown().await;
    }

    #[tokio::test]
    async fn header_filters_compare_case_insensitively() {
        let store = MemoryStore::new();
        let broker = MemoryBroker::new();

        struct RegionStamp(&'static str);

        #[async_trait]
        impl Middleware<OrderCreated> for RegionStamp {
            async fn handle(
                &self,
                envelope: &mut Envelope<OrderCreated>,
                next: Next<'_, OrderCreated>,
            ) -> Result<(), KewError> {
                envelope.headers.insert("region", self.0.as_bytes().to_vec());
                next.run(envelope).await
            }
        }

        // Records are seeded with explicit region headers.
        let mut matching = HeaderMap::new();
        matching.insert(TYPE_HEADER, OrderCreated::TYPE_ID.as_bytes().to_vec());
        matching.insert("region", b"emea".to_vec());
        let mut other = matching.clone();
        other.insert("region", b"apac".to_vec());
        for (order_id, headers) in [(1u64, matching), (2u64, other)] {
            let message = order(order_id, "A");
            let handle = broker
                .producer()
                .send(OutgoingRecord {
                    topic: "orders".to_string(),
                    key: None,
                    payload: serde_json::to_vec(&message).unwrap(),
                    headers,
                })
                .await
                .unwrap();
            handle.wait().await.unwrap();
        }

        let (handler, _attempts, handled, _fail) = TestHandler::new();
        let client = KewClient::builder(Arc::new(store.clone()), broker.clone())
            .message::<OrderCreated>(|t| {
                t.topic("orders")
                    .consumer(|c| c.handler(handler).header_filter("region", "EMEA"))
            })
            .build()
            .unwrap();
        client.start().await.unwrap();

        wait_for("both offsets to be stored", Duration::from_secs(2), || {
            broker.stored_offsets("kew", "orders").len() == 2
        })
        .await;
        assert_eq!(handled.load(Ordering::SeqCst), 1);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn exclusive_node_fails_over_to_the_survivor() {
        let store = MemoryStore::new();
        let broker = MemoryBroker::new();

        let exclusive = ExclusiveNodeSettings {
            heartbeat_interval: Duration::from_millis(50),
            session_timeout: Duration::from_millis(500),
            ..ExclusiveNodeSettings::default()
        };
        let build = |group: &str| {
            KewClient::builder(Arc::new(store.clone()), broker.clone())
                .group_id(group)
                .outbox_polling_interval(Duration::from_millis(50))
                .coordination(CoordinationMode::ExclusiveNode(exclusive.clone()))
                .message::<OrderCreated>(|t| {
                    t.topic("orders").producer(|p| {
                        p.key(|m| m.order_id.to_string())
                            .outbox(OutboxStrategy::BackgroundOnly)
                    })
                })
                .build()
                .unwrap()
        };
        let node_a = build("node-a");
        let node_b = build("node-b");
        node_a.start().await.unwrap();
        node_b.start().await.unwrap();
        node_a.outbox_engine().clone().ensure_started();
        node_b.outbox_engine().clone().ensure_started();

        wait_for("exactly one leader", Duration::from_secs(2), || {
            let leaders = [node_a.is_leader(), node_b.is_leader()]
                .iter()
                .filter(|l| **l == Some(true))
                .count();
            leaders == 1
        })
        .await;

        let (leader, survivor) = if node_a.is_leader() == Some(true) {
            (node_a.clone(), node_b.clone())
        } else {
            (node_b.clone(), node_a.clone())
        };

        leader.shutdown().await;

        wait_for("the survivor to take over", Duration::from_secs(5), || {
            survivor.is_leader() == Some(true)
        })
        .await;

        // Only the new leader's engine may drain the shared outbox.
        let scope = survivor.scope();
        scope.publish(order(11, "A")).unwrap();
        scope.save_changes().await.unwrap();

        wait_for("the survivor to drain the row", Duration::from_secs(5), || {
            store.outbox_rows().iter().all(|row| row.is_success)
        })
        .await;
        assert_eq!(broker.records("orders").len(), 1);

        survivor.shutdown().await;
    }
}
