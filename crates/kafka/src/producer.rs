use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tracing::debug;

use kew_core::broker::{BrokerProducer, Delivery, DeliveryHandle, OutgoingRecord};
use kew_core::errors::BrokerError;

/// The process-singleton producer. All typed pipelines and the outbox
/// poll engine route through this one instance so per-partition ordering
/// holds.
pub struct KafkaProducer {
    inner: FutureProducer,
}

impl KafkaProducer {
    pub fn new(inner: FutureProducer) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl BrokerProducer for KafkaProducer {
    async fn send(&self, record: OutgoingRecord) -> Result<DeliveryHandle, BrokerError> {
        let mut headers = OwnedHeaders::new_with_capacity(record.headers.len());
        for (key, value) in record.headers.iter() {
            headers = headers.insert(Header {
                key,
                value: Some(value),
            });
        }

        let mut future_record: FutureRecord<'_, String, Vec<u8>> = FutureRecord::to(&record.topic)
            .payload(&record.payload)
            .headers(headers);
        if let Some(key) = &record.key {
            future_record = future_record.key(key);
        }

        match self.inner.send_result(future_record) {
            Ok(delivery_future) => {
                let (slot, handle) = DeliveryHandle::channel();
                tokio::spawn(async move {
                    let report = match delivery_future.await {
                        Ok(Ok((partition, offset))) => Ok(Delivery {
                            partition,
                            offset,
                            timestamp: Some(Utc::now()),
                        }),
                        Ok(Err((e, _message))) => Err(BrokerError::Delivery(e.to_string())),
                        Err(_cancelled) => Err(BrokerError::Delivery(
                            "delivery future was cancelled".to_string(),
                        )),
                    };
                    slot.resolve(report);
                });
                Ok(handle)
            }
            Err((e, _record)) => Err(BrokerError::Transport(e.to_string())),
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        debug!("🔄 Flushing Kafka producer");
        let producer = self.inner.clone();
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| BrokerError::Transport(format!("flush task failed: {e}")))?
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }
}
