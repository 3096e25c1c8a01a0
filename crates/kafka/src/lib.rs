//! # kew-kafka
//!
//! The rdkafka binding for the `kew-core` broker abstraction. One
//! [`KafkaBroker`] per process: it owns the singleton `FutureProducer` and
//! the admin client, and creates rebalance-aware stream consumers on
//! demand (the shared consumer, per-exclusive-type consumers, and the
//! exclusive-node election consumer).

pub mod admin;
pub mod consumer;
pub mod producer;
pub mod settings;

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use rdkafka::producer::FutureProducer;
use tracing::info;

use kew_core::broker::{Broker, BrokerAdmin, BrokerConsumer, BrokerProducer};
use kew_core::errors::BrokerError;

use crate::admin::KafkaAdmin;
use crate::consumer::KafkaConsumer;
use crate::producer::KafkaProducer;
use crate::settings::KafkaSettings;

pub struct KafkaBroker {
    settings: KafkaSettings,
    producer: Arc<KafkaProducer>,
    admin: Arc<KafkaAdmin>,
}

impl KafkaBroker {
    /// Connect to the cluster described by the settings.
    pub fn connect(settings: KafkaSettings) -> anyhow::Result<Arc<Self>> {
        info!(
            "🔧 Connecting to Kafka at {}",
            settings.bootstrap_servers
        );
        let future_producer: FutureProducer = settings
            .producer_config()
            .create()
            .context("failed to create the Kafka producer")?;
        let admin = KafkaAdmin::create(&settings, future_producer.clone())
            .context("failed to create the Kafka admin client")?;

        Ok(Arc::new(Self {
            producer: Arc::new(KafkaProducer::new(future_producer)),
            admin: Arc::new(admin),
            settings,
        }))
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    fn producer(&self) -> Arc<dyn BrokerProducer> {
        self.producer.clone()
    }

    async fn consumer(&self, group_id: &str) -> Result<Arc<dyn BrokerConsumer>, BrokerError> {
        let consumer = KafkaConsumer::create(&self.settings, group_id)?;
        Ok(Arc::new(consumer))
    }

    fn admin(&self) -> Arc<dyn BrokerAdmin> {
        self.admin.clone()
    }
}
