use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::producer::{FutureProducer, Producer};
use rdkafka::util::Timeout;
use tracing::{debug, info};

use kew_core::broker::{BrokerAdmin, TopicSpec};
use kew_core::errors::BrokerError;

use crate::settings::KafkaSettings;

pub struct KafkaAdmin {
    inner: AdminClient<DefaultClientContext>,
    /// Metadata queries go through the shared producer's client.
    metadata_client: FutureProducer,
}

impl KafkaAdmin {
    pub fn create(
        settings: &KafkaSettings,
        metadata_client: FutureProducer,
    ) -> Result<Self, BrokerError> {
        let inner: AdminClient<DefaultClientContext> = settings
            .client_config()
            .create()
            .map_err(|e| BrokerError::Admin(e.to_string()))?;
        Ok(Self {
            inner,
            metadata_client,
        })
    }
}

#[async_trait]
impl BrokerAdmin for KafkaAdmin {
    async fn create_topics(
        &self,
        specs: &[TopicSpec],
        timeout: Duration,
    ) -> Result<(), BrokerError> {
        let topics: Vec<NewTopic<'_>> = specs
            .iter()
            .map(|topic| {
                NewTopic::new(
                    &topic.name,
                    topic.partitions,
                    TopicReplication::Fixed(topic.replication),
                )
            })
            .collect();
        let options = AdminOptions::new().operation_timeout(Some(Timeout::After(timeout)));

        let results = self
            .inner
            .create_topics(topics.iter(), &options)
            .await
            .map_err(|e| BrokerError::Admin(e.to_string()))?;

        for result in results {
            match result {
                Ok(name) => info!("🧱 Created topic {name}"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!("🧱 Topic {name} already exists")
                }
                Err((name, code)) => {
                    return Err(BrokerError::Admin(format!(
                        "creating topic {name} failed: {code}"
                    )));
                }
            }
        }
        Ok(())
    }

    async fn topic_exists(&self, topic: &str, timeout: Duration) -> Result<bool, BrokerError> {
        let client = self.metadata_client.clone();
        let topic = topic.to_string();
        let metadata = tokio::task::spawn_blocking(move || {
            client.client().fetch_metadata(Some(&topic), timeout)
        })
        .await
        .map_err(|e| BrokerError::Admin(format!("metadata task failed: {e}")))?
        .map_err(|e| BrokerError::Admin(e.to_string()))?;

        Ok(metadata
            .topics()
            .iter()
            .any(|t| t.error().is_none() && !t.partitions().is_empty()))
    }
}
