//! Cluster coordination for the outbox poll engine.
//!
//! A strategy scopes each tick's fetch: the single-node strategy leaves it
//! untouched, the exclusive-node strategy empties it unless this node
//! currently holds the leadership lease. Leadership is decided by the
//! Kafka group protocol over a one-partition coordination topic: whoever
//! the coordinator hands the partition to is the leader, and a missed
//! session timeout moves it automatically.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Broker, OutgoingRecord, TopicSpec};
use crate::config::ExclusiveNodeSettings;
use crate::errors::KewError;
use crate::headers::HeaderMap;

/// The fetch plan for one outbox tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxQuery {
    limit: usize,
}

impl OutboxQuery {
    pub fn fetch(limit: usize) -> Self {
        Self { limit }
    }

    /// A query that reads nothing; the store is never touched.
    pub fn empty() -> Self {
        Self { limit: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.limit == 0
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

pub trait Coordination: Send + Sync {
    fn scope(&self, query: OutboxQuery) -> OutboxQuery;
}

/// Every node drains. For single-instance deployments.
pub struct SingleNode;

impl Coordination for SingleNode {
    fn scope(&self, query: OutboxQuery) -> OutboxQuery {
        query
    }
}

/// Only the elected leader drains.
pub struct ExclusiveNode {
    settings: ExclusiveNodeSettings,
    is_leader: AtomicBool,
}

impl ExclusiveNode {
    pub fn new(settings: ExclusiveNodeSettings) -> Result<Arc<Self>, KewError> {
        settings.validate()?;
        Ok(Arc::new(Self {
            settings,
            is_leader: AtomicBool::new(false),
        }))
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    /// Join the election and track leadership until cancelled.
    pub(crate) async fn run(
        self: Arc<Self>,
        broker: Arc<dyn Broker>,
        cancel: CancellationToken,
    ) -> Result<(), KewError> {
        let topic = self.settings.topic.clone();
        broker
            .admin()
            .create_topics(
                &[TopicSpec {
                    name: topic.clone(),
                    partitions: 1,
                    replication: 1,
                }],
                Duration::from_secs(10),
            )
            .await?;

        let consumer = broker.consumer(&self.settings.group_id).await?;
        consumer.subscribe(std::slice::from_ref(&topic))?;
        info!(
            "🗳️ Joined exclusive-node election on {topic} (group {})",
            self.settings.group_id
        );

        let heartbeat = {
            let producer = broker.producer();
            let topic = topic.clone();
            let interval = self.settings.heartbeat_interval;
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            let record = OutgoingRecord {
                                topic: topic.clone(),
                                key: None,
                                payload: b"hb".to_vec(),
                                headers: HeaderMap::new(),
                            };
                            match producer.send(record).await {
                                Ok(handle) => {
                                    if let Err(e) = handle.wait().await {
                                        debug!("💓 Coordination heartbeat not delivered: {e}");
                                    }
                                }
                                Err(e) => debug!("💓 Coordination heartbeat failed: {e}"),
                            }
                        }
                    }
                }
            })
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = consumer.poll(Duration::from_millis(500)) => match event {
                    Ok(Some(crate::broker::ConsumerEvent::Assigned(partitions))) => {
                        if partitions.iter().any(|p| p.topic == topic) {
                            if !self.is_leader.swap(true, Ordering::AcqRel) {
                                info!("👑 Elected outbox leader on {topic}");
                            }
                        }
                    }
                    Ok(Some(crate::broker::ConsumerEvent::Revoked(partitions))) => {
                        if partitions.iter().any(|p| p.topic == topic)
                            && self.is_leader.swap(false, Ordering::AcqRel)
                        {
                            info!("🪂 Outbox leadership revoked on {topic}");
                        }
                    }
                    // Heartbeat records carry no information.
                    Ok(Some(crate::broker::ConsumerEvent::Record(_))) | Ok(None) => {}
                    Err(e) => {
                        warn!("❌ Coordination poll failed: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }

        self.is_leader.store(false, Ordering::Release);
        consumer.close();
        heartbeat.abort();
        info!("🏁 Exclusive-node election loop ended");
        Ok(())
    }
}

impl Coordination for ExclusiveNode {
    fn scope(&self, query: OutboxQuery) -> OutboxQuery {
        if self.is_leader() {
            query
        } else {
            OutboxQuery::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_node_scopes_nothing_away() {
        let query = OutboxQuery::fetch(100);
        assert_eq!(SingleNode.scope(query), query);
    }

    #[test]
    fn exclusive_node_scopes_to_empty_until_elected() {
        let node = ExclusiveNode::new(ExclusiveNodeSettings::default()).unwrap();
        let query = OutboxQuery::fetch(100);

        assert!(node.scope(query).is_empty());

        node.is_leader.store(true, Ordering::Release);
        assert_eq!(node.scope(query), query);
    }

    #[test]
    fn invalid_heartbeat_settings_are_rejected() {
        let settings = ExclusiveNodeSettings {
            heartbeat_interval: Duration::from_secs(60),
            session_timeout: Duration::from_secs(30),
            ..ExclusiveNodeSettings::default()
        };
        assert!(ExclusiveNode::new(settings).is_err());
    }
}
