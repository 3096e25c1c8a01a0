//! Per-message-type and engine-wide configuration.
//!
//! Everything here is assembled through builders and frozen before the
//! client starts; invalid combinations are rejected at build time with
//! [`KewError::Config`] so a misconfigured process never comes up.

use std::sync::Arc;
use std::time::Duration;

use crate::errors::KewError;
use crate::message::{Handler, Message};
use crate::middleware::Middleware;
use crate::serializer::{JsonSerializer, MessageSerializer};

/// How produced messages of a type reach the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStrategy {
    /// Stage the row and let the poll engine drain it later.
    BackgroundOnly,
    /// Stage the row, produce right after commit, and fall back to the
    /// poll engine when the produce fails.
    ImmediateWithFallback,
}

/// At-most-once strategies for types without an outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForgetStrategy {
    /// Await the produce up to the timeout; swallow any error.
    AwaitForget(Duration),
    /// Launch the produce and return immediately.
    FireForget,
}

/// What the per-type channel does when full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullMode {
    Wait,
    DropOldest,
    DropNewest,
}

pub type KeyFn<M> = Arc<dyn Fn(&M) -> String + Send + Sync>;
pub type HeaderFn<M> = Arc<dyn Fn(&M) -> String + Send + Sync>;
pub type FingerprintFn<M> =
    Arc<dyn Fn(&M) -> Result<serde_json::Value, serde_json::Error> + Send + Sync>;

/// Partitioning key extraction for one message type.
#[derive(Clone)]
pub enum KeyAccessor<M> {
    /// Messages of this type carry no key.
    None,
    Keyed(KeyFn<M>),
}

impl<M> KeyAccessor<M> {
    pub(crate) fn extract(&self, message: &M) -> Option<String> {
        match self {
            KeyAccessor::None => None,
            KeyAccessor::Keyed(f) => Some(f(message)),
        }
    }
}

/// Circuit breaker tuning for one consumer type.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Failures within the window that open the breaker.
    pub trip_threshold: usize,
    /// Size of the outcome ring.
    pub window_size: usize,
    /// Half-open successes required to close again.
    pub active_threshold: usize,
    /// Time spent open before probing.
    pub reset_interval: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            trip_threshold: 5,
            window_size: 10,
            active_threshold: 1,
            reset_interval: Duration::from_secs(30),
        }
    }
}

impl BreakerConfig {
    fn validate(&self, type_id: &str) -> Result<(), KewError> {
        if self.trip_threshold == 0 || self.trip_threshold > self.window_size {
            return Err(KewError::Config(format!(
                "{type_id}: circuit breaker requires 1 <= trip_threshold <= window_size"
            )));
        }
        if self.active_threshold == 0 {
            return Err(KewError::Config(format!(
                "{type_id}: circuit breaker active_threshold must be >= 1"
            )));
        }
        if self.reset_interval.is_zero() {
            return Err(KewError::Config(format!(
                "{type_id}: circuit breaker reset_interval must be > 0"
            )));
        }
        Ok(())
    }
}

/// Outbox poll engine tuning.
#[derive(Debug, Clone, Copy)]
pub struct OutboxSettings {
    pub polling_interval: Duration,
    pub max_rows_per_tick: usize,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(1),
            max_rows_per_tick: 100,
        }
    }
}

impl OutboxSettings {
    pub(crate) fn validate(&self) -> Result<(), KewError> {
        if self.polling_interval.is_zero() {
            return Err(KewError::Config(
                "outbox polling_interval must be > 0".to_string(),
            ));
        }
        if self.max_rows_per_tick == 0 {
            return Err(KewError::Config(
                "outbox max_rows_per_tick must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Exclusive-node election settings.
#[derive(Debug, Clone)]
pub struct ExclusiveNodeSettings {
    /// Coordination topic; created with exactly one partition.
    pub topic: String,
    pub group_id: String,
    pub heartbeat_interval: Duration,
    pub session_timeout: Duration,
}

impl Default for ExclusiveNodeSettings {
    fn default() -> Self {
        Self {
            topic: "__k_outbox_exclusive".to_string(),
            group_id: "k-outbox-exclusive".to_string(),
            heartbeat_interval: Duration::from_secs(3),
            session_timeout: Duration::from_secs(30),
        }
    }
}

impl ExclusiveNodeSettings {
    pub(crate) fn validate(&self) -> Result<(), KewError> {
        if self.heartbeat_interval >= self.session_timeout {
            return Err(KewError::Config(
                "exclusive-node heartbeat_interval must be shorter than session_timeout"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Which nodes drain the outbox.
#[derive(Debug, Clone)]
pub enum CoordinationMode {
    /// Every node drains; for single-instance deployments.
    SingleNode,
    /// Only the elected leader drains.
    ExclusiveNode(ExclusiveNodeSettings),
}

/// Inbox deduplication settings for one consumer type.
#[derive(Clone)]
pub struct InboxConfig<M> {
    pub(crate) fingerprint: FingerprintFn<M>,
    pub(crate) retention: Option<Duration>,
}

/// Frozen producer half of a type registration.
pub struct ProducerTypeConfig<M: Message> {
    pub(crate) key: KeyAccessor<M>,
    pub(crate) headers: Vec<(String, HeaderFn<M>)>,
    pub(crate) outbox: Option<OutboxStrategy>,
    pub(crate) forget: Option<ForgetStrategy>,
    pub(crate) middleware: Vec<Arc<dyn Middleware<M>>>,
}

/// Frozen consumer half of a type registration.
pub struct ConsumerTypeConfig<M: Message> {
    pub(crate) handler: Arc<dyn Handler<M>>,
    pub(crate) exclusive_connection: bool,
    pub(crate) capacity: usize,
    pub(crate) full_mode: FullMode,
    pub(crate) high_ratio: f64,
    pub(crate) low_ratio: f64,
    pub(crate) inbox: Option<InboxConfig<M>>,
    pub(crate) header_filters: Vec<(String, String)>,
    pub(crate) breaker: BreakerConfig,
    pub(crate) middleware: Vec<Arc<dyn Middleware<M>>>,
}

/// One complete, validated type registration.
pub struct TypeConfig<M: Message> {
    pub(crate) topic: String,
    pub(crate) serializer: Arc<dyn MessageSerializer<M>>,
    pub(crate) producer: Option<ProducerTypeConfig<M>>,
    pub(crate) consumer: Option<ConsumerTypeConfig<M>>,
}

impl<M: Message> std::fmt::Debug for TypeConfig<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeConfig")
            .field("topic", &self.topic)
            .field("producer", &self.producer.is_some())
            .field("consumer", &self.consumer.is_some())
            .finish()
    }
}

/// Builder for one message type registration.
pub struct TypeConfigBuilder<M: Message> {
    topic: Option<String>,
    serializer: Arc<dyn MessageSerializer<M>>,
    producer: Option<ProducerTypeBuilder<M>>,
    consumer: Option<ConsumerTypeBuilder<M>>,
}

impl<M: Message> Default for TypeConfigBuilder<M> {
    fn default() -> Self {
        Self {
            topic: None,
            serializer: Arc::new(JsonSerializer),
            producer: None,
            consumer: None,
        }
    }
}

impl<M: Message> TypeConfigBuilder<M> {
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Swap the JSON codec for another one.
    pub fn serializer(mut self, serializer: Arc<dyn MessageSerializer<M>>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn producer(
        mut self,
        configure: impl FnOnce(ProducerTypeBuilder<M>) -> ProducerTypeBuilder<M>,
    ) -> Self {
        self.producer = Some(configure(
            self.producer.take().unwrap_or_default(),
        ));
        self
    }

    pub fn consumer(
        mut self,
        configure: impl FnOnce(ConsumerTypeBuilder<M>) -> ConsumerTypeBuilder<M>,
    ) -> Self {
        self.consumer = Some(configure(
            self.consumer.take().unwrap_or_default(),
        ));
        self
    }

    pub(crate) fn build(self) -> Result<TypeConfig<M>, KewError> {
        let type_id = M::TYPE_ID;
        let topic = self
            .topic
            .ok_or_else(|| KewError::Config(format!("{type_id}: topic is required")))?;

        let producer = self.producer.map(|p| p.build(type_id)).transpose()?;
        let consumer = self.consumer.map(|c| c.build(type_id)).transpose()?;

        if producer.is_none() && consumer.is_none() {
            return Err(KewError::Config(format!(
                "{type_id}: registration needs a producer half, a consumer half, or both"
            )));
        }

        Ok(TypeConfig {
            topic,
            serializer: self.serializer,
            producer,
            consumer,
        })
    }
}

pub struct ProducerTypeBuilder<M: Message> {
    key: Option<KeyAccessor<M>>,
    headers: Vec<(String, HeaderFn<M>)>,
    outbox: Option<OutboxStrategy>,
    forget: Option<ForgetStrategy>,
    middleware: Vec<Arc<dyn Middleware<M>>>,
}

impl<M: Message> Default for ProducerTypeBuilder<M> {
    fn default() -> Self {
        Self {
            key: None,
            headers: Vec::new(),
            outbox: None,
            forget: None,
            middleware: Vec::new(),
        }
    }
}

impl<M: Message> ProducerTypeBuilder<M> {
    /// Extract the partitioning key from each message.
    pub fn key(mut self, accessor: impl Fn(&M) -> String + Send + Sync + 'static) -> Self {
        self.key = Some(KeyAccessor::Keyed(Arc::new(accessor)));
        self
    }

    /// Messages of this type carry no partitioning key.
    pub fn no_key(mut self) -> Self {
        self.key = Some(KeyAccessor::None);
        self
    }

    /// Add a header evaluated on every produce. Keep accessors cheap.
    pub fn header(
        mut self,
        name: impl Into<String>,
        accessor: impl Fn(&M) -> String + Send + Sync + 'static,
    ) -> Self {
        self.headers.push((name.into(), Arc::new(accessor)));
        self
    }

    pub fn outbox(mut self, strategy: OutboxStrategy) -> Self {
        self.outbox = Some(strategy);
        self
    }

    pub fn forget(mut self, strategy: ForgetStrategy) -> Self {
        self.forget = Some(strategy);
        self
    }

    pub fn middleware(mut self, stage: Arc<dyn Middleware<M>>) -> Self {
        self.middleware.push(stage);
        self
    }

    fn build(self, type_id: &str) -> Result<ProducerTypeConfig<M>, KewError> {
        let key = self.key.ok_or_else(|| {
            KewError::Config(format!(
                "{type_id}: key accessor not configured; call key() or no_key()"
            ))
        })?;
        if self.outbox.is_some() && self.forget.is_some() {
            return Err(KewError::Config(format!(
                "{type_id}: outbox and forget strategies are mutually exclusive"
            )));
        }
        reject_duplicate_stages(type_id, "producer", &self.middleware)?;
        Ok(ProducerTypeConfig {
            key,
            headers: self.headers,
            outbox: self.outbox,
            forget: self.forget,
            middleware: self.middleware,
        })
    }
}

pub struct ConsumerTypeBuilder<M: Message> {
    handler: Option<Arc<dyn Handler<M>>>,
    exclusive_connection: bool,
    capacity: usize,
    full_mode: FullMode,
    high_ratio: f64,
    low_ratio: f64,
    inbox: Option<InboxConfig<M>>,
    header_filters: Vec<(String, String)>,
    breaker: BreakerConfig,
    middleware: Vec<Arc<dyn Middleware<M>>>,
}

impl<M: Message> Default for ConsumerTypeBuilder<M> {
    fn default() -> Self {
        Self {
            handler: None,
            exclusive_connection: false,
            capacity: 10_000,
            full_mode: FullMode::Wait,
            high_ratio: 0.8,
            low_ratio: 0.5,
            inbox: None,
            header_filters: Vec::new(),
            breaker: BreakerConfig::default(),
            middleware: Vec::new(),
        }
    }
}

impl<M: Message> ConsumerTypeBuilder<M> {
    pub fn handler(mut self, handler: impl Handler<M> + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Give this type its own broker connection instead of the shared one.
    pub fn exclusive_connection(mut self) -> Self {
        self.exclusive_connection = true;
        self
    }

    pub fn max_buffered_messages(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn full_mode(mut self, mode: FullMode) -> Self {
        self.full_mode = mode;
        self
    }

    /// Pause/resume fill ratios; requires `0 < low < high <= 1`.
    pub fn watermarks(mut self, high_ratio: f64, low_ratio: f64) -> Self {
        self.high_ratio = high_ratio;
        self.low_ratio = low_ratio;
        self
    }

    /// Deduplicate by a projection of the message's business keys.
    pub fn inbox<V: serde::Serialize>(
        mut self,
        fingerprint: impl Fn(&M) -> V + Send + Sync + 'static,
        retention: Option<Duration>,
    ) -> Self {
        self.inbox = Some(InboxConfig {
            fingerprint: Arc::new(move |m| serde_json::to_value(fingerprint(m))),
            retention,
        });
        self
    }

    /// Only handle records whose header matches (ASCII-case-insensitive
    /// value compare). All filters must pass.
    pub fn header_filter(
        mut self,
        name: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        self.header_filters.push((name.into(), expected.into()));
        self
    }

    pub fn circuit_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn middleware(mut self, stage: Arc<dyn Middleware<M>>) -> Self {
        self.middleware.push(stage);
        self
    }

    fn build(self, type_id: &str) -> Result<ConsumerTypeConfig<M>, KewError> {
        let handler = self.handler.ok_or_else(|| {
            KewError::Config(format!("{type_id}: consumer registration needs a handler"))
        })?;
        if self.capacity == 0 {
            return Err(KewError::Config(format!(
                "{type_id}: max_buffered_messages must be > 0"
            )));
        }
        if !(self.low_ratio > 0.0 && self.low_ratio < self.high_ratio && self.high_ratio <= 1.0)
        {
            return Err(KewError::Config(format!(
                "{type_id}: watermarks require 0 < low_ratio < high_ratio <= 1"
            )));
        }
        if let Some(inbox) = &self.inbox {
            if let Some(retention) = inbox.retention {
                if chrono::Duration::from_std(retention).is_err() {
                    return Err(KewError::Config(format!(
                        "{type_id}: inbox retention window is out of range"
                    )));
                }
            }
        }
        self.breaker.validate(type_id)?;
        reject_duplicate_stages(type_id, "consumer", &self.middleware)?;
        Ok(ConsumerTypeConfig {
            handler,
            exclusive_connection: self.exclusive_connection,
            capacity: self.capacity,
            full_mode: self.full_mode,
            high_ratio: self.high_ratio,
            low_ratio: self.low_ratio,
            inbox: self.inbox,
            header_filters: self.header_filters,
            breaker: self.breaker,
            middleware: self.middleware,
        })
    }
}

fn reject_duplicate_stages<M: Message>(
    type_id: &str,
    chain: &str,
    stages: &[Arc<dyn Middleware<M>>],
) -> Result<(), KewError> {
    for (i, stage) in stages.iter().enumerate() {
        if stages[..i].iter().any(|other| other.id() == stage.id()) {
            return Err(KewError::Config(format!(
                "{type_id}: middleware '{}' registered twice on the {chain} chain",
                stage.id()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::middleware::Next;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct OrderCreated {
        order_id: u64,
    }

    impl Message for OrderCreated {
        const TYPE_ID: &'static str = "order-created";
    }

    async fn noop_handler(
        _scope: Arc<crate::scope::Scope>,
        _message: OrderCreated,
    ) -> Result<(), KewError> {
        Ok(())
    }

    fn base() -> TypeConfigBuilder<OrderCreated> {
        TypeConfigBuilder::default().topic("orders")
    }

    #[test]
    fn missing_topic_is_rejected() {
        let err = TypeConfigBuilder::<OrderCreated>::default()
            .producer(|p| p.no_key())
            .build()
            .unwrap_err();
        assert!(matches!(err, KewError::Config(_)));
    }

    #[test]
    fn missing_key_accessor_is_rejected() {
        let err = base()
            .producer(|p| p.outbox(OutboxStrategy::BackgroundOnly))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("key accessor"));
    }

    #[test]
    fn outbox_and_forget_together_are_rejected() {
        let err = base()
            .producer(|p| {
                p.no_key()
                    .outbox(OutboxStrategy::BackgroundOnly)
                    .forget(ForgetStrategy::FireForget)
            })
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn invalid_watermarks_are_rejected() {
        let err = base()
            .consumer(|c| c.handler(noop_handler).watermarks(0.5, 0.8))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("low_ratio < high_ratio"));
    }

    #[test]
    fn breaker_trip_above_window_is_rejected() {
        let err = base()
            .consumer(|c| {
                c.handler(noop_handler).circuit_breaker(BreakerConfig {
                    trip_threshold: 11,
                    window_size: 10,
                    ..BreakerConfig::default()
                })
            })
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("trip_threshold"));
    }

    #[test]
    fn heartbeat_not_below_session_timeout_is_rejected() {
        let settings = ExclusiveNodeSettings {
            heartbeat_interval: Duration::from_secs(30),
            session_timeout: Duration::from_secs(30),
            ..ExclusiveNodeSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    struct Audit;

    #[async_trait]
    impl Middleware<OrderCreated> for Audit {
        async fn handle(
            &self,
            envelope: &mut Envelope<OrderCreated>,
            next: Next<'_, OrderCreated>,
        ) -> Result<(), KewError> {
            next.run(envelope).await
        }
    }

    #[test]
    fn duplicate_middleware_identity_is_rejected() {
        let err = base()
            .producer(|p| {
                p.no_key()
                    .middleware(Arc::new(Audit))
                    .middleware(Arc::new(Audit))
            })
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("registered twice"));
    }

    #[test]
    fn defaults_match_documented_values() {
        let breaker = BreakerConfig::default();
        assert_eq!(breaker.trip_threshold, 5);
        assert_eq!(breaker.window_size, 10);
        assert_eq!(breaker.active_threshold, 1);
        assert_eq!(breaker.reset_interval, Duration::from_secs(30));

        let outbox = OutboxSettings::default();
        assert_eq!(outbox.polling_interval, Duration::from_secs(1));
        assert_eq!(outbox.max_rows_per_tick, 100);

        let exclusive = ExclusiveNodeSettings::default();
        assert_eq!(exclusive.topic, "__k_outbox_exclusive");
        assert_eq!(exclusive.group_id, "k-outbox-exclusive");
    }
}
