//! Startup-built type directory.
//!
//! Every registered message type gets one entry mapping its stable type id
//! to its typed pipelines, so outbox rows and wire records route back into
//! typed code without any per-message reflection.

use std::any::{Any, TypeId as RustTypeId};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::breaker::CircuitBreaker;
use crate::broker::{BrokerConsumer, DeliveryHandle};
use crate::channel::TypeChannel;
use crate::config::{ForgetStrategy, HeaderFn, KeyAccessor, OutboxStrategy};
use crate::consume::{FlowControl, WorkerDeps, worker_loop};
use crate::envelope::Envelope;
use crate::errors::KewError;
use crate::headers::HeaderMap;
use crate::message::Message;
use crate::middleware::Pipeline;
use crate::scope::{ScopeCommand, ScopeServices, TxSink};
use crate::store::OutboxRow;

/// Producer half of a type's runtime: accessors plus the composed chain.
pub(crate) struct ProducerRuntime<M: Message> {
    pub(crate) topic: String,
    pub(crate) key: KeyAccessor<M>,
    pub(crate) headers: Vec<(String, HeaderFn<M>)>,
    pub(crate) chain: Pipeline<M>,
    pub(crate) outbox: Option<OutboxStrategy>,
    pub(crate) forget: Option<ForgetStrategy>,
}

impl<M: Message> ProducerRuntime<M> {
    pub(crate) fn make_envelope(&self, message: M) -> Envelope<M> {
        let key = self.key.extract(&message);
        let header_values: Vec<(String, String)> = self
            .headers
            .iter()
            .map(|(name, accessor)| (name.clone(), accessor(&message)))
            .collect();

        let mut envelope = Envelope::for_publish(message);
        envelope.key = key;
        for (name, value) in header_values {
            envelope.headers.insert(name, value.into_bytes());
        }
        envelope
    }

    pub(crate) fn command(self: Arc<Self>, message: M) -> Box<dyn ScopeCommand> {
        Box::new(PublishCommand {
            runtime: self,
            message,
        })
    }
}

struct PublishCommand<M: Message> {
    runtime: Arc<ProducerRuntime<M>>,
    message: M,
}

#[async_trait]
impl<M: Message> ScopeCommand for PublishCommand<M> {
    async fn stage(self: Box<Self>, sink: &Arc<TxSink>) -> Result<(), KewError> {
        let PublishCommand { runtime, message } = *self;
        let mut envelope = runtime.make_envelope(message);
        envelope.attach_sink(sink.clone());
        runtime.chain.run(&mut envelope).await
    }

    fn is_fire_forget(&self) -> bool {
        self.runtime.outbox.is_none()
            && matches!(self.runtime.forget, Some(ForgetStrategy::FireForget))
    }
}

/// Consumer half of a type's runtime.
pub(crate) struct ConsumerRuntime<M: Message> {
    pub(crate) pipeline: Pipeline<M>,
    pub(crate) wiring: ConsumerWiring,
}

/// The untyped pieces the poll loop needs.
pub(crate) struct ConsumerWiring {
    pub(crate) channel: Arc<TypeChannel>,
    pub(crate) breaker: Arc<CircuitBreaker>,
    pub(crate) exclusive: bool,
}

/// What a worker task needs from the client at startup.
pub(crate) struct WorkerContext {
    pub(crate) services: Arc<ScopeServices>,
    pub(crate) consumer: Arc<dyn BrokerConsumer>,
    pub(crate) flow: Arc<FlowControl>,
    pub(crate) cancel: CancellationToken,
}

/// Type-erased directory entry.
#[async_trait]
pub(crate) trait TypeEntry: Send + Sync {
    fn type_id(&self) -> &'static str;

    fn topic(&self) -> &str;

    fn outbox_enabled(&self) -> bool;

    fn consumer_wiring(&self) -> Option<&ConsumerWiring>;

    /// Drive a persisted outbox row back through the typed producer chain,
    /// returning the broker delivery handle the dispatch stage stashed.
    async fn replay(&self, row: &OutboxRow) -> Result<Option<DeliveryHandle>, KewError>;

    fn spawn_worker(&self, ctx: WorkerContext) -> Option<JoinHandle<()>>;
}

pub(crate) struct Entry<M: Message> {
    pub(crate) topic: String,
    pub(crate) producer: Option<Arc<ProducerRuntime<M>>>,
    pub(crate) consumer: Option<ConsumerRuntime<M>>,
}

#[async_trait]
impl<M: Message> TypeEntry for Entry<M> {
    fn type_id(&self) -> &'static str {
        M::TYPE_ID
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn outbox_enabled(&self) -> bool {
        self.producer
            .as_ref()
            .is_some_and(|p| p.outbox.is_some())
    }

    fn consumer_wiring(&self) -> Option<&ConsumerWiring> {
        self.consumer.as_ref().map(|c| &c.wiring)
    }

    async fn replay(&self, row: &OutboxRow) -> Result<Option<DeliveryHandle>, KewError> {
        let runtime = self.producer.as_ref().ok_or_else(|| {
            KewError::Pipeline(format!(
                "outbox row routes to {} which has no producer half",
                M::TYPE_ID
            ))
        })?;
        let mut envelope = Envelope::<M>::for_replay(
            row.id,
            row.aggregate_key.clone(),
            HeaderMap::from_snapshot(&row.headers),
            row.payload.clone(),
        );
        runtime.chain.run(&mut envelope).await?;
        Ok(envelope.take_delivery())
    }

    fn spawn_worker(&self, ctx: WorkerContext) -> Option<JoinHandle<()>> {
        let consumer = self.consumer.as_ref()?;
        let deps = WorkerDeps {
            type_id: M::TYPE_ID,
            channel: consumer.wiring.channel.clone(),
            breaker: consumer.wiring.breaker.clone(),
            pipeline: consumer.pipeline.clone(),
            consumer: ctx.consumer,
            flow: ctx.flow,
            services: ctx.services,
            cancel: ctx.cancel,
        };
        Some(tokio::spawn(worker_loop(deps)))
    }
}

/// Immutable directory of every registered type.
pub(crate) struct TypeRegistry {
    pub(crate) by_type_id: HashMap<&'static str, Arc<dyn TypeEntry>>,
    pub(crate) by_rust: HashMap<RustTypeId, Box<dyn Any + Send + Sync>>,
    pub(crate) by_topic: HashMap<String, Vec<&'static str>>,
    pub(crate) has_outbox: bool,
}

impl TypeRegistry {
    pub(crate) fn entry(&self, type_id: &str) -> Option<Arc<dyn TypeEntry>> {
        self.by_type_id.get(type_id).cloned()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &Arc<dyn TypeEntry>> {
        self.by_type_id.values()
    }

    /// The topic's only type, when the mapping is unambiguous.
    pub(crate) fn single_type_for_topic(&self, topic: &str) -> Option<&'static str> {
        match self.by_topic.get(topic).map(Vec::as_slice) {
            Some([only]) => Some(*only),
            _ => None,
        }
    }

    pub(crate) fn has_outbox_types(&self) -> bool {
        self.has_outbox
    }

    pub(crate) fn producer_runtime<M: Message>(
        &self,
    ) -> Result<Arc<ProducerRuntime<M>>, KewError> {
        self.by_rust
            .get(&RustTypeId::of::<M>())
            .and_then(|any| any.downcast_ref::<Arc<ProducerRuntime<M>>>())
            .cloned()
            .ok_or_else(|| {
                KewError::Config(format!(
                    "message type {} is not registered with a producer half",
                    M::TYPE_ID
                ))
            })
    }
}
