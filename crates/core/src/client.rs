//! Client assembly: registers message types, builds the type directory,
//! and owns the background runtime (outbox engine, election, consumers).

use std::any::{Any, TypeId as RustTypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::breaker::CircuitBreaker;
use crate::broker::{Broker, BrokerProducer};
use crate::channel::TypeChannel;
use crate::config::{CoordinationMode, OutboxSettings, TypeConfigBuilder};
use crate::consume::{
    DeserializeStage, FlowControl, HandlerStage, HeaderFilterStage, Route, TraceExtractStage,
    poll_loop,
};
use crate::coordination::{Coordination, ExclusiveNode, SingleNode};
use crate::errors::KewError;
use crate::inbox::InboxStage;
use crate::message::Message;
use crate::middleware::{Middleware, Pipeline};
use crate::outbox::OutboxEngine;
use crate::produce::{DispatchStage, SerializeStage, TraceInjectStage};
use crate::registry::{
    ConsumerRuntime, ConsumerWiring, Entry, ProducerRuntime, TypeEntry, TypeRegistry,
    WorkerContext,
};
use crate::scope::{Scope, ScopeServices};
use crate::store::Store;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

trait ErasedRegistration: Send {
    fn apply(self: Box<Self>, ctx: &mut BuildContext) -> Result<(), KewError>;
}

struct Registration<M: Message> {
    configure: Box<dyn FnOnce(TypeConfigBuilder<M>) -> TypeConfigBuilder<M> + Send>,
}

struct BuildContext {
    producer: Arc<dyn BrokerProducer>,
    by_type_id: HashMap<&'static str, Arc<dyn TypeEntry>>,
    by_rust: HashMap<RustTypeId, Box<dyn Any + Send + Sync>>,
    by_topic: HashMap<String, Vec<&'static str>>,
    has_outbox: bool,
}

impl<M: Message> ErasedRegistration for Registration<M> {
    fn apply(self: Box<Self>, ctx: &mut BuildContext) -> Result<(), KewError> {
        let config = (self.configure)(TypeConfigBuilder::default()).build()?;

        if ctx.by_type_id.contains_key(M::TYPE_ID) {
            return Err(KewError::Config(format!(
                "message type {} registered twice",
                M::TYPE_ID
            )));
        }

        let producer = config.producer.map(|p| {
            let mut stages: Vec<Arc<dyn Middleware<M>>> =
                vec![Arc::new(SerializeStage::new(config.serializer.clone()))];
            stages.extend(p.middleware.iter().cloned());
            stages.push(Arc::new(TraceInjectStage));
            stages.push(Arc::new(DispatchStage::new(
                config.topic.clone(),
                p.outbox,
                p.forget,
                ctx.producer.clone(),
            )));
            Arc::new(ProducerRuntime {
                topic: config.topic.clone(),
                key: p.key,
                headers: p.headers,
                chain: Pipeline::new(stages),
                outbox: p.outbox,
                forget: p.forget,
            })
        });

        let consumer = config.consumer.map(|c| {
            let mut stages: Vec<Arc<dyn Middleware<M>>> = vec![
                Arc::new(TraceExtractStage),
                Arc::new(DeserializeStage::new(config.serializer.clone())),
            ];
            stages.extend(c.middleware.iter().cloned());
            stages.push(Arc::new(HeaderFilterStage::new(c.header_filters.clone())));
            if let Some(inbox) = c.inbox.clone() {
                stages.push(Arc::new(InboxStage::new(inbox)));
            }
            stages.push(Arc::new(HandlerStage::new(c.handler.clone())));
            ConsumerRuntime {
                pipeline: Pipeline::new(stages),
                wiring: ConsumerWiring {
                    channel: Arc::new(TypeChannel::new(
                        c.capacity,
                        c.high_ratio,
                        c.low_ratio,
                        c.full_mode,
                    )),
                    breaker: Arc::new(CircuitBreaker::new(M::TYPE_ID, c.breaker)),
                    exclusive: c.exclusive_connection,
                },
            }
        });

        if producer.as_ref().is_some_and(|p| p.outbox.is_some()) {
            ctx.has_outbox = true;
        }
        if let Some(runtime) = &producer {
            ctx.by_rust
                .insert(RustTypeId::of::<M>(), Box::new(runtime.clone()));
        }

        ctx.by_topic
            .entry(config.topic.clone())
            .or_default()
            .push(M::TYPE_ID);
        ctx.by_type_id.insert(
            M::TYPE_ID,
            Arc::new(Entry::<M> {
                topic: config.topic,
                producer,
                consumer,
            }),
        );
        Ok(())
    }
}

pub struct KewClientBuilder {
    store: Arc<dyn Store>,
    broker: Arc<dyn Broker>,
    group_id: String,
    outbox: OutboxSettings,
    coordination: CoordinationMode,
    registrations: Vec<Box<dyn ErasedRegistration>>,
}

impl KewClientBuilder {
    pub fn new(store: Arc<dyn Store>, broker: Arc<dyn Broker>) -> Self {
        Self {
            store,
            broker,
            group_id: "kew".to_string(),
            outbox: OutboxSettings::default(),
            coordination: CoordinationMode::SingleNode,
            registrations: Vec::new(),
        }
    }

    /// Consumer group id for the regular (non-coordination) consumers.
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self
    }

    pub fn outbox_polling_interval(mut self, interval: Duration) -> Self {
        self.outbox.polling_interval = interval;
        self
    }

    pub fn max_rows_per_tick(mut self, limit: usize) -> Self {
        self.outbox.max_rows_per_tick = limit;
        self
    }

    pub fn coordination(mut self, mode: CoordinationMode) -> Self {
        self.coordination = mode;
        self
    }

    /// Register one message type.
    pub fn message<M: Message>(
        mut self,
        configure: impl FnOnce(TypeConfigBuilder<M>) -> TypeConfigBuilder<M> + Send + 'static,
    ) -> Self {
        self.registrations.push(Box::new(Registration::<M> {
            configure: Box::new(configure),
        }));
        self
    }

    pub fn build(self) -> Result<Arc<KewClient>, KewError> {
        self.outbox.validate()?;
        if self.registrations.is_empty() {
            return Err(KewError::Config(
                "at least one message type must be registered".to_string(),
            ));
        }

        let producer = self.broker.producer();
        let mut ctx = BuildContext {
            producer: producer.clone(),
            by_type_id: HashMap::new(),
            by_rust: HashMap::new(),
            by_topic: HashMap::new(),
            has_outbox: false,
        };
        for registration in self.registrations {
            registration.apply(&mut ctx)?;
        }
        let registry = Arc::new(TypeRegistry {
            by_type_id: ctx.by_type_id,
            by_rust: ctx.by_rust,
            by_topic: ctx.by_topic,
            has_outbox: ctx.has_outbox,
        });

        let cancel = CancellationToken::new();
        let (coordination, exclusive): (Arc<dyn Coordination>, Option<Arc<ExclusiveNode>>) =
            match self.coordination {
                CoordinationMode::SingleNode => (Arc::new(SingleNode), None),
                CoordinationMode::ExclusiveNode(settings) => {
                    let node = ExclusiveNode::new(settings)?;
                    (node.clone(), Some(node))
                }
            };

        let engine = Arc::new(OutboxEngine::new(
            self.store.clone(),
            registry.clone(),
            producer.clone(),
            self.outbox,
            coordination,
            cancel.child_token(),
        ));
        let services = Arc::new(ScopeServices {
            store: self.store,
            registry,
            producer,
            engine: engine.clone(),
        });

        Ok(Arc::new(KewClient {
            services,
            broker: self.broker,
            group_id: self.group_id,
            engine,
            exclusive,
            cancel,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }))
    }
}

/// The assembled client. One per process; the producer underneath is a
/// process singleton shared by every typed pipeline.
pub struct KewClient {
    services: Arc<ScopeServices>,
    broker: Arc<dyn Broker>,
    group_id: String,
    engine: Arc<OutboxEngine>,
    exclusive: Option<Arc<ExclusiveNode>>,
    cancel: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl KewClient {
    pub fn builder(store: Arc<dyn Store>, broker: Arc<dyn Broker>) -> KewClientBuilder {
        KewClientBuilder::new(store, broker)
    }

    /// Open a unit of work.
    pub fn scope(&self) -> Arc<Scope> {
        Scope::attach(self.services.clone())
    }

    pub fn outbox_engine(&self) -> &Arc<OutboxEngine> {
        &self.engine
    }

    /// Leadership state when running exclusive-node coordination.
    pub fn is_leader(&self) -> Option<bool> {
        self.exclusive.as_ref().map(|node| node.is_leader())
    }

    /// Start consumers and, when configured, the exclusive-node election.
    /// Idempotent.
    pub async fn start(&self) -> Result<(), KewError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("🔧 Starting kew client (group {})", self.group_id);

        if let Some(node) = &self.exclusive {
            let node = node.clone();
            let broker = self.broker.clone();
            let cancel = self.cancel.child_token();
            self.tasks.lock().push(tokio::spawn(async move {
                if let Err(e) = node.run(broker, cancel).await {
                    error!("❌ Exclusive-node election failed: {e}");
                }
            }));
        }

        let mut shared: Vec<Arc<dyn TypeEntry>> = Vec::new();
        let mut dedicated: Vec<Arc<dyn TypeEntry>> = Vec::new();
        for entry in self.services.registry.entries() {
            match entry.consumer_wiring() {
                Some(wiring) if wiring.exclusive => dedicated.push(entry.clone()),
                Some(_) => shared.push(entry.clone()),
                None => {}
            }
        }

        if !shared.is_empty() {
            self.launch_consumer(shared).await?;
        }
        for entry in dedicated {
            self.launch_consumer(vec![entry]).await?;
        }
        Ok(())
    }

    async fn launch_consumer(&self, entries: Vec<Arc<dyn TypeEntry>>) -> Result<(), KewError> {
        let consumer = self.broker.consumer(&self.group_id).await?;

        let mut routes = Vec::new();
        let mut topics_of_types = Vec::new();
        for entry in &entries {
            if let Some(wiring) = entry.consumer_wiring() {
                routes.push(Route {
                    type_id: TypeEntry::type_id(entry.as_ref()),
                    topic: entry.topic().to_string(),
                    channel: wiring.channel.clone(),
                    breaker: wiring.breaker.clone(),
                });
                topics_of_types.push((
                    TypeEntry::type_id(entry.as_ref()),
                    entry.topic().to_string(),
                ));
            }
        }
        let flow = Arc::new(FlowControl::new(consumer.clone(), &topics_of_types));

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(poll_loop(
            consumer.clone(),
            self.services.registry.clone(),
            routes,
            flow.clone(),
            self.cancel.child_token(),
        )));
        for entry in &entries {
            let ctx = WorkerContext {
                services: self.services.clone(),
                consumer: consumer.clone(),
                flow: flow.clone(),
                cancel: self.cancel.child_token(),
            };
            if let Some(handle) = entry.spawn_worker(ctx) {
                tasks.push(handle);
            }
        }
        Ok(())
    }

    /// Cancel every loop and await in-flight work for a bounded grace
    /// period. Outbox rows still pending simply retry on the next start.
    pub async fn shutdown(&self) {
        info!("🛑 Shutting down kew client");
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        match tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(tasks)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!("❌ Background task ended abnormally: {e}");
                    }
                }
            }
            Err(_) => warn!("⏱️ Background tasks did not stop within {SHUTDOWN_GRACE:?}"),
        }
        info!("✅ kew client shut down");
    }
}
