//! Consumer runtime: the broker poll loop, watermark/breaker flow control,
//! per-type workers, and the built-in consumer-chain stages.
//!
//! The poll loop is the only writer into the per-type channels; each
//! channel has exactly one worker reading it, so per-topic-partition
//! processing stays strictly sequential.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::breaker::CircuitBreaker;
use crate::broker::{BrokerConsumer, ConsumedRecord, ConsumerEvent};
use crate::channel::{PushOutcome, TypeChannel};
use crate::envelope::Envelope;
use crate::errors::KewError;
use crate::headers::{TRACEPARENT_HEADER, TYPE_HEADER};
use crate::message::{Handler, Message};
use crate::middleware::{Middleware, Next, Pipeline};
use crate::registry::TypeRegistry;
use crate::scope::{Scope, ScopeServices};
use crate::serializer::MessageSerializer;
use crate::trace::TraceParent;

const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const PAUSED_BACKOFF: Duration = Duration::from_millis(100);

/// Why a type currently demands a pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PauseReason {
    Backpressure,
    Breaker,
}

struct FlowInner {
    /// (type id, reason) pairs currently demanding a pause.
    demands: HashSet<(&'static str, PauseReason)>,
    topic_of: HashMap<&'static str, String>,
    paused_topics: HashSet<String>,
}

/// Shared pause/resume bookkeeping for one broker consumer.
///
/// A topic is paused while any of its types demands it and resumed only
/// once no type does, for either reason.
pub(crate) struct FlowControl {
    consumer: Arc<dyn BrokerConsumer>,
    inner: parking_lot::Mutex<FlowInner>,
}

impl FlowControl {
    pub(crate) fn new(
        consumer: Arc<dyn BrokerConsumer>,
        routes: &[(&'static str, String)],
    ) -> Self {
        Self {
            consumer,
            inner: parking_lot::Mutex::new(FlowInner {
                demands: HashSet::new(),
                topic_of: routes
                    .iter()
                    .map(|(t, topic)| (*t, topic.clone()))
                    .collect(),
                paused_topics: HashSet::new(),
            }),
        }
    }

    pub(crate) fn set_backpressure(&self, type_id: &'static str, demanded: bool) {
        self.set(type_id, PauseReason::Backpressure, demanded);
    }

    pub(crate) fn set_breaker(&self, type_id: &'static str, demanded: bool) {
        self.set(type_id, PauseReason::Breaker, demanded);
    }

    fn set(&self, type_id: &'static str, reason: PauseReason, demanded: bool) {
        let mut inner = self.inner.lock();
        let changed = if demanded {
            inner.demands.insert((type_id, reason))
        } else {
            inner.demands.remove(&(type_id, reason))
        };
        if changed {
            self.reconcile(&mut inner);
        }
    }

    fn reconcile(&self, inner: &mut FlowInner) {
        let desired: HashSet<String> = inner
            .demands
            .iter()
            .filter_map(|(type_id, _)| inner.topic_of.get(type_id).cloned())
            .collect();

        for topic in desired.difference(&inner.paused_topics) {
            info!("⏸️ Pausing consumption of {topic}");
            if let Err(e) = self.consumer.pause_topic(topic) {
                warn!("❌ Failed to pause {topic}: {e}");
            }
        }
        for topic in inner.paused_topics.difference(&desired) {
            info!("▶️ Resuming consumption of {topic}");
            if let Err(e) = self.consumer.resume_topic(topic) {
                warn!("❌ Failed to resume {topic}: {e}");
            }
        }
        inner.paused_topics = desired;
    }

    fn all_paused(&self) -> bool {
        let inner = self.inner.lock();
        let topics: HashSet<&String> = inner.topic_of.values().collect();
        !topics.is_empty() && topics.iter().all(|t| inner.paused_topics.contains(*t))
    }
}

/// Untyped routing data for one consumer type.
pub(crate) struct Route {
    pub(crate) type_id: &'static str,
    pub(crate) topic: String,
    pub(crate) channel: Arc<TypeChannel>,
    pub(crate) breaker: Arc<CircuitBreaker>,
}

/// Poll the broker and demultiplex records into per-type channels.
pub(crate) async fn poll_loop(
    consumer: Arc<dyn BrokerConsumer>,
    registry: Arc<TypeRegistry>,
    routes: Vec<Route>,
    flow: Arc<FlowControl>,
    cancel: CancellationToken,
) {
    let mut topics: Vec<String> = routes.iter().map(|r| r.topic.clone()).collect();
    topics.sort();
    topics.dedup();
    if let Err(e) = consumer.subscribe(&topics) {
        error!("❌ Failed to subscribe to {topics:?}: {e}");
        return;
    }
    info!("🎯 Consumer subscribed to {topics:?}");

    let by_type: HashMap<&'static str, &Route> =
        routes.iter().map(|r| (r.type_id, r)).collect();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        for route in &routes {
            flow.set_breaker(route.type_id, route.breaker.requires_pause());
        }

        match consumer.poll(POLL_TIMEOUT).await {
            Ok(Some(ConsumerEvent::Record(record))) => {
                dispatch_record(record, &by_type, &registry, &consumer, &flow).await;
            }
            Ok(Some(ConsumerEvent::Assigned(partitions))) => {
                debug!("🧩 Partitions assigned: {partitions:?}");
            }
            Ok(Some(ConsumerEvent::Revoked(partitions))) => {
                debug!("🧩 Partitions revoked: {partitions:?}");
            }
            Ok(None) => {}
            Err(e) => {
                warn!("❌ Consumer poll failed: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        // Paused consumers keep polling with the short timeout so group
        // heartbeats flow, but must not spin.
        if flow.all_paused() {
            tokio::time::sleep(PAUSED_BACKOFF).await;
        }
    }

    consumer.close();
    info!("🏁 Consumer poll loop ended for {topics:?}");
}

async fn dispatch_record(
    record: ConsumedRecord,
    by_type: &HashMap<&'static str, &Route>,
    registry: &Arc<TypeRegistry>,
    consumer: &Arc<dyn BrokerConsumer>,
    flow: &Arc<FlowControl>,
) {
    let type_id = record
        .headers
        .get_str(TYPE_HEADER)
        .map(str::to_string)
        .or_else(|| {
            registry
                .single_type_for_topic(&record.topic)
                .map(str::to_string)
        });

    let route = type_id
        .as_deref()
        .and_then(|id| by_type.get(id).copied());
    let Some(route) = route else {
        warn!(
            "🤷 No registered type for record at {}[{}]@{}; skipping",
            record.topic, record.partition, record.offset
        );
        if let Err(e) = consumer.store_offset(&record.topic, record.partition, record.offset + 1)
        {
            warn!("❌ Failed to store offset for skipped record: {e}");
        }
        return;
    };

    match route.channel.push(record).await {
        PushOutcome::Stored => {}
        PushOutcome::DroppedOldest => {
            warn!("🗑️ Channel for {} full; evicted the oldest record", route.type_id)
        }
        PushOutcome::DroppedNewest => {
            warn!("🗑️ Channel for {} full; dropped the incoming record", route.type_id)
        }
    }

    if route.channel.len() >= route.channel.high_water() {
        flow.set_backpressure(route.type_id, true);
    }
}

/// Everything one worker task needs.
pub(crate) struct WorkerDeps<M: Message> {
    pub(crate) type_id: &'static str,
    pub(crate) channel: Arc<TypeChannel>,
    pub(crate) breaker: Arc<CircuitBreaker>,
    pub(crate) pipeline: Pipeline<M>,
    pub(crate) consumer: Arc<dyn BrokerConsumer>,
    pub(crate) flow: Arc<FlowControl>,
    pub(crate) services: Arc<ScopeServices>,
    pub(crate) cancel: CancellationToken,
}

/// Pop one record at a time and drive it through the consumer pipeline.
pub(crate) async fn worker_loop<M: Message>(deps: WorkerDeps<M>) {
    info!("🔄 Worker started for {}", deps.type_id);
    loop {
        let record = tokio::select! {
            _ = deps.cancel.cancelled() => break,
            record = deps.channel.pop() => record,
        };

        if deps.channel.len() <= deps.channel.low_water() {
            deps.flow.set_backpressure(deps.type_id, false);
        }

        process_record(&deps, record).await;
    }
    info!("🏁 Worker ended for {}", deps.type_id);
}

async fn process_record<M: Message>(deps: &WorkerDeps<M>, record: ConsumedRecord) {
    let scope = Scope::attach(deps.services.clone());
    let key = record
        .key
        .as_deref()
        .map(|k| String::from_utf8_lossy(k).into_owned());
    let mut envelope = Envelope::<M>::for_consume(key, record.headers.clone(), record.payload.clone());
    // The sink clone must not outlive the envelope or the commit inside
    // save_changes would still see it referenced.
    match scope.sink().await {
        Ok(sink) => envelope.attach_sink(sink),
        Err(e) => {
            error!("❌ Could not open a session for {}: {e}", deps.type_id);
            deps.breaker.record_failure();
            return;
        }
    }
    envelope.attach_scope(scope.clone());

    let result = deps.pipeline.run(&mut envelope).await;
    drop(envelope);

    match result {
        Ok(()) => match scope.save_changes().await {
            Ok(()) => {
                store_offset(deps, &record);
                deps.breaker.record_success();
            }
            Err(e) => {
                error!("❌ Post-handling save failed for {}: {e}", deps.type_id);
                if e.counts_toward_breaker() {
                    deps.breaker.record_failure();
                }
            }
        },
        Err(KewError::Deserialize(e)) => {
            warn!(
                "🗑️ Dropping undecodable {} record at {}[{}]@{}: {e}",
                deps.type_id, record.topic, record.partition, record.offset
            );
            store_offset(deps, &record);
            deps.breaker.record_failure();
        }
        Err(e) => {
            error!("❌ Handling {} record failed: {e}", deps.type_id);
            // No offset store: the record will be redelivered.
            if e.counts_toward_breaker() {
                deps.breaker.record_failure();
            }
        }
    }
}

fn store_offset<M: Message>(deps: &WorkerDeps<M>, record: &ConsumedRecord) {
    if let Err(e) =
        deps.consumer
            .store_offset(&record.topic, record.partition, record.offset + 1)
    {
        warn!("❌ Failed to store offset for {}: {e}", deps.type_id);
    }
}

/// Reads `traceparent` so the rest of the pipeline runs under the
/// upstream trace.
pub(crate) struct TraceExtractStage;

#[async_trait]
impl<M: Message> Middleware<M> for TraceExtractStage {
    async fn handle(
        &self,
        envelope: &mut Envelope<M>,
        next: Next<'_, M>,
    ) -> Result<(), KewError> {
        if let Some(parent) = envelope
            .headers
            .get_str(TRACEPARENT_HEADER)
            .and_then(TraceParent::parse)
        {
            debug!(trace_id = %parent.trace_id, "📥 Continuing upstream trace");
        }
        next.run(envelope).await
    }
}

pub(crate) struct DeserializeStage<M: Message> {
    serializer: Arc<dyn MessageSerializer<M>>,
}

impl<M: Message> DeserializeStage<M> {
    pub(crate) fn new(serializer: Arc<dyn MessageSerializer<M>>) -> Self {
        Self { serializer }
    }
}

#[async_trait]
impl<M: Message> Middleware<M> for DeserializeStage<M> {
    async fn handle(
        &self,
        envelope: &mut Envelope<M>,
        next: Next<'_, M>,
    ) -> Result<(), KewError> {
        let payload = envelope.require_payload()?;
        let message = self.serializer.deserialize(payload, &envelope.headers)?;
        envelope.set_message(message);
        next.run(envelope).await
    }
}

/// Short-circuits records whose headers don't match every configured
/// filter; values compare ASCII-case-insensitively.
pub(crate) struct HeaderFilterStage {
    filters: Vec<(String, String)>,
}

impl HeaderFilterStage {
    pub(crate) fn new(filters: Vec<(String, String)>) -> Self {
        Self { filters }
    }
}

#[async_trait]
impl<M: Message> Middleware<M> for HeaderFilterStage {
    async fn handle(
        &self,
        envelope: &mut Envelope<M>,
        next: Next<'_, M>,
    ) -> Result<(), KewError> {
        for (name, expected) in &self.filters {
            let matches = envelope
                .headers
                .get_str(name)
                .is_some_and(|actual| actual.eq_ignore_ascii_case(expected));
            if !matches {
                debug!("🚫 Header filter {name}={expected} rejected a {} record", M::TYPE_ID);
                return Ok(());
            }
        }
        next.run(envelope).await
    }
}

/// Terminal consumer stage: the application handler.
pub(crate) struct HandlerStage<M: Message> {
    handler: Arc<dyn Handler<M>>,
}

impl<M: Message> HandlerStage<M> {
    pub(crate) fn new(handler: Arc<dyn Handler<M>>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<M: Message> Middleware<M> for HandlerStage<M> {
    async fn handle(
        &self,
        envelope: &mut Envelope<M>,
        next: Next<'_, M>,
    ) -> Result<(), KewError> {
        let message = envelope.require_message()?.clone();
        let scope = envelope.scope_handle()?;
        self.handler.handle(scope, message).await?;
        next.run(envelope).await
    }
}
