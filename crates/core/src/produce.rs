//! Built-in producer-chain stages.
//!
//! A producer chain is always `serialize → user stages → trace-inject →
//! dispatch`. Dispatch is the terminal stage: depending on the type's
//! strategy it stages an outbox row, queues a post-commit produce, or (on
//! the replay path) hands the record straight to the producer.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::broker::{BrokerProducer, OutgoingRecord};
use crate::config::{ForgetStrategy, OutboxStrategy};
use crate::envelope::{Envelope, PipelinePhase};
use crate::errors::KewError;
use crate::headers::{RUNTIME_TYPE_HEADER, TRACEPARENT_HEADER};
use crate::message::Message;
use crate::middleware::{Middleware, Next};
use crate::scope::{FollowUp, ProduceJob};
use crate::serializer::MessageSerializer;
use crate::store::OutboxRow;
use crate::trace::TraceParent;

pub(crate) struct SerializeStage<M: Message> {
    serializer: Arc<dyn MessageSerializer<M>>,
}

impl<M: Message> SerializeStage<M> {
    pub(crate) fn new(serializer: Arc<dyn MessageSerializer<M>>) -> Self {
        Self { serializer }
    }
}

#[async_trait]
impl<M: Message> Middleware<M> for SerializeStage<M> {
    async fn handle(
        &self,
        envelope: &mut Envelope<M>,
        next: Next<'_, M>,
    ) -> Result<(), KewError> {
        // Replayed envelopes carry the bytes frozen in the outbox row.
        if envelope.payload().is_none() {
            let message = envelope.require_message()?.clone();
            let payload = self.serializer.serialize(&mut envelope.headers, &message)?;
            envelope.set_payload(payload);
        }
        next.run(envelope).await
    }
}

/// Writes `traceparent`, continuing an existing trace when one is present.
pub(crate) struct TraceInjectStage;

#[async_trait]
impl<M: Message> Middleware<M> for TraceInjectStage {
    async fn handle(
        &self,
        envelope: &mut Envelope<M>,
        next: Next<'_, M>,
    ) -> Result<(), KewError> {
        let parent = envelope
            .headers
            .get_str(TRACEPARENT_HEADER)
            .and_then(TraceParent::parse)
            .map(|existing| existing.child_of())
            .unwrap_or_else(TraceParent::root);
        envelope
            .headers
            .insert(TRACEPARENT_HEADER, parent.render().into_bytes());
        next.run(envelope).await
    }
}

/// Terminal producer stage: outbox, forget, or direct produce.
pub(crate) struct DispatchStage<M: Message> {
    topic: String,
    outbox: Option<OutboxStrategy>,
    forget: Option<ForgetStrategy>,
    producer: Arc<dyn BrokerProducer>,
    _marker: PhantomData<fn(M)>,
}

impl<M: Message> DispatchStage<M> {
    pub(crate) fn new(
        topic: String,
        outbox: Option<OutboxStrategy>,
        forget: Option<ForgetStrategy>,
        producer: Arc<dyn BrokerProducer>,
    ) -> Self {
        Self {
            topic,
            outbox,
            forget,
            producer,
            _marker: PhantomData,
        }
    }

    fn record(&self, envelope: &Envelope<M>) -> Result<OutgoingRecord, KewError> {
        Ok(OutgoingRecord {
            topic: self.topic.clone(),
            key: envelope.key.clone(),
            payload: envelope.require_payload()?.to_vec(),
            headers: envelope.headers.clone(),
        })
    }

    fn outbox_row(&self, envelope: &Envelope<M>) -> Result<OutboxRow, KewError> {
        Ok(OutboxRow {
            // Assigned by the store when the row is staged.
            sequence_number: 0,
            id: Uuid::new_v4(),
            compile_type: M::TYPE_ID.to_string(),
            runtime_type: envelope
                .headers
                .get_str(RUNTIME_TYPE_HEADER)
                .map(str::to_string),
            topic: self.topic.clone(),
            aggregate_key: envelope.key.clone(),
            headers: envelope.headers.snapshot(),
            payload: envelope.require_payload()?.to_vec(),
            enqueued_at: Utc::now(),
            processed_at: None,
            retries: 0,
            is_success: false,
        })
    }
}

#[async_trait]
impl<M: Message> Middleware<M> for DispatchStage<M> {
    async fn handle(
        &self,
        envelope: &mut Envelope<M>,
        _next: Next<'_, M>,
    ) -> Result<(), KewError> {
        match envelope.phase() {
            PipelinePhase::Replay => {
                let record = self.record(envelope)?;
                let handle = self.producer.send(record).await?;
                envelope.delivery = Some(handle);
                Ok(())
            }
            PipelinePhase::Transactional => {
                let record = self.record(envelope)?;
                let sink = envelope.sink()?;
                if let Some(strategy) = self.outbox {
                    let row = sink.stage_outbox(self.outbox_row(envelope)?).await?;
                    debug!(
                        "📦 Staged outbox row {} (seq {}) for {}",
                        row.id, row.sequence_number, self.topic
                    );
                    if strategy == OutboxStrategy::ImmediateWithFallback {
                        sink.queue_job(ProduceJob {
                            record,
                            follow_up: FollowUp::MarkRow(row),
                        });
                    }
                    return Ok(());
                }
                let follow_up = match self.forget {
                    Some(ForgetStrategy::AwaitForget(limit)) => FollowUp::AwaitForget(limit),
                    Some(ForgetStrategy::FireForget) => FollowUp::FireForget,
                    None => FollowUp::Direct,
                };
                sink.queue_job(ProduceJob { record, follow_up });
                Ok(())
            }
            PipelinePhase::Consume => Err(KewError::Pipeline(
                "producer chain invoked on the consume path".to_string(),
            )),
        }
    }
}
