use std::sync::Arc;

use uuid::Uuid;

use crate::broker::DeliveryHandle;
use crate::errors::KewError;
use crate::headers::HeaderMap;
use crate::message::Message;
use crate::scope::{Scope, TxSink};

/// Which path an envelope is travelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    /// Produce path inside a save: side effects are staged transactionally.
    Transactional,
    /// Produce path replayed from a persisted outbox row.
    Replay,
    /// Consume path.
    Consume,
}

/// Transient carrier of one message through a middleware chain.
///
/// Lives only for a single traversal. The payload is set once by the
/// serialize stage (or taken from the wire record) and is read-only from
/// then on.
pub struct Envelope<M: Message> {
    message: Option<M>,
    pub key: Option<String>,
    pub headers: HeaderMap,
    payload: Option<Vec<u8>>,
    phase: PipelinePhase,
    /// Back-reference to the outbox row this envelope replays, if any.
    replay_of: Option<Uuid>,
    pub(crate) sink: Option<Arc<TxSink>>,
    pub(crate) scope: Option<Arc<Scope>>,
    pub(crate) delivery: Option<DeliveryHandle>,
}

impl<M: Message> Envelope<M> {
    pub(crate) fn for_publish(message: M) -> Self {
        Self {
            message: Some(message),
            key: None,
            headers: HeaderMap::new(),
            payload: None,
            phase: PipelinePhase::Transactional,
            replay_of: None,
            sink: None,
            scope: None,
            delivery: None,
        }
    }

    pub(crate) fn for_replay(
        row_id: Uuid,
        key: Option<String>,
        headers: HeaderMap,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            message: None,
            key,
            headers,
            payload: Some(payload),
            phase: PipelinePhase::Replay,
            replay_of: Some(row_id),
            sink: None,
            scope: None,
            delivery: None,
        }
    }

    pub(crate) fn for_consume(
        key: Option<String>,
        headers: HeaderMap,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            message: None,
            key,
            headers,
            payload: Some(payload),
            phase: PipelinePhase::Consume,
            replay_of: None,
            sink: None,
            scope: None,
            delivery: None,
        }
    }

    pub fn phase(&self) -> PipelinePhase {
        self.phase
    }

    /// The typed message. `None` on the consume path before deserialization
    /// succeeds and on the replay path.
    pub fn message(&self) -> Option<&M> {
        self.message.as_ref()
    }

    pub(crate) fn set_message(&mut self, message: M) {
        self.message = Some(message);
    }

    /// Serialized payload bytes. Present once the serialize stage ran or the
    /// envelope originated from the wire.
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub(crate) fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = Some(payload);
    }

    /// Outbox row this envelope replays, when on the replay path.
    pub fn replay_of(&self) -> Option<Uuid> {
        self.replay_of
    }

    pub(crate) fn attach_sink(&mut self, sink: Arc<TxSink>) {
        self.sink = Some(sink);
    }

    pub(crate) fn attach_scope(&mut self, scope: Arc<Scope>) {
        self.scope = Some(scope);
    }

    pub(crate) fn sink(&self) -> Result<Arc<TxSink>, KewError> {
        self.sink
            .clone()
            .ok_or_else(|| KewError::Pipeline("no active transaction sink".to_string()))
    }

    pub(crate) fn scope_handle(&self) -> Result<Arc<Scope>, KewError> {
        self.scope
            .clone()
            .ok_or_else(|| KewError::Pipeline("no active scope".to_string()))
    }

    pub(crate) fn require_message(&self) -> Result<&M, KewError> {
        self.message
            .as_ref()
            .ok_or_else(|| KewError::Pipeline("message not materialized".to_string()))
    }

    pub(crate) fn require_payload(&self) -> Result<&[u8], KewError> {
        self.payload
            .as_deref()
            .ok_or_else(|| KewError::Pipeline("payload not materialized".to_string()))
    }

    pub(crate) fn take_delivery(&mut self) -> Option<DeliveryHandle> {
        self.delivery.take()
    }
}
