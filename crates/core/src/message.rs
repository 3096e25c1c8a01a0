use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::KewError;
use crate::scope::Scope;

/// A business message that can travel through the pipelines.
///
/// Every message type is registered once against the client; the registered
/// type id is what ends up in the `$type` header and in outbox rows, so it
/// must stay stable across deployments.
pub trait Message:
    Serialize + DeserializeOwned + Send + Sync + Clone + fmt::Debug + 'static
{
    /// Short, stable identifier for this type on the wire and in the outbox.
    const TYPE_ID: &'static str;

    /// Tag for the concrete variant when the wire contract allows subtypes.
    ///
    /// Returning a value different from [`Message::TYPE_ID`] makes the
    /// serializer emit a `$runtimeType` header next to `$type`.
    fn runtime_type(&self) -> Option<&'static str> {
        None
    }
}

/// Terminal stage of the consumer pipeline: the application's handler.
///
/// The scope is live for the duration of the call; messages published
/// through it are delivered after the handler's transaction commits.
#[async_trait]
pub trait Handler<M: Message>: Send + Sync {
    async fn handle(&self, scope: Arc<Scope>, message: M) -> Result<(), KewError>;
}

#[async_trait]
impl<M, F, Fut> Handler<M> for F
where
    M: Message,
    F: Fn(Arc<Scope>, M) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), KewError>> + Send,
{
    async fn handle(&self, scope: Arc<Scope>, message: M) -> Result<(), KewError> {
        (self)(scope, message).await
    }
}
