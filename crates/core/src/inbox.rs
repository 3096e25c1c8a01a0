//! Inbox deduplication: content fingerprinting plus the pipeline stage
//! that short-circuits already-processed messages.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::InboxConfig;
use crate::envelope::Envelope;
use crate::errors::KewError;
use crate::message::Message;
use crate::middleware::{Middleware, Next};
use crate::store::{InboxInsert, InboxRow};

/// 128-bit content fingerprint: low 64 bits are the xxh64 of the canonical
/// projection bytes, high 64 bits are zero.
pub fn fingerprint(projection: &serde_json::Value) -> Result<u128, serde_json::Error> {
    let canonical = serde_json::to_vec(projection)?;
    Ok(xxhash_rust::xxh64::xxh64(&canonical, 0) as u128)
}

pub(crate) struct InboxStage<M: Message> {
    config: InboxConfig<M>,
}

impl<M: Message> InboxStage<M> {
    pub(crate) fn new(config: InboxConfig<M>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl<M: Message> Middleware<M> for InboxStage<M> {
    async fn handle(
        &self,
        envelope: &mut Envelope<M>,
        next: Next<'_, M>,
    ) -> Result<(), KewError> {
        let message = envelope.require_message()?;

        let projection = match (self.config.fingerprint)(message) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "⚠️ Fingerprint accessor for {} failed ({e}); handling without dedup",
                    M::TYPE_ID
                );
                return next.run(envelope).await;
            }
        };
        let fingerprint = match fingerprint(&projection) {
            Ok(fp) => fp,
            Err(e) => {
                warn!(
                    "⚠️ Fingerprint canonicalization for {} failed ({e}); handling without dedup",
                    M::TYPE_ID
                );
                return next.run(envelope).await;
            }
        };

        let received_at = Utc::now();
        let expired_at = self
            .config
            .retention
            .and_then(|window| chrono::Duration::from_std(window).ok())
            .map(|window| received_at + window);
        let row = InboxRow {
            id: Uuid::new_v4(),
            fingerprint,
            received_at,
            expired_at,
        };

        let sink = envelope.sink()?;
        match sink.insert_inbox(row).await? {
            InboxInsert::Duplicate => {
                debug!(
                    "🔁 Duplicate {} message (fingerprint {fingerprint:#x}), skipping handler",
                    M::TYPE_ID
                );
                Ok(())
            }
            InboxInsert::Inserted => next.run(envelope).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_is_deterministic() {
        let a = fingerprint(&json!({"order_id": 7, "region": "emea"})).unwrap();
        let b = fingerprint(&json!({"order_id": 7, "region": "emea"})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_ignores_map_insertion_order() {
        // serde_json maps are ordered by key, so order-equivalent
        // projections canonicalize identically.
        let a = fingerprint(&json!({"a": 1, "b": 2})).unwrap();
        let b = fingerprint(&json!({"b": 2, "a": 1})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_differs_for_different_values() {
        let a = fingerprint(&json!({"order_id": 7})).unwrap();
        let b = fingerprint(&json!({"order_id": 8})).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn high_bits_are_zero() {
        let fp = fingerprint(&json!([1, 2, 3])).unwrap();
        assert_eq!(fp >> 64, 0);
    }
}
