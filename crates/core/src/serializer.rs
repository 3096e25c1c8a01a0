use crate::errors::KewError;
use crate::headers::{HeaderMap, RUNTIME_TYPE_HEADER, TYPE_HEADER};
use crate::message::Message;

/// Codec contract between typed messages and wire bytes.
///
/// Codecs are stateless after configuration and safe for concurrent use.
/// `serialize` writes the `$type` header (and `$runtimeType` when the
/// message reports a distinct variant); `deserialize` may consult those
/// headers and must fall back to the declared type when `$runtimeType` is
/// missing or unknown.
pub trait MessageSerializer<M: Message>: Send + Sync {
    fn serialize(&self, headers: &mut HeaderMap, message: &M) -> Result<Vec<u8>, KewError>;
    fn deserialize(&self, payload: &[u8], headers: &HeaderMap) -> Result<M, KewError>;
}

/// The shipped JSON codec.
///
/// JSON bodies are self-describing for serde enums, so `$runtimeType` is
/// written for routing and filtering but not needed to pick the variant on
/// the way back in.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl<M: Message> MessageSerializer<M> for JsonSerializer {
    fn serialize(&self, headers: &mut HeaderMap, message: &M) -> Result<Vec<u8>, KewError> {
        headers.insert(TYPE_HEADER, M::TYPE_ID.as_bytes().to_vec());
        if let Some(runtime) = message.runtime_type() {
            if runtime != M::TYPE_ID {
                headers.insert(RUNTIME_TYPE_HEADER, runtime.as_bytes().to_vec());
            }
        }
        serde_json::to_vec(message).map_err(KewError::Serialize)
    }

    fn deserialize(&self, payload: &[u8], _headers: &HeaderMap) -> Result<M, KewError> {
        serde_json::from_slice(payload).map_err(KewError::Deserialize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderCreated {
        order_id: u64,
        customer: String,
    }

    impl Message for OrderCreated {
        const TYPE_ID: &'static str = "order-created";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "kind")]
    enum PaymentEvent {
        Authorized { amount: u64 },
        Declined { reason: String },
    }

    impl Message for PaymentEvent {
        const TYPE_ID: &'static str = "payment-event";

        fn runtime_type(&self) -> Option<&'static str> {
            Some(match self {
                PaymentEvent::Authorized { .. } => "payment-authorized",
                PaymentEvent::Declined { .. } => "payment-declined",
            })
        }
    }

    #[test]
    fn round_trip_preserves_message_and_type_header() {
        let codec = JsonSerializer;
        let message = OrderCreated {
            order_id: 42,
            customer: "A".to_string(),
        };

        let mut headers = HeaderMap::new();
        let bytes = codec.serialize(&mut headers, &message).unwrap();

        assert_eq!(headers.get_str(TYPE_HEADER), Some("order-created"));
        assert!(!headers.contains_key(RUNTIME_TYPE_HEADER));
        assert!(!bytes.is_empty());

        let back: OrderCreated = codec.deserialize(&bytes, &headers).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn runtime_type_header_written_for_variants() {
        let codec = JsonSerializer;
        let message = PaymentEvent::Declined {
            reason: "insufficient funds".to_string(),
        };

        let mut headers = HeaderMap::new();
        let bytes = codec.serialize(&mut headers, &message).unwrap();

        assert_eq!(headers.get_str(TYPE_HEADER), Some("payment-event"));
        assert_eq!(
            headers.get_str(RUNTIME_TYPE_HEADER),
            Some("payment-declined")
        );

        let back: PaymentEvent = codec.deserialize(&bytes, &headers).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn unknown_runtime_type_falls_back_to_declared_type() {
        let codec = JsonSerializer;
        let message = OrderCreated {
            order_id: 7,
            customer: "B".to_string(),
        };

        let mut headers = HeaderMap::new();
        let bytes = codec.serialize(&mut headers, &message).unwrap();
        headers.insert(RUNTIME_TYPE_HEADER, b"something-unregistered".to_vec());

        let back: OrderCreated = codec.deserialize(&bytes, &headers).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn deserialize_failure_is_reported() {
        let codec = JsonSerializer;
        let headers = HeaderMap::new();
        let result: Result<OrderCreated, _> = codec.deserialize(b"{not json", &headers);
        assert!(matches!(result, Err(KewError::Deserialize(_))));
    }
}
