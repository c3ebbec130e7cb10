//! Message envelope and dead-letter record types with their JSON codec
//!
//! Every record value on the wire is a serialized [`Message`]: the
//! propagated request context, the routing key, and an arbitrary JSON
//! payload. Dead-letter records use [`DlqMessage`] instead, wrapping the
//! raw bytes that failed handling together with their topic of origin.

use crate::context::RequestContext;
use crate::error::BusError;
use crate::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// The unit placed on the broker: context, routing key, payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Propagated request context
    pub ctx: RequestContext,
    /// Routing key; selects the partition and the consumer lane
    pub key: String,
    /// Arbitrary payload
    pub payload: serde_json::Value,
}

impl Message {
    pub fn new<S: Into<String>>(
        ctx: RequestContext,
        key: S,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            ctx,
            key: key.into(),
            payload,
        }
    }

    /// Serialize the envelope to its wire form
    pub fn marshal(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|source| BusError::MarshalFailed { source })
    }

    /// Deserialize an envelope from its wire form
    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|source| BusError::UnmarshalFailed { source })
    }
}

/// Record written to a dead-letter topic when handling failed terminally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqMessage {
    /// Topic the failed record was consumed from
    pub topic: String,
    /// Raw record value exactly as it was fetched
    #[serde(rename = "failedMessage")]
    pub failed_message: Vec<u8>,
}

impl DlqMessage {
    pub fn new<S: Into<String>>(topic: S, failed_message: &[u8]) -> Self {
        Self {
            topic: topic.into(),
            failed_message: failed_message.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_round_trip() {
        let message = Message::new(
            RequestContext::new("req-7").with_value("tenant", "acme"),
            "user-123",
            json!({"amount": 12, "currency": "EUR"}),
        );

        let bytes = message.marshal().unwrap();
        let decoded = Message::unmarshal(&bytes).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.payload["currency"], "EUR");
    }

    #[test]
    fn test_unmarshal_rejects_garbage() {
        let err = Message::unmarshal(b"{not json").unwrap_err();
        assert_eq!(err.code(), "UNMARSHAL_FAILED");

        // valid JSON, wrong shape
        let err = Message::unmarshal(br#"{"key": 3}"#).unwrap_err();
        assert_eq!(err.code(), "UNMARSHAL_FAILED");
    }

    #[test]
    fn test_dlq_message_preserves_raw_bytes() {
        let raw = b"\x00\x01 not even json";
        let dlq = DlqMessage::new("orders", raw);

        let bytes = serde_json::to_vec(&dlq).unwrap();
        let decoded: DlqMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.topic, "orders");
        assert_eq!(decoded.failed_message, raw);
    }
}
