//! Queue payloads exchanged between the dispatcher and the worker.

use crate::models::transform::TransformSpec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One transform request in flight. The worker never answers it directly;
/// results surface through the metadata store and cache.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransformMessage {
    pub owner_id: Uuid,
    pub source_object_id: Uuid,
    pub transform_spec: TransformSpec,
}

impl TransformMessage {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

/// Acknowledgement returned to the caller once a request is enqueued.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TransformAck {
    pub status: String,
}

impl TransformAck {
    pub fn queued() -> Self {
        Self {
            status: "queued".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_payload_uses_camel_case() {
        let message = TransformMessage {
            owner_id: Uuid::nil(),
            source_object_id: Uuid::nil(),
            transform_spec: TransformSpec {
                flip: Some(true),
                ..Default::default()
            },
        };
        let value: serde_json::Value = serde_json::from_slice(&message.encode().unwrap()).unwrap();
        assert!(value.get("ownerId").is_some());
        assert!(value.get("sourceObjectId").is_some());
        assert_eq!(value["transformSpec"]["flip"], true);
        assert_eq!(TransformMessage::decode(&message.encode().unwrap()).unwrap(), message);
    }
}
