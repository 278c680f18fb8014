//! JSON wire envelope shared by operations, presence and resync messages.
//!
//! ```text
//! {"type": "op" | "awareness" | "resync-request" | "resync-response",
//!  "payload": <type specific>,
//!  "sender": "<replica id hex>"}
//! ```
//!
//! An `op` payload is an array of operations. Elements are decoded one by one
//! so a malformed element is dropped without losing the rest of the batch.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::awareness::AwarenessUpdate;
use crate::error::{Error, Result};
use crate::ids::ReplicaId;
use crate::ops::Operation;
use crate::resync::{ResyncRequest, ResyncResponse};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Op,
    Awareness,
    ResyncRequest,
    ResyncResponse,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub payload: Value,
    pub sender: ReplicaId,
}

/// Operations recovered from an `op` payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodedBatch {
    pub operations: Vec<Operation>,
    pub dropped: usize,
}

impl Envelope {
    fn new<T: Serialize>(kind: MessageKind, sender: &ReplicaId, payload: &T) -> Result<Self> {
        Ok(Self {
            kind,
            payload: serde_json::to_value(payload).map_err(|e| Error::Encode(e.to_string()))?,
            sender: sender.clone(),
        })
    }

    pub fn operations(sender: &ReplicaId, ops: &[Operation]) -> Result<Self> {
        Self::new(MessageKind::Op, sender, &ops)
    }

    pub fn awareness(sender: &ReplicaId, update: &AwarenessUpdate) -> Result<Self> {
        Self::new(MessageKind::Awareness, sender, update)
    }

    pub fn resync_request(sender: &ReplicaId, request: &ResyncRequest) -> Result<Self> {
        Self::new(MessageKind::ResyncRequest, sender, request)
    }

    pub fn resync_response(sender: &ReplicaId, response: &ResyncResponse) -> Result<Self> {
        Self::new(MessageKind::ResyncResponse, sender, response)
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Encode(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::MalformedOperation(e.to_string()))
    }

    /// Decode the payload as `T`, regardless of `kind`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.payload).map_err(|e| Error::MalformedOperation(e.to_string()))
    }

    /// Decode an `op` payload, dropping malformed elements.
    pub fn decode_operations(&self) -> Result<DecodedBatch> {
        if self.kind != MessageKind::Op {
            return Err(Error::MalformedOperation(format!(
                "expected an op message, got {:?}",
                self.kind
            )));
        }
        Ok(decode_operations(&self.payload))
    }
}

/// Decode a JSON array of operations; a single object is accepted as a batch
/// of one.
pub fn decode_operations(payload: &Value) -> DecodedBatch {
    let elements = match payload {
        Value::Array(items) => items.as_slice(),
        other => std::slice::from_ref(other),
    };
    let mut batch = DecodedBatch::default();
    for element in elements {
        match Operation::deserialize(element) {
            Ok(op) => batch.operations.push(op),
            Err(err) => {
                tracing::warn!("dropping malformed operation: {err}");
                batch.dropped += 1;
            }
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::NodeId;
    use crate::ops::NodeKind;
    use serde_json::json;

    #[test]
    fn envelope_uses_wire_names() {
        let sender = ReplicaId::new(vec![0xab]);
        let op = Operation::create(
            &sender,
            1,
            1,
            NodeKind::Application,
            NodeId::ROOT,
            vec![("name".into(), "Nav".into())],
        );
        let text = Envelope::operations(&sender, &[op]).unwrap().encode().unwrap();
        let raw: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(raw["type"], "op");
        assert_eq!(raw["sender"], "ab");
        assert_eq!(raw["payload"][0]["kind"]["op"], "create");
        assert_eq!(raw["payload"][0]["kind"]["kind"], "application");
    }

    #[test]
    fn malformed_elements_are_dropped() {
        let sender = ReplicaId::new(b"a");
        let good = serde_json::to_value(Operation::delete(
            &sender,
            2,
            2,
            NodeId::new(&sender, 1),
        ))
        .unwrap();
        let unknown_kind = json!({
            "meta": {"id": {"replica": "61", "counter": 3}, "lamport": 3},
            "kind": {"op": "move", "node": {"clock": 1, "replica": "61"}}
        });
        let bad_attrs = json!({
            "meta": {"id": {"replica": "61", "counter": 4}, "lamport": 4},
            "kind": {
                "op": "create",
                "node": {"clock": 4, "replica": "61"},
                "kind": "topic",
                "parent": {"clock": 1, "replica": "61"},
                "attributes": [["name", 7]]
            }
        });

        let envelope = Envelope {
            kind: MessageKind::Op,
            payload: json!([good, unknown_kind, bad_attrs]),
            sender,
        };
        let batch = envelope.decode_operations().unwrap();
        assert_eq!(batch.operations.len(), 1);
        assert_eq!(batch.dropped, 2);
    }

    #[test]
    fn garbage_text_is_malformed() {
        assert!(matches!(
            Envelope::decode("{not json"),
            Err(Error::MalformedOperation(_))
        ));
        assert!(matches!(
            Envelope::decode(r#"{"type":"ping","payload":null,"sender":"00"}"#),
            Err(Error::MalformedOperation(_))
        ));
    }

    #[test]
    fn non_op_envelopes_refuse_operation_decoding() {
        let envelope = Envelope {
            kind: MessageKind::Awareness,
            payload: Value::Null,
            sender: ReplicaId::new(b"a"),
        };
        assert!(envelope.decode_operations().is_err());
    }
}
