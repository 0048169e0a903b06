//! The internal message record routed, retained, queued, and archived by
//! the broker.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::qos::QoS;

/// A published message as seen by the broker core.
///
/// Cheap to clone: the payload is reference-counted `Bytes`. The JSON view
/// of the payload is derived on demand and only matters to storage and
/// inspection, never to delivery semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerMessage {
    /// Stable identity used by queued-message addressing and archive dedup.
    pub message_uuid: Uuid,
    /// Wire-level packet id of the originating publish (0 for QoS 0).
    pub message_id: u16,
    pub topic: String,
    #[serde(with = "bytes_serde")]
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Set when the message was delivered from an offline queue.
    pub queued: bool,
    pub dup: bool,
    /// Client that published the message.
    pub client_id: String,
    pub time: DateTime<Utc>,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        BrokerMessage {
            message_uuid: Uuid::new_v4(),
            message_id: 0,
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            queued: false,
            dup: false,
            client_id: String::new(),
            time: Utc::now(),
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_message_id(mut self, message_id: u16) -> Self {
        self.message_id = message_id;
        self
    }

    /// An empty payload on a retained publish clears the retained entry.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Parse the payload as a JSON document, if it is one.
    pub fn payload_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }

    /// Interpret the payload as a number, trying the JSON view first and
    /// falling back to the raw bytes as a UTF-8 number.
    pub fn payload_as_f64(&self) -> Option<f64> {
        if let Some(value) = self.payload_json() {
            if let Some(n) = value.as_f64() {
                return Some(n);
            }
        }
        std::str::from_utf8(&self.payload)
            .ok()
            .and_then(|s| s.trim().parse::<f64>().ok())
    }
}

mod bytes_serde {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let buf = Vec::<u8>::deserialize(deserializer)?;
        Ok(Bytes::from(buf))
    }
}
