use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable, opaque identifier of a participant on the rendezvous bus.
///
/// A participant subscribes under its own id and publishes to the id of the
/// remote it wants to negotiate with. The id is treated as an opaque string;
/// callers typically pass a node's addressable key in hex form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Process-unique token correlating the signals of one negotiation attempt.
///
/// Generated as a UUIDv4, which keeps ids collision-resistant across any
/// realistic number of concurrently active handshakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandshakeId(Uuid);

impl HandshakeId {
    /// Generates a fresh random handshake id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for HandshakeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The unit exchanged over the rendezvous bus.
///
/// The signal payload is opaque to the transport layer; for WebRTC peers it
/// carries SDP offers/answers and trickled ICE candidates as JSON. No ordering
/// is assumed beyond the per-key causal order the bus already provides, and
/// receivers must tolerate signals arriving after their local handshake state
/// has advanced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    /// Identity of the participant that produced the signal.
    pub sender: PeerId,
    /// Token correlating this signal with its negotiation attempt.
    pub handshake_id: HandshakeId,
    /// Connection-setup metadata, opaque to this layer.
    pub signal: serde_json::Value,
}

impl SignalEnvelope {
    /// Serializes a [`SignalEnvelope`] into a JSON string.
    pub fn serialize(envelope: &Self) -> serde_json::error::Result<String> {
        serde_json::to_string(envelope)
    }

    /// Deserializes a JSON string into a [`SignalEnvelope`].
    pub fn deserialize(envelope: &str) -> serde_json::error::Result<Self> {
        serde_json::from_str(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_serialize_deserialize_envelope() {
        let id = HandshakeId::generate();
        let envelope = SignalEnvelope {
            sender: PeerId::from("node1"),
            handshake_id: id,
            signal: serde_json::json!({ "sdp": "sdp1", "type": "offer" }),
        };

        let serialized = SignalEnvelope::serialize(&envelope).unwrap();
        assert_eq!(
            serialized,
            format!(
                "{{\"sender\":\"node1\",\"handshakeId\":\"{id}\",\"signal\":{{\"sdp\":\"sdp1\",\"type\":\"offer\"}}}}"
            )
        );

        let deserialized = SignalEnvelope::deserialize(&serialized).unwrap();
        assert_eq!(deserialized, envelope);
    }

    #[test]
    fn test_deserialize_rejects_missing_handshake_id() {
        let result = SignalEnvelope::deserialize("{\"sender\":\"node1\",\"signal\":null}");
        assert!(result.is_err());
    }

    #[test]
    fn test_handshake_ids_are_unique() {
        let mut ids = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(ids.insert(HandshakeId::generate()));
        }
    }

    #[test]
    fn test_peer_id_display_round_trip() {
        let id = PeerId::new("deadbeef");
        assert_eq!(id.to_string(), "deadbeef");
        assert_eq!(id.as_str(), "deadbeef");
    }
}
