//! State each member publishes in its group node.
//!
//! Payloads are JSON. Decoding ignores unknown fields so peers running a newer
//! build can add fields without breaking membership computation on older ones.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// A record published by a group member.
pub trait NodeState: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Identity of the member that published this state.
    fn id(&self) -> &str;
}

/// Default published state: a member id plus free-form metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberState {
    /// Member identity, compared against the local member id.
    pub id: String,
    /// Optional name of the hosting container or process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl MemberState {
    /// State carrying only an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            container: None,
            properties: BTreeMap::new(),
        }
    }

    /// Set the container name.
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// Add a metadata entry.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

impl NodeState for MemberState {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Serialize a state into a node payload.
pub fn encode_state<T: NodeState>(state: &T) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(state)
}

/// Deserialize a node payload.
pub fn decode_state<T: NodeState>(payload: &[u8]) -> serde_json::Result<T> {
    serde_json::from_slice(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_state_json_shape() {
        let state = MemberState::new("node-1");
        let json = String::from_utf8(encode_state(&state).unwrap()).unwrap();
        assert_eq!(json, r#"{"id":"node-1"}"#);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let payload = br#"{"id":"node-2","container":"c1","zone":"eu-west","weight":7}"#;
        let state: MemberState = decode_state(payload).unwrap();

        assert_eq!(state.id(), "node-2");
        assert_eq!(state.container.as_deref(), Some("c1"));
        assert!(state.properties.is_empty());
    }

    #[test]
    fn test_metadata_round_trip() {
        let state = MemberState::new("node-3").with_container("worker").with_property("rack", "r7");
        let decoded: MemberState = decode_state(&encode_state(&state).unwrap()).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_missing_id_is_rejected() {
        assert!(decode_state::<MemberState>(br#"{"container":"c1"}"#).is_err());
        assert!(decode_state::<MemberState>(b"not json").is_err());
    }
}
