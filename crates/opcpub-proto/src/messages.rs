//! Control messages received over MQTT.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request to discover the endpoints behind one or more discovery URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    /// Request id echoed in progress events
    #[serde(default = "new_request_id")]
    pub request_id: String,
    /// Discovery URLs to query, in order
    pub discovery_urls: Vec<String>,
    /// Register discovered applications
    #[serde(default = "default_register")]
    pub register: bool,
}

fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_register() -> bool {
    true
}

impl DiscoveryRequest {
    /// Create a request for `discovery_urls` with a fresh id.
    #[must_use]
    pub fn new(discovery_urls: Vec<String>) -> Self {
        Self {
            request_id: new_request_id(),
            discovery_urls,
            register: true,
        }
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(|e| MessageError::Serialize(e.to_string()))
    }

    /// Decode a request published as JSON or CBOR.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are neither.
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        match bytes.first() {
            Some(b'{') => {
                serde_json::from_slice(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
            }
            _ => ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string())),
        }
    }
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_request_gets_defaults() {
        let request =
            DiscoveryRequest::decode(br#"{"discovery_urls":["opc.tcp://plc-1:4840"]}"#).unwrap();

        assert_eq!(request.discovery_urls, vec!["opc.tcp://plc-1:4840"]);
        assert!(request.register);
        assert!(Uuid::parse_str(&request.request_id).is_ok());
    }

    #[test]
    fn cbor_request_decodes() {
        let request = DiscoveryRequest::new(vec!["opc.tcp://plc-2:4840".into()]);
        let mut bytes = Vec::new();
        ciborium::into_writer(&request, &mut bytes).unwrap();

        assert_eq!(DiscoveryRequest::decode(&bytes).unwrap(), request);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            DiscoveryRequest::decode(b"{not json"),
            Err(MessageError::Deserialize(_))
        ));
    }
}
