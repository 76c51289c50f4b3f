//! MQTT topic scheme.
//!
//! Topic structure: `opcpub/v1/{publisher}/...`
//!
//! - `{group}/data`: network messages of a writer group
//! - `discovery/request`: inbound discovery requests
//! - `events/{kind}`: outbound broker events

use serde::{Deserialize, Serialize};

/// Protocol version for topic scheme.
pub const PROTOCOL_VERSION: &str = "v1";

/// Topic scheme configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicScheme {
    /// Publisher identifier
    pub publisher: String,
    /// Topic prefix (default: "opcpub")
    pub prefix: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::new("default")
    }
}

impl TopicScheme {
    /// Create a new topic scheme for the given publisher.
    #[must_use]
    pub fn new(publisher: impl Into<String>) -> Self {
        Self {
            publisher: publisher.into(),
            prefix: "opcpub".to_string(),
        }
    }

    fn base(&self) -> String {
        format!("{}/{}/{}", self.prefix, PROTOCOL_VERSION, self.publisher)
    }

    /// Topic for network messages of a writer group.
    #[must_use]
    pub fn data(&self, group: &str) -> String {
        format!("{}/{group}/data", self.base())
    }

    /// Topic for discovery requests.
    #[must_use]
    pub fn discovery_request(&self) -> String {
        format!("{}/discovery/request", self.base())
    }

    /// Topic for events of one kind.
    #[must_use]
    pub fn event(&self, kind: &str) -> String {
        format!("{}/events/{kind}", self.base())
    }

    /// Wildcard subscription for everything of this publisher.
    #[must_use]
    pub fn publisher_wildcard(&self) -> String {
        format!("{}/#", self.base())
    }

    /// Parse a topic of this publisher.
    #[must_use]
    pub fn parse(&self, topic: &str) -> Option<TopicKind> {
        let remainder = topic.strip_prefix(&self.base())?.strip_prefix('/')?;
        let parts: Vec<&str> = remainder.split('/').collect();
        match parts.as_slice() {
            ["discovery", "request"] => Some(TopicKind::DiscoveryRequest),
            ["events", kind] if !kind.is_empty() => Some(TopicKind::Event((*kind).to_string())),
            [group, "data"] if !group.is_empty() => Some(TopicKind::Data((*group).to_string())),
            _ => None,
        }
    }
}

/// Parsed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind {
    /// Writer group data, with the group id
    Data(String),
    /// Discovery request
    DiscoveryRequest,
    /// Event, with the event kind
    Event(String),
}
