//! Agent configuration.

use anyhow::{Context, Result};
use opcpub_core::{
    EndpointDescriptor, EventBrokerConfig, MonitoredItemSpec, SessionPoolConfig,
    SubscriptionClientConfig, TaskSchedulerConfig,
};
use opcpub_proto::MessageEncoding;
use opcpub_sink::WriterGroupConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Publisher identifier, used in topics and network messages
    pub publisher_id: String,

    /// MQTT configuration
    pub mqtt: MqttConfig,

    /// Persistence configuration
    pub persistence: PersistenceConfig,

    /// Device transport configuration
    pub transport: TransportConfig,

    /// Session pool limits
    pub session_pool: SessionPoolConfig,

    /// Subscription defaults
    pub subscriptions: SubscriptionClientConfig,

    /// Writer group batching and encoding
    pub writer_group: WriterGroupConfig,

    /// Discovery scheduler limits
    pub scheduler: TaskSchedulerConfig,

    /// Event broker settings
    pub broker: EventBrokerConfig,

    /// Nodes to publish
    pub published_nodes: Vec<PublishedNodesEntry>,
}

/// MQTT configuration.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker URL (`tcp://host:port`, `mqtt://host:port` or `host:port`)
    pub broker: String,

    /// Client id (defaults to `opcpub-{publisher_id}`)
    pub client_id: Option<String>,

    /// Forward broker events to MQTT
    pub publish_events: bool,
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Persistence type: "sqlite" or "memory"
    pub store_type: String,

    /// Database path (for `SQLite`)
    pub db_path: PathBuf,
}

/// Device transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Transport type; only "simulated" ships with the agent
    pub transport_type: String,

    /// Fastest publishing interval the simulated device honors
    pub min_publishing_interval: Duration,

    /// Simulated event items fire every this many publishing cycles
    pub event_every: u32,
}

/// One endpoint with the nodes published from it.
#[derive(Debug, Clone, Deserialize)]
pub struct PublishedNodesEntry {
    /// Endpoint to connect to
    #[serde(flatten)]
    pub endpoint: EndpointDescriptor,

    /// Writer name; also the subscription name
    pub writer_name: String,

    /// Writer id within the group (assigned in order when absent)
    #[serde(default)]
    pub writer_id: Option<u16>,

    /// Dataset name (defaults to the writer name)
    #[serde(default)]
    pub dataset_name: Option<String>,

    /// Publishing interval in milliseconds
    #[serde(default)]
    pub publishing_interval: Option<u64>,

    /// Monitored nodes
    pub nodes: Vec<MonitoredItemSpec>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            publisher_id: "opcpub".to_string(),
            mqtt: MqttConfig {
                broker: "tcp://localhost:1883".to_string(),
                client_id: None,
                publish_events: true,
            },
            persistence: PersistenceConfig {
                store_type: "sqlite".to_string(),
                db_path: PathBuf::from("./opcpub.db"),
            },
            transport: TransportConfig {
                transport_type: "simulated".to_string(),
                min_publishing_interval: Duration::from_millis(100),
                event_every: 5,
            },
            session_pool: SessionPoolConfig::default(),
            subscriptions: SubscriptionClientConfig::default(),
            writer_group: WriterGroupConfig::default(),
            scheduler: TaskSchedulerConfig::default(),
            broker: EventBrokerConfig::default(),
            published_nodes: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `OPCPUB_PUBLISHER_ID`: Publisher identifier
    /// - `OPCPUB_MQTT_BROKER`: MQTT broker URL
    /// - `OPCPUB_MQTT_CLIENT_ID`: MQTT client id
    /// - `OPCPUB_PUBLISH_EVENTS`: Forward events to MQTT (`true`/`false`)
    /// - `OPCPUB_STORE_TYPE`: "sqlite" or "memory"
    /// - `OPCPUB_DB_PATH`: `SQLite` database path
    /// - `OPCPUB_TRANSPORT`: Device transport ("simulated")
    /// - `OPCPUB_SIM_MIN_INTERVAL_MS`: Fastest simulated publishing interval
    /// - `OPCPUB_MAX_SESSIONS`: Session quota
    /// - `OPCPUB_GROUP_ID`: Writer group id
    /// - `OPCPUB_MESSAGE_ENCODING`: "json" or "binary"
    /// - `OPCPUB_BATCH_SIZE`: Datasets per flush
    /// - `OPCPUB_BATCHING_INTERVAL_MS`: Flush interval
    /// - `OPCPUB_MAX_MESSAGE_SIZE`: Max network message size in bytes
    /// - `OPCPUB_QUEUE_CAPACITY`: Writer group queue capacity
    /// - `OPCPUB_DISCOVERY_QUEUE`: Discovery queue size
    /// - `OPCPUB_DISCOVERY_WORKERS`: Concurrent discovery requests
    /// - `OPCPUB_PUBLISHED_NODES`: JSON array of published node entries
    ///
    /// # Errors
    ///
    /// Returns error if a variable is present but malformed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(id) = lookup("OPCPUB_PUBLISHER_ID") {
            config.publisher_id = id;
        }

        if let Some(broker) = lookup("OPCPUB_MQTT_BROKER") {
            config.mqtt.broker = broker;
        }

        if let Some(client_id) = lookup("OPCPUB_MQTT_CLIENT_ID") {
            config.mqtt.client_id = Some(client_id);
        }

        if let Some(flag) = parsed::<bool>(&lookup, "OPCPUB_PUBLISH_EVENTS")? {
            config.mqtt.publish_events = flag;
        }

        if let Some(store_type) = lookup("OPCPUB_STORE_TYPE") {
            config.persistence.store_type = store_type;
        }

        if let Some(db_path) = lookup("OPCPUB_DB_PATH") {
            config.persistence.db_path = PathBuf::from(db_path);
        }

        if let Some(transport) = lookup("OPCPUB_TRANSPORT") {
            config.transport.transport_type = transport;
        }

        if let Some(ms) = parsed::<u64>(&lookup, "OPCPUB_SIM_MIN_INTERVAL_MS")? {
            config.transport.min_publishing_interval = Duration::from_millis(ms);
        }

        if let Some(max) = parsed(&lookup, "OPCPUB_MAX_SESSIONS")? {
            config.session_pool.max_sessions = max;
        }

        config.writer_group.publisher_id.clone_from(&config.publisher_id);

        if let Some(group_id) = lookup("OPCPUB_GROUP_ID") {
            config.writer_group.group_id = group_id;
        }

        if let Some(encoding) = lookup("OPCPUB_MESSAGE_ENCODING") {
            config.writer_group.encoding = match encoding.to_ascii_lowercase().as_str() {
                "json" => MessageEncoding::Json,
                "binary" | "cbor" => MessageEncoding::Binary,
                other => anyhow::bail!("Invalid OPCPUB_MESSAGE_ENCODING '{other}'"),
            };
        }

        if let Some(size) = parsed(&lookup, "OPCPUB_BATCH_SIZE")? {
            config.writer_group.batch_size = size;
        }

        if let Some(ms) = parsed::<u64>(&lookup, "OPCPUB_BATCHING_INTERVAL_MS")? {
            config.writer_group.batching_interval = Duration::from_millis(ms);
        }

        if let Some(size) = parsed(&lookup, "OPCPUB_MAX_MESSAGE_SIZE")? {
            config.writer_group.max_network_message_size = size;
        }

        if let Some(capacity) = parsed(&lookup, "OPCPUB_QUEUE_CAPACITY")? {
            config.writer_group.queue_capacity = capacity;
        }

        if let Some(queue) = parsed(&lookup, "OPCPUB_DISCOVERY_QUEUE")? {
            config.scheduler.max_queue_size = queue;
        }

        if let Some(workers) = parsed(&lookup, "OPCPUB_DISCOVERY_WORKERS")? {
            config.scheduler.max_instances = workers;
        }

        // Parse published nodes from JSON env var
        if let Some(nodes_json) = lookup("OPCPUB_PUBLISHED_NODES") {
            config.published_nodes = serde_json::from_str(&nodes_json)
                .context("Invalid OPCPUB_PUBLISHED_NODES JSON")?;
        }

        Ok(config)
    }

    /// MQTT client id.
    #[must_use]
    pub fn client_id(&self) -> String {
        self.mqtt
            .client_id
            .clone()
            .unwrap_or_else(|| format!("opcpub-{}", self.publisher_id))
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| raw.trim().parse::<T>().with_context(|| format!("Invalid {key}")))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use opcpub_core::{ItemKind, SecurityMode};
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = AgentConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.publisher_id, "opcpub");
        assert_eq!(config.session_pool.max_sessions, 100);
        assert_eq!(config.writer_group.batch_size, 50);
        assert_eq!(config.scheduler.max_queue_size, 10);
        assert_eq!(config.client_id(), "opcpub-opcpub");
        assert!(config.published_nodes.is_empty());
    }

    #[test]
    fn overrides_and_published_nodes() {
        let nodes = r#"[{
            "url": "opc.tcp://plc-1:4840",
            "security_mode": "sign_and_encrypt",
            "writer_name": "line-1",
            "publishing_interval": 250,
            "nodes": [
                {"item_id": "ns=2;s=T1", "field_name": "T1", "kind": "variable"},
                {"item_id": "ns=2;s=Alarms", "kind": "event", "fields": ["Severity", "Message"]}
            ]
        }]"#;
        let config = AgentConfig::from_lookup(lookup(&[
            ("OPCPUB_PUBLISHER_ID", "edge-7"),
            ("OPCPUB_MESSAGE_ENCODING", "binary"),
            ("OPCPUB_BATCH_SIZE", "10"),
            ("OPCPUB_BATCHING_INTERVAL_MS", "100"),
            ("OPCPUB_PUBLISHED_NODES", nodes),
        ]))
        .unwrap();

        assert_eq!(config.writer_group.publisher_id, "edge-7");
        assert_eq!(config.writer_group.encoding, MessageEncoding::Binary);
        assert_eq!(config.writer_group.batch_size, 10);
        assert_eq!(config.writer_group.batching_interval, Duration::from_millis(100));

        let entry = &config.published_nodes[0];
        assert_eq!(entry.endpoint.url, "opc.tcp://plc-1:4840");
        assert_eq!(entry.endpoint.security_mode, SecurityMode::SignAndEncrypt);
        assert_eq!(entry.publishing_interval, Some(250));
        assert_eq!(entry.nodes.len(), 2);
        assert!(matches!(&entry.nodes[1].kind, ItemKind::Event { fields } if fields.len() == 2));
    }

    #[test]
    fn malformed_values_are_errors() {
        assert!(AgentConfig::from_lookup(lookup(&[("OPCPUB_BATCH_SIZE", "lots")])).is_err());
        assert!(AgentConfig::from_lookup(lookup(&[("OPCPUB_MESSAGE_ENCODING", "xml")])).is_err());
        assert!(AgentConfig::from_lookup(lookup(&[("OPCPUB_PUBLISHED_NODES", "{")])).is_err());
    }
}
