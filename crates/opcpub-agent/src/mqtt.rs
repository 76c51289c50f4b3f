//! MQTT transport for network messages, events and discovery requests.

use async_trait::async_trait;
use opcpub_core::{CoreError, CoreResult, EventEnvelope, EventHandler, EventKind};
use opcpub_proto::TopicScheme;
use opcpub_sink::{MessageSink, OutboundMessage, SinkError};
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Publishes writer group output to an MQTT broker.
#[derive(Clone)]
pub struct MqttMessageSink {
    client: AsyncClient,
    topics: TopicScheme,
}

impl MqttMessageSink {
    /// Create the client. The returned event loop must be polled by the caller.
    ///
    /// # Errors
    ///
    /// Returns error if the broker URL is invalid.
    pub fn connect(
        mqtt_broker: &str,
        client_id: &str,
        topics: TopicScheme,
    ) -> Result<(Self, EventLoop), MqttError> {
        let (host, port) = parse_mqtt_url(mqtt_broker)?;

        let mut mqtt_options = MqttOptions::new(client_id, host, port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);

        Ok((Self { client, topics }, eventloop))
    }

    /// Topic scheme in use.
    #[must_use]
    pub fn topics(&self) -> &TopicScheme {
        &self.topics
    }

    /// Subscribe to discovery requests addressed to this publisher.
    ///
    /// # Errors
    ///
    /// Returns error if subscription fails.
    pub async fn subscribe_discovery(&self) -> Result<(), MqttError> {
        let topic = self.topics.discovery_request();

        tracing::info!(topic, "Subscribing to discovery requests");

        self.client
            .subscribe(&topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| MqttError::Subscribe(e.to_string()))?;

        Ok(())
    }

    /// Event handler that forwards broker events to this connection.
    #[must_use]
    pub fn event_forwarder(&self) -> Arc<MqttEventForwarder> {
        Arc::new(MqttEventForwarder {
            client: self.client.clone(),
            topics: self.topics.clone(),
        })
    }

    /// Disconnect from the broker.
    pub async fn disconnect(&self) {
        if let Err(err) = self.client.disconnect().await {
            tracing::debug!(error = %err, "MQTT disconnect failed");
        }
    }
}

#[async_trait]
impl MessageSink for MqttMessageSink {
    async fn publish(&self, message: OutboundMessage) -> Result<(), SinkError> {
        let topic = self.topics.data(&message.group_id);

        tracing::debug!(
            topic,
            message_id = %message.message_id,
            payload_len = message.payload.len(),
            "Publishing network message"
        );

        self.client
            .publish(&topic, QoS::AtLeastOnce, false, message.payload)
            .await
            .map_err(|e| SinkError::Publish(e.to_string()))
    }
}

/// Publishes broker events as JSON under the event topics.
pub struct MqttEventForwarder {
    client: AsyncClient,
    topics: TopicScheme,
}

#[async_trait]
impl EventHandler for MqttEventForwarder {
    async fn handle(&self, envelope: Arc<EventEnvelope>) -> CoreResult<()> {
        let topic = self.topics.event(event_topic(envelope.event.kind()));
        let payload = serde_json::to_vec(envelope.as_ref())
            .map_err(|e| CoreError::Protocol(format!("event serialization failed: {e}")))?;

        self.client
            .publish(&topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| CoreError::Transient(format!("MQTT publish failed: {e}")))
    }
}

/// Topic segment used for events of `kind`.
#[must_use]
pub fn event_topic(kind: EventKind) -> &'static str {
    match kind {
        EventKind::EndpointStateChanged => "endpoint_state_changed",
        EventKind::WriterStateChanged => "writer_state_changed",
        EventKind::DiscoveryProgress => "discovery_progress",
        EventKind::ApplicationRegistered => "application_registered",
        EventKind::TwinUpdated => "twin_updated",
    }
}

/// Parse MQTT URL into host and port.
///
/// Accepts `tcp://host:port`, `mqtt://host:port` and bare `host[:port]`; the
/// port defaults to 1883.
///
/// # Errors
///
/// Returns error for unsupported schemes, a missing host or a bad port.
pub fn parse_mqtt_url(input: &str) -> Result<(String, u16), MqttError> {
    if input.contains("://") {
        let url =
            Url::parse(input).map_err(|e| MqttError::InvalidBrokerUrl(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => {
                return Err(MqttError::InvalidBrokerUrl(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        }

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| MqttError::InvalidBrokerUrl(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(1883);

        return Ok((host.to_string(), port));
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| MqttError::InvalidBrokerUrl(format!("{input}: missing host")))?;
    let port = match parts.next() {
        None => 1883,
        Some(port) => port.parse().map_err(|_| {
            MqttError::InvalidBrokerUrl(format!("{input}: invalid port '{port}'"))
        })?,
    };
    if parts.next().is_some() {
        return Err(MqttError::InvalidBrokerUrl(format!(
            "{input}: too many ':' separators"
        )));
    }

    Ok((host.to_string(), port))
}

/// Errors for MQTT operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MqttError {
    /// Subscription failed
    #[error("subscription error: {0}")]
    Subscribe(String),
    /// Invalid MQTT broker URL
    #[error("invalid MQTT broker URL: {0}")]
    InvalidBrokerUrl(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_url_forms() {
        assert_eq!(
            parse_mqtt_url("tcp://broker:1884").unwrap(),
            ("broker".to_string(), 1884)
        );
        assert_eq!(
            parse_mqtt_url("mqtt://broker").unwrap(),
            ("broker".to_string(), 1883)
        );
        assert_eq!(
            parse_mqtt_url("localhost:1883").unwrap(),
            ("localhost".to_string(), 1883)
        );
        assert_eq!(
            parse_mqtt_url("localhost").unwrap(),
            ("localhost".to_string(), 1883)
        );
    }

    #[test]
    fn broker_url_errors() {
        assert!(matches!(
            parse_mqtt_url("ws://broker:80"),
            Err(MqttError::InvalidBrokerUrl(_))
        ));
        assert!(parse_mqtt_url(":1883").is_err());
        assert!(parse_mqtt_url("broker:port").is_err());
        assert!(parse_mqtt_url("a:1:2").is_err());
    }

    #[test]
    fn event_topics_match_serde_names() {
        for kind in [
            EventKind::EndpointStateChanged,
            EventKind::WriterStateChanged,
            EventKind::DiscoveryProgress,
            EventKind::ApplicationRegistered,
            EventKind::TwinUpdated,
        ] {
            assert_eq!(
                serde_json::to_value(kind).unwrap(),
                serde_json::Value::String(event_topic(kind).to_string())
            );
        }
    }

    #[tokio::test]
    async fn connect_builds_client_without_io() {
        let (sink, _eventloop) =
            MqttMessageSink::connect("tcp://localhost:1883", "test", TopicScheme::new("edge"))
                .unwrap();
        assert_eq!(sink.topics().data("g"), "opcpub/v1/edge/g/data");
    }
}
