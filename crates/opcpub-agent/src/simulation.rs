//! Simulated device transport.
//!
//! Produces synthetic values so the agent runs without a device. Each
//! subscription gets a task that publishes every variable item on each
//! publishing cycle and fires event items every `event_every` cycles.

use async_trait::async_trait;
use chrono::Utc;
use opcpub_core::transport::{
    ConnectRequest, ConnectResponse, ConnectionId, DeviceNotification, DeviceValue,
    MonitoredItemRequest, MonitoredTarget, ServerSubscriptionRequest,
};
use opcpub_core::{
    CoreError, CoreResult, DataValue, DeviceTransport, EndpointDescriptor, SecurityMode,
    StatusCode,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Simulated transport configuration.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Fastest publishing interval honored
    pub min_publishing_interval: Duration,
    /// Event items fire every this many publishing cycles
    pub event_every: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            min_publishing_interval: Duration::from_millis(100),
            event_every: 5,
        }
    }
}

type ItemTable = Arc<Mutex<Vec<(u32, MonitoredItemRequest)>>>;

struct SimConnection {
    url: String,
    cancel: CancellationToken,
}

struct SimSubscription {
    connection: ConnectionId,
    items: ItemTable,
    cancel: CancellationToken,
}

#[derive(Default)]
struct SimState {
    connections: HashMap<ConnectionId, SimConnection>,
    subscriptions: HashMap<u32, SimSubscription>,
}

/// In-process stand-in for an industrial device.
pub struct SimulatedTransport {
    config: SimulationConfig,
    next_connection: AtomicU64,
    next_subscription: AtomicU32,
    next_item: AtomicU32,
    state: Mutex<SimState>,
    unreachable: Mutex<HashSet<String>>,
    unknown_nodes: Mutex<HashSet<String>>,
}

impl SimulatedTransport {
    /// Create a transport.
    #[must_use]
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            next_connection: AtomicU64::new(0),
            next_subscription: AtomicU32::new(0),
            next_item: AtomicU32::new(0),
            state: Mutex::new(SimState::default()),
            unreachable: Mutex::new(HashSet::new()),
            unknown_nodes: Mutex::new(HashSet::new()),
        }
    }

    /// Make `url` refuse connections and keep-alives.
    pub fn set_unreachable(&self, url: &str, unreachable: bool) {
        let url = normalize(url);
        let mut set = self.unreachable.lock();
        if unreachable {
            set.insert(url);
        } else {
            set.remove(&url);
        }
    }

    /// Make monitored item creation for `node_id` fail.
    pub fn add_unknown_node(&self, node_id: impl Into<String>) {
        self.unknown_nodes.lock().insert(node_id.into());
    }

    /// Drop every connection to `url` as if the network failed.
    ///
    /// Returns the number of dropped connections.
    pub fn drop_connections(&self, url: &str) -> usize {
        let url = normalize(url);
        let mut state = self.state.lock();
        let dropped: Vec<ConnectionId> = state
            .connections
            .iter()
            .filter(|(_, conn)| conn.url == url)
            .map(|(id, _)| *id)
            .collect();
        for id in &dropped {
            if let Some(conn) = state.connections.remove(id) {
                conn.cancel.cancel();
            }
        }
        state
            .subscriptions
            .retain(|_, sub| !dropped.contains(&sub.connection));
        if !dropped.is_empty() {
            tracing::info!(url = %url, connections = dropped.len(), "Simulated connection loss");
        }
        dropped.len()
    }

    /// Number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    fn is_unreachable(&self, url: &str) -> bool {
        self.unreachable.lock().contains(&normalize(url))
    }

    fn connection_token(&self, connection: ConnectionId) -> CoreResult<CancellationToken> {
        self.state
            .lock()
            .connections
            .get(&connection)
            .map(|conn| conn.cancel.clone())
            .ok_or_else(|| CoreError::Transient(format!("connection {} lost", connection.0)))
    }

    fn subscription_items(
        &self,
        connection: ConnectionId,
        subscription: u32,
    ) -> CoreResult<ItemTable> {
        self.state
            .lock()
            .subscriptions
            .get(&subscription)
            .filter(|sub| sub.connection == connection)
            .map(|sub| Arc::clone(&sub.items))
            .ok_or_else(|| CoreError::NotFound(format!("subscription {subscription}")))
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new(SimulationConfig::default())
    }
}

fn normalize(url: &str) -> String {
    url.trim_end_matches('/').to_ascii_lowercase()
}

#[async_trait]
impl DeviceTransport for SimulatedTransport {
    async fn connect(
        &self,
        endpoint: &EndpointDescriptor,
        request: &ConnectRequest,
    ) -> CoreResult<ConnectResponse> {
        if self.is_unreachable(&endpoint.url) {
            return Err(CoreError::Transient(format!("{} did not answer", endpoint.url)));
        }
        let connection = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed) + 1);
        self.state.lock().connections.insert(
            connection,
            SimConnection {
                url: normalize(&endpoint.url),
                cancel: CancellationToken::new(),
            },
        );
        tracing::debug!(url = %endpoint.url, connection = connection.0, "Simulated connect");
        Ok(ConnectResponse {
            connection,
            revised_timeout: request.requested_timeout,
            server_nonce: uuid::Uuid::new_v4().as_bytes().repeat(2),
        })
    }

    async fn keep_alive(&self, connection: ConnectionId) -> CoreResult<()> {
        let url = self
            .state
            .lock()
            .connections
            .get(&connection)
            .map(|conn| conn.url.clone())
            .ok_or_else(|| CoreError::Transient(format!("connection {} lost", connection.0)))?;
        if self.is_unreachable(&url) {
            return Err(CoreError::Transient(format!("{url} did not answer")));
        }
        Ok(())
    }

    async fn close(&self, connection: ConnectionId) -> CoreResult<()> {
        let mut state = self.state.lock();
        if let Some(conn) = state.connections.remove(&connection) {
            conn.cancel.cancel();
        }
        state
            .subscriptions
            .retain(|_, sub| sub.connection != connection);
        Ok(())
    }

    async fn create_subscription(
        &self,
        connection: ConnectionId,
        request: &ServerSubscriptionRequest,
        notifications: mpsc::Sender<DeviceNotification>,
    ) -> CoreResult<u32> {
        let cancel = self.connection_token(connection)?.child_token();
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed) + 1;
        let items: ItemTable = Arc::new(Mutex::new(Vec::new()));
        let period = request
            .publishing_interval
            .max(self.config.min_publishing_interval);

        self.state.lock().subscriptions.insert(
            id,
            SimSubscription {
                connection,
                items: Arc::clone(&items),
                cancel: cancel.clone(),
            },
        );
        tokio::spawn(publish_loop(
            items,
            period,
            self.config.event_every.max(1),
            notifications,
            cancel,
        ));
        Ok(id)
    }

    async fn delete_subscription(
        &self,
        _connection: ConnectionId,
        subscription: u32,
    ) -> CoreResult<()> {
        if let Some(sub) = self.state.lock().subscriptions.remove(&subscription) {
            sub.cancel.cancel();
        }
        Ok(())
    }

    async fn create_monitored_items(
        &self,
        connection: ConnectionId,
        subscription: u32,
        items: &[MonitoredItemRequest],
    ) -> CoreResult<Vec<Result<u32, String>>> {
        let table = self.subscription_items(connection, subscription)?;
        let unknown = self.unknown_nodes.lock().clone();
        let mut table = table.lock();
        Ok(items
            .iter()
            .map(|item| {
                if unknown.contains(&item.node_id) {
                    return Err(format!("BadNodeIdUnknown: {}", item.node_id));
                }
                let server_id = self.next_item.fetch_add(1, Ordering::Relaxed) + 1;
                table.push((server_id, item.clone()));
                Ok(server_id)
            })
            .collect())
    }

    async fn delete_monitored_items(
        &self,
        connection: ConnectionId,
        subscription: u32,
        items: &[u32],
    ) -> CoreResult<()> {
        let table = self.subscription_items(connection, subscription)?;
        table.lock().retain(|(server_id, _)| !items.contains(server_id));
        Ok(())
    }

    async fn find_endpoints(&self, discovery_url: &str) -> CoreResult<Vec<EndpointDescriptor>> {
        if self.is_unreachable(discovery_url) {
            return Err(CoreError::NotReachable {
                endpoint: discovery_url.to_string(),
                attempts: 1,
            });
        }
        let host = url::Url::parse(discovery_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| discovery_url.to_string());
        let application_uri = format!("urn:{host}:simulated");

        let mut plain = EndpointDescriptor::new(discovery_url);
        plain.application_uri = Some(application_uri.clone());
        let mut secured = EndpointDescriptor::new(discovery_url)
            .with_security(SecurityMode::SignAndEncrypt, "Basic256Sha256");
        secured.application_uri = Some(application_uri);
        Ok(vec![plain, secured])
    }
}

async fn publish_loop(
    items: ItemTable,
    period: Duration,
    event_every: u32,
    notifications: mpsc::Sender<DeviceNotification>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sequence: u32 = 0;
    let mut cycle: u32 = 0;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let snapshot: Vec<MonitoredItemRequest> =
            items.lock().iter().map(|(_, item)| item.clone()).collect();
        let now = Utc::now();
        let mut outgoing = Vec::new();

        let values: Vec<DeviceValue> = snapshot
            .iter()
            .filter(|item| item.target == MonitoredTarget::Variable)
            .map(|item| DeviceValue {
                client_handle: item.client_handle,
                value: sample(item.client_handle, cycle),
                status: StatusCode::GOOD,
                source_timestamp: Some(now),
                server_timestamp: Some(now),
            })
            .collect();
        if !values.is_empty() {
            sequence = sequence.wrapping_add(1);
            outgoing.push(DeviceNotification::DataChange { sequence, values });
        }

        if cycle % event_every == event_every - 1 {
            for item in &snapshot {
                if let MonitoredTarget::Event { fields } = &item.target {
                    sequence = sequence.wrapping_add(1);
                    outgoing.push(DeviceNotification::Event {
                        sequence,
                        client_handle: item.client_handle,
                        fields: fields
                            .iter()
                            .map(|field| (field.clone(), event_field(field, cycle, now)))
                            .collect(),
                    });
                }
            }
        }

        for notification in outgoing {
            tokio::select! {
                () = cancel.cancelled() => return,
                sent = notifications.send(notification) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
        cycle = cycle.wrapping_add(1);
    }
}

fn sample(client_handle: u32, cycle: u32) -> DataValue {
    let phase = f64::from(cycle) * 0.1 + f64::from(client_handle);
    DataValue::Double(20.0 + 5.0 * phase.sin())
}

fn event_field(field: &str, cycle: u32, now: chrono::DateTime<Utc>) -> DataValue {
    match field {
        "Severity" => DataValue::UInt64(500),
        "Time" | "ReceiveTime" => DataValue::DateTime(now),
        "Message" => DataValue::String(format!("Simulated event {cycle}")),
        other => DataValue::String(format!("{other}-{cycle}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_request() -> ConnectRequest {
        ConnectRequest {
            requested_timeout: Duration::from_secs(60),
            client_nonce: vec![1; 32],
        }
    }

    fn variable(handle: u32, node: &str) -> MonitoredItemRequest {
        MonitoredItemRequest {
            client_handle: handle,
            node_id: node.to_string(),
            target: MonitoredTarget::Variable,
            sampling_interval: Duration::from_millis(100),
            queue_size: 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_values_and_events() {
        let transport = SimulatedTransport::new(SimulationConfig {
            min_publishing_interval: Duration::from_millis(10),
            event_every: 2,
        });
        let endpoint = EndpointDescriptor::new("opc.tcp://sim:4840");
        let connection = transport
            .connect(&endpoint, &connect_request())
            .await
            .unwrap()
            .connection;

        let (tx, mut rx) = mpsc::channel(16);
        let request = ServerSubscriptionRequest {
            publishing_interval: Duration::from_millis(100),
        };
        let sub = transport
            .create_subscription(connection, &request, tx)
            .await
            .unwrap();
        let results = transport
            .create_monitored_items(
                connection,
                sub,
                &[
                    variable(1, "ns=2;s=T1"),
                    MonitoredItemRequest {
                        target: MonitoredTarget::Event {
                            fields: vec!["Severity".into(), "Message".into()],
                        },
                        ..variable(2, "ns=2;s=Alarms")
                    },
                ],
            )
            .await
            .unwrap();
        assert!(results.iter().all(Result::is_ok));

        let mut data_changes = 0;
        let mut events = 0;
        while events == 0 {
            match rx.recv().await.unwrap() {
                DeviceNotification::DataChange { values, .. } => {
                    assert_eq!(values.len(), 1);
                    assert_eq!(values[0].client_handle, 1);
                    data_changes += 1;
                }
                DeviceNotification::Event {
                    client_handle,
                    fields,
                    ..
                } => {
                    assert_eq!(client_handle, 2);
                    assert_eq!(fields[0], ("Severity".to_string(), DataValue::UInt64(500)));
                    events += 1;
                }
                DeviceNotification::ItemStatus { .. } => unreachable!(),
            }
        }
        assert!(data_changes >= 1);
    }

    #[tokio::test]
    async fn unknown_nodes_fail_individually() {
        let transport = SimulatedTransport::default();
        transport.add_unknown_node("ns=2;s=Missing");
        let endpoint = EndpointDescriptor::new("opc.tcp://sim:4840");
        let connection = transport
            .connect(&endpoint, &connect_request())
            .await
            .unwrap()
            .connection;
        let (tx, _rx) = mpsc::channel(4);
        let sub = transport
            .create_subscription(
                connection,
                &ServerSubscriptionRequest {
                    publishing_interval: Duration::from_secs(1),
                },
                tx,
            )
            .await
            .unwrap();

        let results = transport
            .create_monitored_items(
                connection,
                sub,
                &[variable(1, "ns=2;s=T1"), variable(2, "ns=2;s=Missing")],
            )
            .await
            .unwrap();
        assert!(results[0].is_ok());
        assert!(results[1].as_ref().unwrap_err().contains("BadNodeIdUnknown"));
    }

    #[tokio::test]
    async fn dropped_connections_fail_keep_alive() {
        let transport = SimulatedTransport::default();
        let endpoint = EndpointDescriptor::new("opc.tcp://sim:4840/");
        let connection = transport
            .connect(&endpoint, &connect_request())
            .await
            .unwrap()
            .connection;
        assert!(transport.keep_alive(connection).await.is_ok());

        assert_eq!(transport.drop_connections("opc.tcp://SIM:4840"), 1);
        let err = transport.keep_alive(connection).await.unwrap_err();
        assert!(err.is_transient_connect_failure());

        transport.set_unreachable("opc.tcp://sim:4840", true);
        assert!(transport.connect(&endpoint, &connect_request()).await.is_err());
        transport.set_unreachable("opc.tcp://sim:4840", false);
        assert!(transport.connect(&endpoint, &connect_request()).await.is_ok());
    }

    #[tokio::test]
    async fn find_endpoints_offers_plain_and_secured() {
        let transport = SimulatedTransport::default();
        let endpoints = transport
            .find_endpoints("opc.tcp://plc-9:4840")
            .await
            .unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[1].security_mode, SecurityMode::SignAndEncrypt);
        assert_eq!(
            endpoints[0].application_uri.as_deref(),
            Some("urn:plc-9:simulated")
        );

        transport.set_unreachable("opc.tcp://plc-9:4840", true);
        assert!(transport.find_endpoints("opc.tcp://plc-9:4840").await.is_err());
    }
}
