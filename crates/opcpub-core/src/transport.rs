//! Device transport seam.
//!
//! The transport owns the wire protocol. The core only sees an async RPC
//! surface keyed by opaque connection handles.

use crate::endpoint::EndpointDescriptor;
use crate::error::CoreResult;
use crate::message::{DataValue, StatusCode};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;

/// Opaque handle of an established device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Parameters for establishing a connection.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Session timeout requested by the client (already clamped)
    pub requested_timeout: Duration,
    /// Client nonce
    pub client_nonce: Vec<u8>,
}

/// Result of a successful connect.
#[derive(Debug, Clone)]
pub struct ConnectResponse {
    /// Connection handle
    pub connection: ConnectionId,
    /// Timeout revised by the server
    pub revised_timeout: Duration,
    /// Server nonce
    pub server_nonce: Vec<u8>,
}

/// Subscription parameters sent to the device.
#[derive(Debug, Clone)]
pub struct ServerSubscriptionRequest {
    /// Requested publishing interval
    pub publishing_interval: Duration,
}

/// What a monitored item observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitoredTarget {
    /// A variable's value attribute
    Variable,
    /// An event notifier, selecting the given fields
    Event {
        /// Selected event field names
        fields: Vec<String>,
    },
}

/// One monitored item to create on the device.
#[derive(Debug, Clone)]
pub struct MonitoredItemRequest {
    /// Client handle used in notifications
    pub client_handle: u32,
    /// Node identifier
    pub node_id: String,
    /// What to observe
    pub target: MonitoredTarget,
    /// Sampling interval
    pub sampling_interval: Duration,
    /// Server-side queue size
    pub queue_size: u32,
}

/// One value in a data-change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceValue {
    /// Client handle of the item
    pub client_handle: u32,
    /// Value
    pub value: DataValue,
    /// Status
    pub status: StatusCode,
    /// Source timestamp
    pub source_timestamp: Option<DateTime<Utc>>,
    /// Server timestamp
    pub server_timestamp: Option<DateTime<Utc>>,
}

/// Notification pushed by the device for one subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceNotification {
    /// Value changes
    DataChange {
        /// Publish sequence number
        sequence: u32,
        /// Changed values in device order
        values: Vec<DeviceValue>,
    },
    /// One event occurrence
    Event {
        /// Publish sequence number
        sequence: u32,
        /// Client handle of the event item
        client_handle: u32,
        /// Event fields in selection order
        fields: Vec<(String, DataValue)>,
    },
    /// Status change of a single monitored item
    ItemStatus {
        /// Client handle of the item
        client_handle: u32,
        /// New status
        status: StatusCode,
        /// Diagnostic text
        message: Option<String>,
    },
}

/// Async RPC surface of the industrial device protocol.
#[async_trait]
pub trait DeviceTransport: Send + Sync + 'static {
    /// Open and activate a connection to the endpoint.
    async fn connect(
        &self,
        endpoint: &EndpointDescriptor,
        request: &ConnectRequest,
    ) -> CoreResult<ConnectResponse>;

    /// Probe a connection; transient errors trigger a reconnect.
    async fn keep_alive(&self, connection: ConnectionId) -> CoreResult<()>;

    /// Close a connection.
    async fn close(&self, connection: ConnectionId) -> CoreResult<()>;

    /// Create a subscription; notifications are pushed into `notifications`.
    async fn create_subscription(
        &self,
        connection: ConnectionId,
        request: &ServerSubscriptionRequest,
        notifications: mpsc::Sender<DeviceNotification>,
    ) -> CoreResult<u32>;

    /// Delete a subscription.
    async fn delete_subscription(&self, connection: ConnectionId, subscription: u32)
        -> CoreResult<()>;

    /// Create monitored items; one result per request, in request order.
    async fn create_monitored_items(
        &self,
        connection: ConnectionId,
        subscription: u32,
        items: &[MonitoredItemRequest],
    ) -> CoreResult<Vec<Result<u32, String>>>;

    /// Delete monitored items by server id.
    async fn delete_monitored_items(
        &self,
        connection: ConnectionId,
        subscription: u32,
        items: &[u32],
    ) -> CoreResult<()>;

    /// Discover the endpoints offered at a discovery URL.
    async fn find_endpoints(&self, discovery_url: &str) -> CoreResult<Vec<EndpointDescriptor>>;
}
