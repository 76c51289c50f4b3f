//! Notification and dataset message model.

use crate::error::CoreResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;

/// A sampled value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataValue {
    /// No value
    Null,
    /// Boolean
    Boolean(bool),
    /// Signed integer
    Int64(i64),
    /// Unsigned integer
    UInt64(u64),
    /// Floating point
    Double(f64),
    /// String
    String(String),
    /// Opaque bytes
    Bytes(Vec<u8>),
    /// Timestamp
    DateTime(DateTime<Utc>),
    /// Structured value already rendered as JSON
    Json(serde_json::Value),
}

impl From<f64> for DataValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<i64> for DataValue {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<bool> for DataValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<&str> for DataValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

/// Device status code; the top two bits carry the severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StatusCode(pub u32);

impl StatusCode {
    /// Operation succeeded
    pub const GOOD: Self = Self(0);
    /// Value is uncertain
    pub const UNCERTAIN: Self = Self(0x4000_0000);
    /// Generic bad status
    pub const BAD: Self = Self(0x8000_0000);
    /// Node does not exist on the device
    pub const BAD_NODE_ID_UNKNOWN: Self = Self(0x8034_0000);
    /// Communication with the device failed
    pub const BAD_COMMUNICATION_ERROR: Self = Self(0x8005_0000);

    /// Returns `true` if the severity is good.
    #[inline]
    #[must_use]
    pub fn is_good(self) -> bool {
        self.0 & 0xC000_0000 == 0
    }

    /// Returns `true` if the severity is bad.
    #[inline]
    #[must_use]
    pub fn is_bad(self) -> bool {
        self.0 & 0x8000_0000 != 0
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// One item's value change or event field inside a notification batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemNotification {
    /// Monitored item identifier (node id)
    pub item_id: String,
    /// Field name used in the published dataset
    pub field_name: String,
    /// New value
    pub value: DataValue,
    /// Status of the value
    pub status: StatusCode,
    /// Timestamp assigned by the data source
    pub source_timestamp: Option<DateTime<Utc>>,
    /// Timestamp assigned by the server
    pub server_timestamp: Option<DateTime<Utc>>,
}

/// What a notification batch carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    /// Value changes of variables
    DataChange,
    /// Fields of one event occurrence
    Event,
}

/// Notifications received from the device in one publish response.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationBatch {
    /// Subscription name
    pub subscription: String,
    /// Endpoint the subscription lives on
    pub endpoint_url: String,
    /// Device-side sequence number of the publish response
    pub sequence: u32,
    /// Batch kind
    pub kind: NotificationKind,
    /// Notifications in device order
    pub items: Vec<ItemNotification>,
    /// When the batch was received
    pub received_at: DateTime<Utc>,
}

/// Kind of dataset message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSetMessageKind {
    /// Full snapshot of the dataset
    KeyFrame,
    /// Only changed fields
    DeltaFrame,
    /// Event fields
    Event,
}

/// A message produced by one dataset writer from one notification batch.
///
/// Immutable once created; ownership moves from stage to stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSetWriterMessage {
    /// Writer-assigned sequence number, strictly increasing
    pub sequence_number: u64,
    /// Writer identifier within its group
    pub writer_id: u16,
    /// Writer name
    pub writer_name: String,
    /// Dataset name
    pub dataset_name: String,
    /// Message kind
    pub kind: DataSetMessageKind,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Item notifications in device order
    pub notifications: Vec<ItemNotification>,
    /// Originating endpoint URL
    pub endpoint_url: String,
    /// Originating application URI
    pub application_uri: Option<String>,
}

/// Inbound queue of a writer group.
///
/// `enqueue` applies backpressure: it waits while the queue is full and fails
/// without enqueuing when `cancel` fires first.
#[async_trait]
pub trait DataSetMessageQueue: Send + Sync {
    /// Hand a message to the group.
    async fn enqueue(
        &self,
        message: DataSetWriterMessage,
        cancel: &CancellationToken,
    ) -> CoreResult<()>;
}
