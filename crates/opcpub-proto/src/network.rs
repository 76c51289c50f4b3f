//! Network message model.
//!
//! A [`NetworkMessage`] carries one or more dataset messages of a writer
//! group. Field maps are serialized in the order they were built, so the
//! [`FieldOrdering`] chosen by the encoder is visible on the wire.

use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use opcpub_core::{DataSetMessageKind, DataSetWriterMessage, DataValue, ItemNotification};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

/// Message type tag of data network messages.
pub const DATA_MESSAGE_TYPE: &str = "ua-data";

/// Payload encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageEncoding {
    /// UTF-8 JSON
    #[default]
    Json,
    /// CBOR
    Binary,
}

impl MessageEncoding {
    /// MIME content type of the encoding.
    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Binary => "application/cbor",
        }
    }
}

/// Which optional attributes are written per dataset and per field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentMask {
    /// Dataset creation timestamp
    pub timestamp: bool,
    /// Per-field status code
    pub status: bool,
    /// Per-field source timestamp
    pub source_timestamp: bool,
    /// Per-field server timestamp
    pub server_timestamp: bool,
    /// Writer name
    pub writer_name: bool,
    /// Dataset sequence number
    pub sequence_number: bool,
    /// Dataset message type (key/delta/event)
    pub message_type: bool,
}

impl Default for ContentMask {
    fn default() -> Self {
        Self {
            timestamp: true,
            status: true,
            source_timestamp: false,
            server_timestamp: false,
            writer_name: true,
            sequence_number: true,
            message_type: true,
        }
    }
}

impl ContentMask {
    /// Mask with every attribute disabled (raw field values only).
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            timestamp: false,
            status: false,
            source_timestamp: false,
            server_timestamp: false,
            writer_name: false,
            sequence_number: false,
            message_type: false,
        }
    }

    fn field_envelope(self) -> bool {
        self.status || self.source_timestamp || self.server_timestamp
    }
}

/// Order of fields inside a dataset payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldOrdering {
    /// Order in which the items were configured and notified
    #[default]
    Configured,
    /// Sorted by field name, which makes the field layout stable
    Optimized,
}

/// What to do with a dataset that does not fit a network message alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitPolicy {
    /// Never split a dataset; oversize datasets are rejected
    #[default]
    Atomic,
    /// Split the dataset field-wise across consecutive messages
    AllowFieldSplit,
}

/// One field of a dataset payload.
#[derive(Debug, Clone, PartialEq)]
pub struct WireField {
    name: String,
    value: DataValue,
    status: Option<u32>,
    source_timestamp: Option<DateTime<Utc>>,
    server_timestamp: Option<DateTime<Utc>>,
    enveloped: bool,
    binary: bool,
}

impl WireField {
    fn new(notification: &ItemNotification, mask: ContentMask, binary: bool) -> Self {
        Self {
            name: notification.field_name.clone(),
            value: notification.value.clone(),
            status: mask
                .status
                .then_some(notification.status.0)
                .filter(|code| *code != 0),
            source_timestamp: notification
                .source_timestamp
                .filter(|_| mask.source_timestamp),
            server_timestamp: notification
                .server_timestamp
                .filter(|_| mask.server_timestamp),
            enveloped: mask.field_envelope(),
            binary,
        }
    }

    /// Field name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

struct WireValue<'a> {
    value: &'a DataValue,
    binary: bool,
}

impl Serialize for WireValue<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.value {
            DataValue::Null => serializer.serialize_unit(),
            DataValue::Boolean(value) => serializer.serialize_bool(*value),
            DataValue::Int64(value) => serializer.serialize_i64(*value),
            DataValue::UInt64(value) => serializer.serialize_u64(*value),
            DataValue::Double(value) => serializer.serialize_f64(*value),
            DataValue::String(value) => serializer.serialize_str(value),
            DataValue::Bytes(bytes) if self.binary => serializer.serialize_bytes(bytes),
            DataValue::Bytes(bytes) => serializer
                .serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes)),
            DataValue::DateTime(at) => {
                serializer.serialize_str(&at.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            DataValue::Json(value) => value.serialize(serializer),
        }
    }
}

impl Serialize for WireField {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = WireValue {
            value: &self.value,
            binary: self.binary,
        };
        if !self.enveloped {
            return value.serialize(serializer);
        }
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("Value", &value)?;
        if let Some(status) = self.status {
            map.serialize_entry("StatusCode", &status)?;
        }
        if let Some(at) = self.source_timestamp {
            map.serialize_entry("SourceTimestamp", &at)?;
        }
        if let Some(at) = self.server_timestamp {
            map.serialize_entry("ServerTimestamp", &at)?;
        }
        map.end()
    }
}

/// Ordered field map.
///
/// A name that occurs more than once is written once, in the position of
/// its first occurrence, with all of its values as an array.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload(pub Vec<WireField>);

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut groups: Vec<(&str, Vec<&WireField>)> = Vec::with_capacity(self.0.len());
        for field in &self.0 {
            match groups.iter_mut().find(|(name, _)| *name == field.name) {
                Some((_, values)) => values.push(field),
                None => groups.push((field.name.as_str(), vec![field])),
            }
        }
        let mut map = serializer.serialize_map(Some(groups.len()))?;
        for (name, values) in &groups {
            match values.as_slice() {
                [single] => map.serialize_entry(name, single)?,
                repeated => map.serialize_entry(name, repeated)?,
            }
        }
        map.end()
    }
}

/// One dataset inside a network message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataSetPayload {
    /// Writer id
    #[serde(rename = "DataSetWriterId")]
    pub writer_id: u16,
    /// Writer name
    #[serde(rename = "DataSetWriterName", skip_serializing_if = "Option::is_none")]
    pub writer_name: Option<String>,
    /// Sequence number
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
    /// Dataset message type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_type: Option<&'static str>,
    /// Creation timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Fields
    pub payload: Payload,
}

impl DataSetPayload {
    /// Build the payload of `message` under `mask` and `ordering`.
    #[must_use]
    pub fn from_message(
        message: &DataSetWriterMessage,
        mask: ContentMask,
        ordering: FieldOrdering,
        encoding: MessageEncoding,
    ) -> Self {
        let binary = encoding == MessageEncoding::Binary;
        let mut fields: Vec<WireField> = message
            .notifications
            .iter()
            .map(|notification| WireField::new(notification, mask, binary))
            .collect();
        if ordering == FieldOrdering::Optimized {
            fields.sort_by(|a, b| a.name.cmp(&b.name));
        }
        Self {
            writer_id: message.writer_id,
            writer_name: mask.writer_name.then(|| message.writer_name.clone()),
            sequence_number: mask.sequence_number.then_some(message.sequence_number),
            message_type: mask.message_type.then_some(match message.kind {
                DataSetMessageKind::KeyFrame => "ua-keyframe",
                DataSetMessageKind::DeltaFrame => "ua-deltaframe",
                DataSetMessageKind::Event => "ua-event",
            }),
            timestamp: mask.timestamp.then_some(message.timestamp),
            payload: Payload(fields),
        }
    }

    /// Same header with a subset of the fields.
    #[must_use]
    pub fn with_fields(&self, fields: Vec<WireField>) -> Self {
        Self {
            writer_id: self.writer_id,
            writer_name: self.writer_name.clone(),
            sequence_number: self.sequence_number,
            message_type: self.message_type,
            timestamp: self.timestamp,
            payload: Payload(fields),
        }
    }
}

/// Unit handed to the message sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkMessage {
    /// Unique message id
    pub message_id: String,
    /// Always [`DATA_MESSAGE_TYPE`]
    pub message_type: &'static str,
    /// Publisher id
    pub publisher_id: String,
    /// Writer group name
    #[serde(rename = "WriterGroupName")]
    pub group_id: String,
    /// Datasets in batch order
    pub messages: Vec<DataSetPayload>,
}
