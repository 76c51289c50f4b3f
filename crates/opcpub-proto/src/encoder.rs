//! Size-bounded network message encoder.
//!
//! Packs dataset messages greedily, in batch order, into as few network
//! messages as fit under `max_network_message_size`.

use crate::network::{
    ContentMask, DataSetPayload, FieldOrdering, MessageEncoding, NetworkMessage, SplitPolicy,
    DATA_MESSAGE_TYPE,
};
use opcpub_core::DataSetWriterMessage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Encoding errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EncodeError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Limit too small for even an empty network message
    #[error("max network message size {limit} is below the {overhead} byte envelope")]
    LimitTooSmall {
        /// Configured limit
        limit: usize,
        /// Size of an empty network message
        overhead: usize,
    },
}

/// Encoder settings, taken from the writer group configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderSettings {
    /// Publisher id
    pub publisher_id: String,
    /// Writer group id
    pub group_id: String,
    /// Payload encoding
    pub encoding: MessageEncoding,
    /// Content mask
    pub content_mask: ContentMask,
    /// Upper bound for one encoded payload in bytes
    pub max_network_message_size: usize,
    /// Field ordering
    pub field_ordering: FieldOrdering,
    /// Oversize dataset handling
    pub split_policy: SplitPolicy,
}

/// One encoded network message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMessage {
    /// Message id written into the payload
    pub message_id: String,
    /// Encoded bytes
    pub payload: Vec<u8>,
    /// Number of dataset entries (chunks count separately)
    pub dataset_count: usize,
    /// `(writer_id, sequence_number)` of every dataset entry, in order
    pub datasets: Vec<(u16, u64)>,
}

/// A dataset that could not be encoded within the size limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedDataSet {
    /// Writer id
    pub writer_id: u16,
    /// Sequence number
    pub sequence_number: u64,
    /// Encoded size of the smallest message carrying it
    pub encoded_size: usize,
}

/// Result of encoding one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedBatch {
    /// Network messages in batch order
    pub messages: Vec<EncodedMessage>,
    /// Datasets dropped for exceeding the limit
    pub rejected: Vec<RejectedDataSet>,
}

struct Pending {
    payloads: Vec<DataSetPayload>,
    datasets: Vec<(u16, u64)>,
    encoded: Option<(String, Vec<u8>)>,
}

impl Pending {
    fn new() -> Self {
        Self {
            payloads: Vec::new(),
            datasets: Vec::new(),
            encoded: None,
        }
    }
}

/// Encodes batches of dataset messages into network messages.
#[derive(Debug, Clone)]
pub struct NetworkMessageEncoder {
    settings: EncoderSettings,
}

impl NetworkMessageEncoder {
    /// Create an encoder, checking that the limit leaves room for content.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::LimitTooSmall`] if an empty network message
    /// already exceeds the limit.
    pub fn new(settings: EncoderSettings) -> Result<Self, EncodeError> {
        let encoder = Self { settings };
        let (_, empty) = encoder.encode_payloads(Vec::new())?;
        if empty.len() >= encoder.settings.max_network_message_size {
            return Err(EncodeError::LimitTooSmall {
                limit: encoder.settings.max_network_message_size,
                overhead: empty.len(),
            });
        }
        Ok(encoder)
    }

    /// Encoder settings.
    #[must_use]
    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    fn serialize(&self, message: &NetworkMessage) -> Result<Vec<u8>, EncodeError> {
        match self.settings.encoding {
            MessageEncoding::Json => {
                serde_json::to_vec(message).map_err(|e| EncodeError::Serialize(e.to_string()))
            }
            MessageEncoding::Binary => {
                let mut bytes = Vec::new();
                ciborium::into_writer(message, &mut bytes)
                    .map_err(|e| EncodeError::Serialize(e.to_string()))?;
                Ok(bytes)
            }
        }
    }

    fn encode_payloads(
        &self,
        payloads: Vec<DataSetPayload>,
    ) -> Result<(String, Vec<u8>), EncodeError> {
        let message = NetworkMessage {
            message_id: Uuid::new_v4().to_string(),
            message_type: DATA_MESSAGE_TYPE,
            publisher_id: self.settings.publisher_id.clone(),
            group_id: self.settings.group_id.clone(),
            messages: payloads,
        };
        let bytes = self.serialize(&message)?;
        Ok((message.message_id, bytes))
    }

    fn fits(&self, size: usize) -> bool {
        size <= self.settings.max_network_message_size
    }

    /// Encode `batch`, preserving its order across all produced messages.
    ///
    /// Every produced payload is at most `max_network_message_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::Serialize`] if serialization fails.
    pub fn encode(&self, batch: &[DataSetWriterMessage]) -> Result<EncodedBatch, EncodeError> {
        let mut out = EncodedBatch::default();
        let mut pending = Pending::new();

        for message in batch {
            let payload = DataSetPayload::from_message(
                message,
                self.settings.content_mask,
                self.settings.field_ordering,
                self.settings.encoding,
            );
            let id = (message.writer_id, message.sequence_number);

            let mut candidate = pending.payloads.clone();
            candidate.push(payload.clone());
            let (message_id, bytes) = self.encode_payloads(candidate)?;
            if self.fits(bytes.len()) {
                pending.payloads.push(payload);
                pending.datasets.push(id);
                pending.encoded = Some((message_id, bytes));
                continue;
            }

            Self::close(&mut out, &mut pending);

            let (message_id, bytes) = self.encode_payloads(vec![payload.clone()])?;
            if self.fits(bytes.len()) {
                pending.payloads.push(payload);
                pending.datasets.push(id);
                pending.encoded = Some((message_id, bytes));
                continue;
            }

            match self.settings.split_policy {
                SplitPolicy::Atomic => {
                    tracing::warn!(
                        writer_id = message.writer_id,
                        sequence_number = message.sequence_number,
                        encoded_size = bytes.len(),
                        limit = self.settings.max_network_message_size,
                        "Dataset exceeds max network message size, dropped"
                    );
                    out.rejected.push(RejectedDataSet {
                        writer_id: message.writer_id,
                        sequence_number: message.sequence_number,
                        encoded_size: bytes.len(),
                    });
                }
                SplitPolicy::AllowFieldSplit => {
                    self.split_fields(&payload, id, bytes.len(), &mut out)?;
                }
            }
        }

        Self::close(&mut out, &mut pending);
        Ok(out)
    }

    fn close(out: &mut EncodedBatch, pending: &mut Pending) {
        let finished = std::mem::replace(pending, Pending::new());
        if let Some((message_id, payload)) = finished.encoded {
            out.messages.push(EncodedMessage {
                message_id,
                payload,
                dataset_count: finished.datasets.len(),
                datasets: finished.datasets,
            });
        }
    }

    /// Emit `payload` as consecutive chunks, each a standalone message.
    fn split_fields(
        &self,
        payload: &DataSetPayload,
        id: (u16, u64),
        whole_size: usize,
        out: &mut EncodedBatch,
    ) -> Result<(), EncodeError> {
        let mut chunks: Vec<(String, Vec<u8>)> = Vec::new();
        let mut current = Vec::new();
        let mut current_encoded: Option<(String, Vec<u8>)> = None;

        for field in &payload.payload.0 {
            let mut candidate = current.clone();
            candidate.push(field.clone());
            let encoded = self.encode_payloads(vec![payload.with_fields(candidate.clone())])?;
            if self.fits(encoded.1.len()) {
                current = candidate;
                current_encoded = Some(encoded);
                continue;
            }
            if let Some(done) = current_encoded.take() {
                chunks.push(done);
            }
            let alone = self.encode_payloads(vec![payload.with_fields(vec![field.clone()])])?;
            if !self.fits(alone.1.len()) {
                tracing::warn!(
                    writer_id = id.0,
                    sequence_number = id.1,
                    field = field.name(),
                    encoded_size = alone.1.len(),
                    "Single field exceeds max network message size, dataset dropped"
                );
                out.rejected.push(RejectedDataSet {
                    writer_id: id.0,
                    sequence_number: id.1,
                    encoded_size: whole_size,
                });
                return Ok(());
            }
            current = vec![field.clone()];
            current_encoded = Some(alone);
        }
        if let Some(done) = current_encoded {
            chunks.push(done);
        }

        tracing::debug!(
            writer_id = id.0,
            sequence_number = id.1,
            chunks = chunks.len(),
            "Dataset split across network messages"
        );
        out.messages
            .extend(chunks.into_iter().map(|(message_id, payload)| EncodedMessage {
                message_id,
                payload,
                dataset_count: 1,
                datasets: vec![id],
            }));
        Ok(())
    }
}
