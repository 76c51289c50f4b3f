//! # opcpub Protocol
//!
//! Network message encoding and MQTT topic scheme.
//!
//! ## Network messages
//!
//! Dataset writer messages are packed into network messages according to a
//! [`ContentMask`], encoded as JSON or CBOR and split so that no payload
//! exceeds the configured maximum size.
//!
//! ## MQTT Topics
//!
//! Topic scheme: `opcpub/v1/{publisher}/{group}/data`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod encoder;
pub mod messages;
pub mod network;
pub mod topics;

pub use encoder::{
    EncodeError, EncodedBatch, EncodedMessage, EncoderSettings, NetworkMessageEncoder,
    RejectedDataSet,
};
pub use messages::{DiscoveryRequest, MessageError};
pub use network::{ContentMask, FieldOrdering, MessageEncoding, NetworkMessage, SplitPolicy};
pub use topics::{TopicKind, TopicScheme};
