//! Sink errors.

use opcpub_proto::EncodeError;
use thiserror::Error;

/// Errors raised by writer groups and message sinks.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Invalid writer group configuration
    #[error("invalid writer group configuration: {0}")]
    Config(String),

    /// Network message encoding failed
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The sink could not deliver a message
    #[error("publish failed: {0}")]
    Publish(String),

    /// The sink is closed
    #[error("sink closed")]
    Closed,
}
