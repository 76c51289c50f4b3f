//! # opcpub Sink
//!
//! Writer group sink: a bounded inbound queue of dataset writer messages
//! with backpressure, a time/size micro-batching flush loop and the
//! [`MessageSink`] seam that receives encoded network messages.
//!
//! ```text
//! writers ──enqueue (blocks when full)──► queue ──flush loop──► encoder ──► MessageSink
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod group;
pub mod sink;

pub use error::SinkError;
pub use group::{WriterGroup, WriterGroupConfig, WriterGroupHandle, WriterGroupStats};
pub use sink::{MemorySink, MessageSink, OutboundMessage};
