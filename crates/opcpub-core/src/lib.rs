//! # opcpub Core
//!
//! Session, subscription and dataset-writer machinery for publishing
//! industrial telemetry.
//!
//! This crate provides:
//! - A reference-counted session pool with quotas, idle sweep and reconnect
//! - A subscription client with per-session name deduplication
//! - Dataset writers that turn notifications into sequenced writer messages
//! - A bounded task scheduler for long-running discovery work
//! - A typed event broker with per-listener isolation and staleness filtering
//!
//! Data flows: session pool → subscription client → dataset writer →
//! [`DataSetMessageQueue`] (implemented by the writer group sink).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broker;
pub mod duration_millis;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod subscription;
pub mod transport;
pub mod writer;

#[cfg(test)]
pub(crate) mod testing;

pub use broker::{
    DiscoveryStage, Event, EventBroker, EventBrokerConfig, EventEnvelope, EventHandler, EventKind,
    NotifyReport, Registration,
};
pub use endpoint::{CredentialRef, EndpointDescriptor, EndpointKey, SecurityMode};
pub use error::{CoreError, CoreResult, ErrorKind};
pub use message::{
    DataSetMessageKind, DataSetMessageQueue, DataSetWriterMessage, DataValue, ItemNotification,
    NotificationBatch, NotificationKind, StatusCode,
};
pub use scheduler::{TaskScheduler, TaskSchedulerConfig};
pub use session::{Session, SessionId, SessionPool, SessionPoolConfig};
pub use state::{
    ConnectionState, ConnectionStatus, ItemState, LogStateReporter, SequenceGap, StateReporter,
    WriterState, WriterStatus,
};
pub use subscription::{
    ItemKind, ItemStatusChange, MonitoredItemInfo, MonitoredItemSpec, SubscriptionClient,
    SubscriptionClientConfig, SubscriptionHandle, SubscriptionListener, SubscriptionSpec,
    SubscriptionStatus,
};
pub use transport::DeviceTransport;
pub use writer::{DataSetWriter, DataSetWriterConfig};
