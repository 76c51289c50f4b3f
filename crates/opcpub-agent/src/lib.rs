//! # opcpub Agent
//!
//! Publisher agent runtime: connects to industrial devices, turns their
//! notifications into network messages and publishes them over MQTT.
//!
//! ## Architecture
//!
//! The agent runs these concurrent loops:
//! 1. **Sessions**: the session pool keeps device connections alive and reconnects
//! 2. **Subscriptions**: one dispatch task per subscription feeds a dataset writer
//! 3. **Publishing**: the writer group batches dataset messages onto MQTT
//! 4. **Discovery**: requests received over MQTT run on the task scheduler
//! 5. **Persistence**: connection and writer states land in `SQLite`

pub mod config;
pub mod discovery;
pub mod mqtt;
pub mod persistence;
pub mod runtime;
pub mod simulation;

pub use config::{AgentConfig, PublishedNodesEntry};
pub use discovery::DiscoveryService;
pub use mqtt::{MqttError, MqttEventForwarder, MqttMessageSink};
pub use persistence::SqliteStateStore;
pub use runtime::{Agent, Pipeline};
pub use simulation::{SimulatedTransport, SimulationConfig};
