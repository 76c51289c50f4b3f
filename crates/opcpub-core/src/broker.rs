//! Typed event broker.
//!
//! Fans state changes out to registered handlers. Every handler call runs in
//! its own task, so a failing or panicking handler never affects the others
//! or the publisher. Progress events older than their staleness horizon are
//! dropped before dispatch.

use crate::error::CoreResult;
use crate::state::{ConnectionState, WriterState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Event broker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventBrokerConfig {
    /// Discovery progress older than this is not delivered
    #[serde(with = "crate::duration_millis")]
    pub progress_staleness: Duration,
}

impl Default for EventBrokerConfig {
    fn default() -> Self {
        Self {
            progress_staleness: Duration::from_secs(10),
        }
    }
}

/// Discovery stage carried by progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStage {
    /// Request accepted
    Started,
    /// Endpoints of one URL resolved
    EndpointsFound,
    /// Request finished
    Finished,
    /// Request failed
    Failed,
    /// Request rejected by the scheduler
    Rejected,
}

/// Events published by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A session's connection state changed
    EndpointStateChanged {
        /// Endpoint URL
        endpoint_url: String,
        /// New state
        state: ConnectionState,
    },
    /// A writer's state changed
    WriterStateChanged {
        /// Writer name
        writer: String,
        /// New state
        state: WriterState,
    },
    /// Progress of a discovery request
    DiscoveryProgress {
        /// Request identifier
        request_id: String,
        /// URL being discovered
        discovery_url: String,
        /// Stage reached
        stage: DiscoveryStage,
        /// Endpoints found so far
        found: usize,
        /// Diagnostic text
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// An application was registered from discovery results
    ApplicationRegistered {
        /// Application URI
        application_uri: String,
        /// Endpoint URLs
        endpoints: Vec<String>,
    },
    /// A device twin changed
    TwinUpdated {
        /// Twin identifier
        twin_id: String,
        /// Changed properties
        properties: serde_json::Value,
    },
}

/// Event discriminant used for registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// [`Event::EndpointStateChanged`]
    EndpointStateChanged,
    /// [`Event::WriterStateChanged`]
    WriterStateChanged,
    /// [`Event::DiscoveryProgress`]
    DiscoveryProgress,
    /// [`Event::ApplicationRegistered`]
    ApplicationRegistered,
    /// [`Event::TwinUpdated`]
    TwinUpdated,
}

impl Event {
    /// Kind of this event.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::EndpointStateChanged { .. } => EventKind::EndpointStateChanged,
            Self::WriterStateChanged { .. } => EventKind::WriterStateChanged,
            Self::DiscoveryProgress { .. } => EventKind::DiscoveryProgress,
            Self::ApplicationRegistered { .. } => EventKind::ApplicationRegistered,
            Self::TwinUpdated { .. } => EventKind::TwinUpdated,
        }
    }
}

/// An event with identity and creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique id
    pub id: Uuid,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Payload
    pub event: Event,
}

impl EventEnvelope {
    /// Wrap `event` with a fresh id and the current time.
    #[must_use]
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Receives events.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Handle one event.
    async fn handle(&self, envelope: Arc<EventEnvelope>) -> CoreResult<()>;
}

/// Outcome of one [`EventBroker::notify_all`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyReport {
    /// Handlers that returned `Ok`
    pub delivered: usize,
    /// Handlers that failed or panicked
    pub failed: usize,
    /// Event was older than its staleness horizon and not dispatched
    pub stale: bool,
}

#[derive(Default)]
struct Handlers {
    by_kind: HashMap<EventKind, Vec<(u64, Arc<dyn EventHandler>)>>,
    all: Vec<(u64, Arc<dyn EventHandler>)>,
}

struct BrokerInner {
    config: EventBrokerConfig,
    handlers: parking_lot::RwLock<Handlers>,
    next_id: AtomicU64,
}

impl BrokerInner {
    fn remove(&self, id: u64, kind: Option<EventKind>) {
        let mut handlers = self.handlers.write();
        match kind {
            Some(kind) => {
                if let Some(list) = handlers.by_kind.get_mut(&kind) {
                    list.retain(|(handler_id, _)| *handler_id != id);
                }
            }
            None => handlers.all.retain(|(handler_id, _)| *handler_id != id),
        }
    }
}

/// Handle returned by registration.
#[must_use = "dropping a Registration keeps the handler registered; call unregister to remove it"]
pub struct Registration {
    id: u64,
    kind: Option<EventKind>,
    broker: Weak<BrokerInner>,
}

impl Registration {
    /// Remove the handler.
    pub fn unregister(self) {
        if let Some(broker) = self.broker.upgrade() {
            broker.remove(self.id, self.kind);
        }
    }
}

/// Event broker.
#[derive(Clone)]
pub struct EventBroker {
    inner: Arc<BrokerInner>,
}

impl EventBroker {
    /// Create a broker.
    #[must_use]
    pub fn new(config: EventBrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                config,
                handlers: parking_lot::RwLock::new(Handlers::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `handler` for one event kind.
    pub fn register(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> Registration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .write()
            .by_kind
            .entry(kind)
            .or_default()
            .push((id, handler));
        Registration {
            id,
            kind: Some(kind),
            broker: Arc::downgrade(&self.inner),
        }
    }

    /// Register `handler` for every event kind.
    pub fn register_all(&self, handler: Arc<dyn EventHandler>) -> Registration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.write().all.push((id, handler));
        Registration {
            id,
            kind: None,
            broker: Arc::downgrade(&self.inner),
        }
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        let handlers = self.inner.handlers.read();
        handlers.all.len() + handlers.by_kind.values().map(Vec::len).sum::<usize>()
    }

    fn horizon(&self, kind: EventKind) -> Option<Duration> {
        match kind {
            EventKind::DiscoveryProgress => Some(self.inner.config.progress_staleness),
            _ => None,
        }
    }

    /// Deliver `envelope` to every matching handler, at most once each.
    pub async fn notify_all(&self, envelope: EventEnvelope) -> NotifyReport {
        let kind = envelope.event.kind();
        if let Some(horizon) = self.horizon(kind) {
            let age = (Utc::now() - envelope.timestamp).to_std().unwrap_or_default();
            if age > horizon {
                tracing::debug!(
                    event_id = %envelope.id,
                    kind = ?kind,
                    age_ms = u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
                    "Stale event dropped"
                );
                return NotifyReport {
                    stale: true,
                    ..NotifyReport::default()
                };
            }
        }

        let targets: Vec<Arc<dyn EventHandler>> = {
            let handlers = self.inner.handlers.read();
            handlers
                .by_kind
                .get(&kind)
                .into_iter()
                .flatten()
                .chain(handlers.all.iter())
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };

        let envelope = Arc::new(envelope);
        let mut tasks = JoinSet::new();
        for handler in targets {
            let envelope = Arc::clone(&envelope);
            tasks.spawn(async move { handler.handle(envelope).await });
        }

        let mut report = NotifyReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(err)) => {
                    report.failed += 1;
                    tracing::warn!(event_id = %envelope.id, kind = ?kind, error = %err, "Event handler failed");
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::error!(event_id = %envelope.id, kind = ?kind, error = %err, "Event handler panicked");
                }
            }
        }
        report
    }
}
