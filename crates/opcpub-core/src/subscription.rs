//! Subscription client.
//!
//! Creates named subscriptions on pooled sessions, tracks their monitored
//! items and forwards device notifications to a listener.
//!
//! ```text
//!   device ──mpsc──► dispatch task ──await──► SubscriptionListener
//!                        ▲
//!   session state watch ─┘  (Disconnected once / recreate on Ready)
//! ```
//!
//! Names are unique per session: a duplicate `create_subscription` fails with
//! [`CoreError::SubscriptionAlreadyExists`] and leaves the existing one alone.

use crate::error::{CoreError, CoreResult};
use crate::message::{ItemNotification, NotificationBatch, NotificationKind};
use crate::session::{Session, SessionId};
use crate::state::ItemState;
use crate::transport::{
    ConnectionId, DeviceNotification, DeviceTransport, MonitoredItemRequest, MonitoredTarget,
    ServerSubscriptionRequest,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Subscription client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubscriptionClientConfig {
    /// Publishing interval used when a spec does not set one
    #[serde(with = "crate::duration_millis")]
    pub default_publishing_interval: Duration,
    /// Sampling interval used when an item does not set one
    #[serde(with = "crate::duration_millis")]
    pub default_sampling_interval: Duration,
    /// Capacity of the per-subscription device notification channel
    pub notification_buffer: usize,
}

impl Default for SubscriptionClientConfig {
    fn default() -> Self {
        Self {
            default_publishing_interval: Duration::from_secs(1),
            default_sampling_interval: Duration::from_millis(500),
            notification_buffer: 1024,
        }
    }
}

/// What a monitored item observes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemKind {
    /// Variable value changes
    Variable,
    /// Event occurrences with the selected fields
    Event {
        /// Selected event fields
        fields: Vec<String>,
    },
}

impl ItemKind {
    /// Returns `true` for event items.
    #[must_use]
    pub fn is_event(&self) -> bool {
        matches!(self, Self::Event { .. })
    }
}

/// A monitored item to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredItemSpec {
    /// Node identifier; unique within a subscription
    pub item_id: String,
    /// Field name in published datasets (defaults to `item_id`)
    #[serde(default)]
    pub field_name: Option<String>,
    /// Item kind
    #[serde(flatten)]
    pub kind: ItemKind,
    /// Sampling interval override
    #[serde(default, with = "crate::duration_millis::option")]
    pub sampling_interval: Option<Duration>,
    /// Server-side queue size
    #[serde(default = "default_queue_size")]
    pub queue_size: u32,
}

fn default_queue_size() -> u32 {
    1
}

impl MonitoredItemSpec {
    /// A variable item.
    #[must_use]
    pub fn variable(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            field_name: None,
            kind: ItemKind::Variable,
            sampling_interval: None,
            queue_size: default_queue_size(),
        }
    }

    /// An event item selecting `fields`.
    #[must_use]
    pub fn event(item_id: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            kind: ItemKind::Event { fields },
            ..Self::variable(item_id)
        }
    }

    /// Set the dataset field name.
    #[must_use]
    pub fn with_field_name(mut self, name: impl Into<String>) -> Self {
        self.field_name = Some(name.into());
        self
    }
}

/// Subscription request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    /// Name, unique per session
    pub name: String,
    /// Requested publishing interval
    #[serde(default, with = "crate::duration_millis::option")]
    pub publishing_interval: Option<Duration>,
    /// Initial monitored items
    #[serde(default)]
    pub items: Vec<MonitoredItemSpec>,
}

impl SubscriptionSpec {
    /// A spec with no items.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            publishing_interval: None,
            items: Vec::new(),
        }
    }

    /// Set the publishing interval.
    #[must_use]
    pub fn with_publishing_interval(mut self, interval: Duration) -> Self {
        self.publishing_interval = Some(interval);
        self
    }

    /// Add an item.
    #[must_use]
    pub fn with_item(mut self, item: MonitoredItemSpec) -> Self {
        self.items.push(item);
        self
    }
}

/// Lifecycle status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Being created on the device
    Creating,
    /// Delivering notifications
    Active,
    /// Session lost; will be recreated when the session is ready again
    Disconnected,
    /// Closed or session detached
    Closed,
    /// Recreation failed
    Error,
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "Creating",
            Self::Active => "Active",
            Self::Disconnected => "Disconnected",
            Self::Closed => "Closed",
            Self::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Snapshot of one monitored item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredItemInfo {
    /// Node identifier
    pub item_id: String,
    /// Dataset field name
    pub field_name: String,
    /// Item kind
    pub kind: ItemKind,
    /// Client handle
    pub client_handle: u32,
    /// Server-assigned id once created
    pub server_id: Option<u32>,
    /// Last creation or status error
    pub last_error: Option<String>,
}

/// Item status change delivered to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemStatusChange {
    /// Subscription name
    pub subscription: String,
    /// Item identifier
    pub item_id: String,
    /// `true` for event items
    pub is_event: bool,
    /// New state
    pub state: ItemState,
}

/// Receives notifications of one subscription, in device order.
#[async_trait]
pub trait SubscriptionListener: Send + Sync {
    /// A batch of data changes or event fields arrived.
    async fn on_notification(&self, batch: NotificationBatch);

    /// A monitored item was created, failed, changed status or was removed.
    async fn on_item_status(&self, change: ItemStatusChange);

    /// The subscription status changed. Fires once per transition.
    async fn on_status_change(&self, subscription: &str, status: SubscriptionStatus);
}

#[derive(Debug)]
struct ItemEntry {
    spec: MonitoredItemSpec,
    client_handle: u32,
    server_id: Option<u32>,
    last_error: Option<String>,
}

impl ItemEntry {
    fn field_name(&self) -> &str {
        self.spec.field_name.as_deref().unwrap_or(&self.spec.item_id)
    }

    fn info(&self) -> MonitoredItemInfo {
        MonitoredItemInfo {
            item_id: self.spec.item_id.clone(),
            field_name: self.field_name().to_string(),
            kind: self.spec.kind.clone(),
            client_handle: self.client_handle,
            server_id: self.server_id,
            last_error: self.last_error.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct ItemTable {
    server_id: Option<u32>,
    entries: Vec<ItemEntry>,
    next_handle: u32,
}

impl ItemTable {
    fn allocate_handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn by_handle(&self, handle: u32) -> Option<&ItemEntry> {
        self.entries.iter().find(|entry| entry.client_handle == handle)
    }
}

type Registry = HashMap<SessionId, HashMap<String, Option<Arc<SubscriptionInner>>>>;

struct ClientShared {
    config: SubscriptionClientConfig,
    transport: Arc<dyn DeviceTransport>,
    registry: parking_lot::Mutex<Registry>,
    total: AtomicUsize,
}

impl ClientShared {
    fn unregister(&self, session: SessionId, name: &str) {
        let mut registry = self.registry.lock();
        if let Some(names) = registry.get_mut(&session) {
            names.remove(name);
            if names.is_empty() {
                registry.remove(&session);
            }
        }
    }
}

struct SubscriptionInner {
    name: String,
    session: Arc<Session>,
    publishing_interval: Duration,
    listener: Arc<dyn SubscriptionListener>,
    shared: Arc<ClientShared>,
    items: parking_lot::Mutex<ItemTable>,
    bound_connection: parking_lot::Mutex<Option<ConnectionId>>,
    ops: Mutex<()>,
    status: parking_lot::Mutex<SubscriptionStatus>,
    registered: AtomicBool,
    closed: CancellationToken,
}

/// Creates and tracks subscriptions across sessions.
#[derive(Clone)]
pub struct SubscriptionClient {
    shared: Arc<ClientShared>,
}

impl SubscriptionClient {
    /// Create a client.
    pub fn new(config: SubscriptionClientConfig, transport: Arc<dyn DeviceTransport>) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                config,
                transport,
                registry: parking_lot::Mutex::new(HashMap::new()),
                total: AtomicUsize::new(0),
            }),
        }
    }

    /// Live number of subscriptions across all sessions.
    #[must_use]
    pub fn total_subscription_count(&self) -> usize {
        self.shared.total.load(Ordering::Acquire)
    }

    /// Number of active subscriptions on `session`.
    #[must_use]
    pub fn session_subscription_count(&self, session: &Session) -> usize {
        self.shared
            .registry
            .lock()
            .get(&session.id())
            .map_or(0, |names| names.values().filter(|sub| sub.is_some()).count())
    }

    /// Look up an active subscription by name.
    #[must_use]
    pub fn find(&self, session: &Session, name: &str) -> Option<SubscriptionHandle> {
        self.shared
            .registry
            .lock()
            .get(&session.id())
            .and_then(|names| names.get(name))
            .and_then(Clone::clone)
            .map(|inner| SubscriptionHandle { inner })
    }

    /// Create a subscription on `session`.
    ///
    /// Fails with `SubscriptionAlreadyExists` if the name is taken on this
    /// session, and with `SessionClosed` if the session is detached before
    /// the device confirms.
    pub async fn create_subscription(
        &self,
        session: &Arc<Session>,
        spec: SubscriptionSpec,
        listener: Arc<dyn SubscriptionListener>,
    ) -> CoreResult<SubscriptionHandle> {
        if spec.name.is_empty() {
            return Err(CoreError::Invalid("subscription name must not be empty".into()));
        }
        session.require_connection()?;

        {
            let mut registry = self.shared.registry.lock();
            let names = registry.entry(session.id()).or_default();
            if names.contains_key(&spec.name) {
                tracing::warn!(
                    session_id = %session.id(),
                    subscription = %spec.name,
                    "Duplicate subscription rejected"
                );
                return Err(CoreError::SubscriptionAlreadyExists {
                    session: session.id().to_string(),
                    name: spec.name,
                });
            }
            names.insert(spec.name.clone(), None);
        }

        let mut table = ItemTable::default();
        let mut seen = HashSet::new();
        for item in spec.items {
            if seen.insert(item.item_id.clone()) {
                let client_handle = table.allocate_handle();
                table.entries.push(ItemEntry {
                    spec: item,
                    client_handle,
                    server_id: None,
                    last_error: None,
                });
            }
        }

        let inner = Arc::new(SubscriptionInner {
            name: spec.name.clone(),
            session: Arc::clone(session),
            publishing_interval: spec
                .publishing_interval
                .unwrap_or(self.shared.config.default_publishing_interval),
            listener,
            shared: Arc::clone(&self.shared),
            items: parking_lot::Mutex::new(table),
            bound_connection: parking_lot::Mutex::new(None),
            ops: Mutex::new(()),
            status: parking_lot::Mutex::new(SubscriptionStatus::Creating),
            registered: AtomicBool::new(false),
            closed: CancellationToken::new(),
        });

        let receiver = {
            let _guard = inner.ops.lock().await;
            inner.create_on_device().await
        };
        let receiver = match receiver {
            Ok(receiver) => receiver,
            Err(err) => {
                self.shared.unregister(session.id(), &spec.name);
                tracing::warn!(
                    session_id = %session.id(),
                    subscription = %spec.name,
                    error = %err,
                    "Subscription creation failed"
                );
                return Err(err);
            }
        };

        {
            let mut registry = self.shared.registry.lock();
            let names = registry.entry(session.id()).or_default();
            names.insert(spec.name.clone(), Some(Arc::clone(&inner)));
        }
        inner.registered.store(true, Ordering::Release);
        let total = self.shared.total.fetch_add(1, Ordering::AcqRel) + 1;

        tracing::info!(
            session_id = %session.id(),
            subscription = %spec.name,
            items = inner.items.lock().entries.len(),
            total_subscriptions = total,
            "Subscription created"
        );

        inner.set_status(SubscriptionStatus::Active).await;
        inner.report_item_results().await;
        tokio::spawn(Arc::clone(&inner).dispatch(receiver));

        Ok(SubscriptionHandle { inner })
    }
}

/// Handle to a created subscription.
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<SubscriptionInner>,
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("name", &self.inner.name)
            .field("session", &self.inner.session.id())
            .field("status", &self.status())
            .finish()
    }
}

impl SubscriptionHandle {
    /// Subscription name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Session this subscription lives on.
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> SubscriptionStatus {
        *self.inner.status.lock()
    }

    /// Snapshot of the monitored items in creation order.
    #[must_use]
    pub fn monitored_items(&self) -> Vec<MonitoredItemInfo> {
        self.inner
            .items
            .lock()
            .entries
            .iter()
            .map(ItemEntry::info)
            .collect()
    }

    /// Add items; ids already present are skipped.
    ///
    /// Returns the items that were added.
    pub async fn add_monitored_items(
        &self,
        specs: Vec<MonitoredItemSpec>,
    ) -> CoreResult<Vec<MonitoredItemInfo>> {
        let inner = &self.inner;
        let _guard = inner.ops.lock().await;
        inner.ensure_open()?;

        let new_handles: Vec<u32> = {
            let mut table = inner.items.lock();
            let mut existing: HashSet<String> = table
                .entries
                .iter()
                .map(|entry| entry.spec.item_id.clone())
                .collect();
            let mut handles = Vec::new();
            for spec in specs {
                if !existing.insert(spec.item_id.clone()) {
                    continue;
                }
                let client_handle = table.allocate_handle();
                table.entries.push(ItemEntry {
                    spec,
                    client_handle,
                    server_id: None,
                    last_error: None,
                });
                handles.push(client_handle);
            }
            handles
        };

        if new_handles.is_empty() {
            return Ok(Vec::new());
        }

        if *inner.status.lock() == SubscriptionStatus::Active {
            if let Err(err) = inner.create_items(&new_handles).await {
                inner
                    .items
                    .lock()
                    .entries
                    .retain(|entry| !new_handles.contains(&entry.client_handle));
                return Err(err);
            }
            let changes = inner.item_changes(&new_handles);
            for change in changes {
                inner.listener.on_item_status(change).await;
            }
        }

        let table = inner.items.lock();
        Ok(new_handles
            .iter()
            .filter_map(|handle| table.by_handle(*handle).map(ItemEntry::info))
            .collect())
    }

    /// Remove items by id; unknown ids are ignored.
    ///
    /// Returns the number of items removed.
    pub async fn remove_monitored_items(&self, item_ids: &[&str]) -> CoreResult<usize> {
        let inner = &self.inner;
        let _guard = inner.ops.lock().await;
        inner.ensure_open()?;

        let (server_subscription, server_ids, removed_handles) = {
            let table = inner.items.lock();
            let matching: Vec<&ItemEntry> = table
                .entries
                .iter()
                .filter(|entry| item_ids.contains(&entry.spec.item_id.as_str()))
                .collect();
            (
                table.server_id,
                matching.iter().filter_map(|entry| entry.server_id).collect::<Vec<_>>(),
                matching
                    .iter()
                    .map(|entry| entry.client_handle)
                    .collect::<Vec<_>>(),
            )
        };

        if removed_handles.is_empty() {
            return Ok(0);
        }

        if let (Some(subscription), false) = (server_subscription, server_ids.is_empty()) {
            if *inner.status.lock() == SubscriptionStatus::Active {
                let connection = inner.session.require_connection()?;
                inner
                    .guarded(inner.shared.transport.delete_monitored_items(
                        connection,
                        subscription,
                        &server_ids,
                    ))
                    .await?;
            }
        }

        let removed: Vec<ItemEntry> = {
            let mut table = inner.items.lock();
            let (removed, kept) = std::mem::take(&mut table.entries)
                .into_iter()
                .partition(|entry| removed_handles.contains(&entry.client_handle));
            table.entries = kept;
            removed
        };

        for entry in &removed {
            inner
                .listener
                .on_item_status(ItemStatusChange {
                    subscription: inner.name.clone(),
                    item_id: entry.spec.item_id.clone(),
                    is_event: entry.spec.kind.is_event(),
                    state: ItemState::Removed,
                })
                .await;
        }
        Ok(removed.len())
    }

    /// Resolves once the subscription is closed, either through
    /// [`SubscriptionHandle::close`] or because its session was detached.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    /// Delete the subscription on the device and unregister it.
    pub async fn close(&self) -> CoreResult<()> {
        let inner = &self.inner;
        let _guard = inner.ops.lock().await;
        if inner.closed.is_cancelled() {
            return Ok(());
        }
        inner.closed.cancel();

        let server_id = inner.items.lock().server_id.take();
        let mut result = Ok(());
        if let (Some(subscription), Ok(connection)) =
            (server_id, inner.session.require_connection())
        {
            result = inner
                .guarded(
                    inner
                        .shared
                        .transport
                        .delete_subscription(connection, subscription),
                )
                .await;
        }
        inner.finish().await;
        result
    }
}

impl SubscriptionInner {
    fn ensure_open(&self) -> CoreResult<()> {
        if self.session.is_closed() {
            return Err(CoreError::SessionClosed(self.session.id().to_string()));
        }
        if self.closed.is_cancelled() {
            return Err(CoreError::Closed("subscription"));
        }
        Ok(())
    }

    /// Run a device call, failing as soon as the session is detached.
    async fn guarded<T>(&self, call: impl Future<Output = CoreResult<T>>) -> CoreResult<T> {
        tokio::select! {
            biased;
            () = self.session.closed() => Err(CoreError::SessionClosed(self.session.id().to_string())),
            result = call => result,
        }
    }

    async fn set_status(&self, status: SubscriptionStatus) {
        {
            let mut current = self.status.lock();
            if *current == status {
                return;
            }
            *current = status;
        }
        tracing::debug!(subscription = %self.name, %status, "Subscription status changed");
        self.listener.on_status_change(&self.name, status).await;
    }

    /// Create the subscription and all items on the device.
    async fn create_on_device(&self) -> CoreResult<mpsc::Receiver<DeviceNotification>> {
        let connection = self.session.require_connection()?;
        let (sender, receiver) = mpsc::channel(self.shared.config.notification_buffer.max(1));
        let request = ServerSubscriptionRequest {
            publishing_interval: self.publishing_interval,
        };
        let server_id = self
            .guarded(
                self.shared
                    .transport
                    .create_subscription(connection, &request, sender),
            )
            .await?;

        let handles: Vec<u32> = {
            let mut table = self.items.lock();
            table.server_id = Some(server_id);
            for entry in &mut table.entries {
                entry.server_id = None;
                entry.last_error = None;
            }
            table.entries.iter().map(|entry| entry.client_handle).collect()
        };
        if !handles.is_empty() {
            if let Err(err) = self.create_items(&handles).await {
                self.discard_on_device(connection, server_id).await;
                return Err(err);
            }
        }
        *self.bound_connection.lock() = Some(connection);
        self.session.touch();
        Ok(receiver)
    }

    /// Delete a half-created subscription so it does not linger on the device.
    async fn discard_on_device(&self, connection: ConnectionId, server_id: u32) {
        self.items.lock().server_id = None;
        if let Err(err) = self
            .guarded(
                self.shared
                    .transport
                    .delete_subscription(connection, server_id),
            )
            .await
        {
            tracing::debug!(
                subscription = %self.name,
                server_id,
                error = %err,
                "Discarding partially created subscription failed"
            );
        }
    }

    /// Create the given items on the device, recording per-item results.
    async fn create_items(&self, handles: &[u32]) -> CoreResult<()> {
        let connection = self.session.require_connection()?;
        let (server_id, requests) = {
            let table = self.items.lock();
            let server_id = table
                .server_id
                .ok_or_else(|| CoreError::Transient("subscription not created".into()))?;
            let requests: Vec<MonitoredItemRequest> = handles
                .iter()
                .filter_map(|handle| table.by_handle(*handle))
                .map(|entry| MonitoredItemRequest {
                    client_handle: entry.client_handle,
                    node_id: entry.spec.item_id.clone(),
                    target: match &entry.spec.kind {
                        ItemKind::Variable => MonitoredTarget::Variable,
                        ItemKind::Event { fields } => MonitoredTarget::Event {
                            fields: fields.clone(),
                        },
                    },
                    sampling_interval: entry
                        .spec
                        .sampling_interval
                        .unwrap_or(self.shared.config.default_sampling_interval),
                    queue_size: entry.spec.queue_size,
                })
                .collect();
            (server_id, requests)
        };

        let results = self
            .guarded(
                self.shared
                    .transport
                    .create_monitored_items(connection, server_id, &requests),
            )
            .await?;
        if results.len() != requests.len() {
            return Err(CoreError::Protocol(format!(
                "expected {} item results, got {}",
                requests.len(),
                results.len()
            )));
        }

        let mut table = self.items.lock();
        for (request, result) in requests.iter().zip(results) {
            let Some(entry) = table
                .entries
                .iter_mut()
                .find(|entry| entry.client_handle == request.client_handle)
            else {
                continue;
            };
            match result {
                Ok(server_item) => {
                    entry.server_id = Some(server_item);
                    entry.last_error = None;
                }
                Err(message) => {
                    tracing::warn!(
                        subscription = %self.name,
                        item_id = %entry.spec.item_id,
                        error = %message,
                        "Monitored item rejected"
                    );
                    entry.server_id = None;
                    entry.last_error = Some(message);
                }
            }
        }
        Ok(())
    }

    fn item_changes(&self, handles: &[u32]) -> Vec<ItemStatusChange> {
        let table = self.items.lock();
        handles
            .iter()
            .filter_map(|handle| table.by_handle(*handle))
            .map(|entry| ItemStatusChange {
                subscription: self.name.clone(),
                item_id: entry.spec.item_id.clone(),
                is_event: entry.spec.kind.is_event(),
                state: match &entry.last_error {
                    None => ItemState::Good,
                    Some(message) => ItemState::Error {
                        message: message.clone(),
                    },
                },
            })
            .collect()
    }

    async fn report_item_results(&self) {
        let handles: Vec<u32> = self
            .items
            .lock()
            .entries
            .iter()
            .map(|entry| entry.client_handle)
            .collect();
        for change in self.item_changes(&handles) {
            self.listener.on_item_status(change).await;
        }
    }

    /// Unregister and report `Closed` once.
    async fn finish(&self) {
        self.closed.cancel();
        if self.registered.swap(false, Ordering::AcqRel) {
            self.shared.unregister(self.session.id(), &self.name);
            self.shared.total.fetch_sub(1, Ordering::AcqRel);
            tracing::info!(
                session_id = %self.session.id(),
                subscription = %self.name,
                "Subscription closed"
            );
        }
        self.set_status(SubscriptionStatus::Closed).await;
    }

    async fn dispatch(self: Arc<Self>, mut receiver: mpsc::Receiver<DeviceNotification>) {
        let mut states = self.session.subscribe_state();
        let mut receiver_open = true;

        loop {
            tokio::select! {
                biased;
                () = self.closed.cancelled() => break,
                () = self.session.closed() => {
                    self.finish().await;
                    break;
                }
                changed = states.changed() => {
                    if changed.is_err() {
                        self.finish().await;
                        break;
                    }
                    let ready = states.borrow_and_update().status.is_ready();
                    // A fast reconnect can coalesce into a single Ready update.
                    let rebound = ready && self.session.connection() != *self.bound_connection.lock();
                    if *self.status.lock() == SubscriptionStatus::Active && (!ready || rebound) {
                        self.set_status(SubscriptionStatus::Disconnected).await;
                    }
                    let status = *self.status.lock();
                    if ready
                        && matches!(status, SubscriptionStatus::Disconnected | SubscriptionStatus::Error)
                    {
                        if let Some(fresh) = self.recreate().await {
                            receiver = fresh;
                            receiver_open = true;
                        }
                    }
                }
                notification = receiver.recv(), if receiver_open => {
                    match notification {
                        Some(notification) => self.deliver(notification).await,
                        None => receiver_open = false,
                    }
                }
            }
        }
    }

    async fn recreate(&self) -> Option<mpsc::Receiver<DeviceNotification>> {
        let result = {
            let _guard = self.ops.lock().await;
            if self.closed.is_cancelled() {
                return None;
            }
            self.create_on_device().await
        };
        match result {
            Ok(receiver) => {
                tracing::info!(subscription = %self.name, "Subscription recreated after reconnect");
                self.set_status(SubscriptionStatus::Active).await;
                self.report_item_results().await;
                Some(receiver)
            }
            Err(err) => {
                tracing::warn!(subscription = %self.name, error = %err, "Subscription recreate failed");
                self.set_status(SubscriptionStatus::Error).await;
                None
            }
        }
    }

    async fn deliver(&self, notification: DeviceNotification) {
        self.session.touch();
        match notification {
            DeviceNotification::DataChange { sequence, values } => {
                let items: Vec<ItemNotification> = {
                    let table = self.items.lock();
                    values
                        .into_iter()
                        .filter_map(|value| {
                            let Some(entry) = table.by_handle(value.client_handle) else {
                                tracing::debug!(
                                    subscription = %self.name,
                                    client_handle = value.client_handle,
                                    "Notification for unknown item dropped"
                                );
                                return None;
                            };
                            Some(ItemNotification {
                                item_id: entry.spec.item_id.clone(),
                                field_name: entry.field_name().to_string(),
                                value: value.value,
                                status: value.status,
                                source_timestamp: value.source_timestamp,
                                server_timestamp: value.server_timestamp,
                            })
                        })
                        .collect()
                };
                if items.is_empty() {
                    return;
                }
                self.listener
                    .on_notification(self.batch(sequence, NotificationKind::DataChange, items))
                    .await;
            }
            DeviceNotification::Event {
                sequence,
                client_handle,
                fields,
            } => {
                let item_id = {
                    let table = self.items.lock();
                    table
                        .by_handle(client_handle)
                        .map(|entry| entry.spec.item_id.clone())
                };
                let Some(item_id) = item_id else {
                    tracing::debug!(
                        subscription = %self.name,
                        client_handle,
                        "Event for unknown item dropped"
                    );
                    return;
                };
                let now = Utc::now();
                let items = fields
                    .into_iter()
                    .map(|(field, value)| ItemNotification {
                        item_id: item_id.clone(),
                        field_name: field,
                        value,
                        status: crate::message::StatusCode::GOOD,
                        source_timestamp: None,
                        server_timestamp: Some(now),
                    })
                    .collect();
                self.listener
                    .on_notification(self.batch(sequence, NotificationKind::Event, items))
                    .await;
            }
            DeviceNotification::ItemStatus {
                client_handle,
                status,
                message,
            } => {
                let change = {
                    let mut table = self.items.lock();
                    let Some(entry) = table
                        .entries
                        .iter_mut()
                        .find(|entry| entry.client_handle == client_handle)
                    else {
                        return;
                    };
                    let state = if status.is_bad() {
                        let text = message.unwrap_or_else(|| format!("status {status}"));
                        entry.last_error = Some(text.clone());
                        ItemState::Error { message: text }
                    } else {
                        entry.last_error = None;
                        ItemState::Good
                    };
                    ItemStatusChange {
                        subscription: self.name.clone(),
                        item_id: entry.spec.item_id.clone(),
                        is_event: entry.spec.kind.is_event(),
                        state,
                    }
                };
                self.listener.on_item_status(change).await;
            }
        }
    }

    fn batch(
        &self,
        sequence: u32,
        kind: NotificationKind,
        items: Vec<ItemNotification>,
    ) -> NotificationBatch {
        NotificationBatch {
            subscription: self.name.clone(),
            endpoint_url: self.session.endpoint().url.clone(),
            sequence,
            kind,
            items,
            received_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointDescriptor;
    use crate::message::{DataValue, StatusCode};
    use crate::session::{SessionPool, SessionPoolConfig};
    use crate::testing::{MockTransport, RecordingReporter};
    use crate::transport::DeviceValue;

    #[derive(Default)]
    struct RecordingListener {
        batches: parking_lot::Mutex<Vec<NotificationBatch>>,
        items: parking_lot::Mutex<Vec<ItemStatusChange>>,
        statuses: parking_lot::Mutex<Vec<SubscriptionStatus>>,
        delivered: tokio::sync::Notify,
    }

    impl RecordingListener {
        fn statuses(&self) -> Vec<SubscriptionStatus> {
            self.statuses.lock().clone()
        }
    }

    #[async_trait]
    impl SubscriptionListener for RecordingListener {
        async fn on_notification(&self, batch: NotificationBatch) {
            self.batches.lock().push(batch);
            self.delivered.notify_one();
        }

        async fn on_item_status(&self, change: ItemStatusChange) {
            self.items.lock().push(change);
        }

        async fn on_status_change(&self, _subscription: &str, status: SubscriptionStatus) {
            self.statuses.lock().push(status);
            self.delivered.notify_one();
        }
    }

    struct Fixture {
        pool: SessionPool,
        transport: Arc<MockTransport>,
        client: SubscriptionClient,
        session: Arc<Session>,
    }

    async fn fixture() -> Fixture {
        let transport = Arc::new(MockTransport::default());
        let pool = SessionPool::new(
            SessionPoolConfig {
                initial_backoff: Duration::from_millis(5),
                ..SessionPoolConfig::default()
            },
            transport.clone(),
            Arc::new(RecordingReporter::default()),
        )
        .unwrap();
        let session = pool
            .acquire(
                &EndpointDescriptor::new("opc.tcp://plc-1:4840"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let client = SubscriptionClient::new(SubscriptionClientConfig::default(), transport.clone());
        Fixture {
            pool,
            transport,
            client,
            session,
        }
    }

    fn temperature_spec() -> SubscriptionSpec {
        SubscriptionSpec::new("temps")
            .with_item(MonitoredItemSpec::variable("ns=2;s=T1").with_field_name("T1"))
            .with_item(MonitoredItemSpec::variable("ns=2;s=T2"))
    }

    async fn wait_for(listener: &RecordingListener, predicate: impl Fn(&RecordingListener) -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !predicate(listener) {
                listener.delivered.notified().await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn duplicate_name_conflicts_and_leaves_first_untouched() {
        let f = fixture().await;
        let listener = Arc::new(RecordingListener::default());

        let first = f
            .client
            .create_subscription(&f.session, temperature_spec(), listener.clone())
            .await
            .unwrap();
        let err = f
            .client
            .create_subscription(&f.session, temperature_spec(), listener.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::SubscriptionAlreadyExists { ref name, .. } if name == "temps"));
        assert_eq!(first.status(), SubscriptionStatus::Active);
        assert_eq!(first.monitored_items().len(), 2);
        assert_eq!(f.client.total_subscription_count(), 1);
        assert_eq!(f.transport.server_subscription_count(), 1);
        assert!(f.client.find(&f.session, "temps").is_some());
    }

    #[tokio::test]
    async fn same_name_on_different_sessions_is_allowed() {
        let f = fixture().await;
        let other = f
            .pool
            .acquire(
                &EndpointDescriptor::new("opc.tcp://plc-2:4840"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let listener = Arc::new(RecordingListener::default());

        f.client
            .create_subscription(&f.session, temperature_spec(), listener.clone())
            .await
            .unwrap();
        f.client
            .create_subscription(&other, temperature_spec(), listener)
            .await
            .unwrap();

        assert_eq!(f.client.total_subscription_count(), 2);
        assert_eq!(f.client.session_subscription_count(&f.session), 1);
    }

    #[tokio::test]
    async fn notifications_are_delivered_in_device_order() {
        let f = fixture().await;
        let listener = Arc::new(RecordingListener::default());
        let handle = f
            .client
            .create_subscription(&f.session, temperature_spec(), listener.clone())
            .await
            .unwrap();
        let t1 = handle.monitored_items()[0].client_handle;
        let notifier = f
            .transport
            .notifier(f.transport.latest_subscription().unwrap())
            .unwrap();

        for sequence in 1..=5u32 {
            notifier
                .send(DeviceNotification::DataChange {
                    sequence,
                    values: vec![DeviceValue {
                        client_handle: t1,
                        value: DataValue::Double(f64::from(sequence)),
                        status: StatusCode::GOOD,
                        source_timestamp: None,
                        server_timestamp: None,
                    }],
                })
                .await
                .unwrap();
        }

        wait_for(&listener, |l| l.batches.lock().len() == 5).await;
        let sequences: Vec<u32> = listener.batches.lock().iter().map(|b| b.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
        let first = &listener.batches.lock()[0];
        assert_eq!(first.items[0].field_name, "T1");
        assert_eq!(first.endpoint_url, "opc.tcp://plc-1:4840");
    }

    #[tokio::test]
    async fn failing_item_is_isolated() {
        let f = fixture().await;
        f.transport.fail_item("ns=2;s=T2");
        let listener = Arc::new(RecordingListener::default());

        let handle = f
            .client
            .create_subscription(&f.session, temperature_spec(), listener.clone())
            .await
            .unwrap();

        assert_eq!(handle.status(), SubscriptionStatus::Active);
        let items = handle.monitored_items();
        assert!(items[0].server_id.is_some());
        assert!(items[1].server_id.is_none());
        assert!(items[1].last_error.as_deref().unwrap().contains("BadNodeIdUnknown"));

        let changes = listener.items.lock().clone();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].state, ItemState::Good);
        assert!(matches!(changes[1].state, ItemState::Error { .. }));
    }

    #[tokio::test]
    async fn add_and_remove_items_are_idempotent() {
        let f = fixture().await;
        let listener = Arc::new(RecordingListener::default());
        let handle = f
            .client
            .create_subscription(&f.session, temperature_spec(), listener)
            .await
            .unwrap();

        let added = handle
            .add_monitored_items(vec![
                MonitoredItemSpec::variable("ns=2;s=T1"),
                MonitoredItemSpec::variable("ns=2;s=P1"),
                MonitoredItemSpec::variable("ns=2;s=P1"),
            ])
            .await
            .unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].item_id, "ns=2;s=P1");
        assert_eq!(handle.monitored_items().len(), 3);
        assert_eq!(f.transport.created_items().len(), 3);

        let removed = handle
            .remove_monitored_items(&["ns=2;s=P1", "ns=2;s=missing"])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(f.transport.deleted_items().len(), 1);

        let removed_again = handle.remove_monitored_items(&["ns=2;s=P1"]).await.unwrap();
        assert_eq!(removed_again, 0);
        assert_eq!(handle.monitored_items().len(), 2);
    }

    #[tokio::test]
    async fn failed_item_creation_leaves_items_retryable() {
        let f = fixture().await;
        let listener = Arc::new(RecordingListener::default());
        let handle = f
            .client
            .create_subscription(&f.session, temperature_spec(), listener)
            .await
            .unwrap();

        f.transport
            .fail_next_item_creation(CoreError::Transient("link hiccup".into()));
        let err = handle
            .add_monitored_items(vec![MonitoredItemSpec::variable("ns=2;s=P1")])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Transient(_)));
        assert_eq!(handle.monitored_items().len(), 2);

        let added = handle
            .add_monitored_items(vec![MonitoredItemSpec::variable("ns=2;s=P1")])
            .await
            .unwrap();
        assert_eq!(added.len(), 1);
        assert!(added[0].server_id.is_some());
        assert_eq!(handle.monitored_items().len(), 3);
    }

    #[tokio::test]
    async fn failed_item_creation_deletes_device_subscription() {
        let f = fixture().await;
        f.transport
            .fail_next_item_creation(CoreError::Protocol("garbled response".into()));

        let err = f
            .client
            .create_subscription(
                &f.session,
                temperature_spec(),
                Arc::new(RecordingListener::default()),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::Protocol(_)));
        assert_eq!(f.transport.server_subscription_count(), 0);
        assert_eq!(f.client.total_subscription_count(), 0);
        assert!(f.client.find(&f.session, "temps").is_none());

        f.client
            .create_subscription(
                &f.session,
                temperature_spec(),
                Arc::new(RecordingListener::default()),
            )
            .await
            .unwrap();
        assert_eq!(f.transport.server_subscription_count(), 1);
    }

    #[tokio::test]
    async fn quiet_subscription_survives_past_session_timeout() {
        let transport = Arc::new(MockTransport::default());
        let pool = SessionPool::new(
            SessionPoolConfig {
                min_session_timeout: Duration::from_millis(50),
                default_session_timeout: Duration::from_millis(50),
                sweep_interval: Duration::from_millis(10),
                keep_alive_interval: Duration::from_millis(10),
                ..SessionPoolConfig::default()
            },
            transport.clone(),
            Arc::new(RecordingReporter::default()),
        )
        .unwrap();
        pool.start();
        let session = pool
            .acquire(
                &EndpointDescriptor::new("opc.tcp://plc-1:4840"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let client = SubscriptionClient::new(SubscriptionClientConfig::default(), transport.clone());
        let listener = Arc::new(RecordingListener::default());
        let handle = client
            .create_subscription(
                &session,
                SubscriptionSpec::new("quiet").with_item(MonitoredItemSpec::variable("ns=2;s=T1")),
                listener.clone(),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!session.is_closed());
        assert_eq!(handle.status(), SubscriptionStatus::Active);
        assert_eq!(listener.statuses(), vec![SubscriptionStatus::Active]);
        assert_eq!(client.total_subscription_count(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn closed_resolves_when_session_detaches() {
        let f = fixture().await;
        let handle = f
            .client
            .create_subscription(
                &f.session,
                temperature_spec(),
                Arc::new(RecordingListener::default()),
            )
            .await
            .unwrap();

        f.pool.release(&f.session).await;
        tokio::time::timeout(Duration::from_secs(2), handle.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn close_frees_name_and_gauge() {
        let f = fixture().await;
        let listener = Arc::new(RecordingListener::default());
        let handle = f
            .client
            .create_subscription(&f.session, temperature_spec(), listener.clone())
            .await
            .unwrap();

        handle.close().await.unwrap();

        assert_eq!(handle.status(), SubscriptionStatus::Closed);
        assert_eq!(f.client.total_subscription_count(), 0);
        assert_eq!(f.transport.server_subscription_count(), 0);
        assert!(matches!(
            handle.add_monitored_items(vec![MonitoredItemSpec::variable("x")]).await,
            Err(CoreError::Closed(_))
        ));
        f.client
            .create_subscription(&f.session, temperature_spec(), listener)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn session_detach_fails_in_flight_creation() {
        let f = fixture().await;
        f.transport.hold_subscriptions();

        let client = f.client.clone();
        let session = f.session.clone();
        let pending = tokio::spawn(async move {
            client
                .create_subscription(
                    &session,
                    temperature_spec(),
                    Arc::new(RecordingListener::default()),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        f.pool.release(&f.session).await;

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(CoreError::SessionClosed(_))));
        assert_eq!(f.client.total_subscription_count(), 0);
        assert!(f.client.find(&f.session, "temps").is_none());
        f.transport.release_subscriptions();
    }

    #[tokio::test]
    async fn session_detach_closes_subscriptions_once() {
        let f = fixture().await;
        let listener = Arc::new(RecordingListener::default());
        let handle = f
            .client
            .create_subscription(&f.session, temperature_spec(), listener.clone())
            .await
            .unwrap();

        f.pool.release(&f.session).await;
        wait_for(&listener, |l| l.statuses().contains(&SubscriptionStatus::Closed)).await;

        assert_eq!(handle.status(), SubscriptionStatus::Closed);
        assert_eq!(
            listener.statuses(),
            vec![SubscriptionStatus::Active, SubscriptionStatus::Closed]
        );
        assert_eq!(f.client.total_subscription_count(), 0);
        assert!(matches!(
            handle.remove_monitored_items(&["ns=2;s=T1"]).await,
            Err(CoreError::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn reconnect_notifies_once_and_recreates() {
        let transport = Arc::new(MockTransport::default());
        let pool = SessionPool::new(
            SessionPoolConfig {
                initial_backoff: Duration::from_millis(5),
                keep_alive_interval: Duration::from_millis(10),
                ..SessionPoolConfig::default()
            },
            transport.clone(),
            Arc::new(RecordingReporter::default()),
        )
        .unwrap();
        let session = pool
            .acquire(
                &EndpointDescriptor::new("opc.tcp://plc-1:4840"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let client = SubscriptionClient::new(SubscriptionClientConfig::default(), transport.clone());
        let listener = Arc::new(RecordingListener::default());
        let handle = client
            .create_subscription(&session, temperature_spec(), listener.clone())
            .await
            .unwrap();
        let first_server_id = transport.latest_subscription().unwrap();

        transport.fail_next_keep_alive(CoreError::Transient("link down".into()));
        pool.start();

        wait_for(&listener, |l| {
            l.statuses().ends_with(&[SubscriptionStatus::Disconnected, SubscriptionStatus::Active])
        })
        .await;

        assert_eq!(
            listener.statuses(),
            vec![
                SubscriptionStatus::Active,
                SubscriptionStatus::Disconnected,
                SubscriptionStatus::Active
            ]
        );
        assert_eq!(handle.status(), SubscriptionStatus::Active);
        assert!(transport.latest_subscription().unwrap() > first_server_id);
        assert_eq!(transport.created_items().len(), 4);
        pool.shutdown().await;
    }
}
