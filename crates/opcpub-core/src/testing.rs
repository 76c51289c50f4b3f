//! In-crate test doubles.

use crate::endpoint::EndpointDescriptor;
use crate::error::{CoreError, CoreResult};
use crate::message::{DataSetMessageQueue, DataSetWriterMessage};
use crate::state::{ConnectionState, ConnectionStatus, ItemState, StateReporter, WriterState};
use crate::transport::{
    ConnectRequest, ConnectResponse, ConnectionId, DeviceNotification, DeviceTransport,
    MonitoredItemRequest, ServerSubscriptionRequest,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub(crate) struct MockTransport {
    next_connection: AtomicU64,
    next_subscription: AtomicU32,
    next_item: AtomicU32,
    connects: AtomicUsize,
    closes: AtomicUsize,
    connect_results: Mutex<VecDeque<CoreResult<()>>>,
    keep_alive_failures: Mutex<VecDeque<CoreError>>,
    revised_timeout: Mutex<Option<Duration>>,
    last_requested_timeout: Mutex<Option<Duration>>,
    subscriptions: Mutex<HashMap<u32, mpsc::Sender<DeviceNotification>>>,
    failing_items: Mutex<HashSet<String>>,
    created_items: Mutex<Vec<MonitoredItemRequest>>,
    item_creation_failures: Mutex<VecDeque<CoreError>>,
    deleted_items: Mutex<Vec<u32>>,
    hold_subscriptions: AtomicBool,
    release_subscriptions: Notify,
    endpoints: Mutex<Vec<EndpointDescriptor>>,
}

impl MockTransport {
    pub(crate) fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn push_connect_result(&self, result: CoreResult<()>) {
        self.connect_results.lock().push_back(result);
    }

    pub(crate) fn fail_next_keep_alive(&self, err: CoreError) {
        self.keep_alive_failures.lock().push_back(err);
    }

    pub(crate) fn set_revised_timeout(&self, timeout: Option<Duration>) {
        *self.revised_timeout.lock() = timeout;
    }

    pub(crate) fn last_requested_timeout(&self) -> Option<Duration> {
        *self.last_requested_timeout.lock()
    }

    pub(crate) fn fail_item(&self, node_id: &str) {
        self.failing_items.lock().insert(node_id.to_string());
    }

    pub(crate) fn fail_next_item_creation(&self, err: CoreError) {
        self.item_creation_failures.lock().push_back(err);
    }

    pub(crate) fn created_items(&self) -> Vec<MonitoredItemRequest> {
        self.created_items.lock().clone()
    }

    pub(crate) fn deleted_items(&self) -> Vec<u32> {
        self.deleted_items.lock().clone()
    }

    pub(crate) fn server_subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub(crate) fn latest_subscription(&self) -> Option<u32> {
        self.subscriptions.lock().keys().max().copied()
    }

    pub(crate) fn notifier(&self, subscription: u32) -> Option<mpsc::Sender<DeviceNotification>> {
        self.subscriptions.lock().get(&subscription).cloned()
    }

    pub(crate) fn hold_subscriptions(&self) {
        self.hold_subscriptions.store(true, Ordering::SeqCst);
    }

    pub(crate) fn release_subscriptions(&self) {
        self.hold_subscriptions.store(false, Ordering::SeqCst);
        self.release_subscriptions.notify_waiters();
    }

    pub(crate) fn set_endpoints(&self, endpoints: Vec<EndpointDescriptor>) {
        *self.endpoints.lock() = endpoints;
    }
}

#[async_trait]
impl DeviceTransport for MockTransport {
    async fn connect(
        &self,
        _endpoint: &EndpointDescriptor,
        request: &ConnectRequest,
    ) -> CoreResult<ConnectResponse> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_requested_timeout.lock() = Some(request.requested_timeout);
        let scripted = self.connect_results.lock().pop_front();
        if let Some(Err(err)) = scripted {
            return Err(err);
        }
        Ok(ConnectResponse {
            connection: ConnectionId(self.next_connection.fetch_add(1, Ordering::SeqCst) + 1),
            revised_timeout: self
                .revised_timeout
                .lock()
                .unwrap_or(request.requested_timeout),
            server_nonce: vec![7; 32],
        })
    }

    async fn keep_alive(&self, _connection: ConnectionId) -> CoreResult<()> {
        match self.keep_alive_failures.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn close(&self, _connection: ConnectionId) -> CoreResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_subscription(
        &self,
        _connection: ConnectionId,
        _request: &ServerSubscriptionRequest,
        notifications: mpsc::Sender<DeviceNotification>,
    ) -> CoreResult<u32> {
        while self.hold_subscriptions.load(Ordering::SeqCst) {
            let released = self.release_subscriptions.notified();
            if !self.hold_subscriptions.load(Ordering::SeqCst) {
                break;
            }
            released.await;
        }
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst) + 1;
        self.subscriptions.lock().insert(id, notifications);
        Ok(id)
    }

    async fn delete_subscription(
        &self,
        _connection: ConnectionId,
        subscription: u32,
    ) -> CoreResult<()> {
        self.subscriptions.lock().remove(&subscription);
        Ok(())
    }

    async fn create_monitored_items(
        &self,
        _connection: ConnectionId,
        _subscription: u32,
        items: &[MonitoredItemRequest],
    ) -> CoreResult<Vec<Result<u32, String>>> {
        if let Some(err) = self.item_creation_failures.lock().pop_front() {
            return Err(err);
        }
        let failing = self.failing_items.lock().clone();
        self.created_items.lock().extend(items.iter().cloned());
        Ok(items
            .iter()
            .map(|item| {
                if failing.contains(&item.node_id) {
                    Err(format!("BadNodeIdUnknown: {}", item.node_id))
                } else {
                    Ok(self.next_item.fetch_add(1, Ordering::SeqCst) + 1)
                }
            })
            .collect())
    }

    async fn delete_monitored_items(
        &self,
        _connection: ConnectionId,
        _subscription: u32,
        items: &[u32],
    ) -> CoreResult<()> {
        self.deleted_items.lock().extend_from_slice(items);
        Ok(())
    }

    async fn find_endpoints(&self, _discovery_url: &str) -> CoreResult<Vec<EndpointDescriptor>> {
        Ok(self.endpoints.lock().clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Report {
    Connection(String, ConnectionState),
    Writer(String, WriterState),
    Variable(String, String, ItemState),
    EventField(String, String, ItemState),
}

#[derive(Default)]
pub(crate) struct RecordingReporter {
    reports: Mutex<Vec<Report>>,
}

impl RecordingReporter {
    pub(crate) fn reports(&self) -> Vec<Report> {
        self.reports.lock().clone()
    }

    pub(crate) fn connection_statuses(&self) -> Vec<ConnectionStatus> {
        self.reports
            .lock()
            .iter()
            .filter_map(|report| match report {
                Report::Connection(_, state) => Some(state.status),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn last_connection_status(&self) -> Option<ConnectionStatus> {
        self.connection_statuses().last().copied()
    }

    pub(crate) fn writer_states(&self) -> Vec<WriterState> {
        self.reports
            .lock()
            .iter()
            .filter_map(|report| match report {
                Report::Writer(_, state) => Some(state.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl StateReporter for RecordingReporter {
    async fn on_connection_state_change(
        &self,
        endpoint: &EndpointDescriptor,
        state: &ConnectionState,
    ) {
        self.reports
            .lock()
            .push(Report::Connection(endpoint.url.clone(), state.clone()));
    }

    async fn on_writer_state_change(&self, writer: &str, state: &WriterState) {
        self.reports
            .lock()
            .push(Report::Writer(writer.to_string(), state.clone()));
    }

    async fn on_variable_state_change(&self, writer: &str, item_id: &str, state: &ItemState) {
        self.reports.lock().push(Report::Variable(
            writer.to_string(),
            item_id.to_string(),
            state.clone(),
        ));
    }

    async fn on_event_field_state_change(&self, writer: &str, item_id: &str, state: &ItemState) {
        self.reports.lock().push(Report::EventField(
            writer.to_string(),
            item_id.to_string(),
            state.clone(),
        ));
    }
}

/// Queue that collects messages in memory.
#[derive(Default)]
pub(crate) struct CollectingQueue {
    messages: Mutex<Vec<DataSetWriterMessage>>,
    closed: AtomicBool,
}

impl CollectingQueue {
    pub(crate) fn messages(&self) -> Vec<DataSetWriterMessage> {
        self.messages.lock().clone()
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataSetMessageQueue for CollectingQueue {
    async fn enqueue(
        &self,
        message: DataSetWriterMessage,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::Closed("writer group"));
        }
        self.messages.lock().push(message);
        Ok(())
    }
}
