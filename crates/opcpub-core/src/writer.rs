//! Dataset writer.
//!
//! Turns the notification batches of one subscription into sequenced
//! [`DataSetWriterMessage`]s and hands them to a writer group queue.
//!
//! A dataset carries each field at most once. A batch that repeats a field
//! (several queued values of one item) is emitted as consecutive messages,
//! each holding a run of distinct fields. Key frames carry the last known
//! value of every field, not only the fields of the triggering batch.

use crate::message::{
    DataSetMessageKind, DataSetMessageQueue, DataSetWriterMessage, ItemNotification,
    NotificationBatch, NotificationKind,
};
use crate::state::{ItemState, SequenceGap, StateReporter, WriterState, WriterStatus};
use crate::subscription::{ItemStatusChange, SubscriptionListener, SubscriptionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Dataset writer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DataSetWriterConfig {
    /// Writer id within its group
    pub writer_id: u16,
    /// Writer name
    pub name: String,
    /// Dataset name
    pub dataset_name: String,
    /// First sequence number
    #[serde(default)]
    pub sequence_origin: u64,
    /// Application URI of the source, if known
    #[serde(default)]
    pub application_uri: Option<String>,
}

impl DataSetWriterConfig {
    /// Config with origin 0.
    #[must_use]
    pub fn new(writer_id: u16, name: impl Into<String>, dataset_name: impl Into<String>) -> Self {
        Self {
            writer_id,
            name: name.into(),
            dataset_name: dataset_name.into(),
            sequence_origin: 0,
            application_uri: None,
        }
    }
}

#[derive(Debug)]
struct Progress {
    next_sequence: u64,
    last_emitted: Option<u64>,
    key_frame_due: bool,
    disconnected_at: Option<DateTime<Utc>>,
    state: WriterState,
    items: HashMap<String, ItemState>,
    /// Last data change value per field, in first-seen order
    last_values: Vec<ItemNotification>,
}

impl Progress {
    fn remember(&mut self, run: &[ItemNotification]) {
        for item in run {
            match self
                .last_values
                .iter_mut()
                .find(|known| known.field_name == item.field_name)
            {
                Some(known) => *known = item.clone(),
                None => self.last_values.push(item.clone()),
            }
        }
    }
}

/// Split `items` into consecutive runs in which no field name repeats.
fn distinct_field_runs(items: Vec<ItemNotification>) -> Vec<Vec<ItemNotification>> {
    let mut runs = Vec::new();
    let mut current: Vec<ItemNotification> = Vec::new();
    let mut names: HashSet<String> = HashSet::new();
    for item in items {
        if !names.insert(item.field_name.clone()) {
            runs.push(std::mem::take(&mut current));
            names.clear();
            names.insert(item.field_name.clone());
        }
        current.push(item);
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

/// Produces writer messages from one subscription.
pub struct DataSetWriter {
    config: DataSetWriterConfig,
    queue: Arc<dyn DataSetMessageQueue>,
    reporter: Arc<dyn StateReporter>,
    cancel: CancellationToken,
    progress: Mutex<Progress>,
    emit: tokio::sync::Mutex<()>,
}

impl DataSetWriter {
    /// Create a writer in `Pending` state.
    pub fn new(
        config: DataSetWriterConfig,
        queue: Arc<dyn DataSetMessageQueue>,
        reporter: Arc<dyn StateReporter>,
    ) -> Self {
        let progress = Progress {
            next_sequence: config.sequence_origin,
            last_emitted: None,
            key_frame_due: true,
            disconnected_at: None,
            state: WriterState::new(WriterStatus::Pending),
            items: HashMap::new(),
            last_values: Vec::new(),
        };
        Self {
            config,
            queue,
            reporter,
            cancel: CancellationToken::new(),
            progress: Mutex::new(progress),
            emit: tokio::sync::Mutex::new(()),
        }
    }

    /// Writer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Sequence number the next emitted message will carry.
    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.progress.lock().next_sequence
    }

    /// Current writer state.
    #[must_use]
    pub fn state(&self) -> WriterState {
        self.progress.lock().state.clone()
    }

    /// Abort any enqueue that is waiting on backpressure.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn set_state(&self, next: WriterState) {
        {
            let mut progress = self.progress.lock();
            if progress.state == next {
                return;
            }
            progress.state = next.clone();
        }
        tracing::debug!(
            writer = %self.config.name,
            status = ?next.status,
            gap = next.gap.is_some(),
            "Writer state changed"
        );
        self.reporter
            .on_writer_state_change(&self.config.name, &next)
            .await;
    }

    async fn emit(&self, batch: NotificationBatch) {
        let _serial = self.emit.lock().await;
        let NotificationBatch {
            kind,
            items,
            endpoint_url,
            ..
        } = batch;
        for run in distinct_field_runs(items) {
            if !self.emit_run(kind, run, &endpoint_url).await {
                break;
            }
        }
    }

    /// Enqueue one message. Returns `false` if the queue rejected it.
    async fn emit_run(
        &self,
        kind: NotificationKind,
        run: Vec<ItemNotification>,
        endpoint_url: &str,
    ) -> bool {
        let message = {
            let mut progress = self.progress.lock();
            if kind == NotificationKind::DataChange {
                progress.remember(&run);
            }
            let (kind, notifications) = match kind {
                NotificationKind::Event => (DataSetMessageKind::Event, run),
                NotificationKind::DataChange if progress.key_frame_due => {
                    (DataSetMessageKind::KeyFrame, progress.last_values.clone())
                }
                NotificationKind::DataChange => (DataSetMessageKind::DeltaFrame, run),
            };
            DataSetWriterMessage {
                sequence_number: progress.next_sequence,
                writer_id: self.config.writer_id,
                writer_name: self.config.name.clone(),
                dataset_name: self.config.dataset_name.clone(),
                kind,
                timestamp: Utc::now(),
                notifications,
                endpoint_url: endpoint_url.to_string(),
                application_uri: self.config.application_uri.clone(),
            }
        };
        let sequence = message.sequence_number;
        let kind = message.kind;

        match self.queue.enqueue(message, &self.cancel).await {
            Ok(()) => {
                let publishing = {
                    let mut progress = self.progress.lock();
                    progress.last_emitted = Some(sequence);
                    progress.next_sequence = sequence + 1;
                    if kind != DataSetMessageKind::Event {
                        progress.key_frame_due = false;
                    }
                    progress.state.status == WriterStatus::Publishing
                };
                if !publishing {
                    self.set_state(WriterState::new(WriterStatus::Publishing))
                        .await;
                }
                true
            }
            Err(err) => {
                tracing::warn!(
                    writer = %self.config.name,
                    sequence,
                    error = %err,
                    "Writer message not enqueued"
                );
                self.set_state(WriterState {
                    status: WriterStatus::Error,
                    last_error: Some(err.to_string()),
                    gap: None,
                })
                .await;
                false
            }
        }
    }
}

#[async_trait]
impl SubscriptionListener for DataSetWriter {
    async fn on_notification(&self, batch: NotificationBatch) {
        if batch.items.is_empty() {
            return;
        }
        self.emit(batch).await;
    }

    async fn on_item_status(&self, change: ItemStatusChange) {
        {
            let mut progress = self.progress.lock();
            let unchanged = progress.items.get(&change.item_id) == Some(&change.state);
            if unchanged {
                return;
            }
            if change.state == ItemState::Removed {
                progress.items.remove(&change.item_id);
                progress
                    .last_values
                    .retain(|known| known.item_id != change.item_id);
            } else {
                progress
                    .items
                    .insert(change.item_id.clone(), change.state.clone());
            }
        }

        if change.is_event {
            self.reporter
                .on_event_field_state_change(&self.config.name, &change.item_id, &change.state)
                .await;
        } else {
            self.reporter
                .on_variable_state_change(&self.config.name, &change.item_id, &change.state)
                .await;
        }
    }

    async fn on_status_change(&self, subscription: &str, status: SubscriptionStatus) {
        match status {
            SubscriptionStatus::Creating => {}
            SubscriptionStatus::Active => {
                let gap = {
                    let mut progress = self.progress.lock();
                    progress
                        .disconnected_at
                        .take()
                        .map(|disconnected_at| SequenceGap {
                            last_sequence: progress.last_emitted,
                            disconnected_at,
                            resumed_at: Utc::now(),
                        })
                };
                if let Some(gap) = gap {
                    tracing::info!(
                        writer = %self.config.name,
                        subscription,
                        last_sequence = ?gap.last_sequence,
                        "Writer resumed after reconnect"
                    );
                    self.set_state(WriterState {
                        status: WriterStatus::Publishing,
                        last_error: None,
                        gap: Some(gap),
                    })
                    .await;
                }
            }
            SubscriptionStatus::Disconnected => {
                {
                    let mut progress = self.progress.lock();
                    progress.disconnected_at.get_or_insert_with(Utc::now);
                    progress.key_frame_due = true;
                }
                self.set_state(WriterState::new(WriterStatus::Disconnected))
                    .await;
            }
            SubscriptionStatus::Closed => {
                self.set_state(WriterState {
                    status: WriterStatus::Disconnected,
                    last_error: Some(format!("subscription {subscription} closed")),
                    gap: None,
                })
                .await;
            }
            SubscriptionStatus::Error => {
                self.set_state(WriterState {
                    status: WriterStatus::Error,
                    last_error: Some(format!("subscription {subscription} failed")),
                    gap: None,
                })
                .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DataValue, ItemNotification, StatusCode};
    use crate::testing::{CollectingQueue, RecordingReporter, Report};

    fn batch(sequence: u32, kind: NotificationKind) -> NotificationBatch {
        NotificationBatch {
            subscription: "temps".into(),
            endpoint_url: "opc.tcp://plc-1:4840".into(),
            sequence,
            kind,
            items: vec![ItemNotification {
                item_id: "ns=2;s=T1".into(),
                field_name: "T1".into(),
                value: DataValue::Double(21.5),
                status: StatusCode::GOOD,
                source_timestamp: None,
                server_timestamp: None,
            }],
            received_at: Utc::now(),
        }
    }

    fn value(field: &str, value: f64) -> ItemNotification {
        ItemNotification {
            item_id: format!("ns=2;s={field}"),
            field_name: field.into(),
            value: DataValue::Double(value),
            status: StatusCode::GOOD,
            source_timestamp: None,
            server_timestamp: None,
        }
    }

    fn data_change(items: Vec<ItemNotification>) -> NotificationBatch {
        NotificationBatch {
            items,
            ..batch(1, NotificationKind::DataChange)
        }
    }

    fn fields(message: &DataSetWriterMessage) -> Vec<(&str, &DataValue)> {
        message
            .notifications
            .iter()
            .map(|n| (n.field_name.as_str(), &n.value))
            .collect()
    }

    fn writer(
        origin: u64,
    ) -> (DataSetWriter, Arc<CollectingQueue>, Arc<RecordingReporter>) {
        let queue = Arc::new(CollectingQueue::default());
        let reporter = Arc::new(RecordingReporter::default());
        let config = DataSetWriterConfig {
            sequence_origin: origin,
            ..DataSetWriterConfig::new(7, "line-1", "temperatures")
        };
        (
            DataSetWriter::new(config, queue.clone(), reporter.clone()),
            queue,
            reporter,
        )
    }

    #[tokio::test]
    async fn sequence_numbers_increase_by_one_from_origin() {
        let (writer, queue, _) = writer(100);

        for sequence in 0..5 {
            writer
                .on_notification(batch(sequence, NotificationKind::DataChange))
                .await;
        }

        let sequences: Vec<u64> = queue.messages().iter().map(|m| m.sequence_number).collect();
        assert_eq!(sequences, vec![100, 101, 102, 103, 104]);
        assert_eq!(writer.next_sequence(), 105);
        let kinds: Vec<DataSetMessageKind> = queue.messages().iter().map(|m| m.kind).collect();
        assert_eq!(kinds[0], DataSetMessageKind::KeyFrame);
        assert!(kinds[1..].iter().all(|k| *k == DataSetMessageKind::DeltaFrame));
        assert_eq!(queue.messages()[0].writer_id, 7);
    }

    #[tokio::test]
    async fn reconnect_reports_exactly_one_gap() {
        let (writer, queue, reporter) = writer(0);

        writer.on_status_change("temps", SubscriptionStatus::Active).await;
        writer
            .on_notification(batch(1, NotificationKind::DataChange))
            .await;
        writer
            .on_status_change("temps", SubscriptionStatus::Disconnected)
            .await;
        writer
            .on_status_change("temps", SubscriptionStatus::Disconnected)
            .await;
        writer.on_status_change("temps", SubscriptionStatus::Active).await;
        writer
            .on_notification(batch(1, NotificationKind::DataChange))
            .await;
        writer
            .on_notification(batch(2, NotificationKind::DataChange))
            .await;

        let states = reporter.writer_states();
        let statuses: Vec<WriterStatus> = states.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![
                WriterStatus::Publishing,
                WriterStatus::Disconnected,
                WriterStatus::Publishing
            ]
        );
        let gaps: Vec<&SequenceGap> = states.iter().filter_map(|s| s.gap.as_ref()).collect();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].last_sequence, Some(0));

        let messages = queue.messages();
        let sequences: Vec<u64> = messages.iter().map(|m| m.sequence_number).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(messages[1].kind, DataSetMessageKind::KeyFrame);
        assert_eq!(messages[2].kind, DataSetMessageKind::DeltaFrame);
    }

    #[tokio::test]
    async fn item_states_are_level_triggered_and_classified() {
        let (writer, _, reporter) = writer(0);
        let change = |item: &str, is_event: bool, state: ItemState| ItemStatusChange {
            subscription: "temps".into(),
            item_id: item.into(),
            is_event,
            state,
        };

        writer.on_item_status(change("T1", false, ItemState::Good)).await;
        writer.on_item_status(change("T1", false, ItemState::Good)).await;
        writer
            .on_item_status(change(
                "Alarms",
                true,
                ItemState::Error {
                    message: "BadNodeIdUnknown".into(),
                },
            ))
            .await;
        writer.on_item_status(change("T1", false, ItemState::Removed)).await;

        let reports = reporter.reports();
        assert_eq!(reports.len(), 3);
        assert!(matches!(&reports[0], Report::Variable(w, item, ItemState::Good) if w == "line-1" && item == "T1"));
        assert!(matches!(&reports[1], Report::EventField(_, item, ItemState::Error { .. }) if item == "Alarms"));
        assert!(matches!(&reports[2], Report::Variable(_, _, ItemState::Removed)));
    }

    #[tokio::test]
    async fn failed_enqueue_keeps_sequence_and_reports_error_once() {
        let (writer, queue, reporter) = writer(10);
        queue.close();

        writer
            .on_notification(batch(1, NotificationKind::DataChange))
            .await;
        writer
            .on_notification(batch(2, NotificationKind::DataChange))
            .await;

        assert!(queue.messages().is_empty());
        assert_eq!(writer.next_sequence(), 10);
        let states = reporter.writer_states();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].status, WriterStatus::Error);
    }

    #[tokio::test]
    async fn events_do_not_consume_key_frame() {
        let (writer, queue, _) = writer(0);

        writer.on_notification(batch(1, NotificationKind::Event)).await;
        writer
            .on_notification(batch(2, NotificationKind::DataChange))
            .await;

        let kinds: Vec<DataSetMessageKind> = queue.messages().iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![DataSetMessageKind::Event, DataSetMessageKind::KeyFrame]
        );
    }

    #[tokio::test]
    async fn repeated_fields_are_split_into_consecutive_messages() {
        let (writer, queue, _) = writer(0);

        writer
            .on_notification(data_change(vec![
                value("T1", 1.0),
                value("T2", 5.0),
                value("T1", 2.0),
                value("T1", 3.0),
            ]))
            .await;

        let messages = queue.messages();
        assert_eq!(messages.len(), 3);
        let sequences: Vec<u64> = messages.iter().map(|m| m.sequence_number).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(messages[0].kind, DataSetMessageKind::KeyFrame);
        assert_eq!(
            fields(&messages[0]),
            vec![("T1", &DataValue::Double(1.0)), ("T2", &DataValue::Double(5.0))]
        );
        assert_eq!(messages[1].kind, DataSetMessageKind::DeltaFrame);
        assert_eq!(fields(&messages[1]), vec![("T1", &DataValue::Double(2.0))]);
        assert_eq!(fields(&messages[2]), vec![("T1", &DataValue::Double(3.0))]);
    }

    #[tokio::test]
    async fn key_frame_after_reconnect_carries_every_known_field() {
        let (writer, queue, _) = writer(0);

        writer.on_status_change("temps", SubscriptionStatus::Active).await;
        writer
            .on_notification(data_change(vec![value("T1", 20.0)]))
            .await;
        writer
            .on_notification(data_change(vec![value("T2", 30.0)]))
            .await;
        writer
            .on_status_change("temps", SubscriptionStatus::Disconnected)
            .await;
        writer.on_status_change("temps", SubscriptionStatus::Active).await;
        writer
            .on_notification(data_change(vec![value("T2", 31.0)]))
            .await;

        let messages = queue.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].kind, DataSetMessageKind::DeltaFrame);
        assert_eq!(fields(&messages[1]), vec![("T2", &DataValue::Double(30.0))]);
        assert_eq!(messages[2].kind, DataSetMessageKind::KeyFrame);
        assert_eq!(
            fields(&messages[2]),
            vec![
                ("T1", &DataValue::Double(20.0)),
                ("T2", &DataValue::Double(31.0))
            ]
        );
    }

    #[tokio::test]
    async fn removed_items_leave_key_frames() {
        let (writer, queue, _) = writer(0);

        writer
            .on_notification(data_change(vec![value("T1", 20.0), value("T2", 30.0)]))
            .await;
        writer
            .on_item_status(ItemStatusChange {
                subscription: "temps".into(),
                item_id: "ns=2;s=T1".into(),
                is_event: false,
                state: ItemState::Removed,
            })
            .await;
        writer
            .on_status_change("temps", SubscriptionStatus::Disconnected)
            .await;
        writer
            .on_notification(data_change(vec![value("T2", 31.0)]))
            .await;

        let messages = queue.messages();
        assert_eq!(messages[1].kind, DataSetMessageKind::KeyFrame);
        assert_eq!(fields(&messages[1]), vec![("T2", &DataValue::Double(31.0))]);
    }
}
