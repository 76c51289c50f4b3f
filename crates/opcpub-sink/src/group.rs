//! Writer group: bounded queue plus time/size micro-batching.
//!
//! Producers call [`WriterGroupHandle::enqueue`], which waits while the queue
//! is full. The flush loop drains the queue and emits a batch when
//! `batch_size` messages are buffered or the batching interval ticks,
//! whichever comes first.

use crate::error::SinkError;
use crate::sink::{MessageSink, OutboundMessage};
use async_trait::async_trait;
use opcpub_core::{CoreError, CoreResult, DataSetMessageQueue, DataSetWriterMessage};
use opcpub_proto::{
    ContentMask, EncoderSettings, FieldOrdering, MessageEncoding, NetworkMessageEncoder,
    SplitPolicy,
};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Writer group configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WriterGroupConfig {
    /// Group id, also used in topics
    pub group_id: String,
    /// Publisher id written into every network message
    pub publisher_id: String,
    /// Payload encoding
    pub encoding: MessageEncoding,
    /// Content mask
    pub content_mask: ContentMask,
    /// Upper bound for one encoded network message in bytes
    pub max_network_message_size: usize,
    /// Datasets that trigger an immediate flush
    pub batch_size: usize,
    /// Maximum time a dataset waits before being flushed
    #[serde(with = "opcpub_core::duration_millis")]
    pub batching_interval: Duration,
    /// Delay of the first interval flush
    #[serde(with = "opcpub_core::duration_millis")]
    pub publishing_offset: Duration,
    /// Field ordering
    pub field_ordering: FieldOrdering,
    /// Oversize dataset handling
    pub split_policy: SplitPolicy,
    /// Inbound queue capacity
    pub queue_capacity: usize,
    /// Give up waiting for queue space after this long
    #[serde(with = "opcpub_core::duration_millis::option")]
    pub enqueue_timeout: Option<Duration>,
}

impl Default for WriterGroupConfig {
    fn default() -> Self {
        Self {
            group_id: "default".to_string(),
            publisher_id: "opcpub".to_string(),
            encoding: MessageEncoding::Json,
            content_mask: ContentMask::default(),
            max_network_message_size: 256 * 1024,
            batch_size: 50,
            batching_interval: Duration::from_millis(500),
            publishing_offset: Duration::ZERO,
            field_ordering: FieldOrdering::Configured,
            split_policy: SplitPolicy::Atomic,
            queue_capacity: 4096,
            enqueue_timeout: None,
        }
    }
}

impl WriterGroupConfig {
    fn validate(&self) -> Result<(), SinkError> {
        if self.batch_size == 0 {
            return Err(SinkError::Config("batch_size must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(SinkError::Config("queue_capacity must be at least 1".into()));
        }
        if self.batching_interval.is_zero() {
            return Err(SinkError::Config("batching_interval must be positive".into()));
        }
        Ok(())
    }

    fn encoder_settings(&self) -> EncoderSettings {
        EncoderSettings {
            publisher_id: self.publisher_id.clone(),
            group_id: self.group_id.clone(),
            encoding: self.encoding,
            content_mask: self.content_mask,
            max_network_message_size: self.max_network_message_size,
            field_ordering: self.field_ordering,
            split_policy: self.split_policy,
        }
    }
}

/// Counters of one writer group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterGroupStats {
    /// Datasets accepted into the queue
    pub enqueued: u64,
    /// Datasets handed to the sink inside network messages
    pub flushed: u64,
    /// Network messages published
    pub network_messages: u64,
    /// Datasets dropped for exceeding the message size limit
    pub oversize_drops: u64,
    /// Failed publish or encode attempts
    pub sink_errors: u64,
    /// Datasets currently queued
    pub queued: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    flushed: AtomicU64,
    network_messages: AtomicU64,
    oversize_drops: AtomicU64,
    sink_errors: AtomicU64,
}

struct GroupShared {
    config: WriterGroupConfig,
    sender: mpsc::Sender<DataSetWriterMessage>,
    counters: Counters,
    stop: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// A writer group; inert until [`WriterGroup::start`].
pub struct WriterGroup {
    shared: Arc<GroupShared>,
    receiver: parking_lot::Mutex<Option<mpsc::Receiver<DataSetWriterMessage>>>,
    encoder: NetworkMessageEncoder,
    sink: Arc<dyn MessageSink>,
}

impl WriterGroup {
    /// Create a writer group.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Config`] for zero sizes and [`SinkError::Encode`]
    /// if the size limit cannot hold an empty network message.
    pub fn new(config: WriterGroupConfig, sink: Arc<dyn MessageSink>) -> Result<Self, SinkError> {
        config.validate()?;
        let encoder = NetworkMessageEncoder::new(config.encoder_settings())?;
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        Ok(Self {
            shared: Arc::new(GroupShared {
                config,
                sender,
                counters: Counters::default(),
                stop: CancellationToken::new(),
                task: parking_lot::Mutex::new(None),
            }),
            receiver: parking_lot::Mutex::new(Some(receiver)),
            encoder,
            sink,
        })
    }

    /// Handle for producers. Messages enqueued before `start` wait in the queue.
    #[must_use]
    pub fn handle(&self) -> WriterGroupHandle {
        WriterGroupHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Spawn the flush loop. Calling it again is a no-op.
    pub fn start(&self) -> WriterGroupHandle {
        if let Some(receiver) = self.receiver.lock().take() {
            let flusher = Flusher {
                shared: Arc::clone(&self.shared),
                encoder: self.encoder.clone(),
                sink: Arc::clone(&self.sink),
            };
            *self.shared.task.lock() = Some(tokio::spawn(flusher.run(receiver)));
            tracing::info!(
                group_id = %self.shared.config.group_id,
                batch_size = self.shared.config.batch_size,
                interval_ms = u64::try_from(self.shared.config.batching_interval.as_millis())
                    .unwrap_or(u64::MAX),
                "Writer group started"
            );
        }
        self.handle()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> WriterGroupStats {
        self.handle().stats()
    }

    /// Drain, flush and stop.
    pub async fn shutdown(&self) {
        self.handle().shutdown().await;
    }
}

/// Producer side of a writer group.
#[derive(Clone)]
pub struct WriterGroupHandle {
    shared: Arc<GroupShared>,
}

impl WriterGroupHandle {
    /// Group id.
    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.shared.config.group_id
    }

    /// Queue `message`, waiting while the queue is full.
    ///
    /// Fails with `Cancelled` when `cancel` fires, `Timeout` after the
    /// configured enqueue timeout and `Closed` once the group stops. The
    /// message is not queued in any of these cases.
    pub async fn enqueue(
        &self,
        message: DataSetWriterMessage,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        let shared = &self.shared;
        if shared.stop.is_cancelled() {
            return Err(CoreError::Closed("writer group"));
        }

        let reserve = async {
            match shared.config.enqueue_timeout {
                Some(limit) => match tokio::time::timeout(limit, shared.sender.reserve()).await {
                    Ok(permit) => permit.map_err(|_| CoreError::Closed("writer group")),
                    Err(_) => Err(CoreError::Timeout(limit)),
                },
                None => shared
                    .sender
                    .reserve()
                    .await
                    .map_err(|_| CoreError::Closed("writer group")),
            }
        };

        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(CoreError::Cancelled),
            () = shared.stop.cancelled() => Err(CoreError::Closed("writer group")),
            permit = reserve => permit,
        };
        let permit = permit.map_err(|err| {
            tracing::debug!(group_id = %shared.config.group_id, error = %err, "Enqueue abandoned");
            err
        })?;

        permit.send(message);
        shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> WriterGroupStats {
        let counters = &self.shared.counters;
        let queued = self.shared.config.queue_capacity - self.shared.sender.capacity();
        WriterGroupStats {
            enqueued: counters.enqueued.load(Ordering::Relaxed),
            flushed: counters.flushed.load(Ordering::Relaxed),
            network_messages: counters.network_messages.load(Ordering::Relaxed),
            oversize_drops: counters.oversize_drops.load(Ordering::Relaxed),
            sink_errors: counters.sink_errors.load(Ordering::Relaxed),
            queued: queued as u64,
        }
    }

    /// Stop accepting messages, flush everything queued and wait for the loop.
    pub async fn shutdown(&self) {
        self.shared.stop.cancel();
        let task = self.shared.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "Writer group flush loop terminated abnormally");
            }
        }
    }
}

#[async_trait]
impl DataSetMessageQueue for WriterGroupHandle {
    async fn enqueue(
        &self,
        message: DataSetWriterMessage,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        WriterGroupHandle::enqueue(self, message, cancel).await
    }
}

struct Flusher {
    shared: Arc<GroupShared>,
    encoder: NetworkMessageEncoder,
    sink: Arc<dyn MessageSink>,
}

impl Flusher {
    async fn run(self, mut receiver: mpsc::Receiver<DataSetWriterMessage>) {
        let config = &self.shared.config;
        let mut ticker = tokio::time::interval_at(
            Instant::now() + config.publishing_offset,
            config.batching_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut batch = Vec::with_capacity(config.batch_size);

        loop {
            tokio::select! {
                biased;
                () = self.shared.stop.cancelled() => break,
                message = receiver.recv() => {
                    let Some(message) = message else { break };
                    batch.push(message);
                    if batch.len() >= config.batch_size {
                        self.flush(&mut batch).await;
                    }
                }
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
            }
        }

        receiver.close();
        while let Some(message) = receiver.recv().await {
            batch.push(message);
            if batch.len() >= config.batch_size {
                self.flush(&mut batch).await;
            }
        }
        if !batch.is_empty() {
            self.flush(&mut batch).await;
        }
        tracing::info!(group_id = %config.group_id, "Writer group stopped");
    }

    async fn flush(&self, batch: &mut Vec<DataSetWriterMessage>) {
        let counters = &self.shared.counters;
        let group_id = &self.shared.config.group_id;
        let datasets = batch.len();

        let encoded = match self.encoder.encode(batch) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::error!(group_id = %group_id, datasets, error = %err, "Batch encoding failed");
                counters.sink_errors.fetch_add(1, Ordering::Relaxed);
                batch.clear();
                return;
            }
        };
        batch.clear();

        counters
            .oversize_drops
            .fetch_add(encoded.rejected.len() as u64, Ordering::Relaxed);
        let content_type = self.encoder.settings().encoding.content_type();
        let messages = encoded.messages.len();

        for message in encoded.messages {
            let carried = message.dataset_count as u64;
            let outbound = OutboundMessage {
                group_id: group_id.clone(),
                message_id: message.message_id,
                content_type,
                payload: message.payload,
                datasets: message.datasets,
            };
            match self.sink.publish(outbound).await {
                Ok(()) => {
                    counters.network_messages.fetch_add(1, Ordering::Relaxed);
                    counters.flushed.fetch_add(carried, Ordering::Relaxed);
                }
                Err(err) => {
                    counters.sink_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(group_id = %group_id, error = %err, "Network message publish failed");
                }
            }
        }
        tracing::debug!(
            group_id = %group_id,
            datasets,
            messages,
            rejected = encoded.rejected.len(),
            "Batch flushed"
        );
    }
}
